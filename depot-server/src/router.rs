//! URL → resource resolution, method → phase mapping, identity extraction,
//! and the CORS surface.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method as HttpMethod, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use depot_core::{Identity, Method, PipelineError, RequestContext, Settings};
use depot_query::{parse_query_string, ParsedQuery};
use depot_security::{verify_master_key, TokenService};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::auth;
use crate::registry::{InternalGateway, ResourceRegistry};
use crate::resource::Target;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ResourceRegistry>,
    pub gateway: Arc<InternalGateway>,
    pub tokens: Arc<TokenService>,
    pub settings: Arc<Settings>,
    pub development: bool,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            HttpMethod::GET,
            HttpMethod::POST,
            HttpMethod::PUT,
            HttpMethod::DELETE,
            HttpMethod::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/auth/login", axum::routing::post(auth::login))
        .route("/auth/logout", axum::routing::post(auth::logout))
        .route("/auth/validate", get(auth::validate))
        .route("/auth/me", get(auth::me))
        .route("/{collection}", get(list).post(create))
        .route("/{collection}/count", get(count))
        .route(
            "/{collection}/{id}",
            get(get_one).put(update).delete(remove),
        )
        .layer(cors)
        .with_state(state)
}

/// Render a pipeline error as its HTTP mapping.
pub fn error_response(err: PipelineError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.body())).into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "collections": state.registry.len(),
    }))
}

/// Extract the caller's identity: a validated master key (header or cookie)
/// elevates to root regardless of any token; otherwise a bearer token's
/// claims are the identity; otherwise anonymous.
pub fn extract_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Identity>, PipelineError> {
    if let Some(presented) = master_key_from(headers) {
        if verify_master_key(&state.settings.master_key, &presented) {
            return Ok(Some(Identity::root()));
        }
        return Err(PipelineError::Unauthorized("invalid master key".into()));
    }

    let Some(token) = bearer_token(headers) else {
        return Ok(None);
    };
    let claims = state
        .tokens
        .validate(&token)
        .map_err(|e| PipelineError::Unauthorized(e.public_message().into()))?;
    Ok(Some(Identity {
        id: claims.sub,
        username: claims.username,
        is_root: claims.is_root,
    }))
}

fn master_key_from(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-master-key").and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name == "master-key").then(|| value.to_string())
    })
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

struct Parsed {
    rc: RequestContext,
    query: depot_query::Query,
}

/// Build the request context: identity, parsed query, method, flags.
fn prepare(
    state: &AppState,
    headers: &HeaderMap,
    raw_query: Option<String>,
    method: Method,
) -> Result<Parsed, PipelineError> {
    let identity = extract_identity(state, headers)?;
    let ParsedQuery {
        query, mut raw, ..
    } = parse_query_string(raw_query.as_deref().unwrap_or(""))
        .map_err(|e| PipelineError::BadRequest(e.to_string()))?;
    // `$skipEvents` stays visible to `RequestContext::skip_events`.
    let rc = RequestContext {
        method,
        query: Value::Object(std::mem::take(&mut raw)),
        identity,
        development: state.development,
        internal: false,
        api: state.gateway.clone(),
    };
    Ok(Parsed { rc, query })
}

async fn dispatch(
    state: AppState,
    collection: String,
    headers: HeaderMap,
    raw_query: Option<String>,
    method: Method,
    target: Target,
    body: Option<Value>,
) -> Response {
    let resource = match state.registry.get(&collection) {
        Some(resource) => resource,
        None => {
            return error_response(PipelineError::NotFound(format!(
                "no such collection: {collection}"
            )))
        }
    };
    let parsed = match prepare(&state, &headers, raw_query, method) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(err),
    };

    // Unauthenticated registration on `users` is gated by settings.
    if collection == "users"
        && method == Method::Post
        && !parsed.rc.is_authenticated()
        && !state.settings.allow_registration
    {
        return error_response(PipelineError::Forbidden("registration is disabled".into()));
    }

    match resource
        .dispatch(&parsed.rc, target, &parsed.query, body)
        .await
    {
        Ok(Some(value)) => {
            let status = if method == Method::Post {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(value)).into_response()
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn list(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    dispatch(
        state,
        collection,
        headers,
        raw_query,
        Method::Get,
        Target::List,
        None,
    )
    .await
}

async fn count(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    dispatch(
        state,
        collection,
        headers,
        raw_query,
        Method::Get,
        Target::Count,
        None,
    )
    .await
}

async fn get_one(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    dispatch(
        state,
        collection,
        headers,
        raw_query,
        Method::Get,
        Target::One(id),
        None,
    )
    .await
}

async fn create(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body.map(|Json(v)| v);
    dispatch(
        state,
        collection,
        headers,
        raw_query,
        Method::Post,
        Target::List,
        body,
    )
    .await
}

async fn update(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body.map(|Json(v)| v);
    dispatch(
        state,
        collection,
        headers,
        raw_query,
        Method::Put,
        Target::One(id),
        body,
    )
    .await
}

async fn remove(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    dispatch(
        state,
        collection,
        headers,
        raw_query,
        Method::Delete,
        Target::One(id),
        None,
    )
    .await
}
