//! The auth surface: `POST /auth/login`, `POST /auth/logout`,
//! `GET /auth/validate`, `GET /auth/me`. Tokens are stateless; logout exists
//! for client symmetry only.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use depot_core::{Document, PipelineError};
use depot_query::{Clause, Query};
use depot_security::{verify_master_key, verify_password};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::router::{bearer_token, error_response, AppState};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    master_key: Option<String>,
}

pub async fn login(State(state): State<AppState>, body: Option<Json<LoginRequest>>) -> Response {
    let Some(Json(request)) = body else {
        return error_response(PipelineError::BadRequest("expected a JSON body".into()));
    };

    if let Some(presented) = request.master_key {
        if !verify_master_key(&state.settings.master_key, &presented) {
            return error_response(PipelineError::Unauthorized("invalid master key".into()));
        }
        return match state.tokens.issue("root", "master", true) {
            Ok((token, expires_at)) => {
                info!(key_prefix = state.settings.master_key_prefix(), "master key login");
                Json(json!({
                    "token": token,
                    "expiresAt": expires_at,
                    "isRoot": true,
                }))
                .into_response()
            }
            Err(e) => error_response(PipelineError::Internal(e.to_string())),
        };
    }

    let (Some(username), Some(password)) = (request.username, request.password) else {
        return error_response(PipelineError::BadRequest(
            "expected {username, password} or {masterKey}".into(),
        ));
    };

    let user = match find_user(&state, "username", &username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return error_response(PipelineError::Unauthorized("invalid credentials".into()))
        }
        Err(err) => return error_response(err),
    };
    let stored = user.get("password").and_then(Value::as_str).unwrap_or("");
    if !verify_password(&password, stored) {
        return error_response(PipelineError::Unauthorized("invalid credentials".into()));
    }

    let user_id = user.id().unwrap_or_default().to_string();
    match state.tokens.issue(&user_id, &username, false) {
        Ok((token, expires_at)) => Json(json!({
            "token": token,
            "expiresAt": expires_at,
            "isRoot": false,
            "user": sans_secrets(user),
        }))
        .into_response(),
        Err(e) => error_response(PipelineError::Internal(e.to_string())),
    }
}

pub async fn logout() -> Json<Value> {
    // Stateless tokens: nothing to revoke server-side.
    Json(json!({ "ok": true }))
}

pub async fn validate(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(PipelineError::Unauthorized("missing bearer token".into()));
    };
    match state.tokens.validate(&token) {
        Ok(claims) => Json(json!({
            "valid": true,
            "userID": claims.sub,
            "username": claims.username,
            "isRoot": claims.is_root,
            "exp": claims.exp,
        }))
        .into_response(),
        Err(e) => error_response(PipelineError::Unauthorized(e.public_message().into())),
    }
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let identity = match crate::router::extract_identity(&state, &headers) {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            return error_response(PipelineError::Unauthorized("authentication required".into()))
        }
        Err(err) => return error_response(err),
    };
    if identity.is_root {
        return Json(json!({
            "id": identity.id,
            "username": identity.username,
            "isRoot": true,
        }))
        .into_response();
    }

    match find_user(&state, "id", &identity.id).await {
        Ok(Some(user)) => Json(sans_secrets(user)).into_response(),
        Ok(None) => error_response(PipelineError::NotFound("user".into())),
        Err(err) => error_response(err),
    }
}

async fn find_user(
    state: &AppState,
    field: &str,
    value: &str,
) -> Result<Option<Document>, PipelineError> {
    let Some(users) = state.registry.get("users") else {
        return Err(PipelineError::Unauthorized(
            "no users collection configured".into(),
        ));
    };
    let mut query = Query::default();
    query
        .filter
        .clauses
        .push(Clause::eq(field, Value::String(value.to_string())));
    Ok(users.store().find_one(&query).await?)
}

/// Strip password-like fields from a user document before it leaves.
fn sans_secrets(mut user: Document) -> Value {
    let secret_keys: Vec<String> = user
        .keys()
        .filter(|k| k.to_ascii_lowercase().contains("password"))
        .cloned()
        .collect();
    for key in secret_keys {
        user.remove(&key);
    }
    user.into_value()
}
