//! Test plumbing: a router over a temp resources directory and the
//! in-memory backend, driven through `tower::ServiceExt::oneshot`.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use depot_core::{NoopEmitter, Settings};
use depot_script::js::{JsPool, JsPoolConfig};
use depot_script::native::PluginCompiler;
use depot_security::TokenService;
use depot_server::{build_router, AppState, ResourceRegistry};
use depot_store::MemoryBackend;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

pub const MASTER_KEY_LEN: usize = 128;

pub struct TestApp {
    pub router: Router,
    pub registry: Arc<ResourceRegistry>,
    pub tokens: Arc<TokenService>,
    pub master_key: String,
    dir: tempfile::TempDir,
}

impl TestApp {
    /// Build an app serving `collections`, each `(name, config_json)`, with
    /// optional hook files `(collection, file_name, source)`.
    pub async fn new(collections: &[(&str, &str)], hooks: &[(&str, &str, &str)]) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        for (name, config) in collections {
            let coll_dir = dir.path().join(name);
            std::fs::create_dir_all(&coll_dir).unwrap();
            std::fs::write(coll_dir.join("config.json"), config).unwrap();
        }
        for (collection, file, source) in hooks {
            std::fs::write(dir.path().join(collection).join(file), source).unwrap();
        }

        let registry = Arc::new(ResourceRegistry::new(
            dir.path(),
            Arc::new(MemoryBackend::new()),
            Arc::new(JsPool::new(JsPoolConfig::default()).unwrap()),
            Arc::new(PluginCompiler::new(dir.path().join(".plugins"))),
            Arc::new(NoopEmitter),
        ));
        registry.load_all().await.unwrap();

        let master_key = "a".repeat(MASTER_KEY_LEN);
        let settings = Arc::new(Settings {
            master_key: master_key.clone(),
            jwt_secret: "test-secret".into(),
            jwt_expiration: "24h".into(),
            allow_registration: true,
        });
        let tokens = Arc::new(TokenService::new(
            &settings.jwt_secret,
            settings.jwt_expiration(),
        ));
        let state = AppState {
            gateway: registry.gateway(),
            registry: Arc::clone(&registry),
            tokens: Arc::clone(&tokens),
            settings,
            development: false,
        };
        TestApp {
            router: build_router(state),
            registry,
            tokens,
            master_key,
            dir,
        }
    }

    pub fn resources_dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request("GET", uri, None, &[]).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request("POST", uri, Some(body), &[]).await
    }

    pub fn token_for(&self, user_id: &str, username: &str) -> String {
        let (token, _) = self.tokens.issue(user_id, username, false).unwrap();
        token
    }
}

/// A plain items schema with one required title.
pub const ITEMS: (&str, &str) = (
    "items",
    r#"{"properties": {"title": {"type": "string", "required": true}, "age": {"type": "number"}}}"#,
);
