use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use tower::ServiceExt;

use trawl_core::testutil::MockExtractor;
use trawl_core::{
    Broadcaster, ExtractorRegistry, MemoryCache, MemoryContentStore, Orchestrator,
    OrchestratorConfig, Platform, RetryPolicy,
};
use trawl_server::routes;
use trawl_server::state::{AppState, ServerOrchestrator};

pub const TEST_API_KEY: &str = "test-secret-key";

pub struct TestApp {
    pub router: Router,
    pub orchestrator: ServerOrchestrator,
}

/// Router backed by an in-process orchestrator whose only extractor is `reddit`.
pub fn setup_test_app(extractor: MockExtractor) -> TestApp {
    let config = OrchestratorConfig::default().with_retry(RetryPolicy::new(
        0,
        Duration::from_millis(1),
        Duration::from_millis(1),
    ));
    let orchestrator = Orchestrator::new(
        config,
        ExtractorRegistry::new().register(Platform::Reddit, extractor),
        MemoryCache::default(),
        MemoryContentStore::new(),
        Broadcaster::default(),
    )
    .unwrap();

    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        api_key: TEST_API_KEY.to_string(),
    });

    TestApp {
        router: routes::router(state),
        orchestrator,
    }
}

pub fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn send(app: &TestApp, request: Request<Body>) -> Response<Body> {
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}
