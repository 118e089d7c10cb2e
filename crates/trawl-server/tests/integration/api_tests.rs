use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;

use trawl_core::testutil::{MockExtractor, make_items};

use crate::common::{TEST_API_KEY, TestApp, authed, json_body, send, setup_test_app};

/// Poll the job endpoint until the job leaves `running`.
async fn wait_for_finish(app: &TestApp, job_id: &str) -> serde_json::Value {
    for _ in 0..100 {
        let response = send(app, authed("GET", &format!("/v1/jobs/{job_id}"), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        if json["status"] != "running" && json["status"] != "queued" {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} did not finish");
}

async fn start(app: &TestApp, body: serde_json::Value) -> String {
    let response = send(app, authed("POST", "/v1/jobs", Some(body))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    json["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app(MockExtractor::new(vec![]));

    let response = send(
        &app,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["active_jobs"], 0);
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app(MockExtractor::new(vec![]));

    for uri in ["/v1/jobs", "/v1/status", "/ws"] {
        let response = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
    }
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app(MockExtractor::new(vec![]));

    let response = send(
        &app,
        Request::get("/v1/jobs")
            .header("authorization", "Bearer wrong-key")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = json_body(response).await;
    assert_eq!(json["error"], "unauthorized");
}

#[tokio::test]
async fn query_token_is_accepted() {
    let app = setup_test_app(MockExtractor::new(vec![]));

    let response = send(
        &app,
        Request::get(format!("/v1/status?token={TEST_API_KEY}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_and_get_job() {
    let app = setup_test_app(MockExtractor::new(make_items(4)));

    let job_id = start(
        &app,
        json!({"platform": "reddit", "target": "r/rust", "limit": 4}),
    )
    .await;
    let job = wait_for_finish(&app, &job_id).await;

    assert_eq!(job["status"], "completed");
    assert_eq!(job["platform"], "reddit");
    assert_eq!(job["items_scraped"], 4);
    assert_eq!(job["success_count"], 4);
    assert_eq!(job["error_count"], 0);
    assert_eq!(job["from_cache"], false);
    assert!(job["finished_at"].is_string());
}

#[tokio::test]
async fn invalid_requests_return_400() {
    let app = setup_test_app(MockExtractor::new(vec![]));

    let cases = [
        (
            json!({"platform": "reddit", "target": "r/rust", "limit": 0}),
            "validation_error",
        ),
        (
            json!({"platform": "reddit", "target": "r/rust", "limit": 500}),
            "validation_error",
        ),
        (
            json!({"platform": "myspace", "target": "tom", "limit": 5}),
            "validation_error",
        ),
        (
            json!({"platform": "twitter", "target": "@acct", "limit": 5}),
            "unsupported_platform",
        ),
    ];

    for (body, kind) in cases {
        let response = send(&app, authed("POST", "/v1/jobs", Some(body.clone()))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        let json = json_body(response).await;
        assert_eq!(json["error"], kind, "{body}");
    }
}

#[tokio::test]
async fn unknown_job_returns_404() {
    let app = setup_test_app(MockExtractor::new(vec![]));
    let id = uuid::Uuid::new_v4();

    for method in ["GET", "DELETE"] {
        let response = send(&app, authed(method, &format!("/v1/jobs/{id}"), None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method}");
        let json = json_body(response).await;
        assert_eq!(json["error"], "not_found");
    }
}

#[tokio::test]
async fn cancel_running_job() {
    let extractor = MockExtractor::new(make_items(3)).with_delay(Duration::from_secs(30));
    let app = setup_test_app(extractor);

    let job_id = start(
        &app,
        json!({"platform": "reddit", "target": "r/slow", "limit": 3}),
    )
    .await;

    let list = json_body(send(&app, authed("GET", "/v1/jobs", None)).await).await;
    assert_eq!(list["total"], 1);

    let response = send(&app, authed("DELETE", &format!("/v1/jobs/{job_id}"), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["cancelled"], true);

    let job = wait_for_finish(&app, &job_id).await;
    assert_eq!(job["status"], "cancelled");

    // Already finished: reported, not an error.
    let response = send(&app, authed("DELETE", &format!("/v1/jobs/{job_id}"), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["cancelled"], false);
}

#[tokio::test]
async fn repeated_job_is_served_from_cache_until_invalidated() {
    let extractor = MockExtractor::new(make_items(2));
    let app = setup_test_app(extractor.clone());
    let body = json!({"platform": "reddit", "target": "r/rust", "limit": 2});

    let first = start(&app, body.clone()).await;
    wait_for_finish(&app, &first).await;

    let second = start(&app, body.clone()).await;
    let job = wait_for_finish(&app, &second).await;
    assert_eq!(job["from_cache"], true);
    assert_eq!(extractor.calls(), 1);

    let response = send(&app, authed("DELETE", "/v1/cache/reddit", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["removed"], 1);

    let third = start(&app, body).await;
    let job = wait_for_finish(&app, &third).await;
    assert_eq!(job["from_cache"], false);
    assert_eq!(extractor.calls(), 2);
}

#[tokio::test]
async fn invalidate_unknown_platform_returns_400() {
    let app = setup_test_app(MockExtractor::new(vec![]));
    let response = send(&app, authed("DELETE", "/v1/cache/myspace", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_reports_platforms_and_connections() {
    let app = setup_test_app(MockExtractor::new(vec![]));
    let _subscriber = app.orchestrator.broadcaster().subscribe(None);

    let response = send(&app, authed("GET", "/v1/status", None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["active_connections"], 1);
    assert_eq!(json["active_jobs"], 0);
    assert_eq!(json["supported_platforms"], json!(["reddit"]));
}
