use std::time::Duration;

use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_server::{app, drip_chunk, fixture_byte, Echo, MAX_FIXTURE_BYTES};
use tower::ServiceExt;

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn get(uri: &str) -> Request<String> {
    Request::builder().uri(uri).body(String::new()).unwrap()
}

// --- health ---

#[tokio::test]
async fn health_returns_ok() {
    let resp = app().oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(&body_bytes(resp).await[..], b"ok");
}

// --- echo ---

#[tokio::test]
async fn echo_reflects_method_headers_and_body() {
    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(http::header::CONTENT_TYPE, "text/plain")
        .header("x-trace", "abc")
        .body("hello".to_string())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let echo: Echo = body_json(resp).await;
    assert_eq!(echo.method, "POST");
    assert_eq!(echo.body, "hello");
    assert!(echo
        .headers
        .contains(&("x-trace".to_string(), "abc".to_string())));
}

#[tokio::test]
async fn echo_accepts_custom_methods() {
    let req = Request::builder()
        .method("PROPFIND")
        .uri("/echo")
        .body(String::new())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let echo: Echo = body_json(resp).await;
    assert_eq!(echo.method, "PROPFIND");
    assert!(echo.body.is_empty());
}

// --- bytes ---

#[tokio::test]
async fn bytes_returns_exact_length() {
    let resp = app().oneshot(get("/bytes/300")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[http::header::CONTENT_TYPE],
        "application/octet-stream"
    );
    let body = body_bytes(resp).await;
    assert_eq!(body.len(), 300);
    assert!(body.iter().enumerate().all(|(i, b)| *b == fixture_byte(i)));
}

#[tokio::test]
async fn bytes_zero_is_empty() {
    let resp = app().oneshot(get("/bytes/0")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_bytes(resp).await.is_empty());
}

#[tokio::test]
async fn bytes_over_limit_is_refused() {
    let uri = format!("/bytes/{}", MAX_FIXTURE_BYTES + 1);
    let resp = app().oneshot(get(&uri)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn bytes_bad_length_returns_400() {
    let resp = app().oneshot(get("/bytes/lots")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// --- status ---

#[tokio::test]
async fn status_returns_requested_code() {
    for code in [200u16, 204, 404, 503] {
        let resp = app().oneshot(get(&format!("/status/{code}"))).await.unwrap();
        assert_eq!(resp.status().as_u16(), code);
    }
}

#[tokio::test]
async fn status_rejects_informational_and_invalid_codes() {
    for code in ["100", "1000", "abc"] {
        let resp = app().oneshot(get(&format!("/status/{code}"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "code {code}");
    }
}

// --- drip ---

#[tokio::test]
async fn drip_streams_numbered_chunks() {
    let resp = app().oneshot(get("/drip/3")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_bytes(resp).await;
    let expected: String = (0..3).map(drip_chunk).collect();
    assert_eq!(&body[..], expected.as_bytes());
}

// --- stall ---

#[tokio::test]
async fn stall_never_answers() {
    let pending = app().oneshot(get("/stall"));
    let outcome = tokio::time::timeout(Duration::from_millis(100), pending).await;
    assert!(outcome.is_err(), "stall responded");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let resp = app().oneshot(get("/missing")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
