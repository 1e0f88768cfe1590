//! Deterministic HTTP fixtures for exercising the network engine.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::Path,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// Largest body `/bytes/{n}` will produce.
pub const MAX_FIXTURE_BYTES: usize = 16 * 1024 * 1024;

/// Interval between `/drip` chunks.
pub const DRIP_INTERVAL: Duration = Duration::from_millis(50);

/// What `/echo` saw, returned as JSON.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Echo {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

pub fn app() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/echo", any(echo))
        .route("/bytes/{n}", get(fixed_bytes))
        .route("/status/{code}", get(status))
        .route("/drip/{chunks}", get(drip))
        .route("/stall", get(stall))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Byte `i` of every `/bytes` body.
pub fn fixture_byte(i: usize) -> u8 {
    (i % 251) as u8
}

/// Chunk `i` of every `/drip` body.
pub fn drip_chunk(i: usize) -> String {
    format!("chunk-{i}\n")
}

async fn health() -> &'static str {
    "ok"
}

async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> Json<Echo> {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    tracing::debug!(%method, len = body.len(), "echo");
    Json(Echo {
        method: method.to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn fixed_bytes(Path(n): Path<usize>) -> Result<Response, StatusCode> {
    if n > MAX_FIXTURE_BYTES {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    let body: Vec<u8> = (0..n).map(fixture_byte).collect();
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

async fn status(Path(code): Path<u16>) -> Result<StatusCode, StatusCode> {
    match StatusCode::from_u16(code) {
        Ok(code) if code.as_u16() >= 200 => Ok(code),
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

async fn drip(Path(chunks): Path<usize>) -> Response {
    let body = stream::unfold(0, move |i| async move {
        if i >= chunks {
            return None;
        }
        tokio::time::sleep(DRIP_INTERVAL).await;
        Some((Ok::<_, Infallible>(Bytes::from(drip_chunk(i))), i + 1))
    });
    Body::from_stream(body).into_response()
}

/// Accepts the request and never answers.
async fn stall() -> StatusCode {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_bytes_wrap_at_prime() {
        assert_eq!(fixture_byte(0), 0);
        assert_eq!(fixture_byte(250), 250);
        assert_eq!(fixture_byte(251), 0);
    }

    #[test]
    fn drip_chunks_are_numbered() {
        assert_eq!(drip_chunk(0), "chunk-0\n");
        assert_eq!(drip_chunk(12), "chunk-12\n");
    }

    #[test]
    fn echo_serializes_headers_as_pairs() {
        let echo = Echo {
            method: "PATCH".to_string(),
            headers: vec![("x-a".to_string(), "1".to_string())],
            body: "hi".to_string(),
        };
        let json = serde_json::to_value(&echo).unwrap();
        assert_eq!(json["method"], "PATCH");
        assert_eq!(json["headers"][0][0], "x-a");
        assert_eq!(json["headers"][0][1], "1");
        assert_eq!(json["body"], "hi");
    }
}
