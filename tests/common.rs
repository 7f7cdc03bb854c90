//! Common test utilities for integration tests.
//!
//! Provides:
//! - Service constructors over both engines
//! - `post_json` for one-shot requests through the router
//! - `NdjsonReader` for consuming a subscription stream line by line
//! - `TestServer` for tests that need a real listener

#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use kvetch::service::ApiService;
use kvetch::store::{MemoryStore, RedbOptions, RedbStore};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// How long a test waits for a stream line before failing.
pub const LINE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn memory_service() -> ApiService {
    ApiService::new(Arc::new(MemoryStore::default()))
}

/// A service over a redb file that lives as long as the returned `TempDir`.
pub fn redb_service() -> (ApiService, TempDir) {
    let tmp = TempDir::new().unwrap();
    let store = RedbStore::open(tmp.path().join("kvetch.redb"), &RedbOptions::default()).unwrap();
    (ApiService::new(Arc::new(store)), tmp)
}

pub fn json_request(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Sends one JSON request and returns the status and decoded body.
pub async fn post_json(app: &Router, uri: &str, body: &Value) -> (StatusCode, Value) {
    let response = app.clone().oneshot(json_request(uri, body)).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Reads newline-delimited JSON from a streaming body.
pub struct NdjsonReader {
    body: Body,
    buf: Vec<u8>,
}

impl NdjsonReader {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            buf: Vec::new(),
        }
    }

    /// Next decoded line, or `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<Value> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Some(serde_json::from_slice(&line[..line.len() - 1]).unwrap());
            }
            let frame = tokio::time::timeout(LINE_TIMEOUT, self.body.frame())
                .await
                .expect("timed out waiting for a stream line")?
                .unwrap();
            if let Ok(data) = frame.into_data() {
                self.buf.extend_from_slice(&data);
            }
        }
    }

    /// True if no line arrives within `wait`.
    pub async fn is_quiet_for(&mut self, wait: Duration) -> bool {
        if self.buf.contains(&b'\n') {
            return false;
        }
        tokio::time::timeout(wait, self.body.frame()).await.is_err()
    }
}

/// Opens `/v1/subscribe` through the router and returns its line reader.
pub async fn open_stream(app: &Router, uri: &str, prefixes: &[&str]) -> NdjsonReader {
    let body = serde_json::json!({ "prefixes": prefixes });
    let response = app.clone().oneshot(json_request(uri, &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );
    NdjsonReader::new(response.into_body())
}

/// Keys of a `{"messages":[...]}` line, in order.
pub fn keys_of(line: &Value) -> Vec<String> {
    line["messages"]
        .as_array()
        .unwrap_or_else(|| panic!("not a messages line: {line}"))
        .iter()
        .map(|m| m["key"].as_str().unwrap().to_string())
        .collect()
}

/// A kvetch API server on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<kvetch::Result<()>>,
}

impl TestServer {
    pub async fn start(service: ApiService) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(kvetch::server::serve(listener, service, async {
            let _ = rx.await;
        }));
        Self {
            addr,
            shutdown: Some(tx),
            handle,
        }
    }

    /// Triggers graceful shutdown and waits for the server to exit.
    pub async fn stop(mut self) -> kvetch::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not shut down")
            .unwrap()
    }
}
