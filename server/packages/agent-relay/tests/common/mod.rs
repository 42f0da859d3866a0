#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

use agent_relay::router::{build_router_with_state, AppState};
use agent_relay_agent_management::agents::{AgentCatalog, AgentDefinition, AgentId};
use agent_relay_agent_management::testing::write_stub_agent;

const SSE_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub data_dir: TempDir,
}

impl TestApp {
    /// App backed by a stub mock agent running `chat_script` for every
    /// non-version invocation.
    pub fn new(chat_script: &str) -> Self {
        Self::with_timeout(chat_script, Duration::from_secs(5))
    }

    pub fn with_timeout(chat_script: &str, default_timeout: Duration) -> Self {
        let data_dir = tempfile::tempdir().expect("create temp data dir");
        let executable = write_stub_agent(&data_dir.path().join("bin"), "mock-agent", chat_script)
            .expect("write stub agent");
        Self::with_executable(data_dir, executable, default_timeout)
    }

    /// App whose mock agent points at a path with no executable behind it.
    pub fn with_missing_binary() -> Self {
        let data_dir = tempfile::tempdir().expect("create temp data dir");
        let executable = data_dir.path().join("bin").join("mock-agent");
        Self::with_executable(data_dir, executable, Duration::from_secs(5))
    }

    fn with_executable(data_dir: TempDir, executable: PathBuf, default_timeout: Duration) -> Self {
        let definition = AgentDefinition {
            id: AgentId::Mock,
            executable_path: executable,
            working_directory: data_dir.path().to_path_buf(),
            default_timeout,
        };
        let catalog = AgentCatalog::with_definitions(vec![definition]);
        let state = Arc::new(AppState::new(catalog, data_dir.path().to_path_buf()));
        let (app, state) = build_router_with_state(state);
        Self {
            app,
            state,
            data_dir,
        }
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }
}

pub async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);

    let request_body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };

    let request = builder.body(request_body).expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();

    (status, headers, bytes.to_vec())
}

pub fn parse_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).expect("valid json")
    }
}

/// Incremental reader over one SSE response body.
pub struct SseStream {
    stream: axum::body::BodyDataStream,
    buffer: String,
}

impl SseStream {
    pub async fn open(app: &Router, uri: &str, body: Value) -> Self {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("build request");
        let response = app.clone().oneshot(request).await.expect("sse response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("text/event-stream")
        );
        Self {
            stream: response.into_body().into_data_stream(),
            buffer: String::new(),
        }
    }

    /// Next `data:` payload, or `None` once the stream closes. Comment
    /// frames from keep-alive are skipped.
    pub async fn next_data(&mut self) -> Option<Value> {
        self.next_data_within(SSE_READ_TIMEOUT).await
    }

    pub async fn next_data_within(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(boundary) = self.buffer.find("\n\n") {
                    let frame = self.buffer[..boundary].to_string();
                    self.buffer.drain(..boundary + 2);
                    let data = frame
                        .lines()
                        .filter_map(|line| line.strip_prefix("data: "))
                        .collect::<Vec<_>>()
                        .join("\n");
                    if data.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(&data).expect("valid SSE payload json"));
                }
                match self.stream.next().await {
                    Some(chunk) => {
                        let bytes = chunk.expect("stream chunk");
                        self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    None => return None,
                }
            }
        })
        .await
        .expect("timed out reading sse")
    }

    pub async fn collect_events(mut self) -> Vec<Value> {
        let mut events = Vec::new();
        while let Some(event) = self.next_data().await {
            events.push(event);
        }
        events
    }
}
