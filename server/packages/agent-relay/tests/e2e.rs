use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;

use agent_relay_agent_management::testing::write_stub_agent;

const HAPPY_SCRIPT: &str = r#"echo '{"type":"system","subtype":"init","session_id":"e2e-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello over the wire"}]},"session_id":"e2e-1"}'
echo '{"type":"result","result":"finished","total_cost_usd":0.003,"session_id":"e2e-1","is_error":false}'"#;

struct RelayHandle {
    child: Child,
    base_url: String,
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[tokio::test]
async fn streaming_turn_round_trips_over_the_wire() {
    let data_dir = tempfile::tempdir().expect("create data dir");
    stub_mock_agent(&data_dir, HAPPY_SCRIPT);

    let relay = spawn_relay(data_dir.path()).expect("spawn relay");
    wait_for_health(&relay.base_url)
        .await
        .expect("wait for health");

    let client = Client::new();
    let response = client
        .post(format!("{}/agents/mock/chat/stream", relay.base_url))
        .json(&json!({"message": "hello mock"}))
        .send()
        .await
        .expect("open chat stream");
    assert_eq!(response.status(), StatusCode::OK);

    let mut sse = SseReader::new(response);
    let mut types = Vec::new();
    loop {
        let event = sse
            .next_event(Duration::from_secs(5))
            .await
            .expect("sse event");
        let event_type = event["type"].as_str().unwrap_or("?").to_string();
        types.push(event_type.clone());
        if event_type == "done" {
            break;
        }
    }

    assert_eq!(types.first().map(String::as_str), Some("init"));
    assert!(types.contains(&"message".to_string()));
    assert!(types.contains(&"result".to_string()));
    assert_eq!(types.last().map(String::as_str), Some("done"));

    let sessions: Value = client
        .get(format!("{}/agents/mock/sessions", relay.base_url))
        .send()
        .await
        .expect("list sessions")
        .json()
        .await
        .expect("sessions json");
    assert_eq!(sessions["sessions"][0]["session_id"], "e2e-1");
}

#[tokio::test]
async fn oneshot_turn_round_trips_over_the_wire() {
    let data_dir = tempfile::tempdir().expect("create data dir");
    stub_mock_agent(
        &data_dir,
        r#"echo '{"type":"result","result":"direct answer","session_id":"e2e-2","is_error":false}'"#,
    );

    let relay = spawn_relay(data_dir.path()).expect("spawn relay");
    wait_for_health(&relay.base_url)
        .await
        .expect("wait for health");

    let client = Client::new();
    let response = client
        .post(format!("{}/agents/mock/chat", relay.base_url))
        .json(&json!({"message": "one question"}))
        .send()
        .await
        .expect("post chat");
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.expect("chat json");
    assert_eq!(body["result"], "direct answer");
    assert_eq!(body["session_id"], "e2e-2");
    assert_eq!(body["is_error"], false);
}

fn stub_mock_agent(data_dir: &TempDir, script: &str) {
    write_stub_agent(&data_dir.path().join("bin"), "mock-agent", script)
        .expect("write stub agent");
}

fn spawn_relay(data_dir: &Path) -> io::Result<RelayHandle> {
    let port = pick_port()?;
    let base_url = format!("http://127.0.0.1:{port}");

    let child = Command::new(env!("CARGO_BIN_EXE_agent-relay"))
        .arg("server")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("--data-dir")
        .arg(data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    Ok(RelayHandle { child, base_url })
}

fn pick_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn wait_for_health(base_url: &str) -> io::Result<()> {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "relay did not become healthy",
            ));
        }

        if let Ok(response) = client.get(format!("{base_url}/health")).send().await {
            if response.status() == StatusCode::OK {
                return Ok(());
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

struct SseReader {
    stream: futures::stream::BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
    buffer: String,
}

impl SseReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buffer: String::new(),
        }
    }

    async fn next_event(&mut self, timeout: Duration) -> io::Result<Value> {
        let deadline = Instant::now() + timeout;

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
                return serde_json::from_str(&data).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad sse payload: {err}"))
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out reading sse"));
            }
            match tokio::time::timeout(remaining, self.stream.next())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out reading sse"))?
            {
                Some(Ok(bytes)) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
                Some(Err(err)) => {
                    return Err(io::Error::other(format!("sse stream error: {err}")));
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "sse stream ended",
                    ));
                }
            }
        }
    }
}
