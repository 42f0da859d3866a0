//! Turn orchestration. A chat turn spawns one agent subprocess, decodes its
//! stream, translates to outward events, and publishes them over a bounded
//! channel that backs the SSE response. The driver task owns the subprocess
//! end to end, so client disconnects and server shutdown both reach it.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::sse::Event;
use futures::Stream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use utoipa::ToSchema;

use agent_relay_agent_management::agents::AgentDefinition;
use agent_relay_error::RelayError;

use crate::launcher::{AgentInvocation, LaunchedAgent, OutputMode};
use crate::protocol::{result_from_value, EventReader};
use crate::session_store::{fallback_name, SessionStore};
use crate::translate::{OutwardEvent, Translator};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const REAP_GRACE: Duration = Duration::from_secs(5);
const STDERR_CAP: usize = 16 * 1024;

const NAMING_TIMEOUT: Duration = Duration::from_secs(30);
const NAMING_PROMPT: &str =
    "Summarize this request in 3-5 words for a session title. Reply with only the title, nothing else: ";
const NAME_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub mode: Option<TurnMode>,
}

/// Wall-clock budget class for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TurnMode {
    Quick,
    Deep,
}

impl TurnMode {
    pub fn budget(self, default_timeout: Duration) -> Duration {
        match self {
            TurnMode::Quick => default_timeout,
            TurnMode::Deep => default_timeout * 2,
        }
    }
}

enum TurnEnd {
    Completed,
    Cancelled,
    TimedOut,
}

/// SSE-ready event stream for one turn. Spawns the driver task immediately;
/// dropping the returned stream tears the subprocess down.
pub fn turn_stream(
    definition: AgentDefinition,
    store: Arc<SessionStore>,
    request: ChatRequest,
    cancel: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(drive_turn(definition, store, request, cancel, tx));
    ReceiverStream::new(rx).map(|event| Ok(to_sse_event(&event)))
}

fn to_sse_event(event: &OutwardEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

async fn drive_turn(
    definition: AgentDefinition,
    store: Arc<SessionStore>,
    request: ChatRequest,
    mut cancel: watch::Receiver<bool>,
    tx: mpsc::Sender<OutwardEvent>,
) {
    let mut translator = Translator::new(request.session_id.clone());

    // init opens every stream, before the subprocess exists.
    if tx.send(translator.init_event()).await.is_err() {
        return;
    }

    let invocation = AgentInvocation {
        prompt: request.message.clone(),
        resume_session_id: request.session_id.clone(),
        allowed_tools: request.allowed_tools.clone(),
        output: OutputMode::StreamJson,
    };

    tracing::debug!(
        agent = %definition.id,
        session = ?translator.session_id(),
        "turn launching"
    );

    let mut agent = match LaunchedAgent::spawn(&definition, &invocation) {
        Ok(agent) => agent,
        Err(err) => {
            let _ = tx.send(translator.failure(err.to_string())).await;
            let _ = tx.send(translator.done_event()).await;
            return;
        }
    };

    let (stdout, stderr) = match (agent.take_stdout(), agent.take_stderr()) {
        (Ok(stdout), Ok(stderr)) => (stdout, stderr),
        (out, err) => {
            agent.cancel().await;
            let message = out
                .err()
                .or(err.err())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "failed to capture subprocess pipes".to_string());
            let _ = tx.send(translator.failure(message)).await;
            let _ = tx.send(translator.done_event()).await;
            return;
        }
    };

    let stderr_task = tokio::spawn(capture_stderr(stderr));
    let mut reader = EventReader::new(stdout);

    tracing::debug!(
        agent = %definition.id,
        session = ?translator.session_id(),
        "turn streaming"
    );

    let budget = request
        .mode
        .unwrap_or(TurnMode::Quick)
        .budget(definition.default_timeout);
    let deadline = tokio::time::Instant::now() + budget;

    let mut end = TurnEnd::Completed;
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                end = TurnEnd::Cancelled;
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                end = TurnEnd::TimedOut;
                break;
            }
            next = reader.next_event() => match next {
                Ok(Some(event)) => {
                    for outward in translator.on_protocol_event(event) {
                        if tx.send(outward).await.is_err() {
                            // Client went away; nobody is listening anymore.
                            agent.cancel().await;
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx
                        .send(translator.failure(format!("failed to read agent output: {err}")))
                        .await;
                    break;
                }
            }
        }
    }

    let outcome = match end {
        TurnEnd::Completed => "completed",
        TurnEnd::Cancelled => "cancelled",
        TurnEnd::TimedOut => "timed_out",
    };
    tracing::debug!(
        agent = %definition.id,
        session = ?translator.session_id(),
        outcome,
        "turn finalizing"
    );

    match end {
        TurnEnd::Cancelled => {
            agent.cancel().await;
            let _ = tx.send(translator.cancelled_event()).await;
        }
        TurnEnd::TimedOut => {
            agent.cancel().await;
            let _ = tx
                .send(
                    translator.failure(format!("agent timed out after {}s", budget.as_secs())),
                )
                .await;
            let _ = tx.send(translator.done_event()).await;
        }
        TurnEnd::Completed => {
            let status = tokio::time::timeout(REAP_GRACE, agent.wait()).await;
            if status.is_err() {
                // Output ended but the process lingers.
                agent.cancel().await;
            }
            // A fork the agent left behind can hold stderr open past the
            // kill; bound the drain so the done frame is not deferred.
            let stderr_text = match tokio::time::timeout(REAP_GRACE, stderr_task).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => String::new(),
            };
            match status {
                Ok(Ok(status)) => {
                    if !status.success() && !translator.saw_terminal_payload() {
                        let detail = if stderr_text.trim().is_empty() {
                            format!("agent exited with {status}")
                        } else {
                            stderr_text.trim().to_string()
                        };
                        let _ = tx.send(translator.failure(detail)).await;
                    }
                }
                Ok(Err(err)) => {
                    let _ = tx
                        .send(translator.failure(format!("failed to reap agent process: {err}")))
                        .await;
                }
                Err(_) => {}
            }
            let _ = tx.send(translator.done_event()).await;
        }
    }

    if let Some(session_id) = translator.session_id() {
        if let Err(err) = store.record_turn(session_id, &request.message).await {
            tracing::warn!(session_id, error = %err, "failed to record session turn");
        }
    }
}

async fn capture_stderr<R: AsyncRead + Unpin>(stderr: R) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut captured = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(line = %line, "agent stderr");
        if captured.len() < STDERR_CAP {
            if !captured.is_empty() {
                captured.push('\n');
            }
            captured.push_str(&line);
            if captured.len() > STDERR_CAP {
                // The cap can land inside a multi-byte character.
                let mut cut = STDERR_CAP;
                while !captured.is_char_boundary(cut) {
                    cut -= 1;
                }
                captured.truncate(cut);
            }
        }
    }
    captured
}

#[derive(Debug, Clone)]
pub struct OneshotOutcome {
    pub text: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub is_error: bool,
}

/// Runs one turn to completion with buffered output, for the non-streaming
/// endpoint and for session naming. A non-zero exit is a successful call
/// whose outcome says `is_error`; only spawn, wait, and timeout failures
/// surface as errors.
pub async fn run_oneshot(
    definition: &AgentDefinition,
    invocation: &AgentInvocation,
    budget: Duration,
) -> Result<OneshotOutcome, RelayError> {
    let started = Instant::now();
    let mut agent = LaunchedAgent::spawn(definition, invocation)?;
    let stdout = agent.take_stdout()?;
    let stderr = agent.take_stderr()?;

    // Drain both pipes while waiting, otherwise a chatty agent fills the
    // pipe buffer and never exits.
    let stdout_task = tokio::spawn(read_all(stdout));
    let stderr_task = tokio::spawn(capture_stderr(stderr));

    let status = match tokio::time::timeout(budget, agent.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            agent.cancel().await;
            return Err(RelayError::StreamError {
                message: format!("failed to await agent exit: {err}"),
            });
        }
        Err(_) => {
            agent.cancel().await;
            return Err(RelayError::Timeout {
                message: Some(format!("agent timed out after {}s", budget.as_secs())),
            });
        }
    };

    let stdout_text = stdout_task.await.unwrap_or_default();
    let stderr_text = stderr_task.await.unwrap_or_default();
    let duration_ms = started.elapsed().as_millis() as u64;

    if !status.success() {
        return Ok(OneshotOutcome {
            text: format!("Error: {}", stderr_text.trim()),
            session_id: None,
            cost_usd: None,
            duration_ms,
            is_error: true,
        });
    }

    let trimmed = stdout_text.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => {
            let payload = result_from_value(&value);
            let text = if payload.text.is_empty() {
                trimmed.to_string()
            } else {
                payload.text
            };
            Ok(OneshotOutcome {
                text,
                session_id: payload.session_id,
                cost_usd: payload.cost_usd,
                duration_ms,
                is_error: payload.is_error,
            })
        }
        Err(_) => Ok(OneshotOutcome {
            text: trimmed.to_string(),
            session_id: None,
            cost_usd: None,
            duration_ms,
            is_error: false,
        }),
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Asks the agent itself for a short session title, falling back to a
/// preview of the first message when the agent is unavailable or answers
/// with something unusable.
pub async fn generate_session_name(definition: &AgentDefinition, first_message: &str) -> String {
    let invocation = AgentInvocation {
        prompt: format!("{NAMING_PROMPT}{first_message}"),
        resume_session_id: None,
        allowed_tools: None,
        output: OutputMode::Json,
    };

    match run_oneshot(definition, &invocation, NAMING_TIMEOUT).await {
        Ok(outcome) if !outcome.is_error => {
            sanitize_name(&outcome.text).unwrap_or_else(|| fallback_name(first_message))
        }
        Ok(_) => fallback_name(first_message),
        Err(err) => {
            tracing::debug!(agent = %definition.id, error = %err, "session naming fell back");
            fallback_name(first_message)
        }
    }
}

fn sanitize_name(raw: &str) -> Option<String> {
    let first_line = raw.lines().next().unwrap_or("").trim();
    let stripped = first_line
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string();
    if stripped.is_empty() || stripped.chars().count() > NAME_MAX_CHARS {
        None
    } else {
        Some(stripped)
    }
}
