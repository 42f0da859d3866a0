//! Decoder for the line-delimited JSON protocol the agent CLIs print in
//! stream-json mode. Every line maps to at least one event; lines the
//! decoder does not recognize pass through as raw text instead of being
//! dropped.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

/// One decoded protocol event. Variants mirror the subprocess wire shapes,
/// not the outward SSE shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    AssistantText {
        text: String,
        session_id: Option<String>,
    },
    ToolInvocation {
        tool_name: String,
        session_id: Option<String>,
    },
    Result(ResultPayload),
    ProtocolError {
        message: String,
        session_id: Option<String>,
    },
    SystemNotice {
        text: String,
        session_id: Option<String>,
    },
    /// A line that was not valid JSON, or valid JSON of a shape the decoder
    /// does not know. Carries the line verbatim.
    RawText { line: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultPayload {
    pub text: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub is_error: bool,
}

impl ProtocolEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ProtocolEvent::AssistantText { session_id, .. }
            | ProtocolEvent::ToolInvocation { session_id, .. }
            | ProtocolEvent::ProtocolError { session_id, .. }
            | ProtocolEvent::SystemNotice { session_id, .. } => session_id.as_deref(),
            ProtocolEvent::Result(payload) => payload.session_id.as_deref(),
            ProtocolEvent::RawText { .. } => None,
        }
    }
}

/// Decodes one protocol line. An assistant message with several content
/// blocks yields several events, so the return is a vector.
pub fn decode_line(line: &str) -> Vec<ProtocolEvent> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => {
            return vec![ProtocolEvent::RawText {
                line: line.to_string(),
            }]
        }
    };

    let session_id = extract_session_id(&value);
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => decode_assistant(&value, session_id, line),
        Some("tool_use") => vec![ProtocolEvent::ToolInvocation {
            tool_name: value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            session_id,
        }],
        Some("result") => vec![ProtocolEvent::Result(result_from_value(&value))],
        Some("error") => vec![ProtocolEvent::ProtocolError {
            message: error_message(&value),
            session_id,
        }],
        Some("system") => vec![ProtocolEvent::SystemNotice {
            text: value
                .get("subtype")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| compact(&value)),
            session_id,
        }],
        _ => vec![ProtocolEvent::RawText {
            line: line.to_string(),
        }],
    }
}

/// Builds the terminal payload from a `result` document. Shared with the
/// one-shot path, which reads the same shape off buffered stdout.
pub fn result_from_value(value: &Value) -> ResultPayload {
    ResultPayload {
        text: value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
        session_id: extract_session_id(value),
        cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn decode_assistant(value: &Value, session_id: Option<String>, line: &str) -> Vec<ProtocolEvent> {
    let blocks = value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut events = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    events.push(ProtocolEvent::AssistantText {
                        text: text.to_string(),
                        session_id: session_id.clone(),
                    });
                }
            }
            Some("tool_use") => {
                events.push(ProtocolEvent::ToolInvocation {
                    tool_name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    session_id: session_id.clone(),
                });
            }
            _ => {}
        }
    }

    if events.is_empty() {
        events.push(ProtocolEvent::RawText {
            line: line.to_string(),
        });
    }
    events
}

fn error_message(value: &Value) -> String {
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| compact(value))
}

fn extract_session_id(value: &Value) -> Option<String> {
    value
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

/// Pulls protocol events off a subprocess pipe line by line. Blank lines are
/// skipped; multi-event lines are queued and drained before the next read.
pub struct EventReader<R> {
    lines: Lines<BufReader<R>>,
    pending: VecDeque<ProtocolEvent>,
}

impl<R: AsyncRead + Unpin> EventReader<R> {
    pub fn new(reader: R) -> Self {
        EventReader {
            lines: BufReader::new(reader).lines(),
            pending: VecDeque::new(),
        }
    }

    /// Next event, or `None` once the pipe closes.
    pub async fn next_event(&mut self) -> std::io::Result<Option<ProtocolEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            match self.lines.next_line().await? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    self.pending.extend(decode_line(line));
                }
                None => return Ok(None),
            }
        }
    }
}
