//! Translation from subprocess protocol events to the outward SSE event
//! vocabulary. The translator also owns the per-turn session id: frames open
//! under the caller's resume hint, and the first id the subprocess reports
//! replaces it and is kept for the rest of the turn. The agent is the
//! authority on session identity; the hint only drives the invocation.

use std::time::Instant;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::protocol::{ProtocolEvent, ResultPayload};

/// One event on the outward SSE stream. Every frame carries the session id
/// once one is known; `init` may carry `null` while a fresh session is still
/// being created by the subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutwardEvent {
    Init {
        session_id: Option<String>,
    },
    Message {
        session_id: Option<String>,
        text: String,
    },
    ToolUse {
        session_id: Option<String>,
        tool_name: String,
    },
    System {
        session_id: Option<String>,
        text: String,
    },
    Result {
        session_id: Option<String>,
        text: String,
        cost_usd: Option<f64>,
        duration_ms: u64,
    },
    Error {
        session_id: Option<String>,
        text: String,
    },
    Cancelled {
        session_id: Option<String>,
    },
    Done {
        session_id: Option<String>,
        duration_ms: u64,
    },
}

/// Per-turn translation state. Built once per request, never shared.
pub struct Translator {
    session_id: Option<String>,
    adopted: bool,
    started: Instant,
    result_seen: bool,
    error_seen: bool,
}

impl Translator {
    pub fn new(resume_session_id: Option<String>) -> Self {
        Translator {
            session_id: resume_session_id,
            adopted: false,
            started: Instant::now(),
            result_seen: false,
            error_seen: false,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// True once the subprocess has reported its own terminal payload, result
    /// or error. Exits after that need no synthesized error frame.
    pub fn saw_terminal_payload(&self) -> bool {
        self.result_seen || self.error_seen
    }

    pub fn init_event(&self) -> OutwardEvent {
        OutwardEvent::Init {
            session_id: self.session_id.clone(),
        }
    }

    pub fn done_event(&self) -> OutwardEvent {
        OutwardEvent::Done {
            session_id: self.session_id.clone(),
            duration_ms: self.elapsed_ms(),
        }
    }

    pub fn cancelled_event(&self) -> OutwardEvent {
        OutwardEvent::Cancelled {
            session_id: self.session_id.clone(),
        }
    }

    /// Error frame for failures detected outside the protocol stream, such as
    /// a timeout or a non-zero exit without a result line.
    pub fn failure(&mut self, text: impl Into<String>) -> OutwardEvent {
        self.error_seen = true;
        OutwardEvent::Error {
            session_id: self.session_id.clone(),
            text: text.into(),
        }
    }

    pub fn on_protocol_event(&mut self, event: ProtocolEvent) -> Vec<OutwardEvent> {
        self.adopt(event.session_id());
        let session_id = self.session_id.clone();

        match event {
            ProtocolEvent::AssistantText { text, .. } => {
                vec![OutwardEvent::Message { session_id, text }]
            }
            ProtocolEvent::ToolInvocation { tool_name, .. } => {
                vec![OutwardEvent::ToolUse {
                    session_id,
                    tool_name,
                }]
            }
            ProtocolEvent::SystemNotice { text, .. } => {
                vec![OutwardEvent::System { session_id, text }]
            }
            ProtocolEvent::ProtocolError { message, .. } => {
                self.error_seen = true;
                vec![OutwardEvent::Error {
                    session_id,
                    text: message,
                }]
            }
            ProtocolEvent::Result(payload) => self.on_result(payload, session_id),
            ProtocolEvent::RawText { line } => {
                vec![OutwardEvent::Message {
                    session_id,
                    text: line,
                }]
            }
        }
    }

    fn on_result(
        &mut self,
        payload: ResultPayload,
        session_id: Option<String>,
    ) -> Vec<OutwardEvent> {
        // One terminal payload per turn; later result lines are dropped.
        if self.result_seen {
            return Vec::new();
        }
        self.result_seen = true;

        if payload.is_error {
            self.error_seen = true;
            return vec![OutwardEvent::Error {
                session_id,
                text: payload.text,
            }];
        }
        vec![OutwardEvent::Result {
            session_id,
            text: payload.text,
            cost_usd: payload.cost_usd,
            duration_ms: self.elapsed_ms(),
        }]
    }

    fn adopt(&mut self, reported: Option<&str>) {
        if self.adopted {
            return;
        }
        if let Some(id) = reported {
            self.adopted = true;
            self.session_id = Some(id.to_string());
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(text: &str, session: Option<&str>) -> ProtocolEvent {
        ProtocolEvent::AssistantText {
            text: text.to_string(),
            session_id: session.map(str::to_string),
        }
    }

    #[test]
    fn first_reported_id_is_adopted_and_kept() {
        let mut translator = Translator::new(None);
        assert!(matches!(
            translator.init_event(),
            OutwardEvent::Init { session_id: None }
        ));

        let events = translator.on_protocol_event(assistant("a", Some("s1")));
        assert!(matches!(
            &events[0],
            OutwardEvent::Message { session_id: Some(id), .. } if id == "s1"
        ));

        // A later, different id does not displace the adopted one.
        let events = translator.on_protocol_event(assistant("b", Some("s2")));
        assert!(matches!(
            &events[0],
            OutwardEvent::Message { session_id: Some(id), .. } if id == "s1"
        ));
    }

    #[test]
    fn reported_id_replaces_the_resume_hint() {
        let mut translator = Translator::new(Some("hint".to_string()));

        // Until the subprocess speaks, frames carry the hint.
        assert!(matches!(
            translator.init_event(),
            OutwardEvent::Init { session_id: Some(id) } if id == "hint"
        ));

        let events = translator.on_protocol_event(assistant("a", Some("agent-id")));
        assert!(matches!(
            &events[0],
            OutwardEvent::Message { session_id: Some(id), .. } if id == "agent-id"
        ));

        // The adopted id holds even against later, different reports.
        let events = translator.on_protocol_event(assistant("b", Some("another")));
        assert!(matches!(
            &events[0],
            OutwardEvent::Message { session_id: Some(id), .. } if id == "agent-id"
        ));
        assert_eq!(translator.session_id(), Some("agent-id"));
    }

    #[test]
    fn duplicate_result_lines_are_dropped() {
        let mut translator = Translator::new(None);
        let payload = ResultPayload {
            text: "done".to_string(),
            session_id: Some("s1".to_string()),
            cost_usd: Some(0.01),
            is_error: false,
        };
        let first = translator.on_protocol_event(ProtocolEvent::Result(payload.clone()));
        assert_eq!(first.len(), 1);
        assert!(translator.saw_terminal_payload());

        let second = translator.on_protocol_event(ProtocolEvent::Result(payload));
        assert!(second.is_empty());
    }

    #[test]
    fn error_result_becomes_error_event() {
        let mut translator = Translator::new(None);
        let events = translator.on_protocol_event(ProtocolEvent::Result(ResultPayload {
            text: "budget exceeded".to_string(),
            session_id: None,
            cost_usd: None,
            is_error: true,
        }));
        assert!(matches!(
            &events[0],
            OutwardEvent::Error { text, .. } if text == "budget exceeded"
        ));
        assert!(translator.saw_terminal_payload());
    }

    #[test]
    fn raw_lines_surface_as_messages() {
        let mut translator = Translator::new(None);
        let events = translator.on_protocol_event(ProtocolEvent::RawText {
            line: "plain output".to_string(),
        });
        assert!(matches!(
            &events[0],
            OutwardEvent::Message { text, .. } if text == "plain output"
        ));
    }

    #[test]
    fn outward_events_serialize_with_snake_case_tags() {
        let event = OutwardEvent::ToolUse {
            session_id: Some("s1".to_string()),
            tool_name: "Bash".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["tool_name"], "Bash");
    }
}
