//! Per-agent session registry persisted as one JSON document on disk.
//! Reads are forgiving: a missing or malformed file is an empty registry,
//! and the next write replaces it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use agent_relay_agent_management::agents::AgentId;
use agent_relay_error::RelayError;

const NAME_PREVIEW_CHARS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SessionEntry {
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub first_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionDocument {
    #[serde(default)]
    sessions: Vec<SessionEntry>,
}

/// Registry for one agent's sessions. All mutation goes through the document
/// lock, so concurrent renames and turn records serialize.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        SessionStore {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Conventional location: `<data_dir>/sessions/<agent>.json`.
    pub fn for_agent(data_dir: &Path, agent: AgentId) -> Self {
        SessionStore::new(
            data_dir
                .join("sessions")
                .join(format!("{}.json", agent.as_str())),
        )
    }

    /// All sessions, most recently touched first.
    pub async fn list(&self) -> Result<Vec<SessionEntry>, RelayError> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().sessions;
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Creates or renames a session. A `first_message` replaces the stored
    /// one only when provided.
    pub async fn upsert(
        &self,
        session_id: &str,
        name: &str,
        first_message: Option<&str>,
    ) -> Result<SessionEntry, RelayError> {
        let _guard = self.lock.lock().await;
        let mut document = self.load();
        let now = Utc::now();

        let entry = match document
            .sessions
            .iter_mut()
            .find(|entry| entry.session_id == session_id)
        {
            Some(entry) => {
                entry.name = name.to_string();
                if let Some(message) = first_message {
                    entry.first_message = message.to_string();
                }
                entry.updated_at = now;
                entry.clone()
            }
            None => {
                let entry = SessionEntry {
                    session_id: session_id.to_string(),
                    name: name.to_string(),
                    first_message: first_message.unwrap_or_default().to_string(),
                    created_at: now,
                    updated_at: now,
                };
                document.sessions.push(entry.clone());
                entry
            }
        };

        self.save(&document)?;
        Ok(entry)
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), RelayError> {
        let _guard = self.lock.lock().await;
        let mut document = self.load();
        let before = document.sessions.len();
        document.sessions.retain(|entry| entry.session_id != session_id);
        if document.sessions.len() == before {
            return Err(RelayError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        self.save(&document)
    }

    /// Bookkeeping after a completed turn. A session seen for the first time
    /// gets a preview-derived name; a known one only has its timestamp
    /// refreshed.
    pub async fn record_turn(
        &self,
        session_id: &str,
        first_message: &str,
    ) -> Result<(), RelayError> {
        let _guard = self.lock.lock().await;
        let mut document = self.load();
        let now = Utc::now();

        match document
            .sessions
            .iter_mut()
            .find(|entry| entry.session_id == session_id)
        {
            Some(entry) => entry.updated_at = now,
            None => document.sessions.push(SessionEntry {
                session_id: session_id.to_string(),
                name: fallback_name(first_message),
                first_message: first_message.to_string(),
                created_at: now,
                updated_at: now,
            }),
        }

        self.save(&document)
    }

    fn load(&self) -> SessionDocument {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return SessionDocument::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(document) => document,
            Err(err) => {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %err,
                    "session registry unreadable, starting empty"
                );
                SessionDocument::default()
            }
        }
    }

    fn save(&self, document: &SessionDocument) -> Result<(), RelayError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| RelayError::RegistryIo {
                message: format!("{}: {err}", parent.display()),
            })?;
        }
        let raw =
            serde_json::to_string_pretty(document).map_err(|err| RelayError::RegistryIo {
                message: err.to_string(),
            })?;
        std::fs::write(&self.path, raw).map_err(|err| RelayError::RegistryIo {
            message: format!("{}: {err}", self.path.display()),
        })
    }
}

/// Session name derived from the opening message: the first 30 characters,
/// with an ellipsis when the message is longer.
pub fn fallback_name(message: &str) -> String {
    let mut name: String = message.chars().take(NAME_PREVIEW_CHARS).collect();
    if message.chars().count() > NAME_PREVIEW_CHARS {
        name.push_str("...");
    }
    name
}
