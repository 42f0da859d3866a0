use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnsupportedAgent,
    SpawnFailure,
    SubprocessFailure,
    SessionNotFound,
    RegistryIo,
    StreamError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-relay:error:invalid_request",
            Self::UnsupportedAgent => "urn:agent-relay:error:unsupported_agent",
            Self::SpawnFailure => "urn:agent-relay:error:spawn_failure",
            Self::SubprocessFailure => "urn:agent-relay:error:subprocess_failure",
            Self::SessionNotFound => "urn:agent-relay:error:session_not_found",
            Self::RegistryIo => "urn:agent-relay:error:registry_io",
            Self::StreamError => "urn:agent-relay:error:stream_error",
            Self::Timeout => "urn:agent-relay:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnsupportedAgent => "Unsupported Agent",
            Self::SpawnFailure => "Spawn Failure",
            Self::SubprocessFailure => "Subprocess Failure",
            Self::SessionNotFound => "Session Not Found",
            Self::RegistryIo => "Registry Io",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnsupportedAgent => 400,
            Self::SpawnFailure => 502,
            Self::SubprocessFailure => 502,
            Self::SessionNotFound => 404,
            Self::RegistryIo => 500,
            Self::StreamError => 502,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unsupported agent: {agent}")]
    UnsupportedAgent { agent: String },
    #[error("failed to spawn agent process: {agent}: {message}")]
    SpawnFailure { agent: String, message: String },
    #[error("agent process failed: {agent}")]
    SubprocessFailure {
        agent: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("session registry io: {message}")]
    RegistryIo { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnsupportedAgent { .. } => ErrorType::UnsupportedAgent,
            Self::SpawnFailure { .. } => ErrorType::SpawnFailure,
            Self::SubprocessFailure { .. } => ErrorType::SubprocessFailure,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::RegistryIo { .. } => ErrorType::RegistryIo,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::UnsupportedAgent { agent } | Self::SpawnFailure { agent, .. } => {
                extensions.insert("agent".to_string(), Value::String(agent.clone()));
            }
            Self::SubprocessFailure {
                agent,
                exit_code,
                stderr,
            } => {
                extensions.insert("agent".to_string(), Value::String(agent.clone()));
                if let Some(code) = exit_code {
                    extensions.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    extensions.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::Timeout { message } => {
                if let Some(message) = message {
                    extensions.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            Self::InvalidRequest { .. } | Self::RegistryIo { .. } | Self::StreamError { .. } => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_status_and_urn() {
        let err = RelayError::SessionNotFound {
            session_id: "abc".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.type_, "urn:agent-relay:error:session_not_found");
        assert_eq!(
            problem.extensions.get("sessionId"),
            Some(&Value::String("abc".to_string()))
        );
    }

    #[test]
    fn subprocess_failure_surfaces_stderr() {
        let err = RelayError::SubprocessFailure {
            agent: "claude".to_string(),
            exit_code: Some(1),
            stderr: Some("boom".to_string()),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 502);
        assert_eq!(
            problem.extensions.get("stderr"),
            Some(&Value::String("boom".to_string()))
        );
    }
}
