use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wall-clock budget for a quick chat turn. Deep turns double it.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Claude,
    Codex,
    Gemini,
    Mock,
}

impl AgentId {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentId::Claude => "claude",
            AgentId::Codex => "codex",
            AgentId::Gemini => "gemini",
            AgentId::Mock => "mock",
        }
    }

    pub fn binary_name(self) -> &'static str {
        match self {
            AgentId::Claude => "claude",
            AgentId::Codex => "codex",
            AgentId::Gemini => "gemini",
            AgentId::Mock => "mock-agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude" => Some(AgentId::Claude),
            "codex" => Some(AgentId::Codex),
            "gemini" => Some(AgentId::Gemini),
            "mock" => Some(AgentId::Mock),
            _ => None,
        }
    }

    pub fn all() -> &'static [AgentId] {
        &[AgentId::Claude, AgentId::Codex, AgentId::Gemini, AgentId::Mock]
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("agent binary not found: {agent}")]
    BinaryNotFound { agent: AgentId },
    #[error("agent not configured: {agent}")]
    NotConfigured { agent: AgentId },
}

/// One launchable agent. Immutable once the catalog is built; every agent
/// shares the same orchestration path downstream of this struct.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub executable_path: PathBuf,
    pub working_directory: PathBuf,
    pub default_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentCatalog {
    definitions: HashMap<AgentId, AgentDefinition>,
}

impl AgentCatalog {
    /// Builds the default catalog: real agents resolve against
    /// `~/.local/bin` first and fall back to a PATH lookup at spawn time;
    /// the mock agent lives under the server data directory so tests never
    /// pick up a real binary.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let local_bin = local_bin_dir();

        let mut definitions = HashMap::new();
        for agent in AgentId::all().iter().copied() {
            let definition = match agent {
                AgentId::Mock => AgentDefinition {
                    id: agent,
                    executable_path: data_dir.join("bin").join(agent.binary_name()),
                    working_directory: data_dir.clone(),
                    default_timeout: DEFAULT_AGENT_TIMEOUT,
                },
                _ => {
                    let installed = local_bin.join(agent.binary_name());
                    let executable_path = if installed.exists() {
                        installed
                    } else {
                        PathBuf::from(agent.binary_name())
                    };
                    AgentDefinition {
                        id: agent,
                        executable_path,
                        working_directory: home.clone(),
                        default_timeout: DEFAULT_AGENT_TIMEOUT,
                    }
                }
            };
            definitions.insert(agent, definition);
        }

        Self { definitions }
    }

    /// Catalog with explicit definitions only; agents absent from `definitions`
    /// are not served.
    pub fn with_definitions(definitions: Vec<AgentDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|definition| (definition.id, definition))
                .collect(),
        }
    }

    pub fn definition(&self, agent: AgentId) -> Option<&AgentDefinition> {
        self.definitions.get(&agent)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.definitions.values()
    }

    /// Live resolution for availability reporting: the configured path if it
    /// exists, otherwise a PATH walk (never for the mock agent).
    pub fn resolve(&self, agent: AgentId) -> Result<PathBuf, CatalogError> {
        let definition = self
            .definition(agent)
            .ok_or(CatalogError::NotConfigured { agent })?;
        if definition.executable_path.is_absolute() && definition.executable_path.exists() {
            return Ok(definition.executable_path.clone());
        }
        if agent != AgentId::Mock {
            if let Some(path) = find_in_path(agent.binary_name()) {
                return Ok(path);
            }
        }
        Err(CatalogError::BinaryNotFound { agent })
    }
}

/// The directory agent CLIs are installed into; prepended to `PATH` for
/// every spawned invocation.
pub fn local_bin_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("bin")
}

pub fn find_in_path(binary_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let candidate = path.join(binary_name);
        if candidate.exists() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let candidate_exe = path.join(format!("{binary_name}.exe"));
            if candidate_exe.exists() {
                return Some(candidate_exe);
            }
        }
    }
    None
}
