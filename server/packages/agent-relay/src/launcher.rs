use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use agent_relay_agent_management::agents::{local_bin_dir, AgentDefinition, AgentId};
use agent_relay_error::RelayError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One subprocess run. Ephemeral: built per request, discarded once the
/// stream ends.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub prompt: String,
    pub resume_session_id: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub output: OutputMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Line-delimited events while the agent runs.
    StreamJson,
    /// A single JSON document on exit, for one-shot turns.
    Json,
}

impl OutputMode {
    fn as_flag(self) -> &'static str {
        match self {
            OutputMode::StreamJson => "stream-json",
            OutputMode::Json => "json",
        }
    }
}

/// Deterministic argument vector for one invocation. The agent CLIs require
/// `--verbose` when printing stream-json; one-shot json runs go without it.
pub fn build_args(invocation: &AgentInvocation) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        invocation.prompt.clone(),
        "--output-format".to_string(),
        invocation.output.as_flag().to_string(),
    ];
    if invocation.output == OutputMode::StreamJson {
        args.push("--verbose".to_string());
    }
    args.push("--dangerously-skip-permissions".to_string());
    if let Some(session_id) = &invocation.resume_session_id {
        args.push("--resume".to_string());
        args.push(session_id.clone());
    }
    if let Some(tools) = &invocation.allowed_tools {
        if !tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
    }
    args
}

#[derive(Debug)]
pub struct LaunchedAgent {
    child: Child,
    agent: AgentId,
    pid: Option<u32>,
    cancelled: bool,
}

impl LaunchedAgent {
    /// Spawns one agent process with piped stdio and `~/.local/bin` prepended
    /// to `PATH`. Spawn failure is an error value, never a panic.
    pub fn spawn(
        definition: &AgentDefinition,
        invocation: &AgentInvocation,
    ) -> Result<LaunchedAgent, RelayError> {
        let args = build_args(invocation);

        let mut command = Command::new(&definition.executable_path);
        command
            .args(&args)
            .current_dir(&definition.working_directory)
            .env("PATH", path_with_local_bin())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            agent = %definition.id,
            program = ?definition.executable_path,
            output = invocation.output.as_flag(),
            resume = invocation.resume_session_id.is_some(),
            prompt_bytes = invocation.prompt.len(),
            "spawning agent process"
        );

        let child = command.spawn().map_err(|err| {
            tracing::error!(
                agent = %definition.id,
                program = ?definition.executable_path,
                error = %err,
                "failed to spawn agent process"
            );
            RelayError::SpawnFailure {
                agent: definition.id.to_string(),
                message: format!("{}: {err}", definition.executable_path.display()),
            }
        })?;

        let pid = child.id();
        tracing::info!(agent = %definition.id, pid = pid.unwrap_or(0), "agent process spawned");

        Ok(LaunchedAgent {
            child,
            agent: definition.id,
            pid,
            cancelled: false,
        })
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, RelayError> {
        self.child.stdout.take().ok_or_else(|| RelayError::StreamError {
            message: "failed to capture subprocess stdout".to_string(),
        })
    }

    pub fn take_stderr(&mut self) -> Result<ChildStderr, RelayError> {
        self.child.stderr.take().ok_or_else(|| RelayError::StreamError {
            message: "failed to capture subprocess stderr".to_string(),
        })
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Terminates the subprocess and unblocks pending reads. Idempotent; a
    /// process that already exited is left alone.
    pub async fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;

        tracing::info!(
            agent = %self.agent,
            pid = self.pid.unwrap_or(0),
            "terminating agent process"
        );
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                let _ = self.child.kill().await;
                let _ = self.child.wait().await;
            }
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Runs `<executable> --version` with a short budget. Used by the status
/// endpoints only; chat turns never go through here.
pub async fn probe_version(definition: &AgentDefinition) -> Result<String, RelayError> {
    let executable: PathBuf = definition.executable_path.clone();
    let output = Command::new(&executable)
        .arg("--version")
        .current_dir(&definition.working_directory)
        .env("PATH", path_with_local_bin())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(result) => result.map_err(|err| RelayError::SpawnFailure {
            agent: definition.id.to_string(),
            message: format!("{}: {err}", executable.display()),
        })?,
        Err(_) => {
            return Err(RelayError::Timeout {
                message: Some(format!(
                    "version probe timed out after {}s",
                    PROBE_TIMEOUT.as_secs()
                )),
            })
        }
    };

    if !output.status.success() {
        return Err(RelayError::SubprocessFailure {
            agent: definition.id.to_string(),
            exit_code: output.status.code(),
            stderr: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn path_with_local_bin() -> OsString {
    let local_bin = local_bin_dir();
    match std::env::var_os("PATH") {
        Some(path) => {
            let mut paths = vec![local_bin];
            paths.extend(std::env::split_paths(&path));
            std::env::join_paths(paths).unwrap_or(path)
        }
        None => local_bin.into_os_string(),
    }
}
