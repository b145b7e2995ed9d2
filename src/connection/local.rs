//! Local connection module
//!
//! Runs PowerShell on the current machine. Used when the process already
//! runs on the domain controller, so no remote endpoint or credentials are
//! configured.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{encode_powershell, CommandResult, Connection, ConnectionError, ConnectionResult};

/// PowerShell executables, in order of preference.
const POWERSHELL_CANDIDATES: &[&str] = &["powershell.exe", "powershell", "pwsh"];

/// Local connection for executing PowerShell on the current host
#[derive(Debug, Clone)]
pub struct LocalConnection {
    identifier: String,
}

impl LocalConnection {
    /// Create a new local connection named after this host
    pub fn new() -> Self {
        let identifier = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self { identifier }
    }

    /// Locate a PowerShell binary on `PATH`
    pub fn find_powershell() -> ConnectionResult<PathBuf> {
        POWERSHELL_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                ConnectionError::ExecutionFailed(
                    "No PowerShell executable (powershell.exe, powershell, pwsh) found on PATH"
                        .to_string(),
                )
            })
    }

    fn powershell(program: PathBuf, script: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(["-NoProfile", "-NonInteractive", "-EncodedCommand"])
            .arg(encode_powershell(script));
        cmd
    }

    async fn run(&self, mut cmd: Command) -> ConnectionResult<CommandResult> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
        })?;

        let output = child.wait_with_output().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        trace!(exit_code = %exit_code, stdout_len = %stdout.len(), stderr_len = %stderr.len(), "Command completed");

        Ok(CommandResult::from_exit_code(exit_code, stdout, stderr))
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute_powershell(&self, script: &str) -> ConnectionResult<CommandResult> {
        let program = Self::find_powershell()?;
        debug!(program = %program.display(), "Executing local PowerShell");

        self.run(Self::powershell(program, script)).await
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}
