//! Connection layer for reaching the scripting host.
//!
//! Every transport implements the [`Connection`] trait so the command layer
//! never needs to know whether a script runs over WinRM or in a local
//! PowerShell process.
//!
//! # Overview
//!
//! - [`transport`]: pure selection of Basic, NTLM, Kerberos, or local
//!   execution from [`Settings`](crate::config::Settings)
//! - [`winrm`]: WS-Management client running PowerShell in a remote shell
//! - [`local`]: PowerShell spawned on this machine
//! - [`pool`]: bounded pool of sessions shared by concurrent callers
//!
//! # Example
//!
//! ```rust,ignore
//! use windowsad::config::Settings;
//! use windowsad::connection::pool::SessionPool;
//!
//! let pool = SessionPool::new(Settings::load(None)?);
//! let handle = pool.acquire().await?;
//! let result = handle.connection().execute_powershell("Get-ADDomain").await?;
//! pool.release(handle);
//! ```

/// Local PowerShell execution.
pub mod local;

/// Session pooling.
pub mod pool;

/// Transport selection.
pub mod transport;

/// WinRM (WS-Management) transport.
pub mod winrm;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use std::sync::Arc;
use thiserror::Error;

pub use local::LocalConnection;
pub use pool::{PoolStats, SessionHandle, SessionPool};
pub use transport::{select_transport, Transport, TransportConnector};
pub use winrm::{WinRmConnection, WinRmConnectionBuilder};

/// Errors that can occur while reaching or driving the scripting host.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to reach the endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The endpoint rejected the credentials, or the handshake failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The transport could not run the command (not a non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// The operation exceeded its deadline.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Settings are incomplete for the selected transport.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The pool has been shut down.
    #[error("Session pool is closed")]
    PoolClosed,
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Output of one command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit code of the command (0 indicates success).
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// `true` if `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Create a new successful command result
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    /// Create a new failed command result
    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }

    /// Build a result from an exit code, deriving `success`.
    pub fn from_exit_code(exit_code: i32, stdout: String, stderr: String) -> Self {
        if exit_code == 0 {
            Self::success(stdout, stderr)
        } else {
            Self::failure(exit_code, stdout, stderr)
        }
    }
}

/// Encode a script for `powershell -EncodedCommand` (UTF-16LE, base64).
pub fn encode_powershell(script: &str) -> String {
    let script_unicode: Vec<u8> = script
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    BASE64_STANDARD.encode(script_unicode)
}

/// Command line that runs an encoded script without loading a profile.
pub fn powershell_command_line(program: &str, script: &str) -> String {
    format!(
        "{} -NoProfile -NonInteractive -EncodedCommand {}",
        program,
        encode_powershell(script)
    )
}

/// The trait every transport implements.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection identifier (hostname)
    fn identifier(&self) -> &str;

    /// Check if the connection is still usable
    async fn is_alive(&self) -> bool;

    /// Run a PowerShell script on the host and collect its streams.
    async fn execute_powershell(&self, script: &str) -> ConnectionResult<CommandResult>;

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;
}

/// Produces connected sessions on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Create a new session. Implementations may defer I/O until first use.
    async fn connect(&self) -> ConnectionResult<Arc<dyn Connection>>;
}
