//! # windowsad - Remote Active Directory execution core
//!
//! windowsad runs PowerShell against a Windows domain controller over WinRM
//! (or in-process when already running on the controller) and turns the
//! output into typed directory records.
//!
//! ## Core Concepts
//!
//! - **Settings**: endpoint, credentials and Kerberos material
//! - **Transports**: Basic, NTLM, Kerberos or local execution, chosen from the settings
//! - **Session pool**: a bounded set of sessions shared by concurrent callers
//! - **Commands**: scripts assembled from fragments with every dynamic value escaped
//! - **Decoding**: CLIXML error streams to text, JSON output to records
//!
//! ## Architecture Overview
//!
//! ```text
//!   DirectoryClient ──► SessionPool ──► TransportConnector ──► WinRmConnection
//!         │                 │                                  LocalConnection
//!         ▼                 ▼
//!     PsCommand ───────► run(handle) ──► CommandResult
//!         ▲                                   │
//!     sanitize                                ▼
//!                                  decode_cli_xml / decode_output
//!                                             │
//!                                             ▼
//!                                  User, Group, Computer, ...
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use windowsad::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = Settings::load(None).map_err(|e| Error::Config(e.to_string()))?;
//!     let client = DirectoryClient::new(settings)?;
//!
//!     let user = client.get_user("jdoe", &["extensionAttribute1"]).await?;
//!     println!("{} lives in {}", user.sam_account_name, user.container());
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Re-exports of the types most callers need.

    pub use crate::config::{Protocol, Settings};
    pub use crate::connection::{
        select_transport, CommandResult, Connection, ConnectionError, ConnectionResult, LocalConnection,
        SessionHandle, SessionPool, Transport, WinRmConnection,
    };
    pub use crate::directory::{
        CommandOutput, Computer, DirectoryClient, GpLink, Gpo, Group, GroupMembership, OrgUnit, Sid, User,
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::powershell::{
        decode_cli_xml, decode_output, sanitise_string, Cmdlet, CustomAttributes, Decoded, PsCommand,
        PsCommandOptions,
    };
}

/// Error types and result aliases.
///
/// Remote failures are classified into an [`ErrorKind`](error::ErrorKind) so
/// callers can tell a missing object from any other failure.
pub mod error;

/// Settings loading, environment overrides and validation.
pub mod config;

/// Transport selection, WinRM and local executors, and the session pool.
pub mod connection;

/// Script construction, escaping and output decoding.
pub mod powershell;

/// Typed directory records and the query client.
pub mod directory;

/// Tracing subscriber setup.
pub mod logging;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
