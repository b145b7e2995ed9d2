//! Shared test utilities for the windowsad test suite.
//!
//! - A scripted mock [`Connection`] that records every PowerShell script
//! - A [`Connector`] handing out that mock and counting connects
//! - Settings and JSON fixtures
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use windowsad::config::{Protocol, Settings};
use windowsad::connection::{
    CommandResult, Connection, ConnectionError, ConnectionResult, Connector, SessionPool,
};
use windowsad::directory::DirectoryClient;

// ============================================================================
// Mock Connection
// ============================================================================

/// A connection that answers PowerShell scripts from a table of canned
/// results keyed by substring.
#[derive(Debug)]
pub struct MockConnection {
    identifier: String,
    scripts: RwLock<Vec<String>>,
    responses: RwLock<Vec<(String, CommandResult)>>,
    default_result: RwLock<CommandResult>,
    should_fail: AtomicBool,
    delay: RwLock<Option<Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockConnection {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            scripts: RwLock::new(Vec::new()),
            responses: RwLock::new(Vec::new()),
            default_result: RwLock::new(CommandResult::success(String::new(), String::new())),
            should_fail: AtomicBool::new(false),
            delay: RwLock::new(None),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Answer any script containing `needle` with `result`. Earlier entries win.
    pub fn respond(&self, needle: impl Into<String>, result: CommandResult) {
        self.responses.write().push((needle.into(), result));
    }

    /// Answer any script containing `needle` with JSON on stdout.
    pub fn respond_json(&self, needle: impl Into<String>, json: &str) {
        self.respond(needle, CommandResult::success(json.to_string(), String::new()));
    }

    /// Answer any script containing `needle` with a failure.
    pub fn respond_error(&self, needle: impl Into<String>, exit_code: i32, stderr: &str) {
        self.respond(needle, CommandResult::failure(exit_code, String::new(), stderr.to_string()));
    }

    pub fn set_default_result(&self, result: CommandResult) {
        *self.default_result.write() = result;
    }

    /// Make every run fail at the transport level.
    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    /// Hold each run for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = Some(delay);
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.read().clone()
    }

    pub fn last_script(&self) -> Option<String> {
        self.scripts.read().last().cloned()
    }

    pub fn run_count(&self) -> usize {
        self.scripts.read().len()
    }

    /// Highest number of scripts observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn lookup(&self, script: &str) -> CommandResult {
        self.responses
            .read()
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| self.default_result.read().clone())
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute_powershell(&self, script: &str) -> ConnectionResult<CommandResult> {
        self.scripts.write().push(script.to_string());

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{}: connection reset",
                self.identifier
            )));
        }
        Ok(self.lookup(script))
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

// ============================================================================
// Mock Connector
// ============================================================================

/// Hands out the same [`MockConnection`] on every connect.
pub struct MockConnector {
    pub conn: Arc<MockConnection>,
    connects: AtomicUsize,
    fail: AtomicBool,
}

impl MockConnector {
    pub fn new(conn: Arc<MockConnection>) -> Self {
        Self {
            conn,
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> ConnectionResult<Arc<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::AuthenticationFailed("401 Unauthorized".to_string()));
        }
        Ok(self.conn.clone())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Remote HTTPS settings with credential passing enabled.
pub fn remote_settings() -> Settings {
    Settings {
        winrm_username: "EXAMPLE\\admin".to_string(),
        winrm_password: "s3cret$pw".to_string(),
        winrm_hostname: "dc01.example.com".to_string(),
        winrm_proto: Protocol::Https,
        winrm_pass_credentials: true,
        domain_controller: Some("dc01.example.com".to_string()),
        domain_name: Some("example.com".to_string()),
        ..Settings::default()
    }
}

/// A client over a mock pool, plus the mock and its connector.
pub fn mock_client(settings: Settings, max_sessions: usize) -> (DirectoryClient, Arc<MockConnection>, Arc<MockConnector>) {
    let conn = Arc::new(MockConnection::new("dc01.example.com"));
    let connector = Arc::new(MockConnector::new(conn.clone()));
    let pool = SessionPool::with_connector(connector.clone(), max_sessions, false);
    let client = DirectoryClient::with_pool(Arc::new(settings), pool);
    (client, conn, connector)
}

pub const USER_JSON: &str = r#"{
    "ObjectGUID": "12345678-1234-1234-1234-123456789012",
    "SamAccountName": "jdoe",
    "UserPrincipalName": "jdoe@example.com",
    "DisplayName": "John Doe",
    "DistinguishedName": "CN=John Doe,OU=Users,DC=example,DC=com",
    "Enabled": true,
    "City": null,
    "SID": {"Value": "S-1-5-21-123456789-987654321-111222333-1001"},
    "extensionAttribute1": "custom1",
    "otherMailbox": ["b@example.com", "a@example.com"]
}"#;

pub const GROUPS_JSON: &str = r#"[
    {"ObjectGUID": "group1", "Name": "Group 1", "GroupScope": 1, "GroupCategory": 1},
    {"ObjectGUID": "group2", "Name": "Group 2", "GroupScope": 2, "GroupCategory": 0}
]"#;

pub const NOT_FOUND_CLIXML: &str = "#< CLIXML\r\n<Objs Version=\"1.1.0.1\" xmlns=\"http://schemas.microsoft.com/powershell/2004/04\"><S S=\"Error\">Get-ADUser : Cannot find an object with identity: 'ghost' under: 'DC=example,DC=com'._x000D__x000A_</S><S S=\"Error\">    + CategoryInfo          : ObjectNotFound: (ghost:ADUser) [Get-ADUser], ADIdentityNotFoundException_x000D__x000A_</S></Objs>";
