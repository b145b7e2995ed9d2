//! Windows Remote Management (WinRM) connection module
//!
//! Runs PowerShell on a remote Windows host through WS-Management. Each
//! command gets its own `cmd` shell: the shell is created, the command is
//! started, output is polled until the command reports `Done`, and the shell
//! is torn down again. No shell state survives between commands, so a
//! connection can be reused by any caller once released.
//!
//! # Authentication
//!
//! - **Basic**: HTTP basic credentials (use HTTPS)
//! - **NTLM**: negotiate/challenge/authenticate exchange per request
//! - **Kerberos**: AP-REQ token from the `sspi` provider, sent as
//!   `Authorization: Kerberos <token>` with each request
//!
//! # Example
//!
//! ```rust,ignore
//! use windowsad::connection::winrm::{WinRmAuth, WinRmConnectionBuilder};
//!
//! let conn = WinRmConnectionBuilder::new("dc01.example.com")
//!     .port(5986)
//!     .use_ssl(true)
//!     .auth(WinRmAuth::ntlm("EXAMPLE\\admin", "password"))
//!     .connect()
//!     .await?;
//!
//! let result = conn.execute_powershell("Get-ADDomain | ConvertTo-Json").await?;
//! ```

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use sspi::{
    AuthIdentity, BufferType, ClientRequestFlags, CredentialUse, Credentials, DataRepresentation, Kerberos,
    KerberosConfig, SecurityBuffer, Sspi, SspiImpl, Username,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{powershell_command_line, CommandResult, Connection, ConnectionError, ConnectionResult};

// ============================================================================
// Constants
// ============================================================================

/// Default WinRM HTTP port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Default WinRM HTTPS port
pub const DEFAULT_WINRM_SSL_PORT: u16 = 5986;

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT: u64 = 60;

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const IDENTIFY_RESOURCE_URI: &str = "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/*";

const ACTION_GET: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Get";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WS-Man fault code for a Receive that saw no output before OperationTimeout.
const RECEIVE_TIMED_OUT: &str = "2150858793";

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

// ============================================================================
// Authentication Types
// ============================================================================

/// WinRM authentication method
#[derive(Debug, Clone)]
pub enum WinRmAuth {
    /// Basic authentication
    Basic {
        username: String,
        password: SecretString,
    },
    /// NTLM authentication (Windows challenge-response)
    Ntlm {
        username: String,
        password: SecretString,
        domain: Option<String>,
    },
    /// Kerberos authentication
    Kerberos {
        username: String,
        password: Option<SecretString>,
        realm: String,
        keytab: Option<PathBuf>,
        krb_conf: Option<PathBuf>,
        spn: Option<String>,
    },
}

impl WinRmAuth {
    /// Create NTLM authentication, splitting `DOMAIN\user` or `user@domain`
    pub fn ntlm(username: impl Into<String>, password: impl Into<String>) -> Self {
        let (user, domain) = super::transport::split_account(&username.into());
        WinRmAuth::Ntlm {
            username: user,
            password: SecretString::from(password.into()),
            domain,
        }
    }

    /// Create Basic authentication
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        WinRmAuth::Basic {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Create password-based Kerberos authentication
    pub fn kerberos(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        WinRmAuth::Kerberos {
            username: username.into(),
            password: Some(SecretString::from(password.into())),
            realm: realm.into(),
            keytab: None,
            krb_conf: None,
            spn: None,
        }
    }

    /// Get the authentication scheme name
    pub fn scheme(&self) -> &'static str {
        match self {
            WinRmAuth::Basic { .. } => "Basic",
            WinRmAuth::Ntlm { .. } => "Negotiate",
            WinRmAuth::Kerberos { .. } => "Kerberos",
        }
    }

    /// Get the username
    pub fn username(&self) -> &str {
        match self {
            WinRmAuth::Basic { username, .. }
            | WinRmAuth::Ntlm { username, .. }
            | WinRmAuth::Kerberos { username, .. } => username,
        }
    }
}

// ============================================================================
// NTLM Authentication
// ============================================================================

/// Builds NTLM negotiate and authenticate messages.
#[derive(Debug, Clone)]
pub struct NtlmAuthenticator {
    username: String,
    password: SecretString,
    domain: String,
    workstation: String,
}

impl NtlmAuthenticator {
    pub fn new(username: impl Into<String>, password: SecretString, domain: Option<String>) -> Self {
        let workstation = hostname::get()
            .map(|h| h.to_string_lossy().to_uppercase())
            .unwrap_or_else(|_| "WORKSTATION".to_string());

        Self {
            username: username.into(),
            password,
            domain: domain.unwrap_or_default(),
            workstation,
        }
    }

    /// Type 1 (Negotiate) message
    pub fn create_negotiate_message(&self) -> Vec<u8> {
        let mut message = b"NTLMSSP\0".to_vec();
        message.extend_from_slice(&1u32.to_le_bytes());

        // UNICODE | OEM | REQUEST_TARGET | NTLM | ALWAYS_SIGN | EXTENDED_SESSIONSECURITY
        let flags: u32 = 0x0000_0001 | 0x0000_0002 | 0x0000_0004 | 0x0000_0200 | 0x0000_8000
            | 0x0008_0000;
        message.extend_from_slice(&flags.to_le_bytes());

        let domain = self.domain.as_bytes();
        let workstation = self.workstation.as_bytes();
        let workstation_offset: u32 = 32;
        let domain_offset = workstation_offset + workstation.len() as u32;

        push_security_buffer(&mut message, domain.len() as u16, domain_offset);
        push_security_buffer(&mut message, workstation.len() as u16, workstation_offset);

        message.extend_from_slice(workstation);
        message.extend_from_slice(domain);
        message
    }

    /// Type 3 (Authenticate) message answering `challenge`
    pub fn create_authenticate_message(&self, challenge: &[u8]) -> ConnectionResult<Vec<u8>> {
        if challenge.len() < 32 || &challenge[..8] != b"NTLMSSP\0" {
            return Err(ConnectionError::AuthenticationFailed(
                "Invalid NTLM challenge message".to_string(),
            ));
        }

        let server_challenge = &challenge[24..32];
        let client_challenge: [u8; 8] = rand::random();
        let ntlmv2_hash = self.ntlmv2_hash();

        let nt_response = ntlmv2_response(&ntlmv2_hash, server_challenge, &client_challenge);
        let lm_response = lmv2_response(&ntlmv2_hash, server_challenge, &client_challenge);

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.username);
        let workstation = utf16le(&self.workstation);

        let lm_offset: u32 = 88;
        let nt_offset = lm_offset + lm_response.len() as u32;
        let domain_offset = nt_offset + nt_response.len() as u32;
        let user_offset = domain_offset + domain.len() as u32;
        let workstation_offset = user_offset + user.len() as u32;
        let session_key_offset = workstation_offset + workstation.len() as u32;

        let mut message = b"NTLMSSP\0".to_vec();
        message.extend_from_slice(&3u32.to_le_bytes());
        push_security_buffer(&mut message, lm_response.len() as u16, lm_offset);
        push_security_buffer(&mut message, nt_response.len() as u16, nt_offset);
        push_security_buffer(&mut message, domain.len() as u16, domain_offset);
        push_security_buffer(&mut message, user.len() as u16, user_offset);
        push_security_buffer(&mut message, workstation.len() as u16, workstation_offset);
        push_security_buffer(&mut message, 0, session_key_offset);

        let flags: u32 = 0x0000_0001 | 0x0000_0200 | 0x0000_8000 | 0x0008_0000;
        message.extend_from_slice(&flags.to_le_bytes());
        // Version and MIC, left zeroed.
        message.extend_from_slice(&[0u8; 8]);
        message.extend_from_slice(&[0u8; 16]);

        message.extend_from_slice(&lm_response);
        message.extend_from_slice(&nt_response);
        message.extend_from_slice(&domain);
        message.extend_from_slice(&user);
        message.extend_from_slice(&workstation);

        Ok(message)
    }

    /// HMAC-MD5(NT hash, uppercase(user) + uppercase(domain))
    fn ntlmv2_hash(&self) -> [u8; 16] {
        let identity = format!(
            "{}{}",
            self.username.to_uppercase(),
            self.domain.to_uppercase()
        );
        hmac_md5(&self.nt_hash(), &utf16le(&identity))
    }

    /// MD4 of the UTF-16LE password
    fn nt_hash(&self) -> [u8; 16] {
        use md4::{Digest, Md4};

        let mut hasher = Md4::new();
        hasher.update(utf16le(self.password.expose_secret()));

        let mut hash = [0u8; 16];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }
}

fn ntlmv2_response(hash: &[u8; 16], server_challenge: &[u8], client_challenge: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32);
    blob.extend_from_slice(&0x0101u32.to_le_bytes());
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob.extend_from_slice(&windows_timestamp().to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&0u32.to_le_bytes());

    let mut data = server_challenge.to_vec();
    data.extend_from_slice(&blob);

    let mut response = hmac_md5(hash, &data).to_vec();
    response.extend_from_slice(&blob);
    response
}

fn lmv2_response(hash: &[u8; 16], server_challenge: &[u8], client_challenge: &[u8]) -> Vec<u8> {
    let mut data = server_challenge.to_vec();
    data.extend_from_slice(client_challenge);

    let mut response = hmac_md5(hash, &data).to_vec();
    response.extend_from_slice(client_challenge);
    response
}

fn push_security_buffer(message: &mut Vec<u8>, len: u16, offset: u32) {
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&offset.to_le_bytes());
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut key_block = [0u8; 64];
    if key.len() > 64 {
        key_block[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Vec::with_capacity(64 + data.len());
    inner.extend(key_block.iter().map(|b| b ^ 0x36));
    inner.extend_from_slice(data);
    let inner_hash = md5::compute(&inner);

    let mut outer = Vec::with_capacity(80);
    outer.extend(key_block.iter().map(|b| b ^ 0x5c));
    outer.extend_from_slice(&inner_hash.0);
    md5::compute(&outer).0
}

/// Current time as a Windows FILETIME (100ns ticks since 1601-01-01)
fn windows_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    const EPOCH_DIFF: u64 = 11_644_473_600;
    const TICKS_PER_SECOND: u64 = 10_000_000;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    (now + EPOCH_DIFF) * TICKS_PER_SECOND
}

// ============================================================================
// Kerberos Authentication
// ============================================================================

/// Produces Kerberos AP-REQ tokens through the SSPI provider.
///
/// Each token is built from scratch: a TGT and a service ticket are
/// requested from the KDC on every call. The KDC comes from the realm's
/// `kdc` entry in `krb_conf` when one is configured, and from DNS SRV
/// records otherwise.
#[derive(Debug, Clone)]
pub struct KerberosAuthenticator {
    username: String,
    realm: String,
    password: Option<SecretString>,
    keytab: Option<PathBuf>,
    krb_conf: Option<PathBuf>,
    spn: String,
    client_computer_name: String,
}

impl KerberosAuthenticator {
    /// `spn` defaults to `HTTP/<host>`.
    pub fn new(
        username: &str,
        realm: impl Into<String>,
        password: Option<SecretString>,
        keytab: Option<PathBuf>,
        krb_conf: Option<PathBuf>,
        spn: Option<String>,
        host: &str,
    ) -> Self {
        let (username, _) = super::transport::split_account(username);
        let client_computer_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self {
            username,
            realm: realm.into(),
            password,
            keytab,
            krb_conf,
            spn: spn.unwrap_or_else(|| format!("HTTP/{}", host)),
            client_computer_name,
        }
    }

    pub fn spn(&self) -> &str {
        &self.spn
    }

    /// KDC address from `krb_conf`, as a URL the provider accepts.
    fn kdc_url(&self) -> ConnectionResult<Option<reqwest::Url>> {
        let Some(path) = &self.krb_conf else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConnectionError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        match kdc_from_krb5_conf(&text, &self.realm) {
            Some(kdc) => {
                let url = if kdc.contains("://") { kdc } else { format!("tcp://{}", kdc) };
                reqwest::Url::parse(&url).map(Some).map_err(|e| {
                    ConnectionError::InvalidConfig(format!("Invalid KDC address {}: {}", url, e))
                })
            }
            None => Ok(None),
        }
    }

    /// Build the initial context token for the service. Blocks on KDC I/O.
    pub fn initial_token(&self) -> ConnectionResult<Vec<u8>> {
        let password = self.password.as_ref().ok_or_else(|| {
            ConnectionError::AuthenticationFailed(format!(
                "Kerberos for {}@{} has only a keytab ({}); the SSPI provider needs winrm_password",
                self.username,
                self.realm,
                self.keytab.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
            ))
        })?;

        let username = Username::new(&self.username, Some(&self.realm)).map_err(kerberos_error)?;
        let credentials = Credentials::AuthIdentity(AuthIdentity {
            username,
            password: password.expose_secret().to_string().into(),
        });

        let mut kerberos = Kerberos::new_client_from_config(KerberosConfig {
            kdc_url: self.kdc_url()?,
            client_computer_name: Some(self.client_computer_name.clone()),
        })
        .map_err(kerberos_error)?;

        let mut acquired = kerberos
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&credentials)
            .execute(&mut kerberos)
            .map_err(kerberos_error)?;

        let mut output = vec![SecurityBuffer::new(Vec::new(), BufferType::Token)];
        {
            let mut builder = kerberos
                .initialize_security_context()
                .with_credentials_handle(&mut acquired.credentials_handle)
                .with_context_requirements(ClientRequestFlags::empty())
                .with_target_data_representation(DataRepresentation::Native)
                .with_target_name(&self.spn)
                .with_output(&mut output);
            kerberos
                .initialize_security_context_impl(&mut builder)
                .map_err(kerberos_error)?
                .resolve_with_default_network_client()
                .map_err(kerberos_error)?;
        }

        output
            .pop()
            .map(|b| b.buffer)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ConnectionError::AuthenticationFailed("Kerberos produced an empty token".into())
            })
    }
}

fn kerberos_error(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::AuthenticationFailed(format!("Kerberos handshake failed: {}", e))
}

/// First `kdc` entry of `realm` in a krb5.conf `[realms]` section.
pub fn kdc_from_krb5_conf(text: &str, realm: &str) -> Option<String> {
    let mut in_realms = false;
    let mut in_realm = false;

    for line in text.lines() {
        let line = line.split(['#', ';']).next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            in_realms = line.eq_ignore_ascii_case("[realms]");
            in_realm = false;
            continue;
        }
        if !in_realms {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let (key, value) = (key.trim(), value.trim());
            if value == "{" {
                in_realm = key.eq_ignore_ascii_case(realm);
            } else if in_realm && key.eq_ignore_ascii_case("kdc") && !value.is_empty() {
                return Some(value.to_string());
            }
        } else if line == "}" {
            in_realm = false;
        }
    }
    None
}

// ============================================================================
// WinRM Configuration
// ============================================================================

/// WinRM connection configuration
#[derive(Debug, Clone)]
pub struct WinRmConfig {
    /// Target hostname or IP address
    pub host: String,
    /// WinRM port
    pub port: u16,
    /// Use HTTPS instead of HTTP
    pub use_ssl: bool,
    /// Authentication method
    pub auth: WinRmAuth,
    /// Request timeout in seconds
    pub timeout: u64,
    /// Verify TLS certificates
    pub verify_ssl: bool,
    /// Maximum envelope size
    pub max_envelope_size: u32,
    /// Receive operation timeout (ISO 8601 duration)
    pub operation_timeout: String,
    /// Code page for console output
    pub codepage: u32,
}

impl Default for WinRmConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_WINRM_SSL_PORT,
            use_ssl: true,
            auth: WinRmAuth::basic("", ""),
            timeout: DEFAULT_TIMEOUT,
            verify_ssl: true,
            max_envelope_size: 153_600,
            operation_timeout: "PT20S".to_string(),
            codepage: 65001,
        }
    }
}

impl WinRmConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Get the WinRM endpoint URL
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}/wsman", scheme, self.host, self.port)
    }
}

// ============================================================================
// SOAP Envelopes
// ============================================================================

/// Shell-scoped parts of an envelope header.
struct Envelope<'a> {
    action: &'a str,
    resource_uri: &'a str,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, String)],
    body: &'a str,
}

impl WinRmConfig {
    fn render(&self, envelope: &Envelope<'_>) -> String {
        let selector = envelope
            .shell_id
            .map(|id| {
                format!(
                    r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                    xml_escape(id)
                )
            })
            .unwrap_or_default();

        let options = if envelope.options.is_empty() {
            String::new()
        } else {
            let items: String = envelope
                .options
                .iter()
                .map(|(name, value)| {
                    format!(r#"<w:Option Name="{}">{}</w:Option>"#, name, xml_escape(value))
                })
                .collect();
            format!("<w:OptionSet>{}</w:OptionSet>", items)
        };

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{to}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>
    <a:ReplyTo><a:Address s:mustUnderstand="true">{ANONYMOUS}</a:Address></a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{max_size}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{op_timeout}</w:OperationTimeout>
    {selector}{options}
  </s:Header>
  <s:Body>{body}</s:Body>
</s:Envelope>"#,
            to = self.endpoint_url(),
            resource = envelope.resource_uri,
            action = envelope.action,
            message_id = Uuid::new_v4(),
            max_size = self.max_envelope_size,
            op_timeout = self.operation_timeout,
            body = envelope.body,
        )
    }
}

// ============================================================================
// Response Parsing
// ============================================================================

/// One Receive response worth of output.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReceiveChunk {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    done: bool,
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().into_inner() == name)
        .map(|a| String::from_utf8_lossy(&a.value).to_string())
}

fn is_done(e: &quick_xml::events::BytesStart<'_>) -> bool {
    attribute(e, b"State").is_some_and(|s| s.ends_with("/Done"))
}

fn parse_receive(xml: &str) -> ConnectionResult<ReceiveChunk> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut chunk = ReceiveChunk::default();
    let mut stream: Option<String> = None;
    let mut in_exit_code = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().into_inner() {
                b"Stream" => stream = attribute(e, b"Name"),
                b"CommandState" => chunk.done |= is_done(e),
                b"ExitCode" => in_exit_code = true,
                _ => {}
            },
            // An empty Stream only marks end of stream.
            Ok(Event::Empty(ref e)) => {
                if e.local_name().into_inner() == b"CommandState" {
                    chunk.done |= is_done(e);
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|err| {
                    ConnectionError::ExecutionFailed(format!("Malformed Receive response: {}", err))
                })?;
                if in_exit_code {
                    chunk.exit_code = text.trim().parse().ok();
                } else if let Some(name) = &stream {
                    let bytes = BASE64_STANDARD.decode(text.trim()).map_err(|err| {
                        ConnectionError::ExecutionFailed(format!("Invalid {} chunk: {}", name, err))
                    })?;
                    match name.as_str() {
                        "stdout" => chunk.stdout.extend(bytes),
                        "stderr" => chunk.stderr.extend(bytes),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().into_inner() {
                b"Stream" => stream = None,
                b"ExitCode" => in_exit_code = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(ConnectionError::ExecutionFailed(format!(
                    "Malformed Receive response: {}",
                    err
                )))
            }
            _ => {}
        }
    }

    Ok(chunk)
}

/// Text of the first element with local name `name`.
fn element_text(xml: &str, name: &[u8]) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut inside = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.local_name().into_inner() == name => inside = true,
            Ok(Event::Text(ref e)) if inside => {
                return e.unescape().ok().map(|t| t.to_string());
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

// ============================================================================
// WinRM Connection
// ============================================================================

/// WinRM connection for running PowerShell on a Windows host
pub struct WinRmConnection {
    config: WinRmConfig,
    client: Client,
    ntlm_auth: Option<NtlmAuthenticator>,
    kerberos_auth: Option<KerberosAuthenticator>,
}

impl WinRmConnection {
    /// Build a connection without contacting the host.
    pub fn new(config: WinRmConfig) -> ConnectionResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        let ntlm_auth = match &config.auth {
            WinRmAuth::Ntlm {
                username,
                password,
                domain,
            } => Some(NtlmAuthenticator::new(
                username.clone(),
                password.clone(),
                domain.clone(),
            )),
            _ => None,
        };

        let kerberos_auth = match &config.auth {
            WinRmAuth::Kerberos {
                username,
                password,
                realm,
                keytab,
                krb_conf,
                spn,
            } => Some(KerberosAuthenticator::new(
                username,
                realm.clone(),
                password.clone(),
                keytab.clone(),
                krb_conf.clone(),
                spn.clone(),
                &config.host,
            )),
            _ => None,
        };

        Ok(Self {
            config,
            client,
            ntlm_auth,
            kerberos_auth,
        })
    }

    /// Build a connection and verify the endpoint answers.
    pub async fn connect(config: WinRmConfig) -> ConnectionResult<Self> {
        let conn = Self::new(config)?;
        conn.test_connection().await?;
        Ok(conn)
    }

    pub fn config(&self) -> &WinRmConfig {
        &self.config
    }

    async fn test_connection(&self) -> ConnectionResult<()> {
        debug!(host = %self.config.host, "Testing WinRM connection");

        let envelope = self.config.render(&Envelope {
            action: ACTION_GET,
            resource_uri: IDENTIFY_RESOURCE_URI,
            shell_id: None,
            options: &[],
            body: "",
        });
        self.post(&envelope, "identify").await?;

        debug!(host = %self.config.host, "WinRM connection test successful");
        Ok(())
    }

    /// Send an authenticated request
    async fn send_request(&self, body: &str) -> ConnectionResult<Response> {
        let url = self.config.endpoint_url();

        match &self.config.auth {
            WinRmAuth::Basic { username, password } => self
                .client
                .post(&url)
                .basic_auth(username, Some(password.expose_secret()))
                .header("Content-Type", SOAP_CONTENT_TYPE)
                .body(body.to_string())
                .send()
                .await
                .map_err(|e| request_error(&self.config, e)),
            WinRmAuth::Ntlm { .. } => self.send_ntlm_request(body).await,
            WinRmAuth::Kerberos { .. } => self.send_kerberos_request(body).await,
        }
    }

    async fn send_kerberos_request(&self, body: &str) -> ConnectionResult<Response> {
        let auth = self.kerberos_auth.clone().ok_or_else(|| {
            ConnectionError::AuthenticationFailed("Kerberos authenticator not initialized".to_string())
        })?;
        debug!(spn = %auth.spn(), "Requesting Kerberos service ticket");

        // The provider talks to the KDC with blocking I/O.
        let token = tokio::task::spawn_blocking(move || auth.initial_token())
            .await
            .map_err(|e| ConnectionError::AuthenticationFailed(format!("Kerberos task failed: {}", e)))??;

        self.client
            .post(self.config.endpoint_url())
            .header("Authorization", format!("Kerberos {}", BASE64_STANDARD.encode(token)))
            .header("Content-Type", SOAP_CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| request_error(&self.config, e))
    }

    async fn send_ntlm_request(&self, body: &str) -> ConnectionResult<Response> {
        let url = self.config.endpoint_url();
        let auth = self.ntlm_auth.as_ref().ok_or_else(|| {
            ConnectionError::AuthenticationFailed("NTLM authenticator not initialized".to_string())
        })?;

        let negotiate = BASE64_STANDARD.encode(auth.create_negotiate_message());
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Negotiate {}", negotiate))
            .header("Content-Type", SOAP_CONTENT_TYPE)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| request_error(&self.config, e))?;

        if response.status().as_u16() != 401 {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "Expected 401 challenge response, got {}",
                response.status()
            )));
        }

        let challenge = response
            .headers()
            .get_all("WWW-Authenticate")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| v.strip_prefix("Negotiate "))
            .ok_or_else(|| {
                ConnectionError::AuthenticationFailed(
                    "No Negotiate challenge in WWW-Authenticate".to_string(),
                )
            })?;
        let challenge = BASE64_STANDARD.decode(challenge.trim()).map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Invalid challenge encoding: {}", e))
        })?;

        let authenticate = BASE64_STANDARD.encode(auth.create_authenticate_message(&challenge)?);

        self.client
            .post(&url)
            .header("Authorization", format!("Negotiate {}", authenticate))
            .header("Content-Type", SOAP_CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| request_error(&self.config, e))
    }

    /// Send `envelope` and return the body of a successful response.
    async fn post(&self, envelope: &str, step: &str) -> ConnectionResult<String> {
        let response = self.send_request(envelope).await?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to read {} response: {}", step, e))
        })?;

        match status.as_u16() {
            200..=299 => Ok(body),
            401 => Err(ConnectionError::AuthenticationFailed(format!(
                "{} rejected credentials for {}",
                self.config.host,
                self.config.auth.username()
            ))),
            _ => Err(ConnectionError::ExecutionFailed(format!(
                "WinRM {} failed: {} - {}",
                step, status, body
            ))),
        }
    }

    async fn create_shell(&self) -> ConnectionResult<String> {
        let options = [
            ("WINRS_NOPROFILE", "TRUE".to_string()),
            ("WINRS_CODEPAGE", self.config.codepage.to_string()),
        ];
        let envelope = self.config.render(&Envelope {
            action: ACTION_CREATE,
            resource_uri: SHELL_RESOURCE_URI,
            shell_id: None,
            options: &options,
            body: "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
                   <rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>",
        });

        let body = self.post(&envelope, "create shell").await?;
        let shell_id = element_text(&body, b"ShellId")
            .or_else(|| element_text(&body, b"Selector"))
            .ok_or_else(|| {
                ConnectionError::ExecutionFailed("Failed to parse shell ID from response".into())
            })?;

        debug!(shell_id = %shell_id, "Created WinRM shell");
        Ok(shell_id)
    }

    async fn run_command(&self, shell_id: &str, command: &str) -> ConnectionResult<String> {
        let options = [("WINRS_CONSOLEMODE_STDIN", "TRUE".to_string())];
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(command)
        );
        let envelope = self.config.render(&Envelope {
            action: ACTION_COMMAND,
            resource_uri: SHELL_RESOURCE_URI,
            shell_id: Some(shell_id),
            options: &options,
            body: &body,
        });

        let body = self.post(&envelope, "command").await?;
        element_text(&body, b"CommandId").ok_or_else(|| {
            ConnectionError::ExecutionFailed("Failed to parse command ID from response".into())
        })
    }

    async fn receive_output(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> ConnectionResult<(String, String, i32)> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0i32;

        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            xml_escape(command_id)
        );

        loop {
            let envelope = self.config.render(&Envelope {
                action: ACTION_RECEIVE,
                resource_uri: SHELL_RESOURCE_URI,
                shell_id: Some(shell_id),
                options: &[],
                body: &body,
            });

            let response = match self.post(&envelope, "receive").await {
                Ok(response) => response,
                // Long-running command with nothing to report yet.
                Err(ConnectionError::ExecutionFailed(msg)) if msg.contains(RECEIVE_TIMED_OUT) => {
                    trace!(command_id = %command_id, "Receive timed out, polling again");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let chunk = parse_receive(&response)?;
            stdout.extend(chunk.stdout);
            stderr.extend(chunk.stderr);
            if let Some(code) = chunk.exit_code {
                exit_code = code;
            }
            if chunk.done {
                break;
            }
        }

        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        ))
    }

    async fn signal_terminate(&self, shell_id: &str, command_id: &str) -> ConnectionResult<()> {
        let body = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
            xml_escape(command_id),
            SIGNAL_TERMINATE
        );
        let envelope = self.config.render(&Envelope {
            action: ACTION_SIGNAL,
            resource_uri: SHELL_RESOURCE_URI,
            shell_id: Some(shell_id),
            options: &[],
            body: &body,
        });
        self.post(&envelope, "signal").await.map(|_| ())
    }

    async fn delete_shell(&self, shell_id: &str) -> ConnectionResult<()> {
        let envelope = self.config.render(&Envelope {
            action: ACTION_DELETE,
            resource_uri: SHELL_RESOURCE_URI,
            shell_id: Some(shell_id),
            options: &[],
            body: "",
        });
        self.post(&envelope, "delete shell").await?;
        debug!(shell_id = %shell_id, "Deleted WinRM shell");
        Ok(())
    }
}

fn request_error(config: &WinRmConfig, e: reqwest::Error) -> ConnectionError {
    if e.is_timeout() {
        ConnectionError::Timeout(config.timeout)
    } else {
        ConnectionError::ConnectionFailed(format!(
            "HTTP request to {} failed: {}",
            config.endpoint_url(),
            e
        ))
    }
}

impl std::fmt::Debug for WinRmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmConnection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("use_ssl", &self.config.use_ssl)
            .field("auth", &self.config.auth.scheme())
            .finish()
    }
}

#[async_trait]
impl Connection for WinRmConnection {
    fn identifier(&self) -> &str {
        &self.config.host
    }

    async fn is_alive(&self) -> bool {
        self.test_connection().await.is_ok()
    }

    async fn execute_powershell(&self, script: &str) -> ConnectionResult<CommandResult> {
        debug!(host = %self.config.host, "Executing WinRM command");

        let command_line = powershell_command_line("powershell.exe", script);
        let shell_id = self.create_shell().await?;

        let output = async {
            let command_id = self.run_command(&shell_id, &command_line).await?;
            let output = self.receive_output(&shell_id, &command_id).await;
            if let Err(e) = self.signal_terminate(&shell_id, &command_id).await {
                warn!(shell_id = %shell_id, error = %e, "Failed to signal command termination");
            }
            output
        }
        .await;

        if let Err(e) = self.delete_shell(&shell_id).await {
            warn!(shell_id = %shell_id, error = %e, "Failed to delete shell");
        }

        let (stdout, stderr, exit_code) = output?;

        trace!(
            exit_code = %exit_code,
            stdout_len = %stdout.len(),
            stderr_len = %stderr.len(),
            "WinRM command completed"
        );

        Ok(CommandResult::from_exit_code(exit_code, stdout, stderr))
    }

    async fn close(&self) -> ConnectionResult<()> {
        // Shells are deleted after every command; nothing is held open.
        debug!(host = %self.config.host, "Closing WinRM connection");
        Ok(())
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for WinRM connections
#[derive(Debug, Clone)]
pub struct WinRmConnectionBuilder {
    config: WinRmConfig,
}

impl WinRmConnectionBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: WinRmConfig::new(host),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Switch scheme, moving the port to the scheme default if it was unset.
    pub fn use_ssl(mut self, use_ssl: bool) -> Self {
        let default_port = |ssl| if ssl { DEFAULT_WINRM_SSL_PORT } else { DEFAULT_WINRM_PORT };
        if self.config.port == default_port(self.config.use_ssl) {
            self.config.port = default_port(use_ssl);
        }
        self.config.use_ssl = use_ssl;
        self
    }

    pub fn auth(mut self, auth: WinRmAuth) -> Self {
        self.config.auth = auth;
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn verify_ssl(mut self, verify: bool) -> Self {
        self.config.verify_ssl = verify;
        self
    }

    pub fn codepage(mut self, codepage: u32) -> Self {
        self.config.codepage = codepage;
        self
    }

    pub fn build(self) -> ConnectionResult<WinRmConnection> {
        WinRmConnection::new(self.config)
    }

    pub async fn connect(self) -> ConnectionResult<WinRmConnection> {
        WinRmConnection::connect(self.config).await
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_winrm_auth_ntlm_parse() {
        match WinRmAuth::ntlm("EXAMPLE\\admin", "pw") {
            WinRmAuth::Ntlm {
                username, domain, ..
            } => {
                assert_eq!(username, "admin");
                assert_eq!(domain.as_deref(), Some("EXAMPLE"));
            }
            _ => panic!("expected NTLM auth"),
        }
    }

    #[test]
    fn test_winrm_config_endpoint() {
        let mut config = WinRmConfig::new("dc01.example.com");
        assert_eq!(config.endpoint_url(), "https://dc01.example.com:5986/wsman");

        config.use_ssl = false;
        config.port = 5985;
        assert_eq!(config.endpoint_url(), "http://dc01.example.com:5985/wsman");
    }

    #[test]
    fn test_builder_moves_default_port_with_scheme() {
        let builder = WinRmConnectionBuilder::new("dc01").use_ssl(false);
        assert_eq!(builder.config.port, DEFAULT_WINRM_PORT);

        let builder = WinRmConnectionBuilder::new("dc01").port(8443).use_ssl(false);
        assert_eq!(builder.config.port, 8443);
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn test_ntlm_negotiate_message() {
        let auth = NtlmAuthenticator::new("admin", SecretString::from("pw".to_string()), None);
        let msg = auth.create_negotiate_message();
        assert_eq!(&msg[..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]), 1);
    }

    #[test]
    fn test_ntlm_rejects_short_challenge() {
        let auth = NtlmAuthenticator::new("admin", SecretString::from("pw".to_string()), None);
        assert!(auth.create_authenticate_message(b"NTLMSSP\0").is_err());
    }

    #[test]
    fn test_nt_hash_known_value() {
        // MD4(UTF-16LE("password"))
        let auth =
            NtlmAuthenticator::new("user", SecretString::from("password".to_string()), None);
        let expected = [
            0x88, 0x46, 0xf7, 0xea, 0xee, 0x8f, 0xb1, 0x17, 0xad, 0x06, 0xbd, 0xd8, 0x30, 0xb7,
            0x58, 0x6c,
        ];
        assert_eq!(auth.nt_hash(), expected);
    }

    #[test]
    fn test_envelope_contains_shell_selector() {
        let config = WinRmConfig::new("dc01");
        let xml = config.render(&Envelope {
            action: ACTION_RECEIVE,
            resource_uri: SHELL_RESOURCE_URI,
            shell_id: Some("ABC-123"),
            options: &[],
            body: "",
        });
        assert!(xml.contains(r#"<w:Selector Name="ShellId">ABC-123</w:Selector>"#));
        assert!(xml.contains(ACTION_RECEIVE));
        assert!(xml.contains("<a:To>https://dc01:5986/wsman</a:To>"));
    }

    #[test]
    fn test_parse_receive_collects_streams() {
        let out = BASE64_STANDARD.encode("hello ");
        let out2 = BASE64_STANDARD.encode("world");
        let err = BASE64_STANDARD.encode("oops");
        let xml = format!(
            r#"<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:rsp="{SHELL_NS}"><s:Body>
            <rsp:ReceiveResponse>
              <rsp:Stream Name="stdout" CommandId="C1">{out}</rsp:Stream>
              <rsp:Stream Name="stdout" CommandId="C1">{out2}</rsp:Stream>
              <rsp:Stream Name="stderr" CommandId="C1">{err}</rsp:Stream>
              <rsp:Stream Name="stdout" CommandId="C1" End="true"></rsp:Stream>
              <rsp:CommandState CommandId="C1" State="{SHELL_NS}/CommandState/Done">
                <rsp:ExitCode>2</rsp:ExitCode>
              </rsp:CommandState>
            </rsp:ReceiveResponse></s:Body></s:Envelope>"#
        );

        let chunk = parse_receive(&xml).unwrap();
        assert_eq!(chunk.stdout, b"hello world");
        assert_eq!(chunk.stderr, b"oops");
        assert_eq!(chunk.exit_code, Some(2));
        assert!(chunk.done);
    }

    #[test]
    fn test_parse_receive_running_state() {
        let xml = format!(
            r#"<rsp:ReceiveResponse xmlns:rsp="{SHELL_NS}">
              <rsp:CommandState CommandId="C1" State="{SHELL_NS}/CommandState/Running"/>
            </rsp:ReceiveResponse>"#
        );
        let chunk = parse_receive(&xml).unwrap();
        assert!(!chunk.done);
        assert_eq!(chunk.exit_code, None);
    }

    #[test]
    fn test_element_text() {
        let xml = r#"<s:Envelope xmlns:s="x" xmlns:rsp="y"><s:Body><rsp:CommandResponse><rsp:CommandId>CMD-1</rsp:CommandId></rsp:CommandResponse></s:Body></s:Envelope>"#;
        assert_eq!(element_text(xml, b"CommandId").as_deref(), Some("CMD-1"));
        assert_eq!(element_text(xml, b"ShellId"), None);
    }

    #[test]
    fn test_kdc_from_krb5_conf() {
        let conf = "\
[libdefaults]
    default_realm = EXAMPLE.COM
    kdc = ignored.example.com

[realms]
    OTHER.COM = {
        kdc = kdc.other.com
    }
    EXAMPLE.COM = {
        # primary
        kdc = dc01.example.com:88
        kdc = dc02.example.com:88
        admin_server = dc01.example.com
    }
";
        assert_eq!(kdc_from_krb5_conf(conf, "EXAMPLE.COM").as_deref(), Some("dc01.example.com:88"));
        assert_eq!(kdc_from_krb5_conf(conf, "example.com").as_deref(), Some("dc01.example.com:88"));
        assert_eq!(kdc_from_krb5_conf(conf, "OTHER.COM").as_deref(), Some("kdc.other.com"));
        assert_eq!(kdc_from_krb5_conf(conf, "MISSING.COM"), None);
    }

    #[test]
    fn test_kerberos_spn_defaults_to_http_service() {
        let auth = KerberosAuthenticator::new("EXAMPLE\\admin", "EXAMPLE.COM", None, None, None, None, "dc01.example.com");
        assert_eq!(auth.spn(), "HTTP/dc01.example.com");
        assert_eq!(auth.username, "admin");

        let auth = KerberosAuthenticator::new(
            "admin",
            "EXAMPLE.COM",
            None,
            None,
            None,
            Some("WSMAN/dc01".into()),
            "dc01.example.com",
        );
        assert_eq!(auth.spn(), "WSMAN/dc01");
    }

    #[test]
    fn test_kerberos_kdc_url_from_conf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("krb5.conf");
        std::fs::write(&path, "[realms]\nEXAMPLE.COM = {\n kdc = dc01.example.com:88\n}\n").unwrap();

        let auth = KerberosAuthenticator::new("admin", "EXAMPLE.COM", None, None, Some(path), None, "dc01");
        let url = auth.kdc_url().unwrap().unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.host_str(), Some("dc01.example.com"));
        assert_eq!(url.port(), Some(88));
    }
}
