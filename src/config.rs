//! Connection settings for windowsad
//!
//! Settings are assembled once per process from:
//! - Default values
//! - A configuration file (TOML, YAML, or JSON)
//! - `WINDOWSAD_*` environment variables
//!
//! and are read-only afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::Error;

/// Default WinRM port when talking HTTPS.
pub const DEFAULT_PORT: u16 = 5986;

/// Default transport deadline in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default bound on concurrently checked-out sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 8;

/// WinRM endpoint scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP. Credentials travel unprotected.
    Http,
    /// HTTP over TLS.
    #[default]
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(Error::Config(format!(
                "unsupported WinRM protocol '{}', expected http or https",
                other
            ))),
        }
    }
}

/// Connection and authentication parameters.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Account used to authenticate against WinRM
    pub winrm_username: String,

    /// Password for `winrm_username`
    pub winrm_password: String,

    /// Host running the WinRM listener
    pub winrm_hostname: String,

    /// WinRM listener port
    pub winrm_port: u16,

    /// Endpoint scheme
    pub winrm_proto: Protocol,

    /// Skip TLS certificate verification
    pub winrm_insecure: bool,

    /// Force NTLM instead of Basic over HTTPS
    pub winrm_use_ntlm: bool,

    /// Forward credentials to the directory cmdlets (HTTPS only)
    pub winrm_pass_credentials: bool,

    /// Kerberos realm; selects Kerberos when set
    pub krb_realm: Option<String>,

    /// Path to krb5.conf
    pub krb_conf: Option<PathBuf>,

    /// Path to a keytab used instead of the password
    pub krb_keytab: Option<PathBuf>,

    /// Service principal name override
    pub krb_spn: Option<String>,

    /// Domain controller the cmdlets should target
    pub domain_controller: Option<String>,

    /// Domain name used when no controller is set
    pub domain_name: Option<String>,

    /// Transport-level deadline in seconds
    pub timeout_secs: u64,

    /// Maximum number of sessions checked out at once
    pub max_sessions: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            winrm_username: String::new(),
            winrm_password: String::new(),
            winrm_hostname: String::new(),
            winrm_port: DEFAULT_PORT,
            winrm_proto: Protocol::Https,
            winrm_insecure: false,
            winrm_use_ntlm: false,
            winrm_pass_credentials: false,
            krb_realm: None,
            krb_conf: None,
            krb_keytab: None,
            krb_spn: None,
            domain_controller: None,
            domain_name: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.winrm_password.is_empty() {
            ""
        } else {
            "********"
        };
        f.debug_struct("Settings")
            .field("winrm_username", &self.winrm_username)
            .field("winrm_password", &password)
            .field("winrm_hostname", &self.winrm_hostname)
            .field("winrm_port", &self.winrm_port)
            .field("winrm_proto", &self.winrm_proto)
            .field("winrm_insecure", &self.winrm_insecure)
            .field("winrm_use_ntlm", &self.winrm_use_ntlm)
            .field("winrm_pass_credentials", &self.winrm_pass_credentials)
            .field("krb_realm", &self.krb_realm)
            .field("krb_conf", &self.krb_conf)
            .field("krb_keytab", &self.krb_keytab)
            .field("krb_spn", &self.krb_spn)
            .field("domain_controller", &self.domain_controller)
            .field("domain_name", &self.domain_name)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

impl Settings {
    /// Load settings from defaults, a configuration file, and the environment.
    ///
    /// With an explicit path only that file is read. Otherwise the first
    /// existing file among the standard locations is used, if any.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = Settings::default();

        let path = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::get_config_paths().into_iter().find(|p| p.exists()),
        };

        if let Some(path) = path {
            settings = Self::from_file(&path)?;
        }

        settings.apply_env_overrides();

        Ok(settings)
    }

    /// Standard configuration file locations, most specific first.
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(env_config) = std::env::var("WINDOWSAD_CONFIG") {
            paths.push(PathBuf::from(env_config));
        }

        paths.push(PathBuf::from("windowsad.toml"));

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("windowsad/config.toml"));
            paths.push(config_dir.join("windowsad/config.yaml"));
        }

        paths
    }

    /// Read settings from a single file, choosing the format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let settings: Settings = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            "toml" => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
            _ => toml::from_str(&content)
                .or_else(|_| serde_yaml::from_str(&content))
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        };

        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("WINDOWSAD_USER") {
            self.winrm_username = user;
        }

        if let Ok(password) = std::env::var("WINDOWSAD_PASSWORD") {
            self.winrm_password = password;
        }

        if let Ok(host) = std::env::var("WINDOWSAD_HOSTNAME") {
            self.winrm_hostname = host;
        }

        if let Ok(port) = std::env::var("WINDOWSAD_PORT") {
            match port.parse() {
                Ok(n) => self.winrm_port = n,
                Err(_) => warn!(value = %port, "Ignoring invalid WINDOWSAD_PORT"),
            }
        }

        if let Ok(proto) = std::env::var("WINDOWSAD_PROTO") {
            match proto.parse() {
                Ok(p) => self.winrm_proto = p,
                Err(_) => warn!(value = %proto, "Ignoring invalid WINDOWSAD_PROTO"),
            }
        }

        if let Some(flag) = env_flag("WINDOWSAD_WINRM_INSECURE") {
            self.winrm_insecure = flag;
        }

        if let Some(flag) = env_flag("WINDOWSAD_USE_NTLM") {
            self.winrm_use_ntlm = flag;
        }

        if let Some(flag) = env_flag("WINDOWSAD_WINRM_PASS_CREDENTIALS") {
            self.winrm_pass_credentials = flag;
        }

        if let Ok(realm) = std::env::var("WINDOWSAD_KRB_REALM") {
            self.krb_realm = non_empty(realm);
        }

        if let Ok(conf) = std::env::var("WINDOWSAD_KRB_CONF") {
            self.krb_conf = non_empty(conf).map(PathBuf::from);
        }

        if let Ok(spn) = std::env::var("WINDOWSAD_KRB_SPN") {
            self.krb_spn = non_empty(spn);
        }

        if let Ok(keytab) = std::env::var("WINDOWSAD_KRB_KEYTAB") {
            self.krb_keytab = non_empty(keytab).map(PathBuf::from);
        }

        if let Ok(dc) = std::env::var("WINDOWSAD_DC") {
            self.domain_controller = non_empty(dc);
        }

        if let Ok(domain) = std::env::var("WINDOWSAD_DOMAIN") {
            self.domain_name = non_empty(domain);
        }

        if let Ok(timeout) = std::env::var("WINDOWSAD_TIMEOUT") {
            if let Ok(n) = timeout.parse() {
                self.timeout_secs = n;
            }
        }

        if let Ok(max) = std::env::var("WINDOWSAD_MAX_SESSIONS") {
            if let Ok(n) = max.parse() {
                self.max_sessions = n;
            }
        }
    }

    /// Check that the settings can drive a transport on this platform.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !cfg!(windows) {
            if self.winrm_username.is_empty() {
                return Err(Error::Config(
                    "winrm_username is required when not running on Windows".into(),
                ));
            }
            if self.winrm_hostname.is_empty() {
                return Err(Error::Config(
                    "winrm_hostname is required when not running on Windows".into(),
                ));
            }
            if self.realm().is_none() {
                warn!("Kerberos is required for non-Windows clients; set krb_realm");
            }
        }

        if self.winrm_port == 0 {
            return Err(Error::Config("winrm_port must be non-zero".into()));
        }

        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be at least 1".into()));
        }

        Ok(())
    }

    /// The controller cmdlets should target: the explicit controller, else
    /// the domain name, else empty.
    pub fn identify_domain_controller(&self) -> String {
        self.domain_controller
            .as_deref()
            .filter(|dc| !dc.is_empty())
            .or_else(|| self.domain_name.as_deref().filter(|d| !d.is_empty()))
            .unwrap_or_default()
            .to_string()
    }

    /// True when this process runs on Windows and no remote endpoint or
    /// credentials are configured.
    ///
    /// The platform check gates first; the connection fields are only
    /// consulted on Windows.
    pub fn is_connection_type_local(&self) -> bool {
        cfg!(windows)
            && self.winrm_hostname.is_empty()
            && self.winrm_username.is_empty()
            && self.winrm_password.is_empty()
    }

    /// Credentials are forwarded to the cmdlets only over HTTPS.
    pub fn is_pass_credentials_enabled(&self) -> bool {
        self.winrm_proto == Protocol::Https && self.winrm_pass_credentials
    }

    /// The WS-Management endpoint for these settings.
    pub fn endpoint_url(&self) -> String {
        format!(
            "{}://{}:{}/wsman",
            self.winrm_proto, self.winrm_hostname, self.winrm_port
        )
    }

    /// Kerberos realm, treating an empty string as unset.
    pub fn realm(&self) -> Option<&str> {
        self.krb_realm.as_deref().filter(|r| !r.is_empty())
    }

    /// Transport deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            warn!(variable = name, value = %value, "Ignoring non-boolean environment value");
            None
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
