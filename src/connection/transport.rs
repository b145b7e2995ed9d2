//! Transport selection.
//!
//! [`select_transport`] is a pure function of [`Settings`]: it performs no
//! I/O, and the handshake for the chosen variant happens the first time a
//! session sends a request.

use async_trait::async_trait;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::local::LocalConnection;
use super::winrm::{WinRmAuth, WinRmConfig, WinRmConnection};
use super::{Connection, ConnectionError, ConnectionResult, Connector};
use crate::config::{Protocol, Settings};

/// How sessions reach the scripting host.
#[derive(Debug, Clone)]
pub enum Transport {
    /// HTTP basic authentication.
    Basic {
        username: String,
        password: SecretString,
        https: bool,
    },
    /// NTLM challenge-response over HTTPS.
    Ntlm {
        username: String,
        password: SecretString,
        domain: Option<String>,
    },
    /// Kerberos, using the keytab when provided and the password otherwise.
    Kerberos {
        username: String,
        password: Option<SecretString>,
        realm: String,
        keytab: Option<PathBuf>,
        krb_conf: Option<PathBuf>,
        spn: Option<String>,
    },
    /// PowerShell on this machine. No authentication.
    Local,
}

impl Transport {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Basic { https: true, .. } => "basic-https",
            Transport::Basic { https: false, .. } => "basic-http",
            Transport::Ntlm { .. } => "ntlm",
            Transport::Kerberos { .. } => "kerberos",
            Transport::Local => "local",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Transport::Local)
    }

    /// Credentials for the WinRM client; `None` for local execution.
    pub fn winrm_auth(&self) -> Option<WinRmAuth> {
        let auth = match self {
            Transport::Local => return None,
            Transport::Basic {
                username, password, ..
            } => WinRmAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            Transport::Ntlm {
                username,
                password,
                domain,
            } => WinRmAuth::Ntlm {
                username: username.clone(),
                password: password.clone(),
                domain: domain.clone(),
            },
            Transport::Kerberos {
                username,
                password,
                realm,
                keytab,
                krb_conf,
                spn,
            } => WinRmAuth::Kerberos {
                username: username.clone(),
                password: password.clone(),
                realm: realm.clone(),
                keytab: keytab.clone(),
                krb_conf: krb_conf.clone(),
                spn: spn.clone(),
            },
        };
        Some(auth)
    }
}

/// Choose the transport for `settings`.
///
/// | Condition                                   | Transport       |
/// |---------------------------------------------|-----------------|
/// | running on the target host                  | Local           |
/// | pass-credentials or NTLM flag, with HTTPS   | NTLM over HTTPS |
/// | Kerberos realm set                          | Kerberos        |
/// | HTTPS                                       | Basic over HTTPS|
/// | HTTP                                        | Basic over HTTP (warns) |
pub fn select_transport(settings: &Settings) -> ConnectionResult<Transport> {
    if settings.is_connection_type_local() {
        return Ok(Transport::Local);
    }

    let https = settings.winrm_proto == Protocol::Https;

    if https && (settings.winrm_pass_credentials || settings.winrm_use_ntlm) {
        let (username, domain) = split_account(&settings.winrm_username);
        require(&username, "winrm_username is required for NTLM")?;
        require(&settings.winrm_password, "winrm_password is required for NTLM")?;
        return Ok(Transport::Ntlm {
            username,
            password: secret(&settings.winrm_password),
            domain,
        });
    }

    if let Some(realm) = settings.realm() {
        require(
            &settings.winrm_username,
            "winrm_username is required for Kerberos",
        )?;
        let password = if settings.winrm_password.is_empty() {
            None
        } else {
            Some(secret(&settings.winrm_password))
        };
        if password.is_none() && settings.krb_keytab.is_none() {
            return Err(ConnectionError::InvalidConfig(
                "Kerberos needs either krb_keytab or winrm_password".into(),
            ));
        }
        return Ok(Transport::Kerberos {
            username: settings.winrm_username.clone(),
            password,
            realm: realm.to_string(),
            keytab: settings.krb_keytab.clone(),
            krb_conf: settings.krb_conf.clone(),
            spn: settings.krb_spn.clone(),
        });
    }

    require(
        &settings.winrm_username,
        "winrm_username is required for Basic authentication",
    )?;

    if !https && !is_loopback(&settings.winrm_hostname) {
        warn!(
            host = %settings.winrm_hostname,
            "Using WinRM over HTTP sends credentials unprotected; HTTPS is strongly recommended"
        );
    }

    Ok(Transport::Basic {
        username: settings.winrm_username.clone(),
        password: secret(&settings.winrm_password),
        https,
    })
}

/// Split `DOMAIN\user` or `user@domain` into its parts.
pub fn split_account(account: &str) -> (String, Option<String>) {
    if let Some((domain, user)) = account.split_once('\\') {
        (user.to_string(), Some(domain.to_string()))
    } else if let Some((user, domain)) = account.split_once('@') {
        (user.to_string(), Some(domain.to_string()))
    } else {
        (account.to_string(), None)
    }
}

fn require(value: &str, message: &str) -> ConnectionResult<()> {
    if value.is_empty() {
        Err(ConnectionError::InvalidConfig(message.to_string()))
    } else {
        Ok(())
    }
}

fn secret(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// [`Connector`] that builds sessions for the transport chosen by
/// [`select_transport`].
///
/// Selection runs once at construction; a selection error is reported on
/// every connect attempt rather than at construction.
pub struct TransportConnector {
    settings: Arc<Settings>,
    transport: Result<Transport, String>,
}

impl TransportConnector {
    pub fn new(settings: Arc<Settings>) -> Self {
        let transport = select_transport(&settings).map_err(|e| match e {
            ConnectionError::InvalidConfig(msg) => msg,
            other => other.to_string(),
        });
        if let Ok(t) = &transport {
            debug!(transport = t.name(), host = %settings.winrm_hostname, "Selected transport");
        }
        Self {
            settings,
            transport,
        }
    }

    /// The selected transport, or the configuration problem that prevented it.
    pub fn transport(&self) -> ConnectionResult<&Transport> {
        self.transport
            .as_ref()
            .map_err(|msg| ConnectionError::InvalidConfig(msg.clone()))
    }

    fn winrm_config(&self, auth: WinRmAuth) -> WinRmConfig {
        let settings = &self.settings;
        WinRmConfig {
            host: settings.winrm_hostname.clone(),
            port: settings.winrm_port,
            use_ssl: settings.winrm_proto == Protocol::Https,
            auth,
            timeout: settings.timeout_secs,
            verify_ssl: !settings.winrm_insecure,
            ..WinRmConfig::default()
        }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self) -> ConnectionResult<Arc<dyn Connection>> {
        let Some(auth) = self.transport()?.winrm_auth() else {
            return Ok(Arc::new(LocalConnection::new()));
        };

        let conn = WinRmConnection::new(self.winrm_config(auth))?;
        Ok(Arc::new(conn))
    }
}
