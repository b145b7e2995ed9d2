//! Settings loading tests: files in each format and environment overrides.

use serial_test::serial;
use std::path::PathBuf;
use tempfile::tempdir;
use windowsad::config::{Protocol, Settings, DEFAULT_MAX_SESSIONS, DEFAULT_PORT};

const ENV_VARS: &[&str] = &[
    "WINDOWSAD_CONFIG",
    "WINDOWSAD_USER",
    "WINDOWSAD_PASSWORD",
    "WINDOWSAD_HOSTNAME",
    "WINDOWSAD_PORT",
    "WINDOWSAD_PROTO",
    "WINDOWSAD_WINRM_INSECURE",
    "WINDOWSAD_USE_NTLM",
    "WINDOWSAD_WINRM_PASS_CREDENTIALS",
    "WINDOWSAD_KRB_REALM",
    "WINDOWSAD_KRB_CONF",
    "WINDOWSAD_KRB_SPN",
    "WINDOWSAD_KRB_KEYTAB",
    "WINDOWSAD_DC",
    "WINDOWSAD_DOMAIN",
    "WINDOWSAD_TIMEOUT",
    "WINDOWSAD_MAX_SESSIONS",
];

fn clear_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

// ============================================================================
// File Formats
// ============================================================================

#[test]
#[serial]
fn test_load_toml() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("windowsad.toml");
    std::fs::write(
        &path,
        r#"
winrm_username = "admin"
winrm_password = "secret"
winrm_hostname = "dc01.example.com"
winrm_proto = "http"
winrm_port = 5985
krb_realm = "EXAMPLE.COM"
krb_keytab = "/etc/krb5.keytab"
"#,
    )
    .unwrap();

    let settings = Settings::load(Some(&path)).unwrap();
    assert_eq!(settings.winrm_username, "admin");
    assert_eq!(settings.winrm_proto, Protocol::Http);
    assert_eq!(settings.winrm_port, 5985);
    assert_eq!(settings.realm(), Some("EXAMPLE.COM"));
    assert_eq!(settings.krb_keytab, Some(PathBuf::from("/etc/krb5.keytab")));
    assert_eq!(settings.max_sessions, DEFAULT_MAX_SESSIONS);
    assert_eq!(settings.endpoint_url(), "http://dc01.example.com:5985/wsman");
}

#[test]
#[serial]
fn test_load_yaml() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        "winrm_username: admin\nwinrm_hostname: dc01\nwinrm_pass_credentials: true\ndomain_name: example.com\n",
    )
    .unwrap();

    let settings = Settings::load(Some(&path)).unwrap();
    assert_eq!(settings.winrm_port, DEFAULT_PORT);
    assert!(settings.is_pass_credentials_enabled());
    assert_eq!(settings.identify_domain_controller(), "example.com");
}

#[test]
#[serial]
fn test_load_json() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"winrm_hostname": "dc02", "max_sessions": 3, "timeout_secs": 15}"#).unwrap();

    let settings = Settings::load(Some(&path)).unwrap();
    assert_eq!(settings.winrm_hostname, "dc02");
    assert_eq!(settings.max_sessions, 3);
    assert_eq!(settings.timeout().as_secs(), 15);
}

#[test]
#[serial]
fn test_invalid_file_is_error() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "winrm_port = \"not a number\"").unwrap();

    let err = Settings::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("broken.toml"));
}

#[test]
#[serial]
fn test_missing_file_is_error() {
    clear_env();
    assert!(Settings::load(Some(std::path::Path::new("/nonexistent/windowsad.toml"))).is_err());
}

// ============================================================================
// Environment Overrides
// ============================================================================

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("windowsad.toml");
    std::fs::write(&path, "winrm_username = \"file-user\"\nwinrm_hostname = \"file-host\"\n").unwrap();

    std::env::set_var("WINDOWSAD_USER", "env-user");
    std::env::set_var("WINDOWSAD_PROTO", "http");
    std::env::set_var("WINDOWSAD_USE_NTLM", "yes");
    std::env::set_var("WINDOWSAD_DC", "dc09.example.com");
    std::env::set_var("WINDOWSAD_KRB_REALM", "");

    let settings = Settings::load(Some(&path)).unwrap();
    clear_env();

    assert_eq!(settings.winrm_username, "env-user");
    assert_eq!(settings.winrm_hostname, "file-host");
    assert_eq!(settings.winrm_proto, Protocol::Http);
    assert!(settings.winrm_use_ntlm);
    assert_eq!(settings.identify_domain_controller(), "dc09.example.com");
    assert_eq!(settings.realm(), None);
}

#[test]
#[serial]
fn test_invalid_env_values_are_ignored() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("windowsad.toml");
    std::fs::write(&path, "winrm_port = 5986\n").unwrap();

    std::env::set_var("WINDOWSAD_PORT", "eighty");
    std::env::set_var("WINDOWSAD_PROTO", "ftp");
    std::env::set_var("WINDOWSAD_WINRM_INSECURE", "maybe");

    let settings = Settings::load(Some(&path)).unwrap();
    clear_env();

    assert_eq!(settings.winrm_port, 5986);
    assert_eq!(settings.winrm_proto, Protocol::Https);
    assert!(!settings.winrm_insecure);
}

#[test]
#[serial]
fn test_config_env_var_selects_file() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    std::fs::write(&path, "winrm_hostname = \"from-env-path\"\n").unwrap();

    std::env::set_var("WINDOWSAD_CONFIG", &path);
    let settings = Settings::load(None).unwrap();
    clear_env();

    assert_eq!(settings.winrm_hostname, "from-env-path");
}

// ============================================================================
// Validation
// ============================================================================

#[cfg(not(windows))]
#[test]
fn test_validate_requires_remote_fields_off_windows() {
    let settings = Settings::default();
    assert!(settings.validate().is_err());

    let settings = Settings {
        winrm_username: "admin".to_string(),
        winrm_hostname: "dc01".to_string(),
        ..Settings::default()
    };
    assert!(settings.validate().is_ok());
    assert!(!settings.is_connection_type_local());
}

#[test]
fn test_validate_rejects_zero_port() {
    let settings = Settings {
        winrm_username: "admin".to_string(),
        winrm_hostname: "dc01".to_string(),
        winrm_port: 0,
        ..Settings::default()
    };
    assert!(settings.validate().is_err());
}
