//! WinRM transport tests against a mock WS-Management endpoint.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use windowsad::config::{Protocol, Settings};
use windowsad::connection::winrm::{WinRmAuth, WinRmConnectionBuilder};
use windowsad::connection::{Connection, ConnectionError, Connector, TransportConnector};
use windowsad::directory::DirectoryClient;

const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

fn envelope(body: &str) -> String {
    format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:rsp="{SHELL_NS}"><s:Header/><s:Body>{body}</s:Body></s:Envelope>"#
    )
}

fn receive_done(stdout: &str, stderr: &str, exit_code: i32) -> String {
    envelope(&format!(
        r#"<rsp:ReceiveResponse>
             <rsp:Stream Name="stdout" CommandId="CMD-1">{}</rsp:Stream>
             <rsp:Stream Name="stderr" CommandId="CMD-1">{}</rsp:Stream>
             <rsp:Stream Name="stdout" CommandId="CMD-1" End="true"/>
             <rsp:CommandState CommandId="CMD-1" State="{SHELL_NS}/CommandState/Done"><rsp:ExitCode>{}</rsp:ExitCode></rsp:CommandState>
           </rsp:ReceiveResponse>"#,
        BASE64_STANDARD.encode(stdout),
        BASE64_STANDARD.encode(stderr),
        exit_code
    ))
}

/// Mount create/command/signal/delete handlers plus a final Receive.
async fn mount_shell(server: &MockServer, receive: String) {
    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains("transfer/Create"))
        .respond_with(ResponseTemplate::new(200).set_body_string(envelope(
            "<rsp:Shell><rsp:ShellId>SHELL-1</rsp:ShellId></rsp:Shell>",
        )))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_string_contains("windows/shell/Command"))
        .respond_with(ResponseTemplate::new(200).set_body_string(envelope(
            "<rsp:CommandResponse><rsp:CommandId>CMD-1</rsp:CommandId></rsp:CommandResponse>",
        )))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_string_contains("windows/shell/Receive"))
        .respond_with(ResponseTemplate::new(200).set_body_string(receive))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_string_contains("windows/shell/Signal"))
        .respond_with(ResponseTemplate::new(200).set_body_string(envelope("")))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_string_contains("transfer/Delete"))
        .respond_with(ResponseTemplate::new(200).set_body_string(envelope("")))
        .expect(1..)
        .mount(server)
        .await;
}

fn http_settings(server: &MockServer) -> Settings {
    let addr = server.address();
    Settings {
        winrm_username: "admin".to_string(),
        winrm_password: "secret".to_string(),
        winrm_hostname: addr.ip().to_string(),
        winrm_port: addr.port(),
        winrm_proto: Protocol::Http,
        timeout_secs: 5,
        ..Settings::default()
    }
}

#[tokio::test]
async fn test_execute_powershell_round_trip() {
    let server = MockServer::start().await;
    mount_shell(&server, receive_done("hello\r\n", "", 0)).await;

    let addr = server.address();
    let conn = WinRmConnectionBuilder::new(addr.ip().to_string())
        .use_ssl(false)
        .port(addr.port())
        .auth(WinRmAuth::basic("admin", "secret"))
        .build()
        .unwrap();

    let result = conn.execute_powershell("Write-Output hello").await.unwrap();
    assert!(result.success);
    assert_eq!(result.stdout, "hello\r\n");

    let requests = server.received_requests().await.unwrap();
    let command = requests
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).to_string())
        .find(|b| b.contains("windows/shell/Command"))
        .unwrap();
    assert!(command.contains("powershell.exe -NoProfile -NonInteractive -EncodedCommand "));
    assert!(command.contains(r#"<w:Selector Name="ShellId">SHELL-1</w:Selector>"#));
}

#[tokio::test]
async fn test_nonzero_exit_reported() {
    let server = MockServer::start().await;
    mount_shell(&server, receive_done("", "boom", 1)).await;

    let addr = server.address();
    let conn = WinRmConnectionBuilder::new(addr.ip().to_string())
        .use_ssl(false)
        .port(addr.port())
        .auth(WinRmAuth::basic("admin", "secret"))
        .build()
        .unwrap();

    let result = conn.execute_powershell("throw 'boom'").await.unwrap();
    assert_eq!(result.exit_code, 1);
    assert!(!result.success);
    assert_eq!(result.stderr, "boom");
}

#[tokio::test]
async fn test_receive_timeout_fault_is_polled_again() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("windows/shell/Receive"))
        .respond_with(ResponseTemplate::new(500).set_body_string(envelope(
            r#"<s:Fault><s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="2150858793"/></s:Detail></s:Fault>"#,
        )))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_shell(&server, receive_done("late", "", 0)).await;

    let settings = http_settings(&server);
    let connector = TransportConnector::new(Arc::new(settings));
    let conn = connector.connect().await.unwrap();

    let result = conn.execute_powershell("Start-Sleep 30; 'late'").await.unwrap();
    assert_eq!(result.stdout, "late");
}

#[tokio::test]
async fn test_unauthorized_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("Authorization"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let connector = TransportConnector::new(Arc::new(http_settings(&server)));
    let conn = connector.connect().await.unwrap();

    let err = conn.execute_powershell("Get-ADDomain").await.unwrap_err();
    assert!(matches!(err, ConnectionError::AuthenticationFailed(_)));
}

fn kerberos_settings(server: &MockServer) -> Settings {
    Settings {
        krb_realm: Some("EXAMPLE.COM".to_string()),
        ..http_settings(server)
    }
}

#[tokio::test]
async fn test_kerberos_keytab_without_password_is_rejected() {
    let server = MockServer::start().await;
    let settings = Settings {
        winrm_password: String::new(),
        krb_keytab: Some("/etc/admin.keytab".into()),
        ..kerberos_settings(&server)
    };
    let conn = TransportConnector::new(Arc::new(settings)).connect().await.unwrap();

    let err = conn.execute_powershell("Get-ADDomain").await.unwrap_err();
    match err {
        ConnectionError::AuthenticationFailed(msg) => {
            assert!(msg.contains("admin@EXAMPLE.COM"), "{msg}");
            assert!(msg.contains("winrm_password"), "{msg}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kerberos_unreachable_kdc_fails_before_any_request() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let krb_conf = dir.path().join("krb5.conf");
    std::fs::write(
        &krb_conf,
        "[libdefaults]\n  default_realm = EXAMPLE.COM\n\n[realms]\n  EXAMPLE.COM = {\n    kdc = 127.0.0.1:1\n  }\n",
    )
    .unwrap();

    let settings = Settings {
        krb_conf: Some(krb_conf),
        ..kerberos_settings(&server)
    };
    let conn = TransportConnector::new(Arc::new(settings)).connect().await.unwrap();

    let err = conn.execute_powershell("Get-ADDomain").await.unwrap_err();
    match err {
        ConnectionError::AuthenticationFailed(msg) => assert!(msg.starts_with("Kerberos"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kerberos_missing_krb_conf_is_invalid_config() {
    let server = MockServer::start().await;
    let settings = Settings {
        krb_conf: Some("/nonexistent/krb5.conf".into()),
        ..kerberos_settings(&server)
    };
    let conn = TransportConnector::new(Arc::new(settings)).connect().await.unwrap();

    let err = conn.execute_powershell("Get-ADDomain").await.unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidConfig(_)), "{err}");
}

#[tokio::test]
async fn test_directory_client_end_to_end() {
    let server = MockServer::start().await;
    mount_shell(
        &server,
        receive_done(r#"{"ObjectGUID": "g-1", "Name": "Engineers", "GroupScope": 1, "GroupCategory": 1}"#, "", 0),
    )
    .await;

    let client = DirectoryClient::new(http_settings(&server)).unwrap();
    let group = client.get_group("Engineers").await.unwrap();
    assert_eq!(group.guid, "g-1");
    assert_eq!(group.scope_num, 1);
    assert_eq!(client.pool().stats().idle, 1);

    client.shutdown().await;
}
