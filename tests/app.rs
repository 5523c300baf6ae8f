use std::{
    fs,
    net::TcpListener as StdListener,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use lockbox::{
    config::{Config, EmailConfig, LogConfig, ServerConfig, StorageConfig},
    flags::FlagValues,
    resolve::{resolve, FileLayer},
    sender::RecordSender,
    server::helpers::{read_message, write_message, MAX_MESSAGE_BYTES},
    App, LockboxError, Result,
};
use tempfile::TempDir;
use tokio::{io::AsyncWriteExt, net::TcpStream};

const STOP: Duration = Duration::from_secs(1);

fn free_port() -> u16 {
    StdListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("free port")
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn write_tls_pair(dir: &Path) -> (PathBuf, PathBuf) {
    let generated =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("certificate");
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    fs::write(&cert, generated.cert.pem()).expect("write cert");
    fs::write(&key, generated.key_pair.serialize_pem()).expect("write key");
    (cert, key)
}

/// A configuration with every field set away from its default.
fn full_config(dir: &Path, port: u16) -> Config {
    let (cert, key) = write_tls_pair(dir);
    Config {
        log: LogConfig {
            log_file: path_str(&dir.join("logs/lockbox.log")),
            err_file: path_str(&dir.join("logs/lockbox.err")),
            notify_errors: "notify@lockbox.test".into(),
            level: "debug".into(),
        },
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port,
            require_tls: true,
            assets_path: "../assets".into(),
            tls_cert: path_str(&cert),
            tls_key: path_str(&key),
        },
        storage: StorageConfig {
            path: path_str(&dir.join("data")),
        },
        email: EmailConfig {
            user: "emailuser".into(),
            password: "emailpassword".into(),
            server: "smtp.lockbox.test".into(),
            port: 2525,
        },
    }
}

fn quiet_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.log.err_file = path_str(&dir.path().join("err.log"));
    config.log.log_file = path_str(&dir.path().join("out.log"));
    config.server.port = 0;
    config.storage.path = path_str(&dir.path().join("db"));
    config
}

async fn request(stream: &mut TcpStream, command: &str) -> Result<String> {
    write_message(stream, command).await?;
    read_message(stream, MAX_MESSAGE_BYTES).await
}

#[tokio::test]
async fn flags_override_only_their_fields() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_file = path_str(&dir.path().join("app.log"));
    let db_path = path_str(&dir.path().join("db"));
    let port = free_port();

    let app = App::run([
        "lockbox".to_string(),
        format!("--log-file={log_file}"),
        format!("--db-path={db_path}"),
        "--email-user=someone".to_string(),
        "runserver".to_string(),
        format!("--port={port}"),
    ])
    .await?;

    let mut expected = Config::default();
    expected.log.log_file = log_file;
    expected.storage.path = db_path;
    expected.email.user = "someone".into();
    expected.server.port = port;

    assert_eq!(app.config(), &expected);
    assert_eq!(app.logger().config(), &expected.log);
    assert_eq!(app.storage().config(), &expected.storage);
    assert_eq!(app.server().config(), &expected.server);
    assert_eq!(app.sender().email_config(), Some(&expected.email));

    app.stop(STOP).await
}

#[tokio::test]
async fn config_file_alone_resolves_to_its_contents() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let expected = full_config(dir.path(), free_port());
    let config_path = dir.path().join("lockbox.yaml");
    fs::write(&config_path, expected.to_yaml_string()?)?;

    let app = App::run([
        "lockbox".to_string(),
        "--config".to_string(),
        path_str(&config_path),
        "runserver".to_string(),
    ])
    .await?;

    assert_eq!(app.config(), &expected);
    assert_eq!(app.logger().config(), &expected.log);
    assert_eq!(app.logger().notify_errors(), Some("notify@lockbox.test"));
    assert_eq!(app.storage().config(), &expected.storage);
    assert_eq!(app.server().config(), &expected.server);
    assert_eq!(app.sender().email_config(), Some(&expected.email));
    assert!(app.server().uses_tls());

    app.stop(STOP).await
}

#[tokio::test]
async fn toml_config_file_is_accepted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("lockbox.toml");
    fs::write(
        &config_path,
        format!(
            "[server]\nport = 0\n\n[storage]\npath = {:?}\n",
            path_str(&dir.path().join("db"))
        ),
    )?;

    let app = App::run([
        "lockbox".to_string(),
        "--config".to_string(),
        path_str(&config_path),
        "runserver".to_string(),
    ])
    .await?;

    assert_eq!(app.config().server.host, ServerConfig::default().host);
    assert_eq!(app.config().server.port, 0);
    assert_ne!(app.ready().await?.port(), 0);

    app.stop(STOP).await
}

#[tokio::test]
async fn flag_beats_file_for_the_same_field() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("lockbox.yaml");
    fs::write(
        &config_path,
        format!(
            "server:\n  port: 9999\n  host: 127.0.0.1\nstorage:\n  path: {}\n",
            path_str(&dir.path().join("db"))
        ),
    )?;
    let port = free_port();

    let app = App::run([
        "lockbox".to_string(),
        "--config".to_string(),
        path_str(&config_path),
        "--port".to_string(),
        port.to_string(),
        "runserver".to_string(),
    ])
    .await?;

    assert_eq!(app.config().server.port, port);
    assert_eq!(app.ready().await?.port(), port);

    app.stop(STOP).await
}

#[tokio::test]
async fn stop_twice_returns_immediately() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = App::launch(quiet_config(&dir)).await?;

    app.stop(STOP).await?;
    assert!(app.is_stopped());

    tokio::time::timeout(Duration::from_millis(100), app.stop(STOP))
        .await
        .expect("second stop should not wait")?;
    Ok(())
}

#[tokio::test]
async fn server_accepts_requests_once_run_returns() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = App::launch(quiet_config(&dir)).await?;
    let addr = app.ready().await?;

    let mut client = TcpStream::connect(addr).await?;
    assert_eq!(request(&mut client, "SET greeting hello").await?, "ok");
    assert_eq!(request(&mut client, "GET greeting").await?, "hello");
    assert_eq!(request(&mut client, "GET missing").await?, "null");
    assert_eq!(request(&mut client, "BOGUS thing").await?, "error:invalid command");
    assert_eq!(request(&mut client, "CLOSE").await?, "Closing connection");

    app.stop(STOP).await
}

#[tokio::test]
async fn stored_values_survive_a_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = quiet_config(&dir);

    let first = App::launch(config.clone()).await?;
    let mut client = TcpStream::connect(first.ready().await?).await?;
    assert_eq!(request(&mut client, "SET kept value").await?, "ok");
    client.shutdown().await?;
    first.stop(STOP).await?;

    let second = App::launch(config).await?;
    assert_eq!(second.storage().get("kept")?, Some("value".to_string()));
    second.stop(STOP).await
}

#[tokio::test]
async fn notify_goes_through_the_injected_sender() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = Arc::new(RecordSender::new());
    let app = App::build_with_sender(quiet_config(&dir), recorder.clone())?;
    let addr = app.start().await?;

    let mut client = TcpStream::connect(addr).await?;
    assert_eq!(request(&mut client, "NOTIFY ops@lockbox.test disk is full").await?, "ok");

    let message = recorder.last().expect("recorded message");
    assert_eq!(message.recipient, "ops@lockbox.test");
    assert_eq!(message.body, "disk is full");

    app.stop(STOP).await
}

#[tokio::test]
async fn connection_errors_are_reported_to_notify_address() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = quiet_config(&dir);
    config.log.notify_errors = "oncall@lockbox.test".into();

    let recorder = Arc::new(RecordSender::new());
    let app = App::build_with_sender(config, recorder.clone())?;
    let addr = app.start().await?;

    let mut client = TcpStream::connect(addr).await?;
    client.write_all(&(MAX_MESSAGE_BYTES + 1).to_be_bytes()).await?;
    assert_eq!(
        read_message(&mut client, MAX_MESSAGE_BYTES).await?,
        "error:message too large"
    );

    let reported = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(message) = recorder.last() {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("error notification");
    assert_eq!(reported.recipient, "oncall@lockbox.test");
    assert!(reported.body.contains("exceeds the frame limit"));

    app.stop(STOP).await?;
    let errors = fs::read_to_string(dir.path().join("err.log"))?;
    assert!(errors.contains("connection terminated with error"));
    Ok(())
}

#[test]
fn written_config_reads_back_unchanged() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let original = full_config(dir.path(), 4242);
    let path = dir.path().join("roundtrip.yaml");
    fs::write(&path, original.to_yaml_string()?)?;

    let layer = FileLayer::load(&path)?;
    assert_eq!(layer.fields().count(), 15);
    assert_eq!(resolve(Config::default(), Some(&layer), &FlagValues::default())?, original);
    Ok(())
}

#[tokio::test]
async fn argument_errors_surface_before_anything_is_built() {
    let unknown = App::run(["lockbox", "--no-such-flag", "x", "runserver"]).await;
    assert!(matches!(unknown, Err(LockboxError::FlagParse(_))));

    let bad_port = App::run(["lockbox", "--port", "abc", "runserver"]).await;
    assert!(matches!(bad_port, Err(LockboxError::InvalidFlagValue { .. })));

    let not_server = App::run(["lockbox", "config", "show"]).await;
    assert!(matches!(not_server, Err(LockboxError::NotAServerCommand)));

    let missing = App::run(["lockbox", "--config", "/nonexistent/lockbox.yaml", "runserver"]).await;
    assert!(matches!(missing, Err(LockboxError::ConfigIo { .. })));
}

#[tokio::test]
async fn unwritable_log_file_fails_construction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory")?;

    let mut config = quiet_config(&dir);
    config.log.log_file = path_str(&blocker.join("app.log"));

    let err = App::build(config).err().expect("construction should fail");
    assert!(matches!(err, LockboxError::Construction { .. }));
    Ok(())
}
