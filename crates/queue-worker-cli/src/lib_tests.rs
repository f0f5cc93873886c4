//! Tests for the queue-worker-cli library module.

use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).unwrap()
}

fn yaml_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_subscribe_parsing_defaults() {
    let cli = parse(&["queue-worker", "subscribe", "emails", "https://example.com/hook"]);

    match cli.command {
        Commands::Subscribe {
            queue,
            url,
            retries,
            errqueue,
            advanced,
            connection,
        } => {
            assert_eq!(queue, "emails");
            assert_eq!(url, "https://example.com/hook");
            assert_eq!(retries, 3);
            assert!(errqueue.is_none());
            assert!(advanced.is_none());
            assert!(connection.is_none());
        }
        other => panic!("Expected Subscribe command, got: {:?}", other),
    }
}

#[test]
fn test_subscribe_parsing_options() {
    let cli = parse(&[
        "queue-worker",
        "subscribe",
        "emails",
        "https://example.com/hook",
        "--retries",
        "5",
        "--errqueue",
        "emails-failed",
        "--advanced",
        r#"{"retries_delay":30}"#,
        "--connection",
        "iron",
    ]);

    match cli.command {
        Commands::Subscribe {
            retries,
            errqueue,
            advanced,
            connection,
            ..
        } => {
            assert_eq!(retries, 5);
            assert_eq!(errqueue.as_deref(), Some("emails-failed"));
            assert_eq!(advanced.as_deref(), Some(r#"{"retries_delay":30}"#));
            assert_eq!(connection.as_deref(), Some("iron"));
        }
        other => panic!("Expected Subscribe command, got: {:?}", other),
    }
}

#[test]
fn test_subscribe_requires_url() {
    assert!(Cli::try_parse_from(["queue-worker", "subscribe", "emails"]).is_err());
}

#[test]
fn test_work_parsing() {
    let cli = parse(&[
        "queue-worker",
        "--json-logs",
        "work",
        "sqs",
        "--queue",
        "emails",
        "--tries",
        "3",
        "--delay",
        "10",
        "--stop-when-empty",
    ]);

    assert!(cli.json_logs);
    assert_eq!(cli.log_level, "info");

    match cli.command {
        Commands::Work {
            connection,
            queue,
            delay,
            sleep,
            tries,
            once,
            stop_when_empty,
            failed_log,
        } => {
            assert_eq!(connection.as_deref(), Some("sqs"));
            assert_eq!(queue.as_deref(), Some("emails"));
            assert_eq!(delay, 10);
            assert_eq!(sleep, 3);
            assert_eq!(tries, 3);
            assert!(!once);
            assert!(stop_when_empty);
            assert!(failed_log.is_none());
        }
        other => panic!("Expected Work command, got: {:?}", other),
    }
}

#[test]
fn test_push_parsing() {
    let cli = parse(&["queue-worker", "push", "send-email", "--data", r#"{"to":"a"}"#]);

    match cli.command {
        Commands::Push {
            handler,
            data,
            delay,
            ..
        } => {
            assert_eq!(handler, "send-email");
            assert_eq!(data.as_deref(), Some(r#"{"to":"a"}"#));
            assert_eq!(delay, 0);
        }
        other => panic!("Expected Push command, got: {:?}", other),
    }
}

#[test]
fn test_load_settings_from_file() {
    let file = yaml_config(
        r#"
default: sqs
connections:
  sqs:
    driver: sqs
    key: AKIA
    secret: s3cr3t
    region: eu-west-1
    queue: emails
  local:
    driver: memory
"#,
    );

    let settings = load_settings(Some(file.path())).unwrap();

    assert_eq!(settings.default, "sqs");
    assert_eq!(settings.connections.len(), 2);
    let sqs = settings.connection("sqs").unwrap();
    assert_eq!(sqs.driver, "sqs");
    assert_eq!(sqs.required_str("region").unwrap(), "eu-west-1");
}

#[test]
fn test_load_settings_without_connections_uses_memory() {
    let file = yaml_config("default: memory\n");

    let settings = load_settings(Some(file.path())).unwrap();

    assert_eq!(settings.default, "memory");
    assert_eq!(settings.connection("memory").unwrap().driver, "memory");
}

#[test]
fn test_load_settings_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.yaml");

    match load_settings(Some(&path)) {
        Err(ConfigError::FileNotFound { path: missing }) => assert_eq!(missing, path),
        other => panic!("Expected FileNotFound, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_push_to_memory_connection() {
    let file = yaml_config("default: memory\n");
    let path = file.path().to_str().unwrap();
    let cli = parse(&["queue-worker", "--config", path, "push", "foo", "--data", "[1,2]"]);

    execute(cli, Arc::new(HandlerRegistry::new())).await.unwrap();
}

#[tokio::test]
async fn test_push_rejects_invalid_data() {
    let file = yaml_config("default: memory\n");
    let path = file.path().to_str().unwrap();
    let cli = parse(&["queue-worker", "--config", path, "push", "foo", "--data", "{nope"]);

    let error = execute(cli, Arc::new(HandlerRegistry::new()))
        .await
        .unwrap_err();

    assert!(matches!(error, CliError::InvalidArgument { ref arg, .. } if arg == "data"));
    assert_eq!(error.exit_code(), 3);
}

#[tokio::test]
async fn test_subscribe_rejects_invalid_advanced_json() {
    let file = yaml_config("default: memory\n");
    let path = file.path().to_str().unwrap();
    let cli = parse(&[
        "queue-worker",
        "--config",
        path,
        "subscribe",
        "emails",
        "https://example.com/hook",
        "--advanced",
        "not json",
    ]);

    let error = execute(cli, Arc::new(HandlerRegistry::new()))
        .await
        .unwrap_err();

    assert_eq!(error.exit_code(), 3);
}

#[tokio::test]
async fn test_subscribe_unsupported_by_memory_driver() {
    let file = yaml_config("default: memory\n");
    let path = file.path().to_str().unwrap();
    let cli = parse(&[
        "queue-worker",
        "--config",
        path,
        "subscribe",
        "emails",
        "https://example.com/hook",
    ]);

    let error = execute(cli, Arc::new(HandlerRegistry::new()))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        CliError::Queue(QueueError::Unsupported { .. })
    ));
    assert_eq!(error.exit_code(), 2);
}

#[tokio::test]
async fn test_work_once_on_empty_queue() {
    let file = yaml_config("default: memory\n");
    let path = file.path().to_str().unwrap();
    let cli = parse(&["queue-worker", "--config", path, "work", "--once"]);

    execute(cli, Arc::new(HandlerRegistry::new())).await.unwrap();
}

#[tokio::test]
async fn test_work_with_tries_requires_failed_log() {
    let file = yaml_config("default: memory\n");
    let path = file.path().to_str().unwrap();
    let cli = parse(&["queue-worker", "--config", path, "work", "--once", "--tries", "3"]);

    let error = execute(cli, Arc::new(HandlerRegistry::new()))
        .await
        .unwrap_err();

    assert!(matches!(error, CliError::InvalidArgument { ref arg, .. } if arg == "failed-log"));
    assert_eq!(error.exit_code(), 3);
}

#[tokio::test]
async fn test_work_with_tries_and_failed_log() {
    let file = yaml_config("default: memory\n");
    let path = file.path().to_str().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let failed_log = dir.path().join("failed.jsonl");
    let cli = parse(&[
        "queue-worker",
        "--config",
        path,
        "work",
        "--once",
        "--tries",
        "3",
        "--failed-log",
        failed_log.to_str().unwrap(),
    ]);

    execute(cli, Arc::new(HandlerRegistry::new())).await.unwrap();
}

#[tokio::test]
async fn test_work_unknown_connection_is_configuration_error() {
    let file = yaml_config("default: memory\n");
    let path = file.path().to_str().unwrap();
    let cli = parse(&["queue-worker", "--config", path, "work", "redis", "--once"]);

    let error = execute(cli, Arc::new(HandlerRegistry::new()))
        .await
        .unwrap_err();

    assert_eq!(error.exit_code(), 1);
}

#[test]
fn test_exit_codes() {
    let missing = CliError::from(ConfigError::FileNotFound {
        path: PathBuf::from("queue.yaml"),
    });
    assert_eq!(missing.exit_code(), 1);

    let queue = CliError::from(QueueError::ConnectionFailed {
        message: "refused".to_string(),
    });
    assert_eq!(queue.exit_code(), 2);

    let io = CliError::from(std::io::Error::other("broken pipe"));
    assert_eq!(io.exit_code(), 4);
}
