//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use remote_object::config::{
    AcceptStrategy, ClientConfig, LoggingConfig, ProtocolConfig, RemoteConfig, ServerConfig,
    DEFAULT_METADATA_PREFIX, DEFAULT_PORT,
};
use remote_object::error::Fault;
use serial_test::serial;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = RemoteConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_empty_server_host() {
    let config = ServerConfig {
        host: Some(String::new()),
        ..ServerConfig::default()
    };
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_missing_host_listens_everywhere() {
    let config = ServerConfig {
        host: None,
        ..ServerConfig::default()
    };
    assert!(config.validate().is_empty());
}

#[test]
fn test_port_file_directory_must_exist() {
    let config = ServerConfig {
        port_file: Some("/nonexistent/directory/remote.port".into()),
        ..ServerConfig::default()
    };
    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Port file directory does not exist")));
}

#[test]
fn test_zero_call_timeout_rejected() {
    let server = ServerConfig {
        timeout: Some(Duration::ZERO),
        ..ServerConfig::default()
    };
    let client = ClientConfig {
        timeout: Some(Duration::ZERO),
        ..ClientConfig::default()
    };
    assert!(server.validate().iter().any(|e| e.contains("Call timeout")));
    assert!(client.validate().iter().any(|e| e.contains("Call timeout")));
}

#[test]
fn test_shutdown_timeout_bounds() {
    let short = ServerConfig {
        shutdown_timeout: Duration::from_millis(5),
        ..ServerConfig::default()
    };
    assert!(short.validate().iter().any(|e| e.contains("too short")));

    let long = ServerConfig {
        shutdown_timeout: Duration::from_secs(301),
        ..ServerConfig::default()
    };
    assert!(long.validate().iter().any(|e| e.contains("too long")));
}

#[test]
fn test_zero_poll_interval_rejected() {
    let config = ServerConfig {
        poll_interval: Duration::ZERO,
        ..ServerConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Poll interval must be greater than 0")));
}

#[test]
fn test_client_requires_peer_and_port() {
    let config = ClientConfig {
        peer: String::new(),
        port: 0,
        ..ClientConfig::default()
    };
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("peer cannot be empty")));
    assert!(errors.iter().any(|e| e.contains("port must be greater than 0")));
}

#[test]
fn test_metadata_prefix_rules() {
    let empty = ProtocolConfig {
        metadata_prefix: String::new(),
        ..ProtocolConfig::default()
    };
    assert!(empty.validate().iter().any(|e| e.contains("cannot be empty")));

    let private = ProtocolConfig {
        metadata_prefix: String::from("_META_"),
        ..ProtocolConfig::default()
    };
    assert!(private.validate().iter().any(|e| e.contains("private")));
}

#[test]
fn test_exposed_prefix_required_when_enabled() {
    let config = ProtocolConfig {
        allow_exposed_attrs: true,
        exposed_prefix: String::new(),
        ..ProtocolConfig::default()
    };
    assert!(!config.validate().is_empty());
}

#[test]
fn test_merged_forces_attribute_gates_only() {
    let user = ProtocolConfig {
        allow_all_attrs: false,
        allow_getattr: false,
        allow_setattr: false,
        allow_delattr: false,
        allow_exposed_attrs: true,
        exposed_prefix: String::from("pub_"),
        ..ProtocolConfig::default()
    };
    let merged = user.merged();
    assert!(merged.allow_all_attrs && merged.allow_getattr);
    assert!(merged.allow_setattr && merged.allow_delattr);
    assert!(merged.allow_exposed_attrs);
    assert_eq!(merged.exposed_prefix, "pub_");
}

#[test]
fn test_logging_requires_an_output() {
    let config = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));

    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_validate_strict_collects_all_errors() {
    let mut config = RemoteConfig::default();
    config.client.peer = String::new();
    config.logging.app_name = String::new();
    let err = config.validate_strict().unwrap_err();
    let Fault::Config(message) = err else {
        panic!("config fault expected");
    };
    assert!(message.contains("peer cannot be empty"));
    assert!(message.contains("Application name cannot be empty"));
}

#[test]
fn test_toml_with_durations_and_extra_options() {
    let config = RemoteConfig::from_toml(
        r#"
        [server]
        host = "127.0.0.1"
        port = 0
        timeout = "2s"
        shutdown_timeout = 1.5
        accept_strategy = "single_connection"

        [server.protocol]
        metadata_prefix = "LIB_"
        sync_request_timeout = 30

        [client]
        peer = "10.0.0.2"
        port = 9000

        [logging]
        log_level = "debug"
        "#,
    )
    .expect("valid TOML");

    assert_eq!(config.server.port, 0);
    assert_eq!(config.server.timeout, Some(Duration::from_secs(2)));
    assert_eq!(config.server.shutdown_timeout, Duration::from_millis(1500));
    assert_eq!(config.server.accept_strategy, AcceptStrategy::SingleConnection);
    assert_eq!(config.server.protocol.metadata_prefix, "LIB_");
    assert!(config.server.protocol.extra.contains_key("sync_request_timeout"));
    assert_eq!(config.client.protocol.metadata_prefix, DEFAULT_METADATA_PREFIX);
    assert_eq!(config.client.peer, "10.0.0.2");
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.validate().is_empty());
}

#[test]
fn test_invalid_toml_is_config_fault() {
    let err = RemoteConfig::from_toml("[server\nport = ").unwrap_err();
    assert!(matches!(err, Fault::Config(ref m) if m.contains("Failed to parse TOML")));
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("remote.toml");
    let mut config = RemoteConfig::default();
    config.server.port = 4567;
    config.server.allow_remote_stop = false;
    config.save_to_file(&path).unwrap();

    let loaded = RemoteConfig::from_file(&path).unwrap();
    assert_eq!(loaded.server.port, 4567);
    assert!(!loaded.server.allow_remote_stop);
    assert_eq!(loaded.client.port, DEFAULT_PORT);
}

#[test]
fn test_example_config_parses() {
    let example = RemoteConfig::example_config();
    assert!(RemoteConfig::from_toml(&example).is_ok());
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("REMOTE_OBJECT_PORT", "9999");
    std::env::set_var("REMOTE_OBJECT_HOST", "*");
    std::env::set_var("REMOTE_OBJECT_ALLOW_REMOTE_STOP", "off");
    std::env::set_var("REMOTE_OBJECT_TIMEOUT", "250ms");
    let config = RemoteConfig::from_env();
    std::env::remove_var("REMOTE_OBJECT_PORT");
    std::env::remove_var("REMOTE_OBJECT_HOST");
    std::env::remove_var("REMOTE_OBJECT_ALLOW_REMOTE_STOP");
    std::env::remove_var("REMOTE_OBJECT_TIMEOUT");

    let config = config.unwrap();
    assert_eq!(config.server.port, 9999);
    assert_eq!(config.client.port, 9999);
    assert_eq!(config.server.host, None);
    assert!(!config.server.allow_remote_stop);
    assert_eq!(config.client.timeout, Some(Duration::from_millis(250)));
}

#[test]
#[serial]
fn test_env_invalid_value_reported() {
    std::env::set_var("REMOTE_OBJECT_PORT", "not-a-port");
    let result = RemoteConfig::from_env();
    std::env::remove_var("REMOTE_OBJECT_PORT");
    assert!(matches!(result, Err(Fault::Config(ref m)) if m.contains("REMOTE_OBJECT_PORT")));
}
