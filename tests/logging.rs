//! Global logger installation. Kept in its own test binary because the
//! subscriber can only be installed once per process.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use command_protocol::config::LoggingConfig;
use command_protocol::utils::logging::init_logging;
use command_protocol::ProtocolError;

#[test]
fn logger_installs_once_and_writes_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("protocol.log");

    let config = LoggingConfig {
        file: Some(path.clone()),
        json: true,
        ..LoggingConfig::default()
    };
    init_logging(&config).unwrap();
    assert!(path.exists());

    assert!(matches!(
        init_logging(&LoggingConfig::default()),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn unwritable_log_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoggingConfig {
        // A directory can't be opened for appending
        file: Some(dir.path().to_path_buf()),
        ..LoggingConfig::default()
    };
    assert!(matches!(
        init_logging(&config),
        Err(ProtocolError::ConfigError(_))
    ));
}
