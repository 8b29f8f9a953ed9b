//! Error types for the connection core

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Engine document generation errors. Never retried; surfaced to the user
/// as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported protocol option: {0}")]
    UnsupportedProtocolOption(String),

    #[error("invalid network settings: {0}")]
    InvalidNetworkSettings(String),
}

impl ConfigError {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        ConfigError::UnsupportedProtocolOption(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        ConfigError::InvalidNetworkSettings(msg.into())
    }
}

/// Engine process lifecycle errors.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("engine binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("local port {0} is already in use")]
    PortInUse(u16),

    #[error("engine spawn failed: {0}")]
    SpawnFailed(String),

    #[error("engine termination unconfirmed: {0}")]
    TerminationUnconfirmed(String),
}

impl ProcessError {
    pub fn spawn<S: Into<String>>(msg: S) -> Self {
        ProcessError::SpawnFailed(msg.into())
    }

    pub fn unconfirmed<S: Into<String>>(msg: S) -> Self {
        ProcessError::TerminationUnconfirmed(msg.into())
    }
}

/// Connection core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown profile: {0}")]
    Profile(String),

    #[error("No viable candidate remains in group '{0}'")]
    Exhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn settings<S: Into<String>>(msg: S) -> Self {
        Error::Settings(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn profile<S: Into<String>>(msg: S) -> Self {
        Error::Profile(msg.into())
    }

    pub fn exhausted<S: Into<String>>(group: S) -> Self {
        Error::Exhausted(group.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Settings(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::settings("test error");
        assert!(matches!(e, Error::Settings(_)));
    }

    #[test]
    fn test_error_display() {
        let e = ConfigError::protocol("hysteria2 bandwidth must be positive");
        assert_eq!(
            e.to_string(),
            "unsupported protocol option: hysteria2 bandwidth must be positive"
        );

        let e = ProcessError::PortInUse(1080);
        assert_eq!(e.to_string(), "local port 1080 is already in use");
    }

    #[test]
    fn test_error_wrapping() {
        let e: Error = ConfigError::network("bad dns entry").into();
        assert!(matches!(e, Error::Config(_)));

        let e: Error = ProcessError::BinaryNotFound(PathBuf::from("/opt/engine")).into();
        assert_eq!(e.to_string(), "Process error: engine binary not found: /opt/engine");
    }
}
