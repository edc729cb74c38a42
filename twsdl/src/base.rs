// twsdl/src/base.rs
// Base error definitions

use thiserror::Error;

/// Errors that can occur while driving TWS
#[derive(Error, Debug, Clone)]
pub enum TwsDlError {
  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  #[error("Not connected to TWS")]
  NotConnected,

  #[error("Already connected to TWS")]
  AlreadyConnected,

  #[error("Socket error: {0}")]
  SocketError(String),

  #[error("Message parse error: {0}")]
  ParseError(String),

  #[error("Invalid state: {0}")]
  InvalidState(String),

  #[error("Protocol violation: {0}")]
  ProtocolViolation(String),

  #[error("Job file error: {0}")]
  JobFile(String),

  #[error("I/O error: {0}")]
  Io(String),

  #[error("Internal error: {0}")]
  InternalError(String),
}

impl From<std::io::Error> for TwsDlError {
  fn from(e: std::io::Error) -> Self {
    TwsDlError::Io(e.to_string())
  }
}
