//! Communication Error Types
//!
//! Every failure an operation can meet, grouped by how the engine reacts to it:
//! transport errors are retried, framing and protocol errors abort the
//! operation, contention is rejected at submission.

use thiserror::Error;

/// Result type for fieldlink-core operations
pub type Result<T> = std::result::Result<T, CommError>;

/// Error classes driving the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeout, reset, end of stream, socket failure
    Transport,
    /// Bad checksum, CRC, sentinel, length or escape sequence
    Framing,
    /// Bad tag, status code, request id or value range
    Protocol,
    /// Exclusive operation already in flight
    Contention,
    /// Bad link or controller setup
    Config,
    /// Queue closed before the operation could run
    Shutdown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Transport => "transport",
            ErrorClass::Framing => "framing",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Contention => "contention",
            ErrorClass::Config => "config",
            ErrorClass::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Communication errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommError {
    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------
    /// No response within the read timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer reset or aborted the connection
    #[error("Connection reset: {0}")]
    Reset(String),

    /// Stream ended before the expected number of bytes arrived
    #[error("Unexpected end of input: {0}")]
    Eof(String),

    /// Other socket or serial failures
    #[error("IO error: {0}")]
    Io(String),

    /// Transport not open (or waiting out a reconnect backoff)
    #[error("Not connected: {0}")]
    NotConnected(String),

    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------
    #[error("Checksum mismatch: expected {expected:#06X}, received {received:#06X}")]
    Checksum { expected: u32, received: u32 },

    #[error("Invalid length: {0}")]
    Length(String),

    #[error("Bad sentinel: {0}")]
    Sentinel(String),

    #[error("Invalid escape sequence: {0}")]
    Escape(String),

    // ------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------
    #[error("Bad tag: {0}")]
    BadTag(String),

    #[error("Request id mismatch: expected {expected}, received {received}")]
    RequestId { expected: i64, received: i64 },

    /// Device reported an error status
    #[error("Status {code}: {message}")]
    Status { code: i32, message: String },

    #[error("Value out of range: {0}")]
    Range(String),

    #[error("Parsing error: {0}")]
    Parse(String),

    /// Controller answered but refused or could not perform the request
    #[error("Controller error: {0}")]
    Controller(String),

    /// Controller lost its configuration and asks for a settings download
    #[error("Download requested: {0}")]
    DownloadRequest(String),

    // ------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------
    #[error("Controller busy: {0}")]
    Contention(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Queue drained")]
    QueueDrained,
}

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => CommError::Timeout(err.to_string()),
            ErrorKind::UnexpectedEof => CommError::Eof(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => CommError::Reset(err.to_string()),
            ErrorKind::NotConnected | ErrorKind::ConnectionRefused => {
                CommError::NotConnected(err.to_string())
            },
            _ => CommError::Io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for CommError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CommError::Timeout("read timed out".to_string())
    }
}

// Helper methods for creating errors
impl CommError {
    pub fn timeout(msg: impl Into<String>) -> Self {
        CommError::Timeout(msg.into())
    }

    pub fn eof(msg: impl Into<String>) -> Self {
        CommError::Eof(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        CommError::Io(msg.into())
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        CommError::NotConnected(msg.into())
    }

    pub fn checksum(expected: u32, received: u32) -> Self {
        CommError::Checksum { expected, received }
    }

    pub fn length(msg: impl Into<String>) -> Self {
        CommError::Length(msg.into())
    }

    pub fn sentinel(msg: impl Into<String>) -> Self {
        CommError::Sentinel(msg.into())
    }

    pub fn escape(msg: impl Into<String>) -> Self {
        CommError::Escape(msg.into())
    }

    pub fn bad_tag(msg: impl Into<String>) -> Self {
        CommError::BadTag(msg.into())
    }

    pub fn status(code: i32, msg: impl Into<String>) -> Self {
        CommError::Status {
            code,
            message: msg.into(),
        }
    }

    pub fn range(msg: impl Into<String>) -> Self {
        CommError::Range(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        CommError::Parse(msg.into())
    }

    pub fn controller(msg: impl Into<String>) -> Self {
        CommError::Controller(msg.into())
    }

    pub fn download_request(msg: impl Into<String>) -> Self {
        CommError::DownloadRequest(msg.into())
    }

    pub fn contention(msg: impl Into<String>) -> Self {
        CommError::Contention(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CommError::Config(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        CommError::NotSupported(msg.into())
    }

    /// Classify for the retry policy
    pub fn class(&self) -> ErrorClass {
        match self {
            CommError::Timeout(_)
            | CommError::Reset(_)
            | CommError::Eof(_)
            | CommError::Io(_)
            | CommError::NotConnected(_) => ErrorClass::Transport,
            CommError::Checksum { .. }
            | CommError::Length(_)
            | CommError::Sentinel(_)
            | CommError::Escape(_) => ErrorClass::Framing,
            CommError::BadTag(_)
            | CommError::RequestId { .. }
            | CommError::Status { .. }
            | CommError::Range(_)
            | CommError::Parse(_)
            | CommError::Controller(_)
            | CommError::DownloadRequest(_) => ErrorClass::Protocol,
            CommError::Contention(_) => ErrorClass::Contention,
            CommError::Config(_) | CommError::NotSupported(_) => ErrorClass::Config,
            CommError::QueueDrained => ErrorClass::Shutdown,
        }
    }

    /// Only transport failures re-enter the current phase
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    /// Check if the transport must be closed and reopened before the next exchange
    pub fn needs_reopen(&self) -> bool {
        matches!(
            self,
            CommError::Reset(_) | CommError::Eof(_) | CommError::Io(_)
        )
    }

    /// Check if pending input must be discarded to resynchronize the stream
    pub fn needs_drain(&self) -> bool {
        matches!(self, CommError::Timeout(_))
            || matches!(self.class(), ErrorClass::Framing | ErrorClass::Protocol)
    }
}
