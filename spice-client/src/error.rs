use crate::protocol::LinkError;
use std::time::Duration;
use thiserror::Error;

/// Why a channel failed during the link phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    /// The server answered with a non-OK link error code.
    Server(LinkError),
    /// The reply did not start with the "REDQ" magic.
    InvalidMagic(u32),
    /// The server speaks a different major protocol version.
    VersionMismatch { expected: u32, actual: u32 },
    /// A capability required by the client is absent from the intersection.
    MissingCapability(&'static str),
    /// The server requires TLS but the endpoint is plain TCP.
    NeedSecured,
    /// The ticket is longer than 128 plaintext bytes.
    TicketTooLong(usize),
    /// The server public key could not be used to encrypt the ticket.
    Encryption(String),
    /// The link reply is truncated or inconsistent.
    Malformed(String),
}

impl std::fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkFailure::Server(code) => write!(f, "server refused link: {code:?}"),
            LinkFailure::InvalidMagic(magic) => write!(f, "invalid magic 0x{magic:08x}"),
            LinkFailure::VersionMismatch { expected, actual } => {
                write!(f, "version mismatch: expected {expected}, got {actual}")
            }
            LinkFailure::MissingCapability(cap) => write!(f, "missing capability {cap}"),
            LinkFailure::NeedSecured => write!(f, "server requires a TLS connection"),
            LinkFailure::TicketTooLong(len) => write!(f, "ticket is {len} bytes, limit is 128"),
            LinkFailure::Encryption(msg) => write!(f, "ticket encryption failed: {msg}"),
            LinkFailure::Malformed(msg) => write!(f, "malformed link reply: {msg}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SpiceError {
    // Connection setup
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Link failed: {0}")]
    LinkFailed(LinkFailure),

    #[error("Authentication failed (status {0})")]
    AuthFailed(u32),

    // In-session
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Server disconnected: {0:?}")]
    ServerDisconnected(LinkError),

    // Lifecycle
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    // Consumer interface
    #[error("Bad handle {0}")]
    BadHandle(u64),

    #[error("Not connected")]
    NotConnected,

    // Transport detail
    #[error("Transport closed by peer")]
    TransportEof,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification for consumers that only branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectFailed,
    LinkFailed,
    AuthFailed,
    ProtocolError,
    ResourceExhausted,
    ServerDisconnected,
    Cancelled,
    Timeout,
    BadHandle,
    NotConnected,
}

impl SpiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpiceError::ConnectFailed(_) | SpiceError::Tls(_) => ErrorKind::ConnectFailed,
            SpiceError::LinkFailed(_) => ErrorKind::LinkFailed,
            SpiceError::AuthFailed(_) => ErrorKind::AuthFailed,
            SpiceError::Protocol(_) | SpiceError::TransportEof | SpiceError::Io(_) => {
                ErrorKind::ProtocolError
            }
            SpiceError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SpiceError::ServerDisconnected(_) => ErrorKind::ServerDisconnected,
            SpiceError::Cancelled => ErrorKind::Cancelled,
            SpiceError::Timeout(_) => ErrorKind::Timeout,
            SpiceError::BadHandle(_) => ErrorKind::BadHandle,
            SpiceError::NotConnected => ErrorKind::NotConnected,
        }
    }

    /// Copy the error for fan-out to several observers. `io::Error` is not
    /// `Clone`, so its kind and message are preserved instead.
    pub fn duplicate(&self) -> SpiceError {
        match self {
            SpiceError::ConnectFailed(s) => SpiceError::ConnectFailed(s.clone()),
            SpiceError::LinkFailed(f) => SpiceError::LinkFailed(f.clone()),
            SpiceError::AuthFailed(code) => SpiceError::AuthFailed(*code),
            SpiceError::Protocol(s) => SpiceError::Protocol(s.clone()),
            SpiceError::ResourceExhausted(s) => SpiceError::ResourceExhausted(s.clone()),
            SpiceError::ServerDisconnected(r) => SpiceError::ServerDisconnected(*r),
            SpiceError::Cancelled => SpiceError::Cancelled,
            SpiceError::Timeout(d) => SpiceError::Timeout(*d),
            SpiceError::BadHandle(h) => SpiceError::BadHandle(*h),
            SpiceError::NotConnected => SpiceError::NotConnected,
            SpiceError::TransportEof => SpiceError::TransportEof,
            SpiceError::Tls(s) => SpiceError::Tls(s.clone()),
            SpiceError::Io(e) => SpiceError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpiceError>;
