//! Error types for the PAGI realtime session engine

use thiserror::Error;

/// Result type alias for session operations
pub type RealtimeResult<T> = Result<T, SessionError>;

/// Classified failure while acquiring or driving an audio device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device not found: {0}")]
    NotFound(String),

    #[error("Audio device busy: {0}")]
    Busy(String),

    #[error("Audio device error: {0}")]
    Other(String),
}

/// Failure reported by a transport connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out after {0} ms")]
    Timeout(u64),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Not connected")]
    NotConnected,
}

/// Both endpoints of a failover pair refused the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Primary endpoint failed: {primary}; backup endpoint failed: {backup}")]
    BothFailed { primary: String, backup: String },
}

/// Wire payload could not be turned into PCM.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Channel count must be at least 1")]
    ZeroChannels,

    #[error("Payload of {0} bytes is not whole 16-bit samples")]
    OddByteLength(usize),

    #[error("{samples} samples cannot be split evenly across {channels} channels")]
    ChannelMismatch { samples: usize, channels: u16 },
}

/// Errors raised by tool handlers and argument parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Configuration could not be read or failed validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by `VoiceSession::start`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Cannot start session while {0}")]
    InvalidState(crate::session::SessionStatus),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Session was stopped while connecting")]
    Cancelled,
}
