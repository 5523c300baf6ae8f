use std::fmt;
use std::string::FromUtf8Error;
use std::time::SystemTimeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LockboxError>;

/// The subsystem a construction failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Log,
    Storage,
    Sender,
    Server,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::Log => "log",
            Subsystem::Storage => "storage",
            Subsystem::Sender => "sender",
            Subsystem::Server => "server",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum LockboxError {
    #[error(transparent)]
    FlagParse(#[from] clap::Error),
    #[error("Invalid value {value:?} for --{flag}: expected {expected}")]
    InvalidFlagValue {
        flag: String,
        value: String,
        expected: &'static str,
    },
    #[error("Unable to read config file {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {message}")]
    ConfigParse { path: String, message: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unable to construct {subsystem}: {reason}")]
    Construction { subsystem: Subsystem, reason: String },
    #[error("TLS material unavailable: {0}")]
    TlsMaterial(String),
    #[error("Server has already been stopped")]
    ServerStopped,
    #[error("Command does not start the server")]
    NotAServerCommand,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Invalid UTF-8 data: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("Message of {0} bytes exceeds the frame limit")]
    MessageTooLarge(usize),
    #[error("System time error: {0}")]
    Time(#[from] SystemTimeError),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Unable to send message: {0}")]
    Send(String),
    #[error("Client timed out")]
    ClientTimeout,
    #[error("Client disconnected")]
    ClientDisconnected,
}

impl LockboxError {
    pub(crate) fn construction(subsystem: Subsystem, reason: impl fmt::Display) -> Self {
        LockboxError::Construction {
            subsystem,
            reason: reason.to_string(),
        }
    }
}
