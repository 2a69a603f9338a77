//! Error types for the sticky render adaptor

use crate::types::error_codes;
use std::time::Duration;
use thiserror::Error;

/// Main error type for adaptor operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Adaptor error: {0}")]
    Adaptor(#[from] AdaptorError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error leaves the hosted application in an unknown state.
    ///
    /// Fatal errors end the sticky session; everything else is attributable
    /// to a single action or input and the host stays usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Channel(_) => true,
            Error::Adaptor(e) => e.is_fatal(),
            Error::Io(_) | Error::Internal(_) => true,
            _ => false,
        }
    }
}

/// Malformed input detected before anything is dispatched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown renderer: {0}")]
    UnknownRenderer(String),

    #[error("Invalid path mapping rules: {0}")]
    InvalidPathMapping(String),

    #[error("Invalid {what}: {reason}")]
    Malformed { what: String, reason: String },
}

/// Errors raised while dispatching a command inside the hosted application
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid parameters for '{command}': {message}")]
    InvalidParams { command: String, message: String },

    #[error("Command '{command}' failed: {message}")]
    HandlerFailed { command: String, message: String },
}

impl DispatchError {
    /// JSON-RPC error code carried on the wire for this error
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::UnknownCommand(_) => error_codes::UNKNOWN_COMMAND,
            DispatchError::InvalidParams { .. } => error_codes::INVALID_PARAMS,
            DispatchError::HandlerFailed { .. } => error_codes::HANDLER_FAILED,
        }
    }

    /// Message carried in the wire error, without the command prefix
    pub fn wire_message(&self) -> String {
        match self {
            DispatchError::UnknownCommand(command) => format!("Unknown command: {}", command),
            DispatchError::InvalidParams { message, .. } | DispatchError::HandlerFailed { message, .. } => message.clone(),
        }
    }

    /// Rebuild a dispatch error from a wire error
    pub fn from_wire(command: &str, code: i32, message: &str) -> Self {
        match code {
            error_codes::UNKNOWN_COMMAND => DispatchError::UnknownCommand(command.to_string()),
            error_codes::INVALID_PARAMS => DispatchError::InvalidParams {
                command: command.to_string(),
                message: message.to_string(),
            },
            _ => DispatchError::HandlerFailed {
                command: command.to_string(),
                message: message.to_string(),
            },
        }
    }
}

/// Command channel errors. All of them are fatal to the sticky session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Hosted application did not open the command channel within {secs}s")]
    StartupTimeout { secs: u64 },

    #[error("No response to '{action}' within {limit:?}")]
    Timeout { action: String, limit: Duration },

    #[error("Channel disconnected")]
    Disconnected,

    #[error("Channel is wedged after an earlier timeout and cannot be reused")]
    Wedged,

    #[error("Channel handshake rejected: {0}")]
    Unauthorized(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Local command channels are not supported on this platform")]
    Unsupported,
}

/// Action queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Action queue is closed; '{0}' cannot be accepted")]
    Closed(String),
}

/// Adaptor lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdaptorError {
    #[error("Init data has not been provided")]
    NotInitialized,

    #[error("The hosted application is not running")]
    NotRunning,

    #[error("The hosted application is already running")]
    AlreadyStarted,

    #[error("Failed to launch the hosted application: {0}")]
    SpawnFailed(String),

    #[error("Action '{action}' failed: {message}")]
    ActionFailed { action: String, message: String },

    #[error("{message}{}", format_recent(.recent_output))]
    Fatal {
        message: String,
        recent_output: Vec<String>,
    },

    #[error(
        "The hosted application exited early (exit code {}){}",
        format_code(.code),
        format_recent(.recent_output)
    )]
    HostExited {
        code: Option<i32>,
        recent_output: Vec<String>,
    },
}

impl AdaptorError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdaptorError::Fatal { .. } | AdaptorError::HostExited { .. } | AdaptorError::SpawnFailed(_)
        )
    }
}

fn format_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "unknown".to_string(),
    }
}

fn format_recent(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    format!("\nLast output from the hosted application:\n{}", lines.join("\n"))
}

/// Errors reported by the hosted application's scene interface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_wire_roundtrip_keeps_kind() {
        let err = DispatchError::UnknownCommand("start_render".to_string());
        let rebuilt = DispatchError::from_wire("start_render", err.code(), &err.wire_message());
        assert_eq!(rebuilt, err);

        let err = DispatchError::HandlerFailed {
            command: "scene_file".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.code(), error_codes::HANDLER_FAILED);
        let rebuilt = DispatchError::from_wire("scene_file", err.code(), &err.wire_message());
        assert_eq!(rebuilt.to_string(), "Command 'scene_file' failed: boom");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Channel(ChannelError::Disconnected).is_fatal());
        assert!(!Error::Validation(ValidationError::MissingField("frame".into())).is_fatal());
        assert!(!Error::Adaptor(AdaptorError::NotRunning).is_fatal());
        assert!(Error::Adaptor(AdaptorError::HostExited {
            code: Some(1),
            recent_output: vec![]
        })
        .is_fatal());
    }

    #[test]
    fn test_timeout_message_keeps_sub_second_limits() {
        let err = ChannelError::Timeout {
            action: "scene_file".to_string(),
            limit: Duration::from_millis(100),
        };
        assert_eq!(err.to_string(), "No response to 'scene_file' within 100ms");

        let err = ChannelError::Timeout {
            action: "start_render".to_string(),
            limit: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "No response to 'start_render' within 2s");
    }

    #[test]
    fn test_host_exited_message_includes_recent_output() {
        let err = AdaptorError::HostExited {
            code: Some(3),
            recent_output: vec!["line one".to_string(), "line two".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("line two"));
    }
}
