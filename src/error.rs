use std::fmt;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Main error type for the skein cluster core
#[derive(Debug)]
pub enum SkeinError {
    /// Configuration or CLI argument errors
    Config(String),

    /// A frame on the wire could not be decoded as a packet envelope
    MalformedFrame(String),

    /// A packet body did not match the shape the caller asked for
    PayloadDecode(String),

    /// Wrong or missing shared secret, or a rejected handshake
    Authentication(String),

    /// A peer with this name is already registered in the connection pool
    DuplicateName(String),

    /// Nothing was read from a peer within the read timeout
    ReadTimeout(Duration),

    /// Dialing a peer failed
    Dial(String),

    /// Dialing a peer did not complete within the connect timeout
    ConnectTimeout(String),

    /// Writing to one or more peers failed
    Write(String),

    /// TLS handshake with a peer failed
    Tls(String),

    /// The connection was closed, cancelled or shut down by the remote
    Closed(String),

    /// No connected or configured node with this name
    NodeNotFound(String),

    /// API/HTTP related errors
    Api(String),

    /// System I/O errors
    Io(std::io::Error),

    /// JSON serialization/deserialization errors
    Serialization(serde_json::Error),
}

impl fmt::Display for SkeinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkeinError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkeinError::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            SkeinError::PayloadDecode(msg) => write!(f, "Payload decode error: {}", msg),
            SkeinError::Authentication(msg) => write!(f, "Authentication error: {}", msg),
            SkeinError::DuplicateName(msg) => write!(f, "Duplicate node name: {}", msg),
            SkeinError::ReadTimeout(after) => {
                write!(f, "Read timeout: nothing received for {:?}", after)
            }
            SkeinError::Dial(msg) => write!(f, "Dial error: {}", msg),
            SkeinError::ConnectTimeout(msg) => write!(f, "Connect timeout: {}", msg),
            SkeinError::Write(msg) => write!(f, "Write error: {}", msg),
            SkeinError::Tls(msg) => write!(f, "TLS error: {}", msg),
            SkeinError::Closed(msg) => write!(f, "Connection closed: {}", msg),
            SkeinError::NodeNotFound(name) => write!(f, "Node not found: {}", name),
            SkeinError::Api(msg) => write!(f, "API error: {}", msg),
            SkeinError::Io(err) => write!(f, "I/O error: {}", err),
            SkeinError::Serialization(err) => write!(f, "Serialization error: {}", err),
        }
    }
}

impl std::error::Error for SkeinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkeinError::Io(err) => Some(err),
            SkeinError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, SkeinError>;

impl IntoResponse for SkeinError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "success": false,
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

impl SkeinError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            SkeinError::Config(_) => StatusCode::BAD_REQUEST,
            SkeinError::Api(_) => StatusCode::BAD_REQUEST,
            SkeinError::PayloadDecode(_) => StatusCode::BAD_REQUEST,
            SkeinError::Authentication(_) => StatusCode::UNAUTHORIZED,
            SkeinError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            SkeinError::DuplicateName(_) => StatusCode::CONFLICT,
            SkeinError::MalformedFrame(_)
            | SkeinError::ReadTimeout(_)
            | SkeinError::Dial(_)
            | SkeinError::ConnectTimeout(_)
            | SkeinError::Write(_)
            | SkeinError::Tls(_)
            | SkeinError::Closed(_) => StatusCode::SERVICE_UNAVAILABLE,
            SkeinError::Io(_) | SkeinError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            SkeinError::Config(_) => "configuration_error",
            SkeinError::MalformedFrame(_) => "malformed_frame",
            SkeinError::PayloadDecode(_) => "payload_decode_error",
            SkeinError::Authentication(_) => "authentication_error",
            SkeinError::DuplicateName(_) => "duplicate_name",
            SkeinError::ReadTimeout(_) => "read_timeout",
            SkeinError::Dial(_) => "dial_error",
            SkeinError::ConnectTimeout(_) => "connect_timeout",
            SkeinError::Write(_) => "write_error",
            SkeinError::Tls(_) => "tls_error",
            SkeinError::Closed(_) => "connection_closed",
            SkeinError::NodeNotFound(_) => "node_not_found",
            SkeinError::Api(_) => "api_error",
            SkeinError::Io(_) => "io_error",
            SkeinError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<std::io::Error> for SkeinError {
    fn from(err: std::io::Error) -> Self {
        SkeinError::Io(err)
    }
}

impl From<serde_json::Error> for SkeinError {
    fn from(err: serde_json::Error) -> Self {
        SkeinError::Serialization(err)
    }
}

impl From<reqwest::Error> for SkeinError {
    fn from(err: reqwest::Error) -> Self {
        SkeinError::Api(err.to_string())
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::SkeinError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::SkeinError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! api_error {
    ($msg:expr) => {
        $crate::error::SkeinError::Api($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::SkeinError::Api(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! auth_error {
    ($msg:expr) => {
        $crate::error::SkeinError::Authentication($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::SkeinError::Authentication(format!($fmt, $($arg)*))
    };
}
