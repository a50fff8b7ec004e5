//! Errors.

use crate::messages::ErrorInfo;

/// Various errors.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    SocketError(String),
    /// The peer closed the socket between messages. Treated as a clean
    /// disconnect by the command loop.
    ConnectionClosed,
    ClientBadStartup,
    UnsupportedProtocolVersion(i32),
    ProtocolViolation(String),
    AuthError(String),
    TlsError(String),
    BadConfig(String),
    ParseBytesError(String),
    MaxMessageSize,
    ShuttingDown,
    CopyFailed(String),
    DecodeError(String),
    EncodeError(String),
    /// Returned by the parse or execute callback of the host. Carries the
    /// SQLSTATE and severity that end up in the ErrorResponse frame.
    QueryError(ErrorInfo),
    /// Control-flow sentinel raised by `DataWriter::row` once the Execute
    /// row limit is reached. Never surfaces on the wire.
    PortalSuspended,
}

impl Error {
    /// Construct a host failure with the default SQLSTATE (`XX000`) and
    /// severity (`ERROR`). Use [`Error::with_code`] and
    /// [`Error::with_severity`] to decorate.
    pub fn query(message: impl Into<String>) -> Error {
        Error::QueryError(ErrorInfo::new(message))
    }

    /// Attach a SQLSTATE code to a host failure. No-op for other variants.
    pub fn with_code(self, code: &str) -> Error {
        match self {
            Error::QueryError(info) => Error::QueryError(info.with_code(code)),
            other => other,
        }
    }

    /// Attach a severity level to a host failure. No-op for other variants.
    pub fn with_severity(self, severity: &str) -> Error {
        match self {
            Error::QueryError(info) => Error::QueryError(info.with_severity(severity)),
            other => other,
        }
    }

    /// The ErrorResponse frame content for this error, when it is one the
    /// client should see. Transport errors return `None`; the connection is
    /// torn down instead.
    pub(crate) fn to_error_info(&self) -> Option<ErrorInfo> {
        match self {
            Error::QueryError(info) => Some(info.clone()),
            Error::ProtocolViolation(msg) => Some(
                ErrorInfo::new(msg.clone()).with_code(crate::constants::SQLSTATE_PROTOCOL_VIOLATION),
            ),
            Error::MaxMessageSize => Some(
                ErrorInfo::new("message exceeds the maximum allowed size")
                    .with_code(crate::constants::SQLSTATE_PROTOCOL_VIOLATION),
            ),
            Error::AuthError(msg) => Some(
                ErrorInfo::new(msg.clone())
                    .with_code(crate::constants::SQLSTATE_INVALID_PASSWORD)
                    .with_severity("FATAL"),
            ),
            Error::DecodeError(msg) | Error::EncodeError(msg) => Some(
                ErrorInfo::new(msg.clone())
                    .with_code(crate::constants::SQLSTATE_INVALID_PARAMETER_VALUE),
            ),
            Error::CopyFailed(msg) => Some(
                ErrorInfo::new(msg.clone()).with_code(crate::constants::SQLSTATE_QUERY_CANCELED),
            ),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Error::SocketError(msg) => write!(f, "Socket connection error: {msg}"),
            Error::ConnectionClosed => write!(f, "Connection closed by peer"),
            Error::ClientBadStartup => write!(f, "Client sent an invalid startup message"),
            Error::UnsupportedProtocolVersion(version) => {
                write!(f, "Unsupported protocol version: {version}")
            }
            Error::ProtocolViolation(msg) => write!(f, "Protocol violation: {msg}"),
            Error::AuthError(msg) => write!(f, "Authentication failed: {msg}"),
            Error::TlsError(msg) => write!(f, "TLS connection error: {msg}"),
            Error::BadConfig(msg) => write!(f, "Configuration error: {msg}"),
            Error::ParseBytesError(msg) => write!(f, "Failed to parse bytes: {msg}"),
            Error::MaxMessageSize => write!(f, "Message exceeds maximum allowed size"),
            Error::ShuttingDown => write!(f, "Server is shutting down"),
            Error::CopyFailed(msg) => write!(f, "Copy failed: {msg}"),
            Error::DecodeError(msg) => write!(f, "Failed to decode value: {msg}"),
            Error::EncodeError(msg) => write!(f, "Failed to encode value: {msg}"),
            Error::QueryError(info) => write!(f, "{info}"),
            Error::PortalSuspended => write!(f, "Portal suspended"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::SocketError(err.to_string())
    }
}
