// Standard library imports
use std::fmt::{Display, Formatter};

// External crate imports
use bytes::{BufMut, BytesMut};

// Internal crate imports
use crate::constants::SQLSTATE_INTERNAL_ERROR;

/// The content of an ErrorResponse frame.
/// See: <https://www.postgresql.org/docs/current/protocol-error-fields.html>
///
/// Host callbacks can surface one of these through [`crate::errors::Error::query`]
/// to control the SQLSTATE and severity the client sees; undecorated errors
/// default to `XX000` / `ERROR`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub severity: String,        // S and V
    pub code: String,            // C
    pub message: String,         // M
    pub detail: Option<String>,  // D
    pub hint: Option<String>,    // H
    pub position: Option<u32>,   // P
    pub where_context: Option<String>, // W
    pub file_name: Option<String>,     // F
    pub line: Option<u32>,             // L
    pub routine: Option<String>,       // R
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            severity: "ERROR".to_string(),
            code: SQLSTATE_INTERNAL_ERROR.to_string(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            where_context: None,
            file_name: None,
            line: None,
            routine: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> ErrorInfo {
        self.code = code.to_string();
        self
    }

    pub fn with_severity(mut self, severity: &str) -> ErrorInfo {
        self.severity = severity.to_string();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> ErrorInfo {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> ErrorInfo {
        self.hint = Some(hint.into());
        self
    }

    /// Serialize the error fields with their single-byte tags. The caller
    /// frames the result and appends the terminator.
    pub fn to_bytes(&self) -> BytesMut {
        let mut body = BytesMut::new();

        // Severity, localized and non-localized.
        body.put_u8(b'S');
        body.put_slice(self.severity.as_bytes());
        body.put_u8(0);
        body.put_u8(b'V');
        body.put_slice(self.severity.as_bytes());
        body.put_u8(0);

        // SQLSTATE code.
        body.put_u8(b'C');
        body.put_slice(self.code.as_bytes());
        body.put_u8(0);

        // The short error message.
        body.put_u8(b'M');
        body.put_slice(self.message.as_bytes());
        body.put_u8(0);

        if let Some(val) = &self.detail {
            body.put_u8(b'D');
            body.put_slice(val.as_bytes());
            body.put_u8(0);
        }
        if let Some(val) = &self.hint {
            body.put_u8(b'H');
            body.put_slice(val.as_bytes());
            body.put_u8(0);
        }
        if let Some(val) = &self.position {
            body.put_u8(b'P');
            body.put_slice(val.to_string().as_bytes());
            body.put_u8(0);
        }
        if let Some(val) = &self.where_context {
            body.put_u8(b'W');
            body.put_slice(val.as_bytes());
            body.put_u8(0);
        }
        if let Some(val) = &self.file_name {
            body.put_u8(b'F');
            body.put_slice(val.as_bytes());
            body.put_u8(0);
        }
        if let Some(val) = &self.line {
            body.put_u8(b'L');
            body.put_slice(val.to_string().as_bytes());
            body.put_u8(0);
        }
        if let Some(val) = &self.routine {
            body.put_u8(b'R');
            body.put_slice(val.as_bytes());
            body.put_u8(0);
        }

        body
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} [{}]", self.severity, self.message, self.code)?;

        if let Some(val) = &self.detail {
            write!(f, " [detail: {val}]")?;
        }
        if let Some(val) = &self.hint {
            write!(f, " [hint: {val}]")?;
        }

        Ok(())
    }
}
