// Frontend messages of the extended query protocol. Each struct parses the
// payload of one typed frame, with the code and length header already
// stripped by the frame reader.

// Standard library imports
use std::io::Cursor;

// External crate imports
use bytes::{Buf, BytesMut};

// Internal crate imports
use crate::errors::Error;
use crate::messages::types::BytesMutReader;

fn remaining(cursor: &Cursor<&BytesMut>) -> usize {
    cursor.get_ref().len() - cursor.position() as usize
}

fn need(cursor: &Cursor<&BytesMut>, bytes: usize, what: &str) -> Result<(), Error> {
    if remaining(cursor) < bytes {
        return Err(Error::ProtocolViolation(format!(
            "Truncated message while reading {what}"
        )));
    }
    Ok(())
}

/// Parse (F) message.
/// See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[derive(Clone, Debug, PartialEq)]
pub struct Parse {
    pub name: String,
    pub query: String,
    pub param_types: Vec<u32>,
}

impl TryFrom<&BytesMut> for Parse {
    type Error = Error;

    fn try_from(buf: &BytesMut) -> Result<Parse, Error> {
        let mut cursor = Cursor::new(buf);
        let name = cursor.read_string()?;
        let query = cursor.read_string()?;

        need(&cursor, 2, "Parse parameter count")?;
        let num_params = cursor.get_i16();
        if num_params < 0 {
            return Err(Error::ProtocolViolation(
                "Negative parameter count in Parse".to_string(),
            ));
        }

        need(&cursor, num_params as usize * 4, "Parse parameter types")?;
        let mut param_types = Vec::with_capacity(num_params as usize);
        for _ in 0..num_params {
            param_types.push(cursor.get_i32() as u32);
        }

        Ok(Parse {
            name,
            query,
            param_types,
        })
    }
}

impl Parse {
    pub fn anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// One bound parameter value as it arrived on the wire. A length of -1
/// denotes the SQL NULL and is carried as `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct BindParameter {
    pub data: Option<Vec<u8>>,
}

/// Bind (B) message.
/// See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[derive(Clone, Debug, PartialEq)]
pub struct Bind {
    pub portal: String,
    pub statement: String,
    pub parameter_formats: Vec<i16>,
    pub parameters: Vec<BindParameter>,
    pub result_formats: Vec<i16>,
}

impl TryFrom<&BytesMut> for Bind {
    type Error = Error;

    fn try_from(buf: &BytesMut) -> Result<Bind, Error> {
        let mut cursor = Cursor::new(buf);
        let portal = cursor.read_string()?;
        let statement = cursor.read_string()?;

        need(&cursor, 2, "Bind format count")?;
        let num_formats = cursor.get_i16();
        if num_formats < 0 {
            return Err(Error::ProtocolViolation(
                "Negative format count in Bind".to_string(),
            ));
        }
        need(&cursor, num_formats as usize * 2, "Bind parameter formats")?;
        let mut parameter_formats = Vec::with_capacity(num_formats as usize);
        for _ in 0..num_formats {
            parameter_formats.push(cursor.get_i16());
        }

        need(&cursor, 2, "Bind parameter count")?;
        let num_values = cursor.get_i16();
        if num_values < 0 {
            return Err(Error::ProtocolViolation(
                "Negative parameter count in Bind".to_string(),
            ));
        }
        let mut parameters = Vec::with_capacity(num_values as usize);
        for _ in 0..num_values {
            need(&cursor, 4, "Bind parameter length")?;
            let len = cursor.get_i32();
            if len < 0 {
                parameters.push(BindParameter { data: None });
                continue;
            }
            need(&cursor, len as usize, "Bind parameter value")?;
            let start = cursor.position() as usize;
            let data = buf[start..start + len as usize].to_vec();
            cursor.advance(len as usize);
            parameters.push(BindParameter { data: Some(data) });
        }

        need(&cursor, 2, "Bind result format count")?;
        let num_result_formats = cursor.get_i16();
        if num_result_formats < 0 {
            return Err(Error::ProtocolViolation(
                "Negative result format count in Bind".to_string(),
            ));
        }
        need(
            &cursor,
            num_result_formats as usize * 2,
            "Bind result formats",
        )?;
        let mut result_formats = Vec::with_capacity(num_result_formats as usize);
        for _ in 0..num_result_formats {
            result_formats.push(cursor.get_i16());
        }

        Ok(Bind {
            portal,
            statement,
            parameter_formats,
            parameters,
            result_formats,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

/// Describe (F) message.
#[derive(Clone, Debug, PartialEq)]
pub struct Describe {
    pub target: DescribeTarget,
    pub name: String,
}

impl TryFrom<&BytesMut> for Describe {
    type Error = Error;

    fn try_from(buf: &BytesMut) -> Result<Describe, Error> {
        let mut cursor = Cursor::new(buf);
        need(&cursor, 1, "Describe target")?;
        let target = match cursor.get_u8() {
            b'S' => DescribeTarget::Statement,
            b'P' => DescribeTarget::Portal,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "Invalid describe target '{}'",
                    other as char
                )))
            }
        };
        let name = cursor.read_string()?;

        Ok(Describe { target, name })
    }
}

/// Execute (F) message.
#[derive(Clone, Debug, PartialEq)]
pub struct Execute {
    pub portal: String,
    /// Maximum number of rows to return before suspending the portal,
    /// zero for no limit.
    pub max_rows: i32,
}

impl TryFrom<&BytesMut> for Execute {
    type Error = Error;

    fn try_from(buf: &BytesMut) -> Result<Execute, Error> {
        let mut cursor = Cursor::new(buf);
        let portal = cursor.read_string()?;
        need(&cursor, 4, "Execute row limit")?;
        let max_rows = cursor.get_i32();

        Ok(Execute { portal, max_rows })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseTarget {
    Statement,
    Portal,
}

/// Close (F) message.
#[derive(Clone, Debug, PartialEq)]
pub struct Close {
    pub target: CloseTarget,
    pub name: String,
}

impl TryFrom<&BytesMut> for Close {
    type Error = Error;

    fn try_from(buf: &BytesMut) -> Result<Close, Error> {
        let mut cursor = Cursor::new(buf);
        need(&cursor, 1, "Close target")?;
        let target = match cursor.get_u8() {
            b'S' => CloseTarget::Statement,
            b'P' => CloseTarget::Portal,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "Invalid close target '{}'",
                    other as char
                )))
            }
        };
        let name = cursor.read_string()?;

        Ok(Close { target, name })
    }
}
