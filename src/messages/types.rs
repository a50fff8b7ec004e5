// Standard library imports
use std::io::{BufRead, Cursor};

// External crate imports
use bytes::BytesMut;

// Internal crate imports
use crate::errors::Error;

/// Trait for reading NUL-terminated strings from BytesMut.
pub trait BytesMutReader {
    fn read_string(&mut self) -> Result<String, Error>;
}

impl BytesMutReader for Cursor<&BytesMut> {
    /// Should only be used when reading strings from the message protocol.
    /// Can be used to read multiple strings from the same message which are separated by the null byte
    fn read_string(&mut self) -> Result<String, Error> {
        let mut buf = vec![];
        match self.read_until(b'\0', &mut buf) {
            Ok(0) => Err(Error::ParseBytesError("Unexpected end of message".to_string())),
            Ok(_) => {
                if buf.last() != Some(&b'\0') {
                    return Err(Error::ParseBytesError(
                        "String terminator missing".to_string(),
                    ));
                }
                Ok(String::from_utf8_lossy(&buf[..buf.len() - 1]).to_string())
            }
            Err(err) => Err(Error::ParseBytesError(err.to_string())),
        }
    }
}

impl BytesMutReader for BytesMut {
    /// Should only be used when reading strings from the message protocol.
    /// Can be used to read multiple strings from the same message which are separated by the null byte
    fn read_string(&mut self) -> Result<String, Error> {
        let null_index = self.iter().position(|&byte| byte == b'\0');

        match null_index {
            Some(index) => {
                let string_bytes = self.split_to(index + 1);
                Ok(String::from_utf8_lossy(&string_bytes[..string_bytes.len() - 1]).to_string())
            }
            None => Err(Error::ParseBytesError("Could not read string".to_string())),
        }
    }
}
