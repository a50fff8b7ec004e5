// Standard library imports
use std::collections::HashMap;

// External crate imports
use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

// Internal crate imports
use crate::constants::{
    AUTHENTICATION_CLEAR_PASSWORD, AUTHENTICATION_SUCCESSFUL, MD5_ENCRYPTED_PASSWORD,
    MESSAGE_TERMINATOR,
};
use crate::errors::Error;
use crate::messages::error::ErrorInfo;
use crate::messages::socket::write_all_flush;
use crate::statements::Column;

/// Create an AuthenticationOk message.
pub fn auth_ok() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(AUTHENTICATION_SUCCESSFUL);
    bytes
}

/// Generate md5 password challenge.
pub async fn md5_challenge<S>(stream: &mut S) -> Result<[u8; 4], Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin + ?Sized,
{
    let salt: [u8; 4] = [
        rand::random(),
        rand::random(),
        rand::random(),
        rand::random(),
    ];

    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(12);
    res.put_i32(MD5_ENCRYPTED_PASSWORD);
    res.put_slice(&salt[..]);

    match write_all_flush(stream, &res).await {
        Ok(_) => Ok(salt),
        Err(err) => Err(err),
    }
}

/// Generate plain password challenge.
pub async fn plain_password_challenge<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin + ?Sized,
{
    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(8);
    res.put_i32(AUTHENTICATION_CLEAR_PASSWORD);

    write_all_flush(stream, &res).await
}

/// Read a password message from the client.
pub async fn read_password<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin + ?Sized,
{
    let mut code = [0u8; 1];
    match stream.read_exact(&mut code).await {
        Ok(_) => {}
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read password message type identifier: {err}"
            )))
        }
    }

    if code[0] != b'p' {
        return Err(Error::ProtocolViolation(format!(
            "Expected password message (p), received '{}' instead",
            code[0] as char
        )));
    }

    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read password message length: {err}"
            )))
        }
    }

    let len = i32::from_be_bytes(len_buf);
    if len < 4 {
        return Err(Error::ProtocolViolation(format!(
            "Password message length is too small: {len}"
        )));
    }

    let mut password = vec![0u8; (len - 4) as usize];
    match stream.read_exact(&mut password).await {
        Ok(_) => {}
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read password message content: {err}"
            )))
        }
    }

    Ok(password)
}

/// Create md5 password hash given a salt.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();

    // First pass
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());

    let output = md5.finalize_reset();

    // Second pass
    md5_hash_second_pass(&(format!("{output:x}")), salt)
}

pub fn md5_hash_second_pass(hash: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(hash);
    md5.update(salt);

    let mut password = format!("md5{:x}", md5.finalize())
        .chars()
        .map(|x| x as u8)
        .collect::<Vec<u8>>();
    password.push(0);

    password
}

/// Parse the startup payload the client sends as a key/value format.
pub fn parse_params(mut bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let mut result = HashMap::new();
    let mut buf = Vec::new();
    let mut tmp = String::new();

    while bytes.has_remaining() {
        let mut c = bytes.get_u8();

        // Null-terminated C-strings.
        while c != 0 {
            tmp.push(c as char);
            if !bytes.has_remaining() {
                return Err(Error::ClientBadStartup);
            }
            c = bytes.get_u8();
        }

        if !tmp.is_empty() {
            buf.push(tmp.clone());
            tmp.clear();
        }
    }

    // Expect pairs of name and value
    // and at least one pair to be present.
    if buf.len() % 2 != 0 || buf.len() < 2 {
        return Err(Error::ProtocolViolation(format!(
            "Invalid client startup message: Expected key-value pairs, but received {} parameters",
            buf.len()
        )));
    }

    for chunk in buf.chunks(2) {
        result.insert(chunk[0].clone(), chunk[1].clone());
    }

    Ok(result)
}

/// Parse StartupMessage parameters.
/// e.g. user, database, application_name, etc.
pub fn parse_startup(bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let result = parse_params(bytes)?;

    // The user is required at the very minimum, according to the protocol spec.
    if !result.contains_key("user") {
        return Err(Error::ClientBadStartup);
    }

    Ok(result)
}

/// Create a ParameterStatus message.
pub fn parameter_status(key: &str, value: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'S');
    bytes.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    bytes.put_slice(key.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(value.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create a BackendKeyData message.
pub fn backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Create a ReadyForQuery message carrying the transaction status indicator.
pub fn ready_for_query(status: u8) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(status);
    bytes
}

/// Create a CommandComplete message.
pub fn command_complete(tag: &str) -> BytesMut {
    let mut res = BytesMut::new();
    res.put_u8(b'C');
    res.put_i32(tag.len() as i32 + 4 + 1);
    res.put_slice(tag.as_bytes());
    res.put_u8(0);
    res
}

/// Create an EmptyQueryResponse message.
pub fn empty_query_response() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'I');
    bytes.put_i32(4);
    bytes
}

/// Create a ParseComplete message.
pub fn parse_complete() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'1');
    bytes.put_i32(4);
    bytes
}

/// Create a BindComplete message.
pub fn bind_complete() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'2');
    bytes.put_i32(4);
    bytes
}

/// Create a CloseComplete message.
pub fn close_complete() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'3');
    bytes.put_i32(4);
    bytes
}

/// Create a PortalSuspended message.
pub fn portal_suspended() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b's');
    bytes.put_i32(4);
    bytes
}

/// Create a NoData message.
pub fn no_data() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'n');
    bytes.put_i32(4);
    bytes
}

/// Create a ParameterDescription message from the declared parameter OIDs.
pub fn parameter_description(oids: &[u32]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut body = BytesMut::new();

    body.put_i16(oids.len() as i16);
    for oid in oids {
        body.put_i32(*oid as i32);
    }

    res.put_u8(b't');
    res.put_i32(body.len() as i32 + 4);
    res.put(body);
    res
}

/// Create a RowDescription message. `formats` carries the per-column output
/// format codes; when empty all columns are described as text.
pub fn row_description(columns: &[Column], formats: &[i16]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut row_desc = BytesMut::new();

    // how many columns we are storing
    row_desc.put_i16(columns.len() as i16);

    for (index, column) in columns.iter().enumerate() {
        // Column name
        row_desc.put_slice(column.name.as_bytes());
        row_desc.put_u8(0);

        // Originating table and attribute, zero when not backed by a table.
        row_desc.put_i32(column.table_oid as i32);
        row_desc.put_i16(column.attr_number);

        // Type oid, width and modifier.
        row_desc.put_i32(column.type_oid as i32);
        row_desc.put_i16(column.type_width);
        row_desc.put_i32(column.type_modifier);

        // Format code, text unless the portal bound this column binary.
        let format = formats.get(index).copied().unwrap_or(0);
        row_desc.put_i16(format);
    }

    res.put_u8(b'T');
    res.put_i32(row_desc.len() as i32 + 4);
    res.put(row_desc);

    res
}

/// Create a DataRow message from encoded column values. `None` encodes a SQL
/// NULL as length -1.
pub fn data_row(row: &[Option<Vec<u8>>]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut data_row = BytesMut::new();

    // how many columns we are storing
    data_row.put_i16(row.len() as i16);

    for value in row {
        match value {
            Some(value) => {
                data_row.put_i32(value.len() as i32);
                data_row.put_slice(value);
            }
            None => {
                data_row.put_i32(-1);
            }
        }
    }

    res.put_u8(b'D');
    res.put_i32(data_row.len() as i32 + 4);
    res.put(data_row);

    res
}

/// Create a CopyInResponse message.
pub fn copy_in_response(binary: bool, column_formats: &[i16]) -> BytesMut {
    copy_response(b'G', binary, column_formats)
}

/// Create a CopyOutResponse message.
pub fn copy_out_response(binary: bool, column_formats: &[i16]) -> BytesMut {
    copy_response(b'H', binary, column_formats)
}

fn copy_response(code: u8, binary: bool, column_formats: &[i16]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut body = BytesMut::new();

    body.put_u8(binary as u8);
    body.put_i16(column_formats.len() as i16);
    for format in column_formats {
        body.put_i16(*format);
    }

    res.put_u8(code);
    res.put_i32(body.len() as i32 + 4);
    res.put(body);
    res
}

/// Create a CopyData message.
pub fn copy_data(data: &[u8]) -> BytesMut {
    let mut res = BytesMut::new();
    res.put_u8(b'd');
    res.put_i32(data.len() as i32 + 4);
    res.put_slice(data);
    res
}

/// Create a CopyDone message.
pub fn copy_done() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'c');
    bytes.put_i32(4);
    bytes
}

/// Create a CopyFail message.
pub fn copy_fail(reason: &str) -> BytesMut {
    let mut res = BytesMut::new();
    res.put_u8(b'f');
    res.put_i32(4 + reason.len() as i32 + 1);
    res.put_slice(reason.as_bytes());
    res.put_u8(0);
    res
}

/// Create an ErrorResponse message.
pub fn error_response(info: &ErrorInfo) -> BytesMut {
    let mut res = BytesMut::new();
    let body = info.to_bytes();

    res.put_u8(b'E');
    res.put_i32(body.len() as i32 + 4 + 1);
    res.put(body);
    res.put_u8(MESSAGE_TERMINATOR);
    res
}
