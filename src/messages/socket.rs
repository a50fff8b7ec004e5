// External crate imports
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Internal crate imports
use crate::errors::Error;
use crate::messages::MAX_MESSAGE_SIZE;

/// Write all data in the buffer to the stream.
pub async fn write_all<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin + ?Sized,
{
    match stream.write_all(buf).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Write all the data in the buffer to the stream and flush it.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin + ?Sized,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!(
                "Error flushing socket: {err:?}"
            ))),
        },
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Read the type byte of the next message. Reading a single byte is safe
/// to race in a select loop: a cancelled read consumes nothing.
pub async fn read_message_code<S>(stream: &mut S) -> Result<u8, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin + ?Sized,
{
    match stream.read_u8().await {
        Ok(code) => Ok(code),
        // EOF at a message boundary is a peer that simply went away.
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::ConnectionClosed)
        }
        Err(err) => Err(Error::SocketError(format!(
            "Error reading message code from socket: {err:?}"
        ))),
    }
}

/// Read the length and payload of a message whose type byte is already
/// known. Must run to completion; never race this in a select loop.
pub async fn read_message_body<S>(
    stream: &mut S,
    code: u8,
    max_message_size: i32,
) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin + ?Sized,
{
    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Error reading message len from socket - Code: {code:?}, Error: {err:?}"
            )))
        }
    };

    if len < 4 {
        return Err(Error::ProtocolViolation(format!(
            "Message length is too small: {len}"
        )));
    }
    if len > max_message_size || len > MAX_MESSAGE_SIZE {
        return Err(Error::MaxMessageSize);
    }

    let data_len = len as usize - 4;
    let mut data = vec![0u8; data_len];
    match stream.read_exact(&mut data).await {
        Ok(_) => Ok(BytesMut::from(&data[..])),
        Err(err) => Err(Error::SocketError(format!(
            "Error reading message data from socket - Code: {code:?}, Error: {err:?}"
        ))),
    }
}

/// Read one typed message from the stream. Every framed message is a type
/// byte, a big-endian i32 length including the length field itself, and the
/// payload. Returns the type byte and the payload with the header stripped.
pub async fn read_message<S>(stream: &mut S, max_message_size: i32) -> Result<(u8, BytesMut), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin + ?Sized,
{
    let code = read_message_code(stream).await?;
    let payload = read_message_body(stream, code, max_message_size).await?;
    Ok((code, payload))
}

/// Read the untyped startup frame: a big-endian i32 length including itself,
/// followed by the payload. The first four payload bytes carry the protocol
/// version or one of the request magics.
pub async fn read_startup_frame<S>(
    stream: &mut S,
    max_message_size: i32,
) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin + ?Sized,
{
    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(_) => return Err(Error::ClientBadStartup),
    };

    if len < 8 {
        return Err(Error::ClientBadStartup);
    }
    if len > max_message_size || len > MAX_MESSAGE_SIZE {
        return Err(Error::MaxMessageSize);
    }

    let mut startup = vec![0u8; len as usize - 4];
    match stream.read_exact(&mut startup).await {
        Ok(_) => Ok(BytesMut::from(&startup[..])),
        Err(_) => Err(Error::ClientBadStartup),
    }
}
