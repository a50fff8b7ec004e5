//! COPY subprotocol support.
//!
//! The command loop feeds incoming CopyData payloads into a channel; the
//! statement callback consumes them through [`CopyReader`] as one logical
//! byte stream, or through [`BinaryCopyReader`] as decoded binary tuples.

// External crate imports
use bytes::{Buf, BytesMut};
use tokio::sync::mpsc;

// Internal crate imports
use crate::errors::Error;

/// The COPY BINARY stream signature.
pub const BINARY_SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// One event of an inbound copy stream, as relayed by the command loop.
#[derive(Debug)]
pub(crate) enum CopyChunk {
    /// Payload of one CopyData message.
    Data(BytesMut),
    /// CopyDone: the logical stream ended cleanly.
    Done,
    /// CopyFail: the client aborted, carrying its message.
    Fail(String),
}

/// Reader over the logical byte stream of a copy-in operation. CopyData
/// payloads are concatenated; message boundaries carry no meaning.
pub struct CopyReader {
    chunk_rx: mpsc::Receiver<CopyChunk>,
    buffer: BytesMut,
    done: bool,
}

impl CopyReader {
    pub(crate) fn new(chunk_rx: mpsc::Receiver<CopyChunk>) -> CopyReader {
        CopyReader {
            chunk_rx,
            buffer: BytesMut::new(),
            done: false,
        }
    }

    /// Receive the next raw chunk of the stream. Returns `None` once the
    /// client sent CopyDone and every buffered byte has been consumed.
    pub async fn chunk(&mut self) -> Result<Option<BytesMut>, Error> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.split()));
        }
        if self.done {
            return Ok(None);
        }

        match self.chunk_rx.recv().await {
            Some(CopyChunk::Data(data)) => Ok(Some(data)),
            Some(CopyChunk::Done) | None => {
                self.done = true;
                Ok(None)
            }
            Some(CopyChunk::Fail(reason)) => {
                self.done = true;
                Err(Error::CopyFailed(reason))
            }
        }
    }

    /// Buffer at least `len` bytes. Returns false when the stream ended
    /// cleanly before the first requested byte.
    async fn fill(&mut self, len: usize) -> Result<bool, Error> {
        while self.buffer.len() < len {
            if self.done {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                return Err(Error::CopyFailed(
                    "Copy stream ended mid-value".to_string(),
                ));
            }
            match self.chunk_rx.recv().await {
                Some(CopyChunk::Data(data)) => self.buffer.extend_from_slice(&data),
                Some(CopyChunk::Done) | None => {
                    self.done = true;
                }
                Some(CopyChunk::Fail(reason)) => {
                    self.done = true;
                    return Err(Error::CopyFailed(reason));
                }
            }
        }
        Ok(true)
    }

    async fn read_exact(&mut self, len: usize, what: &str) -> Result<BytesMut, Error> {
        if !self.fill(len).await? {
            return Err(Error::CopyFailed(format!(
                "Copy stream ended while reading {what}"
            )));
        }
        Ok(self.buffer.split_to(len))
    }

    async fn read_i16(&mut self, what: &str) -> Result<i16, Error> {
        Ok(self.read_exact(2, what).await?.get_i16())
    }

    async fn read_i32(&mut self, what: &str) -> Result<i32, Error> {
        Ok(self.read_exact(4, what).await?.get_i32())
    }
}

/// Decoder for the COPY BINARY format: the PGCOPY header, then tuples of
/// length-prefixed fields, then the -1 trailer.
pub struct BinaryCopyReader {
    reader: CopyReader,
    header_read: bool,
    finished: bool,
}

impl BinaryCopyReader {
    pub fn new(reader: CopyReader) -> BinaryCopyReader {
        BinaryCopyReader {
            reader,
            header_read: false,
            finished: false,
        }
    }

    async fn read_header(&mut self) -> Result<(), Error> {
        let signature = self.reader.read_exact(11, "binary copy signature").await?;
        if signature[..] != BINARY_SIGNATURE[..] {
            return Err(Error::CopyFailed(
                "Invalid binary copy signature".to_string(),
            ));
        }

        let _flags = self.reader.read_i32("binary copy flags").await?;
        let extension_len = self.reader.read_i32("binary copy header extension").await?;
        if extension_len < 0 {
            return Err(Error::CopyFailed(
                "Negative binary copy header extension".to_string(),
            ));
        }
        if extension_len > 0 {
            self.reader
                .read_exact(extension_len as usize, "binary copy header extension")
                .await?;
        }

        self.header_read = true;
        Ok(())
    }

    /// Decode the next tuple. Fields arrive as raw bytes, `None` for NULL.
    /// Returns `None` after the trailer.
    pub async fn next_tuple(&mut self) -> Result<Option<Vec<Option<Vec<u8>>>>, Error> {
        if self.finished {
            return Ok(None);
        }
        if !self.header_read {
            self.read_header().await?;
        }

        let field_count = self.reader.read_i16("tuple field count").await?;
        if field_count == -1 {
            self.finished = true;
            return Ok(None);
        }
        if field_count < 0 {
            return Err(Error::CopyFailed(format!(
                "Invalid tuple field count {field_count}"
            )));
        }

        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let len = self.reader.read_i32("field length").await?;
            if len == -1 {
                fields.push(None);
                continue;
            }
            if len < 0 {
                return Err(Error::CopyFailed(format!("Invalid field length {len}")));
            }
            let data = self.reader.read_exact(len as usize, "field value").await?;
            fields.push(Some(data.to_vec()));
        }

        Ok(Some(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn feed(frames: Vec<CopyChunk>) -> CopyReader {
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            tx.try_send(frame).expect("channel has room");
        }
        drop(tx);
        CopyReader::new(rx)
    }

    fn binary_stream() -> BytesMut {
        let mut stream = BytesMut::new();
        stream.put_slice(BINARY_SIGNATURE);
        stream.put_i32(0); // flags
        stream.put_i32(0); // header extension

        // Two tuples with two fields each, the second field of the second
        // tuple is NULL.
        stream.put_i16(2);
        stream.put_i32(4);
        stream.put_i32(7);
        stream.put_i32(3);
        stream.put_slice(b"abc");

        stream.put_i16(2);
        stream.put_i32(4);
        stream.put_i32(8);
        stream.put_i32(-1);

        stream.put_i16(-1); // trailer
        stream
    }

    #[tokio::test]
    async fn binary_reader_decodes_tuples_and_eof() {
        let stream = binary_stream();
        let mut reader = BinaryCopyReader::new(feed(vec![
            CopyChunk::Data(stream),
            CopyChunk::Done,
        ]));

        let first = reader.next_tuple().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], Some(7i32.to_be_bytes().to_vec()));
        assert_eq!(first[1], Some(b"abc".to_vec()));

        let second = reader.next_tuple().await.unwrap().unwrap();
        assert_eq!(second[0], Some(8i32.to_be_bytes().to_vec()));
        assert_eq!(second[1], None);

        assert!(reader.next_tuple().await.unwrap().is_none());
        // The trailer is sticky.
        assert!(reader.next_tuple().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn binary_reader_handles_split_frames() {
        let stream = binary_stream();
        // Split the stream into single-byte CopyData payloads to prove that
        // message boundaries carry no meaning.
        let frames: Vec<CopyChunk> = stream
            .iter()
            .map(|byte| CopyChunk::Data(BytesMut::from(&[*byte][..])))
            .chain(std::iter::once(CopyChunk::Done))
            .collect();

        let mut reader = BinaryCopyReader::new(feed(frames));
        assert!(reader.next_tuple().await.unwrap().is_some());
        assert!(reader.next_tuple().await.unwrap().is_some());
        assert!(reader.next_tuple().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn copy_fail_surfaces_client_message() {
        let mut reader = BinaryCopyReader::new(feed(vec![CopyChunk::Fail(
            "client changed its mind".to_string(),
        )]));

        let err = reader.next_tuple().await.unwrap_err();
        assert_eq!(
            err,
            Error::CopyFailed("client changed its mind".to_string())
        );
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let mut stream = BytesMut::new();
        stream.put_slice(b"NOTPGCOPY\0\0");
        let mut reader = BinaryCopyReader::new(feed(vec![
            CopyChunk::Data(stream),
            CopyChunk::Done,
        ]));

        assert!(reader.next_tuple().await.is_err());
    }

    #[tokio::test]
    async fn raw_chunks_concatenate() {
        let mut reader = feed(vec![
            CopyChunk::Data(BytesMut::from(&b"hello "[..])),
            CopyChunk::Data(BytesMut::from(&b"world"[..])),
            CopyChunk::Done,
        ]);

        let mut collected = Vec::new();
        while let Some(chunk) = reader.chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello world");
    }
}
