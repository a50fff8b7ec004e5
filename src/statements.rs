//! Prepared statements, portals and the writer handed to statement
//! callbacks.

// Standard library imports
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;

// External crate imports
use async_trait::async_trait;
use bytes::BytesMut;
use lru::LruCache;
use tokio::sync::mpsc;

// Internal crate imports
use crate::copy::{CopyChunk, CopyReader};
use crate::datatypes::{Format, Oid, TypeRegistry, Value};
use crate::errors::Error;
use crate::messages::{
    command_complete, copy_data, copy_done, copy_in_response, copy_out_response, data_row,
    empty_query_response,
};
use crate::session::Session;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The execute callback of a prepared statement. Receives the session, a
/// writer for the result stream and the bound parameters.
pub type StatementFn = Arc<
    dyn for<'a> Fn(
            &'a Arc<Session>,
            &'a mut DataWriter,
            &'a [Parameter],
        ) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync,
>;

/// Turns a query string into one or more prepared statements. The only
/// required piece of host logic; everything between the socket and this
/// trait is owned by the library.
#[async_trait]
pub trait QueryParser: Send + Sync {
    async fn parse(
        &self,
        session: &Arc<Session>,
        query: &str,
    ) -> Result<Vec<PreparedStatement>, Error>;
}

/// One column of a result set description.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub table_oid: Oid,
    pub attr_number: i16,
    pub type_oid: Oid,
    pub type_width: i16,
    pub type_modifier: i32,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: Oid, type_width: i16) -> Column {
        Column {
            name: name.into(),
            table_oid: 0,
            attr_number: 0,
            type_oid,
            type_width,
            type_modifier: -1,
        }
    }
}

/// A bound parameter: the declared type OID, the wire format, the raw bytes
/// exactly as received, and the decoded value. NULL arrives as `data: None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub type_oid: Oid,
    pub format: Format,
    pub data: Option<Vec<u8>>,
    pub value: Value,
}

/// An immutable parsed statement: the execute callback plus the declared
/// result columns and parameter types.
#[derive(Clone)]
pub struct PreparedStatement {
    pub(crate) handler: StatementFn,
    pub columns: Vec<Column>,
    pub parameters: Vec<Oid>,
}

impl PreparedStatement {
    pub fn new<F>(handler: F) -> PreparedStatement
    where
        F: for<'a> Fn(
                &'a Arc<Session>,
                &'a mut DataWriter,
                &'a [Parameter],
            ) -> BoxFuture<'a, Result<(), Error>>
            + Send
            + Sync
            + 'static,
    {
        PreparedStatement {
            handler: Arc::new(handler),
            columns: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> PreparedStatement {
        self.columns = columns;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Oid>) -> PreparedStatement {
        self.parameters = parameters;
        self
    }
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("columns", &self.columns)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// A statement-cache entry: the original query and its parse result. One
/// Parse may produce a compound of several statements which execute in order
/// under a single extended-query cycle.
#[derive(Clone)]
pub struct CachedStatement {
    pub query: String,
    pub statements: Arc<Vec<PreparedStatement>>,
    pub param_types: Vec<Oid>,
}

impl CachedStatement {
    /// The columns reported by Describe. A compound statement reports the
    /// first set of declared columns.
    pub(crate) fn described_columns(&self) -> &[Column] {
        self.statements
            .iter()
            .find(|statement| !statement.columns.is_empty())
            .map(|statement| statement.columns.as_slice())
            .unwrap_or(&[])
    }
}

/// A portal: a statement bound to concrete parameter values and result
/// format codes, ready for Execute.
#[derive(Clone)]
pub struct CachedPortal {
    pub statement: CachedStatement,
    pub parameters: Arc<Vec<Parameter>>,
    pub result_formats: Vec<i16>,
}

/// Mapping from statement name to cache entry. The empty name is the
/// unnamed statement, overwritten by each new Parse. Eviction is the
/// cache's business.
pub trait StatementCache: Send {
    fn put(&mut self, name: String, statement: CachedStatement);
    fn get(&mut self, name: &str) -> Option<CachedStatement>;
    fn remove(&mut self, name: &str) -> Option<CachedStatement>;
}

/// Mapping from portal name to bound portal. The empty name is the unnamed
/// portal, overwritten on each Bind.
pub trait PortalCache: Send {
    fn put(&mut self, name: String, portal: CachedPortal);
    fn get(&mut self, name: &str) -> Option<CachedPortal>;
    fn remove(&mut self, name: &str) -> Option<CachedPortal>;
}

pub type StatementCacheFactory = Arc<dyn Fn() -> Box<dyn StatementCache> + Send + Sync>;
pub type PortalCacheFactory = Arc<dyn Fn() -> Box<dyn PortalCache> + Send + Sync>;

/// Unbounded cache used unless the host configures otherwise.
#[derive(Default)]
pub struct HashMapStatementCache {
    entries: HashMap<String, CachedStatement>,
}

impl StatementCache for HashMapStatementCache {
    fn put(&mut self, name: String, statement: CachedStatement) {
        self.entries.insert(name, statement);
    }

    fn get(&mut self, name: &str) -> Option<CachedStatement> {
        self.entries.get(name).cloned()
    }

    fn remove(&mut self, name: &str) -> Option<CachedStatement> {
        self.entries.remove(name)
    }
}

#[derive(Default)]
pub struct HashMapPortalCache {
    entries: HashMap<String, CachedPortal>,
}

impl PortalCache for HashMapPortalCache {
    fn put(&mut self, name: String, portal: CachedPortal) {
        self.entries.insert(name, portal);
    }

    fn get(&mut self, name: &str) -> Option<CachedPortal> {
        self.entries.get(name).cloned()
    }

    fn remove(&mut self, name: &str) -> Option<CachedPortal> {
        self.entries.remove(name)
    }
}

/// Bounded statement cache evicting least recently used entries. The
/// unnamed statement is pinned in a dedicated slot so eviction can never
/// drop it mid-cycle.
pub struct LruStatementCache {
    unnamed: Option<CachedStatement>,
    entries: LruCache<String, CachedStatement>,
}

impl LruStatementCache {
    pub fn new(capacity: usize) -> LruStatementCache {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        LruStatementCache {
            unnamed: None,
            entries: LruCache::new(capacity),
        }
    }
}

impl StatementCache for LruStatementCache {
    fn put(&mut self, name: String, statement: CachedStatement) {
        if name.is_empty() {
            self.unnamed = Some(statement);
        } else {
            self.entries.put(name, statement);
        }
    }

    fn get(&mut self, name: &str) -> Option<CachedStatement> {
        if name.is_empty() {
            self.unnamed.clone()
        } else {
            self.entries.get(name).cloned()
        }
    }

    fn remove(&mut self, name: &str) -> Option<CachedStatement> {
        if name.is_empty() {
            self.unnamed.take()
        } else {
            self.entries.pop(name)
        }
    }
}

/// Expand the format codes of a Bind message: zero codes means all text,
/// one code applies to every column, otherwise one code per column.
pub(crate) fn normalize_formats(codes: &[i16], count: usize) -> Result<Vec<Format>, Error> {
    match codes.len() {
        0 => Ok(vec![Format::Text; count]),
        1 => Ok(vec![Format::from_code(codes[0])?; count]),
        n if n == count => codes.iter().map(|code| Format::from_code(*code)).collect(),
        n => Err(Error::ProtocolViolation(format!(
            "Expected 0, 1 or {count} format codes, received {n}"
        ))),
    }
}

/// How a statement execution ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExecOutcome {
    /// The callback completed; CommandComplete is already in the output.
    Complete,
    /// The row limit was reached; the caller emits PortalSuspended.
    Suspended,
    /// The callback failed; the caller emits the ErrorResponse.
    Failed(Error),
}

/// Handle used by the command loop to service a copy-in request raised by a
/// statement callback: the callback side reads from the channel, the
/// command loop feeds it with incoming CopyData payloads.
pub(crate) struct CopyHandoff {
    pub chunk_tx: mpsc::Sender<CopyChunk>,
}

/// The writer handed to statement callbacks. Rows are encoded through the
/// session type registry using the format code of each result column.
///
/// Output accumulates in an internal buffer. In the direct (non-pipelined)
/// path the buffer is streamed to the socket on [`DataWriter::flush`] and
/// at completion; a pipelined task keeps everything buffered so the
/// assembler can flush whole tasks in submission order.
pub struct DataWriter {
    buf: BytesMut,
    chunk_tx: Option<mpsc::Sender<BytesMut>>,
    copy_tx: Option<mpsc::Sender<CopyHandoff>>,
    columns: Vec<Column>,
    formats: Vec<Format>,
    registry: Arc<TypeRegistry>,
    row_limit: u64,
    rows_written: u64,
    completed: bool,
}

impl DataWriter {
    pub(crate) fn new(
        columns: Vec<Column>,
        formats: Vec<Format>,
        registry: Arc<TypeRegistry>,
        row_limit: u64,
        chunk_tx: Option<mpsc::Sender<BytesMut>>,
        copy_tx: Option<mpsc::Sender<CopyHandoff>>,
    ) -> DataWriter {
        DataWriter {
            buf: BytesMut::new(),
            chunk_tx,
            copy_tx,
            columns,
            formats,
            registry,
            row_limit,
            rows_written: 0,
            completed: false,
        }
    }

    /// Emit one DataRow. Values are encoded according to the declared
    /// column types and the formats bound by the portal.
    pub async fn row(&mut self, values: &[Value]) -> Result<(), Error> {
        if !self.columns.is_empty() && values.len() != self.columns.len() {
            return Err(Error::EncodeError(format!(
                "Row has {} values but the statement declared {} columns",
                values.len(),
                self.columns.len()
            )));
        }

        if self.row_limit > 0 && self.rows_written >= self.row_limit {
            return Err(Error::PortalSuspended);
        }

        let mut encoded = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            let oid = self
                .columns
                .get(index)
                .map(|column| column.type_oid)
                .unwrap_or(crate::datatypes::oid::TEXT);
            let format = self.formats.get(index).copied().unwrap_or(Format::Text);
            encoded.push(self.registry.encode(oid, value, format)?);
        }

        self.buf.extend_from_slice(&data_row(&encoded));
        self.rows_written += 1;
        Ok(())
    }

    /// Emit CommandComplete with the given tag, ending the result stream of
    /// this statement.
    pub async fn complete(&mut self, tag: &str) -> Result<(), Error> {
        self.buf.extend_from_slice(&command_complete(tag));
        self.completed = true;
        self.flush().await
    }

    /// Emit EmptyQueryResponse, for statements with nothing to execute.
    pub async fn empty(&mut self) -> Result<(), Error> {
        self.buf.extend_from_slice(&empty_query_response());
        self.completed = true;
        self.flush().await
    }

    /// Start a copy-in stream: emits CopyInResponse and returns the reader
    /// for the logical byte stream the client sends through CopyData
    /// messages. The reader yields a clean end-of-stream on CopyDone and an
    /// error carrying the client message on CopyFail.
    pub async fn copy_in(
        &mut self,
        binary: bool,
        column_formats: &[i16],
    ) -> Result<CopyReader, Error> {
        let copy_tx = self.copy_tx.clone().ok_or_else(|| {
            Error::ProtocolViolation("COPY is not available in this context".to_string())
        })?;

        self.buf
            .extend_from_slice(&copy_in_response(binary, column_formats));
        // The response has to reach the client before it starts streaming.
        self.flush().await?;

        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        copy_tx
            .send(CopyHandoff { chunk_tx })
            .await
            .map_err(|_| Error::SocketError("Connection closed during copy".to_string()))?;

        Ok(CopyReader::new(chunk_rx))
    }

    /// Start a copy-out stream: emits CopyOutResponse. Use
    /// [`DataWriter::copy_chunk`] for the data frames and
    /// [`DataWriter::copy_end`] to terminate.
    pub async fn copy_out(&mut self, binary: bool, column_formats: &[i16]) -> Result<(), Error> {
        self.buf
            .extend_from_slice(&copy_out_response(binary, column_formats));
        self.flush().await
    }

    /// Emit one CopyData frame of a copy-out stream.
    pub async fn copy_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(&copy_data(data));
        Ok(())
    }

    /// Terminate a copy-out stream with CopyDone.
    pub async fn copy_end(&mut self) -> Result<(), Error> {
        self.buf.extend_from_slice(&copy_done());
        self.flush().await
    }

    /// Push buffered output towards the client. A no-op for pipelined
    /// tasks, whose output is flushed by the assembler once every earlier
    /// task has flushed.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if let Some(chunk_tx) = &self.chunk_tx {
            if !self.buf.is_empty() {
                let chunk = self.buf.split();
                chunk_tx
                    .send(chunk)
                    .await
                    .map_err(|_| Error::SocketError("Connection closed".to_string()))?;
            }
        }
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub(crate) fn completed(&self) -> bool {
        self.completed
    }

    /// Append an already framed message to the output, e.g. the
    /// RowDescription of a simple query.
    pub(crate) fn push_frame(&mut self, frame: BytesMut) {
        self.buf.extend_from_slice(&frame);
    }

    pub(crate) fn take_output(&mut self) -> BytesMut {
        self.buf.split()
    }
}
