//! Handle clients by pretending to be a PostgreSQL server.

// Standard library imports
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

// External crate imports
use bytes::{Buf, BytesMut};
use log::{debug, warn};
use once_cell::sync::Lazy;
use tokio::io::{split, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// Internal crate imports
use crate::config::ServerConfig;
use crate::constants::{
    CANCEL_REQUEST_CODE, REQUEST_GSSENCMODE_CODE, SQLSTATE_ADMIN_SHUTDOWN,
    SQLSTATE_INVALID_CURSOR_NAME, SQLSTATE_INVALID_SQL_STATEMENT_NAME,
    SQLSTATE_PROTOCOL_VIOLATION, SSL_REQUEST_CODE, TRANSACTION_STATUS_IDLE,
};
use crate::copy::CopyChunk;
use crate::datatypes::{oid, Oid, TypeRegistry};
use crate::errors::Error;
use crate::messages::{
    bind_complete, close_complete, command_complete, empty_query_response, error_response,
    no_data, parameter_description, parameter_status, parse_complete, parse_startup,
    portal_suspended, read_message_body, read_message_code, read_startup_frame, ready_for_query,
    row_description, write_all, write_all_flush, backend_key_data, Bind, BytesMutReader, Close,
    CloseTarget, Describe, DescribeTarget, ErrorInfo, Execute, Parse,
};
use crate::pipeline::{Pending, Pipeline};
use crate::session::Session;
use crate::statements::{
    normalize_formats, CachedPortal, CachedStatement, CopyHandoff, DataWriter, ExecOutcome,
    Parameter, PreparedStatement,
};

/// Process ids handed out through BackendKeyData. Incremental to avoid
/// collisions where the random number generator is weak.
static PROCESS_ID_COUNTER: Lazy<Arc<AtomicI32>> = Lazy::new(|| Arc::new(AtomicI32::new(1)));

/// Streamed output chunks buffered per statement before backpressure kicks in.
const CHUNK_CHANNEL_CAPACITY: usize = 32;

enum LoopAction {
    Continue,
    Stop,
}

/// Accept one client socket: run the startup branch (SSL upgrade, GSS and
/// cancel requests, version negotiation) and hand the stream to the command
/// loop.
pub(crate) async fn client_entrypoint(
    mut stream: TcpStream,
    addr: SocketAddr,
    config: Arc<ServerConfig>,
    shutdown_tx: broadcast::Sender<()>,
    closing: Arc<AtomicBool>,
) -> Result<(), Error> {
    loop {
        let mut frame = read_startup_frame(&mut stream, config.max_message_size).await?;
        let code = frame.get_i32();

        match code {
            SSL_REQUEST_CODE => {
                let acceptor = match &config.tls_acceptor {
                    Some(acceptor) => {
                        write_all_flush(&mut stream, b"S").await?;
                        acceptor.clone()
                    }
                    None => {
                        // TLS is not configured, we cannot offer it.
                        write_all_flush(&mut stream, b"N").await?;
                        continue;
                    }
                };

                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|err| Error::TlsError(err.to_string()))?;
                return startup_secure(tls_stream, addr, config, shutdown_tx, closing).await;
            }

            REQUEST_GSSENCMODE_CODE => {
                // GSSAPI encryption is never offered.
                write_all_flush(&mut stream, b"N").await?;
            }

            CANCEL_REQUEST_CODE => {
                // Cancellation routing is best-effort: the request is
                // accepted and discarded, the secondary socket closes.
                debug!("discarding cancel request from {addr}");
                return Ok(());
            }

            version if version >> 16 == 3 => {
                let parameters = parse_startup(frame)?;
                return serve_connection(stream, addr, parameters, config, shutdown_tx, closing)
                    .await;
            }

            other => {
                let info = ErrorInfo::new(format!("Unsupported protocol version {other}"))
                    .with_severity("FATAL")
                    .with_code(SQLSTATE_PROTOCOL_VIOLATION);
                let _ = write_all_flush(&mut stream, &error_response(&info)).await;
                return Err(Error::UnsupportedProtocolVersion(other));
            }
        }
    }
}

/// The startup branch over an established TLS stream. A second SSLRequest
/// inside TLS is refused.
async fn startup_secure(
    mut stream: tokio_native_tls::TlsStream<TcpStream>,
    addr: SocketAddr,
    config: Arc<ServerConfig>,
    shutdown_tx: broadcast::Sender<()>,
    closing: Arc<AtomicBool>,
) -> Result<(), Error> {
    loop {
        let mut frame = read_startup_frame(&mut stream, config.max_message_size).await?;
        let code = frame.get_i32();

        match code {
            SSL_REQUEST_CODE | REQUEST_GSSENCMODE_CODE => {
                write_all_flush(&mut stream, b"N").await?;
            }
            CANCEL_REQUEST_CODE => {
                debug!("discarding cancel request from {addr}");
                return Ok(());
            }
            version if version >> 16 == 3 => {
                let parameters = parse_startup(frame)?;
                return serve_connection(stream, addr, parameters, config, shutdown_tx, closing)
                    .await;
            }
            other => {
                let info = ErrorInfo::new(format!("Unsupported protocol version {other}"))
                    .with_severity("FATAL")
                    .with_code(SQLSTATE_PROTOCOL_VIOLATION);
                let _ = write_all_flush(&mut stream, &error_response(&info)).await;
                return Err(Error::UnsupportedProtocolVersion(other));
            }
        }
    }
}

/// Authenticate the startup, emit the session preamble and run the command
/// loop until the connection ends.
async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    parameters: std::collections::HashMap<String, String>,
    config: Arc<ServerConfig>,
    shutdown_tx: broadcast::Sender<()>,
    closing: Arc<AtomicBool>,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = split(stream);
    let mut read = BufReader::new(read_half);
    let mut write = write_half;

    let user = match config
        .auth
        .authenticate(&mut read, &mut write, &parameters)
        .await
    {
        Ok(user) => user,
        Err(err) => {
            if let Some(info) = err.to_error_info() {
                let _ = write_all_flush(&mut write, &error_response(&info)).await;
            }
            return Err(err);
        }
    };

    debug!("connection {addr} authenticated as {user:?}");

    let process_id = PROCESS_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let secret_key: i32 = rand::random();

    let session = Arc::new(Session::new(
        addr,
        process_id,
        secret_key,
        user,
        parameters,
        (config.statement_cache)(),
        (config.portal_cache)(),
        config.registry.clone(),
        shutdown_tx.clone(),
    ));

    if let Some(handler) = &config.session_handler {
        if let Err(err) = handler(&session).await {
            if let Some(info) = err.to_error_info() {
                let _ = write_all_flush(&mut write, &error_response(&info)).await;
            }
            return Err(err);
        }
    }

    // ParameterStatus for every advertised parameter, BackendKeyData, then
    // the first ReadyForQuery.
    let mut preamble = BytesMut::new();
    for (key, value) in config.session_parameters() {
        preamble.extend_from_slice(&parameter_status(&key, &value));
    }
    preamble.extend_from_slice(&backend_key_data(process_id, secret_key));
    preamble.extend_from_slice(&ready_for_query(TRANSACTION_STATUS_IDLE));
    write_all_flush(&mut write, &preamble).await?;

    let mut client = Client::new(read, write, addr, config.clone(), session.clone(), shutdown_tx, closing);
    let result = client.handle().await;

    match &result {
        Ok(()) => {
            if let Some(hook) = &config.on_close {
                hook(&session);
            }
        }
        Err(err) => {
            if let Some(hook) = &config.on_terminate {
                hook(&session, err);
            }
        }
    }

    result
}

/// The per-connection command loop and its extended-query state.
struct Client<S, T> {
    read: BufReader<S>,
    write: T,
    addr: SocketAddr,
    config: Arc<ServerConfig>,
    session: Arc<Session>,
    shutdown: broadcast::Receiver<()>,
    closing: Arc<AtomicBool>,
    /// Between an error and the next Sync every extended-query message is
    /// discarded.
    skip_until_sync: bool,
    pipeline: Pipeline,
    copy_tx: mpsc::Sender<CopyHandoff>,
    copy_rx: mpsc::Receiver<CopyHandoff>,
    /// The feed of the copy-in stream a statement callback is consuming,
    /// if one is active. All socket frames route here until CopyDone or
    /// CopyFail.
    active_copy: Option<mpsc::Sender<CopyChunk>>,
}

/// One wake-up of the command loop.
enum Event {
    Shutdown,
    CopyRequest(Option<CopyHandoff>),
    MessageCode(Result<u8, Error>),
}

/// One wake-up while a statement task is being forwarded.
enum TaskEvent {
    Finished(Result<(BytesMut, ExecOutcome), tokio::task::JoinError>),
    Chunk(BytesMut),
    CopyRequest(Option<CopyHandoff>),
    MessageCode(Result<u8, Error>),
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + Send + Unpin,
    T: tokio::io::AsyncWrite + Send + Unpin,
{
    fn new(
        read: BufReader<S>,
        write: T,
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        session: Arc<Session>,
        shutdown_tx: broadcast::Sender<()>,
        closing: Arc<AtomicBool>,
    ) -> Client<S, T> {
        let pipeline = Pipeline::new(config.pipeline.clone());
        let (copy_tx, copy_rx) = mpsc::channel(1);
        Client {
            read,
            write,
            addr,
            config,
            session,
            shutdown: shutdown_tx.subscribe(),
            closing,
            skip_until_sync: false,
            pipeline,
            copy_tx,
            copy_rx,
            active_copy: None,
        }
    }

    async fn handle(&mut self) -> Result<(), Error> {
        match self.run().await {
            // A peer that vanished between messages is a normal end.
            Err(Error::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    async fn run(&mut self) -> Result<(), Error> {
        loop {
            // Only the one-byte code read races in the select: cancelling
            // it cannot desynchronize the frame stream.
            let event = tokio::select! {
                biased;
                _ = self.shutdown.recv() => Event::Shutdown,
                handoff = self.copy_rx.recv(), if self.active_copy.is_none() => {
                    Event::CopyRequest(handoff)
                }
                code = read_message_code(&mut self.read) => Event::MessageCode(code),
            };

            let code = match event {
                Event::Shutdown => {
                    let info =
                        ErrorInfo::new("terminating connection due to administrator command")
                            .with_severity("FATAL")
                            .with_code(SQLSTATE_ADMIN_SHUTDOWN);
                    let _ = write_all_flush(&mut self.write, &error_response(&info)).await;
                    if !self.closing.load(Ordering::Relaxed) {
                        warn!("dropping client {} on shutdown", self.addr);
                    }
                    return Ok(());
                }
                Event::CopyRequest(handoff) => {
                    if let Some(handoff) = handoff {
                        self.active_copy = Some(handoff.chunk_tx);
                    }
                    continue;
                }
                Event::MessageCode(code) => code?,
            };

            let payload = match self.read_body(code).await {
                Ok(payload) => payload,
                Err(err) => return self.fail_connection(err).await,
            };

            if self.active_copy.is_some() {
                match self.route_copy_frame(code, payload).await? {
                    LoopAction::Continue => continue,
                    LoopAction::Stop => return Ok(()),
                }
            }

            match self.dispatch(code, payload).await? {
                LoopAction::Continue => {}
                LoopAction::Stop => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, code: u8, payload: BytesMut) -> Result<LoopAction, Error> {
        if self.skip_until_sync && !matches!(code, b'S' | b'X') {
            debug!("skip mode, discarding '{}'", code as char);
            return Ok(LoopAction::Continue);
        }

        match code {
            b'Q' => self.on_simple_query(payload).await?,
            b'P' => self.on_parse(payload).await?,
            b'B' => self.on_bind(payload).await?,
            b'D' => self.on_describe(payload).await?,
            b'E' => self.on_execute(payload).await?,
            b'C' => self.on_close_message(payload).await?,
            b'S' => self.on_sync().await?,
            b'H' => self.on_flush_message().await?,
            b'X' => return Ok(LoopAction::Stop),
            // Stray copy frames outside an active copy are dropped.
            b'd' | b'c' | b'f' => {}
            other => {
                warn!(
                    "client {} sent an unrecognized message '{}'",
                    self.addr, other as char
                );
                self.extended_error(Error::ProtocolViolation(format!(
                    "Unknown message type '{}'",
                    other as char
                )))
                .await?;
            }
        }

        // Without pipelining every operation settles before the next read.
        if !self.pipeline.enabled() {
            self.drain_pipeline().await?;
        }

        Ok(LoopAction::Continue)
    }

    // --- simple query ---

    async fn on_simple_query(&mut self, mut payload: BytesMut) -> Result<(), Error> {
        // A simple query never overlaps an extended batch.
        self.drain_pipeline().await?;

        let query = payload.read_string()?;
        if query.trim().is_empty() {
            write_all(&mut self.write, &empty_query_response()).await?;
            return self.write_ready_for_query().await;
        }

        match self.config.parser.parse(&self.session, &query).await {
            Err(err) => self.write_error_direct(err).await?,
            Ok(statements) if statements.is_empty() => {
                write_all(&mut self.write, &empty_query_response()).await?;
            }
            Ok(statements) => {
                // The whole batch runs against the implicit unnamed portal:
                // no parameters, text formats, no row limit, with row
                // descriptions per statement.
                let outcome = self
                    .run_statements(
                        Arc::new(statements),
                        Arc::new(Vec::new()),
                        Vec::new(),
                        0,
                        true,
                    )
                    .await?;
                if let ExecOutcome::Failed(err) = outcome {
                    // Abort the remaining statements of the batch.
                    self.write_error_direct(err).await?;
                }
            }
        }

        self.write_ready_for_query().await
    }

    // --- extended query ---

    async fn on_parse(&mut self, payload: BytesMut) -> Result<(), Error> {
        let parse: Parse = match (&payload).try_into() {
            Ok(parse) => parse,
            Err(err) => return self.extended_error(err).await,
        };

        // A named statement mutates shared state: drain the in-flight
        // window first.
        if !parse.anonymous() {
            self.drain_pipeline().await?;
            if self.skip_until_sync {
                return Ok(());
            }
        }

        match self.config.parser.parse(&self.session, &parse.query).await {
            Ok(statements) => {
                let param_types = merge_param_types(&parse.param_types, &statements);
                self.session.statements().put(
                    parse.name.clone(),
                    CachedStatement {
                        query: parse.query,
                        statements: Arc::new(statements),
                        param_types,
                    },
                );
                self.pipeline.push_bytes(parse_complete());
                Ok(())
            }
            Err(err) => self.extended_error(err).await,
        }
    }

    async fn on_bind(&mut self, payload: BytesMut) -> Result<(), Error> {
        let bind: Bind = match (&payload).try_into() {
            Ok(bind) => bind,
            Err(err) => return self.extended_error(err).await,
        };

        if !bind.portal.is_empty() {
            self.drain_pipeline().await?;
            if self.skip_until_sync {
                return Ok(());
            }
        }

        let statement = self.session.statements().get(&bind.statement);
        let statement = match statement {
            Some(statement) => statement,
            None => {
                return self
                    .extended_error(
                        Error::query(format!(
                            "prepared statement \"{}\" does not exist",
                            bind.statement
                        ))
                        .with_code(SQLSTATE_INVALID_SQL_STATEMENT_NAME),
                    )
                    .await
            }
        };

        let formats = match normalize_formats(&bind.parameter_formats, bind.parameters.len()) {
            Ok(formats) => formats,
            Err(err) => return self.extended_error(err).await,
        };

        let mut parameters = Vec::with_capacity(bind.parameters.len());
        for (index, parameter) in bind.parameters.iter().enumerate() {
            let type_oid = effective_oid(statement.param_types.get(index).copied());
            let format = formats[index];
            let value = match self.config.registry.decode(
                type_oid,
                parameter.data.as_deref(),
                format,
            ) {
                Ok(value) => value,
                Err(err) => return self.extended_error(err).await,
            };
            parameters.push(Parameter {
                type_oid,
                format,
                data: parameter.data.clone(),
                value,
            });
        }

        self.session.portals().put(
            bind.portal.clone(),
            CachedPortal {
                statement,
                parameters: Arc::new(parameters),
                result_formats: bind.result_formats,
            },
        );
        self.pipeline.push_bytes(bind_complete());
        Ok(())
    }

    async fn on_describe(&mut self, payload: BytesMut) -> Result<(), Error> {
        let describe: Describe = match (&payload).try_into() {
            Ok(describe) => describe,
            Err(err) => return self.extended_error(err).await,
        };

        match describe.target {
            DescribeTarget::Statement => {
                let statement = self.session.statements().get(&describe.name);
                match statement {
                    Some(statement) => {
                        let mut out = parameter_description(&statement.param_types);
                        let columns = statement.described_columns();
                        if columns.is_empty() {
                            out.extend_from_slice(&no_data());
                        } else {
                            out.extend_from_slice(&row_description(columns, &[]));
                        }
                        self.pipeline.push_bytes(out);
                        Ok(())
                    }
                    None => {
                        self.extended_error(
                            Error::query(format!(
                                "prepared statement \"{}\" does not exist",
                                describe.name
                            ))
                            .with_code(SQLSTATE_INVALID_SQL_STATEMENT_NAME),
                        )
                        .await
                    }
                }
            }
            DescribeTarget::Portal => {
                let portal = self.session.portals().get(&describe.name);
                match portal {
                    Some(portal) => {
                        let columns = portal.statement.described_columns().to_vec();
                        if columns.is_empty() {
                            self.pipeline.push_bytes(no_data());
                            return Ok(());
                        }
                        let formats =
                            match normalize_formats(&portal.result_formats, columns.len()) {
                                Ok(formats) => formats,
                                Err(err) => return self.extended_error(err).await,
                            };
                        let codes: Vec<i16> =
                            formats.iter().map(|format| format.code()).collect();
                        self.pipeline
                            .push_bytes(row_description(&columns, &codes));
                        Ok(())
                    }
                    None => {
                        self.extended_error(
                            Error::query(format!("portal \"{}\" does not exist", describe.name))
                                .with_code(SQLSTATE_INVALID_CURSOR_NAME),
                        )
                        .await
                    }
                }
            }
        }
    }

    async fn on_execute(&mut self, payload: BytesMut) -> Result<(), Error> {
        let execute: Execute = match (&payload).try_into() {
            Ok(execute) => execute,
            Err(err) => return self.extended_error(err).await,
        };

        let portal = self.session.portals().get(&execute.portal);
        let portal = match portal {
            Some(portal) => portal,
            None => {
                return self
                    .extended_error(
                        Error::query(format!("portal \"{}\" does not exist", execute.portal))
                            .with_code(SQLSTATE_INVALID_CURSOR_NAME),
                    )
                    .await
            }
        };

        // Backpressure: a full queue drains its oldest entry first.
        while self.pipeline.is_full() {
            self.drain_one().await?;
            if self.skip_until_sync {
                return Ok(());
            }
        }

        let limit = execute.max_rows.max(0) as u64;
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let task = portal_task(
            self.session.clone(),
            portal.statement.statements.clone(),
            portal.parameters.clone(),
            portal.result_formats.clone(),
            limit,
            false,
            self.config.registry.clone(),
            chunk_tx,
            self.copy_tx.clone(),
        );
        self.pipeline.spawn_task(task, chunk_rx);
        Ok(())
    }

    async fn on_close_message(&mut self, payload: BytesMut) -> Result<(), Error> {
        let close: Close = match (&payload).try_into() {
            Ok(close) => close,
            Err(err) => return self.extended_error(err).await,
        };

        // Close mutates shared state: serialise against in-flight tasks.
        self.drain_pipeline().await?;
        if self.skip_until_sync {
            return Ok(());
        }

        match close.target {
            CloseTarget::Statement => {
                self.session.statements().remove(&close.name);
            }
            CloseTarget::Portal => {
                self.session.portals().remove(&close.name);
            }
        }

        // Closing an unknown name is not an error.
        self.pipeline.push_bytes(close_complete());
        Ok(())
    }

    async fn on_sync(&mut self) -> Result<(), Error> {
        self.drain_pipeline().await?;
        self.skip_until_sync = false;
        self.write_ready_for_query().await
    }

    async fn on_flush_message(&mut self) -> Result<(), Error> {
        self.drain_pipeline().await?;
        self.write
            .flush()
            .await
            .map_err(|err| Error::SocketError(format!("Error flushing socket: {err:?}")))
    }

    // --- pipeline draining ---

    async fn drain_pipeline(&mut self) -> Result<(), Error> {
        while !self.pipeline.is_empty() {
            self.drain_one().await?;
        }
        Ok(())
    }

    async fn drain_one(&mut self) -> Result<(), Error> {
        let pending = match self.pipeline.pop_front() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        match pending {
            Pending::Bytes(bytes) => {
                write_all(&mut self.write, &bytes).await?;
            }
            Pending::Task { handle, chunk_rx } => {
                let outcome = self.forward_task(handle, chunk_rx).await?;
                if let ExecOutcome::Failed(err) = outcome {
                    let info = err
                        .to_error_info()
                        .unwrap_or_else(|| ErrorInfo::new(err.to_string()));
                    write_all(&mut self.write, &error_response(&info)).await?;
                    self.skip_until_sync = true;
                    // Queued successors of the failed task emit nothing.
                    self.pipeline.cancel_remaining();
                }
            }
        }
        Ok(())
    }

    /// Run the given statements as a streaming task in front position:
    /// output chunks are forwarded to the socket as they appear.
    async fn run_statements(
        &mut self,
        statements: Arc<Vec<PreparedStatement>>,
        parameters: Arc<Vec<Parameter>>,
        format_codes: Vec<i16>,
        limit: u64,
        describe_rows: bool,
    ) -> Result<ExecOutcome, Error> {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let task = portal_task(
            self.session.clone(),
            statements,
            parameters,
            format_codes,
            limit,
            describe_rows,
            self.config.registry.clone(),
            chunk_tx,
            self.copy_tx.clone(),
        );
        let handle = tokio::spawn(task);
        self.forward_task(handle, chunk_rx).await
    }

    /// Await a statement task while forwarding its streamed output and
    /// servicing any copy-in stream it starts.
    async fn forward_task(
        &mut self,
        mut handle: JoinHandle<(BytesMut, ExecOutcome)>,
        mut chunk_rx: mpsc::Receiver<BytesMut>,
    ) -> Result<ExecOutcome, Error> {
        let (residual, outcome) = loop {
            let event = tokio::select! {
                joined = &mut handle => TaskEvent::Finished(joined),
                Some(chunk) = chunk_rx.recv() => TaskEvent::Chunk(chunk),
                handoff = self.copy_rx.recv(), if self.active_copy.is_none() => {
                    TaskEvent::CopyRequest(handoff)
                }
                code = read_message_code(&mut self.read), if self.active_copy.is_some() => {
                    TaskEvent::MessageCode(code)
                }
            };

            match event {
                TaskEvent::Finished(joined) => {
                    break match joined {
                        Ok(output) => output,
                        Err(err) => (
                            BytesMut::new(),
                            ExecOutcome::Failed(Error::query(format!(
                                "statement handler aborted: {err}"
                            ))),
                        ),
                    }
                }
                TaskEvent::Chunk(chunk) => {
                    write_all_flush(&mut self.write, &chunk).await?;
                }
                TaskEvent::CopyRequest(handoff) => {
                    if let Some(handoff) = handoff {
                        self.active_copy = Some(handoff.chunk_tx);
                    }
                }
                TaskEvent::MessageCode(code) => {
                    let code = match code {
                        Ok(code) => code,
                        Err(err) => {
                            handle.abort();
                            return Err(err);
                        }
                    };
                    let payload = match self.read_body(code).await {
                        Ok(payload) => payload,
                        Err(err) => {
                            handle.abort();
                            return Err(err);
                        }
                    };
                    if let LoopAction::Stop = self.route_copy_frame(code, payload).await? {
                        handle.abort();
                        return Err(Error::ConnectionClosed);
                    }
                }
            }
        };

        // Remaining streamed chunks precede the residual buffer.
        while let Ok(chunk) = chunk_rx.try_recv() {
            write_all(&mut self.write, &chunk).await?;
        }
        if !residual.is_empty() {
            write_all(&mut self.write, &residual).await?;
        }

        Ok(outcome)
    }

    // --- copy routing ---

    /// Route one socket frame into the active copy-in stream. Mirrors the
    /// backend rules: CopyData feeds the stream, CopyDone and CopyFail end
    /// it, Flush and Sync are legal no-ops, anything else aborts the copy.
    async fn route_copy_frame(
        &mut self,
        code: u8,
        mut payload: BytesMut,
    ) -> Result<LoopAction, Error> {
        let sender = match &self.active_copy {
            Some(sender) => sender.clone(),
            None => return Ok(LoopAction::Continue),
        };

        match code {
            b'd' => {
                let _ = sender.send(CopyChunk::Data(payload)).await;
            }
            b'c' => {
                let _ = sender.send(CopyChunk::Done).await;
                self.active_copy = None;
            }
            b'f' => {
                let reason = payload.read_string().unwrap_or_default();
                let _ = sender.send(CopyChunk::Fail(reason)).await;
                self.active_copy = None;
            }
            b'H' | b'S' => {}
            b'X' => {
                let _ = sender
                    .send(CopyChunk::Fail("connection terminated".to_string()))
                    .await;
                self.active_copy = None;
                return Ok(LoopAction::Stop);
            }
            other => {
                let _ = sender
                    .send(CopyChunk::Fail(format!(
                        "unexpected message '{}' during COPY",
                        other as char
                    )))
                    .await;
                self.active_copy = None;
            }
        }
        Ok(LoopAction::Continue)
    }

    async fn read_body(&mut self, code: u8) -> Result<BytesMut, Error> {
        read_message_body(&mut self.read, code, self.config.max_message_size).await
    }

    /// Report an unrecoverable protocol error to the client, then surface
    /// it to the connection task.
    async fn fail_connection(&mut self, err: Error) -> Result<(), Error> {
        if let Some(info) = err.to_error_info() {
            let info = info.with_severity("FATAL");
            let _ = write_all_flush(&mut self.write, &error_response(&info)).await;
        }
        Err(err)
    }

    // --- error plumbing ---

    /// Queue an ErrorResponse at the current pipeline position and enter
    /// skip mode.
    async fn extended_error(&mut self, err: Error) -> Result<(), Error> {
        let info = err
            .to_error_info()
            .unwrap_or_else(|| ErrorInfo::new(err.to_string()));
        self.pipeline.push_bytes(error_response(&info));
        self.skip_until_sync = true;
        Ok(())
    }

    /// Write an ErrorResponse immediately, outside the extended batch.
    async fn write_error_direct(&mut self, err: Error) -> Result<(), Error> {
        let info = err
            .to_error_info()
            .unwrap_or_else(|| ErrorInfo::new(err.to_string()));
        write_all(&mut self.write, &error_response(&info)).await
    }

    async fn write_ready_for_query(&mut self) -> Result<(), Error> {
        write_all_flush(&mut self.write, &ready_for_query(TRANSACTION_STATUS_IDLE)).await
    }
}

/// Client-declared parameter OIDs take precedence over the statement's own
/// declarations; unspecified entries fall back to text.
fn merge_param_types(declared: &[u32], statements: &[PreparedStatement]) -> Vec<Oid> {
    let inferred: Vec<Oid> = statements
        .iter()
        .flat_map(|statement| statement.parameters.iter().copied())
        .collect();
    let len = declared.len().max(inferred.len());
    (0..len)
        .map(|index| match declared.get(index) {
            Some(&oid) if oid != 0 => oid,
            _ => effective_oid(inferred.get(index).copied()),
        })
        .collect()
}

fn effective_oid(declared: Option<Oid>) -> Oid {
    match declared {
        Some(0) | None => oid::TEXT,
        Some(oid) => oid,
    }
}

/// The future that executes one portal (or one simple-query batch): every
/// statement in order, each against its own [`DataWriter`]. Returns the
/// residual output and the outcome.
#[allow(clippy::too_many_arguments)]
fn portal_task(
    session: Arc<Session>,
    statements: Arc<Vec<PreparedStatement>>,
    parameters: Arc<Vec<Parameter>>,
    format_codes: Vec<i16>,
    limit: u64,
    describe_rows: bool,
    registry: Arc<TypeRegistry>,
    chunk_tx: mpsc::Sender<BytesMut>,
    copy_tx: mpsc::Sender<CopyHandoff>,
) -> impl Future<Output = (BytesMut, ExecOutcome)> + Send + 'static {
    async move {
        let mut residual = BytesMut::new();

        for statement in statements.iter() {
            let formats = match normalize_formats(&format_codes, statement.columns.len()) {
                Ok(formats) => formats,
                Err(err) => return (residual, ExecOutcome::Failed(err)),
            };

            let mut writer = DataWriter::new(
                statement.columns.clone(),
                formats,
                registry.clone(),
                limit,
                Some(chunk_tx.clone()),
                Some(copy_tx.clone()),
            );

            if describe_rows && !statement.columns.is_empty() {
                // Simple-query semantics: the row description precedes the
                // rows of every statement carrying columns.
                writer.push_frame(row_description(&statement.columns, &[]));
            }

            let result = (statement.handler)(&session, &mut writer, &parameters).await;
            match result {
                Ok(()) => {
                    if !writer.completed() {
                        debug!("statement handler finished without a completion tag");
                        writer.push_frame(command_complete(""));
                    }
                    residual.extend_from_slice(&writer.take_output());
                }
                Err(Error::PortalSuspended) => {
                    writer.push_frame(portal_suspended());
                    residual.extend_from_slice(&writer.take_output());
                    return (residual, ExecOutcome::Suspended);
                }
                Err(err) => {
                    residual.extend_from_slice(&writer.take_output());
                    return (residual, ExecOutcome::Failed(err));
                }
            }
        }

        (residual, ExecOutcome::Complete)
    }
}
