//! End-to-end tests driving a served listener with a raw protocol client.

// Standard library imports
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// External crate imports
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// Internal crate imports
use crate::config::ServerConfig;
use crate::copy::{BinaryCopyReader, BINARY_SIGNATURE};
use crate::datatypes::{oid, Value};
use crate::errors::Error;
use crate::pipeline::PipelineConfig;
use crate::server::Server;
use crate::session::Session;
use crate::statements::{Column, PreparedStatement, QueryParser};

/// Serves the behaviours the scenarios below exercise, keyed by query text.
struct ScenarioParser;

fn select_one() -> PreparedStatement {
    PreparedStatement::new(|_, writer, _| {
        Box::pin(async move {
            writer.row(&[Value::Int4(1)]).await?;
            writer.complete("SELECT 1").await
        })
    })
    .with_columns(vec![Column::new("?column?", oid::INT4, 4)])
}

fn sleeper(duration: Duration, tag: &'static str) -> PreparedStatement {
    PreparedStatement::new(move |_, writer, _| {
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            writer.complete(tag).await
        })
    })
}

fn echo_parameter() -> PreparedStatement {
    PreparedStatement::new(|_, writer, params| {
        Box::pin(async move {
            assert_eq!(params.len(), 1);
            assert_eq!(params[0].type_oid, oid::INT4);
            let text = match &params[0].value {
                Value::Int4(value) => value.to_string(),
                other => panic!("unexpected parameter value {other:?}"),
            };
            writer.row(&[Value::Text(text)]).await?;
            writer.complete("ECHO 1").await
        })
    })
    .with_columns(vec![Column::new("echo", oid::TEXT, -1)])
    .with_parameters(vec![oid::INT4])
}

fn copy_counter() -> PreparedStatement {
    PreparedStatement::new(|_, writer, _| {
        Box::pin(async move {
            let reader = writer.copy_in(true, &[1, 1]).await?;
            let mut reader = BinaryCopyReader::new(reader);
            let mut count = 0u64;
            while let Some(_tuple) = reader.next_tuple().await? {
                count += 1;
            }
            writer.complete(&format!("COPY {count}")).await
        })
    })
}

#[async_trait]
impl QueryParser for ScenarioParser {
    async fn parse(
        &self,
        session: &Arc<Session>,
        query: &str,
    ) -> Result<Vec<PreparedStatement>, Error> {
        match query {
            "SELECT 1" => Ok(vec![select_one()]),
            "SELECT 1; SELECT 1" => Ok(vec![select_one(), select_one()]),
            "sleep100" => Ok(vec![sleeper(Duration::from_millis(100), "SLEEP")]),
            "sleep2000" => Ok(vec![sleeper(Duration::from_millis(2000), "SLEEP")]),
            "echo" => Ok(vec![echo_parameter()]),
            "copy" => Ok(vec![copy_counter()]),
            "remember" => {
                session.set_attribute("note", "kept".to_string());
                Ok(vec![sleeper(Duration::from_millis(0), "REMEMBER")])
            }
            "recall" => {
                let note = session
                    .attribute::<String>("note")
                    .map(|note| (*note).clone())
                    .unwrap_or_default();
                Ok(vec![PreparedStatement::new(move |_, writer, _| {
                    let note = note.clone();
                    Box::pin(async move {
                        writer.row(&[Value::Text(note)]).await?;
                        writer.complete("RECALL").await
                    })
                })
                .with_columns(vec![Column::new("note", oid::TEXT, -1)])])
            }
            other => Err(Error::query(format!("syntax error near \"{other}\""))
                .with_code("42601")),
        }
    }
}

async fn start_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, addr)
}

async fn start_default_server() -> (Arc<Server>, SocketAddr) {
    start_server(ServerConfig::new(Arc::new(ScenarioParser))).await
}

/// A raw protocol client: frames go out as built, frames come back as
/// (type, payload) pairs.
struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).await.unwrap();
        TestClient { stream }
    }

    async fn handshake(&mut self) {
        let mut body = BytesMut::new();
        body.put_i32(196608);
        body.put_slice(b"user\0alice\0database\0app\0\0");

        let mut frame = BytesMut::new();
        frame.put_i32(body.len() as i32 + 4);
        frame.put_slice(&body);
        self.stream.write_all(&frame).await.unwrap();

        // AuthenticationOk, ParameterStatus*, BackendKeyData, ReadyForQuery.
        let frames = self.read_until_ready().await;
        assert_eq!(frames[0].0, b'R');
        assert!(frames.iter().any(|(code, _)| *code == b'K'));
    }

    async fn send(&mut self, code: u8, payload: &[u8]) {
        let mut frame = BytesMut::new();
        frame.put_u8(code);
        frame.put_i32(payload.len() as i32 + 4);
        frame.put_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_query(&mut self, sql: &str) {
        let mut payload = BytesMut::new();
        payload.put_slice(sql.as_bytes());
        payload.put_u8(0);
        self.send(b'Q', &payload).await;
    }

    async fn send_parse(&mut self, name: &str, query: &str, param_oids: &[u32]) {
        let mut payload = BytesMut::new();
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        payload.put_slice(query.as_bytes());
        payload.put_u8(0);
        payload.put_i16(param_oids.len() as i16);
        for oid in param_oids {
            payload.put_i32(*oid as i32);
        }
        self.send(b'P', &payload).await;
    }

    async fn send_bind(
        &mut self,
        portal: &str,
        statement: &str,
        param_formats: &[i16],
        params: &[Option<&[u8]>],
        result_formats: &[i16],
    ) {
        let mut payload = BytesMut::new();
        payload.put_slice(portal.as_bytes());
        payload.put_u8(0);
        payload.put_slice(statement.as_bytes());
        payload.put_u8(0);
        payload.put_i16(param_formats.len() as i16);
        for format in param_formats {
            payload.put_i16(*format);
        }
        payload.put_i16(params.len() as i16);
        for param in params {
            match param {
                Some(data) => {
                    payload.put_i32(data.len() as i32);
                    payload.put_slice(data);
                }
                None => payload.put_i32(-1),
            }
        }
        payload.put_i16(result_formats.len() as i16);
        for format in result_formats {
            payload.put_i16(*format);
        }
        self.send(b'B', &payload).await;
    }

    async fn send_describe(&mut self, target: u8, name: &str) {
        let mut payload = BytesMut::new();
        payload.put_u8(target);
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        self.send(b'D', &payload).await;
    }

    async fn send_execute(&mut self, portal: &str, max_rows: i32) {
        let mut payload = BytesMut::new();
        payload.put_slice(portal.as_bytes());
        payload.put_u8(0);
        payload.put_i32(max_rows);
        self.send(b'E', &payload).await;
    }

    async fn send_sync(&mut self) {
        self.send(b'S', &[]).await;
    }

    async fn send_terminate(&mut self) {
        self.send(b'X', &[]).await;
    }

    async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let code = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap();
        let mut payload = vec![0u8; len as usize - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        (code, payload)
    }

    /// Read frames up to and including the next ReadyForQuery.
    async fn read_until_ready(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        loop {
            let frame = self.read_frame().await;
            let done = frame.0 == b'Z';
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

fn frame_codes(frames: &[(u8, Vec<u8>)]) -> Vec<u8> {
    frames.iter().map(|(code, _)| *code).collect()
}

fn command_tag(payload: &[u8]) -> &str {
    std::str::from_utf8(&payload[..payload.len() - 1]).unwrap()
}

#[tokio::test]
async fn trivial_simple_query() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_query("SELECT 1").await;
    let frames = client.read_until_ready().await;

    assert_eq!(frame_codes(&frames), vec![b'T', b'D', b'C', b'Z']);
    // One text column valued "1".
    let data_row = &frames[1].1;
    assert_eq!(&data_row[0..2], &1i16.to_be_bytes());
    assert_eq!(&data_row[2..6], &1i32.to_be_bytes());
    assert_eq!(&data_row[6..7], b"1");
    assert_eq!(command_tag(&frames[2].1), "SELECT 1");
    // ReadyForQuery reports an idle transaction.
    assert_eq!(frames[3].1, vec![b'I']);

    client.send_terminate().await;
}

#[tokio::test]
async fn simple_query_batch_runs_statements_in_order() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_query("SELECT 1; SELECT 1").await;
    let frames = client.read_until_ready().await;

    // Two full result sets, one trailing ReadyForQuery.
    assert_eq!(
        frame_codes(&frames),
        vec![b'T', b'D', b'C', b'T', b'D', b'C', b'Z']
    );
}

#[tokio::test]
async fn empty_simple_query() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_query("   ").await;
    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'I', b'Z']);
}

#[tokio::test]
async fn simple_query_parse_failure_still_reaches_ready() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_query("DROP TABLE nope").await;
    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'E', b'Z']);

    // The error carries the SQLSTATE the parser attached.
    let error = String::from_utf8_lossy(&frames[0].1).to_string();
    assert!(error.contains("42601"), "{error}");

    // The connection survives the failure.
    client.send_query("SELECT 1").await;
    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'T', b'D', b'C', b'Z']);
}

#[tokio::test]
async fn extended_batch_full_cycle() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_parse("", "SELECT 1", &[]).await;
    client.send_bind("", "", &[], &[], &[]).await;
    client.send_describe(b'P', "").await;
    client.send_execute("", 0).await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    assert_eq!(
        frame_codes(&frames),
        vec![b'1', b'2', b'T', b'D', b'C', b'Z']
    );
    assert_eq!(command_tag(&frames[4].1), "SELECT 1");
}

#[tokio::test]
async fn describe_statement_reports_parameters_and_columns() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_parse("stmt", "echo", &[oid::INT4]).await;
    client.send_describe(b'S', "stmt").await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'1', b't', b'T', b'Z']);

    // ParameterDescription carries the declared int4.
    let params = &frames[1].1;
    assert_eq!(&params[0..2], &1i16.to_be_bytes());
    assert_eq!(&params[2..6], &(oid::INT4 as i32).to_be_bytes());
}

#[tokio::test]
async fn bound_parameters_arrive_with_oids_and_raw_bytes() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_parse("", "echo", &[oid::INT4]).await;
    client
        .send_bind("", "", &[1], &[Some(&7i32.to_be_bytes())], &[])
        .await;
    client.send_execute("", 0).await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'1', b'2', b'D', b'C', b'Z']);
    // The echo handler renders the decoded parameter as text.
    let data_row = &frames[2].1;
    assert_eq!(&data_row[6..7], b"7");
}

#[tokio::test]
async fn null_parameter_decodes_to_null() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    // The echo handler panics on non-Int4 values, which surfaces as an
    // ErrorResponse rather than a hang.
    client.send_parse("", "echo", &[oid::INT4]).await;
    client.send_bind("", "", &[1], &[None], &[]).await;
    client.send_execute("", 0).await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    let codes = frame_codes(&frames);
    assert_eq!(codes[0], b'1');
    assert_eq!(codes[1], b'2');
    assert!(codes.contains(&b'E'));
    assert_eq!(*codes.last().unwrap(), b'Z');
}

#[tokio::test]
async fn skip_mode_discards_until_sync() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    // The parse fails; the following bind and execute must produce no
    // frames at all before ReadyForQuery.
    client.send_parse("", "this is not a query", &[]).await;
    client.send_bind("", "", &[], &[], &[]).await;
    client.send_execute("", 0).await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'E', b'Z']);

    // Sync cleared the skip flag.
    client.send_parse("", "SELECT 1", &[]).await;
    client.send_sync().await;
    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'1', b'Z']);
}

#[tokio::test]
async fn bind_to_missing_statement_enters_skip_mode() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_bind("", "ghost", &[], &[], &[]).await;
    client.send_execute("", 0).await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'E', b'Z']);
    let error = String::from_utf8_lossy(&frames[0].1).to_string();
    assert!(error.contains("26000"), "{error}");
}

#[tokio::test]
async fn unknown_message_type_is_a_protocol_violation() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send(b'z', &[]).await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'E', b'Z']);
    let error = String::from_utf8_lossy(&frames[0].1).to_string();
    assert!(error.contains("08P01"), "{error}");
}

#[tokio::test]
async fn execute_row_limit_suspends_the_portal() {
    struct ManyRows;

    #[async_trait]
    impl QueryParser for ManyRows {
        async fn parse(
            &self,
            _session: &Arc<Session>,
            _query: &str,
        ) -> Result<Vec<PreparedStatement>, Error> {
            Ok(vec![PreparedStatement::new(|_, writer, _| {
                Box::pin(async move {
                    for value in 0..100 {
                        writer.row(&[Value::Int4(value)]).await?;
                    }
                    writer.complete("SELECT 100").await
                })
            })
            .with_columns(vec![Column::new("n", oid::INT4, 4)])])
        }
    }

    let (_server, addr) = start_server(ServerConfig::new(Arc::new(ManyRows))).await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_parse("", "rows", &[]).await;
    client.send_bind("", "", &[], &[], &[]).await;
    client.send_execute("", 3).await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    let codes = frame_codes(&frames);
    // Three rows then PortalSuspended instead of CommandComplete.
    assert_eq!(codes, vec![b'1', b'2', b'D', b'D', b'D', b's', b'Z']);

    // The portal survived and can be executed again.
    client.send_execute("", 3).await;
    client.send_sync().await;
    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'D', b'D', b'D', b's', b'Z']);
}

#[tokio::test]
async fn copy_in_binary_counts_tuples() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_query("copy").await;

    // CopyInResponse announces the binary format.
    let (code, payload) = client.read_frame().await;
    assert_eq!(code, b'G');
    assert_eq!(payload[0], 1);

    // Header plus two tuples in one CopyData, the trailer in another.
    let mut stream = BytesMut::new();
    stream.put_slice(BINARY_SIGNATURE);
    stream.put_i32(0);
    stream.put_i32(0);
    for value in [1i32, 2] {
        stream.put_i16(2);
        stream.put_i32(4);
        stream.put_i32(value);
        stream.put_i32(-1);
    }
    client.send(b'd', &stream).await;
    client.send(b'd', &(-1i16).to_be_bytes()).await;
    client.send(b'c', &[]).await;

    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'C', b'Z']);
    assert_eq!(command_tag(&frames[0].1), "COPY 2");
}

#[tokio::test]
async fn copy_fail_surfaces_as_error() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_query("copy").await;
    let (code, _) = client.read_frame().await;
    assert_eq!(code, b'G');

    client.send(b'f', b"no thanks\0").await;

    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'E', b'Z']);
    let error = String::from_utf8_lossy(&frames[0].1).to_string();
    assert!(error.contains("no thanks"), "{error}");
}

#[tokio::test]
async fn session_attributes_span_queries() {
    let (_server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_query("remember").await;
    client.read_until_ready().await;

    client.send_query("recall").await;
    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'T', b'D', b'C', b'Z']);
    let data_row = &frames[1].1;
    assert_eq!(&data_row[6..], b"kept");
}

async fn run_three_sleepers(addr: SocketAddr) -> (Vec<u8>, Duration) {
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    for index in 1..=3 {
        client
            .send_parse(&format!("s{index}"), "sleep100", &[])
            .await;
        client
            .send_bind(&format!("p{index}"), &format!("s{index}"), &[], &[], &[])
            .await;
    }
    client.send_sync().await;
    client.read_until_ready().await;

    let start = Instant::now();
    for index in 1..=3 {
        client.send_execute(&format!("p{index}"), 0).await;
    }
    client.send_sync().await;
    let frames = client.read_until_ready().await;
    let elapsed = start.elapsed();

    client.send_terminate().await;
    (frame_codes(&frames), elapsed)
}

#[tokio::test]
async fn pipelined_executes_run_concurrently() {
    let config = ServerConfig::new(Arc::new(ScenarioParser)).with_pipeline(PipelineConfig {
        enabled: true,
        max_concurrency: 8,
        max_queue_depth: 64,
    });
    let (_server, addr) = start_server(config).await;

    let (codes, elapsed) = run_three_sleepers(addr).await;
    assert_eq!(codes, vec![b'C', b'C', b'C', b'Z']);
    assert!(
        elapsed < Duration::from_millis(250),
        "expected concurrent execution, took {elapsed:?}"
    );
}

#[tokio::test]
async fn serial_executes_take_the_sum_of_sleeps() {
    let (_server, addr) = start_default_server().await;

    let (codes, elapsed) = run_three_sleepers(addr).await;
    assert_eq!(codes, vec![b'C', b'C', b'C', b'Z']);
    assert!(
        elapsed >= Duration::from_millis(300),
        "expected serial execution, took {elapsed:?}"
    );
}

#[tokio::test]
async fn pipelined_output_matches_serial_output() {
    let serial = {
        let (_server, addr) = start_default_server().await;
        let mut client = TestClient::connect(addr).await;
        client.handshake().await;
        client.send_parse("", "SELECT 1", &[]).await;
        client.send_bind("", "", &[], &[], &[]).await;
        client.send_describe(b'P', "").await;
        client.send_execute("", 0).await;
        client.send_sync().await;
        client.read_until_ready().await
    };

    let pipelined = {
        let config = ServerConfig::new(Arc::new(ScenarioParser)).with_pipeline(PipelineConfig {
            enabled: true,
            max_concurrency: 8,
            max_queue_depth: 64,
        });
        let (_server, addr) = start_server(config).await;
        let mut client = TestClient::connect(addr).await;
        client.handshake().await;
        client.send_parse("", "SELECT 1", &[]).await;
        client.send_bind("", "", &[], &[], &[]).await;
        client.send_describe(b'P', "").await;
        client.send_execute("", 0).await;
        client.send_sync().await;
        client.read_until_ready().await
    };

    assert_eq!(serial, pipelined);
}

#[tokio::test]
async fn pipelined_failure_cancels_successors() {
    struct FailFirst;

    #[async_trait]
    impl QueryParser for FailFirst {
        async fn parse(
            &self,
            _session: &Arc<Session>,
            query: &str,
        ) -> Result<Vec<PreparedStatement>, Error> {
            if query == "bad" {
                Ok(vec![PreparedStatement::new(|_, _, _| {
                    Box::pin(async move {
                        Err(Error::query("executor exploded").with_code("XX001"))
                    })
                })])
            } else {
                Ok(vec![sleeper(Duration::from_millis(10), "OK")])
            }
        }
    }

    let config = ServerConfig::new(Arc::new(FailFirst)).with_pipeline(PipelineConfig {
        enabled: true,
        max_concurrency: 8,
        max_queue_depth: 64,
    });
    let (_server, addr) = start_server(config).await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    client.send_parse("bad", "bad", &[]).await;
    client.send_parse("good", "good", &[]).await;
    client.send_bind("pb", "bad", &[], &[], &[]).await;
    client.send_bind("pg", "good", &[], &[], &[]).await;
    client.send_sync().await;
    client.read_until_ready().await;

    client.send_execute("pb", 0).await;
    client.send_execute("pg", 0).await;
    client.send_sync().await;

    let frames = client.read_until_ready().await;
    // The failing task emits its error; its successor emits nothing.
    assert_eq!(frame_codes(&frames), vec![b'E', b'Z']);
    let error = String::from_utf8_lossy(&frames[0].1).to_string();
    assert!(error.contains("XX001"), "{error}");
}

#[tokio::test]
async fn graceful_close_races_the_drain_timer() {
    let (server, addr) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    // Park a two second statement on the connection.
    client.send_query("sleep2000").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    server.close().await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");

    // Subsequent closes return immediately.
    let start = Instant::now();
    server.close().await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn terminate_ends_the_connection_cleanly() {
    let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let observed = closed.clone();

    let config = ServerConfig::new(Arc::new(ScenarioParser)).with_close_hook(Arc::new(
        move |_session| {
            observed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        },
    ));
    let (_server, addr) = start_server(config).await;

    let mut client = TestClient::connect(addr).await;
    client.handshake().await;
    client.send_terminate().await;

    // The server noticed the clean shutdown and ran the close hook.
    let mut waited = Duration::ZERO;
    while closed.load(std::sync::atomic::Ordering::SeqCst) == 0
        && waited < Duration::from_secs(1)
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ssl_request_without_tls_is_refused() {
    let (_server, addr) = start_default_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut frame = BytesMut::new();
    frame.put_i32(8);
    frame.put_i32(80877103);
    stream.write_all(&frame).await.unwrap();

    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"N");

    // The client may continue with a plain startup afterwards.
    let mut client = TestClient { stream };
    client.handshake().await;
    client.send_query("SELECT 1").await;
    let frames = client.read_until_ready().await;
    assert_eq!(frame_codes(&frames), vec![b'T', b'D', b'C', b'Z']);
}

#[tokio::test]
async fn cancel_request_is_accepted_and_discarded() {
    let (_server, addr) = start_default_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut frame = BytesMut::new();
    frame.put_i32(16);
    frame.put_i32(80877102);
    frame.put_i32(1234);
    frame.put_i32(5678);
    stream.write_all(&frame).await.unwrap();

    // The server closes the socket without a response.
    let mut buffer = [0u8; 1];
    let read = stream.read(&mut buffer).await.unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn unsupported_protocol_version_is_rejected() {
    let (_server, addr) = start_default_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut body = BytesMut::new();
    body.put_i32(131072); // protocol 2.0
    body.put_slice(b"user\0alice\0\0");
    let mut frame = BytesMut::new();
    frame.put_i32(body.len() as i32 + 4);
    frame.put_slice(&body);
    stream.write_all(&frame).await.unwrap();

    // An ErrorResponse arrives, then the connection closes.
    let code = stream.read_u8().await.unwrap();
    assert_eq!(code, b'E');
}
