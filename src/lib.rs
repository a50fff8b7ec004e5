//! An embeddable PostgreSQL wire protocol (v3.0) server library.
//!
//! `pg_valet` lets a host application expose any query execution engine to
//! unmodified PostgreSQL client drivers. The host supplies a
//! [`statements::QueryParser`] that turns a query string into prepared
//! statements; the library owns everything between the socket and that
//! callback: handshake and TLS upgrade, authentication, the simple and
//! extended query subprotocols, parameter binding, row encoding, COPY
//! framing, optional parallel pipelining, and graceful shutdown.
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use pg_valet::{
//!     Column, Error, PreparedStatement, QueryParser, Server, ServerConfig, Session, Value,
//! };
//!
//! struct OneRow;
//!
//! #[async_trait]
//! impl QueryParser for OneRow {
//!     async fn parse(
//!         &self,
//!         _session: &Arc<Session>,
//!         _query: &str,
//!     ) -> Result<Vec<PreparedStatement>, Error> {
//!         let statement = PreparedStatement::new(|_, writer, _| {
//!             Box::pin(async move {
//!                 writer.row(&[Value::Int4(1)]).await?;
//!                 writer.complete("SELECT 1").await
//!             })
//!         })
//!         .with_columns(vec![Column::new("?column?", pg_valet::oid::INT4, 4)]);
//!         Ok(vec![statement])
//!     }
//! }
//!
//! # async fn run() -> Result<(), Error> {
//! let server = Server::new(ServerConfig::new(Arc::new(OneRow)));
//! server.listen_and_serve("127.0.0.1:5432").await
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod constants;
pub mod copy;
pub mod datatypes;
pub mod errors;
pub mod messages;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod statements;
pub mod tls;

mod client;

pub use config::{CloseHook, ServerConfig, SessionHandler, TerminateHook};
pub use copy::{BinaryCopyReader, CopyReader};
pub use datatypes::{oid, Format, Oid, TypeCodec, TypeRegistry, Value};
pub use errors::Error;
pub use messages::ErrorInfo;
pub use pipeline::PipelineConfig;
pub use server::Server;
pub use session::Session;
pub use statements::{
    BoxFuture, Column, DataWriter, LruStatementCache, Parameter, PortalCache, PreparedStatement,
    QueryParser, StatementCache,
};

#[cfg(test)]
mod wire_test;
