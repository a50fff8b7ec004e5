//! Server configuration.
//!
//! Everything here is read-only once `serve` starts; per-connection state
//! lives on [`crate::session::Session`].

// Standard library imports
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// Internal crate imports
use crate::auth::{AuthStrategy, TrustAuth};
use crate::datatypes::TypeRegistry;
use crate::errors::Error;
use crate::pipeline::PipelineConfig;
use crate::session::Session;
use crate::statements::{
    BoxFuture, HashMapPortalCache, HashMapStatementCache, PortalCache, PortalCacheFactory,
    QueryParser, StatementCache, StatementCacheFactory,
};
use crate::tls::build_acceptor;

/// Hook invoked once after authentication, before the first ReadyForQuery.
/// Lets the host enrich the session, e.g. resolve a tenant from the startup
/// parameters into a session attribute.
pub type SessionHandler =
    Arc<dyn for<'a> Fn(&'a Arc<Session>) -> BoxFuture<'a, Result<(), Error>> + Send + Sync>;

/// Hook invoked when a connection ends cleanly.
pub type CloseHook = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Hook invoked when a connection ends abnormally, with the error that
/// terminated it.
pub type TerminateHook = Arc<dyn Fn(&Arc<Session>, &Error) + Send + Sync>;

/// Frames larger than this default are rejected unless the host raises the
/// bound.
const DEFAULT_MAX_MESSAGE_SIZE: i32 = 16 * 1024 * 1024;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Process-wide server configuration, built once by the host and shared by
/// every connection.
pub struct ServerConfig {
    pub(crate) parser: Arc<dyn QueryParser>,
    pub(crate) auth: Arc<dyn AuthStrategy>,
    pub(crate) tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
    pub(crate) parameters: HashMap<String, String>,
    pub(crate) version: String,
    pub(crate) statement_cache: StatementCacheFactory,
    pub(crate) portal_cache: PortalCacheFactory,
    pub(crate) session_handler: Option<SessionHandler>,
    pub(crate) on_close: Option<CloseHook>,
    pub(crate) on_terminate: Option<TerminateHook>,
    pub(crate) pipeline: PipelineConfig,
    pub(crate) max_message_size: i32,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) shutdown_timeout: Duration,
}

impl ServerConfig {
    /// A configuration with trust authentication, no TLS, unbounded caches
    /// and pipelining off. Only the parse callback is mandatory.
    pub fn new(parser: Arc<dyn QueryParser>) -> ServerConfig {
        ServerConfig {
            parser,
            auth: Arc::new(TrustAuth),
            tls_acceptor: None,
            parameters: default_parameters(),
            version: "15.0".to_string(),
            statement_cache: Arc::new(|| {
                Box::new(HashMapStatementCache::default()) as Box<dyn StatementCache>
            }),
            portal_cache: Arc::new(|| Box::new(HashMapPortalCache::default()) as Box<dyn PortalCache>),
            session_handler: None,
            on_close: None,
            on_terminate: None,
            pipeline: PipelineConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            registry: Arc::new(TypeRegistry::new()),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Replace the authentication strategy.
    pub fn with_auth(mut self, auth: Arc<dyn AuthStrategy>) -> ServerConfig {
        self.auth = auth;
        self
    }

    /// Accept TLS upgrades with the given acceptor.
    pub fn with_tls(mut self, acceptor: tokio_native_tls::TlsAcceptor) -> ServerConfig {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Accept TLS upgrades using a PKCS#8 certificate and key file.
    pub fn with_tls_files(mut self, cert: &Path, key: &Path) -> Result<ServerConfig, Error> {
        self.tls_acceptor = Some(build_acceptor(cert, key)?);
        Ok(self)
    }

    /// The version string advertised through the `server_version`
    /// parameter.
    pub fn with_version(mut self, version: impl Into<String>) -> ServerConfig {
        self.version = version.into();
        self
    }

    /// Add or override a parameter advertised through ParameterStatus at
    /// session start.
    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> ServerConfig {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Add or override a whole set of advertised parameters.
    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> ServerConfig {
        self.parameters.extend(parameters);
        self
    }

    /// Replace the statement cache factory, e.g. with
    /// [`crate::statements::LruStatementCache`] for a bounded cache.
    pub fn with_statement_cache(mut self, factory: StatementCacheFactory) -> ServerConfig {
        self.statement_cache = factory;
        self
    }

    /// Replace the portal cache factory.
    pub fn with_portal_cache(mut self, factory: PortalCacheFactory) -> ServerConfig {
        self.portal_cache = factory;
        self
    }

    /// Install the post-authentication session hook.
    pub fn with_session_handler(mut self, handler: SessionHandler) -> ServerConfig {
        self.session_handler = Some(handler);
        self
    }

    /// Install the clean connection-close hook.
    pub fn with_close_hook(mut self, hook: CloseHook) -> ServerConfig {
        self.on_close = Some(hook);
        self
    }

    /// Install the abnormal-termination hook.
    pub fn with_terminate_hook(mut self, hook: TerminateHook) -> ServerConfig {
        self.on_terminate = Some(hook);
        self
    }

    /// Configure the parallel pipeline engine.
    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> ServerConfig {
        self.pipeline = pipeline;
        self
    }

    /// Bound the size of a single protocol message.
    pub fn with_max_message_size(mut self, bytes: i32) -> ServerConfig {
        self.max_message_size = bytes.max(64);
        self
    }

    /// Extend or override the type registry used for value codecs.
    pub fn with_types<F>(mut self, extend: F) -> ServerConfig
    where
        F: FnOnce(&mut TypeRegistry),
    {
        let mut registry = (*self.registry).clone();
        extend(&mut registry);
        self.registry = Arc::new(registry);
        self
    }

    /// How long `close` waits for in-flight connections before forcing the
    /// shutdown.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> ServerConfig {
        self.shutdown_timeout = timeout;
        self
    }

    /// The ParameterStatus set for a new session, with `server_version`
    /// reflecting the configured version string.
    pub(crate) fn session_parameters(&self) -> Vec<(String, String)> {
        let mut parameters: Vec<(String, String)> = self
            .parameters
            .iter()
            .filter(|(key, _)| key.as_str() != "server_version")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        parameters.sort();
        parameters.push(("server_version".to_string(), self.version.clone()));
        parameters
    }
}

fn default_parameters() -> HashMap<String, String> {
    HashMap::from([
        ("client_encoding".to_string(), "UTF8".to_string()),
        ("DateStyle".to_string(), "ISO, MDY".to_string()),
        ("IntervalStyle".to_string(), "postgres".to_string()),
        ("TimeZone".to_string(), "UTC".to_string()),
        ("integer_datetimes".to_string(), "on".to_string()),
        (
            "standard_conforming_strings".to_string(),
            "on".to_string(),
        ),
    ])
}
