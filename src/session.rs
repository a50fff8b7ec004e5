//! Per-connection session state, shared with host callbacks.

// Standard library imports
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

// External crate imports
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;

// Internal crate imports
use crate::datatypes::TypeRegistry;
use crate::statements::{PortalCache, StatementCache};

/// The state of one authenticated client connection: the statement and
/// portal caches backing the extended query protocol, the startup
/// parameters the client sent, and an attribute map host callbacks can use
/// to carry per-connection values between parse and execute.
///
/// A session is created after authentication and destroyed when the socket
/// closes. It is handed to host callbacks as `Arc<Session>`; the caches are
/// only touched by the connection's own command loop.
pub struct Session {
    remote_addr: SocketAddr,
    process_id: i32,
    secret_key: i32,
    user: String,
    client_parameters: HashMap<String, String>,
    statements: Mutex<Box<dyn StatementCache>>,
    portals: Mutex<Box<dyn PortalCache>>,
    attributes: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    registry: Arc<TypeRegistry>,
    shutdown: broadcast::Sender<()>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        remote_addr: SocketAddr,
        process_id: i32,
        secret_key: i32,
        user: String,
        client_parameters: HashMap<String, String>,
        statements: Box<dyn StatementCache>,
        portals: Box<dyn PortalCache>,
        registry: Arc<TypeRegistry>,
        shutdown: broadcast::Sender<()>,
    ) -> Session {
        Session {
            remote_addr,
            process_id,
            secret_key,
            user,
            client_parameters,
            statements: Mutex::new(statements),
            portals: Mutex::new(portals),
            attributes: RwLock::new(HashMap::new()),
            registry,
            shutdown,
        }
    }

    /// The peer address of the client socket.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The process id reported through BackendKeyData.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// The secret key reported through BackendKeyData.
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// The user name the connection authenticated as.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// A startup parameter the client supplied, e.g. `database` or
    /// `application_name`.
    pub fn client_parameter(&self, key: &str) -> Option<&String> {
        self.client_parameters.get(key)
    }

    pub fn client_parameters(&self) -> &HashMap<String, String> {
        &self.client_parameters
    }

    /// Read an attribute previously stored with [`Session::set_attribute`].
    /// Returns `None` when the key is absent or holds a different type.
    pub fn attribute<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let attributes = self.attributes.read();
        let value = attributes.get(key)?.clone();
        value.downcast::<T>().ok()
    }

    /// Store an arbitrary host value on the session.
    pub fn set_attribute<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.attributes.write().insert(key.into(), Arc::new(value));
    }

    /// Remove an attribute. Returns whether it was present.
    pub fn remove_attribute(&self, key: &str) -> bool {
        self.attributes.write().remove(key).is_some()
    }

    /// The type registry used to encode rows and decode parameters.
    pub fn type_registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// A receiver that fires when the server enters shutdown. Long-running
    /// statement callbacks should select against it.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub(crate) fn statements(&self) -> MutexGuard<'_, Box<dyn StatementCache>> {
        self.statements.lock()
    }

    pub(crate) fn portals(&self) -> MutexGuard<'_, Box<dyn PortalCache>> {
        self.portals.lock()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_addr", &self.remote_addr)
            .field("process_id", &self.process_id)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statements::{HashMapPortalCache, HashMapStatementCache};

    fn session() -> Session {
        let (shutdown, _) = broadcast::channel(1);
        Session::new(
            "127.0.0.1:5432".parse().unwrap(),
            42,
            7,
            "postgres".to_string(),
            HashMap::from([("database".to_string(), "app".to_string())]),
            Box::<HashMapStatementCache>::default(),
            Box::<HashMapPortalCache>::default(),
            Arc::new(TypeRegistry::new()),
            shutdown,
        )
    }

    #[test]
    fn attributes_are_typed() {
        let session = session();
        session.set_attribute("tenant_id", 42u64);

        assert_eq!(session.attribute::<u64>("tenant_id").as_deref(), Some(&42));
        // A different type at the same key misses.
        assert!(session.attribute::<String>("tenant_id").is_none());
        assert!(session.attribute::<u64>("missing").is_none());

        assert!(session.remove_attribute("tenant_id"));
        assert!(!session.remove_attribute("tenant_id"));
    }

    #[test]
    fn client_parameters_are_exposed() {
        let session = session();
        assert_eq!(
            session.client_parameter("database").map(String::as_str),
            Some("app")
        );
        assert_eq!(session.user(), "postgres");
    }
}
