//! Server lifecycle: the accept loop, tracked connection tasks and the
//! graceful drain behind `close`.

// Standard library imports
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

// External crate imports
use log::{debug, error, info};
use once_cell::sync::Lazy;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;

// Internal crate imports
use crate::client::client_entrypoint;
use crate::config::ServerConfig;
use crate::errors::Error;

/// Gauge of currently connected clients across all servers in the process.
pub static CURRENT_CLIENT_COUNT: Lazy<Arc<AtomicI64>> = Lazy::new(|| Arc::new(AtomicI64::new(0)));

/// Counts in-flight tasks and wakes `wait` once the last one finished.
#[derive(Clone)]
struct TaskTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    count: AtomicUsize,
    notify: Notify,
}

impl TaskTracker {
    fn new() -> TaskTracker {
        TaskTracker {
            inner: Arc::new(TrackerInner {
                count: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    fn track(&self) -> TaskGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        TaskGuard {
            inner: self.inner.clone(),
        }
    }

    async fn wait(&self) {
        loop {
            // Register interest before reading the counter so a concurrent
            // final decrement cannot slip between check and sleep.
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct TaskGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

/// An embeddable PostgreSQL wire protocol server.
///
/// The server owns no sockets until [`Server::serve`] or
/// [`Server::listen_and_serve`] runs; configuration is immutable once
/// serving starts. [`Server::close`] drains in-flight connections against a
/// bounded timer and is safe to call any number of times.
pub struct Server {
    config: Arc<ServerConfig>,
    shutdown: broadcast::Sender<()>,
    closing: Arc<AtomicBool>,
    tasks: TaskTracker,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        let (shutdown, _) = broadcast::channel(1);
        Server {
            config: Arc::new(config),
            shutdown,
            closing: Arc::new(AtomicBool::new(false)),
            tasks: TaskTracker::new(),
        }
    }

    /// Bind the address and serve until the server is closed.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<(), Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| Error::SocketError(format!("Failed to bind listener: {err}")))?;
        self.serve(listener).await
    }

    /// Accept and serve connections on the given listener. Returns Ok when
    /// the server is closed; only fatal listener errors surface to the
    /// caller. Per-connection errors are logged, never returned.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        // Subscribe before checking the flag: `close` raises the flag
        // before it signals, so the shutdown cannot fall in between.
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.closing.load(Ordering::Acquire) {
            return Ok(());
        }

        let _serve_guard = self.tasks.track();
        if let Ok(addr) = listener.local_addr() {
            info!("serving incoming connections on {addr}");
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("accept loop stopped by shutdown signal");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    // The listener breaking during shutdown is the normal
                    // way out; anything else is fatal for the accept loop.
                    if self.closing.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    return Err(Error::SocketError(format!("Accept failed: {err}")));
                }
            };

            debug!("client {addr} connected");
            self.spawn_connection(stream, addr);
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let guard = self.tasks.track();
        let config = self.config.clone();
        let shutdown_tx = self.shutdown.clone();
        let closing = self.closing.clone();

        tokio::spawn(async move {
            let _guard = guard;
            CURRENT_CLIENT_COUNT.fetch_add(1, Ordering::Relaxed);

            match client_entrypoint(stream, addr, config, shutdown_tx, closing.clone()).await {
                Ok(()) => debug!("client {addr} disconnected"),
                Err(err) => {
                    // Expected noise while closing: connections break as
                    // the process goes away.
                    if closing.load(Ordering::Relaxed) {
                        debug!("client {addr} disconnected with error during shutdown: {err}");
                    } else {
                        error!("client {addr} disconnected with error: {err}");
                    }
                }
            }

            CURRENT_CLIENT_COUNT.fetch_add(-1, Ordering::Relaxed);
        });
    }

    /// Gracefully close the server: stop accepting, signal every
    /// connection, and wait for in-flight tasks up to the configured
    /// drain timeout. Subsequent calls return immediately.
    pub async fn close(&self) -> Result<(), Error> {
        // Single authority for suppressing shutdown-race log noise; the
        // flag must be raised before the listener is told to stop.
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.shutdown.send(());

        match timeout(self.config.shutdown_timeout, self.tasks.wait()).await {
            Ok(()) => info!("server closed"),
            Err(_) => {
                error!("graceful shutdown timed out, forcing close");
            }
        }
        Ok(())
    }

    /// Whether `close` has been initiated.
    pub fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::statements::{PreparedStatement, QueryParser};
    use async_trait::async_trait;
    use std::time::{Duration, Instant};

    struct SleepyParser;

    #[async_trait]
    impl QueryParser for SleepyParser {
        async fn parse(
            &self,
            _session: &Arc<Session>,
            _query: &str,
        ) -> Result<Vec<PreparedStatement>, Error> {
            Ok(vec![PreparedStatement::new(|_, writer, _| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    writer.complete("OK").await
                })
            })])
        }
    }

    fn server() -> Server {
        Server::new(ServerConfig::new(Arc::new(SleepyParser)))
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let server = server();
        assert!(server.close().await.is_ok());
        assert!(server.closing());
        assert!(server.close().await.is_ok());
        assert!(server.close().await.is_ok());
    }

    #[tokio::test]
    async fn close_before_serve_makes_serve_return() {
        let server = server();
        server.close().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(server.serve(listener).await.is_ok());
    }

    #[tokio::test]
    async fn close_unblocks_a_running_serve() {
        let server = Arc::new(server());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let serving = server.clone();
        let serve_task = tokio::spawn(async move { serving.serve(listener).await });

        // Give the accept loop a beat to subscribe.
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.close().await.unwrap();
        assert!(serve_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_respects_the_drain_timer() {
        let config = ServerConfig::new(Arc::new(SleepyParser))
            .with_shutdown_timeout(Duration::from_millis(200));
        let server = Arc::new(Server::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        // Park one raw connection mid-handshake so a tracked task exists.
        let _conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        server.close().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(180));
        assert!(elapsed < Duration::from_millis(600));

        // A second close returns immediately.
        let start = Instant::now();
        server.close().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn concurrent_closes_all_return() {
        let server = Arc::new(server());
        let mut joins = Vec::new();
        for _ in 0..8 {
            let server = server.clone();
            joins.push(tokio::spawn(async move { server.close().await }));
        }
        for join in joins {
            assert!(join.await.unwrap().is_ok());
        }
    }
}
