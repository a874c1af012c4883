//! Session registry and engine lifecycle.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use eio_core::options::EngineOptions;
use eio_core::socket::Socket;
use eio_core::transport::TransportKind;

use crate::router;

/// Length of generated session ids.
const SESSION_ID_LEN: usize = 20;

/// Server-level callback run for every freshly handshaken session.
pub type ConnectHandler = Arc<dyn Fn(&Arc<Socket>) + Send + Sync>;

/// Builder for an [`Engine`].
#[derive(Debug, Default)]
pub struct EngineBuilder {
    options: EngineOptions,
}

impl EngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertised client ping cadence.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval;
        self
    }

    /// Liveness deadline; also bounds parked polls and blocked writes.
    #[must_use]
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.options.ping_timeout = timeout;
        self
    }

    /// Whether polling sessions may upgrade to the framed transport.
    #[must_use]
    pub fn allow_upgrades(mut self, allow: bool) -> Self {
        self.options.allow_upgrades = allow;
        self
    }

    /// Session cookie name to set on handshake responses.
    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>) -> Self {
        self.options.cookie = Some(name.into());
        self
    }

    /// Restrict the enabled transports.
    #[must_use]
    pub fn transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.options.transports = transports;
        self
    }

    /// HTTP path prefix the router binds.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.options.path = path.into();
        self
    }

    /// Build the engine and start its liveness sweeper. Must be called
    /// inside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> Arc<Engine> {
        let engine = Arc::new_cyclic(|weak| Engine {
            weak: weak.clone(),
            options: self.options,
            sockets: DashMap::new(),
            connect: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });
        engine.spawn_sweeper();
        engine
    }
}

/// The registry of live sessions and the server's lifecycle handle.
pub struct Engine {
    weak: Weak<Self>,
    options: EngineOptions,
    sockets: DashMap<String, Arc<Socket>>,
    connect: Mutex<Vec<ConnectHandler>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .field("sessions", &self.sockets.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Register a callback run for every new session, before any of its
    /// messages dispatch. Registration is append-only.
    pub fn on_connect(&self, handler: impl Fn(&Arc<Socket>) + Send + Sync + 'static) {
        self.connect.lock().push(Arc::new(handler));
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sockets.len()
    }

    /// Snapshot of the live sessions.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Socket>> {
        self.sockets.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get(&self, sid: &str) -> Option<Arc<Socket>> {
        self.sockets.get(sid).map(|entry| entry.value().clone())
    }

    /// Create a socket with a fresh id, wired to evict itself from the
    /// index on close.
    pub(crate) fn create_socket(&self) -> Arc<Socket> {
        let id = loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(SESSION_ID_LEN)
                .map(char::from)
                .collect();
            if !self.sockets.contains_key(&candidate) {
                break candidate;
            }
        };
        let socket = Socket::new(id.clone());
        let registry = self.weak.clone();
        socket.on_close(move |_| {
            if let Some(engine) = registry.upgrade() {
                engine.sockets.remove(&id);
            }
        });
        socket
    }

    /// Install a socket in the index and run the server-level connect
    /// callbacks.
    pub(crate) fn register(&self, socket: &Arc<Socket>) {
        self.sockets.insert(socket.id().to_owned(), Arc::clone(socket));
        info!(sid = %socket.id(), "session established");
        let handlers = self.connect.lock().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(socket))).is_err() {
                error!(sid = %socket.id(), "connect handler panicked");
            }
        }
    }

    fn spawn_sweeper(&self) {
        let engine = self.weak.clone();
        let cancel = self.cancel.clone();
        let ping_timeout = self.options.ping_timeout;
        let period = ping_timeout / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(engine) = engine.upgrade() else { break };
                let lost: Vec<Arc<Socket>> = engine
                    .sockets
                    .iter()
                    .filter(|entry| entry.value().is_lost(ping_timeout))
                    .map(|entry| entry.value().clone())
                    .collect();
                for socket in lost {
                    debug!(sid = %socket.id(), "liveness expired");
                    socket.close_with_reason("ping timeout").await;
                }
            }
        });
    }

    /// The Axum router serving the engine's path.
    #[must_use]
    pub fn router(&self) -> axum::Router {
        router::router(self.weak.clone(), &self.options.path)
    }

    /// Bind `addr` and serve until [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Returns the bind or accept error.
    pub async fn listen(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, path = %self.options.path, "listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.cancel.clone().cancelled_owned())
            .await
    }

    /// Close every session, stop the sweeper, and release any listener.
    pub async fn close(&self) {
        self.cancel.cancel();
        for socket in self.clients() {
            socket.close().await;
        }
        self.sockets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    #[tokio::test]
    async fn generated_ids_are_unique_and_twenty_chars() {
        let engine = EngineBuilder::new().build();
        let a = engine.create_socket();
        let b = engine.create_socket();
        assert_eq!(a.id().len(), SESSION_ID_LEN);
        assert_eq!(b.id().len(), SESSION_ID_LEN);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn close_evicts_session_from_index() -> TestResult {
        let engine = EngineBuilder::new().build();
        let socket = engine.create_socket();
        engine.register(&socket);
        assert_eq!(engine.count(), 1);
        assert!(engine.get(socket.id()).is_some());

        socket.close().await;
        assert_eq!(engine.count(), 0);
        assert!(engine.get(socket.id()).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn connect_handler_panics_are_contained() {
        let engine = EngineBuilder::new().build();
        engine.on_connect(|_| panic!("bad connect hook"));
        let socket = engine.create_socket();
        engine.register(&socket);
        assert_eq!(engine.count(), 1);
    }

    #[tokio::test]
    async fn sweeper_closes_lost_sessions() -> TestResult {
        let engine = EngineBuilder::new()
            .ping_timeout(Duration::from_millis(500))
            .build();
        let socket = engine.create_socket();
        engine.register(&socket);

        for _ in 0..40 {
            if engine.count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(engine.count(), 0);
        assert!(socket.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn close_all_closes_every_session() -> TestResult {
        let engine = EngineBuilder::new().build();
        let first = engine.create_socket();
        let second = engine.create_socket();
        engine.register(&first);
        engine.register(&second);
        assert_eq!(engine.count(), 2);

        engine.close().await;
        assert_eq!(engine.count(), 0);
        assert!(first.is_closed());
        assert!(second.is_closed());
        Ok(())
    }
}
