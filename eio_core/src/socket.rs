//! Per-session socket state machine.
//!
//! A socket is the durable entity behind a session id. It owns the
//! bounded inbox feeding a single dispatch task (the per-session ordering
//! guarantee), the heartbeat tick, the registered application handlers,
//! and up to two transports during the upgrade window.
//!
//! The conceptual states map onto storage like this: the heartbeat tick
//! is nonzero from creation (OPENING/OPEN) and zero exactly once closed;
//! both transport slots occupied means an upgrade is in flight.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{AttachError, InboxError, SendError, SocketError, TransportError};
use crate::packet::{Packet, PacketType};
use crate::transport::{Transport, TransportKind};
use crate::INBOX_CAPACITY;

/// Handler for inbound MESSAGE packets: payload bytes plus the binary flag.
pub type MessageHandler = Arc<dyn Fn(&[u8], bool) + Send + Sync>;

/// Handler fired when the upgrade barrier completes.
pub type UpgradeHandler = Arc<dyn Fn() + Send + Sync>;

/// Handler fired exactly once when the session closes, with the reason.
pub type CloseHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Handler for recovered errors, including application handler panics.
pub type ErrorHandler = Arc<dyn Fn(&SocketError) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    message: Mutex<Vec<MessageHandler>>,
    upgrade: Mutex<Vec<UpgradeHandler>>,
    close: Mutex<Vec<CloseHandler>>,
    error: Mutex<Vec<ErrorHandler>>,
}

/// The one-or-two transports serving a session.
///
/// The first transport to attach lands in `backup`; a second, attached by
/// an upgrade attempt, becomes `primary`. Outside an upgrade window
/// exactly one slot is occupied.
#[derive(Default)]
struct TransportSlots {
    backup: Option<Arc<dyn Transport>>,
    primary: Option<Arc<dyn Transport>>,
}

/// The durable per-client session.
pub struct Socket {
    id: String,
    /// Self-reference handed to spawned tasks.
    weak: Weak<Self>,
    /// Epoch seconds of the last client PING; zero once closed.
    heartbeat: AtomicU64,
    inbox_tx: mpsc::Sender<Packet>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    slots: Mutex<TransportSlots>,
    handlers: Handlers,
    cancel: CancellationToken,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("heartbeat", &self.heartbeat.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Create a socket. The dispatch task is not running until
    /// [`start`](Self::start) is called; packets queue in the inbox
    /// meanwhile.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let id = id.into();
        Arc::new_cyclic(|weak| Self {
            id,
            weak: weak.clone(),
            heartbeat: AtomicU64::new(now_secs()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            slots: Mutex::new(TransportSlots::default()),
            handlers: Handlers::default(),
            cancel: CancellationToken::new(),
        })
    }

    /// The session id, the only stable handle.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A child token that is cancelled when the session closes. Transports
    /// bind their long-lived waits to this.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.heartbeat.load(Ordering::SeqCst) == 0
    }

    /// Whether the last observed PING is older than the liveness deadline.
    #[must_use]
    pub fn is_lost(&self, ping_timeout: Duration) -> bool {
        let tick = self.heartbeat.load(Ordering::SeqCst);
        tick != 0 && now_secs().saturating_sub(tick) > ping_timeout.as_secs()
    }

    fn refresh_heartbeat(&self) {
        let now = now_secs();
        // never decrease the tick, never resurrect a closed session
        let _ = self
            .heartbeat
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tick| {
                if tick == 0 {
                    None
                } else {
                    Some(tick.max(now))
                }
            });
    }

    /// Register a MESSAGE handler. Registration is append-only.
    pub fn on_message(&self, handler: impl Fn(&[u8], bool) + Send + Sync + 'static) {
        self.handlers.message.lock().push(Arc::new(handler));
    }

    /// Register an upgrade handler.
    pub fn on_upgrade(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.handlers.upgrade.lock().push(Arc::new(handler));
    }

    /// Register a close handler. Fires exactly once per session.
    pub fn on_close(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.close.lock().push(Arc::new(handler));
    }

    /// Register an error handler.
    pub fn on_error(&self, handler: impl Fn(&SocketError) + Send + Sync + 'static) {
        self.handlers.error.lock().push(Arc::new(handler));
    }

    /// Attach a transport. The first occupies the backup slot; a second,
    /// attached by an upgrade attempt, becomes primary.
    ///
    /// # Errors
    ///
    /// Fails when the session is closed or both slots are occupied.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Result<(), AttachError> {
        if self.is_closed() {
            return Err(AttachError::Closed);
        }
        let mut slots = self.slots.lock();
        if slots.primary.is_some() {
            return Err(AttachError::TransportsFull);
        }
        if slots.backup.is_none() {
            slots.backup = Some(transport);
        } else {
            debug!(sid = %self.id, kind = %transport.kind(), "upgrade transport attached");
            slots.primary = Some(transport);
        }
        Ok(())
    }

    /// The transport serving inbound traffic: the newest one attached.
    #[must_use]
    pub fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        let slots = self.slots.lock();
        slots.primary.clone().or_else(|| slots.backup.clone())
    }

    /// Find an attached transport by kind.
    #[must_use]
    pub fn transport_of_kind(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        let slots = self.slots.lock();
        let found = [&slots.primary, &slots.backup]
            .into_iter()
            .flatten()
            .find(|transport| transport.kind() == kind)
            .cloned();
        found
    }

    /// Whether an upgrade handshake is in flight (both slots occupied).
    #[must_use]
    pub fn is_upgrading(&self) -> bool {
        let slots = self.slots.lock();
        slots.primary.is_some() && slots.backup.is_some()
    }

    /// Queue an inbound packet, waiting for inbox room. Backpressure from
    /// a full inbox propagates to the framed transport's reader.
    ///
    /// # Errors
    ///
    /// Fails when the session is closed.
    pub async fn ingest(&self, packet: Packet) -> Result<(), InboxError> {
        if self.is_closed() {
            return Err(InboxError::Closed);
        }
        self.inbox_tx
            .send(packet)
            .await
            .map_err(|_| InboxError::Closed)
    }

    /// Queue an inbound packet without waiting. Used by the polling POST
    /// path, where a full inbox must fail the request instead of blocking.
    ///
    /// # Errors
    ///
    /// Fails when the inbox is full or the session is closed.
    pub fn try_ingest(&self, packet: Packet) -> Result<(), InboxError> {
        if self.is_closed() {
            return Err(InboxError::Closed);
        }
        self.inbox_tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => InboxError::Full,
            mpsc::error::TrySendError::Closed(_) => InboxError::Closed,
        })
    }

    /// Send an application text message.
    ///
    /// # Errors
    ///
    /// Fails when the session is closed, no transport is attached, or the
    /// write fails at the transport. A saturated outbox also closes the
    /// session.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send_packet(Packet::message(text)).await
    }

    /// Send an application binary message.
    ///
    /// # Errors
    ///
    /// As [`send_text`](Self::send_text).
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_packet(Packet::message_binary(data)).await
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed(self.id.clone()));
        }
        // The older transport keeps serving sends until the upgrade
        // barrier; packets in flight on it must not be overtaken.
        let transport = {
            let slots = self.slots.lock();
            slots.backup.clone().or_else(|| slots.primary.clone())
        }
        .ok_or(SendError::Detached)?;
        match transport.write(packet).await {
            Ok(()) => Ok(()),
            Err(TransportError::OutboxFull) => {
                self.close_with_reason("outbox full").await;
                Err(SendError::Transport(TransportError::OutboxFull))
            }
            Err(e) => Err(SendError::Transport(e)),
        }
    }

    /// Start the dispatch task consuming the inbox. Calling it again is a
    /// no-op.
    pub fn start(&self) {
        let Some(socket) = self.weak.upgrade() else {
            return;
        };
        let Some(mut inbox) = self.inbox_rx.lock().take() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = socket.cancel.cancelled() => break,
                    packet = inbox.recv() => match packet {
                        Some(packet) => socket.dispatch(packet).await,
                        None => break,
                    },
                }
            }
            debug!(sid = %socket.id, "dispatch task finished");
        });
    }

    async fn dispatch(&self, packet: Packet) {
        match packet.kind() {
            PacketType::Close => self.close().await,
            PacketType::Upgrade => self.finish_upgrade().await,
            PacketType::Ping => {
                // the heartbeat refresh and the PONG are off the dispatch
                // path; the PONG echoes the PING's payload verbatim
                let Some(socket) = self.weak.upgrade() else {
                    return;
                };
                let binary = packet.is_binary();
                let data = packet.into_data();
                tokio::spawn(async move {
                    socket.refresh_heartbeat();
                    let pong = Packet::new(PacketType::Pong, data, binary);
                    if let Some(transport) = socket.current_transport() {
                        if let Err(e) = transport.write(pong).await {
                            debug!(sid = %socket.id, error = %e, "pong write failed");
                        }
                    }
                });
            }
            PacketType::Message => self.dispatch_message(&packet),
            other => {
                warn!(sid = %self.id, kind = ?other, "unsupported inbound packet");
                self.fire_error(&SocketError::UnsupportedPacket(other));
            }
        }
    }

    fn dispatch_message(&self, packet: &Packet) {
        let handlers = self.handlers.message.lock().clone();
        for handler in handlers {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| handler(packet.data(), packet.is_binary())));
            if let Err(panic) = outcome {
                let err = SocketError::HandlerPanic(panic_message(&panic));
                error!(sid = %self.id, error = %err, "message handler panicked");
                self.fire_error(&err);
            }
        }
    }

    /// The UPGRADE barrier: flush and retire the older transport, then
    /// hand the session to its successor.
    async fn finish_upgrade(&self) {
        let (old, successor) = {
            let mut slots = self.slots.lock();
            let successor = slots.primary.as_ref().map(|t| t.kind());
            let old = if successor.is_some() {
                slots.backup.take()
            } else {
                None
            };
            (old, successor)
        };
        if let (Some(old), Some(kind)) = (old, successor) {
            old.upgrade_to(kind).await;
            if let Err(e) = old.close().await {
                warn!(sid = %self.id, error = %e, "closing replaced transport");
            }
            debug!(sid = %self.id, to = %kind, "transport upgraded");
        }
        let handlers = self.handlers.upgrade.lock().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                error!(sid = %self.id, "upgrade handler panicked");
            }
        }
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.close_with_reason("").await;
    }

    /// Close with an initiating reason (liveness expiry, transport
    /// failure, outbox saturation). Transport close errors are appended,
    /// comma separated. Close handlers fire exactly once.
    pub async fn close_with_reason(&self, reason: &str) {
        // the zero heartbeat is both the closed marker and the idempotence
        // gate
        if self.heartbeat.swap(0, Ordering::SeqCst) == 0 {
            return;
        }
        let (primary, backup) = {
            let mut slots = self.slots.lock();
            (slots.primary.take(), slots.backup.take())
        };
        let mut parts: Vec<String> = Vec::new();
        if !reason.is_empty() {
            parts.push(reason.to_owned());
        }
        for transport in [primary, backup].into_iter().flatten() {
            if let Err(e) = transport.close().await {
                parts.push(e.to_string());
            }
        }
        let reason = parts.join(", ");
        self.cancel.cancel();
        let handlers = self.handlers.close.lock().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&reason))).is_err() {
                error!(sid = %self.id, "close handler panicked");
            }
        }
        // drop registrations so a socket captured by its own callbacks can
        // still be freed
        self.handlers.message.lock().clear();
        self.handlers.upgrade.lock().clear();
        self.handlers.error.lock().clear();
        self.handlers.close.lock().clear();
        debug!(sid = %self.id, reason = %reason, "session closed");
    }

    fn fire_error(&self, err: &SocketError) {
        let handlers = self.handlers.error.lock().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
                error!(sid = %self.id, "error handler panicked");
            }
        }
    }
}

fn now_secs() -> u64 {
    // clamp to one so a live tick is never confused with the closed marker
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |d| d.as_secs().max(1))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::AtomicBool;
    use testresult::TestResult;

    #[derive(Debug)]
    struct MockTransport {
        kind: TransportKind,
        written: Mutex<Vec<Packet>>,
        upgraded: AtomicBool,
        closed: AtomicBool,
        reject_writes: bool,
    }

    impl MockTransport {
        fn new(kind: TransportKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                written: Mutex::new(Vec::new()),
                upgraded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reject_writes: false,
            })
        }

        fn saturated(kind: TransportKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                written: Mutex::new(Vec::new()),
                upgraded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reject_writes: true,
            })
        }

        fn written(&self) -> Vec<Packet> {
            self.written.lock().clone()
        }
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn write(&self, packet: Packet) -> BoxFuture<'_, Result<(), TransportError>> {
            async move {
                if self.reject_writes {
                    return Err(TransportError::OutboxFull);
                }
                self.written.lock().push(packet);
                Ok(())
            }
            .boxed()
        }

        fn flush(&self) -> BoxFuture<'_, ()> {
            async {}.boxed()
        }

        fn upgrade_to(&self, _successor: TransportKind) -> BoxFuture<'_, ()> {
            self.upgraded.store(true, Ordering::SeqCst);
            async {}.boxed()
        }

        fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
            self.closed.store(true, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn ping_refreshes_heartbeat_and_echoes_pong() -> TestResult {
        let socket = Socket::new("s1");
        let transport = MockTransport::new(TransportKind::Polling);
        socket.attach(transport.clone())?;
        socket.start();

        socket
            .ingest(Packet::new(PacketType::Ping, "probe", false))
            .await?;

        wait_until(|| !transport.written().is_empty()).await;
        let written = transport.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].kind(), PacketType::Pong);
        assert_eq!(written[0].data(), b"probe");
        assert!(!socket.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn messages_dispatch_in_order_and_survive_panicking_handlers() -> TestResult {
        let socket = Socket::new("s2");
        let transport = MockTransport::new(TransportKind::Polling);
        socket.attach(transport)?;

        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        socket.on_message(|_, _| panic!("application bug"));
        {
            let seen = seen.clone();
            socket.on_message(move |data, _| seen.lock().push(data.to_vec()));
        }
        {
            let errors = errors.clone();
            socket.on_error(move |err| errors.lock().push(err.to_string()));
        }
        socket.start();

        for text in ["one", "two", "three"] {
            socket.ingest(Packet::message(text)).await?;
        }

        wait_until(|| seen.lock().len() == 3).await;
        assert_eq!(
            *seen.lock(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        // one panic report per message
        assert_eq!(errors.lock().len(), 3);
        assert!(errors.lock()[0].contains("application bug"));
        Ok(())
    }

    #[tokio::test]
    async fn close_handlers_fire_exactly_once() -> TestResult {
        let socket = Socket::new("s3");
        let transport = MockTransport::new(TransportKind::Polling);
        socket.attach(transport.clone())?;
        socket.start();

        let reasons: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let reasons = reasons.clone();
            socket.on_close(move |reason| reasons.lock().push(reason.to_owned()));
        }

        socket.close_with_reason("ping timeout").await;
        socket.close_with_reason("ping timeout").await;
        socket.close().await;

        assert_eq!(*reasons.lock(), vec!["ping timeout".to_owned()]);
        assert!(socket.is_closed());
        assert!(transport.closed.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn send_is_refused_after_close() -> TestResult {
        let socket = Socket::new("s4");
        socket.attach(MockTransport::new(TransportKind::Polling))?;
        socket.close().await;

        assert!(matches!(
            socket.send_text("late").await,
            Err(SendError::Closed(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn send_routes_to_backup_until_upgrade_completes() -> TestResult {
        let socket = Socket::new("s5");
        let polling = MockTransport::new(TransportKind::Polling);
        let websocket = MockTransport::new(TransportKind::Websocket);
        socket.attach(polling.clone())?;
        socket.attach(websocket.clone())?;
        socket.start();
        assert!(socket.is_upgrading());

        socket.send_text("before barrier").await?;
        assert_eq!(polling.written().len(), 1);
        assert!(websocket.written().is_empty());

        socket.ingest(Packet::new(PacketType::Upgrade, "", false)).await?;
        wait_until(|| polling.closed.load(Ordering::SeqCst)).await;
        assert!(polling.upgraded.load(Ordering::SeqCst));
        assert!(!socket.is_upgrading());

        socket.send_text("after barrier").await?;
        assert_eq!(websocket.written().len(), 1);
        assert_eq!(websocket.written()[0].data(), b"after barrier");
        Ok(())
    }

    #[tokio::test]
    async fn upgrade_probe_pong_goes_to_new_transport() -> TestResult {
        let socket = Socket::new("s6");
        let polling = MockTransport::new(TransportKind::Polling);
        let websocket = MockTransport::new(TransportKind::Websocket);
        socket.attach(polling.clone())?;
        socket.attach(websocket.clone())?;
        socket.start();

        socket
            .ingest(Packet::new(PacketType::Ping, "probe", false))
            .await?;

        wait_until(|| !websocket.written().is_empty()).await;
        assert_eq!(websocket.written()[0].kind(), PacketType::Pong);
        assert_eq!(websocket.written()[0].data(), b"probe");
        assert!(polling.written().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn saturated_outbox_closes_session_with_reason() -> TestResult {
        let socket = Socket::new("s7");
        socket.attach(MockTransport::saturated(TransportKind::Polling))?;

        let reasons: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let reasons = reasons.clone();
            socket.on_close(move |reason| reasons.lock().push(reason.to_owned()));
        }

        assert!(matches!(
            socket.send_text("too much").await,
            Err(SendError::Transport(TransportError::OutboxFull))
        ));
        assert_eq!(*reasons.lock(), vec!["outbox full".to_owned()]);
        assert!(socket.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn third_transport_is_rejected() -> TestResult {
        let socket = Socket::new("s8");
        socket.attach(MockTransport::new(TransportKind::Polling))?;
        socket.attach(MockTransport::new(TransportKind::Websocket))?;
        assert_eq!(
            socket.attach(MockTransport::new(TransportKind::Websocket)),
            Err(AttachError::TransportsFull)
        );
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_is_monotone_and_zero_only_after_close() -> TestResult {
        let socket = Socket::new("s9");
        socket.attach(MockTransport::new(TransportKind::Polling))?;
        let before = socket.heartbeat.load(Ordering::SeqCst);
        assert!(before > 0);

        socket.refresh_heartbeat();
        assert!(socket.heartbeat.load(Ordering::SeqCst) >= before);
        assert!(!socket.is_lost(Duration::from_secs(60)));

        socket.close().await;
        socket.refresh_heartbeat();
        assert_eq!(socket.heartbeat.load(Ordering::SeqCst), 0);
        assert!(!socket.is_lost(Duration::from_secs(60)));
        Ok(())
    }
}
