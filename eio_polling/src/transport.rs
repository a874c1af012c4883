//! The polling transport proper.
//!
//! The outbox is a queue plus an optional parked GET, handed its batch
//! through a oneshot channel. Writers block (bounded by the write
//! deadline) while the queue is at capacity; drains wake them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use eio_core::error::{InboxError, PayloadError, TransportError};
use eio_core::packet::Packet;
use eio_core::payload;
use eio_core::socket::Socket;
use eio_core::transport::{Transport, TransportKind};
use eio_core::OUTBOX_CAPACITY;

/// Result of serving a GET.
#[derive(Debug)]
pub enum GetOutcome {
    /// Batch to encode as the response payload. Never empty.
    Packets(Vec<Packet>),
    /// Another GET is already in flight for this session.
    Conflict,
}

/// Result of serving a POST.
#[derive(Debug)]
pub enum PostOutcome {
    /// Every packet was queued for dispatch.
    Accepted,
    /// Another POST is already in flight for this session.
    Conflict,
    /// The body did not decode as a payload.
    Malformed(PayloadError),
    /// The session inbox is full; the client should retry.
    Overloaded,
    /// The session closed underneath the request.
    Gone,
}

struct PollState {
    queue: VecDeque<Packet>,
    parked: Option<oneshot::Sender<Vec<Packet>>>,
    closed: bool,
}

/// Long-polling transport for one session, rebound to each HTTP exchange.
pub struct PollingTransport {
    poll_timeout: Duration,
    write_timeout: Duration,
    state: Mutex<PollState>,
    /// Signals outbox room to blocked writers.
    space: Notify,
    get_busy: AtomicBool,
    post_busy: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for PollingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PollingTransport")
            .field("queued", &state.queue.len())
            .field("parked", &state.parked.is_some())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl PollingTransport {
    /// Create a transport. `cancel` should be a child of the session's
    /// token so a closing session wakes any parked request.
    #[must_use]
    pub fn new(
        poll_timeout: Duration,
        write_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            poll_timeout,
            write_timeout,
            state: Mutex::new(PollState {
                queue: VecDeque::new(),
                parked: None,
                closed: false,
            }),
            space: Notify::new(),
            get_busy: AtomicBool::new(false),
            post_busy: AtomicBool::new(false),
            cancel,
        }
    }

    /// Serve a GET: drain everything queued, or park until a packet
    /// arrives, the poll deadline passes, or the session closes. The
    /// latter two produce a single NOOP.
    pub async fn handle_get(&self) -> GetOutcome {
        if self.get_busy.swap(true, Ordering::SeqCst) {
            return GetOutcome::Conflict;
        }
        let packets = self.poll().await;
        self.get_busy.store(false, Ordering::SeqCst);
        GetOutcome::Packets(packets)
    }

    async fn poll(&self) -> Vec<Packet> {
        let mut waiter = {
            let mut state = self.state.lock();
            if state.closed {
                return vec![Packet::noop()];
            }
            if !state.queue.is_empty() {
                let batch: Vec<Packet> = state.queue.drain(..).collect();
                self.space.notify_one();
                return batch;
            }
            let (tx, rx) = oneshot::channel();
            state.parked = Some(tx);
            rx
        };
        tokio::select! {
            batch = &mut waiter => batch.unwrap_or_else(|_| vec![Packet::noop()]),
            () = tokio::time::sleep(self.poll_timeout) => self.abandon_park(&mut waiter),
            () = self.cancel.cancelled() => self.abandon_park(&mut waiter),
        }
    }

    /// Resolve a park that ended without an observed handoff. A writer may
    /// have taken the parked sender concurrently; its batch then sits in
    /// the channel and must not be dropped.
    fn abandon_park(&self, waiter: &mut oneshot::Receiver<Vec<Packet>>) -> Vec<Packet> {
        let still_parked = self.state.lock().parked.take().is_some();
        if still_parked {
            vec![Packet::noop()]
        } else {
            waiter.try_recv().unwrap_or_else(|_| vec![Packet::noop()])
        }
    }

    /// Serve a POST: decode the body and queue each packet, in order, for
    /// dispatch.
    pub fn handle_post(&self, body: &[u8], socket: &Socket) -> PostOutcome {
        if self.post_busy.swap(true, Ordering::SeqCst) {
            return PostOutcome::Conflict;
        }
        let outcome = match payload::decode(body) {
            Err(e) => PostOutcome::Malformed(e),
            Ok(packets) => {
                let mut outcome = PostOutcome::Accepted;
                for packet in packets {
                    match socket.try_ingest(packet) {
                        Ok(()) => {}
                        Err(InboxError::Full) => {
                            outcome = PostOutcome::Overloaded;
                            break;
                        }
                        Err(InboxError::Closed) => {
                            outcome = PostOutcome::Gone;
                            break;
                        }
                    }
                }
                outcome
            }
        };
        self.post_busy.store(false, Ordering::SeqCst);
        outcome
    }
}

impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let deadline = tokio::time::Instant::now() + self.write_timeout;
            let mut pending = Some(packet);
            loop {
                {
                    let mut state = self.state.lock();
                    if state.closed {
                        return Err(TransportError::Closed);
                    }
                    if let Some(waiter) = state.parked.take() {
                        let mut batch: Vec<Packet> = state.queue.drain(..).collect();
                        batch.extend(pending.take());
                        match waiter.send(batch) {
                            Ok(()) => {
                                self.space.notify_one();
                                return Ok(());
                            }
                            Err(batch) => {
                                // the poller gave up just now; keep order,
                                // the packet is queued either way
                                state.queue = VecDeque::from(batch);
                                return Ok(());
                            }
                        }
                    }
                    if state.queue.len() < OUTBOX_CAPACITY {
                        state.queue.extend(pending.take());
                        return Ok(());
                    }
                }
                let room = self.space.notified();
                if tokio::time::timeout_at(deadline, room).await.is_err() {
                    return Err(TransportError::OutboxFull);
                }
            }
        }
        .boxed()
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        let handoff = {
            let mut state = self.state.lock();
            if state.parked.is_some() && !state.queue.is_empty() {
                let batch: Vec<Packet> = state.queue.drain(..).collect();
                state.parked.take().map(|waiter| (waiter, batch))
            } else {
                None
            }
        };
        if let Some((waiter, batch)) = handoff {
            match waiter.send(batch) {
                Ok(()) => self.space.notify_one(),
                Err(batch) => self.state.lock().queue = VecDeque::from(batch),
            }
        }
        async {}.boxed()
    }

    fn upgrade_to(&self, successor: TransportKind) -> BoxFuture<'_, ()> {
        async move {
            self.flush().await;
            // a poll still parked here had an empty outbox; release it so
            // the client can finish switching to the successor
            let waiter = self.state.lock().parked.take();
            if let Some(waiter) = waiter {
                let _ = waiter.send(vec![Packet::noop()]);
            }
            debug!(successor = %successor, "polling leg released for upgrade");
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let waiter = {
                let mut state = self.state.lock();
                if state.closed {
                    return Ok(());
                }
                state.closed = true;
                state.queue.clear();
                state.parked.take()
            };
            if let Some(waiter) = waiter {
                let _ = waiter.send(vec![Packet::noop()]);
            }
            self.space.notify_waiters();
            self.cancel.cancel();
            Ok(())
        }
        .boxed()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
