//! Client registry and dispatch loop.
//!
//! A [`Context`] owns the socket set, the table of clients and the poller.
//! One dispatch function, [`Context::cycle`], serves both execution modes:
//! the background thread runs it in a loop, and blocking calls on clients
//! without a background thread run it until their condition holds.
//!
//! Locking: the engine state lives behind one mutex. The poller has its own
//! mutex, taken only while blocked in `mio::Poll::poll` and never while the
//! state lock is held. Application callbacks run with neither held.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use crossbeam_channel::{unbounded, Sender};
use mio::{Events, Poll, Token, Waker};
use mqpoll_core::{decode_body, Connack, Packet, Suback};
use parking_lot::{Mutex, MutexGuard};

use crate::callback::{DeliveryToken, MqttHandler};
use crate::connection::{ConnectAttempt, ConnectionState};
use crate::error::{ClientError, Result};
use crate::protocol::{self, Liveness, Wire};
use crate::registry::{DeliveredMessage, Publication};
use crate::session::Session;
use crate::socket::{Readiness, SocketSet, WriteStatus, WAKER_TOKEN};
use crate::sync::{Notify, Signal};

/// Longest a blocked call waits before re-checking its condition.
pub const WAIT_SLICE: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 64;

pub(crate) type SharedHandler = Arc<Mutex<Box<dyn MqttHandler>>>;

/// Acknowledgements a blocked caller is waiting for.
#[derive(Default)]
pub(crate) struct ClientSignals {
    pub connack: Signal<Result<Connack>>,
    pub suback: Signal<Result<Suback>>,
    pub unsuback: Signal<Result<u16>>,
}

/// Engine-side record of one client.
pub(crate) struct ClientState {
    pub server_uri: String,
    pub session: Session,
    pub state: ConnectionState,
    pub token: Option<Token>,
    pub attempt: Option<ConnectAttempt>,
    pub handler: Option<SharedHandler>,
    pub signals: Arc<ClientSignals>,
    pub write_limit: Option<usize>,
}

impl ClientState {
    pub fn new(server_uri: String, session: Session) -> Self {
        Self {
            server_uri,
            session,
            state: ConnectionState::Idle,
            token: None,
            attempt: None,
            handler: None,
            signals: Arc::new(ClientSignals::default()),
            write_limit: None,
        }
    }
}

/// Work collected under the lock and carried out after it is released.
#[derive(Default)]
pub(crate) struct Effects {
    pub arrivals: Vec<(u64, SharedHandler, DeliveredMessage)>,
    pub deliveries: Vec<(SharedHandler, DeliveryToken)>,
    pub lost: Vec<(SharedHandler, ClientError)>,
    pub changed: bool,
}

/// Sends one client's packets through the shared socket set.
pub(crate) struct SocketWire<'a> {
    sockets: &'a mut SocketSet,
    token: Token,
    interrupted: bool,
}

impl<'a> SocketWire<'a> {
    pub fn new(sockets: &'a mut SocketSet, token: Token) -> Self {
        Self {
            sockets,
            token,
            interrupted: false,
        }
    }

    /// A write was left for the dispatch loop to finish.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }
}

impl Wire for SocketWire<'_> {
    fn send(&mut self, bufs: Vec<Bytes>, hold: Option<Publication>) -> io::Result<WriteStatus> {
        let status = self.sockets.write_all(self.token, bufs, hold)?;
        if status == WriteStatus::Interrupted {
            self.interrupted = true;
        }
        Ok(status)
    }

    fn write_pending(&self) -> bool {
        self.sockets.has_pending_write(self.token)
    }
}

/// State guarded by the context lock.
pub(crate) struct EngineState {
    pub sockets: SocketSet,
    pub clients: AHashMap<u64, ClientState>,
    pub by_socket: AHashMap<Token, u64>,
    next_key: u64,
}

impl EngineState {
    /// A client together with the socket set, borrowed at once.
    pub fn split(&mut self, key: u64) -> Option<(&mut ClientState, &mut SocketSet)> {
        let client = self.clients.get_mut(&key)?;
        Some((client, &mut self.sockets))
    }

    /// Push pending writes and stamp `last_sent` for those that finished.
    fn flush(&mut self, now: Instant) -> bool {
        self.sockets.flush_pending();
        let completed = self.sockets.take_completed_writes();
        for token in &completed {
            if let Some(client) = self
                .by_socket
                .get(token)
                .and_then(|key| self.clients.get_mut(key))
            {
                client.session.last_sent = now;
            }
        }
        !completed.is_empty()
    }

    /// Advance a connect, or read and dispatch one packet, on `token`.
    fn service(&mut self, token: Token, now: Instant, fx: &mut Effects) {
        let Some(&key) = self.by_socket.get(&token) else {
            log::debug!("Dropping orphaned socket {:?}", token);
            self.sockets.close(token);
            return;
        };
        let Some(state) = self.clients.get(&key).map(|c| c.state) else {
            return;
        };
        fx.changed = true;

        let result = match state {
            ConnectionState::TcpConnecting | ConnectionState::TlsConnecting => {
                self.drive_connect(key, token, now)
            }
            ConnectionState::Idle => Ok(()),
            _ => self.read_packet(key, token, now),
        };
        if let Err(e) = result {
            self.fail_connection(key, e, fx);
        }
    }

    fn read_packet(&mut self, key: u64, token: Token, now: Instant) -> Result<()> {
        let Some(frame) = self.sockets.read_frame(token)? else {
            return Ok(());
        };
        let packet = decode_body(frame.header, &frame.body).map_err(|e| {
            log::warn!("Malformed packet on {:?}: {}", token, e);
            e
        })?;

        if let Packet::Connack(connack) = packet {
            if let Some(client) = self.clients.get_mut(&key) {
                client.session.last_received = now;
            }
            return self.handle_connack(key, token, connack, now);
        }

        let (client, sockets) = self
            .split(key)
            .ok_or_else(|| ClientError::InvalidState("client has been destroyed".into()))?;
        client.session.last_received = now;
        let session = &mut client.session;
        let mut wire = SocketWire::new(sockets, token);

        match packet {
            Packet::Publish(publish) => protocol::handle_publish(session, &mut wire, publish, now)?,
            Packet::Puback { packet_id } => protocol::handle_puback(session, packet_id),
            Packet::Pubrec { packet_id } => protocol::handle_pubrec(session, &mut wire, packet_id, now)?,
            Packet::Pubrel { packet_id } => protocol::handle_pubrel(session, &mut wire, packet_id, now)?,
            Packet::Pubcomp { packet_id } => protocol::handle_pubcomp(session, packet_id),
            Packet::Pingresp => protocol::handle_pingresp(session),
            Packet::Suback(suback) => client.signals.suback.post(Ok(suback)),
            Packet::Unsuback { packet_id } => client.signals.unsuback.post(Ok(packet_id)),
            other => {
                log::warn!(
                    "{} ignoring unexpected {:?}",
                    session.client_id,
                    other.packet_type()
                );
            }
        }
        Ok(())
    }

    /// Connect timeouts, retries and keep-alive for every client, then
    /// collect at most one queued message per client for its handler.
    fn tick_all(&mut self, now: Instant, fx: &mut Effects) {
        let keys: Vec<u64> = self.clients.keys().copied().collect();
        for key in keys {
            let Some((client, sockets)) = self.split(key) else {
                continue;
            };

            let result = match (client.state, client.token) {
                (state, Some(_)) if state.is_connecting() => match &client.attempt {
                    Some(attempt) if now >= attempt.deadline => Err(ClientError::Timeout),
                    _ => Ok(Liveness::Alive),
                },
                (state, Some(token)) if state.is_established() => {
                    let mut wire = SocketWire::new(sockets, token);
                    protocol::tick(&mut client.session, &mut wire, now)
                }
                _ => Ok(Liveness::Alive),
            };

            if let Some(handler) = &client.handler {
                if let Some(message) = client.session.queue.pop_front() {
                    fx.arrivals.push((key, Arc::clone(handler), message));
                }
                for token in client.session.completed.drain(..) {
                    fx.deliveries.push((Arc::clone(handler), token));
                }
            } else {
                client.session.completed.clear();
            }

            match result {
                Ok(Liveness::Alive) => {}
                Ok(Liveness::Dead) => self.fail_connection(key, ClientError::Timeout, fx),
                Err(e) => self.fail_connection(key, e, fx),
            }
        }
    }

    pub fn insert_client(&mut self, client: ClientState) -> u64 {
        self.next_key += 1;
        self.clients.insert(self.next_key, client);
        self.next_key
    }

    /// Close any socket and drop the client.
    pub fn remove_client(&mut self, key: u64) {
        self.close_session(key, false);
        if let Some(mut client) = self.clients.remove(&key) {
            client.session.close_store();
        }
    }

    fn has_active_clients(&self) -> bool {
        self.clients
            .values()
            .any(|c| c.state != ConnectionState::Idle)
    }
}

struct Poller {
    poll: Poll,
    events: Events,
}

struct Background {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct LostNotice {
    handler: SharedHandler,
    cause: ClientError,
}

struct Shared {
    state: Mutex<EngineState>,
    poller: Mutex<Poller>,
    waker: Waker,
    /// Signalled at the end of every cycle that changed something.
    activity: Notify,
    background: Mutex<Option<Background>>,
    lost_tx: Sender<LostNotice>,
}

/// Shared engine for any number of clients.
///
/// Cloning is cheap; every clone refers to the same engine.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("background", &self.background_running())
            .finish()
    }
}

impl Context {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let sockets = SocketSet::new(poll.registry())?;

        // Connection-lost callbacks run here, off the dispatch thread and off
        // the caller's stack.
        let (lost_tx, lost_rx) = unbounded::<LostNotice>();
        thread::Builder::new()
            .name("mqpoll-notify".to_string())
            .spawn(move || {
                for notice in lost_rx {
                    notice.handler.lock().connection_lost(&notice.cause);
                }
            })?;

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    sockets,
                    clients: AHashMap::new(),
                    by_socket: AHashMap::new(),
                    next_key: 0,
                }),
                poller: Mutex::new(Poller {
                    poll,
                    events: Events::with_capacity(EVENT_CAPACITY),
                }),
                waker,
                activity: Notify::new(),
                background: Mutex::new(None),
                lost_tx,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.shared.state.lock()
    }

    /// Interrupt a blocked poll.
    pub(crate) fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            log::debug!("Waker failed: {}", e);
        }
    }

    pub(crate) fn notify(&self) {
        self.shared.activity.notify();
    }

    /// One dispatch cycle, blocking up to `timeout` for socket readiness.
    pub fn cycle(&self, timeout: Duration) {
        let (ready, immediate) = {
            let mut state = self.lock();
            state.flush(Instant::now());
            (
                state.sockets.next_ready(),
                state.sockets.wants_immediate_poll(),
            )
        };

        let ready = match ready {
            Some(token) => Some(token),
            None => {
                let wait = if immediate { Duration::ZERO } else { timeout };
                let readiness = self.poll_events(wait);
                let mut state = self.lock();
                state.sockets.apply(&readiness);
                state.flush(Instant::now());
                state.sockets.next_ready()
            }
        };

        let mut fx = Effects::default();
        {
            let mut state = self.lock();
            let now = Instant::now();
            if let Some(token) = ready {
                state.service(token, now, &mut fx);
            }
            state.tick_all(now, &mut fx);
            fx.changed |= state.flush(now);
        }
        self.run_effects(fx);
    }

    fn poll_events(&self, wait: Duration) -> Vec<Readiness> {
        let Some(mut poller) = self.shared.poller.try_lock() else {
            // Another thread is polling and will service what arrives.
            self.shared.activity.wait(wait);
            return Vec::new();
        };
        let Poller { poll, events } = &mut *poller;
        if let Err(e) = poll.poll(events, Some(wait)) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::error!("Poll failed: {}", e);
            }
            return Vec::new();
        }
        events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(Readiness::from)
            .collect()
    }

    fn run_effects(&self, fx: Effects) {
        let changed = fx.changed
            || !fx.arrivals.is_empty()
            || !fx.deliveries.is_empty()
            || !fx.lost.is_empty();

        for (handler, token) in fx.deliveries {
            handler.lock().delivery_complete(token);
        }
        for (key, handler, message) in fx.arrivals {
            let consumed = handler.lock().message_arrived(&message);
            if !consumed {
                log::trace!("Message on {} not consumed, requeued", message.topic);
                if let Some(client) = self.lock().clients.get_mut(&key) {
                    client.session.queue.push_front(message);
                }
            }
        }
        for (handler, cause) in fx.lost {
            if self.shared.lost_tx.send(LostNotice { handler, cause }).is_err() {
                log::warn!("Connection-lost notifier has stopped");
            }
        }
        if changed {
            self.notify();
        }
    }

    pub(crate) fn background_running(&self) -> bool {
        self.shared.background.lock().is_some()
    }

    /// Start the dispatch thread if it is not running.
    pub(crate) fn start_background(&self) -> Result<()> {
        let mut background = self.shared.background.lock();
        if background.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = self.clone();
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("mqpoll-dispatch".to_string())
            .spawn(move || {
                log::debug!("Dispatch thread started");
                while !flag.load(Ordering::Acquire) {
                    ctx.cycle(WAIT_SLICE);
                }
                log::debug!("Dispatch thread stopped");
            })?;
        *background = Some(Background { stop, handle });
        Ok(())
    }

    /// Stop the dispatch thread once no client is connected or connecting.
    pub(crate) fn stop_background_if_idle(&self) {
        if self.lock().has_active_clients() {
            return;
        }
        let Some(background) = self.shared.background.lock().take() else {
            return;
        };
        background.stop.store(true, Ordering::Release);
        self.wake();
        // A callback on the dispatch thread may be the caller; it exits on
        // its own once the callback returns.
        if background.handle.thread().id() != thread::current().id()
            && background.handle.join().is_err()
        {
            log::error!("Dispatch thread panicked");
        }
    }

    /// Let the engine make progress for up to `slice`.
    pub(crate) fn yield_for(&self, slice: Duration) {
        if self.background_running() {
            self.shared.activity.wait(slice);
        } else {
            self.cycle(slice);
        }
    }

    /// Block until `signal` is posted or `deadline` passes.
    pub(crate) fn wait_signal<T>(&self, signal: &Signal<T>, deadline: Instant) -> Option<T> {
        loop {
            if let Some(value) = signal.try_take() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            if self.background_running() {
                if let Some(value) = signal.wait(slice) {
                    return Some(value);
                }
            } else {
                self.cycle(slice);
            }
        }
    }

    /// Block until `check` returns a value or `deadline` passes.
    pub(crate) fn wait_until<R>(
        &self,
        deadline: Option<Instant>,
        mut check: impl FnMut(&mut EngineState) -> Option<R>,
    ) -> Option<R> {
        loop {
            if let Some(result) = check(&mut self.lock()) {
                return Some(result);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            self.yield_for(slice);
        }
    }
}
