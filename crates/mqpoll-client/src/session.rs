//! Per-client session state.
//!
//! Everything that survives between packets: the in-flight registries in
//! both directions, the queue of received messages, message id numbering,
//! keep-alive timestamps and the optional persistence store.

use std::time::{Duration, Instant};

use crate::callback::DeliveryToken;
use crate::config::ConnectOptions;
use crate::packet_id::PacketIdAllocator;
use crate::persistence::{self, PersistKey, Persistence, PersistenceError};
use crate::registry::{DeliveryQueue, MessageList};

pub struct Session {
    pub client_id: String,
    pub clean_session: bool,
    /// Zero disables keep-alive.
    pub keep_alive: Duration,
    pub retry_interval: Duration,
    pub max_inflight: usize,

    /// Our QoS 1/2 publishes awaiting acknowledgement, in send order.
    pub outbound: MessageList,
    /// Received QoS 2 publishes awaiting PUBREL.
    pub inbound: MessageList,
    /// Received messages not yet consumed.
    pub queue: DeliveryQueue,
    pub ids: PacketIdAllocator,

    pub last_sent: Instant,
    pub last_received: Instant,
    pub last_ping: Instant,
    pub ping_outstanding: bool,
    /// Last full retry/keep-alive pass.
    pub last_tick: Instant,

    /// Acknowledged publishes not yet reported to the handler.
    pub completed: Vec<DeliveryToken>,

    persistence: Option<Box<dyn Persistence>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.len())
            .field("queue", &self.queue.len())
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

impl Session {
    pub fn new(client_id: impl Into<String>, persistence: Option<Box<dyn Persistence>>) -> Self {
        let now = Instant::now();
        let defaults = ConnectOptions::default();
        Self {
            client_id: client_id.into(),
            clean_session: defaults.clean_session,
            keep_alive: Duration::from_secs(u64::from(defaults.keep_alive)),
            retry_interval: defaults.effective_retry_interval(),
            max_inflight: defaults.inflight_window(),
            outbound: MessageList::new(),
            inbound: MessageList::new(),
            queue: DeliveryQueue::new(),
            ids: PacketIdAllocator::new(),
            last_sent: now,
            last_received: now,
            last_ping: now,
            ping_outstanding: false,
            last_tick: now,
            completed: Vec::new(),
            persistence,
        }
    }

    /// Take the settings that apply to the next connection.
    pub fn configure(&mut self, options: &ConnectOptions) {
        self.clean_session = options.clean_session;
        self.keep_alive = Duration::from_secs(u64::from(options.keep_alive));
        self.retry_interval = options.effective_retry_interval();
        self.max_inflight = options.inflight_window();
    }

    /// Reset timers at the start of a connection.
    pub fn reset_timers(&mut self, now: Instant) {
        self.last_sent = now;
        self.last_received = now;
        self.last_ping = now;
        self.last_tick = now;
        self.ping_outstanding = false;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn open_store(&mut self, server_uri: &str) -> Result<(), PersistenceError> {
        match self.persistence.as_mut() {
            Some(store) => store.open(&self.client_id, server_uri),
            None => Ok(()),
        }
    }

    pub fn close_store(&mut self) {
        if let Some(store) = self.persistence.as_mut() {
            if let Err(e) = store.close() {
                log::warn!("Closing store for {} failed: {}", self.client_id, e);
            }
        }
    }

    /// Reload in-flight state left by an earlier run.
    pub fn restore(&mut self, now: Instant) -> Result<(), PersistenceError> {
        let Some(store) = self.persistence.as_mut() else {
            return Ok(());
        };
        let restored = persistence::restore(store.as_mut(), &mut self.outbound, &mut self.inbound, now)?;
        if restored.highest_msg_id > self.ids.last() {
            self.ids.resume_after(restored.highest_msg_id);
        }
        if restored.outbound + restored.inbound > 0 {
            log::info!(
                "Client {} restored {} outbound and {} inbound messages",
                self.client_id,
                restored.outbound,
                restored.inbound
            );
        }
        Ok(())
    }

    /// Store a packet. Failure is returned to the caller.
    pub fn persist(&mut self, key: PersistKey, buffers: &[&[u8]]) -> Result<(), PersistenceError> {
        match self.persistence.as_mut() {
            Some(store) => store.put(key, buffers),
            None => Ok(()),
        }
    }

    /// Store a packet, logging failure. Used where the exchange must go on
    /// regardless.
    pub fn persist_or_warn(&mut self, key: PersistKey, buffers: &[&[u8]]) {
        if let Err(e) = self.persist(key, buffers) {
            log::warn!("Persisting {} for {} failed: {}", key, self.client_id, e);
        }
    }

    pub fn unpersist(&mut self, key: PersistKey) {
        if let Some(store) = self.persistence.as_mut() {
            if let Err(e) = store.remove(key) {
                log::warn!("Removing {} for {} failed: {}", key, self.client_id, e);
            }
        }
    }

    /// Drop all session state: stored packets, both registries, the
    /// delivery queue and message id numbering.
    pub fn clean(&mut self) {
        if let Some(store) = self.persistence.as_mut() {
            if let Err(e) = store.clear() {
                log::warn!("Clearing store for {} failed: {}", self.client_id, e);
            }
        }
        self.outbound.clear();
        self.inbound.clear();
        self.queue.clear();
        self.completed.clear();
        self.ids.reset();
        log::debug!("Cleaned session state for {}", self.client_id);
    }

    /// Allocate an id for SUBSCRIBE/UNSUBSCRIBE or a QoS > 0 PUBLISH.
    pub fn next_msg_id(&mut self) -> Option<u16> {
        let outbound = &self.outbound;
        self.ids.allocate(|id| outbound.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use mqpoll_core::QoS;

    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::registry::{Message, Publication};

    #[test]
    fn test_configure() {
        let mut session = Session::new("c1", None);
        session.configure(
            &ConnectOptions::new()
                .keep_alive(5)
                .reliable(false)
                .clean_session(false),
        );
        assert_eq!(session.keep_alive, Duration::from_secs(5));
        assert_eq!(session.max_inflight, 10);
        assert!(!session.clean_session);
    }

    #[test]
    fn test_ids_skip_outbound() {
        let mut session = Session::new("c1", None);
        let publication = Publication::new("t", Bytes::new());
        session.outbound.push(Message::outbound(
            1,
            QoS::AtLeastOnce,
            false,
            publication,
            Instant::now(),
        ));
        assert_eq!(session.next_msg_id(), Some(2));
    }

    #[test]
    fn test_clean_clears_store() {
        let mut store = MemoryPersistence::new();
        store.open("c1", "tcp://localhost:1883").unwrap();
        let mut session = Session::new("c1", Some(Box::new(store)));
        session.persist(PersistKey::sent(3), &[b"x"]).unwrap();
        session.next_msg_id();
        session.queue.push_back(crate::registry::DeliveredMessage {
            topic: "t".into(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retained: false,
            dup: false,
            msg_id: 0,
        });

        session.clean();
        assert!(session.queue.is_empty());
        assert_eq!(session.ids.last(), 0);
        assert!(session.persistence.as_ref().unwrap().keys().unwrap().is_empty());
    }
}
