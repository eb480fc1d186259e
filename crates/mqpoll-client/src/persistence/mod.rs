//! Persistence of in-flight QoS 1/2 state.
//!
//! The client writes each QoS > 0 packet it sends (and each QoS 2 PUBLISH
//! it receives) under a key derived from the packet kind and message id,
//! and removes the key once the exchange completes. After a crash,
//! [`restore`] rebuilds the outbound and inbound registries from whatever
//! is left. Without a store the protocol behaves identically; only
//! durability is lost.
//!
//! Keys:
//! - `s-<id>`: a PUBLISH we sent, awaiting PUBACK or PUBREC
//! - `sc-<id>`: a PUBREL we sent, awaiting PUBCOMP
//! - `r-<id>`: a QoS 2 PUBLISH we received, awaiting PUBREL

#[cfg(feature = "persistence")]
mod disk;
mod memory;

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use mqpoll_core::{decode_packet, Packet, QoS};
use thiserror::Error;

use crate::registry::{Expect, Message, MessageList, Publication};

#[cfg(feature = "persistence")]
pub use disk::FjallPersistence;
pub use memory::MemoryPersistence;

/// Persistence error.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to open store: {0}")]
    Open(String),
    #[error("store is not open")]
    NotOpen,
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("sync failed: {0}")]
    Sync(String),
    #[error("invalid key {0:?}")]
    InvalidKey(String),
}

/// Kind of packet stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyKind {
    PublishSent,
    PubrelSent,
    PublishReceived,
}

impl KeyKind {
    fn prefix(self) -> &'static str {
        match self {
            KeyKind::PublishSent => "s-",
            KeyKind::PubrelSent => "sc-",
            KeyKind::PublishReceived => "r-",
        }
    }
}

/// Store key: packet kind plus message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersistKey {
    pub kind: KeyKind,
    pub msg_id: u16,
}

impl PersistKey {
    pub fn sent(msg_id: u16) -> Self {
        Self {
            kind: KeyKind::PublishSent,
            msg_id,
        }
    }

    pub fn pubrel(msg_id: u16) -> Self {
        Self {
            kind: KeyKind::PubrelSent,
            msg_id,
        }
    }

    pub fn received(msg_id: u16) -> Self {
        Self {
            kind: KeyKind::PublishReceived,
            msg_id,
        }
    }
}

impl fmt::Display for PersistKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.msg_id)
    }
}

impl FromStr for PersistKey {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "sc-" must be tried before "s-" would match it.
        let (kind, id) = if let Some(id) = s.strip_prefix("sc-") {
            (KeyKind::PubrelSent, id)
        } else if let Some(id) = s.strip_prefix("s-") {
            (KeyKind::PublishSent, id)
        } else if let Some(id) = s.strip_prefix("r-") {
            (KeyKind::PublishReceived, id)
        } else {
            return Err(PersistenceError::InvalidKey(s.to_string()));
        };
        let msg_id = id
            .parse()
            .map_err(|_| PersistenceError::InvalidKey(s.to_string()))?;
        Ok(Self { kind, msg_id })
    }
}

/// Storage collaborator for in-flight packets.
///
/// One store serves one client; `open` tells it which one.
pub trait Persistence: Send {
    fn open(&mut self, client_id: &str, server_uri: &str) -> Result<(), PersistenceError>;

    fn close(&mut self) -> Result<(), PersistenceError>;

    /// Store the concatenation of `buffers` under `key`.
    fn put(&mut self, key: PersistKey, buffers: &[&[u8]]) -> Result<(), PersistenceError>;

    fn get(&self, key: PersistKey) -> Result<Option<Vec<u8>>, PersistenceError>;

    fn remove(&mut self, key: PersistKey) -> Result<(), PersistenceError>;

    fn keys(&self) -> Result<Vec<PersistKey>, PersistenceError>;

    /// Remove every key of this client.
    fn clear(&mut self) -> Result<(), PersistenceError>;

    fn contains_key(&self, key: PersistKey) -> Result<bool, PersistenceError> {
        Ok(self.get(key)?.is_some())
    }
}

/// What [`restore`] put back.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Restored {
    pub outbound: usize,
    pub inbound: usize,
    /// Highest message id seen, so numbering continues after it.
    pub highest_msg_id: u16,
}

/// Rebuild in-flight state from `store`.
///
/// Entries that fail to decode are logged and removed.
pub fn restore(
    store: &mut dyn Persistence,
    outbound: &mut MessageList,
    inbound: &mut MessageList,
    now: Instant,
) -> Result<Restored, PersistenceError> {
    let mut keys = store.keys()?;
    // Publishes before the PUBRELs that refer to them, in id order.
    keys.sort();

    let mut restored = Restored::default();
    for key in keys {
        let Some(value) = store.get(key)? else {
            continue;
        };
        let packet = match decode_packet(&value) {
            Ok(Some((packet, _))) => packet,
            Ok(None) | Err(_) => {
                log::warn!("Discarding unreadable persisted entry {}", key);
                store.remove(key)?;
                continue;
            }
        };

        match (key.kind, packet) {
            (KeyKind::PublishSent, Packet::Publish(publish)) if publish.qos != QoS::AtMostOnce => {
                let publication = Publication::new(publish.topic, publish.payload);
                outbound.replace(Message::outbound(
                    key.msg_id,
                    publish.qos,
                    publish.retain,
                    publication,
                    now,
                ));
                restored.outbound += 1;
            }
            (KeyKind::PubrelSent, Packet::Pubrel { .. }) => match outbound.get_mut(key.msg_id) {
                Some(message) => message.next_expected = Expect::Pubcomp,
                None => {
                    log::warn!("Persisted PUBREL {} has no matching PUBLISH", key.msg_id);
                    store.remove(key)?;
                    continue;
                }
            },
            (KeyKind::PublishReceived, Packet::Publish(publish)) => {
                let publication = Publication::new(publish.topic, publish.payload);
                inbound.replace(Message {
                    msg_id: key.msg_id,
                    qos: publish.qos,
                    retain: publish.retain,
                    publication,
                    next_expected: Expect::Pubrel,
                    last_touch: now,
                });
                restored.inbound += 1;
            }
            (kind, packet) => {
                log::warn!(
                    "Persisted entry {} holds unexpected {:?} ({:?})",
                    key,
                    packet.packet_type(),
                    kind
                );
                store.remove(key)?;
                continue;
            }
        }
        restored.highest_msg_id = restored.highest_msg_id.max(key.msg_id);
    }

    log::debug!(
        "Restored {} outbound and {} inbound messages",
        restored.outbound,
        restored.inbound
    );
    Ok(restored)
}
