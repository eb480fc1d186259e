//! Per-connection message registry.
//!
//! Tracks in-flight QoS 1/2 exchanges in both directions and the queue of
//! received messages the application has not consumed yet.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use mqpoll_core::{Publish, QoS};

#[derive(Debug)]
struct PublicationInner {
    topic: String,
    payload: Bytes,
}

/// Immutable topic and payload shared between an in-flight [`Message`] and
/// any pending socket write carrying it. Freed when the last holder drops.
#[derive(Debug, Clone)]
pub struct Publication(Arc<PublicationInner>);

impl Publication {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self(Arc::new(PublicationInner {
            topic: topic.into(),
            payload: payload.into(),
        }))
    }

    pub fn topic(&self) -> &str {
        &self.0.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.0.payload
    }

    /// Number of live holders of this publication.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Packet a [`Message`] is waiting for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Outbound QoS 1.
    Puback,
    /// Outbound QoS 2, PUBLISH sent.
    Pubrec,
    /// Outbound QoS 2, PUBREL sent.
    Pubcomp,
    /// Inbound QoS 2, PUBREC sent.
    Pubrel,
}

/// An in-flight QoS 1 or 2 exchange.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_id: u16,
    pub qos: QoS,
    pub retain: bool,
    pub publication: Publication,
    pub next_expected: Expect,
    /// Last time a packet for this exchange crossed the wire.
    pub last_touch: Instant,
}

impl Message {
    /// Outbound message as first sent.
    pub fn outbound(msg_id: u16, qos: QoS, retain: bool, publication: Publication, now: Instant) -> Self {
        let next_expected = match qos {
            QoS::ExactlyOnce => Expect::Pubrec,
            _ => Expect::Puback,
        };
        Self {
            msg_id,
            qos,
            retain,
            publication,
            next_expected,
            last_touch: now,
        }
    }

    /// PUBLISH packet for this message.
    pub fn to_publish(&self, dup: bool) -> Publish {
        Publish {
            dup,
            qos: self.qos,
            retain: self.retain,
            topic: self.publication.topic().to_string(),
            packet_id: Some(self.msg_id),
            payload: self.publication.payload().clone(),
        }
    }
}

/// Ordered collection of in-flight messages keyed by message id.
///
/// Insertion order is send order, which is also the order retries go out in.
#[derive(Debug, Default)]
pub struct MessageList {
    items: VecDeque<Message>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, msg_id: u16) -> bool {
        self.items.iter().any(|m| m.msg_id == msg_id)
    }

    pub fn get(&self, msg_id: u16) -> Option<&Message> {
        self.items.iter().find(|m| m.msg_id == msg_id)
    }

    pub fn get_mut(&mut self, msg_id: u16) -> Option<&mut Message> {
        self.items.iter_mut().find(|m| m.msg_id == msg_id)
    }

    pub fn push(&mut self, message: Message) {
        self.items.push_back(message);
    }

    /// Insert `message`, dropping any earlier entry with the same id.
    ///
    /// Returns the entry that was replaced.
    pub fn replace(&mut self, message: Message) -> Option<Message> {
        let previous = self.remove(message.msg_id);
        self.items.push_back(message);
        previous
    }

    pub fn remove(&mut self, msg_id: u16) -> Option<Message> {
        let pos = self.items.iter().position(|m| m.msg_id == msg_id)?;
        self.items.remove(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.items.iter_mut()
    }

    pub fn ids(&self) -> Vec<u16> {
        self.items.iter().map(|m| m.msg_id).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// A received message waiting to be handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub dup: bool,
    /// 0 for QoS 0.
    pub msg_id: u16,
}

impl DeliveredMessage {
    pub fn from_publish(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retained: publish.retain,
            dup: publish.dup,
            msg_id: publish.packet_id.unwrap_or(0),
        }
    }

    /// Build from an inbound QoS 2 record once PUBREL has released it.
    pub fn from_message(message: &Message) -> Self {
        Self {
            topic: message.publication.topic().to_string(),
            payload: message.publication.payload().clone(),
            qos: message.qos,
            retained: message.retain,
            dup: false,
            msg_id: message.msg_id,
        }
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Received messages not yet consumed, oldest first.
pub type DeliveryQueue = VecDeque<DeliveredMessage>;
