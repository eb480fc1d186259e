//! QoS delivery engine.
//!
//! Handlers for the publish/acknowledge flows in both directions, plus the
//! periodic retry and keep-alive pass. They work on a [`Session`] and send
//! through a [`Wire`], and take the current time as an argument so the
//! timing rules can be exercised without sleeping.
//!
//! Outbound QoS 1: PUBLISH → PUBACK.
//! Outbound QoS 2: PUBLISH → PUBREC, PUBREL → PUBCOMP.
//! Inbound QoS 2: PUBLISH → PUBREC, PUBREL → PUBCOMP; the message is
//! released to the application on PUBREL.

use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mqpoll_core::{encode_ack, encode_header_only, encode_publish_header, to_bytes, Packet, PacketType, Publish, QoS};

use crate::callback::DeliveryToken;
use crate::error::{ClientError, Result};
use crate::persistence::PersistKey;
use crate::registry::{DeliveredMessage, Expect, Message, Publication};
use crate::session::Session;
use crate::socket::WriteStatus;

/// Minimum spacing of full retry/keep-alive passes.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Where a session's packets go.
pub trait Wire {
    /// Send `bufs` as one logical write. `hold` keeps a QoS 0 publication
    /// alive if the write cannot finish immediately.
    fn send(&mut self, bufs: Vec<Bytes>, hold: Option<Publication>) -> io::Result<WriteStatus>;

    /// True while an earlier write is still unfinished.
    fn write_pending(&self) -> bool;
}

/// Result of the keep-alive check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// No PINGRESP within a keep-alive interval of the PINGREQ.
    Dead,
}

fn send(session: &mut Session, wire: &mut impl Wire, bufs: Vec<Bytes>, hold: Option<Publication>, now: Instant) -> Result<()> {
    if wire.send(bufs, hold)? == WriteStatus::Complete {
        session.last_sent = now;
    }
    Ok(())
}

fn ack_bytes(packet_type: PacketType, msg_id: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    encode_ack(packet_type, msg_id, &mut buf);
    buf.freeze()
}

fn send_ack(session: &mut Session, wire: &mut impl Wire, packet_type: PacketType, msg_id: u16, now: Instant) -> Result<()> {
    log::trace!("{} sending {:?} {}", session.client_id, packet_type, msg_id);
    send(session, wire, vec![ack_bytes(packet_type, msg_id)], None, now)
}

/// Send a packet that carries no publication.
pub fn send_packet(session: &mut Session, wire: &mut impl Wire, packet: &Packet, now: Instant) -> Result<()> {
    log::trace!("{} sending {:?}", session.client_id, packet.packet_type());
    send(session, wire, vec![to_bytes(packet)?], None, now)
}

/// Publish a message.
///
/// QoS 1/2 messages are recorded in the outbound registry (and the store)
/// before the first byte is written and the message id is returned as the
/// delivery token.
pub fn start_publish(
    session: &mut Session,
    wire: &mut impl Wire,
    topic: &str,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    now: Instant,
) -> Result<Option<DeliveryToken>> {
    let publication = Publication::new(topic, payload);

    if qos == QoS::AtMostOnce {
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id: None,
            payload: publication.payload().clone(),
        };
        let header = encode_publish_header(&publish)?;
        let bufs = vec![header, publish.payload];
        send(session, wire, bufs, Some(publication), now)?;
        return Ok(None);
    }

    if session.outbound.len() >= session.max_inflight {
        return Err(ClientError::MaxMessagesInflight);
    }
    let msg_id = session.next_msg_id().ok_or(ClientError::NoMessageId)?;
    let message = Message::outbound(msg_id, qos, retain, publication, now);
    let publish = message.to_publish(false);
    let header = encode_publish_header(&publish)?;
    session.persist(PersistKey::sent(msg_id), &[&header, &publish.payload])?;
    session.outbound.push(message);

    log::trace!("{} sending PUBLISH {} ({:?}) to {}", session.client_id, msg_id, qos, topic);
    send(session, wire, vec![header, publish.payload], None, now)?;
    Ok(Some(msg_id))
}

/// Inbound PUBLISH.
pub fn handle_publish(session: &mut Session, wire: &mut impl Wire, publish: Publish, now: Instant) -> Result<()> {
    match publish.qos {
        QoS::AtMostOnce => {
            session.queue.push_back(DeliveredMessage::from_publish(publish));
        }
        QoS::AtLeastOnce => {
            let msg_id = require_id(&publish)?;
            send_ack(session, wire, PacketType::Puback, msg_id, now)?;
            session.queue.push_back(DeliveredMessage::from_publish(publish));
        }
        QoS::ExactlyOnce => {
            let msg_id = require_id(&publish)?;
            let stored = to_bytes(&Packet::Publish(publish.clone()))?;
            session.persist_or_warn(PersistKey::received(msg_id), &[&stored]);
            let message = Message {
                msg_id,
                qos: publish.qos,
                retain: publish.retain,
                publication: Publication::new(publish.topic, publish.payload),
                next_expected: Expect::Pubrel,
                last_touch: now,
            };
            if session.inbound.replace(message).is_some() {
                log::debug!("{} replaced inbound message {}", session.client_id, msg_id);
            }
            send_ack(session, wire, PacketType::Pubrec, msg_id, now)?;
        }
    }
    Ok(())
}

fn require_id(publish: &Publish) -> Result<u16> {
    publish.packet_id.ok_or_else(|| {
        ClientError::Protocol(mqpoll_core::ProtocolError::MalformedPacket(
            "PUBLISH with QoS > 0 has no packet identifier".into(),
        ))
    })
}

/// PUBACK ends an outbound QoS 1 exchange.
pub fn handle_puback(session: &mut Session, msg_id: u16) {
    match session.outbound.get(msg_id).map(|m| m.next_expected) {
        Some(Expect::Puback) => {
            session.outbound.remove(msg_id);
            session.unpersist(PersistKey::sent(msg_id));
            session.completed.push(msg_id);
            log::trace!("{} delivery of {} complete", session.client_id, msg_id);
        }
        Some(other) => {
            log::warn!("{} got PUBACK {} while expecting {:?}", session.client_id, msg_id, other);
        }
        None => log::warn!("{} got PUBACK for unknown message {}", session.client_id, msg_id),
    }
}

/// PUBREC moves an outbound QoS 2 exchange to its second half.
///
/// Only a message still waiting for PUBREC advances; a repeated PUBREC is
/// ignored.
pub fn handle_pubrec(session: &mut Session, wire: &mut impl Wire, msg_id: u16, now: Instant) -> Result<()> {
    let Some(message) = session.outbound.get_mut(msg_id) else {
        log::warn!("{} got PUBREC for unknown message {}", session.client_id, msg_id);
        return Ok(());
    };
    if message.next_expected != Expect::Pubrec {
        log::debug!("{} ignoring duplicate PUBREC {}", session.client_id, msg_id);
        return Ok(());
    }
    message.next_expected = Expect::Pubcomp;
    message.last_touch = now;

    let pubrel = ack_bytes(PacketType::Pubrel, msg_id);
    session.persist_or_warn(PersistKey::pubrel(msg_id), &[&pubrel]);
    log::trace!("{} sending PUBREL {}", session.client_id, msg_id);
    send(session, wire, vec![pubrel], None, now)
}

/// PUBREL releases an inbound QoS 2 message to the application.
///
/// PUBCOMP goes out even when no record exists, so a PUBREL repeated after
/// the message was released is still answered.
pub fn handle_pubrel(session: &mut Session, wire: &mut impl Wire, msg_id: u16, now: Instant) -> Result<()> {
    match session.inbound.remove(msg_id) {
        Some(message) => {
            session.queue.push_back(DeliveredMessage::from_message(&message));
            session.unpersist(PersistKey::received(msg_id));
        }
        None => log::debug!("{} got PUBREL for unknown message {}", session.client_id, msg_id),
    }
    send_ack(session, wire, PacketType::Pubcomp, msg_id, now)
}

/// PUBCOMP ends an outbound QoS 2 exchange.
pub fn handle_pubcomp(session: &mut Session, msg_id: u16) {
    match session.outbound.get(msg_id).map(|m| m.next_expected) {
        Some(Expect::Pubcomp) => {
            session.outbound.remove(msg_id);
            session.unpersist(PersistKey::sent(msg_id));
            session.unpersist(PersistKey::pubrel(msg_id));
            session.completed.push(msg_id);
            log::trace!("{} delivery of {} complete", session.client_id, msg_id);
        }
        Some(other) => {
            log::warn!("{} got PUBCOMP {} while expecting {:?}", session.client_id, msg_id, other);
        }
        None => log::warn!("{} got PUBCOMP for unknown message {}", session.client_id, msg_id),
    }
}

pub fn handle_pingresp(session: &mut Session) {
    session.ping_outstanding = false;
}

/// Resend outbound packets older than the retry interval, or all of them
/// when `force` is set (after reconnecting to an existing session).
///
/// Stops as soon as a write is left unfinished.
pub fn retry(session: &mut Session, wire: &mut impl Wire, now: Instant, force: bool) -> Result<()> {
    let interval = session.retry_interval;
    let due: Vec<u16> = session
        .outbound
        .iter()
        .filter(|m| force || now.saturating_duration_since(m.last_touch) > interval)
        .map(|m| m.msg_id)
        .collect();

    for msg_id in due {
        if wire.write_pending() {
            break;
        }
        let Some(message) = session.outbound.get_mut(msg_id) else {
            continue;
        };
        message.last_touch = now;
        let bufs = match message.next_expected {
            Expect::Puback | Expect::Pubrec => {
                let publish = message.to_publish(true);
                let header = encode_publish_header(&publish)?;
                log::debug!("{} retrying PUBLISH {}", session.client_id, msg_id);
                vec![header, publish.payload]
            }
            Expect::Pubcomp => {
                log::debug!("{} retrying PUBREL {}", session.client_id, msg_id);
                vec![ack_bytes(PacketType::Pubrel, msg_id)]
            }
            Expect::Pubrel => continue,
        };
        send(session, wire, bufs, None, now)?;
    }
    Ok(())
}

/// Send PINGREQ when the link has been quiet for a keep-alive interval.
pub fn keepalive(session: &mut Session, wire: &mut impl Wire, now: Instant) -> Result<Liveness> {
    let interval = session.keep_alive;
    if interval.is_zero() {
        return Ok(Liveness::Alive);
    }
    let quiet = now.saturating_duration_since(session.last_sent) >= interval
        || now.saturating_duration_since(session.last_received) >= interval;
    if !quiet {
        return Ok(Liveness::Alive);
    }

    if session.ping_outstanding {
        if now.saturating_duration_since(session.last_ping) >= interval {
            log::warn!("{}: PINGRESP not received in keepalive interval", session.client_id);
            return Ok(Liveness::Dead);
        }
    } else if !wire.write_pending() {
        let mut buf = BytesMut::with_capacity(2);
        encode_header_only(PacketType::Pingreq, &mut buf);
        send(session, wire, vec![buf.freeze()], None, now)?;
        session.ping_outstanding = true;
        session.last_ping = now;
        log::trace!("{} sent PINGREQ", session.client_id);
    }
    Ok(Liveness::Alive)
}

/// Periodic pass: retries then keep-alive, at most once per
/// [`TICK_INTERVAL`].
pub fn tick(session: &mut Session, wire: &mut impl Wire, now: Instant) -> Result<Liveness> {
    if now.saturating_duration_since(session.last_tick) < TICK_INTERVAL {
        return Ok(Liveness::Alive);
    }
    session.last_tick = now;
    retry(session, wire, now, false)?;
    keepalive(session, wire, now)
}
