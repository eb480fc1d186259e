//! Error types for the packet codec.

use thiserror::Error;

/// MQTT protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Remaining length {0} exceeds the 268435455 byte limit")]
    PacketTooLarge(usize),

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid protocol name: {0}")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Invalid fixed header flags {flags:#04x} for packet type {packet_type}")]
    InvalidHeaderFlags { packet_type: u8, flags: u8 },

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("String of {0} bytes does not fit a 2-byte length prefix")]
    StringTooLong(usize),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
