//! Resumable frame assembly.
//!
//! A packet may arrive split across any number of socket reads. The
//! assembler remembers how far it got (header byte, remaining-length bytes,
//! body) so the next attempt resumes instead of starting over.

use bytes::Bytes;
use mqpoll_core::varint;

use super::SocketError;

/// One complete packet off the wire: the fixed header byte and the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: u8,
    pub body: Bytes,
}

/// Byte-level reads the assembler needs from a socket.
pub trait ByteSource {
    /// Next byte, or `None` if nothing is available right now.
    fn read_byte(&mut self) -> Result<Option<u8>, SocketError>;

    /// Exactly `n` bytes, or `None` if fewer are available yet. Bytes already
    /// collected are kept for the next call.
    fn read_exact(&mut self, n: usize) -> Result<Option<Bytes>, SocketError>;
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Header,
    Length {
        header: u8,
        bytes: [u8; varint::MAX_LEN_BYTES],
        count: usize,
    },
    Body {
        header: u8,
        len: usize,
    },
}

#[derive(Debug, Default)]
pub struct FrameAssembler {
    stage: Stage,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between frames.
    pub fn is_idle(&self) -> bool {
        matches!(self.stage, Stage::Header)
    }

    pub fn reset(&mut self) {
        self.stage = Stage::Header;
    }

    /// Advance as far as the available bytes allow.
    pub fn poll(&mut self, src: &mut impl ByteSource) -> Result<Option<Frame>, SocketError> {
        loop {
            match &mut self.stage {
                Stage::Header => {
                    let Some(header) = src.read_byte()? else {
                        return Ok(None);
                    };
                    self.stage = Stage::Length {
                        header,
                        bytes: [0; varint::MAX_LEN_BYTES],
                        count: 0,
                    };
                }
                Stage::Length {
                    header,
                    bytes,
                    count,
                } => {
                    let Some(byte) = src.read_byte()? else {
                        return Ok(None);
                    };
                    bytes[*count] = byte;
                    *count += 1;
                    match varint::decode(&bytes[..*count]) {
                        Ok(Some((len, _))) => {
                            self.stage = Stage::Body {
                                header: *header,
                                len,
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.reset();
                            return Err(SocketError::Protocol(e));
                        }
                    }
                }
                Stage::Body { header, len } => {
                    let header = *header;
                    let body = if *len == 0 {
                        Bytes::new()
                    } else {
                        match src.read_exact(*len)? {
                            Some(body) => body,
                            None => return Ok(None),
                        }
                    };
                    self.reset();
                    return Ok(Some(Frame { header, body }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::BytesMut;
    use mqpoll_core::{to_bytes, Packet, ProtocolError, Publish, QoS};

    use super::*;

    /// Byte source fed in chunks, one chunk per `feed`.
    #[derive(Default)]
    struct Chunks {
        available: VecDeque<u8>,
        partial: BytesMut,
    }

    impl Chunks {
        fn feed(&mut self, bytes: &[u8]) {
            self.available.extend(bytes);
        }
    }

    impl ByteSource for Chunks {
        fn read_byte(&mut self) -> Result<Option<u8>, SocketError> {
            Ok(self.available.pop_front())
        }

        fn read_exact(&mut self, n: usize) -> Result<Option<Bytes>, SocketError> {
            while self.partial.len() < n {
                match self.available.pop_front() {
                    Some(b) => self.partial.extend_from_slice(&[b]),
                    None => return Ok(None),
                }
            }
            Ok(Some(self.partial.split_to(n).freeze()))
        }
    }

    fn publish_bytes(payload_len: usize) -> Bytes {
        to_bytes(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "a/b".into(),
            packet_id: Some(1),
            payload: Bytes::from(vec![7u8; payload_len]),
        }))
        .unwrap()
    }

    #[test]
    fn test_assemble_byte_by_byte() {
        let wire = publish_bytes(300);
        let mut src = Chunks::default();
        let mut assembler = FrameAssembler::new();

        for (i, byte) in wire.iter().enumerate() {
            assert!(assembler.poll(&mut src).unwrap().is_none());
            src.feed(&[*byte]);
            if i + 1 < wire.len() {
                assert!(assembler.poll(&mut src).unwrap().is_none());
            }
        }
        let frame = assembler.poll(&mut src).unwrap().unwrap();
        assert_eq!(frame.header, 0x32);
        assert_eq!(frame.body.len(), wire.len() - 3);
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_two_frames_one_read() {
        let mut src = Chunks::default();
        src.feed(&to_bytes(&Packet::Pingresp).unwrap());
        src.feed(&to_bytes(&Packet::Puback { packet_id: 9 }).unwrap());

        let mut assembler = FrameAssembler::new();
        let first = assembler.poll(&mut src).unwrap().unwrap();
        assert_eq!(first, Frame { header: 0xD0, body: Bytes::new() });
        let second = assembler.poll(&mut src).unwrap().unwrap();
        assert_eq!(second.header, 0x40);
        assert_eq!(&second.body[..], &[0, 9]);
        assert!(assembler.poll(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_rejects_overlong_length() {
        let mut src = Chunks::default();
        src.feed(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        let mut assembler = FrameAssembler::new();
        assert!(matches!(
            assembler.poll(&mut src),
            Err(SocketError::Protocol(ProtocolError::InvalidRemainingLength))
        ));
        // Fails on the fourth length byte without reading further.
        assert_eq!(src.available, VecDeque::from(vec![0x01]));
    }
}
