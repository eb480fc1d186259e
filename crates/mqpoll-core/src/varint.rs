//! Remaining-length encoding.
//!
//! The fixed header carries the number of bytes that follow it as a base-128
//! integer: seven data bits per byte, least significant group first, with the
//! high bit set on every byte except the last. At most four bytes are allowed:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};

/// Largest value the four-byte encoding can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of bytes in an encoded remaining length.
pub const MAX_LEN_BYTES: usize = 4;

/// Decode a remaining length from the start of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` if successful, `Ok(None)` if
/// more data is needed, or `Err` once a fourth byte still announces a
/// continuation.
///
/// # Example
/// ```
/// use mqpoll_core::varint::decode;
/// let buf = [0x80, 0x01]; // Encodes 128
/// let (value, consumed) = decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().take(MAX_LEN_BYTES).enumerate() {
        value += ((byte & 0x7F) as usize) * multiplier;

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        if i + 1 == MAX_LEN_BYTES {
            return Err(ProtocolError::InvalidRemainingLength);
        }

        multiplier *= 128;
    }

    Ok(None)
}

/// Encode `value`, appending to `buf`.
///
/// Returns the number of bytes written.
///
/// # Example
/// ```
/// use bytes::BytesMut;
/// use mqpoll_core::varint::encode;
/// let mut buf = BytesMut::new();
/// let written = encode(300, &mut buf).unwrap();
/// assert_eq!(written, 2);
/// assert_eq!(&buf[..], &[0xAC, 0x02]);
/// ```
pub fn encode(mut value: usize, buf: &mut BytesMut) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge(value));
    }

    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
    Ok(buf.len() - start)
}

/// Number of bytes needed to encode `value`.
///
/// # Example
/// ```
/// use mqpoll_core::varint::encoded_len;
/// assert_eq!(encoded_len(0), 1);
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// assert_eq!(encoded_len(16384), 3);
/// ```
pub fn encoded_len(mut value: usize) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_byte() {
        assert_eq!(decode(&[0]).unwrap(), Some((0, 1)));
        assert_eq!(decode(&[0x7F]).unwrap(), Some((127, 1)));
    }

    #[test]
    fn test_decode_boundaries() {
        assert_eq!(decode(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(decode(&[0xFF, 0x7F]).unwrap(), Some((16383, 2)));
        assert_eq!(decode(&[0x80, 0x80, 0x01]).unwrap(), Some((16384, 3)));
        assert_eq!(decode(&[0xFF, 0xFF, 0x7F]).unwrap(), Some((2097151, 3)));
        assert_eq!(
            decode(&[0x80, 0x80, 0x80, 0x01]).unwrap(),
            Some((2097152, 4))
        );
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((MAX_REMAINING_LENGTH, 4))
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode(&[0x05, 0xFF, 0xFF]).unwrap(), Some((5, 1)));
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0x80, 0x80]).unwrap(), None);
        assert_eq!(decode(&[0xFF, 0xFF, 0xFF]).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_fourth_continuation() {
        // Must fail on four bytes alone, not wait for a fifth.
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::InvalidRemainingLength)
        );
        assert!(decode(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_encode() {
        let mut buf = BytesMut::new();
        assert_eq!(encode(0, &mut buf).unwrap(), 1);
        assert_eq!(&buf[..], &[0]);

        buf.clear();
        assert_eq!(encode(127, &mut buf).unwrap(), 1);
        assert_eq!(&buf[..], &[0x7F]);

        buf.clear();
        assert_eq!(encode(16384, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..], &[0x80, 0x80, 0x01]);

        buf.clear();
        assert_eq!(encode(MAX_REMAINING_LENGTH, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..], &[0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn test_encode_too_large() {
        let mut buf = BytesMut::new();
        assert!(encode(MAX_REMAINING_LENGTH + 1, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(127), 1);
        assert_eq!(encoded_len(128), 2);
        assert_eq!(encoded_len(16383), 2);
        assert_eq!(encoded_len(16384), 3);
        assert_eq!(encoded_len(2097151), 3);
        assert_eq!(encoded_len(2097152), 4);
        assert_eq!(encoded_len(MAX_REMAINING_LENGTH), 4);
    }
}
