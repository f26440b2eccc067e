//! Post-decryption wire format, §6 EXTERNAL INTERFACES.
//!
//! Byte 0 of a decrypted datagram is `0x00` for "core" packets (this
//! module) or a game-level packet type dispatched through `add_packet`.
//! All multi-byte fields are little-endian, matching the original
//! protocol's on-wire byte order.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::PacketError;

/// Maximum payload bytes the core will ever try to pack into one datagram.
/// Leaves headroom under a conservative 512-byte MTU assumption for IP/UDP
/// overhead and cipher padding.
pub const MAX_DATAGRAM_PAYLOAD: usize = 510;

pub const CORE_PACKET_MARKER: u8 = 0x00;

/// Core subtypes, byte 1 of a `0x00`-prefixed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreSubtype {
    KeyResponse = 0x01,
    ReliableData = 0x02,
    Ack = 0x03,
    SyncRequest = 0x05,
    SyncResponse = 0x06,
    Disconnect = 0x07,
    SmallChunk = 0x08,
    SmallChunkEnd = 0x09,
    SizedData = 0x0A,
    CancelSized = 0x0B,
    CancelSizedAck = 0x0C,
    Grouped = 0x0E,
    BandwidthFeedback0 = 0x10,
    BandwidthFeedback1 = 0x11,
    BandwidthFeedback2 = 0x12,
}

impl CoreSubtype {
    pub fn from_byte(b: u8) -> Result<Self, PacketError> {
        use CoreSubtype::*;
        Ok(match b {
            0x01 => KeyResponse,
            0x02 => ReliableData,
            0x03 => Ack,
            0x05 => SyncRequest,
            0x06 => SyncResponse,
            0x07 => Disconnect,
            0x08 => SmallChunk,
            0x09 => SmallChunkEnd,
            0x0A => SizedData,
            0x0B => CancelSized,
            0x0C => CancelSizedAck,
            0x0E => Grouped,
            0x10 => BandwidthFeedback0,
            0x11 => BandwidthFeedback1,
            0x12 => BandwidthFeedback2,
            other => return Err(PacketError::UnknownCoreSubtype(other)),
        })
    }
}

/// A payload byte 0 that isn't `0x00`: a game-level packet type dispatched
/// via `add_packet(type, handler)`.
pub fn is_game_level(first_byte: u8) -> bool {
    first_byte != CORE_PACKET_MARKER
}

/// Wraps a reliable payload: `[0x00, 0x02, seqnum_u32le, payload...]`.
pub fn encode_reliable(seqnum: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + payload.len());
    buf.push(CORE_PACKET_MARKER);
    buf.push(CoreSubtype::ReliableData as u8);
    let mut seq_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut seq_bytes, seqnum);
    buf.extend_from_slice(&seq_bytes);
    buf.extend_from_slice(payload);
    buf
}

/// Decodes a reliable-data packet, returning `(seqnum, payload)`.
pub fn decode_reliable(buf: &[u8]) -> Result<(u32, &[u8]), PacketError> {
    if buf.len() < 6 {
        return Err(PacketError::TooShort { need: 6, got: buf.len() });
    }
    let seqnum = LittleEndian::read_u32(&buf[2..6]);
    Ok((seqnum, &buf[6..]))
}

/// `[0x00, 0x03, seqnum_u32le]`
pub fn encode_ack(seqnum: u32) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0] = CORE_PACKET_MARKER;
    buf[1] = CoreSubtype::Ack as u8;
    LittleEndian::write_u32(&mut buf[2..6], seqnum);
    buf
}

pub fn decode_ack(buf: &[u8]) -> Result<u32, PacketError> {
    if buf.len() < 6 {
        return Err(PacketError::TooShort { need: 6, got: buf.len() });
    }
    Ok(LittleEndian::read_u32(&buf[2..6]))
}

/// `[0x00, 0x0A, total_len_u32le, offset_u32le, chunk...]`
pub fn encode_sized_chunk(total_len: u32, offset: u32, chunk: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + chunk.len());
    buf.push(CORE_PACKET_MARKER);
    buf.push(CoreSubtype::SizedData as u8);
    let mut field = [0u8; 4];
    LittleEndian::write_u32(&mut field, total_len);
    buf.extend_from_slice(&field);
    LittleEndian::write_u32(&mut field, offset);
    buf.extend_from_slice(&field);
    buf.extend_from_slice(chunk);
    buf
}

pub fn decode_sized_chunk(buf: &[u8]) -> Result<(u32, u32, &[u8]), PacketError> {
    if buf.len() < 10 {
        return Err(PacketError::TooShort { need: 10, got: buf.len() });
    }
    let total_len = LittleEndian::read_u32(&buf[2..6]);
    let offset = LittleEndian::read_u32(&buf[6..10]);
    Ok((total_len, offset, &buf[10..]))
}

/// Groups multiple small outgoing sub-packets under one `0x00 0x0E`
/// envelope, each prefixed by its length as a single byte (so each
/// sub-packet must be <= 255 bytes). Returns `None` if any sub-packet is
/// too large to prefix this way, or the envelope would exceed the
/// MTU-safe datagram size.
pub fn encode_grouped(sub_packets: &[&[u8]]) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(2 + sub_packets.iter().map(|p| p.len() + 1).sum::<usize>());
    buf.push(CORE_PACKET_MARKER);
    buf.push(CoreSubtype::Grouped as u8);
    for sub in sub_packets {
        if sub.len() > u8::MAX as usize {
            return None;
        }
        buf.push(sub.len() as u8);
        buf.extend_from_slice(sub);
    }
    if buf.len() > MAX_DATAGRAM_PAYLOAD {
        return None;
    }
    Some(buf)
}

/// Iterates the sub-packets inside a grouped envelope's body (bytes after
/// the `0x00 0x0E` header).
pub fn decode_grouped(body: &[u8]) -> Result<Vec<&[u8]>, PacketError> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < body.len() {
        let len = body[cursor] as usize;
        cursor += 1;
        if cursor + len > body.len() {
            return Err(PacketError::GroupedOverrun(len));
        }
        out.push(&body[cursor..cursor + len]);
        cursor += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliable_round_trip() {
        let encoded = encode_reliable(42, b"hello");
        let (seq, payload) = decode_reliable(&encoded).unwrap();
        assert_eq!(seq, 42);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn ack_round_trip() {
        let encoded = encode_ack(7);
        assert_eq!(decode_ack(&encoded).unwrap(), 7);
    }

    #[test]
    fn grouped_round_trip() {
        let a = b"AAA";
        let b = b"BB";
        let grouped = encode_grouped(&[a, b]).unwrap();
        let body = &grouped[2..];
        let subs = decode_grouped(body).unwrap();
        assert_eq!(subs, vec![a.as_slice(), b.as_slice()]);
    }

    #[test]
    fn grouped_overrun_is_rejected() {
        let body = [5u8, 1, 2]; // claims 5 bytes follow, only 2 present
        assert!(decode_grouped(&body).is_err());
    }

    #[test]
    fn sized_chunk_round_trip() {
        let encoded = encode_sized_chunk(1000, 256, b"chunk");
        let (total, offset, chunk) = decode_sized_chunk(&encoded).unwrap();
        assert_eq!(total, 1000);
        assert_eq!(offset, 256);
        assert_eq!(chunk, b"chunk");
    }

    #[test]
    fn short_buffers_are_rejected_not_panicked() {
        assert!(decode_reliable(&[0x00, 0x02]).is_err());
        assert!(decode_ack(&[0x00]).is_err());
    }
}
