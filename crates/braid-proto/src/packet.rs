//! Datagram classification and the parsers for the variable-length packet
//! families (SRT data sequence numbers, SRT ACK/NAK bodies, SRTLA ACK
//! bodies).
//!
//! Everything here operates on plain byte slices: the session loop hands
//! the same reusable receive buffer to these functions for every datagram.

use crate::error::{ProtocolError, Result};

// SRTLA aggregation-control types. The high nibble 0x9 is reserved by the
// protocol for the aggregation channel; everything else on the wire is
// relayed SRT.
pub const SRTLA_TYPE_KEEPALIVE: u16 = 0x9000;
pub const SRTLA_TYPE_ACK: u16 = 0x9100;
pub const SRTLA_TYPE_REG1: u16 = 0x9200;
pub const SRTLA_TYPE_REG2: u16 = 0x9201;
pub const SRTLA_TYPE_REG3: u16 = 0x9202;
pub const SRTLA_TYPE_REG_ERR: u16 = 0x9210;
pub const SRTLA_TYPE_REG_NGP: u16 = 0x9211;

// Relayed SRT control types: control bit (top bit) plus the 15-bit subtype.
pub const SRT_TYPE_HANDSHAKE: u16 = 0x8000;
pub const SRT_TYPE_ACK: u16 = 0x8002;
pub const SRT_TYPE_NAK: u16 = 0x8003;
pub const SRT_TYPE_SHUTDOWN: u16 = 0x8005;

/// SRT control packets carry a 16-byte header; the ACK number and the NAK
/// loss list both start right after it.
pub const SRT_HEADER_LEN: usize = 16;

/// Ack numbers in an SRTLA ACK start after the first 32-bit word (the type
/// occupies the top half of that word, the bottom half is zero).
pub const SRTLA_ACK_HEADER_LEN: usize = 4;

/// Hard cap on the number of sequences expanded from one NAK loss list.
/// A malformed or hostile range would otherwise expand quadratically.
pub const MAX_NAK_SEQS: usize = 1000;

const SEQ_MASK: u32 = 0x7fff_ffff;
const CONTROL_BIT: u16 = 0x8000;

/// What a received datagram is, judged by its 16-bit big-endian type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Relayed SRT payload carrying the given 31-bit sequence number.
    SrtData(u32),
    SrtHandshake,
    SrtAck,
    SrtNak,
    SrtShutdown,
    /// SRT control of a subtype the relay forwards without inspecting.
    SrtControl(u16),
    Keepalive,
    Ack,
    Reg1,
    Reg2,
    Reg3,
    RegErr,
    RegNgp,
}

/// Reads the 16-bit big-endian type field at offset 0, if present.
pub fn packet_type(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Classifies a datagram. Returns `None` for runts that do not carry a
/// complete type field (or, for SRT data, a complete first word).
pub fn classify(buf: &[u8]) -> Option<PacketKind> {
    let ty = packet_type(buf)?;
    let kind = match ty {
        SRTLA_TYPE_KEEPALIVE => PacketKind::Keepalive,
        SRTLA_TYPE_ACK => PacketKind::Ack,
        SRTLA_TYPE_REG1 => PacketKind::Reg1,
        SRTLA_TYPE_REG2 => PacketKind::Reg2,
        SRTLA_TYPE_REG3 => PacketKind::Reg3,
        SRTLA_TYPE_REG_ERR => PacketKind::RegErr,
        SRTLA_TYPE_REG_NGP => PacketKind::RegNgp,
        _ if ty & CONTROL_BIT == 0 => PacketKind::SrtData(data_sequence(buf)?),
        SRT_TYPE_HANDSHAKE => PacketKind::SrtHandshake,
        SRT_TYPE_ACK => PacketKind::SrtAck,
        SRT_TYPE_NAK => PacketKind::SrtNak,
        SRT_TYPE_SHUTDOWN => PacketKind::SrtShutdown,
        _ => PacketKind::SrtControl(ty & !CONTROL_BIT),
    };
    Some(kind)
}

/// Extracts the 31-bit sequence number of an SRT data packet. `None` if the
/// first word is missing or has the control bit set.
pub fn data_sequence(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if word & !SEQ_MASK != 0 {
        return None;
    }
    Some(word)
}

/// Extracts the acknowledged sequence number of an SRT ACK control packet.
pub fn srt_ack_number(buf: &[u8]) -> Result<u32> {
    let needed = SRT_HEADER_LEN + 4;
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            have: buf.len(),
        });
    }
    let b = &buf[SRT_HEADER_LEN..];
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) & SEQ_MASK)
}

/// Expands the loss list of an SRT NAK into individual sequence numbers.
///
/// Entries from byte 16 onward are 32-bit integers: a value with the top
/// bit set opens a range whose inclusive end is the next integer; any other
/// value is a single lost sequence. The expansion is clamped to
/// [`MAX_NAK_SEQS`] entries, and a trailing truncated range degrades to its
/// start alone.
pub fn nak_sequences(buf: &[u8]) -> Vec<u32> {
    let mut out = Vec::new();
    let body = match buf.get(SRT_HEADER_LEN..) {
        Some(b) => b,
        None => return out,
    };

    let mut words = body
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]));

    while let Some(word) = words.next() {
        if out.len() >= MAX_NAK_SEQS {
            break;
        }
        if word & !SEQ_MASK != 0 {
            let start = word & SEQ_MASK;
            match words.next() {
                Some(end) if end >= start => {
                    let room = MAX_NAK_SEQS - out.len();
                    let end = end.min(start.saturating_add(room as u32 - 1));
                    out.extend(start..=end);
                }
                // Inverted or missing end: keep the start, drop the rest.
                _ => out.push(start),
            }
        } else {
            out.push(word);
        }
    }
    out
}

/// Iterates the ack numbers of an SRTLA ACK packet, in wire order.
pub fn srtla_ack_numbers(buf: &[u8]) -> impl Iterator<Item = u32> + '_ {
    buf.get(SRTLA_ACK_HEADER_LEN..)
        .unwrap_or_default()
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
}

/// Builds an SRTLA ACK: the type in the top half of the first word, then
/// the ack numbers. The counterpart of [`srtla_ack_numbers`]; the relay
/// itself only consumes these, but test rigs and servers produce them.
pub fn encode_srtla_ack(acks: &[u32], buf: &mut bytes::BytesMut) {
    use bytes::BufMut;
    buf.reserve(SRTLA_ACK_HEADER_LEN + acks.len() * 4);
    buf.put_u16(SRTLA_TYPE_ACK);
    buf.put_u16(0);
    for ack in acks {
        buf.put_u32(*ack);
    }
}

/// Builds an SRT NAK around a loss list. Runs of consecutive sequences
/// become top-bit ranges, the counterpart of [`nak_sequences`]. The input
/// must be sorted; duplicates are harmless.
pub fn encode_srt_nak(sorted_seqs: &[u32], buf: &mut bytes::BytesMut) {
    use bytes::BufMut;
    buf.reserve(SRT_HEADER_LEN + sorted_seqs.len() * 4);
    buf.put_u16(SRT_TYPE_NAK);
    buf.put_u16(0);
    buf.put_bytes(0, SRT_HEADER_LEN - 4);

    let mut i = 0;
    while i < sorted_seqs.len() {
        let start = sorted_seqs[i];
        let mut end = start;
        while i + 1 < sorted_seqs.len() && sorted_seqs[i + 1] <= end + 1 {
            i += 1;
            end = end.max(sorted_seqs[i]);
        }
        if start == end {
            buf.put_u32(start);
        } else {
            buf.put_u32(start | !SEQ_MASK);
            buf.put_u32(end);
        }
        i += 1;
    }
}
