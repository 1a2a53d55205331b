//! Fixed-layout SRTLA packets: the registration handshake frames and the
//! timestamped keepalive.

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::packet::{
    SRTLA_TYPE_KEEPALIVE, SRTLA_TYPE_REG1, SRTLA_TYPE_REG2, SRTLA_TYPE_REG3, packet_type,
};

/// Length of the group identifier shared by every link of a bonded session.
pub const GROUP_ID_LEN: usize = 256;

/// REG1 and REG2 are a type field followed by the full group id.
pub const REG_PKT_LEN: usize = 2 + GROUP_ID_LEN;

/// Keepalives carry the sender's monotonic clock for RTT sampling.
pub const KEEPALIVE_PKT_LEN: usize = 10;

fn check_fixed(buf: &[u8], expected: u16, len: usize) -> Result<()> {
    let found = packet_type(buf).ok_or(ProtocolError::Truncated {
        needed: len,
        have: buf.len(),
    })?;
    if found != expected {
        return Err(ProtocolError::UnexpectedType { expected, found });
    }
    if buf.len() < len {
        return Err(ProtocolError::Truncated {
            needed: len,
            have: buf.len(),
        });
    }
    Ok(())
}

fn copy_id(buf: &[u8]) -> [u8; GROUP_ID_LEN] {
    let mut id = [0u8; GROUP_ID_LEN];
    id.copy_from_slice(&buf[2..REG_PKT_LEN]);
    id
}

/// First handshake step: announces a locally generated group id.
#[derive(Clone, PartialEq, Eq)]
pub struct Reg1 {
    pub id: [u8; GROUP_ID_LEN],
}

impl Reg1 {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REG_PKT_LEN);
        buf.put_u16(SRTLA_TYPE_REG1);
        buf.put_slice(&self.id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_fixed(buf, SRTLA_TYPE_REG1, REG_PKT_LEN)?;
        Ok(Self { id: copy_id(buf) })
    }
}

/// Second handshake step: carries the server-completed group id. Sent by
/// the server to the pending link, then rebroadcast by us on every link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reg2 {
    pub id: [u8; GROUP_ID_LEN],
}

impl Reg2 {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REG_PKT_LEN);
        buf.put_u16(SRTLA_TYPE_REG2);
        buf.put_slice(&self.id);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_fixed(buf, SRTLA_TYPE_REG2, REG_PKT_LEN)?;
        Ok(Self { id: copy_id(buf) })
    }
}

/// Writes the bare REG3 acknowledgement the server sends per link; encoded
/// here as well so tests and tooling can fabricate server traffic.
pub fn encode_reg3(buf: &mut BytesMut) {
    buf.put_u16(SRTLA_TYPE_REG3);
}

/// Keepalive frame. The embedded timestamp comes back unchanged in the
/// server's reply, giving a round-trip sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub timestamp_ms: u64,
}

impl Keepalive {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(KEEPALIVE_PKT_LEN);
        buf.put_u16(SRTLA_TYPE_KEEPALIVE);
        buf.put_u64(self.timestamp_ms);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_fixed(buf, SRTLA_TYPE_KEEPALIVE, KEEPALIVE_PKT_LEN)?;
        let b = &buf[2..KEEPALIVE_PKT_LEN];
        Ok(Self {
            timestamp_ms: u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        })
    }
}
