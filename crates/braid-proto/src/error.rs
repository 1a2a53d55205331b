use thiserror::Error;

/// Errors produced while decoding SRTLA control packets or relayed SRT
/// framing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The datagram is shorter than the fixed layout of its packet family.
    #[error("packet truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// The 16-bit type field does not match the packet being decoded.
    #[error("unexpected packet type {found:#06x} (expected {expected:#06x})")]
    UnexpectedType { expected: u16, found: u16 },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
