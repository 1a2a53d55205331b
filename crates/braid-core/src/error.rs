use std::io;
use thiserror::Error;

/// Failures scoped to a single bonded link. These never escape the session:
/// the link is marked failed and handed to the reconnect queue.
#[derive(Error, Debug)]
pub enum LinkError {
    /// No socket could be produced for the interface, or the link currently
    /// owns none.
    #[error("no usable network for interface '{0}'")]
    NetworkUnavailable(String),

    /// The interface rejected the bind or the connect to the server.
    #[error("failed to bind interface '{iface}': {source}")]
    BindFailed { iface: String, source: io::Error },

    /// The socket write failed outright.
    #[error("send failed: {0}")]
    Send(#[from] io::Error),

    /// The socket accepted fewer bytes than the datagram holds. Treated the
    /// same as a failed send.
    #[error("short write: {written} of {len} bytes")]
    PartialWrite { written: usize, len: usize },

    /// A registration step did not complete in time.
    #[error("registration timed out")]
    Timeout,

    /// The peer sent something the handshake cannot accept.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Failures that prevent a session from starting. Once running, a session
/// only ever degrades; it does not die on its own.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind source socket on port {port}: {source}")]
    SourceBind { port: u16, source: io::Error },
}

pub type LinkResult<T> = std::result::Result<T, LinkError>;
pub type Result<T> = std::result::Result<T, SessionError>;
