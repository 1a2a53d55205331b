//! # Braid bonding engine
//!
//! Aggregates several UDP paths (Wi-Fi, cellular, ethernet) into one
//! logical uplink for an SRT stream, speaking the SRTLA aggregation
//! protocol to the server: registration handshake, keepalives, per-link
//! congestion windows with ACK/NAK accounting, and reverse-path
//! demultiplexing back to the local source.
//!
//! A [`session::Session`] owns everything for one bonded stream; the host
//! supplies an [`netif::InterfaceProvider`] and a [`clock::Clock`].

pub mod clock;
pub mod congestion;
pub mod error;
pub mod link;
pub mod netif;
pub mod reconnect;
pub mod registration;
pub mod scheduler;
pub mod seqindex;
pub mod session;
pub mod status;

pub use error::{LinkError, SessionError};
pub use session::{Session, SessionConfig, SessionHandle};
