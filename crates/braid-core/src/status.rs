//! Cross-thread observability: per-link status snapshots and session-wide
//! counters. The session task writes, anyone may read.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::link::LinkState;
use crate::netif::TransportKind;

/// Point-in-time view of one link, refreshed every housekeeping tick.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub name: String,
    pub kind: TransportKind,
    pub state: LinkState,
    pub window: u64,
    pub in_flight: usize,
    pub rtt_ms: Option<f64>,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub nak_count: u64,
    pub ack_count: u64,
    pub score: u64,
    pub last_activity_age_ms: u64,
}

/// Shared map of link name to latest status.
pub type StatusBoard = Arc<DashMap<String, LinkStatus>>;

/// Monotonic session counters. Every dropped packet shows up here in
/// addition to its log line.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Source packets relayed to the server.
    pub forwarded: AtomicU64,
    /// Source packets dropped because no link was available.
    pub dropped_no_link: AtomicU64,
    /// Source packets dropped because the chosen link failed to send.
    pub dropped_send_failed: AtomicU64,
    /// NAKs charged to the link found in the sequence index.
    pub naks_attributed: AtomicU64,
    /// NAKs charged to the receiving link because the index had no entry.
    pub naks_fallback: AtomicU64,
}

impl SessionStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped_no_link(&self) -> u64 {
        self.dropped_no_link.load(Ordering::Relaxed)
    }

    pub fn dropped_send_failed(&self) -> u64 {
        self.dropped_send_failed.load(Ordering::Relaxed)
    }

    pub fn naks_attributed(&self) -> u64 {
        self.naks_attributed.load(Ordering::Relaxed)
    }

    pub fn naks_fallback(&self) -> u64 {
        self.naks_fallback.load(Ordering::Relaxed)
    }

    /// Share of NAKs that resolved to their true sender; `None` before any
    /// NAK has been seen.
    pub fn attribution_accuracy(&self) -> Option<f64> {
        let hit = self.naks_attributed() as f64;
        let miss = self.naks_fallback() as f64;
        if hit + miss == 0.0 {
            return None;
        }
        Some(hit / (hit + miss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribution_accuracy_needs_data() {
        let stats = SessionStats::default();
        assert_eq!(stats.attribution_accuracy(), None);

        stats.naks_attributed.fetch_add(3, Ordering::Relaxed);
        stats.naks_fallback.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.attribution_accuracy(), Some(0.75));
    }
}
