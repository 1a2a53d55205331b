//! Delayed link re-creation with per-interface exponential backoff.
//!
//! Entries are a due-time min-heap drained by the housekeeping tick.
//! Cancellation is a flag on the queued entry; the heap row is left to
//! expire on its own.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use log::debug;

use crate::netif::NetworkHandle;

pub const BACKOFF_BASE_MS: u64 = 5_000;
pub const BACKOFF_CAP_MS: u64 = 120_000;
pub const BACKOFF_MAX_DOUBLINGS: u32 = 5;

#[derive(Debug, Clone)]
struct Backoff {
    delay_ms: u64,
    doublings: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay_ms: BACKOFF_BASE_MS,
            doublings: 0,
        }
    }
}

impl Backoff {
    /// Current delay, advancing the schedule for the next failure.
    fn step(&mut self) -> u64 {
        let delay = self.delay_ms;
        if self.doublings < BACKOFF_MAX_DOUBLINGS {
            self.delay_ms = (self.delay_ms * 2).min(BACKOFF_CAP_MS);
            self.doublings += 1;
        }
        delay
    }
}

struct Pending {
    handle: NetworkHandle,
    cancelled: bool,
}

#[derive(Default)]
pub struct ReconnectQueue {
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    pending: HashMap<u64, Pending>,
    backoff: HashMap<String, Backoff>,
    next_token: u64,
}

impl ReconnectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a retry for the interface at its current backoff delay.
    /// A second schedule for an interface already queued is a no-op.
    /// Returns the due time.
    pub fn schedule(&mut self, handle: NetworkHandle, now_ms: u64) -> u64 {
        if let Some(due) = self.due_time(&handle.name) {
            return due;
        }
        let delay = self
            .backoff
            .entry(handle.name.clone())
            .or_default()
            .step();
        let due = now_ms + delay;
        let token = self.next_token;
        self.next_token += 1;

        debug!("reconnect of '{}' scheduled in {} ms", handle.name, delay);
        self.pending.insert(
            token,
            Pending {
                handle,
                cancelled: false,
            },
        );
        self.heap.push(Reverse((due, token)));
        due
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.due_time(name).is_some()
    }

    fn due_time(&self, name: &str) -> Option<u64> {
        let token = self
            .pending
            .iter()
            .find(|(_, p)| !p.cancelled && p.handle.name == name)
            .map(|(t, _)| *t)?;
        self.heap
            .iter()
            .find(|Reverse((_, t))| *t == token)
            .map(|Reverse((due, _))| *due)
    }

    /// Flags any queued retry for the interface as cancelled; used when
    /// the interface vanishes for good.
    pub fn cancel(&mut self, name: &str) {
        for pending in self.pending.values_mut() {
            if pending.handle.name == name {
                pending.cancelled = true;
            }
        }
    }

    /// Forgets the interface's backoff history after a successful
    /// reconnect; the next failure starts at the base delay again.
    pub fn reset(&mut self, name: &str) {
        self.backoff.remove(name);
    }

    /// Current delay the interface would be scheduled with, for
    /// diagnostics and tests.
    pub fn current_delay_ms(&self, name: &str) -> u64 {
        self.backoff
            .get(name)
            .map(|b| b.delay_ms)
            .unwrap_or(BACKOFF_BASE_MS)
    }

    /// Pops every entry whose due time has passed.
    pub fn due(&mut self, now_ms: u64) -> Vec<NetworkHandle> {
        let mut ready = Vec::new();
        while let Some(&Reverse((due, token))) = self.heap.peek() {
            if due > now_ms {
                break;
            }
            self.heap.pop();
            if let Some(pending) = self.pending.remove(&token) {
                if !pending.cancelled {
                    ready.push(pending.handle);
                }
            }
        }
        ready
    }
}
