//! One bonded path: a UDP socket bound to a specific interface and
//! connected to the aggregation server, plus everything the engine tracks
//! about that path — congestion window, in-flight sequence numbers,
//! activity timestamps, registration sub-state, and smoothed RTT.
//!
//! All mutation happens on the session task. The only other code touching
//! a link's socket is its reader task, which does nothing but receive and
//! forward frames over the session channel.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::trace;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::congestion::CongestionWindow;
use crate::error::{LinkError, LinkResult};
use crate::netif::{InterfaceProvider, NetworkHandle, TransportKind};
use crate::status::LinkStatus;

/// Largest datagram either direction of the relay will carry.
pub const MTU: usize = 1500;

/// Cap on remembered in-flight sequence numbers. Oldest entries are
/// overwritten once the log is full.
pub const IN_FLIGHT_CAP: usize = 256;

/// A Connected link that has heard nothing for this long is timed out.
pub const CONN_TIMEOUT_MS: u64 = 4_000;

/// Idle window after which a keepalive is due.
pub const KEEPALIVE_IDLE_MS: u64 = 1_000;

/// Cadence of RTT-probe keepalives while no fresh sample exists.
pub const RTT_PROBE_INTERVAL_MS: u64 = 3_000;

const RTT_ALPHA: f64 = 0.125;
const RTT_MAX_SAMPLE_MS: u64 = 10_000;

/// Stable identity of a link. The sequence index refers to links by id, so
/// entries for a removed link simply stop resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Registration sub-state of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Socket may exist but the link has not entered the handshake.
    Disconnected,
    /// Waiting for the group's REG2 to come through.
    AwaitingReg2,
    /// REG2 sent on this link, waiting for its REG3.
    AwaitingReg3,
    /// Registered; participates in scheduling.
    Connected,
    /// Dead. Keeps its identity for backoff bookkeeping, owns no socket.
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::AwaitingReg2 => "awaiting-reg2",
            LinkState::AwaitingReg3 => "awaiting-reg3",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Traffic and lifecycle notifications from a link's reader task.
#[derive(Debug)]
pub enum LinkEvent {
    Frame { link: LinkId, data: Bytes },
    Closed { link: LinkId, error: std::io::Error },
}

pub struct Link {
    id: LinkId,
    handle: NetworkHandle,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
    state: LinkState,
    window: CongestionWindow,
    in_flight: VecDeque<u32>,
    last_received_ms: u64,
    last_sent_ms: u64,
    last_keepalive_ms: Option<u64>,
    last_rtt_probe_ms: Option<u64>,
    last_rtt_sample_ms: Option<u64>,
    rtt_ms: Option<f64>,
    state_changed_ms: u64,
    bytes_sent: u64,
    packets_sent: u64,
}

impl Link {
    pub fn new(id: LinkId, handle: NetworkHandle, now_ms: u64) -> Self {
        Self {
            id,
            handle,
            socket: None,
            reader: None,
            state: LinkState::Disconnected,
            window: CongestionWindow::new(),
            in_flight: VecDeque::with_capacity(IN_FLIGHT_CAP),
            last_received_ms: now_ms,
            last_sent_ms: now_ms,
            last_keepalive_ms: None,
            last_rtt_probe_ms: None,
            last_rtt_sample_ms: None,
            rtt_ms: None,
            state_changed_ms: now_ms,
            bytes_sent: 0,
            packets_sent: 0,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn kind(&self) -> TransportKind {
        self.handle.kind
    }

    pub fn handle(&self) -> &NetworkHandle {
        &self.handle
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    pub fn congestion(&self) -> &CongestionWindow {
        &self.window
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt_ms
    }

    /// Milliseconds this link has sat in its current state.
    pub fn state_age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.state_changed_ms)
    }

    pub fn set_state(&mut self, state: LinkState, now_ms: u64) {
        if self.state != state {
            trace!("{} ({}): {} -> {}", self.id, self.handle.name, self.state, state);
            self.state = state;
            self.state_changed_ms = now_ms;
        }
    }

    /// Opens the socket for this link's interface, connects it to the
    /// server, and spawns the reader task. The link enters AwaitingReg2.
    pub fn connect(
        &mut self,
        provider: &dyn InterfaceProvider,
        server: SocketAddr,
        events: mpsc::Sender<LinkEvent>,
        now_ms: u64,
    ) -> LinkResult<()> {
        let std_socket =
            provider
                .open_socket(&self.handle, server)
                .map_err(|source| LinkError::BindFailed {
                    iface: self.handle.name.clone(),
                    source,
                })?;
        let socket = UdpSocket::from_std(std_socket).map_err(|source| LinkError::BindFailed {
            iface: self.handle.name.clone(),
            source,
        })?;
        let socket = Arc::new(socket);
        self.reader = Some(tokio::spawn(reader_loop(self.id, socket.clone(), events)));
        self.socket = Some(socket);
        self.last_received_ms = now_ms;
        self.set_state(LinkState::AwaitingReg2, now_ms);
        Ok(())
    }

    /// Sends a relayed packet, remembering its sequence number (if any) in
    /// the in-flight log.
    pub fn send_with_tracking(
        &mut self,
        data: &[u8],
        seq: Option<u32>,
        now_ms: u64,
    ) -> LinkResult<()> {
        self.transmit(data, now_ms)?;
        if let Some(seq) = seq {
            if self.in_flight.len() == IN_FLIGHT_CAP {
                self.in_flight.pop_front();
            }
            self.in_flight.push_back(seq);
        }
        Ok(())
    }

    /// Sends a registration or keepalive frame; the in-flight log is not
    /// touched.
    pub fn send_control(&mut self, data: &[u8], now_ms: u64) -> LinkResult<()> {
        self.transmit(data, now_ms)
    }

    fn transmit(&mut self, data: &[u8], now_ms: u64) -> LinkResult<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| LinkError::NetworkUnavailable(self.handle.name.clone()))?;
        match socket.try_send(data) {
            Ok(written) if written == data.len() => {
                self.last_sent_ms = now_ms;
                self.bytes_sent += written as u64;
                self.packets_sent += 1;
                Ok(())
            }
            Ok(written) => Err(LinkError::PartialWrite {
                written,
                len: data.len(),
            }),
            Err(source) => Err(LinkError::Send(source)),
        }
    }

    /// Stamps receipt of any datagram on this link.
    pub fn on_received(&mut self, now_ms: u64) {
        self.last_received_ms = now_ms;
    }

    /// Aggregation-channel ACK: exact-match removal from the in-flight log
    /// and, on a hit, one attempt to grow the window. A miss is a no-op.
    pub fn handle_ack(&mut self, seq: u32, now_ms: u64) {
        if let Some(pos) = self.in_flight.iter().position(|&s| s == seq) {
            self.in_flight.remove(pos);
            self.window.on_ack(now_ms, self.in_flight.len());
        }
    }

    /// Relayed SRT ACK: cumulative, drops everything at or below `ack`.
    /// Does not grow the window; that privilege belongs to the
    /// aggregation-channel ACKs.
    pub fn handle_srt_ack(&mut self, ack: u32) {
        self.in_flight.retain(|&s| s > ack);
    }

    /// Charges a NAK to this link, but only if it actually transmitted the
    /// sequence. Returns whether the charge landed.
    pub fn handle_nak(&mut self, seq: u32, now_ms: u64) -> bool {
        if let Some(pos) = self.in_flight.iter().position(|&s| s == seq) {
            self.in_flight.remove(pos);
            self.window.on_nak(now_ms);
            true
        } else {
            false
        }
    }

    /// Housekeeping hook for quiet-time window recovery.
    pub fn window_recovery(&mut self, now_ms: u64) {
        self.window.recovery_tick(now_ms);
    }

    /// Send-budget score. Zero unless Connected and not timed out, which
    /// is what keeps unregistered and dead links out of the scheduler.
    pub fn score(&self, now_ms: u64) -> u64 {
        if self.state != LinkState::Connected || self.is_timed_out(now_ms) {
            return 0;
        }
        self.window.score(self.in_flight.len())
    }

    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        self.state == LinkState::Connected
            && now_ms.saturating_sub(self.last_received_ms) > CONN_TIMEOUT_MS
    }

    pub fn needs_keepalive(&self, now_ms: u64) -> bool {
        match self.last_keepalive_ms {
            None => true,
            Some(t) => now_ms.saturating_sub(t) >= KEEPALIVE_IDLE_MS,
        }
    }

    /// True while RTT has no fresh sample and no probe is already out.
    pub fn needs_rtt_probe(&self, now_ms: u64) -> bool {
        let sample_stale = match self.last_rtt_sample_ms {
            None => true,
            Some(t) => now_ms.saturating_sub(t) >= RTT_PROBE_INTERVAL_MS,
        };
        let probe_due = match self.last_rtt_probe_ms {
            None => true,
            Some(t) => now_ms.saturating_sub(t) >= RTT_PROBE_INTERVAL_MS,
        };
        sample_stale && probe_due
    }

    pub fn note_keepalive_sent(&mut self, now_ms: u64) {
        self.last_keepalive_ms = Some(now_ms);
        self.last_rtt_probe_ms = Some(now_ms);
    }

    /// Feeds one keepalive echo into the smoothed RTT. Samples outside
    /// [0, 10 s] are discarded as clock skew or reordering artifacts.
    pub fn record_rtt_sample(&mut self, sent_ts_ms: u64, now_ms: u64) {
        if sent_ts_ms > now_ms {
            return;
        }
        let sample = now_ms - sent_ts_ms;
        if sample > RTT_MAX_SAMPLE_MS {
            return;
        }
        let sample = sample as f64;
        self.rtt_ms = Some(match self.rtt_ms {
            None => sample,
            Some(current) => current + RTT_ALPHA * (sample - current),
        });
        self.last_rtt_sample_ms = Some(now_ms);
    }

    /// Drops the socket, stops the reader, and marks the link Failed. The
    /// link stays in the set so its backoff identity survives.
    pub fn mark_failed(&mut self, now_ms: u64) {
        self.teardown_io();
        self.set_state(LinkState::Failed, now_ms);
    }

    fn teardown_io(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.socket = None;
    }

    pub fn status(&self, now_ms: u64) -> LinkStatus {
        let last_activity = self.last_received_ms.max(self.last_sent_ms);
        LinkStatus {
            name: self.handle.name.clone(),
            kind: self.handle.kind,
            state: self.state,
            window: self.window.get(),
            in_flight: self.in_flight.len(),
            rtt_ms: self.rtt_ms,
            bytes_sent: self.bytes_sent,
            packets_sent: self.packets_sent,
            nak_count: self.window.nak_count(),
            ack_count: self.window.ack_count(),
            score: self.score(now_ms),
            last_activity_age_ms: now_ms.saturating_sub(last_activity),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.teardown_io();
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' ({})", self.id, self.handle.name, self.handle.kind)
    }
}

async fn reader_loop(id: LinkId, socket: Arc<UdpSocket>, events: mpsc::Sender<LinkEvent>) {
    let mut buf = [0u8; MTU];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                let frame = LinkEvent::Frame {
                    link: id,
                    data: Bytes::copy_from_slice(&buf[..len]),
                };
                if events.send(frame).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                let _ = events.send(LinkEvent::Closed { link: id, error }).await;
                break;
            }
        }
    }
}

/// Insertion-ordered set of links. Insertion order is the scheduler's final
/// tie-break, so it is preserved across removals.
#[derive(Default)]
pub struct LinkSet {
    links: Vec<Link>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn insert(&mut self, link: Link) {
        self.links.push(link);
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| l.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.handle.name == name)
    }

    pub fn remove(&mut self, id: LinkId) -> Option<Link> {
        let pos = self.links.iter().position(|l| l.id == id)?;
        Some(self.links.remove(pos))
    }

    pub fn remove_by_name(&mut self, name: &str) -> Option<Link> {
        let pos = self.links.iter().position(|l| l.handle.name == name)?;
        Some(self.links.remove(pos))
    }

    pub fn retain(&mut self, f: impl FnMut(&Link) -> bool) {
        self.links.retain(f);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Link> {
        self.links.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Link> {
        self.links.iter_mut()
    }

    pub fn connected_count(&self) -> usize {
        self.links
            .iter()
            .filter(|l| l.state == LinkState::Connected)
            .count()
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{connected_link, handle, track};
    use super::*;
    use crate::congestion::{WINDOW_DECR, WINDOW_DEF, WINDOW_MULT};

    #[test]
    fn ack_on_missing_seq_is_a_noop() {
        let mut link = connected_link(1, TransportKind::Wifi, WINDOW_DEF * WINDOW_MULT, 0);
        let window = link.congestion().get();
        link.handle_ack(42, 1_000);
        assert_eq!(link.congestion().get(), window);
        assert_eq!(link.congestion().ack_count(), 0);
    }

    #[test]
    fn nak_on_missing_seq_leaves_window_unchanged() {
        let mut link = connected_link(1, TransportKind::Wifi, WINDOW_DEF * WINDOW_MULT, 0);
        let window = link.congestion().get();
        assert!(!link.handle_nak(42, 1_000));
        assert_eq!(link.congestion().get(), window);
        assert_eq!(link.congestion().nak_count(), 0);
    }

    #[test]
    fn nak_on_tracked_seq_shrinks_window() {
        let mut link = connected_link(1, TransportKind::Wifi, WINDOW_DEF * WINDOW_MULT, 0);
        track(&mut link, 37);
        let window = link.congestion().get();
        assert!(link.handle_nak(37, 1_000));
        assert_eq!(link.congestion().get(), window - WINDOW_DECR);
        assert_eq!(link.in_flight_len(), 0);
    }

    #[test]
    fn in_flight_log_overwrites_oldest() {
        let mut link = connected_link(1, TransportKind::Wifi, WINDOW_DEF * WINDOW_MULT, 0);
        for seq in 0..(IN_FLIGHT_CAP as u32 + 10) {
            track(&mut link, seq);
        }
        assert_eq!(link.in_flight_len(), IN_FLIGHT_CAP);
        // The first ten were overwritten: NAKing them changes nothing.
        assert!(!link.handle_nak(0, 0));
        assert!(link.handle_nak(10, 0));
    }

    #[test]
    fn srt_ack_is_cumulative() {
        let mut link = connected_link(1, TransportKind::Wifi, WINDOW_DEF * WINDOW_MULT, 0);
        for seq in [3u32, 7, 11, 15] {
            track(&mut link, seq);
        }
        link.handle_srt_ack(11);
        assert_eq!(link.in_flight_len(), 1);
        assert!(link.handle_nak(15, 0));
    }

    #[test]
    fn timeout_applies_only_to_connected_links() {
        let mut link = Link::new(LinkId(1), handle("wlan0", TransportKind::Wifi), 0);
        assert!(!link.is_timed_out(CONN_TIMEOUT_MS + 1));

        link.set_state(LinkState::Connected, 0);
        assert!(!link.is_timed_out(CONN_TIMEOUT_MS));
        assert!(link.is_timed_out(CONN_TIMEOUT_MS + 1));

        link.on_received(CONN_TIMEOUT_MS);
        assert!(!link.is_timed_out(CONN_TIMEOUT_MS + 1_000));
    }

    #[test]
    fn score_is_zero_unless_connected() {
        let mut link = Link::new(LinkId(1), handle("wlan0", TransportKind::Wifi), 0);
        assert_eq!(link.score(0), 0);

        link.set_state(LinkState::Connected, 0);
        assert!(link.score(0) > 0);

        // Timed out: back to zero.
        assert_eq!(link.score(CONN_TIMEOUT_MS + 1), 0);
    }

    #[test]
    fn rtt_smoothing_follows_samples() {
        let mut link = Link::new(LinkId(1), handle("wlan0", TransportKind::Wifi), 0);
        link.record_rtt_sample(0, 80);
        assert_eq!(link.rtt_ms(), Some(80.0));

        // EWMA with alpha 0.125: 80 + 0.125 * (160 - 80) = 90.
        link.record_rtt_sample(1_000, 1_160);
        assert_eq!(link.rtt_ms(), Some(90.0));

        // Garbage samples are ignored.
        link.record_rtt_sample(5_000, 20_000);
        link.record_rtt_sample(30_000, 20_000);
        assert_eq!(link.rtt_ms(), Some(90.0));
    }

    #[test]
    fn keepalive_and_probe_scheduling() {
        let mut link = Link::new(LinkId(1), handle("wlan0", TransportKind::Wifi), 0);
        assert!(link.needs_keepalive(0));
        assert!(link.needs_rtt_probe(0));

        link.note_keepalive_sent(0);
        assert!(!link.needs_keepalive(KEEPALIVE_IDLE_MS - 1));
        assert!(link.needs_keepalive(KEEPALIVE_IDLE_MS));

        assert!(!link.needs_rtt_probe(1_000));
        assert!(link.needs_rtt_probe(RTT_PROBE_INTERVAL_MS));

        // A fresh sample quiets the probe.
        link.record_rtt_sample(RTT_PROBE_INTERVAL_MS - 50, RTT_PROBE_INTERVAL_MS);
        assert!(!link.needs_rtt_probe(RTT_PROBE_INTERVAL_MS + 1_000));
    }

    #[tokio::test]
    async fn send_with_tracking_writes_and_logs() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let provider = crate::netif::StaticProvider::new(vec![handle("lo", TransportKind::Wifi)]);
        let (tx, _rx) = mpsc::channel(8);

        let mut link = Link::new(LinkId(1), handle("lo", TransportKind::Wifi), 0);
        link.connect(&provider, peer.local_addr().unwrap(), tx, 0)
            .unwrap();
        assert_eq!(link.state(), LinkState::AwaitingReg2);

        link.send_with_tracking(&[0x00, 0x00, 0x00, 0x09, 0xaa], Some(9), 5)
            .unwrap();
        assert_eq!(link.in_flight_len(), 1);

        let mut buf = [0u8; 32];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x00, 0x00, 0x00, 0x09, 0xaa]);
    }

    #[test]
    fn failed_link_owns_no_socket_and_rejects_sends() {
        let mut link = Link::new(LinkId(1), handle("wlan0", TransportKind::Wifi), 0);
        link.mark_failed(100);
        assert_eq!(link.state(), LinkState::Failed);
        assert!(!link.has_socket());
        assert!(matches!(
            link.send_control(b"x", 200),
            Err(LinkError::NetworkUnavailable(_))
        ));
    }

    #[test]
    fn link_set_preserves_insertion_order() {
        let mut set = LinkSet::new();
        for id in [4u64, 2, 9] {
            set.insert(Link::new(
                LinkId(id),
                handle(&format!("if{}", id), TransportKind::Unknown),
                0,
            ));
        }
        let order: Vec<u64> = set.iter().map(|l| l.id().0).collect();
        assert_eq!(order, vec![4, 2, 9]);

        set.remove(LinkId(2));
        let order: Vec<u64> = set.iter().map(|l| l.id().0).collect();
        assert_eq!(order, vec![4, 9]);

        assert!(set.by_name("if9").is_some());
        assert!(set.by_name("if2").is_none());
    }
}
