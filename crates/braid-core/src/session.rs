//! The per-session event loop: one cooperative task that owns every link,
//! the sequence index, and the registrar.
//!
//! Source packets come in on the session's UDP endpoint and go out via the
//! link the selector picks; server frames come back through the link
//! reader tasks and are demultiplexed here — registration first, then
//! congestion accounting, then verbatim forwarding to the source. A 1 s
//! housekeeping tick keeps registration, keepalives, recovery, eviction,
//! and reconnection moving even under total silence.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::BytesMut;
use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

use braid_proto::PacketKind;
use braid_proto::packet;
use braid_proto::reg::Keepalive;

use crate::clock::Clock;
use crate::error::{Result, SessionError};
use crate::link::{CONN_TIMEOUT_MS, Link, LinkEvent, LinkId, LinkSet, LinkState, MTU};
use crate::netif::{InterfaceProvider, NetworkEvent, NetworkHandle};
use crate::reconnect::ReconnectQueue;
use crate::registration::Registrar;
use crate::scheduler::Selector;
use crate::seqindex::SequenceIndex;
use crate::status::{SessionStats, StatusBoard};

pub use crate::scheduler::SelectorConfig;

pub const DEFAULT_LOCAL_PORT: u16 = 6000;
pub const DEFAULT_SERVER_PORT: u16 = 5000;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
const INDEX_SWEEP_INTERVAL_MS: u64 = 5_000;
const INDEX_WARN_UTILIZATION_PCT: u64 = 80;
/// Dead links with no retry pending are forgotten after this long.
const LINK_PURGE_AFTER_MS: u64 = 300_000;
/// All links out of Connected for this long (after the group was ever up)
/// is reported as a catastrophic failure. The session keeps retrying.
const GROUP_DOWN_TIMEOUT_MS: u64 = 10_000;
const LINK_EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_host: String,
    pub server_port: u16,
    /// UDP port the local source sends into. Zero asks the OS for an
    /// ephemeral port, which is what tests do.
    pub local_port: u16,
    pub selector: SelectorConfig,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_host.trim().is_empty() {
            return Err(SessionError::Config("server host must not be empty".into()));
        }
        if self.server_port == 0 {
            return Err(SessionError::Config("server port must not be zero".into()));
        }
        Ok(())
    }
}

/// Running session. Call [`SessionHandle::stop`] for an orderly shutdown;
/// dropping the handle also winds the session down, just without waiting
/// for it.
pub struct SessionHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
    stats: Arc<SessionStats>,
    status: StatusBoard,
}

impl SessionHandle {
    /// Address of the source-facing UDP endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    /// Cooperative stop: flags the loop and waits for it to wind down,
    /// which tears down every link and its reader task.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

pub struct Session;

impl Session {
    /// Binds the source endpoint and spawns the session task. Fails only
    /// on bad configuration or an unbindable source port.
    pub async fn start(
        cfg: SessionConfig,
        provider: Arc<dyn InterfaceProvider>,
        clock: Arc<dyn Clock>,
        net_events: mpsc::Receiver<NetworkEvent>,
    ) -> Result<SessionHandle> {
        cfg.validate()?;
        let source = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.local_port))
            .await
            .map_err(|source| SessionError::SourceBind {
                port: cfg.local_port,
                source,
            })?;
        let local_addr = source
            .local_addr()
            .map_err(|source| SessionError::SourceBind {
                port: cfg.local_port,
                source,
            })?;

        let stats = Arc::new(SessionStats::default());
        let status: StatusBoard = Arc::new(DashMap::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let (engine, link_events) =
            Engine::new(cfg, provider, clock, source, stats.clone(), status.clone());
        let task = tokio::spawn(engine.run(stop_rx, net_events, link_events));

        Ok(SessionHandle {
            stop: stop_tx,
            task,
            local_addr,
            stats,
            status,
        })
    }
}

struct Engine {
    cfg: SessionConfig,
    provider: Arc<dyn InterfaceProvider>,
    clock: Arc<dyn Clock>,
    source: UdpSocket,
    source_addr: Option<SocketAddr>,
    links: LinkSet,
    next_link_id: u64,
    registrar: Registrar,
    index: SequenceIndex,
    selector: Selector,
    reconnect: ReconnectQueue,
    stats: Arc<SessionStats>,
    status: StatusBoard,
    link_events: mpsc::Sender<LinkEvent>,
    last_sweep_ms: u64,
    last_any_connected_ms: u64,
    group_down_logged: bool,
}

impl Engine {
    fn new(
        cfg: SessionConfig,
        provider: Arc<dyn InterfaceProvider>,
        clock: Arc<dyn Clock>,
        source: UdpSocket,
        stats: Arc<SessionStats>,
        status: StatusBoard,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_QUEUE);
        let selector = Selector::new(cfg.selector.clone());
        let now_ms = clock.now_ms();
        let engine = Self {
            cfg,
            provider,
            clock,
            source,
            source_addr: None,
            links: LinkSet::new(),
            next_link_id: 0,
            registrar: Registrar::new(),
            index: SequenceIndex::new(),
            selector,
            reconnect: ReconnectQueue::new(),
            stats,
            status,
            link_events: link_tx,
            last_sweep_ms: now_ms,
            last_any_connected_ms: now_ms,
            group_down_logged: false,
        };
        (engine, link_rx)
    }

    async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        mut net_events: mpsc::Receiver<NetworkEvent>,
        mut link_events: mpsc::Receiver<LinkEvent>,
    ) {
        let mut src_buf = [0u8; MTU];
        let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.discover_links();
        match self.source.local_addr() {
            Ok(addr) => info!(
                "session up: source {}, server {}:{}",
                addr, self.cfg.server_host, self.cfg.server_port
            ),
            Err(_) => info!(
                "session up, server {}:{}",
                self.cfg.server_host, self.cfg.server_port
            ),
        }

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    // A dropped handle counts as a stop request.
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                received = self.source.recv_from(&mut src_buf) => match received {
                    Ok((len, from)) => self.on_source_packet(&src_buf[..len], from),
                    Err(e) => error!("source socket receive failed: {}", e),
                },
                Some(event) = link_events.recv() => match event {
                    LinkEvent::Frame { link, data } => self.on_link_frame(link, &data),
                    LinkEvent::Closed { link, error } => self.on_link_closed(link, error),
                },
                Some(event) = net_events.recv() => self.on_network_event(event),
                _ = housekeeping.tick() => self.housekeeping(),
            }
        }

        info!("session stopping");
        // Links (and with them the reader tasks) die with the engine.
    }

    /// A packet from the local source: learn the return address once, pick
    /// a link, send, and remember the sequence for NAK attribution.
    fn on_source_packet(&mut self, data: &[u8], from: SocketAddr) {
        let now_ms = self.clock.now_ms();
        if self.source_addr.is_none() {
            info!("source locked to {}", from);
            self.source_addr = Some(from);
        }

        let seq = packet::data_sequence(data);
        let Some(chosen) = self.selector.pick(self.links.iter(), now_ms) else {
            self.stats.dropped_no_link.fetch_add(1, Ordering::Relaxed);
            warn!("no available links, dropping {} bytes from source", data.len());
            return;
        };
        let Some(link) = self.links.get_mut(chosen) else {
            return;
        };

        match link.send_with_tracking(data, seq, now_ms) {
            Ok(()) => {
                if let Some(seq) = seq {
                    self.index.insert(seq, chosen, now_ms);
                }
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("{} send failed: {}", chosen, e);
                self.stats.dropped_send_failed.fetch_add(1, Ordering::Relaxed);
                self.fail_link(chosen, now_ms);
            }
        }
    }

    /// A frame from the server on one of the links.
    fn on_link_frame(&mut self, from: LinkId, data: &[u8]) {
        let now_ms = self.clock.now_ms();
        let Some(link) = self.links.get_mut(from) else {
            trace!("frame from a removed link, ignoring");
            return;
        };
        link.on_received(now_ms);

        let Some(kind) = packet::classify(data) else {
            trace!("runt datagram on {}, ignoring", from);
            return;
        };

        if self
            .registrar
            .handle_frame(&mut self.links, from, kind, data, now_ms)
        {
            return;
        }

        match kind {
            // Aggregation ACKs are a per-path signal: they credit the link
            // they arrived on and are not forwarded.
            PacketKind::Ack => {
                if let Some(link) = self.links.get_mut(from) {
                    for ack in packet::srtla_ack_numbers(data) {
                        link.handle_ack(ack, now_ms);
                    }
                }
            }
            // SRT ACKs are cumulative for the whole stream: every link
            // clears its in-flight log, and the source gets the original.
            PacketKind::SrtAck => {
                match packet::srt_ack_number(data) {
                    Ok(ack) => {
                        for link in self.links.iter_mut() {
                            link.handle_srt_ack(ack);
                        }
                    }
                    Err(e) => debug!("unparseable SRT ACK on {}: {}", from, e),
                }
                self.forward_to_source(data);
            }
            PacketKind::SrtNak => {
                self.on_srt_nak(from, data, now_ms);
                self.forward_to_source(data);
            }
            PacketKind::Keepalive => match Keepalive::decode(data) {
                Ok(keepalive) => {
                    if let Some(link) = self.links.get_mut(from) {
                        link.record_rtt_sample(keepalive.timestamp_ms, now_ms);
                    }
                }
                Err(e) => debug!("unparseable keepalive on {}: {}", from, e),
            },
            // Anything else the server relays belongs to the source.
            PacketKind::SrtData(_)
            | PacketKind::SrtHandshake
            | PacketKind::SrtShutdown
            | PacketKind::SrtControl(_) => self.forward_to_source(data),
            // Registration frames were consumed above.
            PacketKind::Reg1
            | PacketKind::Reg2
            | PacketKind::Reg3
            | PacketKind::RegErr
            | PacketKind::RegNgp => {}
        }
    }

    /// Charges each NAKed sequence to the link that sent it, falling back
    /// to the link the NAK arrived on when the index has no live entry.
    fn on_srt_nak(&mut self, receiver: LinkId, data: &[u8], now_ms: u64) {
        for seq in packet::nak_sequences(data) {
            let attributed = self
                .index
                .lookup(seq, now_ms)
                .filter(|id| self.links.get(*id).is_some());
            match attributed {
                Some(sender) => {
                    if let Some(link) = self.links.get_mut(sender) {
                        link.handle_nak(seq, now_ms);
                    }
                    self.stats.naks_attributed.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    if let Some(link) = self.links.get_mut(receiver) {
                        link.handle_nak(seq, now_ms);
                    }
                    self.stats.naks_fallback.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn forward_to_source(&self, data: &[u8]) {
        let Some(addr) = self.source_addr else {
            trace!("no source learned yet, dropping server frame");
            return;
        };
        if let Err(e) = self.source.try_send_to(data, addr) {
            debug!("forward to source failed: {}", e);
        }
    }

    fn on_link_closed(&mut self, id: LinkId, error: std::io::Error) {
        let now_ms = self.clock.now_ms();
        if let Some(link) = self.links.get(id) {
            if link.has_socket() {
                warn!("{} read side closed: {}", link, error);
                self.fail_link(id, now_ms);
            }
        }
    }

    fn on_network_event(&mut self, event: NetworkEvent) {
        let now_ms = self.clock.now_ms();
        match event {
            NetworkEvent::Added(handle) => {
                if self.links.by_name(&handle.name).is_none() {
                    info!("network '{}' appeared", handle.name);
                    self.create_link(handle, now_ms);
                }
            }
            NetworkEvent::Removed(name) => {
                info!("network '{}' vanished", name);
                self.reconnect.cancel(&name);
                if let Some(link) = self.links.remove_by_name(&name) {
                    debug!("removed {}", link);
                }
                // Index entries pointing at the removed link resolve to
                // fallback lazily.
            }
        }
    }

    fn fail_link(&mut self, id: LinkId, now_ms: u64) {
        let Some(link) = self.links.get_mut(id) else {
            return;
        };
        link.mark_failed(now_ms);
        let handle = link.handle().clone();
        let due = self.reconnect.schedule(handle, now_ms);
        debug!("{} will retry in {} ms", id, due.saturating_sub(now_ms));
    }

    fn create_link(&mut self, handle: NetworkHandle, now_ms: u64) {
        // A dead predecessor with the same name gives way; its id dies
        // with it and any index entries resolve to fallback.
        if let Some(old) = self.links.remove_by_name(&handle.name) {
            debug!("replacing {}", old);
        }

        let Some(server) = self.resolve_server() else {
            warn!(
                "cannot resolve {}:{}, retrying '{}' later",
                self.cfg.server_host, self.cfg.server_port, handle.name
            );
            self.reconnect.schedule(handle, now_ms);
            return;
        };

        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        let mut link = Link::new(id, handle.clone(), now_ms);
        match link.connect(
            self.provider.as_ref(),
            server,
            self.link_events.clone(),
            now_ms,
        ) {
            Ok(()) => {
                info!("{} up, server {}", link, server);
                self.reconnect.reset(&handle.name);
                self.links.insert(link);
                self.registrar.link_added(&mut self.links, id, now_ms);
            }
            Err(e) => {
                warn!("cannot open link on '{}': {}", handle.name, e);
                self.reconnect.schedule(handle, now_ms);
            }
        }
    }

    /// One DNS resolution per link creation.
    fn resolve_server(&self) -> Option<SocketAddr> {
        (self.cfg.server_host.as_str(), self.cfg.server_port)
            .to_socket_addrs()
            .ok()?
            .next()
    }

    /// Creates links for provider interfaces that have neither a link nor
    /// a scheduled retry.
    fn discover_links(&mut self) {
        let now_ms = self.clock.now_ms();
        for handle in self.provider.interfaces() {
            if self.links.by_name(&handle.name).is_none()
                && !self.reconnect.is_scheduled(&handle.name)
            {
                self.create_link(handle, now_ms);
            }
        }
    }

    fn housekeeping(&mut self) {
        let now_ms = self.clock.now_ms();

        // 1. Registration retries, then keepalives and RTT probes.
        self.registrar.tick(&mut self.links, now_ms);
        self.send_keepalives(now_ms);

        // 2. Quiet-time window recovery.
        for link in self.links.iter_mut() {
            if link.state() == LinkState::Connected {
                link.window_recovery(now_ms);
            }
        }

        // 3. Sequence index upkeep.
        if now_ms.saturating_sub(self.last_sweep_ms) >= INDEX_SWEEP_INTERVAL_MS {
            let removed = self.index.sweep(now_ms);
            if removed > 0 {
                trace!("sequence index dropped {} aged entries", removed);
            }
            self.last_sweep_ms = now_ms;
        }
        if self.index.utilization_pct() > INDEX_WARN_UTILIZATION_PCT {
            warn!(
                "sequence index at {}% of capacity",
                self.index.utilization_pct()
            );
        }

        // 4. Failure detection, then any due reconnects.
        self.detect_failures(now_ms);
        for handle in self.reconnect.due(now_ms) {
            self.create_link(handle, now_ms);
        }

        // 5. Newly available interfaces.
        self.discover_links();

        // 6. Long-dead links with no retry pending are dropped entirely.
        self.purge_links(now_ms);

        self.check_group_down(now_ms);
        self.refresh_status(now_ms);
    }

    fn send_keepalives(&mut self, now_ms: u64) {
        let mut failed = Vec::new();
        let mut buf = BytesMut::new();
        for link in self.links.iter_mut() {
            if link.state() != LinkState::Connected {
                continue;
            }
            if !(link.needs_keepalive(now_ms) || link.needs_rtt_probe(now_ms)) {
                continue;
            }
            buf.clear();
            Keepalive {
                timestamp_ms: now_ms,
            }
            .encode(&mut buf);
            match link.send_control(&buf, now_ms) {
                Ok(()) => link.note_keepalive_sent(now_ms),
                Err(e) => {
                    warn!("{} keepalive failed: {}", link, e);
                    failed.push(link.id());
                }
            }
        }
        for id in failed {
            self.fail_link(id, now_ms);
        }
    }

    fn detect_failures(&mut self, now_ms: u64) {
        let timed_out: Vec<LinkId> = self
            .links
            .iter()
            .filter(|l| l.is_timed_out(now_ms))
            .map(|l| l.id())
            .collect();
        for id in timed_out {
            if let Some(link) = self.links.get(id) {
                warn!(
                    "{} timed out (nothing received for {} ms)",
                    link, CONN_TIMEOUT_MS
                );
            }
            self.fail_link(id, now_ms);
        }

        // A link can end up Failed with its retry cancelled (interface
        // removed and re-added); make sure something is queued.
        let unscheduled: Vec<NetworkHandle> = self
            .links
            .iter()
            .filter(|l| l.state() == LinkState::Failed && !self.reconnect.is_scheduled(l.name()))
            .map(|l| l.handle().clone())
            .collect();
        for handle in unscheduled {
            self.reconnect.schedule(handle, now_ms);
        }
    }

    fn purge_links(&mut self, now_ms: u64) {
        let reconnect = &self.reconnect;
        self.links.retain(|link| {
            let dead = matches!(link.state(), LinkState::Failed | LinkState::Disconnected)
                && link.state_age_ms(now_ms) >= LINK_PURGE_AFTER_MS
                && !reconnect.is_scheduled(link.name());
            if dead {
                info!("purging {}", link);
            }
            !dead
        });
    }

    fn check_group_down(&mut self, now_ms: u64) {
        if self.links.connected_count() > 0 {
            self.last_any_connected_ms = now_ms;
            self.group_down_logged = false;
            return;
        }
        if self.registrar.established_ever()
            && now_ms.saturating_sub(self.last_any_connected_ms) > GROUP_DOWN_TIMEOUT_MS
            && !self.group_down_logged
        {
            error!(
                "all links down for more than {} s; still retrying",
                GROUP_DOWN_TIMEOUT_MS / 1000
            );
            self.group_down_logged = true;
        }
    }

    fn refresh_status(&mut self, now_ms: u64) {
        for link in self.links.iter() {
            self.status.insert(link.name().to_string(), link.status(now_ms));
        }
        self.status
            .retain(|name, _| self.links.by_name(name).is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::congestion::{WINDOW_DECR, WINDOW_DEF, WINDOW_MULT};
    use crate::link::testutil::handle;
    use crate::netif::{StaticProvider, TransportKind};
    use braid_proto::reg::{GROUP_ID_LEN, Reg1, Reg2};
    use bytes::BufMut;
    use std::io;
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    fn data_packet(seq: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(seq);
        buf.put_slice(b"payload");
        buf.to_vec()
    }

    fn nak_packet(seqs: &[u32]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(0x8003);
        buf.put_u16(0);
        buf.put_bytes(0, 12);
        for seq in seqs {
            buf.put_u32(*seq);
        }
        buf.to_vec()
    }

    fn srt_ack_packet(ack: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(0x8002);
        buf.put_u16(0);
        buf.put_bytes(0, 12);
        buf.put_u32(ack);
        buf.to_vec()
    }

    struct TestBed {
        engine: Engine,
        _link_rx: mpsc::Receiver<LinkEvent>,
        clock: Arc<ManualClock>,
        // Kept alive so the link sockets stay connected to something.
        _server: StdUdpSocket,
    }

    async fn testbed() -> TestBed {
        let server = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(StdDuration::from_secs(1)))
            .unwrap();
        let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let cfg = SessionConfig {
            server_host: "127.0.0.1".into(),
            server_port: server.local_addr().unwrap().port(),
            local_port: 0,
            selector: SelectorConfig::default(),
        };
        let provider: Arc<dyn InterfaceProvider> = Arc::new(StaticProvider::new(vec![]));
        let stats = Arc::new(SessionStats::default());
        let status: StatusBoard = Arc::new(DashMap::new());
        let (engine, link_rx) = Engine::new(cfg, provider, clock.clone(), source, stats, status);
        TestBed {
            engine,
            _link_rx: link_rx,
            clock,
            _server: server,
        }
    }

    /// Creates a link on the engine and forces it straight to Connected,
    /// skipping the handshake.
    fn add_connected_link(bed: &mut TestBed, name: &str, kind: TransportKind) -> LinkId {
        let now = bed.clock.now_ms();
        bed.engine.create_link(handle(name, kind), now);
        let id = bed.engine.links.by_name(name).unwrap().id();
        bed.engine
            .links
            .get_mut(id)
            .unwrap()
            .set_state(LinkState::Connected, now);
        id
    }

    #[tokio::test]
    async fn nak_is_charged_to_the_sending_link() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);
        let cell = add_connected_link(&mut bed, "rmnet0", TransportKind::Cellular);

        // Sequence 37 left on wifi.
        bed.engine
            .links
            .get_mut(wifi)
            .unwrap()
            .send_with_tracking(&data_packet(37), Some(37), 0)
            .unwrap();
        bed.engine.index.insert(37, wifi, 0);

        // 200 ms later the NAK lands on cellular.
        bed.clock.set(200);
        bed.engine.on_link_frame(cell, &nak_packet(&[37]));

        let wifi_window = bed.engine.links.get(wifi).unwrap().congestion().get();
        let cell_window = bed.engine.links.get(cell).unwrap().congestion().get();
        assert_eq!(wifi_window, WINDOW_DEF * WINDOW_MULT - WINDOW_DECR);
        assert_eq!(cell_window, WINDOW_DEF * WINDOW_MULT);
        assert_eq!(bed.engine.stats.naks_attributed(), 1);
        assert_eq!(bed.engine.stats.naks_fallback(), 0);
    }

    #[tokio::test]
    async fn expired_index_entry_falls_back_to_the_receiver() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);
        let cell = add_connected_link(&mut bed, "rmnet0", TransportKind::Cellular);

        bed.engine
            .links
            .get_mut(wifi)
            .unwrap()
            .send_with_tracking(&data_packet(37), Some(37), 0)
            .unwrap();
        bed.engine.index.insert(37, wifi, 0);

        // Past the age cap the entry is gone; the receiving link takes the
        // charge, and since it never sent 37 its window is untouched.
        bed.clock.set(6_000);
        bed.engine.on_link_frame(cell, &nak_packet(&[37]));

        assert_eq!(bed.engine.stats.naks_fallback(), 1);
        assert_eq!(bed.engine.stats.naks_attributed(), 0);
        assert_eq!(
            bed.engine.links.get(cell).unwrap().congestion().get(),
            WINDOW_DEF * WINDOW_MULT
        );
        // The true sender escaped: misattribution is the accepted cost of
        // the bounded index.
        assert_eq!(
            bed.engine.links.get(wifi).unwrap().congestion().get(),
            WINDOW_DEF * WINDOW_MULT
        );
    }

    #[tokio::test]
    async fn srt_ack_fans_out_to_every_link() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);
        let cell = add_connected_link(&mut bed, "rmnet0", TransportKind::Cellular);

        for (link, seq) in [(wifi, 3u32), (cell, 4), (wifi, 5), (cell, 6)] {
            bed.engine
                .links
                .get_mut(link)
                .unwrap()
                .send_with_tracking(&data_packet(seq), Some(seq), 0)
                .unwrap();
        }

        bed.clock.set(100);
        bed.engine.on_link_frame(wifi, &srt_ack_packet(5));

        assert_eq!(bed.engine.links.get(wifi).unwrap().in_flight_len(), 0);
        assert_eq!(bed.engine.links.get(cell).unwrap().in_flight_len(), 1);
    }

    #[tokio::test]
    async fn source_packets_are_tracked_and_index_stays_bounded() {
        let mut bed = testbed().await;
        bed.engine.index = SequenceIndex::with_limits(100, 5_000);
        let link = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);

        let source_peer: SocketAddr = "127.0.0.1:49000".parse().unwrap();
        for seq in 0..200u32 {
            bed.engine.on_source_packet(&data_packet(seq), source_peer);
        }

        assert_eq!(bed.engine.stats.forwarded(), 200);
        assert_eq!(bed.engine.index.len(), 100);
        let now = bed.clock.now_ms();
        assert_eq!(bed.engine.index.lookup(99, now), None);
        for seq in 100..200u32 {
            assert_eq!(bed.engine.index.lookup(seq, now), Some(link));
        }
    }

    #[tokio::test]
    async fn no_links_means_counted_drops_not_crashes() {
        let mut bed = testbed().await;
        let source_peer: SocketAddr = "127.0.0.1:49000".parse().unwrap();
        for seq in 0..5u32 {
            bed.engine.on_source_packet(&data_packet(seq), source_peer);
        }
        assert_eq!(bed.engine.stats.dropped_no_link(), 5);
        assert_eq!(bed.engine.stats.forwarded(), 0);
    }

    #[tokio::test]
    async fn keepalive_echo_updates_rtt() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);

        let mut buf = BytesMut::new();
        Keepalive { timestamp_ms: 100 }.encode(&mut buf);
        bed.clock.set(180);
        bed.engine.on_link_frame(wifi, &buf);

        assert_eq!(bed.engine.links.get(wifi).unwrap().rtt_ms(), Some(80.0));
    }

    #[tokio::test]
    async fn srtla_ack_credits_only_the_receiving_link() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);
        let cell = add_connected_link(&mut bed, "rmnet0", TransportKind::Cellular);

        for seq in [3u32, 4] {
            bed.engine
                .links
                .get_mut(wifi)
                .unwrap()
                .send_with_tracking(&data_packet(seq), Some(seq), 0)
                .unwrap();
            bed.engine
                .links
                .get_mut(cell)
                .unwrap()
                .send_with_tracking(&data_packet(seq), Some(seq), 0)
                .unwrap();
        }

        let mut ack = BytesMut::new();
        braid_proto::packet::encode_srtla_ack(&[3, 4], &mut ack);
        bed.clock.set(100);
        bed.engine.on_link_frame(wifi, &ack);

        // Exact-match removal on the receiving link only; the other link's
        // log is untouched, and nothing was forwarded anywhere.
        assert_eq!(bed.engine.links.get(wifi).unwrap().in_flight_len(), 0);
        assert_eq!(bed.engine.links.get(cell).unwrap().in_flight_len(), 2);
        assert_eq!(
            bed.engine.links.get(wifi).unwrap().congestion().ack_count(),
            2
        );
    }

    #[tokio::test]
    async fn silent_connected_link_is_timed_out_and_rescheduled() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);

        bed.clock.set(CONN_TIMEOUT_MS + 1_000);
        bed.engine.housekeeping();

        let link = bed.engine.links.get(wifi).unwrap();
        assert_eq!(link.state(), LinkState::Failed);
        assert!(!link.has_socket());
        assert!(bed.engine.reconnect.is_scheduled("wlan0"));
    }

    #[tokio::test]
    async fn long_dead_links_are_purged() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);

        bed.engine.links.get_mut(wifi).unwrap().mark_failed(0);
        bed.engine.reconnect.cancel("wlan0");

        // Provider knows nothing, so discovery will not resurrect it.
        bed.clock.set(LINK_PURGE_AFTER_MS + 1_000);
        bed.engine.purge_links(bed.clock.now_ms());
        assert!(bed.engine.links.by_name("wlan0").is_none());
    }

    #[tokio::test]
    async fn network_events_create_and_remove_links() {
        let mut bed = testbed().await;

        bed.engine
            .on_network_event(NetworkEvent::Added(handle("wlan0", TransportKind::Wifi)));
        assert!(bed.engine.links.by_name("wlan0").is_some());

        bed.engine
            .on_network_event(NetworkEvent::Removed("wlan0".to_string()));
        assert!(bed.engine.links.by_name("wlan0").is_none());
        assert!(!bed.engine.reconnect.is_scheduled("wlan0"));
    }

    #[tokio::test]
    async fn status_board_follows_the_link_set() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);
        bed.engine.refresh_status(0);

        let snapshot = bed.engine.status.get("wlan0").unwrap().value().clone();
        assert_eq!(snapshot.state, LinkState::Connected);
        assert_eq!(snapshot.kind, TransportKind::Wifi);
        assert!(snapshot.score > 0);

        let _ = wifi;
        bed.engine.links.remove_by_name("wlan0");
        bed.engine.refresh_status(100);
        assert!(bed.engine.status.get("wlan0").is_none());
    }

    struct FailingProvider;

    impl InterfaceProvider for FailingProvider {
        fn interfaces(&self) -> Vec<NetworkHandle> {
            vec![handle("wlan0", TransportKind::Wifi)]
        }

        fn open_socket(
            &self,
            _handle: &NetworkHandle,
            _server: SocketAddr,
        ) -> io::Result<StdUdpSocket> {
            Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no carrier"))
        }
    }

    #[tokio::test]
    async fn repeated_bind_failures_grow_the_backoff() {
        let mut bed = testbed().await;
        bed.engine.provider = Arc::new(FailingProvider);

        bed.engine.discover_links();
        assert!(bed.engine.reconnect.is_scheduled("wlan0"));
        assert_eq!(bed.engine.reconnect.current_delay_ms("wlan0"), 10_000);

        // First retry fires at t=5s, fails again, and doubles the delay.
        bed.clock.set(5_000);
        bed.engine.housekeeping();
        assert_eq!(bed.engine.reconnect.current_delay_ms("wlan0"), 20_000);
        assert!(bed.engine.reconnect.is_scheduled("wlan0"));
    }

    #[tokio::test]
    async fn send_failure_fails_the_link_and_schedules_retry() {
        let mut bed = testbed().await;
        let wifi = add_connected_link(&mut bed, "wlan0", TransportKind::Wifi);

        // Yank the socket out from under the engine.
        bed.engine.links.get_mut(wifi).unwrap().mark_failed(0);
        bed.engine
            .links
            .get_mut(wifi)
            .unwrap()
            .set_state(LinkState::Connected, 0);

        let source_peer: SocketAddr = "127.0.0.1:49000".parse().unwrap();
        bed.engine.on_source_packet(&data_packet(1), source_peer);

        assert_eq!(bed.engine.stats.dropped_send_failed(), 1);
        assert_eq!(
            bed.engine.links.get(wifi).unwrap().state(),
            LinkState::Failed
        );
        assert!(bed.engine.reconnect.is_scheduled("wlan0"));
    }

    // Full-stack run: two loopback links, a scripted server, registration,
    // relay in both directions, orderly stop.
    #[tokio::test]
    async fn session_end_to_end() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let provider = Arc::new(StaticProvider::new(vec![
            handle("wlan0", TransportKind::Wifi),
            handle("rmnet0", TransportKind::Cellular),
        ]));
        let cfg = SessionConfig {
            server_host: "127.0.0.1".into(),
            server_port: server_addr.port(),
            local_port: 0,
            selector: SelectorConfig::default(),
        };
        let (_net_tx, net_rx) = mpsc::channel(8);
        let session = Session::start(
            cfg,
            provider,
            Arc::new(crate::clock::SystemClock::new()),
            net_rx,
        )
        .await
        .unwrap();

        // Scripted server: answer REG1 with a completed REG2, answer every
        // REG2 with REG3, until both links are up.
        let mut buf = [0u8; 2048];
        let mut connected = std::collections::HashSet::new();
        while connected.len() < 2 {
            let (len, from) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
                .await
                .expect("registration stalled")
                .unwrap();
            match packet::classify(&buf[..len]) {
                Some(PacketKind::Reg1) => {
                    let reg1 = Reg1::decode(&buf[..len]).unwrap();
                    let mut id = reg1.id;
                    for b in &mut id[GROUP_ID_LEN / 2..] {
                        *b = 0xee;
                    }
                    let mut reply = BytesMut::new();
                    Reg2 { id }.encode(&mut reply);
                    server.send_to(&reply, from).await.unwrap();
                }
                Some(PacketKind::Reg2) => {
                    server.send_to(&[0x92, 0x02], from).await.unwrap();
                    connected.insert(from);
                }
                _ => {}
            }
        }

        // Both links report Connected within a couple of housekeeping
        // ticks.
        let status = session.status();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let up = status
                .iter()
                .filter(|entry| entry.value().state == LinkState::Connected)
                .count();
            if up == 2 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "links never reached Connected"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Source -> server relay. The endpoint is bound on all interfaces;
        // talk to it over loopback.
        let session_port = session.local_addr().port();
        let session_target: SocketAddr = format!("127.0.0.1:{}", session_port).parse().unwrap();
        let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        source.send_to(&data_packet(5), session_target).await.unwrap();
        let relayed = loop {
            let (len, from) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
                .await
                .expect("relay stalled")
                .unwrap();
            // Keepalives may interleave; wait for the data packet.
            if packet::classify(&buf[..len]) == Some(PacketKind::SrtData(5)) {
                break (buf[..len].to_vec(), from);
            }
        };
        assert_eq!(relayed.0, data_packet(5));

        // Server -> source relay: an SRT ACK comes back verbatim.
        server.send_to(&srt_ack_packet(6), relayed.1).await.unwrap();
        let mut ack_buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(5), source.recv_from(&mut ack_buf))
            .await
            .expect("reverse relay stalled")
            .unwrap();
        assert_eq!(&ack_buf[..len], srt_ack_packet(6).as_slice());

        assert_eq!(session.stats().forwarded(), 1);
        session.stop().await;
    }
}
