//! Group registration: the REG1 → REG2 → REG3 exchange that makes the
//! server treat every link as one bonded session.
//!
//! One link at a time is elected to carry REG1. The server answers REG2
//! with the completed group id (our first half, its second half); we adopt
//! it, broadcast REG2 on every link, and each link is individually
//! promoted by its own REG3. Timers reset the affected links and the
//! housekeeping tick retries.

use bytes::BytesMut;
use log::{debug, error, info, trace, warn};
use rand::RngCore;

use braid_proto::PacketKind;
use braid_proto::reg::{GROUP_ID_LEN, Reg1, Reg2};

use crate::link::{LinkId, LinkSet, LinkState};

/// REG2 and REG3 answer deadline, and the minimum spacing between REG1
/// elections.
pub const REG_TIMEOUT_MS: u64 = 4_000;

/// Group-level handshake state. Per-link progress lives on the links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    AwaitingReg2 { pending: LinkId, deadline_ms: u64 },
    AwaitingReg3 { deadline_ms: u64 },
    Established,
}

pub struct Registrar {
    group_id: [u8; GROUP_ID_LEN],
    state: GroupState,
    last_reg1_ms: Option<u64>,
    established_ever: bool,
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}

fn short_id(id: &[u8]) -> String {
    hex::encode(&id[..8])
}

impl Registrar {
    /// Fresh registrar with a randomly generated group id.
    pub fn new() -> Self {
        let mut group_id = [0u8; GROUP_ID_LEN];
        rand::rng().fill_bytes(&mut group_id);
        Self::with_id(group_id)
    }

    /// Registrar with a caller-chosen id; tests use this for determinism.
    pub fn with_id(group_id: [u8; GROUP_ID_LEN]) -> Self {
        Self {
            group_id,
            state: GroupState::Idle,
            last_reg1_ms: None,
            established_ever: false,
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, GroupState::Established)
    }

    /// Whether the group has ever been operationally up. Gates the
    /// catastrophic all-links-down diagnostic.
    pub fn established_ever(&self) -> bool {
        self.established_ever
    }

    pub fn group_id(&self) -> &[u8; GROUP_ID_LEN] {
        &self.group_id
    }

    /// Gives the coordinator first claim on a link frame. Returns true when
    /// the frame was registration traffic and is fully handled.
    pub fn handle_frame(
        &mut self,
        links: &mut LinkSet,
        from: LinkId,
        kind: PacketKind,
        buf: &[u8],
        now_ms: u64,
    ) -> bool {
        match kind {
            PacketKind::RegNgp => {
                self.on_ngp(links, from, now_ms);
                true
            }
            PacketKind::Reg2 => {
                self.on_reg2(links, from, buf, now_ms);
                true
            }
            PacketKind::Reg3 => {
                self.on_reg3(links, from, now_ms);
                true
            }
            PacketKind::RegErr => {
                self.on_reg_err(links, from, now_ms);
                true
            }
            // The server never originates REG1; swallow strays rather than
            // forwarding them to the source.
            PacketKind::Reg1 => {
                debug!("ignoring unexpected REG1 from server on {}", from);
                true
            }
            _ => false,
        }
    }

    /// Called when a link has just opened its socket: under an established
    /// (or establishing) group it can go straight to REG2.
    pub fn link_added(&mut self, links: &mut LinkSet, id: LinkId, now_ms: u64) {
        match self.state {
            GroupState::Established | GroupState::AwaitingReg3 { .. } => {
                self.send_reg2_on(links, id, now_ms);
            }
            // Otherwise the next housekeeping tick elects a pending link.
            _ => {}
        }
    }

    /// Housekeeping hook: elections, timeouts, and re-sends.
    pub fn tick(&mut self, links: &mut LinkSet, now_ms: u64) {
        match self.state {
            GroupState::Idle => self.try_elect(links, now_ms),
            GroupState::AwaitingReg2 {
                pending,
                deadline_ms,
            } => {
                if now_ms >= deadline_ms {
                    warn!("REG2 timed out on {}", pending);
                    if let Some(link) = links.get_mut(pending) {
                        link.set_state(LinkState::Disconnected, now_ms);
                    }
                    self.state = GroupState::Idle;
                    self.try_elect(links, now_ms);
                }
            }
            GroupState::AwaitingReg3 { deadline_ms } => {
                if now_ms >= deadline_ms {
                    if links.connected_count() > 0 {
                        // Some links made it; stragglers are re-sent REG2
                        // from the Established arm below.
                        self.state = GroupState::Established;
                    } else {
                        warn!("REG3 timed out, restarting registration");
                        for link in links.iter_mut() {
                            if link.state() == LinkState::AwaitingReg3 {
                                link.set_state(LinkState::Disconnected, now_ms);
                            }
                        }
                        self.state = GroupState::Idle;
                        self.try_elect(links, now_ms);
                    }
                }
            }
            GroupState::Established => {
                let lagging: Vec<LinkId> = links
                    .iter()
                    .filter(|l| {
                        l.has_socket()
                            && match l.state() {
                                LinkState::Disconnected | LinkState::AwaitingReg2 => true,
                                LinkState::AwaitingReg3 => {
                                    l.state_age_ms(now_ms) >= REG_TIMEOUT_MS
                                }
                                _ => false,
                            }
                    })
                    .map(|l| l.id())
                    .collect();
                for id in lagging {
                    self.send_reg2_on(links, id, now_ms);
                }
            }
        }
    }

    /// Picks the first registrable link and opens the handshake on it.
    fn try_elect(&mut self, links: &mut LinkSet, now_ms: u64) {
        let spaced_out = self
            .last_reg1_ms
            .is_none_or(|t| now_ms.saturating_sub(t) >= REG_TIMEOUT_MS);
        if !spaced_out {
            return;
        }
        let candidate = links
            .iter()
            .find(|l| {
                l.has_socket()
                    && matches!(
                        l.state(),
                        LinkState::AwaitingReg2 | LinkState::Disconnected
                    )
            })
            .map(|l| l.id());
        if let Some(id) = candidate {
            self.send_reg1(links, id, now_ms);
        }
    }

    fn send_reg1(&mut self, links: &mut LinkSet, on: LinkId, now_ms: u64) {
        let Some(link) = links.get_mut(on) else {
            return;
        };
        let mut buf = BytesMut::new();
        Reg1 { id: self.group_id }.encode(&mut buf);
        match link.send_control(&buf, now_ms) {
            Ok(()) => {
                info!("{}: sent REG1 for group {}", link, short_id(&self.group_id));
                link.set_state(LinkState::AwaitingReg2, now_ms);
                self.state = GroupState::AwaitingReg2 {
                    pending: on,
                    deadline_ms: now_ms + REG_TIMEOUT_MS,
                };
                self.last_reg1_ms = Some(now_ms);
            }
            Err(e) => {
                warn!("{}: REG1 send failed: {}", link, e);
                link.mark_failed(now_ms);
            }
        }
    }

    fn on_ngp(&mut self, links: &mut LinkSet, from: LinkId, now_ms: u64) {
        let none_connected = links
            .iter()
            .all(|l| l.state() != LinkState::Connected);
        let no_pending = !matches!(self.state, GroupState::AwaitingReg2 { .. });
        let spaced_out = self
            .last_reg1_ms
            .is_none_or(|t| now_ms.saturating_sub(t) >= REG_TIMEOUT_MS);

        if none_connected && no_pending && spaced_out {
            info!("server does not know the group, re-registering via {}", from);
            self.send_reg1(links, from, now_ms);
        } else {
            debug!("ignoring REG_NGP on {}", from);
        }
    }

    fn on_reg2(&mut self, links: &mut LinkSet, from: LinkId, buf: &[u8], now_ms: u64) {
        let GroupState::AwaitingReg2 { pending, .. } = self.state else {
            debug!("REG2 on {} while none is pending, discarding", from);
            return;
        };
        if pending != from {
            debug!("REG2 on {} but {} is pending, discarding", from, pending);
            return;
        }

        let reg2 = match Reg2::decode(buf) {
            Ok(reg2) => reg2,
            Err(e) => {
                if let Some(link) = links.get_mut(from) {
                    warn!("{}: malformed REG2 ({}), failing link", link, e);
                    link.mark_failed(now_ms);
                }
                self.state = GroupState::Idle;
                return;
            }
        };

        let half = GROUP_ID_LEN / 2;
        if reg2.id[..half] != self.group_id[..half] {
            warn!(
                "REG2 group id mismatch: ours {}, server {}; discarding",
                short_id(&self.group_id),
                short_id(&reg2.id)
            );
            return;
        }

        self.group_id = reg2.id;
        info!("group id confirmed ({}), broadcasting REG2", short_id(&self.group_id));
        self.broadcast_reg2(links, now_ms);
        self.state = GroupState::AwaitingReg3 {
            deadline_ms: now_ms + REG_TIMEOUT_MS,
        };
    }

    /// Sends the completed REG2 on every link that owns a socket and is
    /// not already Connected.
    fn broadcast_reg2(&mut self, links: &mut LinkSet, now_ms: u64) {
        let mut buf = BytesMut::new();
        Reg2 { id: self.group_id }.encode(&mut buf);
        for link in links.iter_mut() {
            if !link.has_socket() || link.state() == LinkState::Connected {
                continue;
            }
            match link.send_control(&buf, now_ms) {
                Ok(()) => link.set_state(LinkState::AwaitingReg3, now_ms),
                Err(e) => {
                    warn!("{}: REG2 send failed: {}", link, e);
                    link.mark_failed(now_ms);
                }
            }
        }
    }

    fn send_reg2_on(&mut self, links: &mut LinkSet, id: LinkId, now_ms: u64) {
        let Some(link) = links.get_mut(id) else {
            return;
        };
        if !link.has_socket() || link.state() == LinkState::Connected {
            return;
        }
        let mut buf = BytesMut::new();
        Reg2 { id: self.group_id }.encode(&mut buf);
        match link.send_control(&buf, now_ms) {
            Ok(()) => {
                debug!("{}: sent REG2", link);
                link.set_state(LinkState::AwaitingReg3, now_ms);
            }
            Err(e) => {
                warn!("{}: REG2 send failed: {}", link, e);
                link.mark_failed(now_ms);
            }
        }
    }

    fn on_reg3(&mut self, links: &mut LinkSet, from: LinkId, now_ms: u64) {
        let Some(link) = links.get_mut(from) else {
            return;
        };
        if link.state() == LinkState::Connected {
            trace!("duplicate REG3 on {}", link);
            return;
        }
        link.set_state(LinkState::Connected, now_ms);
        self.state = GroupState::Established;
        self.established_ever = true;
        info!(
            "link {} registered ({} active)",
            from,
            links.connected_count()
        );
    }

    fn on_reg_err(&mut self, links: &mut LinkSet, from: LinkId, now_ms: u64) {
        if let Some(link) = links.get_mut(from) {
            error!("{}: registration rejected by server", link);
            link.mark_failed(now_ms);
        }
        if let GroupState::AwaitingReg2 { pending, .. } = self.state {
            if pending == from {
                self.state = GroupState::Idle;
            }
        }
    }
}
