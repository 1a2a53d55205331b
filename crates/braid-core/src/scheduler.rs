//! Picks which link carries each outgoing source packet.
//!
//! Ranking starts from the congestion score (window over outstanding
//! load) and, unless classic mode is on, layers transport priority,
//! loss-recency quality penalties, switch stickiness, and a deterministic
//! exploration slot on top. The selector runs on the session task and sees
//! a consistent snapshot of every link.

use crate::congestion::WINDOW_MULT;
use crate::link::{Link, LinkId};

/// Scaled window bounds between which transport priority phases in: no
/// effect at or below the low bound, full effect at or above the high one.
const STABLE_MIN: u64 = 10 * WINDOW_MULT;
const STABLE_MAX: u64 = 30 * WINDOW_MULT;

/// Exploration runs in one slot out of every ten; slots are 5 s wide.
const EXPLORATION_SLOT_MS: u64 = 5_000;
const EXPLORATION_CYCLE: u64 = 10;

pub const DEFAULT_MIN_SWITCH_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub stickiness: bool,
    pub quality: bool,
    pub priority: bool,
    pub exploration: bool,
    /// Base score only; bypasses every other ranking step.
    pub classic: bool,
    pub min_switch_interval_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            stickiness: true,
            quality: true,
            priority: true,
            exploration: true,
            classic: false,
            min_switch_interval_ms: DEFAULT_MIN_SWITCH_INTERVAL_MS,
        }
    }
}

#[derive(Debug)]
struct Candidate {
    id: LinkId,
    score: f64,
    rank: u8,
    pos: usize,
}

pub struct Selector {
    cfg: SelectorConfig,
    last_pick: Option<LinkId>,
    last_switch_ms: Option<u64>,
}

impl Selector {
    pub fn new(cfg: SelectorConfig) -> Self {
        Self {
            cfg,
            last_pick: None,
            last_switch_ms: None,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.cfg
    }

    /// Ranks the eligible links and returns the one to send on, or `None`
    /// when nothing is Connected and alive.
    pub fn pick<'a, I>(&mut self, links: I, now_ms: u64) -> Option<LinkId>
    where
        I: Iterator<Item = &'a Link>,
    {
        let mut candidates: Vec<Candidate> = Vec::new();
        for (pos, link) in links.enumerate() {
            let base = link.score(now_ms);
            if base == 0 {
                continue;
            }
            candidates.push(Candidate {
                id: link.id(),
                score: self.full_score(link, base, now_ms),
                rank: link.kind().rank(),
                pos,
            });
        }

        if candidates.is_empty() {
            self.last_pick = None;
            return None;
        }

        // Stickiness: inside the minimum switch interval, keep the previous
        // link as long as it is still eligible.
        if self.cfg.stickiness && !self.cfg.classic {
            if let (Some(prev), Some(at)) = (self.last_pick, self.last_switch_ms) {
                if now_ms.saturating_sub(at) < self.cfg.min_switch_interval_ms
                    && candidates.iter().any(|c| c.id == prev)
                {
                    return Some(prev);
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.rank.cmp(&b.rank))
                .then(a.pos.cmp(&b.pos))
        });

        // Exploration: in the designated slot, give the runner-up traffic
        // so its quality stays measured. Pointless with a single candidate.
        let explore = self.cfg.exploration
            && !self.cfg.classic
            && candidates.len() >= 2
            && (now_ms / EXPLORATION_SLOT_MS) % EXPLORATION_CYCLE == 0;
        let chosen = if explore {
            candidates[1].id
        } else {
            candidates[0].id
        };

        if self.last_pick != Some(chosen) {
            self.last_switch_ms = Some(now_ms);
        }
        self.last_pick = Some(chosen);
        Some(chosen)
    }

    fn full_score(&self, link: &Link, base: u64, now_ms: u64) -> f64 {
        let mut score = base as f64;
        if self.cfg.classic {
            return score;
        }
        if self.cfg.priority {
            score *= phased_weight(link);
        }
        if self.cfg.quality {
            score *= quality_factor(link, now_ms);
        }
        score
    }
}

/// Transport weight, phased in linearly with window size so a shaky link
/// does not get a priority boost it has not earned.
fn phased_weight(link: &Link) -> f64 {
    let weight = link.kind().priority_weight();
    let window = link.congestion().get();
    let phase = if window <= STABLE_MIN {
        0.0
    } else if window >= STABLE_MAX {
        1.0
    } else {
        (window - STABLE_MIN) as f64 / (STABLE_MAX - STABLE_MIN) as f64
    };
    1.0 + (weight - 1.0) * phase
}

/// Loss-recency penalty: fresh NAKs weigh hard, a spotless history earns a
/// small bonus, and a burst halves whatever is left.
fn quality_factor(link: &Link, now_ms: u64) -> f64 {
    let window = link.congestion();
    let mut factor = match window.time_since_nak(now_ms) {
        None => 1.1,
        Some(t) if t < 2_000 => 0.3,
        Some(t) if t < 5_000 => 0.6,
        Some(t) if t < 10_000 => 0.85,
        Some(_) => 1.0,
    };
    if window.nak_burst(now_ms) {
        factor /= 2.0;
    }
    factor
}
