//! Per-link congestion window.
//!
//! The window is a scaled integer: bounds and steps are expressed in
//! packets times [`WINDOW_MULT`], so a single NAK moves the budget by a
//! fraction of a packet. Shrinkage is immediate and multiplicative-ish
//! (fixed step per NAK); growth is additive and throttled three ways, plus
//! a time-based recovery path that un-sticks a link which was charged a
//! NAK it did not deserve and then went quiet.

/// Window bounds and steps, in packets before scaling.
pub const WINDOW_MIN: u64 = 1;
pub const WINDOW_DEF: u64 = 20;
pub const WINDOW_MAX: u64 = 60;
/// Scale factor applied to the stored window.
pub const WINDOW_MULT: u64 = 1000;
/// Scaled growth step per eligible ACK.
pub const WINDOW_INCR: u64 = 30;
/// Scaled shrink step per NAK.
pub const WINDOW_DECR: u64 = 100;

/// Minimum spacing between growth steps.
const GROWTH_COOLDOWN_MS: u64 = 200;
/// The link must be driving its window this hard before growth is allowed.
const GROWTH_UTILIZATION_PCT: u64 = 85;
const FAST_GROWTH_UTILIZATION_PCT: u64 = 95;
/// Consecutive NAK-free ACKs required before growth resumes after a NAK.
const GROWTH_ACK_RUN: u32 = 4;
const FAST_GROWTH_ACK_RUN: u32 = 2;

/// Fast-recovery watermarks (scaled). Entered at or below the low mark,
/// left once the window climbs past the high mark.
const FAST_RECOVERY_ENTER: u64 = 2 * WINDOW_MULT;
const FAST_RECOVERY_EXIT: u64 = 12 * WINDOW_MULT;

/// Quiet-time tiers for housekeeping recovery: after this many
/// milliseconds without a NAK, grant this many `WINDOW_INCR` steps per
/// tick. Checked in order, first match wins.
const RECOVERY_TIERS: [(u64, u64); 3] = [(10_000, 3), (7_000, 2), (5_000, 1)];

/// Two NAKs this close together count as a burst for quality scoring.
const NAK_BURST_WINDOW_MS: u64 = 1_000;
/// A burst stops mattering once the latest NAK is this old.
const NAK_BURST_RELEVANT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct CongestionWindow {
    window: u64,
    fast_recovery: bool,
    last_growth_ms: Option<u64>,
    nak_free_run: u32,
    last_nak_ms: Option<u64>,
    prev_nak_ms: Option<u64>,
    nak_count: u64,
    ack_count: u64,
}

impl Default for CongestionWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionWindow {
    pub fn new() -> Self {
        Self {
            window: WINDOW_DEF * WINDOW_MULT,
            fast_recovery: false,
            last_growth_ms: None,
            nak_free_run: 0,
            last_nak_ms: None,
            prev_nak_ms: None,
            nak_count: 0,
            ack_count: 0,
        }
    }

    /// Current scaled window.
    pub fn get(&self) -> u64 {
        self.window
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.fast_recovery
    }

    pub fn nak_count(&self) -> u64 {
        self.nak_count
    }

    pub fn ack_count(&self) -> u64 {
        self.ack_count
    }

    /// Milliseconds since the last NAK; `None` if this window never saw one.
    pub fn time_since_nak(&self, now_ms: u64) -> Option<u64> {
        self.last_nak_ms.map(|t| now_ms.saturating_sub(t))
    }

    /// True while the two most recent NAKs arrived within a burst window of
    /// each other and the later one is still fresh.
    pub fn nak_burst(&self, now_ms: u64) -> bool {
        match (self.prev_nak_ms, self.last_nak_ms) {
            (Some(prev), Some(last)) => {
                last.saturating_sub(prev) <= NAK_BURST_WINDOW_MS
                    && now_ms.saturating_sub(last) <= NAK_BURST_RELEVANT_MS
            }
            _ => false,
        }
    }

    /// Send-budget score: window over outstanding load.
    pub fn score(&self, in_flight: usize) -> u64 {
        self.window / (in_flight as u64 + 1)
    }

    /// Accounts an aggregation-channel ACK and attempts one growth step.
    ///
    /// Growth requires the cooldown to have elapsed, enough consecutive
    /// NAK-free ACKs since the last NAK, and the window to be running at
    /// high utilization (`in_flight` is the post-ACK outstanding count).
    pub fn on_ack(&mut self, now_ms: u64, in_flight: usize) {
        self.ack_count += 1;
        self.nak_free_run = self.nak_free_run.saturating_add(1);

        if let Some(last) = self.last_growth_ms {
            if now_ms.saturating_sub(last) < GROWTH_COOLDOWN_MS {
                return;
            }
        }

        let (needed_run, needed_pct) = if self.fast_recovery {
            (FAST_GROWTH_ACK_RUN, FAST_GROWTH_UTILIZATION_PCT)
        } else {
            (GROWTH_ACK_RUN, GROWTH_UTILIZATION_PCT)
        };

        if self.nak_free_run < needed_run {
            return;
        }
        if (in_flight as u64) * WINDOW_MULT * 100 < self.window * needed_pct {
            return;
        }

        self.grow(WINDOW_INCR);
        self.last_growth_ms = Some(now_ms);
    }

    /// Accounts a NAK charged to this link.
    pub fn on_nak(&mut self, now_ms: u64) {
        self.nak_count += 1;
        self.nak_free_run = 0;
        self.prev_nak_ms = self.last_nak_ms;
        self.last_nak_ms = Some(now_ms);

        self.window = self
            .window
            .saturating_sub(WINDOW_DECR)
            .max(WINDOW_MIN * WINDOW_MULT);
        if self.window <= FAST_RECOVERY_ENTER {
            self.fast_recovery = true;
        }
    }

    /// Housekeeping hook: grants growth proportional to how long the link
    /// has been NAK-free, so a misattributed NAK cannot suppress a quiet
    /// link forever.
    pub fn recovery_tick(&mut self, now_ms: u64) {
        let Some(last) = self.last_nak_ms else {
            return;
        };
        let quiet = now_ms.saturating_sub(last);
        let grants = RECOVERY_TIERS
            .iter()
            .find(|(threshold, _)| quiet >= *threshold)
            .map(|(_, grants)| *grants)
            .unwrap_or(0);
        if grants > 0 {
            self.grow(grants * WINDOW_INCR);
        }
    }

    fn grow(&mut self, by: u64) {
        self.window = (self.window + by).min(WINDOW_MAX * WINDOW_MULT);
        if self.fast_recovery && self.window > FAST_RECOVERY_EXIT {
            self.fast_recovery = false;
        }
    }
}

#[cfg(test)]
impl CongestionWindow {
    /// Pins the window without touching NAK history or recovery state.
    pub(crate) fn force_window(&mut self, window: u64) {
        self.window = window;
    }

    pub(crate) fn force_nak_at(&mut self, now_ms: u64) {
        self.prev_nak_ms = self.last_nak_ms;
        self.last_nak_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_default_window() {
        let w = CongestionWindow::new();
        assert_eq!(w.get(), WINDOW_DEF * WINDOW_MULT);
        assert!(!w.in_fast_recovery());
    }

    #[test]
    fn nak_shrinks_and_clamps_at_floor() {
        let mut w = CongestionWindow::new();
        for i in 0..1_000 {
            w.on_nak(i);
            assert!(w.get() >= WINDOW_MIN * WINDOW_MULT);
            assert!(w.get() <= WINDOW_MAX * WINDOW_MULT);
        }
        assert_eq!(w.get(), WINDOW_MIN * WINDOW_MULT);
        assert_eq!(w.nak_count(), 1_000);
    }

    #[test]
    fn growth_respects_cooldown() {
        let mut w = CongestionWindow::new();
        let before = w.get();
        // Enough run and utilization, but all at the same instant: only the
        // first eligible ACK may grow the window.
        for _ in 0..20 {
            w.on_ack(1_000, 60);
        }
        assert_eq!(w.get(), before + WINDOW_INCR);
    }

    #[test]
    fn growth_requires_utilization() {
        let mut w = CongestionWindow::new();
        let before = w.get();
        let mut now = 0;
        for _ in 0..10 {
            now += GROWTH_COOLDOWN_MS;
            // 5 packets in flight against a 20-packet window is far below
            // the 85% bar.
            w.on_ack(now, 5);
        }
        assert_eq!(w.get(), before);
    }

    #[test]
    fn growth_requires_nak_free_run() {
        let mut w = CongestionWindow::new();
        w.on_nak(0);
        let shrunk = w.get();

        // Three ACKs are one short of the required run of four.
        w.on_ack(300, 30);
        w.on_ack(600, 30);
        w.on_ack(900, 30);
        assert_eq!(w.get(), shrunk);

        w.on_ack(1_200, 30);
        assert_eq!(w.get(), shrunk + WINDOW_INCR);
    }

    #[test]
    fn fast_recovery_entry_and_exit() {
        let mut w = CongestionWindow::new();
        w.window = 5_000;

        // Sustained loss drives the window down to the floor and into fast
        // recovery.
        for i in 0..50 {
            w.on_nak(i);
        }
        assert!(w.get() <= FAST_RECOVERY_ENTER);
        assert!(w.in_fast_recovery());

        // NAK-free ACKs at full utilization climb back out. In fast
        // recovery the run requirement drops to two, so every ACK past the
        // cooldown grows the window.
        let mut now = 10_000;
        for _ in 0..500 {
            now += GROWTH_COOLDOWN_MS;
            w.on_ack(now, 60);
        }
        assert!(w.get() > FAST_RECOVERY_EXIT);
        assert!(!w.in_fast_recovery());
    }

    #[test]
    fn fast_recovery_demands_higher_utilization() {
        let mut w = CongestionWindow::new();
        w.window = 10_000;
        w.fast_recovery = true;

        // Run and cooldown are satisfied, but 9 packets against a
        // 10-packet window is 90%: short of the 95% fast-recovery bar
        // (plain mode would have grown at 85%).
        let mut now = 0;
        for _ in 0..5 {
            now += GROWTH_COOLDOWN_MS;
            w.on_ack(now, 9);
        }
        assert_eq!(w.get(), 10_000);

        now += GROWTH_COOLDOWN_MS;
        w.on_ack(now, 10);
        assert_eq!(w.get(), 10_000 + WINDOW_INCR);
    }

    #[test]
    fn quiet_time_recovery_scales_with_silence() {
        let mut w = CongestionWindow::new();
        w.window = 3_000;
        w.last_nak_ms = Some(0);

        // Ticks at 5s and 6s: one increment each.
        w.recovery_tick(5_000);
        w.recovery_tick(6_000);
        assert_eq!(w.get(), 3_000 + 2 * WINDOW_INCR);

        // From 7s the grant doubles, from 10s it triples.
        w.recovery_tick(7_000);
        assert_eq!(w.get(), 3_000 + 4 * WINDOW_INCR);
        w.recovery_tick(10_000);
        assert_eq!(w.get(), 3_000 + 7 * WINDOW_INCR);
    }

    #[test]
    fn quiet_time_recovery_needs_a_nak_history() {
        let mut w = CongestionWindow::new();
        let before = w.get();
        w.recovery_tick(60_000);
        assert_eq!(w.get(), before);
    }

    #[test]
    fn recovery_leaves_fast_recovery_past_high_watermark() {
        let mut w = CongestionWindow::new();
        w.window = FAST_RECOVERY_ENTER;
        w.fast_recovery = true;
        w.last_nak_ms = Some(0);

        let mut tick = 20_000;
        while w.get() <= FAST_RECOVERY_EXIT {
            w.recovery_tick(tick);
            tick += 1_000;
        }
        assert!(!w.in_fast_recovery());
    }

    #[test]
    fn burst_detection() {
        let mut w = CongestionWindow::new();
        assert!(!w.nak_burst(0));

        w.on_nak(1_000);
        assert!(!w.nak_burst(1_100));

        w.on_nak(1_500);
        assert!(w.nak_burst(2_000));

        // The pair ages out once the latest NAK is stale.
        assert!(!w.nak_burst(12_000));

        // Spread-out NAKs are not a burst.
        w.on_nak(30_000);
        assert!(!w.nak_burst(30_100));
    }

    #[test]
    fn score_divides_by_outstanding_load() {
        let mut w = CongestionWindow::new();
        w.window = 20_000;
        assert_eq!(w.score(0), 20_000);
        assert_eq!(w.score(1), 10_000);
        assert_eq!(w.score(19), 1_000);
    }
}
