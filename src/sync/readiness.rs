//! Readiness gate: decides when an empty collection may be shown as empty.
//!
//! Data arriving from a refresh is held for a settle delay before it is
//! displayed. The delay is asymmetric: a populated collection settles
//! quickly, an empty one waits longer so that an empty intermediate result
//! (for example between an optimistic patch and the authoritative refresh)
//! never flashes an empty-state screen.

use super::Scope;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Settle delays for the two outcomes of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    pub populated: Duration,
    pub empty: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            populated: Duration::from_millis(150),
            empty: Duration::from_millis(800),
        }
    }
}

impl SettleDelays {
    /// Upper bound on how long any load takes to settle.
    pub fn max(&self) -> Duration {
        self.populated.max(self.empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// A fetch for this cycle is outstanding.
    Loading { cycle: u64 },
    /// Data arrived and is settling.
    DataReady { count: usize, at: Instant },
    /// Non-empty data has settled.
    Populated { count: usize },
    /// Empty data is waiting out the long settle delay.
    AwaitingEmptyConfirmation { since: Instant },
    /// Empty data has settled; the empty state may be shown.
    EmptyConfirmed,
}

/// What a consumer should render for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Loading,
    Populated(usize),
    Empty,
}

/// Per-scope readiness state machine.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    delays: SettleDelays,
    state: ReadinessState,
    cycle: u64,
    /// Cycle in which `EmptyConfirmed` was last reached.
    confirmed_cycle: Option<u64>,
}

impl ReadinessGate {
    pub fn new(delays: SettleDelays) -> Self {
        Self {
            delays,
            state: ReadinessState::Loading { cycle: 0 },
            cycle: 0,
            confirmed_cycle: None,
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Start a new loading cycle. Any pending settle is abandoned.
    pub fn begin_loading(&mut self) {
        self.cycle += 1;
        self.state = ReadinessState::Loading { cycle: self.cycle };
    }

    /// Record data for the current cycle.
    pub fn finish_loading(&mut self, count: usize, now: Instant) {
        let already_confirmed = self.confirmed_cycle == Some(self.cycle);
        self.state = match (self.state, count) {
            // Already showing data; replacing it with more data needs no settle
            (ReadinessState::Populated { .. }, n) if n > 0 => ReadinessState::Populated { count: n },
            // Confirmed once this cycle; a repeat empty result keeps the empty state
            (_, 0) if already_confirmed => ReadinessState::EmptyConfirmed,
            _ => ReadinessState::DataReady { count, at: now },
        };
    }

    /// Advance timed transitions and return the resulting state.
    pub fn poll(&mut self, now: Instant) -> ReadinessState {
        loop {
            let next = match self.state {
                ReadinessState::DataReady { count: 0, at } => {
                    Some(ReadinessState::AwaitingEmptyConfirmation { since: at })
                }
                ReadinessState::DataReady { count, at }
                    if now.saturating_duration_since(at) >= self.delays.populated =>
                {
                    Some(ReadinessState::Populated { count })
                }
                ReadinessState::AwaitingEmptyConfirmation { since }
                    if now.saturating_duration_since(since) >= self.delays.empty =>
                {
                    self.confirmed_cycle = Some(self.cycle);
                    Some(ReadinessState::EmptyConfirmed)
                }
                _ => None,
            };
            match next {
                Some(state) => self.state = state,
                None => return self.state,
            }
        }
    }

    /// True only once loading has finished, the settle delay has elapsed,
    /// the collection is empty, and no newer fetch restarted the cycle.
    pub fn should_show_empty(&mut self, now: Instant) -> bool {
        matches!(self.poll(now), ReadinessState::EmptyConfirmed)
    }

    pub fn display(&mut self, now: Instant) -> DisplayState {
        match self.poll(now) {
            ReadinessState::Populated { count } => DisplayState::Populated(count),
            ReadinessState::EmptyConfirmed => DisplayState::Empty,
            ReadinessState::Loading { .. }
            | ReadinessState::DataReady { .. }
            | ReadinessState::AwaitingEmptyConfirmation { .. } => DisplayState::Loading,
        }
    }
}

/// One readiness gate per scope, created on first use.
#[derive(Debug, Default)]
pub struct ReadinessBoard {
    delays: SettleDelays,
    gates: Mutex<HashMap<Scope, ReadinessGate>>,
}

impl ReadinessBoard {
    pub fn new(delays: SettleDelays) -> Self {
        Self {
            delays,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn delays(&self) -> SettleDelays {
        self.delays
    }

    pub fn begin_loading(&self, scope: &Scope) {
        self.with_gate(scope, |gate| gate.begin_loading());
    }

    pub fn finish_loading(&self, scope: &Scope, count: usize) {
        self.with_gate(scope, |gate| gate.finish_loading(count, Instant::now()));
    }

    pub fn is_loading(&self, scope: &Scope) -> bool {
        matches!(self.state(scope), ReadinessState::Loading { .. })
    }

    pub fn state(&self, scope: &Scope) -> ReadinessState {
        self.with_gate(scope, |gate| gate.poll(Instant::now()))
    }

    pub fn should_show_empty(&self, scope: &Scope) -> bool {
        self.with_gate(scope, |gate| gate.should_show_empty(Instant::now()))
    }

    pub fn display(&self, scope: &Scope) -> DisplayState {
        self.with_gate(scope, |gate| gate.display(Instant::now()))
    }

    fn with_gate<R>(&self, scope: &Scope, f: impl FnOnce(&mut ReadinessGate) -> R) -> R {
        let mut gates = self.gates.lock();
        let gate = gates
            .entry(scope.clone())
            .or_insert_with(|| ReadinessGate::new(self.delays));
        f(gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn gate() -> ReadinessGate {
        ReadinessGate::new(SettleDelays {
            populated: ms(100),
            empty: ms(600),
        })
    }

    #[test]
    fn test_empty_not_shown_before_settle_delay() {
        let start = Instant::now();
        let mut g = gate();
        g.begin_loading();
        assert!(!g.should_show_empty(start));

        g.finish_loading(0, start);
        assert!(!g.should_show_empty(start));
        assert!(!g.should_show_empty(start + ms(599)));
        assert!(g.should_show_empty(start + ms(600)));
    }

    #[test]
    fn test_empty_never_flashes_populated() {
        let start = Instant::now();
        let mut g = gate();
        g.begin_loading();
        g.finish_loading(0, start);

        let mut t = start;
        while t <= start + ms(600) {
            let shown = g.display(t);
            assert!(
                matches!(shown, DisplayState::Loading | DisplayState::Empty),
                "unexpected {:?} at {:?}",
                shown,
                t - start
            );
            t += ms(25);
        }
        assert_eq!(g.display(start + ms(600)), DisplayState::Empty);
    }

    #[test]
    fn test_populated_settles_quickly() {
        let start = Instant::now();
        let mut g = gate();
        g.begin_loading();
        g.finish_loading(3, start);
        assert_eq!(g.display(start + ms(50)), DisplayState::Loading);
        assert_eq!(g.display(start + ms(100)), DisplayState::Populated(3));
        assert!(!g.should_show_empty(start + ms(5000)));
    }

    #[test]
    fn test_new_fetch_restarts_cycle() {
        let start = Instant::now();
        let mut g = gate();
        g.begin_loading();
        g.finish_loading(0, start);
        assert!(!g.should_show_empty(start + ms(300)));

        // A new fetch starts before the empty state was confirmed
        g.begin_loading();
        assert!(!g.should_show_empty(start + ms(700)));
        assert_eq!(g.state, ReadinessState::Loading { cycle: 2 });

        g.finish_loading(0, start + ms(700));
        assert!(!g.should_show_empty(start + ms(1200)));
        assert!(g.should_show_empty(start + ms(1300)));
    }

    #[test]
    fn test_empty_confirmed_once_per_cycle() {
        let start = Instant::now();
        let mut g = gate();
        g.begin_loading();
        g.finish_loading(0, start);
        assert!(g.should_show_empty(start + ms(600)));

        // A background refresh in the same cycle returns empty again
        g.finish_loading(0, start + ms(700));
        assert_eq!(g.poll(start + ms(700)), ReadinessState::EmptyConfirmed);

        // ...or brings data back
        g.finish_loading(2, start + ms(800));
        assert_eq!(g.display(start + ms(900)), DisplayState::Populated(2));
    }

    #[test]
    fn test_populated_refresh_does_not_resettle() {
        let start = Instant::now();
        let mut g = gate();
        g.begin_loading();
        g.finish_loading(3, start);
        assert_eq!(g.display(start + ms(100)), DisplayState::Populated(3));

        g.finish_loading(4, start + ms(200));
        assert_eq!(g.display(start + ms(200)), DisplayState::Populated(4));

        // Dropping to empty goes through the long settle instead of flashing
        g.finish_loading(0, start + ms(300));
        assert_eq!(g.display(start + ms(300)), DisplayState::Loading);
        assert_eq!(g.display(start + ms(900)), DisplayState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_board_tracks_scopes_independently() {
        let board = ReadinessBoard::new(SettleDelays {
            populated: ms(100),
            empty: ms(500),
        });
        board.begin_loading(&Scope::Active);
        board.begin_loading(&Scope::Archived);
        board.finish_loading(&Scope::Active, 4);
        board.finish_loading(&Scope::Archived, 0);

        tokio::time::advance(ms(100)).await;
        assert_eq!(board.display(&Scope::Active), DisplayState::Populated(4));
        assert_eq!(board.display(&Scope::Archived), DisplayState::Loading);

        tokio::time::advance(board.delays().max()).await;
        assert!(board.should_show_empty(&Scope::Archived));
        assert!(!board.should_show_empty(&Scope::Active));
    }
}
