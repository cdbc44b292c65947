//! Pure progress state machines driving the exchange loops.
//!
//! The loops in `exchange` and `iexchange` only gather facts (what is still
//! queued, what has landed, whether a barrier finished) and ask these
//! transitions what to do next, so the decisions can be tested without a
//! transport.

/// Termination discipline of a round-based exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExchangeMode {
    /// Every block hears from every unique neighbor; done once `received == expected`.
    Collective,
    /// Arbitrary targets; done once local sends were matched and a non-blocking barrier completed.
    Remote,
}

/// Snapshot of one worker's exchange progress.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangeProgress {
    /// Pieces waiting for a free in-flight slot.
    pub unposted: usize,
    /// Posted sends the receiver has not matched yet.
    pub in_flight: usize,
    pub received: usize,
    pub expected: usize,
    pub barrier_done: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExchangePhase {
    Sending,
    Draining,
    Polling,
    BarrierPending,
    Done,
}

impl ExchangePhase {
    pub fn next(mode: ExchangeMode, p: &ExchangeProgress) -> ExchangePhase {
        if p.unposted > 0 {
            return ExchangePhase::Sending;
        }
        if p.in_flight > 0 {
            return ExchangePhase::Draining;
        }
        match mode {
            ExchangeMode::Collective if p.received < p.expected => ExchangePhase::Polling,
            ExchangeMode::Collective => ExchangePhase::Done,
            ExchangeMode::Remote if p.barrier_done => ExchangePhase::Done,
            ExchangeMode::Remote => ExchangePhase::BarrierPending,
        }
    }
}

/// Global sums from the termination vote.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Vote {
    /// Workers that did work (or are not idle) since entering the barrier.
    pub dirty: i64,
    /// Messages sent minus messages received, over all workers.
    pub in_transit: i64,
}

impl Vote {
    pub fn from_sums(sums: &[i64]) -> Self {
        Vote {
            dirty: sums.first().copied().unwrap_or(0),
            in_transit: sums.get(1).copied().unwrap_or(0),
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.dirty == 0 && self.in_transit == 0
    }
}

/// Distributed termination of `iexchange`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TerminationPhase {
    Working,
    BarrierPending,
    Done,
}

impl TerminationPhase {
    /// `vote` is only consulted once the barrier has completed.
    pub fn next(self, idle: bool, barrier_done: bool, vote: Option<Vote>) -> TerminationPhase {
        match self {
            TerminationPhase::Working if idle => TerminationPhase::BarrierPending,
            TerminationPhase::Working => TerminationPhase::Working,
            TerminationPhase::BarrierPending => match (barrier_done, vote) {
                (true, Some(v)) if v.is_quiescent() => TerminationPhase::Done,
                (true, Some(_)) => TerminationPhase::Working,
                _ => TerminationPhase::BarrierPending,
            },
            TerminationPhase::Done => TerminationPhase::Done,
        }
    }
}
