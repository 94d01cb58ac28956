//! Probe path state machine and scale decision table
//!
//! Each probe path keeps a logical state and two bounded streak counters.
//! The state only flips when a streak reaches its threshold, so a single
//! result after a long run of the opposite result does not cause flapping.
//! Everything here is pure; the prober feeds results in and acts on the
//! decisions that come out.

use std::fmt;

/// Logical health of one probe path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PathState {
    /// No threshold has been reached yet
    #[default]
    Unknown,
    Up,
    Down,
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathState::Unknown => write!(f, "Unknown"),
            PathState::Up => write!(f, "Up"),
            PathState::Down => write!(f, "Down"),
        }
    }
}

/// Scale state last applied to a target's dependants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScaleState {
    /// Nothing applied since the prober started
    #[default]
    Unknown,
    /// Dependants restored
    Up,
    /// Dependants scaled to zero
    Down,
}

impl fmt::Display for ScaleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleState::Unknown => write!(f, "Unknown"),
            ScaleState::Up => write!(f, "Up"),
            ScaleState::Down => write!(f, "Down"),
        }
    }
}

/// Consecutive identical results seen on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Streak {
    pub successes: u32,
    pub failures: u32,
}

/// Successes needed to flip Up and failures needed to flip Down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub success: u32,
    pub failure: u32,
}

impl Thresholds {
    pub fn new(success: u32, failure: u32) -> Self {
        Self {
            success: success.max(1),
            failure: failure.max(1),
        }
    }
}

/// Apply one probe result to a path.
///
/// A success zeroes the failure streak and a failure zeroes the success
/// streak. Counters saturate at their threshold.
pub fn transition(
    state: PathState,
    streak: Streak,
    success: bool,
    thresholds: Thresholds,
) -> (PathState, Streak) {
    if success {
        let successes = streak.successes.saturating_add(1).min(thresholds.success);
        let next = Streak {
            successes,
            failures: 0,
        };
        if successes >= thresholds.success {
            (PathState::Up, next)
        } else {
            (state, next)
        }
    } else {
        let failures = streak.failures.saturating_add(1).min(thresholds.failure);
        let next = Streak {
            successes: 0,
            failures,
        };
        if failures >= thresholds.failure {
            (PathState::Down, next)
        } else {
            (state, next)
        }
    }
}

/// Decide the scale state both paths call for.
///
/// | internal | external | decision |
/// |----------|----------|----------|
/// | Up       | Up       | Up       |
/// | Up       | Down     | Down     |
/// | Up       | Unknown  | none     |
/// | Down     | any      | none     |
/// | Unknown  | any      | none     |
///
/// Internal health is a precondition for trusting the external signal, so
/// whenever it is not Up the previous scale state is kept.
pub fn decide(internal: PathState, external: PathState) -> Option<ScaleState> {
    match (internal, external) {
        (PathState::Up, PathState::Up) => Some(ScaleState::Up),
        (PathState::Up, PathState::Down) => Some(ScaleState::Down),
        _ => None,
    }
}

/// Running state of one probe path
#[derive(Debug, Clone)]
pub struct PathTracker {
    state: PathState,
    streak: Streak,
    thresholds: Thresholds,
}

impl PathTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            state: PathState::Unknown,
            streak: Streak::default(),
            thresholds,
        }
    }

    pub fn state(&self) -> PathState {
        self.state
    }

    pub fn streak(&self) -> Streak {
        self.streak
    }

    /// Record a result and return the previous state when it changed
    pub fn record(&mut self, success: bool) -> Option<PathState> {
        let previous = self.state;
        let (state, streak) = transition(self.state, self.streak, success, self.thresholds);
        self.state = state;
        self.streak = streak;
        (state != previous).then_some(previous)
    }
}
