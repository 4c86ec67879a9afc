// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Generic finite state machine.
//!
//! A [StateMachine] holds the current state of some object, the result code of its last transition and the instant at
//! which the current state was entered. The set of states is described by a type implementing [SmState]. Transitions
//! are checked against [SmState::allowed] in debug builds only; release builds trust the callers. Terminal states are
//! enforced in every build.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::stats::SmStats;
use ::std::{
    fmt,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Describes the states of a state machine.
pub trait SmState: Copy + Eq + fmt::Debug + Send + 'static {
    /// Dense index of this state, used to address statistics.
    fn index(self) -> usize;

    /// Human-readable name.
    fn name(self) -> &'static str;

    /// Once a terminal state is entered the machine never changes state again.
    fn is_terminal(self) -> bool;

    /// Whether `self -> next` is a declared edge.
    fn allowed(self, next: Self) -> bool;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// State machine instance.
pub struct StateMachine<S: SmState> {
    /// Current state.
    state: S,
    /// Return code of the last transition.
    rc: i32,
    /// When the current state was entered.
    entered: Instant,
    /// Optional collector of per-state dwell times.
    stats: Option<Arc<SmStats>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<S: SmState> StateMachine<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            rc: 0,
            entered: Instant::now(),
            stats: None,
        }
    }

    /// Attaches a statistics collector. Dwell times are recorded from the next transition on.
    pub fn set_stats(&mut self, stats: Arc<SmStats>) {
        self.stats = Some(stats);
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn rc(&self) -> i32 {
        self.rc
    }

    pub fn entered_at(&self) -> Instant {
        self.entered
    }

    /// Time spent in the current state so far.
    pub fn dwell(&self) -> Duration {
        self.entered.elapsed()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves the machine to `next`.
    pub fn move_to(&mut self, next: S) {
        assert!(
            !self.state.is_terminal(),
            "move_to(): terminal state {:?} left for {:?}",
            self.state,
            next
        );
        debug_assert!(
            self.state.allowed(next),
            "move_to(): transition {:?} -> {:?} is not allowed",
            self.state,
            next
        );
        let now: Instant = Instant::now();
        if let Some(stats) = self.stats.as_ref() {
            stats.record(self.state.index(), now.duration_since(self.entered));
        }
        self.state = next;
        self.entered = now;
    }

    pub fn set_rc(&mut self, rc: i32) {
        self.rc = rc;
    }

    /// Moves the machine to `next` and records a failed transition.
    pub fn fail(&mut self, next: S, rc: i32) {
        self.rc = rc;
        self.move_to(next);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<S: SmState> fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state.name())
            .field("rc", &self.rc)
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
