// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::histogram::Histogram;
use ::std::{
    sync::{
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Dwell-time statistics of a single state.
struct StateStats {
    entries: u64,
    total_nanos: u64,
    max_nanos: u64,
    histogram: Histogram,
}

/// Summary of the time spent in a state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StateSummary {
    /// How many times the state was left.
    pub entries: u64,
    /// Total time spent in the state.
    pub total_nanos: u64,
    /// Longest single stay.
    pub max_nanos: u64,
}

/// Per-state statistics collector shared by all state machines of one kind on a locality.
pub struct SmStats {
    name: &'static str,
    states: Mutex<Vec<StateStats>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SmStats {
    pub fn new(name: &'static str, nr_states: usize) -> Result<Self, Fail> {
        let mut states: Vec<StateStats> = Vec::with_capacity(nr_states);
        for _ in 0..nr_states {
            let histogram: Histogram = match Histogram::new(limits::STATS_GROUPING_POWER, limits::STATS_MAX_VALUE_POWER)
            {
                Ok(histogram) => histogram,
                Err(e) => {
                    let cause: String = format!("failed to build histogram for {} ({:?})", name, e);
                    error!("new(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            };
            states.push(StateStats {
                entries: 0,
                total_nanos: 0,
                max_nanos: 0,
                histogram,
            });
        }
        Ok(Self {
            name,
            states: Mutex::new(states),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Records that `state` was left after `dwell`. Out-of-range states are ignored.
    pub fn record(&self, state: usize, dwell: Duration) {
        let nanos: u64 = u64::try_from(dwell.as_nanos()).unwrap_or(u64::MAX);
        let mut states: MutexGuard<Vec<StateStats>> = self.lock();
        if let Some(s) = states.get_mut(state) {
            s.entries += 1;
            s.total_nanos = s.total_nanos.saturating_add(nanos);
            s.max_nanos = s.max_nanos.max(nanos);
            if let Err(e) = s.histogram.increment(nanos) {
                trace!("record(): {}: dropped sample ({:?})", self.name, e);
            }
        }
    }

    pub fn summary(&self, state: usize) -> StateSummary {
        match self.lock().get(state) {
            Some(s) => StateSummary {
                entries: s.entries,
                total_nanos: s.total_nanos,
                max_nanos: s.max_nanos,
            },
            None => StateSummary::default(),
        }
    }

    /// Copy of the dwell-time histogram of `state`.
    pub fn histogram(&self, state: usize) -> Option<Histogram> {
        self.lock().get(state).map(|s| s.histogram.clone())
    }

    fn lock(&self) -> MutexGuard<Vec<StateStats>> {
        // Statistics stay usable after a panic elsewhere.
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
