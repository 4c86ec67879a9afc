// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::chan::Clink;
use ::core::cmp::Reverse;
use ::std::{
    collections::BinaryHeap,
    time::Instant,
};

//==============================================================================
// Structures
//==============================================================================

struct TimerQueueEntry<T> {
    expiry: Instant,
    /// Breaks ties between equal deadlines in arming order.
    seq: u64,
    clink: Clink,
    payload: T,
}

/// Deadline queue. Each entry shares the arm state of the callback it times out, so an entry whose callback was
/// delivered or cancelled is dropped without firing.
pub struct TimerQueue<T> {
    now: Instant,
    seq: u64,
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<TimerQueueEntry<T>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl<T> TimerQueue<T> {
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            seq: 0,
            heap: BinaryHeap::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Arms a deadline.
    pub fn push(&mut self, expiry: Instant, clink: Clink, payload: T) {
        self.seq += 1;
        self.heap.push(Reverse(TimerQueueEntry {
            expiry,
            seq: self.seq,
            clink,
            payload,
        }));
    }

    /// Earliest deadline still armed.
    pub fn next_expiry(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.clink.is_armed() {
                return Some(entry.expiry);
            }
            self.heap.pop();
        }
        None
    }

    /// Advances the clock and returns the payloads of every armed entry that expired, earliest first. Claiming the
    /// single delivery is left to whoever consumes the payload.
    pub fn advance_clock(&mut self, now: Instant) -> Vec<T> {
        if now > self.now {
            self.now = now;
        }
        let mut expired: Vec<T> = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.now < entry.expiry {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                if entry.clink.is_armed() {
                    expired.push(entry.payload);
                }
            }
        }
        expired
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<T> PartialEq for TimerQueueEntry<T> {
    fn eq(&self, other: &TimerQueueEntry<T>) -> bool {
        self.expiry == other.expiry && self.seq == other.seq
    }
}

impl<T> Eq for TimerQueueEntry<T> {}

impl<T> PartialOrd for TimerQueueEntry<T> {
    fn partial_cmp(&self, other: &TimerQueueEntry<T>) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TimerQueueEntry<T> {
    fn cmp(&self, other: &TimerQueueEntry<T>) -> core::cmp::Ordering {
        self.expiry.cmp(&other.expiry).then(self.seq.cmp(&other.seq))
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
