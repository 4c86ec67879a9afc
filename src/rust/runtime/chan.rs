// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wait channels.
//!
//! A [Chan] is a list of armed waiters. Signalling the channel hands the first waiter that is still armed, and whose
//! filter accepts the signal, to its target; broadcasting does so for every waiter. Each waiter carries a [Clink], the
//! shared arm state of one callback: it is fired at most once, and may be cancelled before that.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicU8,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

const ARMED: u8 = 0;
const DONE: u8 = 1;
const CANCELLED: u8 = 2;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Arm state of a callback, shared between everything that may deliver it.
#[derive(Clone, Debug)]
pub struct Clink(Arc<AtomicU8>);

/// Something waiting on a channel.
pub trait ChanWaiter: Send {
    /// Arm state of this waiter.
    fn clink(&self) -> &Clink;

    /// Top half. Runs in the signalling thread, without any locality lock held. Returning `false` vetoes this signal
    /// and keeps the waiter queued.
    fn filter(&mut self) -> bool {
        true
    }

    /// Hands the waiter over to whatever delivers it.
    fn post(self: Box<Self>);
}

/// Wait channel.
#[derive(Default)]
pub struct Chan {
    waiters: Mutex<VecDeque<Box<dyn ChanWaiter>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Clink {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ARMED)))
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::Acquire) == ARMED
    }

    pub fn is_done(&self) -> bool {
        self.0.load(Ordering::Acquire) == DONE
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }

    /// Cancels the callback. Returns `true` if it was still armed, `false` if it had already fired or been cancelled.
    pub fn cancel(&self) -> bool {
        self.0
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the single delivery of this callback.
    pub fn fire(&self) -> bool {
        self.0
            .compare_exchange(ARMED, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Chan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a waiter at the tail of the channel.
    pub fn add(&self, waiter: Box<dyn ChanWaiter>) {
        self.lock().push_back(waiter);
    }

    /// Wakes the first armed waiter that accepts the signal. Returns `true` if one was woken.
    pub fn signal(&self) -> bool {
        let woken: Option<Box<dyn ChanWaiter>> = {
            let mut waiters: MutexGuard<VecDeque<Box<dyn ChanWaiter>>> = self.lock();
            let mut vetoed: VecDeque<Box<dyn ChanWaiter>> = VecDeque::new();
            let mut woken: Option<Box<dyn ChanWaiter>> = None;
            while let Some(mut waiter) = waiters.pop_front() {
                if !waiter.clink().is_armed() {
                    continue;
                }
                if waiter.filter() {
                    woken = Some(waiter);
                    break;
                }
                vetoed.push_back(waiter);
            }
            // Vetoing waiters keep their place ahead of everyone not yet looked at.
            while let Some(waiter) = vetoed.pop_back() {
                waiters.push_front(waiter);
            }
            woken
        };
        match woken {
            Some(waiter) => {
                waiter.post();
                true
            },
            None => false,
        }
    }

    /// Wakes every armed waiter that accepts the signal. Returns how many were woken.
    pub fn broadcast(&self) -> usize {
        let woken: Vec<Box<dyn ChanWaiter>> = {
            let mut waiters: MutexGuard<VecDeque<Box<dyn ChanWaiter>>> = self.lock();
            let mut kept: VecDeque<Box<dyn ChanWaiter>> = VecDeque::new();
            let mut woken: Vec<Box<dyn ChanWaiter>> = Vec::new();
            while let Some(mut waiter) = waiters.pop_front() {
                if !waiter.clink().is_armed() {
                    continue;
                }
                if waiter.filter() {
                    woken.push(waiter);
                } else {
                    kept.push_back(waiter);
                }
            }
            *waiters = kept;
            woken
        };
        let nr_woken: usize = woken.len();
        for waiter in woken {
            waiter.post();
        }
        nr_woken
    }

    /// Number of waiters that are still armed. Dead waiters are dropped on the way.
    pub fn nr_waiters(&self) -> usize {
        let mut waiters: MutexGuard<VecDeque<Box<dyn ChanWaiter>>> = self.lock();
        waiters.retain(|w| w.clink().is_armed());
        waiters.len()
    }

    fn lock(&self) -> MutexGuard<VecDeque<Box<dyn ChanWaiter>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Clink {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
