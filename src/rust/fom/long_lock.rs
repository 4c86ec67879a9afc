// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fom long lock.
//!
//! Reader/writer lock held by foms across phases, without blocking any thread. A fom that cannot take the lock right
//! away is queued and must return [crate::fom::Outcome::Wait]; it is woken once the lock has been granted to it.
//! Waiters are served in arrival order, consecutive readers together. A reader arriving while someone waits is queued
//! too, so writers do not starve.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::fom::{
    ast::{
        FomWaker,
        Wakeup,
    },
    context::FomContext,
    FomId,
};
use ::std::{
    collections::{
        HashSet,
        VecDeque,
    },
    sync::{
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Read,
    Write,
}

struct Waiter {
    mode: Mode,
    fom: FomId,
    waker: Option<FomWaker>,
}

#[derive(Default)]
struct LockState {
    readers: HashSet<FomId>,
    writer: Option<FomId>,
    waiters: VecDeque<Waiter>,
}

/// Reader/writer lock for foms.
#[derive(Default)]
pub struct LongLock {
    state: Mutex<LockState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LockState {
    /// Takes the lock, or queues `waker`. Returns `true` if the lock was taken.
    fn lock(&mut self, mode: Mode, fom: FomId, waker: Option<FomWaker>) -> bool {
        assert!(
            !self.readers.contains(&fom) && self.writer != Some(fom),
            "lock(): fom {:?} already holds the lock",
            fom
        );
        let free: bool = match mode {
            Mode::Read => self.writer.is_none() && self.waiters.is_empty(),
            Mode::Write => self.writer.is_none() && self.readers.is_empty() && self.waiters.is_empty(),
        };
        if free {
            self.take(mode, fom);
            return true;
        }
        self.waiters.push_back(Waiter { mode, fom, waker });
        false
    }

    fn take(&mut self, mode: Mode, fom: FomId) {
        match mode {
            Mode::Read => {
                self.readers.insert(fom);
            },
            Mode::Write => self.writer = Some(fom),
        }
    }

    fn unlock(&mut self, mode: Mode, fom: FomId) -> Vec<Waiter> {
        match mode {
            Mode::Read => assert!(self.readers.remove(&fom), "unlock(): fom {:?} holds no read lock", fom),
            Mode::Write => {
                assert_eq!(self.writer, Some(fom), "unlock(): fom {:?} holds no write lock", fom);
                self.writer = None;
            },
        }
        self.grant()
    }

    /// Withdraws the queued request of `fom`. Returns the waiters granted as a result, or `None` if `fom` was not
    /// queued.
    fn cancel(&mut self, fom: FomId) -> Option<Vec<Waiter>> {
        let at: usize = self.waiters.iter().position(|waiter| waiter.fom == fom)?;
        let _ = self.waiters.remove(at);
        Some(self.grant())
    }

    /// Hands the lock to the waiters at the head of the queue.
    fn grant(&mut self) -> Vec<Waiter> {
        let mut granted: Vec<Waiter> = Vec::new();
        if self.writer.is_some() {
            return granted;
        }
        while let Some(next) = self.waiters.front() {
            match next.mode {
                Mode::Write if self.readers.is_empty() && granted.is_empty() => {
                    if let Some(waiter) = self.waiters.pop_front() {
                        self.take(Mode::Write, waiter.fom);
                        granted.push(waiter);
                    }
                    break;
                },
                Mode::Write => break,
                Mode::Read => {
                    if let Some(waiter) = self.waiters.pop_front() {
                        self.take(Mode::Read, waiter.fom);
                        granted.push(waiter);
                    }
                },
            }
        }
        granted
    }
}

impl LongLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for reading. If this returns `false` the fom must wait; it is woken holding the lock.
    pub fn read_lock(&self, ctx: &FomContext) -> bool {
        let waker: FomWaker = ctx.waker(Box::new(Wakeup));
        self.lock().lock(Mode::Read, ctx.fom_id(), Some(waker))
    }

    /// Takes the lock for writing. If this returns `false` the fom must wait; it is woken holding the lock.
    pub fn write_lock(&self, ctx: &FomContext) -> bool {
        let waker: FomWaker = ctx.waker(Box::new(Wakeup));
        self.lock().lock(Mode::Write, ctx.fom_id(), Some(waker))
    }

    pub fn read_unlock(&self, fom: FomId) {
        let granted: Vec<Waiter> = self.lock().unlock(Mode::Read, fom);
        Self::wake(granted);
    }

    pub fn write_unlock(&self, fom: FomId) {
        let granted: Vec<Waiter> = self.lock().unlock(Mode::Write, fom);
        Self::wake(granted);
    }

    /// Withdraws the request of a fom that stopped waiting for the lock. Returns `false` if the fom had no request
    /// queued, in which case it may hold the lock already and must unlock it.
    pub fn cancel(&self, fom: FomId) -> bool {
        let granted: Option<Vec<Waiter>> = self.lock().cancel(fom);
        match granted {
            Some(granted) => {
                trace!("cancel(): {:?} stopped waiting", fom);
                Self::wake(granted);
                true
            },
            None => false,
        }
    }

    pub fn is_read_locked(&self, fom: FomId) -> bool {
        self.lock().readers.contains(&fom)
    }

    pub fn is_write_locked(&self, fom: FomId) -> bool {
        self.lock().writer == Some(fom)
    }

    pub fn nr_waiters(&self) -> usize {
        self.lock().waiters.len()
    }

    fn wake(granted: Vec<Waiter>) {
        for waiter in granted {
            trace!("wake(): {:?} granted {:?} lock", waiter.fom, waiter.mode);
            if let Some(waker) = waiter.waker {
                if !waker.wake() {
                    warn!("wake(): locality of {:?} is gone", waiter.fom);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
