// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Locality threads.
//!
//! Each thread of a locality holds exactly one role token: [Idle], [Handler], [Blocked] or [Unblocking]. Tokens are
//! neither cloneable nor constructible outside this module, and each transition consumes the token of the current
//! role, so a thread can only take the steps `IDLE -> HANDLER -> BLOCKED -> UNBLOCKING -> HANDLER` and
//! `HANDLER -> IDLE`. Every transition also updates the roster of the locality, which is what other threads and
//! statistics observe.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::slab::Slab;
use ::std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Mutex,
        MutexGuard,
    },
    thread::JoinHandle,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Role of a locality thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Runs fom ticks under the group lock.
    Handler,
    /// Inside a blocking call on behalf of a fom.
    Blocked,
    /// Back from a blocking call, waiting to become handler again.
    Unblocking,
    /// Parked, ready to become handler.
    Idle,
}

/// Number of threads in each role.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RoleCounts {
    pub handler: usize,
    pub blocked: usize,
    pub unblocking: usize,
    pub idle: usize,
}

struct ThreadSlot {
    role: Role,
    handle: Option<JoinHandle<()>>,
}

struct Roster {
    threads: Slab<ThreadSlot>,
    handler: Option<usize>,
}

/// Thread roster of a locality.
pub(crate) struct Pool {
    roster: Mutex<Roster>,
    /// Threads in the unblocking role. Only changed with the roster locked.
    unblocking: AtomicUsize,
}

#[must_use]
#[derive(Debug)]
pub struct Idle {
    index: usize,
}

#[must_use]
#[derive(Debug)]
pub struct Handler {
    index: usize,
}

#[must_use]
#[derive(Debug)]
pub struct Blocked {
    index: usize,
}

#[must_use]
#[derive(Debug)]
pub struct Unblocking {
    index: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Pool {
    pub(crate) fn new() -> Self {
        Self {
            roster: Mutex::new(Roster {
                threads: Slab::new(),
                handler: None,
            }),
            unblocking: AtomicUsize::new(0),
        }
    }

    /// Registers a new idle thread. Its handle is attached once the thread is spawned.
    pub(crate) fn add_idle(&self) -> Idle {
        let index: usize = self.lock().threads.insert(ThreadSlot {
            role: Role::Idle,
            handle: None,
        });
        Idle { index }
    }

    pub(crate) fn set_handle(&self, index: usize, handle: JoinHandle<()>) {
        if let Some(slot) = self.lock().threads.get_mut(index) {
            slot.handle = Some(handle);
        }
    }

    /// Drops a thread that died without going back to idle.
    pub(crate) fn discard(&self, index: usize) {
        let mut roster: MutexGuard<Roster> = self.lock();
        if let Some(slot) = roster.threads.get(index) {
            if slot.role == Role::Unblocking {
                self.unblocking.fetch_sub(1, Ordering::AcqRel);
            }
            roster.threads.remove(index);
        }
        if roster.handler == Some(index) {
            roster.handler = None;
        }
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.lock().handler.is_some()
    }

    pub(crate) fn nr_unblocking(&self) -> usize {
        self.unblocking.load(Ordering::Acquire)
    }

    pub(crate) fn nr_threads(&self) -> usize {
        self.lock().threads.len()
    }

    pub(crate) fn counts(&self) -> RoleCounts {
        let roster: MutexGuard<Roster> = self.lock();
        let mut counts: RoleCounts = RoleCounts::default();
        for (_, slot) in roster.threads.iter() {
            match slot.role {
                Role::Handler => counts.handler += 1,
                Role::Blocked => counts.blocked += 1,
                Role::Unblocking => counts.unblocking += 1,
                Role::Idle => counts.idle += 1,
            }
        }
        counts
    }

    /// Takes the join handle of some thread that was not joined yet.
    pub(crate) fn take_handle(&self) -> Option<(usize, JoinHandle<()>)> {
        let mut roster: MutexGuard<Roster> = self.lock();
        roster
            .threads
            .iter_mut()
            .find_map(|(index, slot)| slot.handle.take().map(|handle| (index, handle)))
    }

    /// Removes a joined thread from the roster.
    pub(crate) fn retire(&self, index: usize) {
        let mut roster: MutexGuard<Roster> = self.lock();
        if let Some(slot) = roster.threads.get(index) {
            assert_eq!(slot.role, Role::Idle, "retire(): thread {} exited while {:?}", index, slot.role);
            roster.threads.remove(index);
        }
    }

    /// Checks that the handler reference agrees with the roles, and the unblocking counter with the roster.
    pub(crate) fn check(&self) -> Result<(), Fail> {
        let roster: MutexGuard<Roster> = self.lock();
        let handlers: Vec<usize> = roster
            .threads
            .iter()
            .filter(|(_, slot)| slot.role == Role::Handler)
            .map(|(index, _)| index)
            .collect();
        let expected: Vec<usize> = roster.handler.into_iter().collect();
        if handlers != expected {
            let cause: String = format!("handler is {:?} but handler roles are {:?}", roster.handler, handlers);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let unblocking: usize = roster
            .threads
            .iter()
            .filter(|(_, slot)| slot.role == Role::Unblocking)
            .count();
        let counter: usize = self.unblocking.load(Ordering::Acquire);
        if unblocking != counter {
            let cause: String = format!("{} unblocking threads but counter is {}", unblocking, counter);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<Roster> {
        self.roster.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_role(roster: &mut Roster, index: usize, from: Role, to: Role) {
        match roster.threads.get_mut(index) {
            Some(slot) => {
                assert_eq!(slot.role, from, "set_role(): thread {} is not {:?}", index, from);
                slot.role = to;
            },
            None => panic!("set_role(): thread {} is not in the roster", index),
        }
    }
}

impl Idle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Becomes the handler. There must be none.
    pub(crate) fn promote(self, pool: &Pool) -> Handler {
        let mut roster: MutexGuard<Roster> = pool.lock();
        assert!(roster.handler.is_none(), "promote(): locality already has a handler");
        Pool::set_role(&mut roster, self.index, Role::Idle, Role::Handler);
        roster.handler = Some(self.index);
        Handler { index: self.index }
    }
}

impl Handler {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Gives up the handler role before a blocking call.
    pub(crate) fn block(self, pool: &Pool) -> Blocked {
        let mut roster: MutexGuard<Roster> = pool.lock();
        assert_eq!(roster.handler, Some(self.index), "block(): not the handler");
        Pool::set_role(&mut roster, self.index, Role::Handler, Role::Blocked);
        roster.handler = None;
        Blocked { index: self.index }
    }

    /// Gives up the handler role and parks.
    pub(crate) fn yield_(self, pool: &Pool) -> Idle {
        let mut roster: MutexGuard<Roster> = pool.lock();
        assert_eq!(roster.handler, Some(self.index), "yield_(): not the handler");
        Pool::set_role(&mut roster, self.index, Role::Handler, Role::Idle);
        roster.handler = None;
        Idle { index: self.index }
    }
}

impl Blocked {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns from the blocking call. The flag tells whether this thread is the first one unblocking.
    pub(crate) fn unblock(self, pool: &Pool) -> (Unblocking, bool) {
        let mut roster: MutexGuard<Roster> = pool.lock();
        Pool::set_role(&mut roster, self.index, Role::Blocked, Role::Unblocking);
        let was_zero: bool = pool.unblocking.fetch_add(1, Ordering::AcqRel) == 0;
        (Unblocking { index: self.index }, was_zero)
    }
}

impl Unblocking {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Becomes the handler again. There must be none.
    pub(crate) fn acquire(self, pool: &Pool) -> Handler {
        let mut roster: MutexGuard<Roster> = pool.lock();
        assert!(roster.handler.is_none(), "acquire(): locality already has a handler");
        Pool::set_role(&mut roster, self.index, Role::Unblocking, Role::Handler);
        roster.handler = Some(self.index);
        let before: usize = pool.unblocking.fetch_sub(1, Ordering::AcqRel);
        assert!(before > 0, "acquire(): unblocking counter underflow");
        Handler { index: self.index }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
