// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Asynchronous signal tasks.
//!
//! An [Ast] is a callback aimed at one fom, run by the handler of the locality of that fom with the group lock held.
//! If the fom is waiting the callback runs right away; if it is queued or running, the callback is kept on its
//! pending list and run after the fom parks again. Either way the [Clink] of the callback is fired first, so a callback
//! that was cancelled, or that lost the race against another callback sharing its clink, never runs.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fom::{
        generic::Phase,
        locality::LocalityHandle,
        FomCore,
        FomId,
    },
    runtime::{
        chan::{
            ChanWaiter,
            Clink,
        },
        sm::SmState,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// What the bottom half of a callback decided.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wake {
    /// Put the fom back on the run queue.
    Ready,
    /// Leave the fom waiting.
    Stay,
}

/// Callback delivered to a fom.
pub trait Callback: Send {
    /// Top half. Runs in the signalling thread when the callback waits on a channel. Returning `false` vetoes the
    /// signal.
    fn filter(&mut self) -> bool {
        true
    }

    /// Bottom half. Runs once, under the group lock of the fom, while the fom is parked.
    fn fire(self: Box<Self>, fom: &mut FomCore) -> Wake;
}

/// Callback aimed at a fom.
pub struct Ast {
    pub(crate) target: FomId,
    pub(crate) clink: Clink,
    pub(crate) callback: Box<dyn Callback>,
}

/// Wakes the fom.
pub struct Wakeup;

/// Cuts a wait short. Moves the fom to [Phase::Timeout] where the phase it waits in allows it.
pub struct TimeoutCallback;

/// Armed callback, ready to be posted to the locality of its fom. Also waits on channels.
pub struct FomWaker {
    locality: LocalityHandle,
    ast: Ast,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Ast {
    pub fn new(target: FomId, clink: Clink, callback: Box<dyn Callback>) -> Self {
        Self {
            target,
            clink,
            callback,
        }
    }

    pub fn target(&self) -> FomId {
        self.target
    }

    pub fn clink(&self) -> &Clink {
        &self.clink
    }

    /// Claims the clink and runs the bottom half. `None` if the clink was already fired or cancelled.
    pub(crate) fn deliver(self, fom: &mut FomCore) -> Option<Wake> {
        if !self.clink.fire() {
            return None;
        }
        Some(self.callback.fire(fom))
    }
}

impl FomWaker {
    pub(crate) fn new(locality: LocalityHandle, ast: Ast) -> Self {
        Self { locality, ast }
    }

    pub fn target(&self) -> FomId {
        self.ast.target
    }

    pub fn clink(&self) -> &Clink {
        &self.ast.clink
    }

    /// Posts the callback. Returns `false` if the locality is gone.
    pub fn wake(self) -> bool {
        self.locality.post(self.ast)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Callback for Wakeup {
    fn fire(self: Box<Self>, _fom: &mut FomCore) -> Wake {
        Wake::Ready
    }
}

impl Callback for TimeoutCallback {
    fn fire(self: Box<Self>, fom: &mut FomCore) -> Wake {
        let phase: Phase = fom.phase();
        if phase.can_time_out() {
            fom.move_phase(Phase::Timeout);
        } else {
            debug!("fire(): {:?} timed out in {}", fom.id(), phase.name());
            if fom.rc() == 0 {
                fom.set_rc(-libc::ETIMEDOUT);
            }
        }
        Wake::Ready
    }
}

impl ChanWaiter for FomWaker {
    fn clink(&self) -> &Clink {
        &self.ast.clink
    }

    fn filter(&mut self) -> bool {
        self.ast.callback.filter()
    }

    fn post(self: Box<Self>) {
        self.wake();
    }
}
