// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Context handed to every tick of a fom.
//!
//! While a tick runs, the context holds the group lock of the locality and the handler role of the calling thread.
//! [FomContext::block_enter] gives both up so that another thread keeps the locality going during a blocking call;
//! [FomContext::block_leave] takes them back.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fom::{
        ast::{
            Ast,
            Callback,
            FomWaker,
            TimeoutCallback,
        },
        locality::{
            Group,
            LocalityHandle,
            LocalityInner,
        },
        thread::{
            Blocked,
            Handler,
        },
        FomId,
    },
    reqh::services::Services,
    runtime::{
        chan::{
            Chan,
            Clink,
        },
        fail::Fail,
    },
};
use ::std::{
    sync::MutexGuard,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Execution context of a fom.
pub struct FomContext<'a> {
    locality: &'a LocalityInner,
    /// `None` inside a blocking section.
    group: Option<MutexGuard<'a, Group>>,
    handler: Option<Handler>,
    fom: FomId,
}

/// Proof that the calling thread is inside a blocking section.
#[must_use]
pub struct BlockToken {
    blocked: Blocked,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<'a> FomContext<'a> {
    pub(crate) fn new(locality: &'a LocalityInner, group: MutexGuard<'a, Group>, handler: Handler, fom: FomId) -> Self {
        Self {
            locality,
            group: Some(group),
            handler: Some(handler),
            fom,
        }
    }

    pub fn fom_id(&self) -> FomId {
        self.fom
    }

    pub fn locality_id(&self) -> usize {
        self.locality.id()
    }

    pub fn locality(&self) -> LocalityHandle {
        self.locality.handle()
    }

    pub fn services(&self) -> &Services {
        self.locality.services()
    }

    pub fn is_blocked(&self) -> bool {
        self.group.is_none()
    }

    /// Enters a blocking section: wakes or creates the next handler, then releases the handler role and the group
    /// lock. Fails only when the overflow policy of the locality rejects growing the pool, in which case the caller
    /// must not block.
    pub fn block_enter(&mut self) -> Result<BlockToken, Fail> {
        let group: MutexGuard<'a, Group> = match self.group.take() {
            Some(group) => group,
            None => panic!("block_enter(): fom {:?} is already blocking", self.fom),
        };
        if let Err(e) = self.locality.hand_over(&group) {
            self.group = Some(group);
            return Err(e);
        }
        let handler: Handler = match self.handler.take() {
            Some(handler) => handler,
            None => panic!("block_enter(): fom {:?} runs without a handler", self.fom),
        };
        trace!("block_enter(): fom {:?} thread {}", self.fom, handler.index());
        let blocked: Blocked = self.locality.block(group, handler);
        Ok(BlockToken { blocked })
    }

    /// Leaves a blocking section. Returns once the calling thread is the handler again.
    pub fn block_leave(&mut self, token: BlockToken) {
        assert!(
            self.group.is_none(),
            "block_leave(): fom {:?} is not blocking",
            self.fom
        );
        let (group, handler): (MutexGuard<'a, Group>, Handler) = self.locality.unblock(token.blocked);
        trace!("block_leave(): fom {:?} thread {}", self.fom, handler.index());
        self.group = Some(group);
        self.handler = Some(handler);
    }

    /// Runs `f` inside a blocking section.
    pub fn blocking<R, F>(&mut self, f: F) -> Result<R, Fail>
    where
        F: FnOnce() -> Result<R, Fail>,
    {
        let token: BlockToken = self.block_enter()?;
        let result: Result<R, Fail> = f();
        self.block_leave(token);
        result
    }

    /// Runs `f` inside a blocking section if `blocks` holds, and right away otherwise.
    pub fn blocking_if<R, F>(&mut self, blocks: bool, f: F) -> Result<R, Fail>
    where
        F: FnOnce() -> Result<R, Fail>,
    {
        if blocks {
            self.blocking(f)
        } else {
            f()
        }
    }

    /// Arms `callback` for this fom without posting it.
    pub fn waker(&self, callback: Box<dyn Callback>) -> FomWaker {
        let ast: Ast = Ast::new(self.fom, Clink::new(), callback);
        FomWaker::new(self.locality.handle(), ast)
    }

    /// Waits on `chan`. The callback is delivered when the channel is signalled, unless the returned clink is
    /// cancelled first.
    pub fn wait_on(&mut self, chan: &Chan, callback: Box<dyn Callback>) -> Clink {
        let waker: FomWaker = self.waker(callback);
        let clink: Clink = waker.clink().clone();
        chan.add(Box::new(waker));
        clink
    }

    /// Arms a timer sharing `clink`: after `after`, the wait guarded by `clink` ends in a timeout, unless the awaited
    /// callback was delivered or cancelled first.
    pub fn timeout(&mut self, clink: &Clink, after: Duration) {
        let ast: Ast = Ast::new(self.fom, clink.clone(), Box::new(TimeoutCallback));
        self.locality.handle().post_timer(Instant::now() + after, ast);
    }

    /// Ends the tick loop. The group lock and the handler role go back to the locality.
    pub(crate) fn finish(self) -> (MutexGuard<'a, Group>, Handler) {
        match (self.group, self.handler) {
            (Some(group), Some(handler)) => (group, handler),
            _ => panic!("finish(): fom {:?} returned from a tick inside a blocking section", self.fom),
        }
    }
}
