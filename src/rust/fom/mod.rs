// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! File operation machines.
//!
//! A [Fom] is one schedulable operation. It carries two state machines: the request [Phase], advanced by the generic
//! pipeline and by the type-specific code of the fom, and the execution [FomState], owned by the locality that hosts
//! the fom. Types plug in through [FomOps].

pub mod ast;
pub mod context;
pub mod domain;
pub mod generic;
pub mod locality;
pub mod long_lock;
pub mod thread;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    context::FomContext,
    generic::Phase,
};
use crate::{
    reqh::services::{
        Reply,
        RpcItem,
        Transaction,
    },
    runtime::{
        fail::Fail,
        sm::{
            SmState,
            StateMachine,
        },
        stats::SmStats,
    },
};
use ::std::{
    fmt,
    sync::Arc,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle of a fom hosted by a locality. The sequence number tells apart foms that reused the same slot.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FomId {
    pub locality: usize,
    pub index: usize,
    pub seq: u64,
}

/// Result of one tick, and of one generic phase action.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Another transition is possible right away.
    Again,
    /// No progress until an external event wakes the fom.
    Wait,
}

/// Result of one step of the type-specific phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    Again,
    Wait,
    /// Type-specific work is complete.
    Done,
}

/// Execution state of a fom.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FomState {
    Init,
    Ready,
    Running,
    Waiting,
    Finish,
}

/// Generic part of a fom, shared by every fom type.
pub struct FomCore {
    id: Option<FomId>,
    seq: u64,
    phase: StateMachine<Phase>,
    state: StateMachine<FomState>,
    request: Arc<RpcItem>,
    reply: Option<Reply>,
    pub(crate) txn: Option<Box<dyn Transaction>>,
    transitions: u64,
    enqueues: u64,
    queued_at: Option<Instant>,
}

/// Operations of a fom type.
pub trait FomOps: Send {
    /// Type name, used in logs.
    fn name(&self) -> &'static str;

    /// Key hashed to pick the locality of the fom. The sequence number by default, which spreads foms round-robin.
    fn home_locality(&self, fom: &FomCore) -> u64 {
        fom.seq()
    }

    /// Action of the overridable generic phases: authentication, local and distributed resources, object check and
    /// authorisation. Returning [Outcome::Wait] parks the fom in the matching wait phase, which continues with the
    /// next phase once the fom is woken.
    fn generic(&mut self, _phase: Phase, _fom: &mut FomCore, _ctx: &mut FomContext) -> Result<Outcome, Fail> {
        Ok(Outcome::Again)
    }

    /// Type-specific work. Called over and over while the fom stays in [Phase::TypeSpecific].
    fn state(&mut self, fom: &mut FomCore, ctx: &mut FomContext) -> Result<Step, Fail>;

    /// Phase transition function.
    fn tick(&mut self, fom: &mut FomCore, ctx: &mut FomContext) -> Outcome {
        generic::tick(self, fom, ctx)
    }

    /// Finaliser, run once the fom finished.
    fn fini(&mut self, _fom: &mut FomCore) {}
}

/// File operation machine.
pub struct Fom {
    pub(crate) core: FomCore,
    pub(crate) ops: Box<dyn FomOps>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FomCore {
    fn new(request: Arc<RpcItem>) -> Self {
        Self {
            id: None,
            seq: 0,
            phase: StateMachine::new(Phase::Init),
            state: StateMachine::new(FomState::Init),
            request,
            reply: None,
            txn: None,
            transitions: 0,
            enqueues: 0,
            queued_at: None,
        }
    }

    /// Handle of the fom. `None` until its locality takes it in.
    pub fn id(&self) -> Option<FomId> {
        self.id
    }

    /// Domain-wide sequence number, assigned at queueing time.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn phase(&self) -> Phase {
        self.phase.state()
    }

    pub fn state(&self) -> FomState {
        self.state.state()
    }

    /// Result code of the fom. Zero, or the negative errno of the first failure.
    pub fn rc(&self) -> i32 {
        self.phase.rc()
    }

    pub fn request(&self) -> &Arc<RpcItem> {
        &self.request
    }

    pub fn reply(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    /// Installs the reply that the fom posts when it completes.
    pub fn set_reply(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    pub(crate) fn take_reply(&mut self) -> Option<Reply> {
        self.reply.take()
    }

    pub fn has_txn(&self) -> bool {
        self.txn.is_some()
    }

    /// Number of phase transitions executed so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Number of trips through a run queue: the first queueing plus one per wake-up.
    pub fn nr_enqueues(&self) -> u64 {
        self.enqueues
    }

    /// When the fom was last put on a run queue.
    pub fn queued_at(&self) -> Option<Instant> {
        self.queued_at
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    pub(crate) fn set_id(&mut self, id: FomId) {
        self.id = Some(id);
    }

    pub(crate) fn set_rc(&mut self, rc: i32) {
        self.phase.set_rc(rc);
    }

    pub(crate) fn attach_stats(&mut self, phases: Arc<SmStats>, states: Arc<SmStats>) {
        self.phase.set_stats(phases);
        self.state.set_stats(states);
    }

    pub(crate) fn move_phase(&mut self, next: Phase) {
        trace!("move_phase(): {:?} {} -> {}", self.id, self.phase().name(), next.name());
        self.phase.move_to(next);
        self.transitions += 1;
    }

    /// Moves to `next` recording `rc` as the result code of the fom.
    pub(crate) fn fail_phase(&mut self, next: Phase, rc: i32) {
        trace!("fail_phase(): {:?} {} -> {} ({})", self.id, self.phase().name(), next.name(), rc);
        self.phase.fail(next, rc);
        self.transitions += 1;
    }

    pub(crate) fn move_state(&mut self, next: FomState) {
        self.state.move_to(next);
    }

    /// Accounts for one more trip through a run queue.
    pub(crate) fn enqueued(&mut self) {
        self.enqueues += 1;
        self.queued_at = Some(Instant::now());
    }
}

impl Fom {
    /// Creates a fom for an already decoded request.
    pub fn new(request: Arc<RpcItem>, ops: Box<dyn FomOps>) -> Self {
        Self {
            core: FomCore::new(request),
            ops,
        }
    }

    pub fn core(&self) -> &FomCore {
        &self.core
    }

    pub fn name(&self) -> &'static str {
        self.ops.name()
    }

    pub(crate) fn home_locality(&self) -> u64 {
        self.ops.home_locality(&self.core)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl SmState for FomState {
    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            FomState::Init => "init",
            FomState::Ready => "ready",
            FomState::Running => "running",
            FomState::Waiting => "waiting",
            FomState::Finish => "finish",
        }
    }

    fn is_terminal(self) -> bool {
        self == FomState::Finish
    }

    fn allowed(self, next: Self) -> bool {
        matches!(
            (self, next),
            (FomState::Init, FomState::Ready)
                | (FomState::Ready, FomState::Running)
                | (FomState::Running, FomState::Ready)
                | (FomState::Running, FomState::Waiting)
                | (FomState::Running, FomState::Finish)
                | (FomState::Waiting, FomState::Ready)
        )
    }
}

impl FomState {
    pub const COUNT: usize = 5;
}

impl fmt::Debug for FomCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FomCore")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("phase", &self.phase())
            .field("state", &self.state())
            .field("rc", &self.rc())
            .field("transitions", &self.transitions)
            .finish()
    }
}

impl fmt::Debug for Fom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fom")
            .field("type", &self.ops.name())
            .field("core", &self.core)
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
