// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Generic phase pipeline.
//!
//! Every fom walks the same sequence of phases: authentication, local and distributed resources, object check,
//! authorisation and transaction context, then its type-specific work, then log record, commit and reply. Failures
//! from any phase divert the fom to [Phase::Failure], which aborts the transaction and still posts a reply. Phases
//! whose action may wait have a `*Wait` twin that continues with the same next phase once the fom is woken.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fom::{
        context::FomContext,
        FomCore,
        FomOps,
        Outcome,
        Step,
    },
    reqh::services::{
        Reply,
        TelemetryRecord,
        Transaction,
    },
    runtime::{
        fail::Fail,
        sm::SmState,
    },
};
use ::std::time::Instant;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Request phase of a fom.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase {
    Init,
    Authenticate,
    AuthenticateWait,
    ResourceLocal,
    ResourceLocalWait,
    ResourceDistributed,
    ResourceDistributedWait,
    ObjectCheck,
    ObjectCheckWait,
    Authorisation,
    AuthorisationWait,
    TxnContext,
    TxnContextWait,
    TypeSpecific,
    Success,
    FolRecAdd,
    TxnCommit,
    TxnCommitWait,
    Timeout,
    Failure,
    TxnAbort,
    TxnAbortWait,
    QueueReply,
    QueueReplyWait,
    Finish,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Phase {
    pub const COUNT: usize = Phase::Finish as usize + 1;

    /// Every phase, in declaration order.
    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::Init,
        Phase::Authenticate,
        Phase::AuthenticateWait,
        Phase::ResourceLocal,
        Phase::ResourceLocalWait,
        Phase::ResourceDistributed,
        Phase::ResourceDistributedWait,
        Phase::ObjectCheck,
        Phase::ObjectCheckWait,
        Phase::Authorisation,
        Phase::AuthorisationWait,
        Phase::TxnContext,
        Phase::TxnContextWait,
        Phase::TypeSpecific,
        Phase::Success,
        Phase::FolRecAdd,
        Phase::TxnCommit,
        Phase::TxnCommitWait,
        Phase::Timeout,
        Phase::Failure,
        Phase::TxnAbort,
        Phase::TxnAbortWait,
        Phase::QueueReply,
        Phase::QueueReplyWait,
        Phase::Finish,
    ];

    /// Phase entered when the action of `self` succeeds.
    pub fn next(self) -> Phase {
        match self {
            Phase::Init => Phase::Authenticate,
            Phase::Authenticate | Phase::AuthenticateWait => Phase::ResourceLocal,
            Phase::ResourceLocal | Phase::ResourceLocalWait => Phase::ResourceDistributed,
            Phase::ResourceDistributed | Phase::ResourceDistributedWait => Phase::ObjectCheck,
            Phase::ObjectCheck | Phase::ObjectCheckWait => Phase::Authorisation,
            Phase::Authorisation | Phase::AuthorisationWait => Phase::TxnContext,
            Phase::TxnContext | Phase::TxnContextWait => Phase::TypeSpecific,
            Phase::TypeSpecific => Phase::Success,
            Phase::Success => Phase::FolRecAdd,
            Phase::FolRecAdd => Phase::TxnCommit,
            Phase::TxnCommit | Phase::TxnCommitWait => Phase::QueueReply,
            Phase::Timeout => Phase::Failure,
            Phase::Failure => Phase::TxnAbort,
            Phase::TxnAbort | Phase::TxnAbortWait => Phase::QueueReply,
            Phase::QueueReply | Phase::QueueReplyWait => Phase::Finish,
            Phase::Finish => Phase::Finish,
        }
    }

    /// Phase the fom parks in when the action of `self` waits.
    pub fn wait_phase(self) -> Option<Phase> {
        match self {
            Phase::Authenticate => Some(Phase::AuthenticateWait),
            Phase::ResourceLocal => Some(Phase::ResourceLocalWait),
            Phase::ResourceDistributed => Some(Phase::ResourceDistributedWait),
            Phase::ObjectCheck => Some(Phase::ObjectCheckWait),
            Phase::Authorisation => Some(Phase::AuthorisationWait),
            Phase::TxnContext => Some(Phase::TxnContextWait),
            Phase::TxnCommit => Some(Phase::TxnCommitWait),
            Phase::TxnAbort => Some(Phase::TxnAbortWait),
            Phase::QueueReply => Some(Phase::QueueReplyWait),
            _ => None,
        }
    }

    pub fn is_wait(self) -> bool {
        matches!(
            self,
            Phase::AuthenticateWait
                | Phase::ResourceLocalWait
                | Phase::ResourceDistributedWait
                | Phase::ObjectCheckWait
                | Phase::AuthorisationWait
                | Phase::TxnContextWait
                | Phase::TxnCommitWait
                | Phase::TxnAbortWait
                | Phase::QueueReplyWait
        )
    }

    /// Phases that are already unwinding a failure. Errors there are recorded and the fom moves on.
    pub fn on_failure_path(self) -> bool {
        matches!(
            self,
            Phase::Timeout
                | Phase::Failure
                | Phase::TxnAbort
                | Phase::TxnAbortWait
                | Phase::QueueReply
                | Phase::QueueReplyWait
                | Phase::Finish
        )
    }

    /// Phases a fom may wait in that a timer is allowed to cut short.
    pub fn can_time_out(self) -> bool {
        matches!(
            self,
            Phase::AuthenticateWait
                | Phase::ResourceLocalWait
                | Phase::ResourceDistributedWait
                | Phase::ObjectCheckWait
                | Phase::AuthorisationWait
                | Phase::TxnContextWait
                | Phase::TypeSpecific
        )
    }

    /// Phases whose action is supplied by the fom type through [FomOps::generic].
    fn is_overridable(self) -> bool {
        matches!(
            self,
            Phase::Authenticate
                | Phase::ResourceLocal
                | Phase::ResourceDistributed
                | Phase::ObjectCheck
                | Phase::Authorisation
        )
    }
}

/// Advances `fom` by one phase.
///
/// A failing action moves the fom to [Phase::Failure] with the error recorded as its result code. The dispatcher
/// returns [Outcome::Wait] once the fom reached [Phase::Finish], so a finished fom never asks to be ticked again.
pub fn tick<O: FomOps + ?Sized>(ops: &mut O, fom: &mut FomCore, ctx: &mut FomContext) -> Outcome {
    let phase: Phase = fom.phase();
    if phase == Phase::Finish {
        return Outcome::Wait;
    }

    let started: Instant = Instant::now();
    let result: Result<Outcome, Fail> = match phase {
        Phase::TypeSpecific => type_specific(ops, fom, ctx),
        p if p.is_overridable() => ops.generic(p, fom, ctx),
        p if p.is_wait() => Ok(Outcome::Again),
        Phase::Init | Phase::Success => Ok(Outcome::Again),
        Phase::TxnContext => txn_context(fom, ctx),
        Phase::FolRecAdd => fol_rec_add(fom, ctx),
        Phase::TxnCommit => txn_commit(fom, ctx),
        Phase::Timeout => timeout(fom),
        Phase::Failure => failure(ops.name(), fom),
        Phase::TxnAbort => txn_abort(fom, ctx),
        Phase::QueueReply => queue_reply(fom, ctx),
        _ => unreachable!("tick(): no action for phase {}", phase.name()),
    };

    if let Some(id) = fom.id() {
        ctx.services().telemetry.post(TelemetryRecord::Phase {
            fom: id,
            phase,
            nanos: u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX),
        });
    }

    match result {
        Ok(Outcome::Again) => {
            // The type-specific phase advances by itself once its work is done.
            if phase != Phase::TypeSpecific {
                fom.move_phase(phase.next());
            }
        },
        Ok(Outcome::Wait) => {
            if let Some(wait) = phase.wait_phase() {
                fom.move_phase(wait);
            }
            return Outcome::Wait;
        },
        Err(e) if phase.on_failure_path() => {
            warn!("tick(): {}: {} failed while unwinding ({})", ops.name(), phase.name(), e);
            if fom.rc() == 0 {
                fom.set_rc(e.rc());
            }
            fom.move_phase(phase.next());
        },
        Err(e) => {
            debug!("tick(): {}: {} failed ({})", ops.name(), phase.name(), e);
            fom.fail_phase(Phase::Failure, e.rc());
        },
    }

    if fom.phase() == Phase::Finish {
        Outcome::Wait
    } else {
        Outcome::Again
    }
}

fn type_specific<O: FomOps + ?Sized>(ops: &mut O, fom: &mut FomCore, ctx: &mut FomContext) -> Result<Outcome, Fail> {
    match ops.state(fom, ctx)? {
        Step::Again => Ok(Outcome::Again),
        Step::Wait => Ok(Outcome::Wait),
        Step::Done => {
            fom.move_phase(Phase::Success);
            Ok(Outcome::Again)
        },
    }
}

fn txn_context(fom: &mut FomCore, ctx: &mut FomContext) -> Result<Outcome, Fail> {
    let storage = ctx.services().storage.clone();
    let txn: Box<dyn Transaction> = ctx.blocking_if(storage.blocks(), || storage.txn_open())?;
    fom.txn = Some(txn);
    Ok(Outcome::Again)
}

fn fol_rec_add(fom: &mut FomCore, ctx: &mut FomContext) -> Result<Outcome, Fail> {
    let fol = ctx.services().fol.clone();
    let request = fom.request().clone();
    let rc: i32 = fom.reply().map(|r| r.rc).unwrap_or(0);
    ctx.blocking_if(fol.blocks(), || fol.rec_add(&request, rc))?;
    Ok(Outcome::Again)
}

fn txn_commit(fom: &mut FomCore, ctx: &mut FomContext) -> Result<Outcome, Fail> {
    if let Some(txn) = fom.txn.take() {
        let blocks: bool = ctx.services().storage.blocks();
        ctx.blocking_if(blocks, || txn.commit())?;
    }
    Ok(Outcome::Again)
}

fn timeout(fom: &mut FomCore) -> Result<Outcome, Fail> {
    if fom.rc() == 0 {
        fom.set_rc(-libc::ETIMEDOUT);
    }
    Ok(Outcome::Again)
}

fn failure(name: &str, fom: &mut FomCore) -> Result<Outcome, Fail> {
    let rc: i32 = fom.rc();
    let replace: bool = match fom.reply() {
        None => true,
        Some(reply) => reply.rc == 0 && rc != 0,
    };
    if replace {
        trace!("failure(): {}: generic error reply ({})", name, rc);
        fom.set_reply(Reply::generic_error(rc));
    }
    Ok(Outcome::Again)
}

fn txn_abort(fom: &mut FomCore, ctx: &mut FomContext) -> Result<Outcome, Fail> {
    if let Some(txn) = fom.txn.take() {
        if !txn.supports_abort() {
            panic!("txn_abort(): {:?}: transaction backend cannot roll back", fom.id());
        }
        let blocks: bool = ctx.services().storage.blocks();
        ctx.blocking_if(blocks, || txn.abort())?;
    }
    Ok(Outcome::Again)
}

fn queue_reply(fom: &mut FomCore, ctx: &mut FomContext) -> Result<Outcome, Fail> {
    let reply: Reply = match fom.take_reply() {
        Some(reply) => reply,
        None => Reply::generic_error(fom.rc()),
    };
    ctx.services().rpc.reply_post(fom.request(), reply);
    Ok(Outcome::Again)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl SmState for Phase {
    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Authenticate => "authenticate",
            Phase::AuthenticateWait => "authenticate_wait",
            Phase::ResourceLocal => "resource_local",
            Phase::ResourceLocalWait => "resource_local_wait",
            Phase::ResourceDistributed => "resource_distributed",
            Phase::ResourceDistributedWait => "resource_distributed_wait",
            Phase::ObjectCheck => "object_check",
            Phase::ObjectCheckWait => "object_check_wait",
            Phase::Authorisation => "authorisation",
            Phase::AuthorisationWait => "authorisation_wait",
            Phase::TxnContext => "txn_context",
            Phase::TxnContextWait => "txn_context_wait",
            Phase::TypeSpecific => "type_specific",
            Phase::Success => "success",
            Phase::FolRecAdd => "fol_rec_add",
            Phase::TxnCommit => "txn_commit",
            Phase::TxnCommitWait => "txn_commit_wait",
            Phase::Timeout => "timeout",
            Phase::Failure => "failure",
            Phase::TxnAbort => "txn_abort",
            Phase::TxnAbortWait => "txn_abort_wait",
            Phase::QueueReply => "queue_reply",
            Phase::QueueReplyWait => "queue_reply_wait",
            Phase::Finish => "finish",
        }
    }

    fn is_terminal(self) -> bool {
        self == Phase::Finish
    }

    fn allowed(self, next: Self) -> bool {
        if self == Phase::Finish {
            return false;
        }
        next == self.next()
            || Some(next) == self.wait_phase()
            || (next == Phase::Failure && !self.on_failure_path())
            || (next == Phase::Timeout && self.can_time_out())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
