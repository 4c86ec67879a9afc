// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Collaborators of the scheduler: storage transactions, the operation log, reply posting and telemetry.
//!
//! The scheduler only sees these through traits. Storage and log calls that [Storage::blocks] or [Fol::blocks] are
//! made inside a blocking section of the calling fom.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fom::{
        generic::Phase,
        FomId,
    },
    runtime::{
        fail::Fail,
        limits,
    },
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
    TrySendError,
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Already decoded request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RpcItem {
    pub opcode: u32,
    /// Session the request arrived on.
    pub session: u64,
    pub payload: Vec<u8>,
}

/// Reply built by a fom. Ownership moves to the RPC layer when the reply is posted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reply {
    pub opcode: u32,
    /// Status code. Zero on success, a negative errno otherwise.
    pub rc: i32,
    pub payload: Vec<u8>,
}

/// Storage engine.
pub trait Storage: Send + Sync {
    /// Whether transaction calls may sleep.
    fn blocks(&self) -> bool {
        true
    }

    fn txn_open(&self) -> Result<Box<dyn Transaction>, Fail>;
}

/// Open storage transaction.
pub trait Transaction: Send {
    fn commit(self: Box<Self>) -> Result<(), Fail>;

    fn abort(self: Box<Self>) -> Result<(), Fail>;

    /// Backends without rollback return `false`. Aborting such a transaction is fatal.
    fn supports_abort(&self) -> bool {
        true
    }
}

/// File operation log.
pub trait Fol: Send + Sync {
    fn blocks(&self) -> bool {
        true
    }

    /// Appends the record of a completed operation.
    fn rec_add(&self, item: &RpcItem, rc: i32) -> Result<(), Fail>;
}

/// RPC layer. Posting only queues the reply for transmission and never sleeps.
pub trait ReplyPoster: Send + Sync {
    fn reply_post(&self, item: &Arc<RpcItem>, reply: Reply);
}

/// Best-effort telemetry record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TelemetryRecord {
    RunQueue { locality: usize, len: usize },
    WaitQueue { locality: usize, len: usize },
    Phase { fom: FomId, phase: Phase, nanos: u64 },
}

/// Telemetry sink. Posting never fails from the point of view of the caller.
pub trait Telemetry: Send + Sync {
    fn post(&self, record: TelemetryRecord);
}

/// Collaborators shared by every locality of a domain.
#[derive(Clone)]
pub struct Services {
    pub storage: Arc<dyn Storage>,
    pub fol: Arc<dyn Fol>,
    pub rpc: Arc<dyn ReplyPoster>,
    pub telemetry: Arc<dyn Telemetry>,
}

/// Storage whose transactions do nothing.
pub struct NullStorage;

pub struct NullTransaction;

/// Log that drops every record.
pub struct NullFol;

/// RPC layer that drops every reply.
pub struct NullReplyPoster;

pub struct NullTelemetry;

/// Reply posted through a [ChannelReplyPoster].
#[derive(Clone, Debug)]
pub struct PostedReply {
    pub item: Arc<RpcItem>,
    pub reply: Reply,
}

/// Forwards posted replies over a channel.
pub struct ChannelReplyPoster {
    tx: Sender<PostedReply>,
}

/// Forwards telemetry over a bounded channel, dropping records when it is full.
pub struct ChannelTelemetry {
    tx: Sender<TelemetryRecord>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Reply {
    pub fn new(opcode: u32, rc: i32, payload: Vec<u8>) -> Self {
        Self { opcode, rc, payload }
    }

    /// Reply sent when the fom type did not build one.
    pub fn generic_error(rc: i32) -> Self {
        Self {
            opcode: limits::GENERIC_ERROR_REPLY_OPCODE,
            rc,
            payload: Vec::new(),
        }
    }

    pub fn is_generic_error(&self) -> bool {
        self.opcode == limits::GENERIC_ERROR_REPLY_OPCODE
    }
}

impl ChannelReplyPoster {
    pub fn new() -> (Self, Receiver<PostedReply>) {
        let (tx, rx): (Sender<PostedReply>, Receiver<PostedReply>) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl ChannelTelemetry {
    pub fn bounded(depth: usize) -> (Self, Receiver<TelemetryRecord>) {
        let (tx, rx): (Sender<TelemetryRecord>, Receiver<TelemetryRecord>) = crossbeam_channel::bounded(depth);
        (Self { tx }, rx)
    }

    pub fn new() -> (Self, Receiver<TelemetryRecord>) {
        Self::bounded(limits::TELEMETRY_QUEUE_DEPTH)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Services {
    fn default() -> Self {
        Self {
            storage: Arc::new(NullStorage),
            fol: Arc::new(NullFol),
            rpc: Arc::new(NullReplyPoster),
            telemetry: Arc::new(NullTelemetry),
        }
    }
}

impl Storage for NullStorage {
    fn blocks(&self) -> bool {
        false
    }

    fn txn_open(&self) -> Result<Box<dyn Transaction>, Fail> {
        Ok(Box::new(NullTransaction))
    }
}

impl Transaction for NullTransaction {
    fn commit(self: Box<Self>) -> Result<(), Fail> {
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<(), Fail> {
        Ok(())
    }
}

impl Fol for NullFol {
    fn blocks(&self) -> bool {
        false
    }

    fn rec_add(&self, _item: &RpcItem, _rc: i32) -> Result<(), Fail> {
        Ok(())
    }
}

impl ReplyPoster for NullReplyPoster {
    fn reply_post(&self, item: &Arc<RpcItem>, reply: Reply) {
        trace!("reply_post(): dropping reply {} to opcode {}", reply.rc, item.opcode);
    }
}

impl Telemetry for NullTelemetry {
    fn post(&self, _record: TelemetryRecord) {}
}

impl ReplyPoster for ChannelReplyPoster {
    fn reply_post(&self, item: &Arc<RpcItem>, reply: Reply) {
        let posted: PostedReply = PostedReply {
            item: item.clone(),
            reply,
        };
        if self.tx.send(posted).is_err() {
            warn!("reply_post(): reply channel closed");
        }
    }
}

impl Telemetry for ChannelTelemetry {
    fn post(&self, record: TelemetryRecord) {
        if let Err(TrySendError::Disconnected(_)) = self.tx.try_send(record) {
            trace!("post(): telemetry channel closed");
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
