// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Request handler.
//!
//! Front end of a fom domain: fom types register by opcode, decoded requests come in through
//! [RequestHandler::accept] and leave as replies posted by the foms that served them.

pub mod config;
pub mod services;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    config::DomainConfig,
    services::{
        Reply,
        RpcItem,
        Services,
    },
};
use crate::{
    fom::{
        domain::FomDomain,
        locality::LocalityStats,
        Fom,
        FomOps,
    },
    runtime::fail::Fail,
};
use ::std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Fom type. Builds the type-specific part of the fom serving one request.
pub trait FomType: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, item: &Arc<RpcItem>) -> Result<Box<dyn FomOps>, Fail>;
}

/// Request handler.
pub struct RequestHandler {
    domain: FomDomain,
    types: HashMap<u32, Arc<dyn FomType>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RequestHandler {
    pub fn new(config: &DomainConfig, services: Services) -> Result<Self, Fail> {
        let domain: FomDomain = FomDomain::new(config, Arc::new(services))?;
        Ok(Self {
            domain,
            types: HashMap::new(),
        })
    }

    /// Registers the fom type serving `opcode`.
    pub fn register(&mut self, opcode: u32, ty: Arc<dyn FomType>) -> Result<(), Fail> {
        if let Some(registered) = self.types.get(&opcode) {
            let cause: String = format!("opcode {} is already served by {}", opcode, registered.name());
            error!("register(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        debug!("register(): opcode {} served by {}", opcode, ty.name());
        self.types.insert(opcode, ty);
        Ok(())
    }

    pub fn is_registered(&self, opcode: u32) -> bool {
        self.types.contains_key(&opcode)
    }

    /// Creates and queues the fom serving `item`. Returns the locality it was queued on.
    ///
    /// Requests nobody serves are answered right away with a generic error reply.
    pub fn accept(&self, item: RpcItem) -> Result<usize, Fail> {
        let item: Arc<RpcItem> = Arc::new(item);
        let ty: &Arc<dyn FomType> = match self.types.get(&item.opcode) {
            Some(ty) => ty,
            None => {
                let cause: String = format!("no fom type for opcode {}", item.opcode);
                warn!("accept(): {}", cause);
                self.domain
                    .services()
                    .rpc
                    .reply_post(&item, Reply::generic_error(-libc::EOPNOTSUPP));
                return Err(Fail::new(libc::EOPNOTSUPP, &cause));
            },
        };
        let ops: Box<dyn FomOps> = ty.create(&item)?;
        self.fom_queue(Fom::new(item, ops))
    }

    /// Queues an already built fom.
    pub fn fom_queue(&self, fom: Fom) -> Result<usize, Fail> {
        self.domain.queue(fom)
    }

    pub fn domain(&self) -> &FomDomain {
        &self.domain
    }

    pub fn nr_foms(&self) -> usize {
        self.domain.nr_foms()
    }

    pub fn stats(&self) -> Vec<LocalityStats> {
        self.domain.stats()
    }

    /// Waits for in-flight foms, then tears the domain down. Returns `false` if foms were still running at the
    /// deadline; those are dropped.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        let quiescent: bool = self.domain.wait_quiescent(timeout);
        if !quiescent {
            warn!("shutdown(): {} foms still in flight", self.domain.nr_foms());
        }
        self.domain.fini();
        quiescent
    }
}
