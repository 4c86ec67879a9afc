// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fom::{
        locality::{
            Locality,
            LocalityStats,
        },
        Fom,
    },
    reqh::{
        config::DomainConfig,
        services::Services,
    },
    runtime::{
        fail::Fail,
        limits,
    },
};
use ::std::{
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Every locality of a process.
pub struct FomDomain {
    localities: Vec<Locality>,
    services: Arc<Services>,
    /// Sequence number of the next fom.
    seq: AtomicU64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FomDomain {
    /// Creates one locality per online CPU, unless the configuration says otherwise.
    pub fn new(config: &DomainConfig, services: Arc<Services>) -> Result<Self, Fail> {
        let nr_cpus: usize = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let nr_localities: usize = config.localities.unwrap_or(nr_cpus);
        if nr_localities == 0 || nr_localities > limits::MAX_LOCALITIES {
            let cause: String = format!("invalid number of localities ({})", nr_localities);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if config.run_timeout.is_zero() || config.max_threads == Some(0) || config.idle_threads == 0 {
            let cause: String = format!(
                "thread limits out of range (run timeout {:?}, {:?} threads at most, {} idle)",
                config.run_timeout, config.max_threads, config.idle_threads
            );
            error!("new(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }

        let mut localities: Vec<Locality> = Vec::with_capacity(nr_localities);
        for id in 0..nr_localities {
            // Localities already created are torn down when the vector drops.
            let locality: Locality = Locality::new(id, Some(id % nr_cpus), config, services.clone())?;
            localities.push(locality);
        }
        info!("new(): fom domain with {} localities over {} cpus", nr_localities, nr_cpus);

        Ok(Self {
            localities,
            services,
            seq: AtomicU64::new(0),
        })
    }

    pub fn nr_localities(&self) -> usize {
        self.localities.len()
    }

    pub fn locality(&self, id: usize) -> Option<&Locality> {
        self.localities.get(id)
    }

    pub fn localities(&self) -> &[Locality] {
        &self.localities
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Queues a fom on the locality picked by its home locality key. Returns the locality.
    pub fn queue(&self, fom: Fom) -> Result<usize, Fail> {
        if self.localities.is_empty() {
            return Err(Fail::new(libc::ESHUTDOWN, "fom domain is finalised"));
        }
        let mut fom: Box<Fom> = Box::new(fom);
        fom.core.set_seq(self.seq.fetch_add(1, Ordering::Relaxed));
        let home: u64 = fom.home_locality();
        let id: usize = (home % self.localities.len() as u64) as usize;
        trace!("queue(): {} fom {} to locality {}", fom.name(), fom.core.seq(), id);
        self.localities[id].queue(fom)?;
        Ok(id)
    }

    /// Number of foms owned by the domain.
    pub fn nr_foms(&self) -> usize {
        self.localities.iter().map(|l| l.nr_foms()).sum()
    }

    pub fn stats(&self) -> Vec<LocalityStats> {
        self.localities.iter().map(|l| l.stats()).collect()
    }

    /// Waits until no locality owns a fom. Returns `false` on timeout.
    pub fn wait_quiescent(&self, timeout: Duration) -> bool {
        let deadline: Instant = Instant::now() + timeout;
        for locality in self.localities.iter() {
            let left: Duration = deadline.saturating_duration_since(Instant::now());
            if !locality.wait_quiescent(left) {
                return false;
            }
        }
        // Foms queued meanwhile on localities already checked.
        self.nr_foms() == 0
    }

    /// Tears localities down in reverse order. Foms still hosted are dropped.
    pub fn fini(&mut self) {
        while let Some(locality) = self.localities.pop() {
            locality.teardown();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for FomDomain {
    fn drop(&mut self) {
        self.fini();
    }
}
