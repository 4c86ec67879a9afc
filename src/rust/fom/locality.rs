// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Localities.
//!
//! A locality hosts foms on a run queue and a wait queue guarded by one group lock, and owns an elastic pool of
//! threads. Exactly one of them, the handler, ticks foms at any time. A fom about to make a blocking call hands the
//! handler role over to an idle thread, growing the pool if there is none, and competes for the role again once the
//! call returns.
//!
//! Everything that comes from outside the handler (new foms, callbacks, timers) is posted through a channel and taken
//! in by the handler under the group lock. Posting never takes the group lock, so foms of one locality can wake foms
//! of another one.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fom::{
        ast::{
            Ast,
            Wake,
        },
        context::FomContext,
        generic::Phase,
        thread::{
            Blocked,
            Handler,
            Idle,
            Pool,
            RoleCounts,
        },
        Fom,
        FomId,
        FomState,
        Outcome,
    },
    reqh::{
        config::{
            DomainConfig,
            OverflowPolicy,
        },
        services::{
            Services,
            TelemetryRecord,
        },
    },
    runtime::{
        fail::Fail,
        stats::SmStats,
        timer::TimerQueue,
    },
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::slab::Slab;
use ::std::{
    collections::{
        HashSet,
        VecDeque,
    },
    mem,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        Weak,
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

/// Work handed to a locality from outside its handler.
pub(crate) enum Post {
    Queue(Box<Fom>),
    Ast(Ast),
    Timer(Instant, Ast),
}

struct FomSlot {
    /// Taken out while the fom runs.
    fom: Option<Box<Fom>>,
    /// Callbacks that arrived while the fom was queued or running. Drained last in, first out.
    pending: Vec<Ast>,
    /// Thread running the fom.
    owner: Option<usize>,
    seq: u64,
}

/// State guarded by the group lock.
pub(crate) struct Group {
    foms: Slab<FomSlot>,
    runq: VecDeque<usize>,
    waitq: HashSet<usize>,
    timers: TimerQueue<Ast>,
    shutdown: bool,
}

/// Sticky wakeup of the handler.
struct Doorbell {
    rung: Mutex<bool>,
    cv: Condvar,
}

/// Snapshot of a locality.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LocalityStats {
    pub id: usize,
    pub cpu: Option<usize>,
    /// Foms on the run queue.
    pub runq: usize,
    /// Foms on the wait queue.
    pub waitq: usize,
    /// Foms owned by the locality, including those queued but not yet taken in and the one running.
    pub foms: usize,
    /// Foms that finished.
    pub completed: u64,
    /// Armed timers.
    pub timers: usize,
    /// Callbacks kept for foms that are queued or running.
    pub pending: usize,
    pub threads: RoleCounts,
    /// Threads added by block-enter.
    pub growths: u64,
    /// Block-enter calls that found no idle thread and could not add one.
    pub degraded_growths: u64,
}

pub(crate) struct LocalityInner {
    id: usize,
    cpu: Option<usize>,
    config: DomainConfig,
    services: Arc<Services>,
    group: Mutex<Group>,
    /// Idle threads wait here.
    idle: Condvar,
    /// Unblocking threads wait here for the handler to leave.
    unblock: Condvar,
    quiesce: Condvar,
    doorbell: Doorbell,
    pool: Pool,
    tx: Sender<Post>,
    rx: Receiver<Post>,
    nr_foms: AtomicUsize,
    completed: AtomicU64,
    closing: AtomicBool,
    growths: AtomicU64,
    degraded: AtomicU64,
    phase_stats: Arc<SmStats>,
    state_stats: Arc<SmStats>,
    self_ref: Weak<LocalityInner>,
}

/// Scheduling domain bound to one CPU.
pub struct Locality {
    inner: Arc<LocalityInner>,
}

/// Weak reference to a locality, used to post callbacks to it.
#[derive(Clone)]
pub struct LocalityHandle {
    id: usize,
    inner: Weak<LocalityInner>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Doorbell {
    fn new() -> Self {
        Self {
            rung: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn ring(&self) {
        let mut rung: MutexGuard<bool> = self.rung.lock().unwrap_or_else(|e| e.into_inner());
        *rung = true;
        self.cv.notify_all();
    }

    /// Waits until the doorbell rings or `timeout` elapses, and silences it.
    fn wait(&self, timeout: Duration) {
        let mut rung: MutexGuard<bool> = self.rung.lock().unwrap_or_else(|e| e.into_inner());
        if !*rung {
            rung = match self.cv.wait_timeout(rung, timeout) {
                Ok((rung, _)) => rung,
                Err(e) => e.into_inner().0,
            };
        }
        *rung = false;
    }
}

impl Locality {
    /// Creates a locality and its initial threads. The first thread becomes the handler.
    pub fn new(id: usize, cpu: Option<usize>, config: &DomainConfig, services: Arc<Services>) -> Result<Self, Fail> {
        let phase_stats: Arc<SmStats> = Arc::new(SmStats::new("phase", Phase::COUNT)?);
        let state_stats: Arc<SmStats> = Arc::new(SmStats::new("state", FomState::COUNT)?);
        let (tx, rx): (Sender<Post>, Receiver<Post>) = crossbeam_channel::unbounded();
        let inner: Arc<LocalityInner> = Arc::new_cyclic(|self_ref| LocalityInner {
            id,
            cpu,
            config: config.clone(),
            services,
            group: Mutex::new(Group {
                foms: Slab::new(),
                runq: VecDeque::new(),
                waitq: HashSet::new(),
                timers: TimerQueue::new(Instant::now()),
                shutdown: false,
            }),
            idle: Condvar::new(),
            unblock: Condvar::new(),
            quiesce: Condvar::new(),
            doorbell: Doorbell::new(),
            pool: Pool::new(),
            tx,
            rx,
            nr_foms: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            growths: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            phase_stats,
            state_stats,
            self_ref: self_ref.clone(),
        });
        // Threads already started are joined when the locality is dropped.
        let locality: Locality = Self { inner };
        for _ in 0..config.idle_threads.max(1) {
            locality.inner.spawn()?;
        }
        debug!(
            "new(): locality {} on cpu {:?} with {} threads",
            id,
            cpu,
            locality.inner.pool.nr_threads()
        );
        Ok(locality)
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn cpu(&self) -> Option<usize> {
        self.inner.cpu
    }

    pub fn handle(&self) -> LocalityHandle {
        LocalityHandle {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Hands a fom over to this locality.
    pub(crate) fn queue(&self, fom: Box<Fom>) -> Result<(), Fail> {
        self.inner.queue(fom)
    }

    /// Number of foms owned by this locality.
    pub fn nr_foms(&self) -> usize {
        self.inner.nr_foms.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LocalityStats {
        self.inner.stats()
    }

    /// Dwell-time statistics of fom phases on this locality.
    pub fn phase_stats(&self) -> &SmStats {
        &self.inner.phase_stats
    }

    /// Dwell-time statistics of fom execution states on this locality.
    pub fn state_stats(&self) -> &SmStats {
        &self.inner.state_stats
    }

    /// Checks the invariants of the thread roster and of the queues.
    pub fn check_invariants(&self) -> Result<(), Fail> {
        let group: MutexGuard<Group> = self.inner.lock_group();
        self.inner.invariants(&group)
    }

    /// Waits until the locality owns no fom. Returns `false` on timeout.
    pub fn wait_quiescent(&self, timeout: Duration) -> bool {
        self.inner.wait_quiescent(Instant::now() + timeout)
    }

    /// Stops the locality and joins its threads. Foms still hosted are dropped.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

impl LocalityHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Posts a callback. Returns `false` if the locality is gone.
    pub(crate) fn post(&self, ast: Ast) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.post(Post::Ast(ast));
                true
            },
            None => {
                trace!("post(): locality {} is gone, dropping callback for {:?}", self.id, ast.target());
                false
            },
        }
    }

    /// Arms a deadline for a callback.
    pub(crate) fn post_timer(&self, expiry: Instant, ast: Ast) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.post(Post::Timer(expiry, ast));
                true
            },
            None => false,
        }
    }
}

impl LocalityInner {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) fn handle(&self) -> LocalityHandle {
        LocalityHandle {
            id: self.id,
            inner: self.self_ref.clone(),
        }
    }

    pub(crate) fn lock_group(&self) -> MutexGuard<Group> {
        self.group.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_group<'a>(cv: &Condvar, group: MutexGuard<'a, Group>, timeout: Duration) -> MutexGuard<'a, Group> {
        match cv.wait_timeout(group, timeout) {
            Ok((group, _)) => group,
            Err(e) => e.into_inner().0,
        }
    }

    fn queue(&self, fom: Box<Fom>) -> Result<(), Fail> {
        if self.closing.load(Ordering::Acquire) {
            let cause: String = format!("locality {} is shutting down", self.id);
            warn!("queue(): {}", cause);
            return Err(Fail::new(libc::ESHUTDOWN, &cause));
        }
        self.nr_foms.fetch_add(1, Ordering::AcqRel);
        self.post(Post::Queue(fom));
        Ok(())
    }

    fn post(&self, post: Post) {
        // The receiver lives as long as the locality.
        if self.tx.send(post).is_err() {
            error!("post(): locality {} inbound channel closed", self.id);
        }
        self.doorbell.ring();
    }

    /// Starts one more thread. It registers as idle.
    fn spawn(&self) -> Result<(), Fail> {
        let inner: Arc<LocalityInner> = match self.self_ref.upgrade() {
            Some(inner) => inner,
            None => return Err(Fail::new(libc::ESHUTDOWN, "locality is gone")),
        };
        let idle: Idle = self.pool.add_idle();
        let index: usize = idle.index();
        let name: String = format!("fom-{}-{}", self.id, index);
        match thread::Builder::new().name(name).spawn(move || inner.thread_main(idle)) {
            Ok(handle) => {
                self.pool.set_handle(index, handle);
                Ok(())
            },
            Err(e) => {
                self.pool.retire(index);
                let cause: String = format!("failed to spawn thread for locality {} ({})", self.id, e);
                error!("spawn(): {}", cause);
                Err(Fail::new(e.raw_os_error().unwrap_or(libc::EAGAIN), &cause))
            },
        }
    }

    fn bind_cpu(&self) {
        let cpu: usize = match self.cpu {
            Some(cpu) if self.config.bind_cpus => cpu,
            _ => return,
        };
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                // Safety: the set is a plain bit mask owned by this frame.
                let rc: libc::c_int = unsafe {
                    let mut set: libc::cpu_set_t = mem::zeroed();
                    libc::CPU_ZERO(&mut set);
                    libc::CPU_SET(cpu, &mut set);
                    libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
                };
                if rc != 0 {
                    let e: ::std::io::Error = ::std::io::Error::last_os_error();
                    warn!("bind_cpu(): locality {} cannot bind to cpu {} ({})", self.id, cpu, e);
                }
            } else {
                trace!("bind_cpu(): locality {} left unbound from cpu {}", self.id, cpu);
            }
        }
    }

    fn thread_main(&self, idle: Idle) {
        self.bind_cpu();
        let mut idle: Idle = idle;
        let mut group: MutexGuard<Group> = self.lock_group();
        loop {
            loop {
                if group.shutdown {
                    trace!("thread_main(): locality {} thread {} exits", self.id, idle.index());
                    return;
                }
                if !self.pool.has_handler() && self.pool.nr_unblocking() == 0 {
                    break;
                }
                group = Self::wait_group(&self.idle, group, self.config.run_timeout);
            }
            let handler: Handler = idle.promote(&self.pool);
            let (g, i) = self.handle_foms(group, handler);
            group = g;
            idle = i;
        }
    }

    /// Handler loop. Returns once the thread gave the handler role up.
    fn handle_foms<'a>(&'a self, group: MutexGuard<'a, Group>, handler: Handler) -> (MutexGuard<'a, Group>, Idle) {
        trace!("handle_foms(): locality {} thread {} is handler", self.id, handler.index());
        let mut group: MutexGuard<'a, Group> = group;
        let mut handler: Handler = handler;
        loop {
            if group.shutdown || self.pool.nr_unblocking() > 0 {
                let idle: Idle = handler.yield_(&self.pool);
                self.unblock.notify_all();
                return (group, idle);
            }
            self.drain_inbound(&mut group);
            self.fire_timers(&mut group);
            if let Some(index) = group.runq.pop_front() {
                let (g, h) = self.run(group, handler, index);
                group = g;
                handler = h;
                continue;
            }

            if cfg!(debug_assertions) {
                if let Err(e) = self.invariants(&group) {
                    panic!("handle_foms(): locality {}: {}", self.id, e);
                }
            }
            self.post_telemetry(&group);
            let now: Instant = Instant::now();
            let timeout: Duration = match group.timers.next_expiry() {
                Some(expiry) => expiry.saturating_duration_since(now).min(self.config.run_timeout),
                None => self.config.run_timeout,
            };
            drop(group);
            self.doorbell.wait(timeout);
            group = self.lock_group();
        }
    }

    fn drain_inbound(&self, group: &mut Group) {
        while let Ok(post) = self.rx.try_recv() {
            match post {
                Post::Queue(fom) => self.insert(group, fom),
                Post::Ast(ast) => self.deliver(group, ast),
                Post::Timer(expiry, ast) => {
                    let clink = ast.clink().clone();
                    group.timers.push(expiry, clink, ast);
                },
            }
        }
    }

    fn fire_timers(&self, group: &mut Group) {
        if group.timers.is_empty() {
            return;
        }
        for ast in group.timers.advance_clock(Instant::now()) {
            self.deliver(group, ast);
        }
    }

    /// Takes a new fom in and puts it on the run queue.
    fn insert(&self, group: &mut Group, fom: Box<Fom>) {
        let mut fom: Box<Fom> = fom;
        let entry = group.foms.vacant_entry();
        let id: FomId = FomId {
            locality: self.id,
            index: entry.key(),
            seq: fom.core.seq(),
        };
        fom.core.set_id(id);
        fom.core.attach_stats(self.phase_stats.clone(), self.state_stats.clone());
        fom.core.move_state(FomState::Ready);
        fom.core.enqueued();
        trace!("insert(): {} fom {:?}", fom.name(), id);
        entry.insert(FomSlot {
            fom: Some(fom),
            pending: Vec::new(),
            owner: None,
            seq: id.seq,
        });
        group.runq.push_back(id.index);
    }

    /// Delivers a callback to its fom, or keeps it pending if the fom is queued or running.
    fn deliver(&self, group: &mut Group, ast: Ast) {
        let target: FomId = ast.target();
        let waiting: bool = match group.foms.get(target.index) {
            Some(slot) if slot.seq == target.seq => slot
                .fom
                .as_ref()
                .is_some_and(|fom| fom.core.state() == FomState::Waiting),
            _ => {
                trace!("deliver(): fom {:?} is gone", target);
                return;
            },
        };
        if waiting {
            self.deliver_parked(group, target.index, ast);
        } else if let Some(slot) = group.foms.get_mut(target.index) {
            slot.pending.push(ast);
        }
    }

    /// Runs a callback against a waiting fom. Returns `true` if the fom went back to the run queue.
    fn deliver_parked(&self, group: &mut Group, index: usize, ast: Ast) -> bool {
        let wake: Option<Wake> = match group.foms.get_mut(index).and_then(|slot| slot.fom.as_mut()) {
            Some(fom) => ast.deliver(&mut fom.core),
            None => None,
        };
        if wake == Some(Wake::Ready) {
            self.wakeup(group, index);
            return true;
        }
        false
    }

    /// Moves a waiting fom to the tail of the run queue.
    fn wakeup(&self, group: &mut Group, index: usize) {
        group.waitq.remove(&index);
        if let Some(fom) = group.foms.get_mut(index).and_then(|slot| slot.fom.as_mut()) {
            fom.core.move_state(FomState::Ready);
            fom.core.enqueued();
        }
        let was_empty: bool = group.runq.is_empty();
        group.runq.push_back(index);
        if was_empty {
            self.doorbell.ring();
        }
    }

    /// Ticks a fom until it waits, then parks or finalises it.
    fn run<'a>(
        &'a self,
        group: MutexGuard<'a, Group>,
        handler: Handler,
        index: usize,
    ) -> (MutexGuard<'a, Group>, Handler) {
        let mut group: MutexGuard<'a, Group> = group;
        let (mut fom, seq): (Box<Fom>, u64) = match group.foms.get_mut(index) {
            Some(slot) => match slot.fom.take() {
                Some(fom) => {
                    slot.owner = Some(handler.index());
                    (fom, slot.seq)
                },
                None => panic!("run(): fom {} is queued while running", index),
            },
            None => panic!("run(): fom {} is queued but not hosted", index),
        };
        fom.core.move_state(FomState::Running);

        let id: FomId = FomId {
            locality: self.id,
            index,
            seq,
        };
        let mut ctx: FomContext = FomContext::new(self, group, handler, id);
        {
            let Fom { core, ops } = &mut *fom;
            while ops.tick(core, &mut ctx) == Outcome::Again {
                assert_ne!(
                    core.phase(),
                    Phase::Finish,
                    "run(): {} asked for another tick after finishing",
                    ops.name()
                );
            }
        }
        let (mut group, handler): (MutexGuard<'a, Group>, Handler) = ctx.finish();

        if fom.core.phase() == Phase::Finish {
            fom.core.move_state(FomState::Finish);
            let slot: FomSlot = group.foms.remove(index);
            if !slot.pending.is_empty() {
                trace!("run(): {:?} finished with {} callbacks pending", id, slot.pending.len());
            }
            trace!("run(): {} fom {:?} finished ({})", fom.name(), id, fom.core.rc());
            {
                let Fom { core, ops } = &mut *fom;
                ops.fini(core);
            }
            drop(fom);
            self.completed.fetch_add(1, Ordering::AcqRel);
            if self.nr_foms.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.quiesce.notify_all();
            }
            return (group, handler);
        }

        fom.core.move_state(FomState::Waiting);
        group.waitq.insert(index);
        let mut pending: Vec<Ast> = match group.foms.get_mut(index) {
            Some(slot) => {
                slot.owner = None;
                slot.fom = Some(fom);
                mem::take(&mut slot.pending)
            },
            None => panic!("run(): fom {} lost its slot", index),
        };
        // Callbacks that arrived while the fom ran. Stop as soon as one makes it ready.
        while let Some(ast) = pending.pop() {
            if self.deliver_parked(&mut group, index, ast) {
                break;
            }
        }
        if !pending.is_empty() {
            if let Some(slot) = group.foms.get_mut(index) {
                pending.append(&mut slot.pending);
                slot.pending = pending;
            }
        }
        (group, handler)
    }

    /// First half of block-enter, with the group lock held: makes sure some thread takes the handler role over.
    pub(crate) fn hand_over(&self, group: &Group) -> Result<(), Fail> {
        // An unblocking thread takes over.
        if self.pool.nr_unblocking() > 0 {
            return Ok(());
        }
        if !group.shutdown && self.pool.counts().idle == 0 {
            self.grow()?;
        }
        self.idle.notify_one();
        Ok(())
    }

    /// Second half of block-enter: gives the handler role and the group lock up.
    pub(crate) fn block(&self, group: MutexGuard<Group>, handler: Handler) -> Blocked {
        let blocked: Blocked = handler.block(&self.pool);
        self.unblock.notify_all();
        drop(group);
        blocked
    }

    /// Block-leave: waits for the handler role and takes the group lock back.
    pub(crate) fn unblock(&self, blocked: Blocked) -> (MutexGuard<Group>, Handler) {
        let (unblocking, was_zero) = blocked.unblock(&self.pool);
        if was_zero {
            self.doorbell.ring();
        }
        let mut group: MutexGuard<Group> = self.lock_group();
        while self.pool.has_handler() {
            self.doorbell.ring();
            group = Self::wait_group(&self.unblock, group, self.config.run_timeout);
        }
        let handler: Handler = unblocking.acquire(&self.pool);
        (group, handler)
    }

    /// Adds one idle thread, within the limits of the overflow policy.
    fn grow(&self) -> Result<(), Fail> {
        let nr_threads: usize = self.pool.nr_threads();
        if let Some(max_threads) = self.config.max_threads {
            if nr_threads >= max_threads {
                match self.config.overflow_policy {
                    OverflowPolicy::Grow => {
                        warn!("grow(): locality {} goes over {} threads", self.id, max_threads);
                    },
                    OverflowPolicy::Degrade => {
                        warn!("grow(): locality {} stays at {} threads", self.id, nr_threads);
                        self.degraded.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    },
                    OverflowPolicy::Reject => {
                        let cause: String = format!("locality {} has {} threads already", self.id, nr_threads);
                        warn!("grow(): {}", cause);
                        return Err(Fail::new(libc::EAGAIN, &cause));
                    },
                }
            }
        }
        match self.spawn() {
            Ok(()) => {
                self.growths.fetch_add(1, Ordering::Relaxed);
                info!("grow(): locality {} now has {} threads", self.id, nr_threads + 1);
            },
            Err(e) => {
                // A blocked thread becomes handler again once its call returns.
                warn!("grow(): locality {} cannot grow ({})", self.id, e);
                self.degraded.fetch_add(1, Ordering::Relaxed);
            },
        }
        Ok(())
    }

    fn post_telemetry(&self, group: &Group) {
        self.services.telemetry.post(TelemetryRecord::RunQueue {
            locality: self.id,
            len: group.runq.len(),
        });
        self.services.telemetry.post(TelemetryRecord::WaitQueue {
            locality: self.id,
            len: group.waitq.len(),
        });
    }

    fn stats(&self) -> LocalityStats {
        let group: MutexGuard<Group> = self.lock_group();
        LocalityStats {
            id: self.id,
            cpu: self.cpu,
            runq: group.runq.len(),
            waitq: group.waitq.len(),
            foms: self.nr_foms.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            timers: group.timers.len(),
            pending: group.foms.iter().map(|(_, slot)| slot.pending.len()).sum(),
            threads: self.pool.counts(),
            growths: self.growths.load(Ordering::Relaxed),
            degraded_growths: self.degraded.load(Ordering::Relaxed),
        }
    }

    fn invariants(&self, group: &Group) -> Result<(), Fail> {
        self.pool.check()?;
        let fail = |cause: String| Err(Fail::new(libc::EINVAL, &cause));

        let mut queued: HashSet<usize> = HashSet::new();
        for index in group.runq.iter() {
            if !queued.insert(*index) {
                return fail(format!("fom {} is on the run queue twice", index));
            }
            if group.waitq.contains(index) {
                return fail(format!("fom {} is on both queues", index));
            }
        }
        for index in queued.iter().chain(group.waitq.iter()) {
            if !group.foms.contains(*index) {
                return fail(format!("queued fom {} is not hosted", index));
            }
        }
        for (index, slot) in group.foms.iter() {
            match slot.fom.as_ref() {
                Some(fom) => {
                    let state: FomState = fom.core.state();
                    if (state == FomState::Ready) != queued.contains(&index) {
                        return fail(format!("fom {} is {:?} but run queue membership disagrees", index, state));
                    }
                    if (state == FomState::Waiting) != group.waitq.contains(&index) {
                        return fail(format!("fom {} is {:?} but wait queue membership disagrees", index, state));
                    }
                    if slot.owner.is_some() {
                        return fail(format!("parked fom {} has an owner", index));
                    }
                    if !slot.pending.is_empty() && state != FomState::Ready {
                        return fail(format!("fom {} is {:?} with callbacks pending", index, state));
                    }
                },
                None => {
                    if slot.owner.is_none() {
                        return fail(format!("running fom {} has no owner", index));
                    }
                    if queued.contains(&index) || group.waitq.contains(&index) {
                        return fail(format!("running fom {} is queued", index));
                    }
                },
            }
        }
        Ok(())
    }

    fn wait_quiescent(&self, deadline: Instant) -> bool {
        let mut group: MutexGuard<Group> = self.lock_group();
        while self.nr_foms.load(Ordering::Acquire) > 0 {
            let now: Instant = Instant::now();
            if now >= deadline {
                return false;
            }
            let timeout: Duration = deadline.duration_since(now).min(self.config.run_timeout);
            group = Self::wait_group(&self.quiesce, group, timeout);
        }
        true
    }

    fn teardown(&self) {
        let mut group: MutexGuard<Group> = self.lock_group();
        if !group.shutdown {
            debug!("teardown(): locality {}", self.id);
        }
        group.shutdown = true;
        self.closing.store(true, Ordering::Release);
        self.idle.notify_all();
        self.unblock.notify_all();
        self.doorbell.ring();

        // Threads take the group lock to change roles, so it is released around each join.
        while let Some((index, handle)) = self.pool.take_handle() {
            drop(group);
            let joined: bool = handle.join().is_ok();
            group = self.lock_group();
            if joined {
                self.pool.retire(index);
            } else {
                error!("teardown(): locality {} thread {} panicked", self.id, index);
                self.pool.discard(index);
            }
        }

        while let Ok(post) = self.rx.try_recv() {
            if let Post::Queue(fom) = post {
                warn!("teardown(): locality {} drops queued {} fom", self.id, fom.name());
                self.nr_foms.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if !group.foms.is_empty() {
            warn!("teardown(): locality {} drops {} foms", self.id, group.foms.len());
            self.nr_foms.fetch_sub(group.foms.len(), Ordering::AcqRel);
            group.foms.clear();
            group.runq.clear();
            group.waitq.clear();
        }
        self.quiesce.notify_all();
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Locality {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
