// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::common::{
    Finished,
    ScriptFom,
    TestStorage,
    TIMEOUT,
};
use ::anyhow::{
    anyhow,
    ensure,
    Result,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::fomkernel::{
    ensure_eq,
    fom::{
        ast::{
            Callback,
            FomWaker,
            Wake,
            Wakeup,
        },
        locality::Locality,
        long_lock::LongLock,
        thread::RoleCounts,
    },
    reqh::services::{
        ChannelTelemetry,
        PostedReply,
        Services,
        TelemetryRecord,
    },
    runtime::{
        chan::{
            Chan,
            Clink,
        },
        logging,
    },
    DomainConfig,
    Fail,
    FomCore,
    FomDomain,
    LocalityStats,
    OverflowPolicy,
    Phase,
    Step,
};
use ::std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
    thread,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Phases ticked by a fom that goes through the whole pipeline without waiting.
const SUCCESS_PATH: [Phase; 12] = [
    Phase::Init,
    Phase::Authenticate,
    Phase::ResourceLocal,
    Phase::ResourceDistributed,
    Phase::ObjectCheck,
    Phase::Authorisation,
    Phase::TxnContext,
    Phase::TypeSpecific,
    Phase::Success,
    Phase::FolRecAdd,
    Phase::TxnCommit,
    Phase::QueueReply,
];

//======================================================================================================================
// Structures
//======================================================================================================================

/// Callback that reports its label when it fires.
struct Labelled {
    label: &'static str,
    wake: Wake,
    fired: Sender<&'static str>,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Callback for Labelled {
    fn fire(self: Box<Self>, _fom: &mut FomCore) -> Wake {
        let _ = self.fired.send(self.label);
        self.wake
    }
}

//======================================================================================================================
// Helpers
//======================================================================================================================

fn domain(config: &DomainConfig, services: Services) -> Result<FomDomain> {
    logging::initialize();
    Ok(FomDomain::new(config, Arc::new(services))?)
}

fn first_locality(domain: &FomDomain) -> Result<&Locality> {
    domain.locality(0).ok_or_else(|| anyhow!("domain has no locality"))
}

fn roles(handler: usize, blocked: usize, idle: usize) -> RoleCounts {
    RoleCounts {
        handler,
        blocked,
        unblocking: 0,
        idle,
    }
}

/// Waits until every locality of `domain` satisfies `cond`.
fn wait_stats<F: Fn(&[LocalityStats]) -> bool>(domain: &FomDomain, cond: F) -> bool {
    common::wait_until(TIMEOUT, || cond(domain.stats().as_slice()))
}

fn finished(rx: &Receiver<Finished>, n: usize) -> Result<Vec<Finished>> {
    let mut all: Vec<Finished> = Vec::with_capacity(n);
    for _ in 0..n {
        all.push(rx.recv_timeout(TIMEOUT)?);
    }
    Ok(all)
}

/// Runs a fom that posts callbacks `a` then `b` to itself from inside a blocking section, then waits. Returns the
/// labels of the callbacks in firing order.
fn callbacks_posted_while_blocked(a_wakes: Wake, b_wakes: Wake) -> Result<(Vec<&'static str>, Finished)> {
    let (services, _replies): (Services, Receiver<PostedReply>) = common::services(TestStorage::new(false));
    let domain: FomDomain = domain(&common::config(1), services)?;
    let locality: &Locality = first_locality(&domain)?;
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();
    let (fired_tx, fired_rx): (Sender<&'static str>, Receiver<&'static str>) = crossbeam_channel::unbounded();
    let (posted_tx, posted_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();
    let (go_tx, go_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();

    let mut parked: bool = false;
    let fom: ScriptFom = ScriptFom::new(13, done_tx, move |_, ctx| {
        if parked {
            return Ok(Step::Done);
        }
        parked = true;
        let a: FomWaker = ctx.waker(Box::new(Labelled {
            label: "a",
            wake: a_wakes,
            fired: fired_tx.clone(),
        }));
        let b: FomWaker = ctx.waker(Box::new(Labelled {
            label: "b",
            wake: b_wakes,
            fired: fired_tx.clone(),
        }));
        let (posted, go): (Sender<()>, Receiver<()>) = (posted_tx.clone(), go_rx.clone());
        ctx.blocking(move || {
            let _ = a.wake();
            let _ = b.wake();
            let _ = posted.send(());
            go.recv_timeout(TIMEOUT)
                .map_err(|_| Fail::new(libc::ETIMEDOUT, "never released"))
        })?;
        Ok(Step::Wait)
    });
    domain.queue(fom.into_fom())?;

    // Both callbacks are taken in while the fom is still blocked, and kept.
    posted_rx.recv_timeout(TIMEOUT)?;
    ensure!(common::wait_until(TIMEOUT, || locality.stats().pending == 2));
    locality.check_invariants()?;
    ensure!(fired_rx.try_recv().is_err(), "callback fired while its fom was blocked");

    go_tx.send(())?;
    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure!(domain.wait_quiescent(TIMEOUT));
    ensure_eq!(locality.stats().pending, 0);
    locality.check_invariants()?;
    Ok((fired_rx.try_iter().collect(), done))
}

/// Home locality key of fom `tag`.
fn hash(tag: u64) -> u64 {
    tag.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 17
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// A fom that never waits runs every phase of the pipeline once and posts one reply, without growing the pool.
#[test]
fn single_fom_runs_the_pipeline_once() -> Result<()> {
    let storage: TestStorage = TestStorage::new(false);
    let counters = storage.counters();
    let (mut services, replies): (Services, Receiver<PostedReply>) = common::services(storage);
    let (telemetry, records): (ChannelTelemetry, Receiver<TelemetryRecord>) = ChannelTelemetry::new();
    services.telemetry = Arc::new(telemetry);
    let domain: FomDomain = domain(&common::config(1), services)?;

    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();
    ensure_eq!(domain.queue(ScriptFom::noop(1, done_tx).into_fom())?, 0);

    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure_eq!(done.rc, 0);
    ensure_eq!(done.locality, Some(0));
    ensure_eq!(done.phases, SUCCESS_PATH.to_vec());
    ensure_eq!(done.enqueues, 1);

    let posted: PostedReply = replies.recv_timeout(TIMEOUT)?;
    ensure_eq!(posted.reply.rc, 0);
    ensure_eq!(posted.item.session, 1);
    ensure!(replies.try_recv().is_err(), "reply posted twice");

    ensure!(domain.wait_quiescent(TIMEOUT));
    let stats: LocalityStats = first_locality(&domain)?.stats();
    ensure_eq!(stats.completed, 1);
    ensure_eq!(stats.growths, 0);
    ensure_eq!(stats.degraded_growths, 0);
    ensure_eq!(counters.get(), (1, 1, 0));
    ensure!(records
        .try_iter()
        .any(|r| matches!(r, TelemetryRecord::Phase { phase: Phase::QueueReply, .. })));
    first_locality(&domain)?.check_invariants()?;
    Ok(())
}

/// A blocking transaction open grows the pool by one thread and keeps exactly one handler throughout.
#[test]
fn blocking_call_grows_the_pool_by_one() -> Result<()> {
    let (storage, gate) = TestStorage::gated();
    let counters = storage.counters();
    let (services, _replies): (Services, Receiver<PostedReply>) = common::services(storage);
    let config: DomainConfig = DomainConfig {
        idle_threads: 1,
        ..common::config(1)
    };
    let domain: FomDomain = domain(&config, services)?;
    let locality: &Locality = first_locality(&domain)?;

    ensure!(common::wait_until(TIMEOUT, || locality.stats().threads == roles(1, 0, 0)));

    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();
    domain.queue(ScriptFom::noop(2, done_tx).into_fom())?;
    gate.entered.recv_timeout(TIMEOUT)?;

    // The thread stuck in storage is blocked and the new one took the handler role over.
    ensure!(common::wait_until(TIMEOUT, || locality.stats().threads == roles(1, 1, 0)));
    ensure_eq!(locality.stats().growths, 1);
    locality.check_invariants()?;

    gate.release.send(())?;
    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure_eq!(done.rc, 0);
    ensure!(domain.wait_quiescent(TIMEOUT));

    ensure!(common::wait_until(TIMEOUT, || locality.stats().threads == roles(1, 0, 1)));
    let stats: LocalityStats = locality.stats();
    ensure_eq!(stats.growths, 1);
    ensure_eq!(stats.degraded_growths, 0);
    ensure_eq!(counters.get(), (1, 1, 0));
    locality.check_invariants()?;
    Ok(())
}

/// A woken fom goes to the tail of the run queue.
#[test]
fn woken_fom_is_served_after_queued_foms() -> Result<()> {
    let (services, _replies): (Services, Receiver<PostedReply>) = common::services(TestStorage::new(false));
    let domain: FomDomain = domain(&common::config(1), services)?;
    let chan: Arc<Chan> = Arc::new(Chan::new());
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();
    let (started_tx, started_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();
    let (go_tx, go_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();

    let a_chan: Arc<Chan> = chan.clone();
    let mut armed: bool = false;
    let a: ScriptFom = ScriptFom::new(0, done_tx.clone(), move |_, ctx| {
        if armed {
            return Ok(Step::Done);
        }
        armed = true;
        let _ = started_tx.send(());
        // Keeps the handler busy until B and C are queued.
        if go_rx.recv_timeout(TIMEOUT).is_err() {
            return Err(Fail::new(libc::ETIMEDOUT, "never released"));
        }
        let _ = ctx.wait_on(&a_chan, Box::new(Wakeup));
        Ok(Step::Wait)
    });
    let b_chan: Arc<Chan> = chan.clone();
    let b: ScriptFom = ScriptFom::new(1, done_tx.clone(), move |_, _| {
        if !b_chan.signal() {
            return Err(Fail::new(libc::ENOENT, "nobody waits"));
        }
        Ok(Step::Done)
    });
    let c: ScriptFom = ScriptFom::noop(2, done_tx);

    domain.queue(a.into_fom())?;
    started_rx.recv_timeout(TIMEOUT)?;
    domain.queue(b.into_fom())?;
    domain.queue(c.into_fom())?;
    go_tx.send(())?;

    let done: Vec<Finished> = finished(&done_rx, 3)?;
    ensure_eq!(done.iter().map(|f| f.tag).collect::<Vec<u64>>(), vec![1, 2, 0]);
    ensure!(done.iter().all(|f| f.rc == 0));
    ensure_eq!(done[2].phases.iter().filter(|p| **p == Phase::TypeSpecific).count(), 2);
    Ok(())
}

/// Callbacks that arrive while their fom is blocked are delivered last in, first out once it parks.
#[test]
fn pending_callbacks_are_delivered_last_in_first_out() -> Result<()> {
    let (fired, done): (Vec<&'static str>, Finished) = callbacks_posted_while_blocked(Wake::Ready, Wake::Stay)?;
    ensure_eq!(fired, vec!["b", "a"]);
    ensure_eq!(done.rc, 0);
    // Queued once, woken once by `a`.
    ensure_eq!(done.enqueues, 2);
    ensure_eq!(done.phases.iter().filter(|p| **p == Phase::TypeSpecific).count(), 2);
    Ok(())
}

/// Delivery of pending callbacks stops at the first one that makes the fom ready again.
#[test]
fn pending_delivery_stops_once_the_fom_is_ready() -> Result<()> {
    let (fired, done): (Vec<&'static str>, Finished) = callbacks_posted_while_blocked(Wake::Ready, Wake::Ready)?;
    ensure_eq!(fired, vec!["b"]);
    ensure_eq!(done.rc, 0);
    ensure_eq!(done.enqueues, 2);
    Ok(())
}

/// A failed authorisation unwinds through failure, abort and reply, and never commits.
#[test]
fn failed_authorisation_never_commits() -> Result<()> {
    let storage: TestStorage = TestStorage::new(true);
    let counters = storage.counters();
    let (services, replies): (Services, Receiver<PostedReply>) = common::services(storage);
    let domain: FomDomain = domain(&common::config(1), services)?;
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();

    let fom: ScriptFom = ScriptFom::noop(4, done_tx).fail_at(Phase::Authorisation, libc::EINVAL);
    domain.queue(fom.into_fom())?;

    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure_eq!(done.rc, -libc::EINVAL);
    ensure_eq!(
        done.phases,
        vec![
            Phase::Init,
            Phase::Authenticate,
            Phase::ResourceLocal,
            Phase::ResourceDistributed,
            Phase::ObjectCheck,
            Phase::Authorisation,
            Phase::Failure,
            Phase::TxnAbort,
            Phase::QueueReply,
        ]
    );
    ensure!(!done.phases.contains(&Phase::TxnCommit));

    let posted: PostedReply = replies.recv_timeout(TIMEOUT)?;
    ensure_eq!(posted.reply.rc, -libc::EINVAL);
    ensure!(posted.reply.is_generic_error());
    ensure_eq!(counters.get(), (0, 0, 0));
    Ok(())
}

/// A type-specific failure aborts the transaction opened before it.
#[test]
fn type_specific_failure_aborts_the_transaction() -> Result<()> {
    let storage: TestStorage = TestStorage::new(true);
    let counters = storage.counters();
    let (services, replies): (Services, Receiver<PostedReply>) = common::services(storage);
    let domain: FomDomain = domain(&common::config(1), services)?;
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();

    let fom: ScriptFom = ScriptFom::new(5, done_tx, |_, _| Err(Fail::new(libc::EIO, "disk on fire")));
    domain.queue(fom.into_fom())?;

    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure_eq!(done.rc, -libc::EIO);
    ensure!(done.phases.ends_with(&[
        Phase::TypeSpecific,
        Phase::Failure,
        Phase::TxnAbort,
        Phase::QueueReply
    ]));
    ensure_eq!(replies.recv_timeout(TIMEOUT)?.reply.rc, -libc::EIO);
    ensure_eq!(counters.get(), (1, 0, 1));
    Ok(())
}

/// Teardown waits for a thread blocked in a slow call, then joins every thread.
#[test]
fn teardown_waits_for_blocked_thread() -> Result<()> {
    let (storage, gate) = TestStorage::gated();
    let (services, _replies): (Services, Receiver<PostedReply>) = common::services(storage);
    let domain: FomDomain = domain(&common::config(1), services)?;
    let locality: &Locality = first_locality(&domain)?;
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();

    domain.queue(ScriptFom::noop(6, done_tx).into_fom())?;
    gate.entered.recv_timeout(TIMEOUT)?;
    ensure!(common::wait_until(TIMEOUT, || locality.stats().threads == roles(1, 1, 0)));

    thread::scope(|s| -> Result<()> {
        let teardown = s.spawn(|| locality.teardown());
        thread::sleep(Duration::from_millis(50));
        ensure!(!teardown.is_finished(), "teardown did not wait for the blocked thread");
        gate.release.send(())?;
        teardown.join().map_err(|_| anyhow!("teardown panicked"))?;
        Ok(())
    })?;

    let stats: LocalityStats = locality.stats();
    ensure_eq!(stats.threads, RoleCounts::default());
    ensure_eq!(stats.completed, 1);
    ensure_eq!(stats.foms, 0);
    ensure_eq!(done_rx.try_recv()?.rc, 0);

    // Nothing is accepted once the locality is down.
    let (late_tx, _late_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();
    match domain.queue(ScriptFom::noop(7, late_tx).into_fom()) {
        Err(e) => ensure_eq!(e.errno, libc::ESHUTDOWN),
        Ok(_) => anyhow::bail!("fom queued to a torn down locality"),
    }
    Ok(())
}

/// Foms spread over four localities by a hashed home key: counts add up at every stable point and each fom stays on
/// the locality it was queued to.
#[test]
fn thousand_foms_on_four_localities() -> Result<()> {
    const NR_FOMS: u64 = 1000;
    const NR_LOCALITIES: usize = 4;

    let (services, _replies): (Services, Receiver<PostedReply>) = common::services(TestStorage::new(false));
    let domain: FomDomain = domain(&common::config(NR_LOCALITIES), services)?;
    let chan: Arc<Chan> = Arc::new(Chan::new());
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();
    let (seen_tx, seen_rx): (Sender<(u64, usize)>, Receiver<(u64, usize)>) = crossbeam_channel::unbounded();

    for tag in 0..NR_FOMS {
        let chan: Arc<Chan> = chan.clone();
        let seen: Sender<(u64, usize)> = seen_tx.clone();
        let mut parked: bool = false;
        let fom: ScriptFom = ScriptFom::new(tag, done_tx.clone(), move |_, ctx| {
            let _ = seen.send((tag, ctx.locality_id()));
            if parked {
                return Ok(Step::Done);
            }
            parked = true;
            let _ = ctx.wait_on(&chan, Box::new(Wakeup));
            Ok(Step::Wait)
        })
        .home(hash(tag));
        let locality: usize = domain.queue(fom.into_fom())?;
        ensure_eq!(locality as u64, hash(tag) % NR_LOCALITIES as u64);
    }

    let sum = |stats: &[LocalityStats]| -> (usize, u64, usize, usize) {
        stats.iter().fold((0, 0, 0, 0), |(foms, completed, runq, waitq), s| {
            (foms + s.foms, completed + s.completed, runq + s.runq, waitq + s.waitq)
        })
    };

    ensure!(wait_stats(&domain, |stats| sum(stats).3 == NR_FOMS as usize));
    ensure_eq!(sum(&domain.stats()), (NR_FOMS as usize, 0, 0, NR_FOMS as usize));
    for locality in domain.localities() {
        locality.check_invariants()?;
    }

    for _ in 0..400 {
        ensure!(chan.signal());
    }
    ensure!(wait_stats(&domain, |stats| sum(stats).1 == 400));
    ensure!(wait_stats(&domain, |stats| sum(stats).2 == 0));
    let (foms, completed, _, waitq): (usize, u64, usize, usize) = sum(&domain.stats());
    ensure_eq!(foms as u64, NR_FOMS - completed);
    ensure_eq!(waitq, 600);
    for locality in domain.localities() {
        locality.check_invariants()?;
    }

    ensure_eq!(chan.broadcast(), 600);
    ensure!(domain.wait_quiescent(TIMEOUT));
    let (foms, completed, runq, waitq): (usize, u64, usize, usize) = sum(&domain.stats());
    ensure_eq!((foms, completed, runq, waitq), (0, NR_FOMS, 0, 0));

    let done: Vec<Finished> = finished(&done_rx, NR_FOMS as usize)?;
    ensure!(done.iter().all(|f| f.rc == 0));

    let mut seen: HashMap<u64, HashSet<usize>> = HashMap::new();
    for (tag, locality) in seen_rx.try_iter() {
        seen.entry(tag).or_default().insert(locality);
    }
    ensure_eq!(seen.len(), NR_FOMS as usize);
    for (tag, localities) in seen.iter() {
        let home: usize = (hash(*tag) % NR_LOCALITIES as u64) as usize;
        ensure_eq!(localities.iter().copied().collect::<Vec<usize>>(), vec![home]);
    }
    Ok(())
}

/// A cancelled wait is never delivered; cancelling a delivered one changes nothing.
#[test]
fn cancelled_wait_is_never_delivered() -> Result<()> {
    let (services, _replies): (Services, Receiver<PostedReply>) = common::services(TestStorage::new(false));
    let domain: FomDomain = domain(&common::config(1), services)?;
    let quiet: Arc<Chan> = Arc::new(Chan::new());
    let wake: Arc<Chan> = Arc::new(Chan::new());
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();
    let (clink_tx, clink_rx): (Sender<Clink>, Receiver<Clink>) = crossbeam_channel::unbounded();

    let (q, w): (Arc<Chan>, Arc<Chan>) = (quiet.clone(), wake.clone());
    let mut parked: bool = false;
    let fom: ScriptFom = ScriptFom::new(8, done_tx, move |_, ctx| {
        if parked {
            return Ok(Step::Done);
        }
        parked = true;
        let cancelled: Clink = ctx.wait_on(&q, Box::new(Wakeup));
        cancelled.cancel();
        let armed: Clink = ctx.wait_on(&w, Box::new(Wakeup));
        let _ = clink_tx.send(cancelled);
        let _ = clink_tx.send(armed);
        Ok(Step::Wait)
    });
    domain.queue(fom.into_fom())?;

    let cancelled: Clink = clink_rx.recv_timeout(TIMEOUT)?;
    let armed: Clink = clink_rx.recv_timeout(TIMEOUT)?;
    ensure!(wait_stats(&domain, |stats| stats[0].waitq == 1));

    ensure!(!quiet.signal(), "cancelled waiter was signalled");
    ensure_eq!(quiet.nr_waiters(), 0);
    ensure!(cancelled.is_cancelled());
    ensure!(!cancelled.cancel());
    ensure_eq!(domain.stats()[0].waitq, 1);

    ensure!(wake.signal());
    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure_eq!(done.rc, 0);
    ensure!(armed.is_done());
    ensure!(!armed.cancel());
    ensure!(armed.is_done());
    Ok(())
}

/// A timer sharing the clink of a wait ends it in a timeout when nothing else arrives first.
#[test]
fn expired_wait_moves_to_timeout() -> Result<()> {
    let storage: TestStorage = TestStorage::new(false);
    let counters = storage.counters();
    let (services, replies): (Services, Receiver<PostedReply>) = common::services(storage);
    let domain: FomDomain = domain(&common::config(1), services)?;
    let chan: Arc<Chan> = Arc::new(Chan::new());
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();

    let c: Arc<Chan> = chan.clone();
    let fom: ScriptFom = ScriptFom::new(9, done_tx, move |_, ctx| {
        let clink: Clink = ctx.wait_on(&c, Box::new(Wakeup));
        ctx.timeout(&clink, Duration::from_millis(20));
        Ok(Step::Wait)
    });
    domain.queue(fom.into_fom())?;

    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure_eq!(done.rc, -libc::ETIMEDOUT);
    ensure!(done.phases.ends_with(&[
        Phase::TypeSpecific,
        Phase::Timeout,
        Phase::Failure,
        Phase::TxnAbort,
        Phase::QueueReply
    ]));
    ensure_eq!(replies.recv_timeout(TIMEOUT)?.reply.rc, -libc::ETIMEDOUT);
    ensure!(!chan.signal(), "timed out waiter was signalled");
    ensure_eq!(counters.get(), (1, 0, 1));
    Ok(())
}

/// An event delivered before the deadline wins; the timer later finds its clink fired.
#[test]
fn event_beats_timer() -> Result<()> {
    let (services, replies): (Services, Receiver<PostedReply>) = common::services(TestStorage::new(false));
    let domain: FomDomain = domain(&common::config(1), services)?;
    let chan: Arc<Chan> = Arc::new(Chan::new());
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();

    let c: Arc<Chan> = chan.clone();
    let mut parked: bool = false;
    let fom: ScriptFom = ScriptFom::new(10, done_tx, move |_, ctx| {
        if parked {
            return Ok(Step::Done);
        }
        parked = true;
        let clink: Clink = ctx.wait_on(&c, Box::new(Wakeup));
        ctx.timeout(&clink, Duration::from_millis(50));
        Ok(Step::Wait)
    });
    domain.queue(fom.into_fom())?;

    ensure!(wait_stats(&domain, |stats| stats[0].waitq == 1));
    ensure!(chan.signal());
    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure_eq!(done.rc, 0);
    ensure!(!done.phases.contains(&Phase::Timeout));
    ensure_eq!(replies.recv_timeout(TIMEOUT)?.reply.rc, 0);

    thread::sleep(Duration::from_millis(100));
    ensure!(replies.try_recv().is_err(), "timer delivered after the event");
    ensure_eq!(domain.stats()[0].completed, 1);
    Ok(())
}

/// Readers queued behind a writer are woken together, holding the lock, once the writer lets go.
#[test]
fn long_lock_wakes_readers_after_writer() -> Result<()> {
    let (services, _replies): (Services, Receiver<PostedReply>) = common::services(TestStorage::new(false));
    let domain: FomDomain = domain(&common::config(2), services)?;
    let lock: Arc<LongLock> = Arc::new(LongLock::new());
    let hold: Arc<Chan> = Arc::new(Chan::new());
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();
    let (locked_tx, locked_rx): (Sender<u64>, Receiver<u64>) = crossbeam_channel::unbounded();

    let (l, h, t): (Arc<LongLock>, Arc<Chan>, Sender<u64>) = (lock.clone(), hold.clone(), locked_tx.clone());
    let mut holding: bool = false;
    let writer: ScriptFom = ScriptFom::new(0, done_tx.clone(), move |_, ctx| {
        if holding {
            if !l.is_write_locked(ctx.fom_id()) {
                return Err(Fail::new(libc::EPERM, "writer lost the lock"));
            }
            l.write_unlock(ctx.fom_id());
            return Ok(Step::Done);
        }
        if !l.write_lock(ctx) {
            return Err(Fail::new(libc::EBUSY, "free lock not granted"));
        }
        holding = true;
        let _ = t.send(0);
        let _ = ctx.wait_on(&h, Box::new(Wakeup));
        Ok(Step::Wait)
    })
    .home(0);
    domain.queue(writer.into_fom())?;
    ensure_eq!(locked_rx.recv_timeout(TIMEOUT)?, 0);

    for tag in 1..=2 {
        let (l, t): (Arc<LongLock>, Sender<u64>) = (lock.clone(), locked_tx.clone());
        let mut queued: bool = false;
        let reader: ScriptFom = ScriptFom::new(tag, done_tx.clone(), move |_, ctx| {
            if !queued {
                queued = true;
                if l.read_lock(ctx) {
                    return Err(Fail::new(libc::EBUSY, "read lock granted under a writer"));
                }
                return Ok(Step::Wait);
            }
            if !l.is_read_locked(ctx.fom_id()) {
                return Err(Fail::new(libc::EPERM, "woken without the lock"));
            }
            let _ = t.send(tag);
            l.read_unlock(ctx.fom_id());
            Ok(Step::Done)
        })
        .home(1);
        domain.queue(reader.into_fom())?;
    }
    ensure!(common::wait_until(TIMEOUT, || lock.nr_waiters() == 2));

    ensure!(hold.signal());
    let done: Vec<Finished> = finished(&done_rx, 3)?;
    ensure!(done.iter().all(|f| f.rc == 0), "{:?}", done);
    let mut readers: Vec<u64> = locked_rx.try_iter().collect();
    readers.sort_unstable();
    ensure_eq!(readers, vec![1, 2]);
    ensure_eq!(lock.nr_waiters(), 0);
    Ok(())
}

/// With the reject policy, a blocking section that would exceed the thread cap fails the fom with `EAGAIN`.
#[test]
fn reject_policy_fails_blocking_section() -> Result<()> {
    let storage: TestStorage = TestStorage::new(true);
    let counters = storage.counters();
    let (services, replies): (Services, Receiver<PostedReply>) = common::services(storage);
    let config: DomainConfig = DomainConfig {
        max_threads: Some(1),
        overflow_policy: OverflowPolicy::Reject,
        ..common::config(1)
    };
    let domain: FomDomain = domain(&config, services)?;
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();

    domain.queue(ScriptFom::noop(11, done_tx).into_fom())?;
    let done: Finished = done_rx.recv_timeout(TIMEOUT)?;
    ensure_eq!(done.rc, -libc::EAGAIN);
    ensure!(!done.phases.contains(&Phase::TypeSpecific));
    ensure_eq!(replies.recv_timeout(TIMEOUT)?.reply.rc, -libc::EAGAIN);
    ensure_eq!(counters.get(), (0, 0, 0));
    ensure!(domain.wait_quiescent(TIMEOUT));
    ensure_eq!(domain.stats()[0].growths, 0);
    Ok(())
}

/// With the degrade policy, a blocking section at the thread cap proceeds without a handler.
#[test]
fn degrade_policy_blocks_without_growing() -> Result<()> {
    let (storage, gate) = TestStorage::gated();
    let (services, _replies): (Services, Receiver<PostedReply>) = common::services(storage);
    let config: DomainConfig = DomainConfig {
        max_threads: Some(1),
        overflow_policy: OverflowPolicy::Degrade,
        ..common::config(1)
    };
    let domain: FomDomain = domain(&config, services)?;
    let locality: &Locality = first_locality(&domain)?;
    let (done_tx, done_rx): (Sender<Finished>, Receiver<Finished>) = crossbeam_channel::unbounded();

    domain.queue(ScriptFom::noop(12, done_tx).into_fom())?;
    gate.entered.recv_timeout(TIMEOUT)?;
    ensure!(common::wait_until(TIMEOUT, || locality.stats().threads == roles(0, 1, 0)));

    gate.release.send(())?;
    ensure_eq!(done_rx.recv_timeout(TIMEOUT)?.rc, 0);
    ensure!(domain.wait_quiescent(TIMEOUT));
    let stats: LocalityStats = locality.stats();
    ensure_eq!(stats.growths, 0);
    // Open and commit both block.
    ensure_eq!(stats.degraded_growths, 2);
    ensure_eq!(stats.threads, roles(1, 0, 0));
    Ok(())
}
