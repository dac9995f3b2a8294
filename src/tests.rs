//! Scenarios across the controller, the cache, the PM hooks and the simulated hardware.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::pm::{syscore_suspend, CpuPmCoordinator, CpuPmEvent, PmVerdict};
use crate::registry::RscRegistry;
use crate::rpmh::{FlushOutcome, RpmhClient};
use crate::rsc::completion::Transfer;
use crate::rsc::config::{RscConfig, TcsGroupConfig};
use crate::rsc::controller::Controller;
use crate::rsc::types::{RpmhState, TcsCmd, TcsRequest, TcsType};
use crate::sim::hw::{SimHwConfig, SimRsc};

const A: u32 = 0x30000;
const B: u32 = 0x30004;

fn platform(conf: RscConfig, hw: SimHwConfig) -> (Arc<SimRsc>, Arc<Controller>, RpmhClient) {
    let sim = SimRsc::new(conf.tcs_offset, conf.drv_id, hw);
    let drv = Controller::probe(conf, sim.clone()).unwrap();
    drv.attach_irq(sim.clone());
    sim.start();
    let client = RpmhClient::new(drv.clone());
    (sim, drv, client)
}

fn one_active_tcs() -> RscConfig {
    RscConfig {
        tcs_config: vec![
            TcsGroupConfig::new(TcsType::Active, 1),
            TcsGroupConfig::new(TcsType::Sleep, 2),
            TcsGroupConfig::new(TcsType::Wake, 2),
            TcsGroupConfig::new(TcsType::Control, 0),
            TcsGroupConfig::new(TcsType::FastPath, 0),
        ],
        ..RscConfig::default()
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_micros(100));
    }
}

#[test]
fn equal_sleep_and_wake_votes_are_not_programmed() {
    let (sim, drv, client) = platform(RscConfig::default(), SimHwConfig::manual());
    client
        .write_async(RpmhState::Sleep, &[TcsCmd::new(A, 5), TcsCmd::new(B, 1)])
        .unwrap();
    client
        .write_async(RpmhState::WakeOnly, &[TcsCmd::new(A, 5), TcsCmd::new(B, 2)])
        .unwrap();

    assert_eq!(FlushOutcome::Flushed { writes: 2 }, drv.flush().unwrap());
    let stats = drv.stats();
    assert_eq!((1, 2), (stats.invalidates, stats.deferred_writes));

    sim.fire(drv.group_range(TcsType::Sleep));
    assert_eq!(Some(1), sim.applied(B));
    assert_eq!(None, sim.applied(A));

    assert_eq!(FlushOutcome::Skipped, drv.flush().unwrap());
    assert_eq!(1, drv.stats().flushes_skipped);
}

#[test]
fn blocking_write_waits_for_the_only_active_tcs() {
    let (sim, drv, client) = platform(one_active_tcs(), SimHwConfig::manual());

    thread::scope(|s| {
        let first = s.spawn(|| client.write_sync(RpmhState::ActiveOnly, &[TcsCmd::new(A, 1)]));
        wait_for("first trigger", || sim.is_triggered(0));

        let second = s.spawn(|| client.write_sync(RpmhState::ActiveOnly, &[TcsCmd::new(B, 2)]));
        wait_for("second caller to park", || drv.stats().busy_waits > 0);
        assert_eq!(None, sim.applied(B));
        assert_eq!(1, drv.stats().active_sent);

        sim.complete(0);
        wait_for("second trigger", || sim.is_triggered(0));
        sim.complete(0);

        assert_eq!(Ok(()), first.join().unwrap());
        assert_eq!(Ok(()), second.join().unwrap());
    });
    assert_eq!((Some(1), Some(2)), (sim.applied(A), sim.applied(B)));
    assert!(drv.is_idle());
}

#[test]
fn completion_releases_the_tcs_to_a_waiter() {
    let (sim, drv, _client) = platform(RscConfig::default(), SimHwConfig::manual());
    let send = |addr| {
        let msg = TcsRequest::single(RpmhState::ActiveOnly, addr, 1);
        drv.send_active(Transfer::fire_and_forget(msg))
    };
    assert_eq!(Ok(0), send(A));
    assert_eq!(Ok(1), send(B));

    thread::scope(|s| {
        let third = s.spawn(|| send(0x30008));
        wait_for("third caller to park", || drv.stats().busy_waits > 0);
        sim.complete(1);
        assert_eq!(Ok(1), third.join().unwrap());
    });
    assert!(sim.is_triggered(0) && sim.is_triggered(1));
    sim.complete(0);
    sim.complete(1);
    assert_eq!(3, drv.stats().completed);
    assert!(drv.is_idle());
}

#[test]
fn concurrent_votes_keep_the_last_value() {
    let (sim, drv, client) = platform(RscConfig::default(), SimHwConfig::manual());
    client.write_async(RpmhState::WakeOnly, &[TcsCmd::new(A, 0)]).unwrap();

    thread::scope(|s| {
        for value in [7, 9] {
            let client = &client;
            s.spawn(move || {
                for _ in 0..100 {
                    client.write_async(RpmhState::Sleep, &[TcsCmd::new(A, value)]).unwrap();
                }
            });
        }
    });
    let entry = drv.cache().entry(A).unwrap();
    assert!(entry.sleep_val == 7 || entry.sleep_val == 9);
    assert_eq!(1, drv.cache().len());

    drv.flush().unwrap();
    sim.fire(drv.group_range(TcsType::Sleep));
    assert_eq!(Some(entry.sleep_val), sim.applied(A));
    sim.fire(drv.group_range(TcsType::Wake));
    assert_eq!(Some(0), sim.applied(A));
}

#[test]
fn sleep_batch_is_replayed_as_a_unit() {
    let (sim, drv, client) = platform(RscConfig::default(), SimHwConfig::manual());
    let batch: Vec<Vec<TcsCmd>> = (0..3)
        .map(|r| vec![TcsCmd::new(0x40000 + 8 * r, r), TcsCmd::new(0x40004 + 8 * r, r + 10)])
        .collect();
    client.write_batch(RpmhState::Sleep, &batch).unwrap();
    client.write_async(RpmhState::Sleep, &[TcsCmd::new(A, 1)]).unwrap();
    client.write_async(RpmhState::WakeOnly, &[TcsCmd::new(A, 2)]).unwrap();

    assert_eq!(FlushOutcome::Flushed { writes: 5 }, drv.flush().unwrap());
    sim.fire(drv.group_range(TcsType::Sleep));
    for cmd in batch.iter().flatten() {
        assert_eq!(Some(cmd.data), sim.applied(cmd.addr));
    }

    client.invalidate().unwrap();
    assert_eq!(0, drv.cache().batch_count());
    assert_eq!(FlushOutcome::Flushed { writes: 2 }, drv.flush().unwrap());
}

#[test]
fn concurrent_active_writes_all_retire() {
    let hw = SimHwConfig { latency_us: 5, ..SimHwConfig::default() };
    let (sim, drv, client) = platform(RscConfig::default(), hw);
    thread::scope(|s| {
        for t in 0..8u32 {
            let client = &client;
            s.spawn(move || {
                for i in 0..50u32 {
                    let addr = A + 4 * ((t + i) % 4);
                    client.write_sync(RpmhState::ActiveOnly, &[TcsCmd::new(addr, i)]).unwrap();
                }
            });
        }
    });
    let stats = drv.stats();
    assert_eq!((400, 400, 0), (stats.active_sent, stats.completed, stats.faults));
    assert!(drv.is_idle());
    sim.stop();
}

#[test]
fn suspend_cycle_programs_sleep_then_wake() {
    let (sim, drv, client) = platform(RscConfig::default(), SimHwConfig::default());
    let mut registry = RscRegistry::new();
    registry.register(drv.clone()).unwrap();

    // no sleep vote yet: not mirrored into wake
    client.write_sync(RpmhState::ActiveOnly, &[TcsCmd::new(A, 3)]).unwrap();
    client.write_sync(RpmhState::Sleep, &[TcsCmd::new(A, 1)]).unwrap();
    client.write_sync(RpmhState::ActiveOnly, &[TcsCmd::new(A, 4)]).unwrap();
    assert_eq!(4, drv.cache().entry(A).unwrap().wake_val);

    let pm = CpuPmCoordinator::new(drv.clone(), 2);
    assert_eq!(PmVerdict::Ok, pm.notify(CpuPmEvent::Enter));
    assert!(drv.cache().is_dirty());
    assert_eq!(PmVerdict::Ok, pm.notify(CpuPmEvent::Enter));
    assert!(!drv.cache().is_dirty());

    sim.fire(drv.group_range(TcsType::Sleep));
    assert_eq!(Some(1), sim.applied(A));
    sim.fire(drv.group_range(TcsType::Wake));
    assert_eq!(Some(4), sim.applied(A));

    pm.notify(CpuPmEvent::Exit);
    pm.notify(CpuPmEvent::Exit);
    assert_eq!(Ok(()), syscore_suspend(&registry));
    assert_eq!(1, drv.stats().flushes_skipped);
    sim.stop();
}
