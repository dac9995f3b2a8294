//! Scenario driver: clients voting from several threads while CPUs cycle through low power.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::pm::coordinator::{syscore_suspend, CpuPmCoordinator, CpuPmEvent, PmVerdict, APPS_RSC};
use crate::registry::RscRegistry;
use crate::rpmh::cache::CacheEntry;
use crate::rpmh::client::RpmhClient;
use crate::rsc::config::RscConfig;
use crate::rsc::controller::Controller;
use crate::rsc::error::RscError;
use crate::rsc::stats::RscStats;
use crate::rsc::types::TcsType;
use crate::sim::config::{SimConfig, TrafficConfig};
use crate::sim::hw::{SimHwConfig, SimRsc};
use crate::sim::traffic::{ClientOp, TrafficGen};

const SUSPEND_RETRIES: usize = 1000;

#[derive(Debug, Default)]
struct OpCounters {
    active: AtomicU64,
    sleep_wake: AtomicU64,
    batches: AtomicU64,
    errors: AtomicU64,
    pm_enters: AtomicU64,
    pm_vetoes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct OpSummary {
    pub active: u64,
    pub sleep_wake: u64,
    pub batches: u64,
    pub errors: u64,
    pub pm_enters: u64,
    pub pm_vetoes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerSummary {
    pub name: String,
    pub stats: RscStats,
    pub cache_entries: usize,
    pub queued_batches: usize,
    pub dirty: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimSummary {
    pub ops: OpSummary,
    pub controllers: Vec<ControllerSummary>,
    /// Cache entries whose staged sleep/wake value did not reach the simulated resource.
    pub mismatches: Vec<CacheEntry>,
    pub elapsed_ms: u128,
}

impl SimSummary {
    pub fn verified(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct Sim {
    pub config: SimConfig,
    pub traffic: TrafficConfig,
    pub hw: SimHwConfig,
    pub rscs: Vec<RscConfig>,
}

struct Platform {
    registry: RscRegistry,
    sims: Vec<Arc<SimRsc>>,
}

impl Platform {
    fn stop(&self) {
        self.sims.iter().for_each(|sim| sim.stop());
    }
}

impl Sim {
    pub fn new(
        config: SimConfig,
        traffic: TrafficConfig,
        hw: SimHwConfig,
        rscs: Vec<RscConfig>,
    ) -> Self {
        Self { config, traffic, hw, rscs }
    }

    fn build(&self) -> anyhow::Result<Platform> {
        let mut registry = RscRegistry::new();
        let mut sims = Vec::new();
        for conf in self.rscs.iter() {
            let sim = SimRsc::new(conf.tcs_offset, conf.drv_id, self.hw.clone());
            let drv = Controller::probe(conf.clone(), sim.clone())
                .with_context(|| format!("probing {}", conf.name))?;
            drv.attach_irq(sim.clone());
            sim.start();
            registry.register(drv)?;
            sims.push(sim);
        }
        Ok(Platform { registry, sims })
    }

    fn run_client(client: &RpmhClient, traffic: &TrafficConfig, id: usize, counters: &OpCounters) {
        for op in TrafficGen::new(traffic, id) {
            let result = match op {
                ClientOp::Async(state, cmds) => {
                    bump(if state.is_active() { &counters.active } else { &counters.sleep_wake });
                    client.write_async(state, &cmds)
                }
                ClientOp::Sync(state, cmds) => {
                    bump(if state.is_active() { &counters.active } else { &counters.sleep_wake });
                    client.write_sync(state, &cmds)
                }
                ClientOp::Batch(state, batch) => {
                    bump(&counters.batches);
                    if !state.is_active() {
                        // sleep/wake batches replace what is queued
                        let _ = client.invalidate();
                    }
                    client.write_batch(state, &batch)
                }
            };
            if let Err(err) = result {
                warn!("client {}: {}", id, err);
                bump(&counters.errors);
            }
        }
    }

    fn run_cpu(pms: &[CpuPmCoordinator], cycles: usize, seed: u64, counters: &OpCounters) {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..cycles {
            thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
            bump(&counters.pm_enters);

            let mut entered = 0;
            let mut vetoed = false;
            for pm in pms.iter() {
                if pm.notify(CpuPmEvent::Enter) == PmVerdict::Veto {
                    vetoed = true;
                    break;
                }
                entered += 1;
            }
            if vetoed {
                bump(&counters.pm_vetoes);
                pms[..entered].iter().for_each(|pm| {
                    pm.notify(CpuPmEvent::EnterFailed);
                });
                continue;
            }

            thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
            pms.iter().for_each(|pm| {
                pm.notify(CpuPmEvent::Exit);
            });
        }
    }

    /// Fire the Sleep then the Wake TCSes of `drv` and check every cached pair landed.
    fn verify(drv: &Controller, sim: &SimRsc) -> Vec<CacheEntry> {
        let entries: Vec<_> = drv
            .cache()
            .entries()
            .into_iter()
            .filter(CacheEntry::needs_flush)
            .collect();

        let mut mismatches = Vec::new();
        for ty in [TcsType::Sleep, TcsType::Wake] {
            sim.fire(drv.group_range(ty));
            for entry in entries.iter() {
                let expected = match ty {
                    TcsType::Sleep => entry.sleep_val,
                    _ => entry.wake_val,
                };
                if sim.applied(entry.addr) != Some(expected) && !mismatches.contains(entry) {
                    warn!(
                        "{:#x}: {:?} value {} never reached the resource",
                        entry.addr, ty, expected
                    );
                    mismatches.push(*entry);
                }
            }
        }
        mismatches
    }

    pub fn simulate(&mut self) -> anyhow::Result<SimSummary> {
        let start = Instant::now();
        let platform = self.build()?;
        let apps = platform
            .registry
            .get(APPS_RSC)
            .or_else(|| platform.registry.iter().next().cloned())
            .ok_or_else(|| anyhow!("no controller configured"))?;
        let client = RpmhClient::new(Arc::clone(&apps));
        let pms: Vec<_> = platform
            .registry
            .iter()
            .map(|drv| CpuPmCoordinator::new(Arc::clone(drv), self.traffic.cpus))
            .collect();
        let counters = OpCounters::default();

        info!(
            "running {} clients x {} requests, {} CPUs x {} suspend cycles",
            self.traffic.clients,
            self.traffic.requests_per_client,
            self.traffic.cpus,
            self.traffic.suspend_cycles
        );
        thread::scope(|s| {
            for id in 0..self.traffic.clients {
                let (client, traffic, counters) = (&client, &self.traffic, &counters);
                s.spawn(move || Self::run_client(client, traffic, id, counters));
            }
            for cpu in 0..self.traffic.cpus {
                let (pms, counters) = (&pms, &counters);
                let seed = self.traffic.seed.wrapping_add(cpu as u64 + 1);
                let cycles = self.traffic.suspend_cycles;
                s.spawn(move || Self::run_cpu(pms, cycles, seed, counters));
            }
        });

        // system suspend: everything is quiet once in-flight transfers retire
        let mut attempt = 0;
        loop {
            match syscore_suspend(&platform.registry) {
                Ok(()) => break,
                Err(RscError::Retry) if attempt < SUSPEND_RETRIES => {
                    attempt += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(err) => {
                    platform.stop();
                    return Err(err).context("system suspend flush");
                }
            }
        }

        // registry order follows probe order
        let apps_sim = platform
            .registry
            .iter()
            .position(|drv| Arc::ptr_eq(drv, &apps))
            .and_then(|i| platform.sims.get(i))
            .ok_or_else(|| anyhow!("no simulated hardware for {}", apps.name()))?;
        let mismatches = Self::verify(&apps, apps_sim);
        platform.stop();

        let controllers = platform
            .registry
            .iter()
            .map(|drv| ControllerSummary {
                name: drv.name().to_string(),
                stats: drv.stats(),
                cache_entries: drv.cache().len(),
                queued_batches: drv.cache().batch_count(),
                dirty: drv.cache().is_dirty(),
            })
            .collect();

        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Ok(SimSummary {
            ops: OpSummary {
                active: load(&counters.active),
                sleep_wake: load(&counters.sleep_wake),
                batches: load(&counters.batches),
                errors: load(&counters.errors),
                pm_enters: load(&counters.pm_enters),
                pm_vetoes: load(&counters.pm_vetoes),
            },
            controllers,
            mismatches,
            elapsed_ms: start.elapsed().as_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_sim(rscs: Vec<RscConfig>) -> Sim {
        let traffic = TrafficConfig {
            clients: 3,
            requests_per_client: 60,
            cpus: 2,
            suspend_cycles: 10,
            batch_every: 8,
            seed: 5,
            ..TrafficConfig::default()
        };
        let hw = SimHwConfig { latency_us: 5, ..SimHwConfig::default() };
        Sim::new(SimConfig::default(), traffic, hw, rscs)
    }

    #[test]
    fn default_scenario_verifies() {
        let summary = small_sim(vec![RscConfig::default()]).simulate().unwrap();
        assert!(summary.verified(), "{:?}", summary.mismatches);
        assert_eq!(180, summary.ops.active + summary.ops.sleep_wake + summary.ops.batches);
        assert_eq!(20, summary.ops.pm_enters);
        let apps = &summary.controllers[0];
        assert_eq!(0, apps.stats.in_flight());
        assert!(!apps.dirty);
        assert!(serde_json::to_string(&summary).is_ok());
    }

    #[test]
    fn two_controllers_share_the_cpus() {
        let disp = RscConfig { name: "disp_rsc".to_string(), drv_id: 0, ..RscConfig::default() };
        let summary = small_sim(vec![RscConfig::default(), disp]).simulate().unwrap();
        assert!(summary.verified());
        assert_eq!(2, summary.controllers.len());
        // only the application controller sees client traffic
        assert_eq!(0, summary.controllers[1].stats.active_sent);
    }
}
