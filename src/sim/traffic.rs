//! Random client votes for the scenario driver.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::rsc::types::{RpmhState, TcsCmd};
use crate::sim::config::TrafficConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Async(RpmhState, Vec<TcsCmd>),
    Sync(RpmhState, Vec<TcsCmd>),
    /// Replace every queued batch with this one.
    Batch(RpmhState, Vec<Vec<TcsCmd>>),
}

pub struct TrafficGen {
    rng: StdRng,
    conf: TrafficConfig,
    issued: usize,
}

impl TrafficGen {
    pub fn new(conf: &TrafficConfig, client_id: usize) -> Self {
        let seed = conf.seed ^ (client_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self {
            rng: StdRng::seed_from_u64(seed),
            conf: conf.clone(),
            issued: 0,
        }
    }

    /// Address of the `i`-th voted resource.
    pub fn addr(&self, i: u32) -> u32 {
        self.conf.addr_base + 4 * i
    }

    /// Batch addresses sit past the per-address votes so the two never overlap.
    fn batch_addr(&self, i: u32) -> u32 {
        self.addr(self.conf.addr_count + i)
    }

    fn cmds(&mut self, n: usize) -> Vec<TcsCmd> {
        let mut picked: Vec<u32> = Vec::with_capacity(n);
        while picked.len() < n.min(self.conf.addr_count as usize) {
            let i = self.rng.gen_range(0..self.conf.addr_count);
            if !picked.contains(&i) {
                picked.push(i);
            }
        }
        let (base, max) = (self.conf.addr_base, self.conf.max_value);
        picked
            .into_iter()
            .map(|i| TcsCmd::new(base + 4 * i, self.rng.gen_range(0..=max)))
            .collect()
    }

    fn batch(&mut self) -> ClientOp {
        let state = match self.rng.gen_range(0..3) {
            0 => RpmhState::ActiveOnly,
            1 => RpmhState::Sleep,
            _ => RpmhState::WakeOnly,
        };
        let reqs: u32 = self.rng.gen_range(1..=3);
        let mut batch = Vec::new();
        for r in 0..reqs {
            let len: u32 = self.rng.gen_range(1..=2);
            let mut cmds = Vec::new();
            for c in 0..len {
                let addr = self.batch_addr(r * 2 + c);
                cmds.push(TcsCmd::new(addr, self.rng.gen_range(0..=self.conf.max_value)));
            }
            batch.push(cmds);
        }
        ClientOp::Batch(state, batch)
    }

    pub fn next_op(&mut self) -> ClientOp {
        self.issued += 1;
        if self.conf.batch_every != 0 && self.issued % self.conf.batch_every == 0 {
            return self.batch();
        }
        let n = self.rng.gen_range(1..=3);
        let cmds = self.cmds(n);
        match self.rng.gen_range(0..10) {
            0..=2 => ClientOp::Async(RpmhState::ActiveOnly, cmds),
            3..=4 => ClientOp::Sync(RpmhState::ActiveOnly, cmds),
            5..=7 => ClientOp::Async(RpmhState::Sleep, cmds),
            _ => ClientOp::Async(RpmhState::WakeOnly, cmds),
        }
    }
}

impl Iterator for TrafficGen {
    type Item = ClientOp;

    fn next(&mut self) -> Option<ClientOp> {
        (self.issued < self.conf.requests_per_client).then(|| self.next_op())
    }
}
