use std::path::PathBuf;

use serde::Deserialize;

use crate::base::config::Config;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    /// 0: warnings only, 1: info, 2: debug.
    pub log_level: u64,
    /// Also write the JSON summary here.
    pub summary_json: Option<PathBuf>,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log_level: 0,
            summary_json: None,
        }
    }
}

impl SimConfig {
    pub fn log_filter(&self) -> &'static str {
        match self.log_level {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

/// Client and CPU activity the scenario generates.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    pub clients: usize,
    pub requests_per_client: usize,
    pub cpus: usize,
    /// Low-power entries per CPU.
    pub suspend_cycles: usize,
    pub addr_base: u32,
    /// Distinct resource addresses voted on.
    pub addr_count: u32,
    pub max_value: u32,
    /// Every n-th request of a client is a batch; 0 disables batches.
    pub batch_every: usize,
    pub seed: u64,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            clients: 4,
            requests_per_client: 200,
            cpus: 4,
            suspend_cycles: 20,
            addr_base: 0x30000,
            addr_count: 16,
            max_value: 15,
            batch_every: 16,
            seed: 0,
        }
    }
}
