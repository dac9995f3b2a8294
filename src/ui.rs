use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use toml::Table;

use crate::base::config::Config;
use crate::rsc::config::RscConfig;
use crate::sim::config::{SimConfig, TrafficConfig};
use crate::sim::hw::SimHwConfig;
use crate::sim::top::Sim;

#[derive(Parser)]
#[command(version, about)]
pub struct TcschedArgs {
    #[arg(help = "Path to config.toml")]
    pub config_path: PathBuf,
    #[arg(long, help = "Enable log at level (0:warn, 1:info, 2:debug)")]
    pub log: Option<u64>,
    #[arg(long, help = "Override the traffic seed")]
    pub seed: Option<u64>,
    #[arg(long, help = "Override number of CPUs cycling through low power")]
    pub cpus: Option<usize>,
    #[arg(long, help = "Override number of client threads")]
    pub clients: Option<usize>,
    #[arg(long, help = "Write the JSON summary to this file")]
    pub summary_json: Option<PathBuf>,
}

/// Make a Sim object from the TOML configuration.
/// If `cli_args` is given, override TOML options with CLI arguments.
pub fn make_sim(toml_string: &str, cli_args: Option<TcschedArgs>) -> anyhow::Result<Sim> {
    let config_table: Table = toml::from_str(toml_string).context("cannot parse config toml")?;
    let mut sim_config = SimConfig::from_section(config_table.get("sim"))?;
    let mut traffic_config = TrafficConfig::from_section(config_table.get("traffic"))?;
    let hw_config = SimHwConfig::from_section(config_table.get("hw"))?;
    let mut rsc_configs = Vec::<RscConfig>::from_section(config_table.get("rsc"))?;
    if rsc_configs.is_empty() {
        rsc_configs.push(RscConfig::default());
    }

    // override toml configs with CLI args
    if let Some(args) = cli_args {
        sim_config.log_level = args.log.unwrap_or(sim_config.log_level);
        sim_config.summary_json = args.summary_json.or(sim_config.summary_json);
        traffic_config.seed = args.seed.unwrap_or(traffic_config.seed);
        traffic_config.cpus = args.cpus.unwrap_or(traffic_config.cpus);
        traffic_config.clients = args.clients.unwrap_or(traffic_config.clients);
    }

    Ok(Sim::new(sim_config, traffic_config, hw_config, rsc_configs))
}
