use std::fs;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;
use tcsched::ui::{make_sim, TcschedArgs};

pub fn main() -> anyhow::Result<ExitCode> {
    let argv = TcschedArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;

    let mut sim = make_sim(&config, Some(argv))?;
    Builder::from_env(Env::default().default_filter_or(sim.config.log_filter())).init();

    let summary = sim.simulate()?;
    let json = serde_json::to_string_pretty(&summary)?;
    println!("{}", json);
    if let Some(path) = sim.config.summary_json.as_ref() {
        fs::write(path, &json).with_context(|| format!("cannot write {}", path.display()))?;
    }

    if summary.verified() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!("{} cached votes did not reach the resources", summary.mismatches.len());
        Ok(ExitCode::FAILURE)
    }
}
