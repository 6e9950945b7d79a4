//! `tiltr machine`: join a master's pool and execute cases

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tiltr_machine::MachineConfig;
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct MachineArgs {
    /// Master coordinator URL
    #[arg(short, long, env = "TILTR_MASTER")]
    pub master: Option<String>,

    /// WebDriver grid URL
    #[arg(short, long, env = "TILTR_GRID")]
    pub grid: Option<String>,

    /// Concurrent browser sessions
    #[arg(long)]
    pub capacity: Option<u32>,

    /// Name reported to the master
    #[arg(short, long)]
    pub name: Option<String>,

    /// Screenshot directory
    #[arg(long)]
    pub artifacts: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl MachineArgs {
    fn config(&self) -> Result<MachineConfig> {
        let mut config = match &self.config {
            Some(path) => MachineConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => MachineConfig::default(),
        };
        if let Some(master) = &self.master {
            config.master_url = master.clone();
        }
        if let Some(grid) = &self.grid {
            config.grid_url = grid.clone();
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(artifacts) = &self.artifacts {
            config.artifacts_dir = artifacts.clone();
        }
        Ok(config)
    }
}

pub async fn execute(args: MachineArgs, shutdown: CancellationToken) -> Result<i32> {
    let config = args.config()?;
    tiltr_machine::run_machine(&config, shutdown).await?;
    Ok(0)
}
