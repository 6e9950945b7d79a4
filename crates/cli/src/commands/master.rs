//! `tiltr master`: run one plan across the machine pool

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tiltr_master::{report, MasterConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::output::{print_report, OutputFormat};

#[derive(Args)]
pub struct MasterArgs {
    /// Test plan (YAML)
    #[arg(short, long)]
    pub plan: PathBuf,

    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Result store (SQLite)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Coordinator API listen address
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Extra attempts for cases failing on infrastructure errors
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Global run timeout in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Only run cases carrying this tag
    #[arg(long)]
    pub tag: Option<String>,

    /// Write the final report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl MasterArgs {
    fn config(&self) -> Result<MasterConfig> {
        let mut config = match &self.config {
            Some(path) => MasterConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => MasterConfig::default(),
        };
        if let Some(db) = &self.db {
            config.db_path = Some(db.clone());
        }
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(retry_limit) = self.retry_limit {
            config.scheduling.retry_limit = retry_limit;
        }
        if let Some(timeout) = self.timeout_secs {
            config.scheduling.run_timeout_secs = timeout;
        }
        Ok(config)
    }
}

/// Returns the process exit status for the run verdict
pub async fn execute(args: MasterArgs, format: OutputFormat, shutdown: CancellationToken) -> Result<i32> {
    let config = args.config()?;

    let mut plan = super::plan::load(&args.plan)?;
    if let Some(tag) = &args.tag {
        plan.retain_tagged(tag);
        plan.validate()?;
    }
    info!(plan = %plan.name, cases = plan.cases.len(), "Starting run");

    let summary = tiltr_master::run_plan(&config, &plan, shutdown).await?;

    if let Some(path) = &args.report {
        report::write_json(&summary.report, path)?;
        info!("Report written to {}", path.display());
    }
    print_report(&summary.report, format);

    Ok(summary.verdict.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        let mut file = MasterConfig::default();
        file.scheduling.retry_limit = 5;
        file.listen = "0.0.0.0:1".to_string();
        file.save(&path).unwrap();

        let args = MasterArgs {
            plan: PathBuf::from("plan.yaml"),
            config: Some(path),
            db: Some(dir.path().join("r.db")),
            listen: None,
            retry_limit: Some(0),
            timeout_secs: Some(60),
            tag: None,
            report: None,
        };
        let config = args.config().unwrap();
        assert_eq!(config.scheduling.retry_limit, 0);
        assert_eq!(config.scheduling.run_timeout_secs, 60);
        assert_eq!(config.listen, "0.0.0.0:1");
        assert_eq!(config.db_path(), dir.path().join("r.db"));
    }
}
