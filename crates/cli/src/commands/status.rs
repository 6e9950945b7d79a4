//! `tiltr status`: query a running master

use anyhow::{bail, Result};
use clap::Args;
use serde::de::DeserializeOwned;
use tiltr_common::{Run, RunReport, WorkerInfo};

use crate::output::{print_list, print_report, print_success, OutputFormat};

#[derive(Args)]
pub struct StatusArgs {
    /// Master coordinator URL
    #[arg(short, long, default_value = "http://127.0.0.1:8660", env = "TILTR_MASTER")]
    pub master: String,

    /// Show one run in detail
    pub run_id: Option<String>,

    /// List registered machines instead of runs
    #[arg(long)]
    pub workers: bool,
}

async fn get<T: DeserializeOwned>(client: &reqwest::Client, url: String) -> Result<T> {
    let response = client.get(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed")
            .to_string();
        bail!("{} returned {}: {}", url, status, message);
    }
    Ok(response.json().await?)
}

pub async fn execute(args: StatusArgs, format: OutputFormat) -> Result<i32> {
    let base = args.master.trim_end_matches('/');
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let health: serde_json::Value = get(&client, format!("{}/health", base)).await?;
    if matches!(format, OutputFormat::Table) {
        print_success(&format!(
            "Master at {} is up (v{})",
            base,
            health.get("version").and_then(|v| v.as_str()).unwrap_or("?")
        ));
    }

    if args.workers {
        let workers: Vec<WorkerInfo> = get(&client, format!("{}/api/workers", base)).await?;
        print_list(&workers, format);
        return Ok(0);
    }

    match args.run_id {
        Some(run_id) => {
            let report: RunReport = get(&client, format!("{}/api/runs/{}", base, run_id)).await?;
            print_report(&report, format);
            Ok(report.run.verdict.map(|v| v.exit_code()).unwrap_or(0))
        }
        None => {
            let runs: Vec<Run> = get(&client, format!("{}/api/runs", base)).await?;
            print_list(&runs, format);
            Ok(0)
        }
    }
}
