//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use tiltr_common::{CaseReport, CaseState, Run, RunReport, RunVerdict, WorkerInfo};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No items found.");
                return;
            }
            println!("{}", table(items));
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(items).unwrap_or_default()),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(items).unwrap_or_default()),
    }
}

/// Print a run report: header line plus one row per case
pub fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let verdict = report
                .run
                .verdict
                .map(verdict_label)
                .unwrap_or_else(|| report.run.state.to_string().yellow().to_string());
            println!(
                "Run {} ({}) {}",
                report.run.id.bold(),
                report.run.plan_name,
                verdict
            );
            println!("{}", table(&report.cases));
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report).unwrap_or_default()),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(report).unwrap_or_default()),
    }
}

fn table<T: TableDisplay>(items: &[T]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    table
}

pub fn verdict_label(verdict: RunVerdict) -> String {
    match verdict {
        RunVerdict::Pass => "✓ pass".green().to_string(),
        RunVerdict::Fail => "✗ fail".red().to_string(),
        RunVerdict::Aborted => "⚠ aborted".yellow().to_string(),
    }
}

fn case_label(state: CaseState) -> String {
    match state {
        CaseState::Passed => "passed".green().to_string(),
        CaseState::Failed => "failed".red().to_string(),
        CaseState::Aborted => "aborted".yellow().to_string(),
        CaseState::Pending => "pending".dimmed().to_string(),
    }
}

fn timestamp(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl TableDisplay for Run {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Plan", "State", "Verdict", "Started", "Retry limit"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.plan_name.clone(),
            self.state.to_string(),
            self.verdict.map(verdict_label).unwrap_or_else(|| "-".to_string()),
            timestamp(self.started_at),
            self.retry_limit.to_string(),
        ]
    }
}

impl TableDisplay for CaseReport {
    fn headers() -> Vec<&'static str> {
        vec!["Case", "State", "Attempts", "Failure", "Step", "Screenshot"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.case_id.clone(),
            case_label(self.state),
            self.attempts.to_string(),
            self.failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default(),
            self.failed_step.map(|s| s.to_string()).unwrap_or_default(),
            self.screenshot.clone().unwrap_or_default(),
        ]
    }
}

impl TableDisplay for WorkerInfo {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Capacity", "Alive", "Last seen"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.capacity.to_string(),
            if self.alive { "yes".green().to_string() } else { "no".red().to_string() },
            timestamp(self.last_seen_at),
        ]
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiltr_common::{Failure, FailureKind};

    #[test]
    fn test_timestamp_is_utc() {
        assert_eq!(timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(timestamp(86_400_000 + 3_723_000), "1970-01-02 01:02:03");
    }

    #[test]
    fn test_case_row() {
        colored::control::set_override(false);
        let case = CaseReport {
            case_id: "C".to_string(),
            state: CaseState::Failed,
            attempts: 1,
            failure: Some(Failure::new(FailureKind::AssertionMismatch, "text differs")),
            failed_step: Some(3),
            screenshot: None,
        };
        let row = case.row();
        assert_eq!(row.len(), CaseReport::headers().len());
        assert_eq!(row[1], "failed");
        assert_eq!(row[4], "3");
        assert!(row[3].contains("text differs"));
    }
}
