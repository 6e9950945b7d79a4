//! Run report output

use std::path::Path;
use tiltr_common::{CaseState, RunReport};
use tracing::{info, warn};

/// Write the report as pretty JSON
pub fn write_json(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    info!("Wrote run report to {:?}", path);
    Ok(())
}

/// One-line tally, e.g. `3 cases: 2 passed, 1 failed, 0 aborted`
pub fn summary(report: &RunReport) -> String {
    format!(
        "{} cases: {} passed, {} failed, {} aborted",
        report.cases.len(),
        report.count(CaseState::Passed),
        report.count(CaseState::Failed),
        report.count(CaseState::Aborted),
    )
}

/// Log every case that did not pass along with its evidence
pub fn log_failures(report: &RunReport) {
    for case in report.cases.iter().filter(|c| c.state != CaseState::Passed) {
        let reason = case
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "no outcome recorded".to_string());
        warn!(
            case_id = %case.case_id,
            state = %case.state,
            attempts = case.attempts,
            failed_step = ?case.failed_step,
            screenshot = ?case.screenshot,
            "{}",
            reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiltr_common::{CaseReport, Failure, FailureKind, Run, RunState};

    fn report() -> RunReport {
        RunReport {
            run: Run {
                id: "r1".to_string(),
                plan_name: "plan".to_string(),
                state: RunState::Completed,
                retry_limit: 1,
                started_at: 0,
                deadline_at: 1,
                finished_at: Some(1),
                verdict: None,
            },
            cases: vec![
                CaseReport {
                    case_id: "a".to_string(),
                    state: CaseState::Passed,
                    attempts: 1,
                    failure: None,
                    failed_step: None,
                    screenshot: None,
                },
                CaseReport {
                    case_id: "b".to_string(),
                    state: CaseState::Failed,
                    attempts: 2,
                    failure: Some(Failure::new(FailureKind::Timeout, "step 3")),
                    failed_step: Some(3),
                    screenshot: None,
                },
            ],
        }
    }

    #[test]
    fn test_summary() {
        assert_eq!(summary(&report()), "2 cases: 1 passed, 1 failed, 0 aborted");
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");
        write_json(&report(), &path).unwrap();
        let loaded: RunReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.cases.len(), 2);
    }
}
