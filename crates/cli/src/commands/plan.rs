//! `tiltr validate`: check a plan without running it

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tiltr_common::TestPlan;

use crate::output::print_success;

#[derive(Args)]
pub struct ValidateArgs {
    /// Test plan (YAML)
    pub plan: PathBuf,
}

/// Parse and validate a plan file
pub fn load(path: &Path) -> Result<TestPlan> {
    let plan = TestPlan::from_file(path).with_context(|| format!("reading plan {}", path.display()))?;
    plan.validate()
        .with_context(|| format!("validating plan {}", path.display()))?;
    Ok(plan)
}

pub fn execute(args: ValidateArgs) -> Result<i32> {
    let plan = load(&args.plan)?;

    print_success(&format!("Plan '{}' is valid", plan.name));
    println!("  Base URL:  {}", plan.base_url);
    println!("  Personas:  {}", plan.personas.keys().cloned().collect::<Vec<_>>().join(", "));
    println!("  Cases:     {}", plan.cases.len());
    for case in &plan.cases {
        println!(
            "    {} {} ({} steps, {} checks) as {}",
            "•".dimmed(),
            case.id.bold(),
            case.steps.len(),
            case.expect.len(),
            case.persona
        );
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rejects_invalid_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        std::fs::write(
            &path,
            r#"
name: broken
base_url: http://web
personas: {}
cases:
  - id: A
    persona: nobody
    steps: [{ action: navigate, url: / }]
"#,
        )
        .unwrap();

        let err = load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown persona"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load(Path::new("/nonexistent/plan.yaml")).is_err());
    }
}
