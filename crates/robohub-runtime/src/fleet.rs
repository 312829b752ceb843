//! Fleet testing: every plugin's suite, a bounded number at a time.
//!
//! Results land in `<logs>/results.json` so [`render_report`] can be run
//! later without re-testing.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use colored::Colorize;
use futures_util::StreamExt;
use futures_util::stream;
use robohub_kernel::PluginManifest;
use robohub_types::HubError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::scheduler::{Scheduler, SuiteReport, TestResult, TestStatus};

/// Plugins tested at the same time.
pub const DEFAULT_CONCURRENCY: usize = 15;

pub const RESULTS_FILE: &str = "results.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetResults {
    pub generated_at: DateTime<Utc>,
    /// Sorted by module id.
    pub reports: Vec<SuiteReport>,
}

impl FleetResults {
    pub fn passed(&self) -> usize {
        self.reports.iter().filter(|r| r.all_passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.passed()
    }
}

/// Result name used when a plugin's suite could not run at all.
pub const SUITE_ERROR: &str = "suite";

/// Run `scheduler`'s suite against every plugin, at most `concurrency` at
/// once, and persist the results under the scheduler's logs directory.
///
/// A plugin whose suite cannot run gets a single failed [`SUITE_ERROR`]
/// result.  After cancellation the partial results are returned but not
/// persisted, so the previous `results.json` survives.
pub async fn test_all(
    scheduler: &Scheduler,
    plugins: Vec<PluginManifest>,
    concurrency: usize,
) -> Result<FleetResults, HubError> {
    info!(plugins = plugins.len(), concurrency, "testing fleet");
    let mut reports: Vec<SuiteReport> = stream::iter(plugins)
        .map(|manifest| async move {
            match scheduler.run(&manifest).await {
                Ok(report) => {
                    if report.all_passed() {
                        info!(module = %manifest.module_id, "plugin passed");
                    } else {
                        warn!(module = %manifest.module_id, "plugin failed");
                    }
                    report
                }
                Err(e) => {
                    warn!(module = %manifest.module_id, error = %e, "plugin could not be tested");
                    unavailable(&manifest, &e)
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    reports.sort_by(|a, b| a.module_id.cmp(&b.module_id));
    let results = FleetResults {
        generated_at: Utc::now(),
        reports,
    };
    if scheduler.is_cancelled() {
        warn!("fleet run cancelled; keeping previous results");
        return Ok(results);
    }
    save_results(scheduler.logs_dir(), &results)?;
    Ok(results)
}

fn unavailable(manifest: &PluginManifest, error: &HubError) -> SuiteReport {
    SuiteReport {
        module_id: manifest.module_id.clone(),
        author: manifest.author.clone(),
        title: manifest.title.clone(),
        results: vec![TestResult {
            name: SUITE_ERROR.to_string(),
            description: "compliance suite ran".to_string(),
            status: TestStatus::Failed,
            message: error.to_string(),
            required: true,
            duration_ms: 0,
        }],
    }
}

pub fn results_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(RESULTS_FILE)
}

pub fn save_results(logs_dir: &Path, results: &FleetResults) -> Result<(), HubError> {
    fs::create_dir_all(logs_dir)?;
    let json = serde_json::to_string_pretty(results)
        .map_err(|e| HubError::Config(format!("cannot serialize results: {e}")))?;
    fs::write(results_path(logs_dir), json)?;
    Ok(())
}

pub fn load_results(logs_dir: &Path) -> Result<FleetResults, HubError> {
    let path = results_path(logs_dir);
    let text = fs::read_to_string(&path)?;
    serde_json::from_str(&text)
        .map_err(|e| HubError::Config(format!("invalid results file {}: {e}", path.display())))
}

/// Colored pass/fail summary.  Passing plugins get one line; failing ones
/// list every check.
pub fn render_report(results: &FleetResults) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "Test results:".bold()));
    for report in &results.reports {
        out.push_str(&render_suite(report));
    }
    out.push_str(&format!(
        "\n{} passed, {} failed\n",
        results.passed().to_string().green(),
        results.failed().to_string().red()
    ));
    out
}

pub fn render_suite(report: &SuiteReport) -> String {
    let heading = format!("{} ({} by {})", report.module_id, report.title, report.author);
    if report.all_passed() {
        return format!("{}\n", format!("✓ {heading}").green());
    }

    let mut out = format!("{}\n", format!("✗ {heading}").red());
    for result in &report.results {
        let label = format!("{} ({})", result.name, result.description);
        let line = match result.status {
            TestStatus::Passed => format!("  ✓ {label}").green(),
            TestStatus::Failed => format!("  ✗ {label}: {}", result.message).red(),
            TestStatus::NotRun | TestStatus::TimedOut => {
                format!("  ! {label}: {} {}", result.status.label(), result.message).yellow()
            }
        };
        out.push_str(&format!("{line}\n"));
    }
    out
}
