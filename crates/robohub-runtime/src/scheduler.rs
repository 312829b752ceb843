//! Dependency-ordered compliance test scheduler.
//!
//! A [`Suite`] holds [`ComplianceCheck`]s.  Registration rejects duplicate
//! names and dependencies that are not registered yet, so the dependency
//! graph is acyclic by construction.  [`Scheduler::run`] then resolves
//! checks from a FIFO queue:
//!
//! 1. a check whose dependencies are not all resolved goes to the back;
//! 2. a check with any non-passed dependency is recorded [`TestStatus::NotRun`];
//! 3. anything else runs in its own task under a timeout.
//!
//! Each check runs inside a [`CHECK_SPAN`] span and writes to
//! `<logs>/<module_id>/<check>.log`; with [`crate::capture::CheckLogLayer`]
//! installed, every event raised under that span lands in the same file.
//!
//! Once the scheduler's cancellation token fires, checks not yet started
//! are recorded [`TestStatus::NotRun`].  Running checks see the token in
//! [`CheckContext::cancel`] and wind down on their own.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use robohub_kernel::PluginManifest;
use robohub_types::HubError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

/// Per-check bound when a check does not set its own.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// Name of the span every check runs in.  Its `log` field holds the path
/// of the check's log file.
pub const CHECK_SPAN: &str = "check";

// ────────────────────────────────────────────────────────────────────────────
// Check contract
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMeta {
    pub name: String,
    pub description: String,
    pub dependencies: BTreeSet<String>,
    /// A plugin is only trusted when every required check passed.
    pub required: bool,
    /// Overrides the scheduler's default per-check timeout.
    pub timeout: Option<Duration>,
}

impl TestMeta {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            dependencies: BTreeSet::new(),
            required: false,
            timeout: None,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why a check did not pass.
#[derive(Debug, Error)]
pub enum CheckFailure {
    #[error("{0}")]
    Assertion(String),

    /// The check enforced its own deadline.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fail the current check with a formatted message.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err($crate::scheduler::CheckFailure::Assertion(format!($($msg)+)));
        }
    };
}

/// Per-check log file.  Clones write to the same file.
#[derive(Clone, Debug)]
pub struct CheckLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl CheckLog {
    /// Start an empty log at `path`.
    pub fn create(path: PathBuf) -> io::Result<Self> {
        File::create(&path)?;
        Self::append(path)
    }

    /// Append to the log at `path`.  Every handle opens in append mode, so
    /// several may share one file.
    pub fn append(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.  Write errors are logged, not raised.
    pub fn line(&self, text: impl AsRef<str>) {
        if let Err(e) = self.write_line(text.as_ref()) {
            debug!(path = %self.path.display(), error = %e, "check log write failed");
        }
    }

    /// Append one timestamped line in a single write.
    pub fn write_line(&self, text: &str) -> io::Result<()> {
        let line = format!("{} {text}\n", Utc::now().format("%H:%M:%S%.3f"));
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())
    }
}

/// What a running check gets to work with.
#[derive(Clone, Debug)]
pub struct CheckContext {
    pub manifest: PluginManifest,
    pub log: CheckLog,
    /// The session token.  Checks that start workers derive child tokens
    /// from it.
    pub cancel: CancellationToken,
}

impl CheckContext {
    /// Directory holding every log of this plugin's run.
    pub fn log_dir(&self) -> &Path {
        self.log.path().parent().unwrap_or_else(|| Path::new("."))
    }
}

#[async_trait]
pub trait ComplianceCheck: Send + Sync {
    fn meta(&self) -> TestMeta;

    async fn run(&self, ctx: &CheckContext) -> Result<(), CheckFailure>;
}

// ────────────────────────────────────────────────────────────────────────────
// Results
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    NotRun,
    TimedOut,
}

impl TestStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Failed => "FAILED",
            TestStatus::NotRun => "NOT RUN",
            TestStatus::TimedOut => "TIMED OUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub description: String,
    pub status: TestStatus,
    #[serde(default)]
    pub message: String,
    pub required: bool,
    pub duration_ms: u64,
}

/// Every check's result for one plugin, in resolution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub module_id: String,
    pub author: String,
    pub title: String,
    pub results: Vec<TestResult>,
}

impl SuiteReport {
    pub fn get(&self, name: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<TestStatus> {
        self.get(name).map(|r| r.status)
    }

    /// Every required check passed.
    pub fn required_passed(&self) -> bool {
        self.results
            .iter()
            .filter(|r| r.required)
            .all(|r| r.status == TestStatus::Passed)
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.status == TestStatus::Passed)
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Suite
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Suite {
    checks: Vec<Arc<dyn ComplianceCheck>>,
    names: BTreeSet<String>,
}

impl Suite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `check`.
    ///
    /// # Errors
    ///
    /// [`HubError::DuplicateTest`] for a name already registered,
    /// [`HubError::UnknownDependency`] for a dependency not registered yet.
    pub fn register(
        &mut self,
        check: impl ComplianceCheck + 'static,
    ) -> Result<&mut Self, HubError> {
        let meta = check.meta();
        if self.names.contains(&meta.name) {
            return Err(HubError::DuplicateTest(meta.name));
        }
        if let Some(missing) = meta.dependencies.iter().find(|d| !self.names.contains(*d)) {
            return Err(HubError::UnknownDependency {
                test: meta.name,
                dependency: missing.clone(),
            });
        }
        self.names.insert(meta.name);
        self.checks.push(Arc::new(check));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.meta().name).collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scheduler
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Scheduler {
    suite: Arc<Suite>,
    logs_dir: PathBuf,
    default_timeout: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(suite: Suite, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            suite: Arc::new(suite),
            logs_dir: logs_dir.into(),
            default_timeout: DEFAULT_CHECK_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the scheduler to a session token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Resolve every check of the suite against `manifest`'s plugin.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Io`] when the plugin's log directory cannot be
    /// created.  Check failures are results, not errors.
    pub async fn run(&self, manifest: &PluginManifest) -> Result<SuiteReport, HubError> {
        let log_dir = self.logs_dir.join(&manifest.module_id);
        fs::create_dir_all(&log_dir)?;
        info!(module = %manifest.module_id, checks = self.suite.len(), "running compliance suite");

        let n = self.suite.checks.len();
        let cap = n * (n + 1) / 2 + n;
        let mut pending: VecDeque<Arc<dyn ComplianceCheck>> =
            self.suite.checks.iter().cloned().collect();
        let mut resolved: BTreeMap<String, TestStatus> = BTreeMap::new();
        let mut results = Vec::with_capacity(n);
        let mut iterations = 0;

        while let Some(check) = pending.pop_front() {
            iterations += 1;
            if iterations > cap {
                pending.push_front(check);
                break;
            }
            let meta = check.meta();

            if meta.dependencies.iter().any(|d| !resolved.contains_key(d)) {
                pending.push_back(check);
                continue;
            }

            let failed: Vec<&str> = meta
                .dependencies
                .iter()
                .filter(|d| resolved.get(*d) != Some(&TestStatus::Passed))
                .map(String::as_str)
                .collect();
            let result = if !failed.is_empty() {
                not_run(&meta, format!("not run; failed dependencies: {}", failed.join(", ")))
            } else if self.cancel.is_cancelled() {
                not_run(&meta, "not run; cancelled".to_string())
            } else {
                self.execute(check, &meta, manifest, &log_dir).await
            };

            debug!(
                module = %manifest.module_id,
                check = %meta.name,
                status = ?result.status,
                "check resolved"
            );
            resolved.insert(meta.name.clone(), result.status);
            results.push(result);
        }

        for check in pending {
            let meta = check.meta();
            results.push(not_run(&meta, "not run; unresolvable dependencies".to_string()));
        }

        Ok(SuiteReport {
            module_id: manifest.module_id.clone(),
            author: manifest.author.clone(),
            title: manifest.title.clone(),
            results,
        })
    }

    async fn execute(
        &self,
        check: Arc<dyn ComplianceCheck>,
        meta: &TestMeta,
        manifest: &PluginManifest,
        log_dir: &Path,
    ) -> TestResult {
        let started = Instant::now();
        let path = log_dir.join(format!("{}.log", meta.name));
        let log = match CheckLog::create(path.clone()) {
            Ok(log) => log,
            Err(e) => {
                let message = format!("cannot open log: {e}");
                return finish(meta, TestStatus::Failed, message, started);
            }
        };
        log.line(format!("{}: {}", meta.name, meta.description));

        let ctx = CheckContext {
            manifest: manifest.clone(),
            log: log.clone(),
            cancel: self.cancel.clone(),
        };
        let limit = meta.timeout.unwrap_or(self.default_timeout);
        let span = info_span!(
            CHECK_SPAN,
            module = %manifest.module_id,
            check = %meta.name,
            log = %path.display()
        );
        let handle = tokio::spawn(async move { check.run(&ctx).await }.instrument(span));
        let abort = handle.abort_handle();

        let (status, message) = match tokio::time::timeout(limit, handle).await {
            Ok(Ok(Ok(()))) => (TestStatus::Passed, String::new()),
            Ok(Ok(Err(CheckFailure::TimedOut(after)))) => {
                (TestStatus::TimedOut, format!("timed out after {after:?}"))
            }
            Ok(Ok(Err(failure))) => (TestStatus::Failed, failure.to_string()),
            Ok(Err(join)) if join.is_panic() => {
                let detail = panic_message(join.into_panic());
                (TestStatus::Failed, format!("check panicked: {detail}"))
            }
            Ok(Err(join)) => (TestStatus::Failed, format!("check aborted: {join}")),
            Err(_) => {
                abort.abort();
                (TestStatus::TimedOut, format!("timed out after {limit:?}"))
            }
        };
        log.line(format!("{} {message}", status.label()));
        finish(meta, status, message, started)
    }
}

fn not_run(meta: &TestMeta, message: String) -> TestResult {
    TestResult {
        name: meta.name.clone(),
        description: meta.description.clone(),
        status: TestStatus::NotRun,
        message,
        required: meta.required,
        duration_ms: 0,
    }
}

fn finish(meta: &TestMeta, status: TestStatus, message: String, started: Instant) -> TestResult {
    TestResult {
        name: meta.name.clone(),
        description: meta.description.clone(),
        status,
        message,
        required: meta.required,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Pass,
        Fail,
        Panic,
        Hang,
        /// Cancel the session, then pass.
        CancelSession,
    }

    struct Scripted {
        meta: TestMeta,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(meta: TestMeta, behaviour: Behaviour) -> Self {
            Self {
                meta,
                behaviour,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ComplianceCheck for Scripted {
        fn meta(&self) -> TestMeta {
            self.meta.clone()
        }

        async fn run(&self, ctx: &CheckContext) -> Result<(), CheckFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.log.line("running");
            match self.behaviour {
                Behaviour::Pass => Ok(()),
                Behaviour::Fail => Err(CheckFailure::Assertion("nope".into())),
                Behaviour::Panic => panic!("boom"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Behaviour::CancelSession => {
                    ctx.cancel.cancel();
                    Ok(())
                }
            }
        }
    }

    fn manifest(root: &Path) -> PluginManifest {
        PluginManifest {
            module_id: "sample".into(),
            dir: root.join("sample"),
            author: "Ada".into(),
            title: "Sample".into(),
        }
    }

    fn meta(name: &str) -> TestMeta {
        TestMeta::new(name, format!("{name} check"))
    }

    #[test]
    fn registration_rejects_duplicates_and_forward_references() {
        let mut suite = Suite::new();
        suite.register(Scripted::new(meta("a"), Behaviour::Pass)).unwrap();
        assert!(matches!(
            suite.register(Scripted::new(meta("a"), Behaviour::Pass)),
            Err(HubError::DuplicateTest(name)) if name == "a"
        ));
        assert!(matches!(
            suite.register(Scripted::new(meta("b").depends_on("c"), Behaviour::Pass)),
            Err(HubError::UnknownDependency { test, dependency })
                if test == "b" && dependency == "c"
        ));
        assert_eq!(suite.names(), ["a"]);
    }

    #[tokio::test]
    async fn failed_dependency_marks_dependents_not_run() {
        let logs = tempfile::tempdir().unwrap();
        let mut suite = Suite::new();
        let dependent = Scripted::new(meta("c").depends_on("b"), Behaviour::Pass);
        let calls = dependent.calls.clone();
        suite
            .register(Scripted::new(meta("a"), Behaviour::Pass))
            .unwrap()
            .register(Scripted::new(meta("b").depends_on("a").required(), Behaviour::Fail))
            .unwrap()
            .register(dependent)
            .unwrap();

        let report = Scheduler::new(suite, logs.path())
            .run(&manifest(logs.path()))
            .await
            .unwrap();

        assert_eq!(report.status_of("a"), Some(TestStatus::Passed));
        assert_eq!(report.status_of("b"), Some(TestStatus::Failed));
        assert_eq!(report.get("b").unwrap().message, "nope");
        assert_eq!(report.status_of("c"), Some(TestStatus::NotRun));
        assert!(report.get("c").unwrap().message.contains('b'));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!report.required_passed());
    }

    #[tokio::test]
    async fn panics_fail_and_hangs_time_out() {
        let logs = tempfile::tempdir().unwrap();
        let mut suite = Suite::new();
        suite
            .register(Scripted::new(meta("explodes"), Behaviour::Panic))
            .unwrap()
            .register(Scripted::new(
                meta("hangs").with_timeout(Duration::from_millis(100)),
                Behaviour::Hang,
            ))
            .unwrap()
            .register(Scripted::new(meta("fine"), Behaviour::Pass))
            .unwrap();

        let report = Scheduler::new(suite, logs.path())
            .run(&manifest(logs.path()))
            .await
            .unwrap();

        let explodes = report.get("explodes").unwrap();
        assert_eq!(explodes.status, TestStatus::Failed);
        assert!(explodes.message.contains("boom"));
        assert_eq!(report.status_of("hangs"), Some(TestStatus::TimedOut));
        assert_eq!(report.status_of("fine"), Some(TestStatus::Passed));
        assert!(report.required_passed());
        assert_eq!(report.count(TestStatus::Passed), 1);
    }

    #[tokio::test]
    async fn results_follow_resolution_order_and_logs_are_written() {
        let logs = tempfile::tempdir().unwrap();
        let mut suite = Suite::new();
        suite
            .register(Scripted::new(meta("first"), Behaviour::Pass))
            .unwrap()
            .register(Scripted::new(meta("second").depends_on("first"), Behaviour::Pass))
            .unwrap();

        let report = Scheduler::new(suite, logs.path())
            .run(&manifest(logs.path()))
            .await
            .unwrap();

        let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
        assert!(report.all_passed());

        let log: PathBuf = logs.path().join("sample").join("second.log");
        let text = fs::read_to_string(log).unwrap();
        assert!(text.contains("second check"));
        assert!(text.contains("running"));
        assert!(text.contains("PASSED"));
    }

    #[tokio::test]
    async fn empty_suite_yields_empty_report() {
        let logs = tempfile::tempdir().unwrap();
        let report = Scheduler::new(Suite::new(), logs.path())
            .run(&manifest(logs.path()))
            .await
            .unwrap();
        assert!(report.results.is_empty());
        assert!(report.required_passed());
    }

    #[tokio::test]
    async fn diamond_reports_only_the_failed_branch() {
        let logs = tempfile::tempdir().unwrap();
        let d = Scripted::new(meta("d").depends_on("b").depends_on("c"), Behaviour::Pass);
        let d_calls = d.calls.clone();
        let mut suite = Suite::new();
        suite
            .register(Scripted::new(meta("a"), Behaviour::Pass))
            .unwrap()
            .register(Scripted::new(meta("b").depends_on("a"), Behaviour::Pass))
            .unwrap()
            .register(Scripted::new(meta("c").depends_on("a"), Behaviour::Fail))
            .unwrap()
            .register(d)
            .unwrap();

        let report = Scheduler::new(suite, logs.path())
            .run(&manifest(logs.path()))
            .await
            .unwrap();

        assert_eq!(report.status_of("a"), Some(TestStatus::Passed));
        assert_eq!(report.status_of("b"), Some(TestStatus::Passed));
        assert_eq!(report.status_of("c"), Some(TestStatus::Failed));
        let d = report.get("d").unwrap();
        assert_eq!(d.status, TestStatus::NotRun);
        assert_eq!(d.message, "not run; failed dependencies: c");
        assert_eq!(d_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn independent_checks_each_run_exactly_once() {
        let logs = tempfile::tempdir().unwrap();
        let mut suite = Suite::new();
        let mut counters = Vec::new();
        for (name, behaviour) in [
            ("one", Behaviour::Pass),
            ("two", Behaviour::Fail),
            ("three", Behaviour::Pass),
            ("four", Behaviour::Fail),
        ] {
            let check = Scripted::new(meta(name), behaviour);
            counters.push(check.calls.clone());
            suite.register(check).unwrap();
        }

        let report = Scheduler::new(suite, logs.path())
            .run(&manifest(logs.path()))
            .await
            .unwrap();

        assert_eq!(report.results.len(), 4);
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(report.count(TestStatus::Passed), 2);
        assert_eq!(report.count(TestStatus::Failed), 2);
        assert_eq!(report.count(TestStatus::NotRun), 0);
    }

    #[tokio::test]
    async fn cancelled_session_skips_remaining_checks() {
        let logs = tempfile::tempdir().unwrap();
        let later = Scripted::new(meta("later"), Behaviour::Pass);
        let later_calls = later.calls.clone();
        let mut suite = Suite::new();
        suite
            .register(Scripted::new(meta("first"), Behaviour::CancelSession))
            .unwrap()
            .register(later)
            .unwrap();

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(suite, logs.path()).with_cancel(cancel.clone());
        let report = scheduler.run(&manifest(logs.path())).await.unwrap();

        assert!(cancel.is_cancelled());
        assert!(scheduler.is_cancelled());
        assert_eq!(report.status_of("first"), Some(TestStatus::Passed));
        assert_eq!(report.get("later").unwrap().message, "not run; cancelled");
        assert_eq!(report.status_of("later"), Some(TestStatus::NotRun));
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }
}
