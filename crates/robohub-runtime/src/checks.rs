//! The default compliance suite.
//!
//! | Check | Required | Depends on |
//! |---|---|---|
//! | `has_photo` | no | |
//! | `has_author` | no | |
//! | `has_title` | no | |
//! | `has_entry_point` | yes | |
//! | `entry_point_has_main` | yes | `has_entry_point` |
//! | `requirements_installable` | yes | |
//! | `runs_and_reports` | no | the three required checks |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use robohub_kernel::manifest::{AUTHOR_FILE, PHOTO_FILE, TITLE_FILE};
use robohub_kernel::{
    DeathPolicy, DispatchOutcome, DispatchSink, EventDispatcher, ProcessSupervisor, WorkerLauncher,
};
use robohub_middleware::{CommandBus, ValueStore};
use robohub_types::{HubError, Identifier};
use tokio_util::sync::CancellationToken;

use crate::ensure;
use crate::provision::{ProvisionOutcome, Provisioner};
use crate::scheduler::{CheckContext, CheckFailure, ComplianceCheck, Suite, TestMeta};

pub const HAS_PHOTO: &str = "has_photo";
pub const HAS_AUTHOR: &str = "has_author";
pub const HAS_TITLE: &str = "has_title";
pub const HAS_ENTRY_POINT: &str = "has_entry_point";
pub const ENTRY_POINT_HAS_MAIN: &str = "entry_point_has_main";
pub const REQUIREMENTS_INSTALLABLE: &str = "requirements_installable";
pub const RUNS_AND_REPORTS: &str = "runs_and_reports";

/// Upper bound for the end-to-end check.
pub const DEFAULT_E2E_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for the end-to-end check.
#[derive(Clone)]
pub struct EndToEnd {
    pub launcher: Arc<dyn WorkerLauncher>,
    pub tick: Duration,
    pub grace: Duration,
    pub timeout: Duration,
}

/// Build the standard suite.
pub fn default_suite(provisioner: Arc<Provisioner>, e2e: EndToEnd) -> Result<Suite, HubError> {
    let mut suite = Suite::new();
    suite
        .register(HasPhoto)?
        .register(NonEmptyFile::author())?
        .register(NonEmptyFile::title())?
        .register(HasEntryPoint)?
        .register(EntryPointHasMain)?
        .register(RequirementsInstallable { provisioner })?
        .register(RunsAndReports { e2e })?;
    Ok(suite)
}

// ────────────────────────────────────────────────────────────────────────────
// Static checks
// ────────────────────────────────────────────────────────────────────────────

struct HasPhoto;

#[async_trait]
impl ComplianceCheck for HasPhoto {
    fn meta(&self) -> TestMeta {
        TestMeta::new(HAS_PHOTO, "plugin ships an author photo")
    }

    async fn run(&self, ctx: &CheckContext) -> Result<(), CheckFailure> {
        ensure!(
            ctx.manifest.dir.join(PHOTO_FILE).is_file(),
            "{PHOTO_FILE} not found"
        );
        Ok(())
    }
}

struct NonEmptyFile {
    name: &'static str,
    description: &'static str,
    file: &'static str,
}

impl NonEmptyFile {
    fn author() -> Self {
        Self {
            name: HAS_AUTHOR,
            description: "plugin names its author",
            file: AUTHOR_FILE,
        }
    }

    fn title() -> Self {
        Self {
            name: HAS_TITLE,
            description: "plugin has a display title",
            file: TITLE_FILE,
        }
    }
}

#[async_trait]
impl ComplianceCheck for NonEmptyFile {
    fn meta(&self) -> TestMeta {
        TestMeta::new(self.name, self.description)
    }

    async fn run(&self, ctx: &CheckContext) -> Result<(), CheckFailure> {
        let path = ctx.manifest.dir.join(self.file);
        ensure!(path.is_file(), "{} not found", self.file);
        let text = tokio::fs::read_to_string(&path).await?;
        ensure!(!text.trim().is_empty(), "{} is empty", self.file);
        ctx.log.line(format!("{}: {}", self.file, text.trim()));
        Ok(())
    }
}

struct HasEntryPoint;

#[async_trait]
impl ComplianceCheck for HasEntryPoint {
    fn meta(&self) -> TestMeta {
        TestMeta::new(HAS_ENTRY_POINT, "plugin has an entry point").required()
    }

    async fn run(&self, ctx: &CheckContext) -> Result<(), CheckFailure> {
        let entry = ctx.manifest.entry_point();
        ensure!(entry.is_file(), "{} not found", entry.display());
        Ok(())
    }
}

struct EntryPointHasMain;

#[async_trait]
impl ComplianceCheck for EntryPointHasMain {
    fn meta(&self) -> TestMeta {
        TestMeta::new(ENTRY_POINT_HAS_MAIN, "entry point defines `async def main(core)`")
            .depends_on(HAS_ENTRY_POINT)
            .required()
    }

    async fn run(&self, ctx: &CheckContext) -> Result<(), CheckFailure> {
        let source = tokio::fs::read_to_string(ctx.manifest.entry_point()).await?;
        check_main_signature(&source).map_err(CheckFailure::Assertion)
    }
}

/// Validate the first `main` definition in `source`.
pub fn check_main_signature(source: &str) -> Result<(), String> {
    let mut offset = 0;
    let mut definition = None;
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        for (prefix, is_async) in [("async def main", true), ("def main", false)] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                if rest.trim_start().starts_with('(') {
                    definition = Some((is_async, offset + indent + prefix.len()));
                    break;
                }
            }
        }
        if definition.is_some() {
            break;
        }
        offset += line.len();
    }

    let (is_async, start) = definition.ok_or_else(|| "no `main` function defined".to_string())?;
    if !is_async {
        return Err("`main` must be async".to_string());
    }

    // Parameters may span several lines, so scan from the definition on.
    let rest = &source[start..];
    let malformed = || "malformed `main` definition".to_string();
    let open = rest.find('(').ok_or_else(malformed)?;
    let close = rest.find(')').ok_or_else(malformed)?;
    if close < open {
        return Err(malformed());
    }
    let params: Vec<&str> = rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if params.len() != 1 {
        return Err(format!("`main` must take exactly one parameter, found {}", params.len()));
    }
    let name = params[0]
        .split([':', '='])
        .next()
        .unwrap_or_default()
        .trim();
    if name != "core" {
        return Err(format!("`main` parameter must be named `core`, found `{name}`"));
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Provisioning
// ────────────────────────────────────────────────────────────────────────────

struct RequirementsInstallable {
    provisioner: Arc<Provisioner>,
}

#[async_trait]
impl ComplianceCheck for RequirementsInstallable {
    fn meta(&self) -> TestMeta {
        TestMeta::new(REQUIREMENTS_INSTALLABLE, "declared dependencies install cleanly").required()
    }

    async fn run(&self, ctx: &CheckContext) -> Result<(), CheckFailure> {
        let outcome = tokio::select! {
            outcome = self.provisioner.ensure(&ctx.manifest) => outcome?,
            _ = ctx.cancel.cancelled() => {
                ctx.log.line("cancelled during installation");
                return Err(CheckFailure::Assertion("cancelled".into()));
            }
        };
        match outcome {
            ProvisionOutcome::UpToDate => ctx.log.line("dependencies already installed"),
            ProvisionOutcome::Installed => ctx.log.line("dependencies installed"),
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// End to end
// ────────────────────────────────────────────────────────────────────────────

/// Cancels the session on the plugin's first state or message.
struct FirstReport {
    cancel: CancellationToken,
    reported: AtomicBool,
}

impl FirstReport {
    fn mark(&self) {
        self.reported.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

impl DispatchSink for FirstReport {
    fn on_state_change(&self, _origin: &Identifier, _state: &str) {
        self.mark();
    }

    fn on_message(&self, _origin: &Identifier, _text: &str) {
        self.mark();
    }
}

struct RunsAndReports {
    e2e: EndToEnd,
}

#[async_trait]
impl ComplianceCheck for RunsAndReports {
    fn meta(&self) -> TestMeta {
        // The scheduler bound sits above ours so the check can tear the
        // worker down and report TimedOut itself.
        TestMeta::new(RUNS_AND_REPORTS, "plugin starts and reports a state or message")
            .depends_on(HAS_ENTRY_POINT)
            .depends_on(ENTRY_POINT_HAS_MAIN)
            .depends_on(REQUIREMENTS_INSTALLABLE)
            .with_timeout(self.e2e.timeout + self.e2e.grace + Duration::from_secs(5))
    }

    async fn run(&self, ctx: &CheckContext) -> Result<(), CheckFailure> {
        let (bus, commands) = CommandBus::new();
        let store = ValueStore::new();
        let mut supervisor = ProcessSupervisor::new(
            self.e2e.launcher.clone(),
            store.clone(),
            bus,
            DeathPolicy::Strict,
        )
        .with_stderr_dir(ctx.log_dir());
        supervisor.start(std::slice::from_ref(&ctx.manifest))?;

        let cancel = ctx.cancel.child_token();
        let sink = Arc::new(FirstReport {
            cancel: cancel.clone(),
            reported: AtomicBool::new(false),
        });
        let dispatcher =
            EventDispatcher::new(supervisor, commands, store, sink.clone(), cancel.clone())
                .with_tick(self.e2e.tick)
                .with_grace(self.e2e.grace);
        ctx.log.line("plugin started");

        let run = dispatcher.run();
        tokio::pin!(run);
        let finished = tokio::select! {
            res = &mut run => Some(res),
            _ = tokio::time::sleep(self.e2e.timeout) => None,
        };

        match finished {
            None => {
                ctx.log.line("no report before the deadline; stopping plugin");
                cancel.cancel();
                if let Err(e) = run.await {
                    ctx.log.line(format!("teardown: {e}"));
                }
                Err(CheckFailure::TimedOut(self.e2e.timeout))
            }
            Some(Ok(DispatchOutcome::Cancelled)) => {
                ensure!(
                    sink.reported.load(Ordering::SeqCst),
                    "session cancelled before the plugin reported"
                );
                ctx.log.line("plugin reported");
                Ok(())
            }
            Some(Err(e)) => {
                ctx.log.line(format!("session failed: {e}"));
                Err(e.into())
            }
        }
    }
}
