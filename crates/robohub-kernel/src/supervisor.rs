//! [`ProcessSupervisor`] – one isolated worker per plugin.
//!
//! Every worker gets three tasks:
//!
//! - a capability pump reading its stdout ([`crate::pump::run_pump`]),
//! - a stdin writer carrying read replies and the cancel request,
//! - a monitor awaiting the child's exit, classifying it and queueing a
//!   [`WorkerExit`].
//!
//! The dispatcher calls [`ProcessSupervisor::poll_deaths`] once per tick.
//! That call only drains exits the monitors already observed, so it never
//! blocks, and each worker is reported at most once.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use robohub_middleware::{CommandSender, ValueStore};
use robohub_types::{HubError, ModuleLifecycleState};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{Instrument, debug, info, warn};

use crate::launcher::WorkerLauncher;
use crate::lifecycle::LifecycleTable;
use crate::manifest::PluginManifest;
use crate::pump::{CANCEL_LINE, PumpContext, PumpSummary, run_pump, run_stdin_writer};

/// Default time workers get to honour a cancel request before being killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// How long a monitor waits for the pump to drain stdout after the child
/// has exited.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// What the hub does when a worker exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathPolicy {
    /// Any death ends the session with [`HubError::WorkerDeath`].
    #[default]
    Strict,
    /// Deaths are logged and the remaining workers keep running.
    Lenient,
}

/// Why a worker is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitKind {
    Clean,
    Crashed { code: Option<i32> },
    DependencyInstall { detail: String },
    SpawnFailed { detail: String },
    /// Force-killed by the hub after the grace period.
    Killed,
}

impl ExitKind {
    pub fn lifecycle(&self) -> ModuleLifecycleState {
        match self {
            ExitKind::Clean | ExitKind::Killed => ModuleLifecycleState::Stopped,
            _ => ModuleLifecycleState::Errored,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExit {
    pub module_id: String,
    pub kind: ExitKind,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExitKind::Clean => write!(f, "{} exited", self.module_id),
            ExitKind::Crashed { code: Some(code) } => {
                write!(f, "{} crashed with exit code {code}", self.module_id)
            }
            ExitKind::Crashed { code: None } => {
                write!(f, "{} terminated by signal", self.module_id)
            }
            ExitKind::DependencyInstall { detail } => {
                write!(f, "{} failed to install dependencies: {detail}", self.module_id)
            }
            ExitKind::SpawnFailed { detail } => write!(f, "{detail}"),
            ExitKind::Killed => write!(f, "{} was killed", self.module_id),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal worker entry
// ────────────────────────────────────────────────────────────────────────────

struct WorkerHandle {
    stdin: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

// ────────────────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────────────────

pub struct ProcessSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    store: ValueStore,
    bus: CommandSender,
    policy: DeathPolicy,
    lifecycle: LifecycleTable,
    stderr_dir: Option<PathBuf>,
    workers: BTreeMap<String, WorkerHandle>,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
    reported: BTreeSet<String>,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        store: ValueStore,
        bus: CommandSender,
        policy: DeathPolicy,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            launcher,
            store,
            bus,
            policy,
            lifecycle: LifecycleTable::new(),
            stderr_dir: None,
            workers: BTreeMap::new(),
            exits_tx,
            exits_rx,
            reported: BTreeSet::new(),
        }
    }

    /// Write each worker's stderr to `<dir>/<module_id>.stderr.log`
    /// instead of inheriting the hub's.
    pub fn with_stderr_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stderr_dir = Some(dir.into());
        self
    }

    pub fn policy(&self) -> DeathPolicy {
        self.policy
    }

    /// Start one worker per manifest.
    ///
    /// A worker that cannot be spawned is not an error here: it is queued
    /// as an [`ExitKind::SpawnFailed`] death and handled by the death
    /// policy like any other.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Io`] when the stderr log directory cannot be
    /// created.
    pub fn start(&mut self, manifests: &[PluginManifest]) -> Result<(), HubError> {
        if let Some(dir) = &self.stderr_dir {
            fs::create_dir_all(dir)?;
        }
        for manifest in manifests {
            if self.lifecycle.get(&manifest.module_id).is_some() {
                warn!(module = %manifest.module_id, "plugin already started; skipping");
                continue;
            }
            self.lifecycle.insert(&manifest.module_id);
            self.spawn_worker(manifest)?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self, manifest: &PluginManifest) -> Result<(), HubError> {
        let module_id = manifest.module_id.clone();
        let mut cmd = self.launcher.command(manifest);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        match &self.stderr_dir {
            Some(dir) => {
                let log = File::create(dir.join(format!("{module_id}.stderr.log")))?;
                cmd.stderr(Stdio::from(log));
            }
            None => {
                cmd.stderr(Stdio::inherit());
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = HubError::Spawn {
                    module: module_id.clone(),
                    source,
                };
                warn!(module = %module_id, error = %err, "worker spawn failed");
                self.queue_exit(WorkerExit {
                    module_id,
                    kind: ExitKind::SpawnFailed {
                        detail: err.to_string(),
                    },
                });
                return Ok(());
            }
        };

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let writer = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(run_stdin_writer(stdin, stdin_rx).in_current_span()));
        let pump = child.stdout.take().map(|stdout| {
            let ctx = PumpContext {
                origin: manifest.identifier(),
                store: self.store.clone(),
                bus: self.bus.clone(),
                lifecycle: self.lifecycle.clone(),
            };
            tokio::spawn(run_pump(stdout, ctx, stdin_tx.clone()).in_current_span())
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        // Worker tasks stay in the caller's span.
        let monitor = tokio::spawn(
            monitor_worker(
                module_id.clone(),
                child,
                pump,
                writer,
                kill_rx,
                self.lifecycle.clone(),
                self.exits_tx.clone(),
            )
            .in_current_span(),
        );
        info!(module = %module_id, "worker started");

        self.workers.insert(
            module_id,
            WorkerHandle {
                stdin: stdin_tx,
                kill: Some(kill_tx),
                monitor,
            },
        );
        Ok(())
    }

    fn queue_exit(&self, exit: WorkerExit) {
        if let Err(e) = self.lifecycle.advance(&exit.module_id, exit.kind.lifecycle()) {
            debug!(module = %exit.module_id, error = %e, "lifecycle already final");
        }
        if self.exits_tx.send(exit).is_err() {
            debug!("exit queue closed");
        }
    }

    /// Deaths observed since the previous call.  Never blocks.
    pub fn poll_deaths(&mut self) -> Vec<WorkerExit> {
        let mut deaths = Vec::new();
        while let Ok(exit) = self.exits_rx.try_recv() {
            if self.reported.insert(exit.module_id.clone()) {
                deaths.push(exit);
            }
        }
        deaths
    }

    /// Apply the death policy to `deaths`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::WorkerDeath`] under [`DeathPolicy::Strict`] when
    /// `deaths` is non-empty.
    pub fn handle_deaths(&self, deaths: &[WorkerExit]) -> Result<(), HubError> {
        if deaths.is_empty() {
            return Ok(());
        }
        match self.policy {
            DeathPolicy::Strict => Err(HubError::WorkerDeath {
                modules: deaths.iter().map(|d| d.module_id.clone()).collect(),
            }),
            DeathPolicy::Lenient => {
                for death in deaths {
                    warn!(module = %death.module_id, "{death}; continuing");
                }
                Ok(())
            }
        }
    }

    /// Ask every worker to stop, wait up to `grace`, kill whatever is left,
    /// then join all monitors.  Returns deaths not yet handed out by
    /// [`poll_deaths`](Self::poll_deaths).
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<WorkerExit> {
        for (module_id, worker) in &self.workers {
            if worker.stdin.send(CANCEL_LINE.to_string()).is_err() {
                debug!(module = %module_id, "worker stdin already closed");
            }
        }

        let deadline = Instant::now() + grace;
        for (module_id, mut worker) in std::mem::take(&mut self.workers) {
            if timeout_at(deadline, &mut worker.monitor).await.is_ok() {
                continue;
            }
            warn!(module = %module_id, "worker ignored cancel request; killing");
            if let Some(kill) = worker.kill.take()
                && kill.send(()).is_err()
            {
                debug!(module = %module_id, "monitor already finished");
            }
            if let Err(e) = worker.monitor.await {
                warn!(module = %module_id, error = %e, "worker monitor panicked");
            }
        }
        self.poll_deaths()
    }

    /// Lifecycle state of every plugin started in this session.
    pub fn lifecycle(&self) -> BTreeMap<String, ModuleLifecycleState> {
        self.lifecycle.snapshot()
    }

    /// Shared handle to the lifecycle table.
    pub fn lifecycle_table(&self) -> LifecycleTable {
        self.lifecycle.clone()
    }

    /// Ids of workers whose process has not exited yet.
    pub fn running_modules(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|(_, w)| !w.monitor.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Monitor task
// ────────────────────────────────────────────────────────────────────────────

async fn monitor_worker(
    module_id: String,
    mut child: Child,
    pump: Option<JoinHandle<PumpSummary>>,
    writer: Option<JoinHandle<()>>,
    mut kill: oneshot::Receiver<()>,
    lifecycle: LifecycleTable,
    exits: mpsc::UnboundedSender<WorkerExit>,
) {
    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill => {
            killed = true;
            if let Err(e) = child.start_kill() {
                warn!(module = %module_id, error = %e, "kill failed");
            }
            child.wait().await
        }
    };

    let summary = match pump {
        Some(mut pump) => match timeout(PUMP_DRAIN_TIMEOUT, &mut pump).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                warn!(module = %module_id, error = %e, "pump task failed");
                PumpSummary::default()
            }
            Err(_) => {
                // A descendant still holds stdout; nothing it writes counts.
                warn!(module = %module_id, "worker stdout still open after exit; stopping pump");
                pump.abort();
                PumpSummary::default()
            }
        },
        None => PumpSummary::default(),
    };
    if let Some(writer) = writer {
        writer.abort();
    }

    let kind = classify(killed, &status, summary);
    let exit = WorkerExit { module_id, kind };
    info!(module = %exit.module_id, "{exit}");
    if let Err(e) = lifecycle.advance(&exit.module_id, exit.kind.lifecycle()) {
        debug!(module = %exit.module_id, error = %e, "lifecycle already final");
    }
    if exits.send(exit).is_err() {
        debug!("supervisor dropped before worker exit was reported");
    }
}

fn classify(
    killed: bool,
    status: &std::io::Result<ExitStatus>,
    summary: PumpSummary,
) -> ExitKind {
    if killed {
        return ExitKind::Killed;
    }
    if let Some(detail) = summary.install_failure {
        return ExitKind::DependencyInstall { detail };
    }
    match status {
        Ok(status) if status.success() => ExitKind::Clean,
        Ok(status) => ExitKind::Crashed {
            code: status.code(),
        },
        Err(e) => {
            warn!(error = %e, "waiting on worker failed");
            ExitKind::Crashed { code: None }
        }
    }
}
