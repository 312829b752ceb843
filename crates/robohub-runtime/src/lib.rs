//! `robohub-runtime` – Compliance testing & process plumbing
//!
//! Everything the hub needs around the kernel to decide whether a plugin can
//! be trusted to run unattended.
//!
//! # Modules
//!
//! - [`scheduler`] – [`Scheduler`][scheduler::Scheduler]: resolves a
//!   [`Suite`][scheduler::Suite] of [`ComplianceCheck`][scheduler::ComplianceCheck]s
//!   in dependency order, each in its own task under a timeout, with one log
//!   file per check.
//! - [`checks`] – [`default_suite`][checks::default_suite]: file layout,
//!   entry point signature, dependency installation and an end-to-end run
//!   through the supervisor and dispatcher.
//! - [`provision`] – [`Provisioner`][provision::Provisioner]: per-plugin
//!   dependency environments with an install marker cache.
//! - [`fleet`] – [`test_all`][fleet::test_all]: the suite for every plugin
//!   through a bounded pool, persisted as `results.json`, rendered as a
//!   colored report.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with JSON output and optional OTLP export.
//! - [`capture`] – [`CheckLogLayer`][capture::CheckLogLayer]: copies events
//!   raised inside a check into that check's log file.

pub mod capture;
pub mod checks;
pub mod fleet;
pub mod provision;
pub mod scheduler;
pub mod telemetry;

pub use capture::CheckLogLayer;
pub use checks::{EndToEnd, default_suite};
pub use fleet::{FleetResults, render_report, test_all};
pub use provision::{ProvisionOutcome, Provisioner};
pub use scheduler::{
    CheckContext, CheckFailure, ComplianceCheck, Scheduler, Suite, SuiteReport, TestMeta,
    TestResult, TestStatus,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
