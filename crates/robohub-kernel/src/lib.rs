//! `robohub-kernel` – Plugin supervision & dispatch
//!
//! Owns the plugin workers and the loop that connects them to the robot.
//!
//! # Modules
//!
//! - [`manifest`] – [`PluginManifest`][manifest::PluginManifest]: metadata
//!   read from a plugin directory (entry point, author, title).
//! - [`launcher`] – [`WorkerLauncher`][launcher::WorkerLauncher]: builds the
//!   OS command that starts one worker; [`ProgramLauncher`][launcher::ProgramLauncher]
//!   fills an argument template.
//! - [`pump`] – the worker stdio protocol: commands onto the bus, sensor
//!   reads answered from the value store.
//! - [`lifecycle`] – [`LifecycleTable`][lifecycle::LifecycleTable]: forward-only
//!   lifecycle state per plugin.
//! - [`supervisor`] – [`ProcessSupervisor`][supervisor::ProcessSupervisor]:
//!   one worker per plugin, asynchronous death detection, graceful shutdown.
//! - [`status`] – [`DispatchSink`][status::DispatchSink] and the in-memory
//!   [`StatusBoard`][status::StatusBoard].
//! - [`dispatcher`] – [`EventDispatcher`][dispatcher::EventDispatcher]: the
//!   fixed-tick loop routing bus commands, serial readings, injected
//!   readings and worker deaths.

pub mod dispatcher;
pub mod launcher;
pub mod lifecycle;
pub mod manifest;
pub mod pump;
pub mod status;
pub mod supervisor;

pub use dispatcher::{DispatchOutcome, EventDispatcher, InjectionHandle};
pub use launcher::{ProgramLauncher, WorkerLauncher};
pub use lifecycle::LifecycleTable;
pub use manifest::PluginManifest;
pub use status::{DispatchSink, StatusBoard};
pub use supervisor::{DeathPolicy, ExitKind, ProcessSupervisor, WorkerExit};
