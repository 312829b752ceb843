//! [`WorkerLauncher`] – boundary to the plugin execution collaborator.
//!
//! The hub does not know how a plugin is sandboxed or how its dependencies
//! are installed.  It only asks a launcher for the command that starts one
//! worker; the worker then talks to the hub over its stdio (see
//! [`crate::pump`]).

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::manifest::PluginManifest;

/// Builds the OS command for one plugin worker.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, manifest: &PluginManifest) -> Command;
}

/// Launches workers from a program and an argument template.
///
/// Supported placeholders in arguments:
///
/// | Placeholder | Replaced with |
/// |---|---|
/// | `{entry}` | path of the plugin entry point |
/// | `{module_dir}` | plugin directory |
/// | `{module_id}` | plugin directory name |
/// | `{requirements}` | path of the dependency manifest |
/// | `{venvs_dir}` | root of the per-plugin environments |
///
/// # Example
///
/// ```
/// use robohub_kernel::launcher::ProgramLauncher;
///
/// let launcher = ProgramLauncher::new("python3", ["-m", "robohub_runner", "{entry}"])
///     .with_venvs_dir("/var/lib/robohub/venvs");
/// assert_eq!(launcher.program(), "python3");
/// ```
#[derive(Debug, Clone)]
pub struct ProgramLauncher {
    program: String,
    args: Vec<String>,
    venvs_dir: PathBuf,
}

impl ProgramLauncher {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            venvs_dir: PathBuf::from("venvs"),
        }
    }

    pub fn with_venvs_dir(mut self, venvs_dir: impl Into<PathBuf>) -> Self {
        self.venvs_dir = venvs_dir.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments with every placeholder expanded for `manifest`.
    pub fn expand_args(&self, manifest: &PluginManifest) -> Vec<String> {
        let entry = manifest.entry_point().display().to_string();
        let module_dir = manifest.dir.display().to_string();
        let requirements = manifest.requirements().display().to_string();
        let venvs_dir = self.venvs_dir.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{entry}", &entry)
                    .replace("{module_dir}", &module_dir)
                    .replace("{module_id}", &manifest.module_id)
                    .replace("{requirements}", &requirements)
                    .replace("{venvs_dir}", &venvs_dir)
            })
            .collect()
    }
}

impl WorkerLauncher for ProgramLauncher {
    fn command(&self, manifest: &PluginManifest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.expand_args(manifest))
            .current_dir(&manifest.dir)
            .env("ROBOHUB_MODULE_ID", &manifest.module_id)
            .env("ROBOHUB_AUTHOR", &manifest.author)
            .env("ROBOHUB_TITLE", &manifest.title)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
