//! [`Provisioner`] – per-plugin dependency environments.
//!
//! Each plugin gets `<venvs>/<module_id>`.  After a successful install the
//! marker file `.installed` receives the exact bytes of the plugin's
//! dependency manifest; while the two stay identical the install step is
//! skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use robohub_kernel::PluginManifest;
use robohub_types::HubError;
use tokio::fs;
use tokio::process::Command;
use tracing::info;

pub const INSTALLED_MARKER: &str = ".installed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The marker matched; nothing ran.
    UpToDate,
    Installed,
}

/// Runs the configured install command for plugins whose dependency
/// manifest changed.
///
/// Argument placeholders: `{venv}` (environment directory), `{requirements}`
/// (dependency manifest path), `{module_id}`.
#[derive(Debug, Clone)]
pub struct Provisioner {
    venvs_dir: PathBuf,
    program: String,
    args: Vec<String>,
}

impl Provisioner {
    pub fn new<I, S>(venvs_dir: impl Into<PathBuf>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            venvs_dir: venvs_dir.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn venv_dir(&self, manifest: &PluginManifest) -> PathBuf {
        self.venvs_dir.join(&manifest.module_id)
    }

    /// Make sure `manifest`'s dependencies are installed.
    ///
    /// # Errors
    ///
    /// [`HubError::DependencyInstall`] when the dependency manifest is
    /// missing or the install command fails; [`HubError::Io`] when the
    /// environment directory cannot be prepared.
    pub async fn ensure(&self, manifest: &PluginManifest) -> Result<ProvisionOutcome, HubError> {
        let module = manifest.module_id.clone();
        let requirements_path = manifest.requirements();
        let requirements = fs::read(&requirements_path)
            .await
            .map_err(|e| HubError::DependencyInstall {
                module: module.clone(),
                detail: format!("cannot read {}: {e}", requirements_path.display()),
            })?;

        let venv = self.venv_dir(manifest);
        fs::create_dir_all(&venv).await?;
        let marker = venv.join(INSTALLED_MARKER);
        if fs::read(&marker).await.ok().as_deref() == Some(requirements.as_slice()) {
            return Ok(ProvisionOutcome::UpToDate);
        }

        info!(module = %module, "installing plugin dependencies");
        let output = Command::new(&self.program)
            .args(self.expand_args(manifest, &venv, &requirements_path))
            .current_dir(&manifest.dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HubError::DependencyInstall {
                module: module.clone(),
                detail: format!("cannot run {}: {e}", self.program),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(HubError::DependencyInstall {
                module,
                detail: if stderr.is_empty() {
                    format!("installer exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }

        fs::write(&marker, &requirements).await?;
        info!(module = %module, "plugin dependencies installed");
        Ok(ProvisionOutcome::Installed)
    }

    fn expand_args(
        &self,
        manifest: &PluginManifest,
        venv: &Path,
        requirements: &Path,
    ) -> Vec<String> {
        let venv = venv.display().to_string();
        let requirements = requirements.display().to_string();
        self.args
            .iter()
            .map(|a| {
                a.replace("{venv}", &venv)
                    .replace("{requirements}", &requirements)
                    .replace("{module_id}", &manifest.module_id)
            })
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use robohub_kernel::manifest::REQUIREMENTS;

    fn plugin(root: &Path, requirements: Option<&str>) -> PluginManifest {
        let dir = root.join("plugins").join("weather");
        std::fs::create_dir_all(&dir).unwrap();
        if let Some(text) = requirements {
            std::fs::write(dir.join(REQUIREMENTS), text).unwrap();
        }
        PluginManifest::load(&dir).unwrap()
    }

    /// Installer that appends one line per run to `{venv}/runs`.
    fn counting(root: &Path) -> Provisioner {
        Provisioner::new(root.join("venvs"), "sh", ["-c", "echo run >> \"$0/runs\"", "{venv}"])
    }

    fn runs(p: &Provisioner, m: &PluginManifest) -> usize {
        std::fs::read_to_string(p.venv_dir(m).join("runs"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn install_runs_once_per_manifest_content() {
        let root = tempfile::tempdir().unwrap();
        let m = plugin(root.path(), Some("requests==2.31\n"));
        let p = counting(root.path());

        assert_eq!(p.ensure(&m).await.unwrap(), ProvisionOutcome::Installed);
        assert_eq!(p.ensure(&m).await.unwrap(), ProvisionOutcome::UpToDate);
        assert_eq!(runs(&p, &m), 1);
        assert_eq!(
            std::fs::read(p.venv_dir(&m).join(INSTALLED_MARKER)).unwrap(),
            b"requests==2.31\n"
        );

        std::fs::write(m.requirements(), "requests==2.32\n").unwrap();
        assert_eq!(p.ensure(&m).await.unwrap(), ProvisionOutcome::Installed);
        assert_eq!(runs(&p, &m), 2);
    }

    #[tokio::test]
    async fn failing_installer_is_a_dependency_error() {
        let root = tempfile::tempdir().unwrap();
        let m = plugin(root.path(), Some("nonexistent-pkg\n"));
        let p = Provisioner::new(
            root.path().join("venvs"),
            "sh",
            ["-c", "echo 'no matching distribution' >&2; exit 1"],
        );

        let err = p.ensure(&m).await.unwrap_err();
        assert!(matches!(
            &err,
            HubError::DependencyInstall { module, detail }
                if module == "weather" && detail.contains("no matching distribution")
        ));
        assert!(!p.venv_dir(&m).join(INSTALLED_MARKER).exists());
    }

    #[tokio::test]
    async fn missing_manifest_is_a_dependency_error() {
        let root = tempfile::tempdir().unwrap();
        let m = plugin(root.path(), None);
        let p = counting(root.path());
        assert!(matches!(
            p.ensure(&m).await,
            Err(HubError::DependencyInstall { .. })
        ));
    }
}
