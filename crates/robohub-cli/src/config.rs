//! Hub configuration – reads/writes `~/.robohub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use robohub_hal::LightTransform;
use robohub_hal::link::DEFAULT_BAUD_RATE;
use robohub_kernel::{DeathPolicy, ProgramLauncher};
use robohub_runtime::Provisioner;
use robohub_types::{DEFAULT_CHANNEL_COUNT, HubError};
use serde::{Deserialize, Serialize};

/// How plugin workers are started.  See
/// [`ProgramLauncher`] for the supported placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_launcher_program")]
    pub program: String,
    #[serde(default = "default_launcher_args")]
    pub args: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_launcher_program(),
            args: default_launcher_args(),
        }
    }
}

/// How plugin dependencies are installed.  Placeholders: `{venv}`,
/// `{requirements}`, `{module_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default = "default_installer_program")]
    pub program: String,
    #[serde(default = "default_installer_args")]
    pub args: Vec<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: default_installer_program(),
            args: default_installer_args(),
        }
    }
}

/// Persisted hub configuration stored in `~/.robohub/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// One sub-directory per plugin.
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Per-plugin dependency environments.
    #[serde(default = "default_venvs_dir")]
    pub venvs_dir: PathBuf,

    /// Check logs, worker stderr and `results.json`.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Serial device of the robot board; no link when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// `raw` only for boards running the v1 firmware.
    #[serde(default)]
    pub light_transform: LightTransform,

    #[serde(default = "default_channel_count")]
    pub channel_count: usize,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Time workers get to honour a cancel request.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    #[serde(default = "default_e2e_timeout_secs")]
    pub e2e_timeout_secs: u64,

    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    #[serde(default = "default_test_concurrency")]
    pub test_concurrency: usize,

    #[serde(default)]
    pub death_policy: DeathPolicy,

    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub installer: InstallerConfig,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}
fn default_venvs_dir() -> PathBuf {
    PathBuf::from("venvs")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_channel_count() -> usize {
    DEFAULT_CHANNEL_COUNT
}
fn default_tick_ms() -> u64 {
    10
}
fn default_grace_secs() -> u64 {
    30
}
fn default_e2e_timeout_secs() -> u64 {
    60
}
fn default_check_timeout_secs() -> u64 {
    300
}
fn default_test_concurrency() -> usize {
    15
}
fn default_launcher_program() -> String {
    "python3".to_string()
}
fn default_launcher_args() -> Vec<String> {
    ["-u", "-m", "robohub_worker", "--venv", "{venvs_dir}/{module_id}", "{entry}"]
        .map(String::from)
        .to_vec()
}
fn default_installer_program() -> String {
    "sh".to_string()
}
fn default_installer_args() -> Vec<String> {
    [
        "-c",
        "python3 -m venv \"$0\" && \"$0/bin/pip\" install -q -r \"$1\"",
        "{venv}",
        "{requirements}",
    ]
    .map(String::from)
    .to_vec()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modules_dir: default_modules_dir(),
            venvs_dir: default_venvs_dir(),
            logs_dir: default_logs_dir(),
            serial_port: None,
            baud_rate: default_baud_rate(),
            light_transform: LightTransform::default(),
            channel_count: default_channel_count(),
            tick_ms: default_tick_ms(),
            grace_secs: default_grace_secs(),
            e2e_timeout_secs: default_e2e_timeout_secs(),
            check_timeout_secs: default_check_timeout_secs(),
            test_concurrency: default_test_concurrency(),
            death_policy: DeathPolicy::default(),
            launcher: LauncherConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}

impl Config {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn e2e_timeout(&self) -> Duration {
        Duration::from_secs(self.e2e_timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn worker_launcher(&self) -> ProgramLauncher {
        ProgramLauncher::new(&self.launcher.program, self.launcher.args.clone())
            .with_venvs_dir(&self.venvs_dir)
    }

    pub fn provisioner(&self) -> Provisioner {
        Provisioner::new(
            &self.venvs_dir,
            &self.installer.program,
            self.installer.args.clone(),
        )
    }
}

/// Return the path to `~/.robohub/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".robohub").join("config.toml")
}

/// Effective configuration: the file at `explicit` (or the default path)
/// when present, defaults otherwise, then environment overrides.
pub fn resolve(explicit: Option<&Path>) -> Result<Config, HubError> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(config_path);
    let mut cfg = match load_from(&path)? {
        Some(cfg) => cfg,
        None if explicit.is_some() => {
            return Err(HubError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  `None` if the file is absent.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, HubError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        HubError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| HubError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `ROBOHUB_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROBOHUB_MODULES_DIR` | `modules_dir` |
/// | `ROBOHUB_LOGS_DIR` | `logs_dir` |
/// | `ROBOHUB_SERIAL_PORT` | `serial_port` |
/// | `ROBOHUB_TICK_MS` | `tick_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ROBOHUB_MODULES_DIR") {
        cfg.modules_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("ROBOHUB_LOGS_DIR") {
        cfg.logs_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("ROBOHUB_SERIAL_PORT") {
        cfg.serial_port = Some(v).filter(|p| !p.trim().is_empty());
    }
    if let Ok(v) = std::env::var("ROBOHUB_TICK_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.tick_ms = ms;
    }
}

/// Write `cfg` to `path`, creating parent directories.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), HubError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| HubError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)?;
    Ok(())
}
