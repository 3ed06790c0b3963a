//! Configuration file management for drover.
//!
//! A TOML file, looked up at `--config`, then `./drover.toml`, then
//! `~/.config/drover/config.toml`. Every setting resolves through the chain
//! CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use drover_core::{AgentConfig, TransportKind};

pub const ENV_EXECUTABLE: &str = "DROVER_EXECUTABLE";
pub const ENV_ENDPOINT: &str = "DROVER_ENDPOINT";
pub const ENV_TRANSPORT: &str = "DROVER_TRANSPORT";
pub const ENV_ARTIFACTS_DIR: &str = "DROVER_ARTIFACTS_DIR";

/// Name of the project-local config file.
pub const LOCAL_CONFIG_FILE: &str = "drover.toml";

pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
pub const DEFAULT_REPEAT: u32 = 3;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub target: TargetSection,
    pub limits: LimitsSection,
    pub run: RunSection,
    pub artifacts: ArtifactsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    /// `pipe` (alias `cli`) or `http`.
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub endpoint: String,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            transport: TransportKind::Pipe.to_string(),
            executable: None,
            args: Vec::new(),
            endpoint: AgentConfig::DEFAULT_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub action_timeout_ms: u64,
    pub max_steps_per_scenario: u32,
    pub settle_delay_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            action_timeout_ms: millis(AgentConfig::DEFAULT_ACTION_TIMEOUT),
            max_steps_per_scenario: AgentConfig::DEFAULT_MAX_STEPS,
            settle_delay_ms: millis(AgentConfig::DEFAULT_SETTLE_DELAY),
            shutdown_grace_ms: millis(AgentConfig::DEFAULT_SHUTDOWN_GRACE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub repeat: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Scenario names to run when none are given on the command line.
    pub scenarios: Vec<String>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            repeat: DEFAULT_REPEAT,
            seed: None,
            scenarios: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub dir: PathBuf,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the user-level drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the path to the user-level config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Pick the config file to read, if any.
///
/// An explicit path must exist; the implicit locations are optional.
pub fn locate_config(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("config file {} does not exist", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Ok(Some(local));
    }
    let user = config_path();
    Ok(user.is_file().then_some(user))
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write a config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Settings given on the command line. `None` defers to the next link in
/// the chain.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub transport: Option<String>,
    pub executable: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub action_timeout_ms: Option<u64>,
    pub max_steps: Option<u32>,
    pub seed: Option<u64>,
    pub repeat: Option<u32>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct DroverConfig {
    pub agent: AgentConfig,
    pub artifacts_dir: PathBuf,
    pub repeat: u32,
    /// Scenario selection from the config file (empty means the default set).
    pub scenarios: Vec<String>,
    /// File the settings were read from, if any.
    pub source: Option<PathBuf>,
}

impl DroverConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    pub fn resolve(cli: &CliOverrides, config_file: Option<&Path>) -> Result<Self> {
        let source = locate_config(config_file)?;
        let file = match &source {
            Some(path) => load_config(path)?,
            None => ConfigFile::default(),
        };
        Self::resolve_with(cli, file, source)
    }

    /// Resolve against an already-loaded file.
    pub fn resolve_with(cli: &CliOverrides, file: ConfigFile, source: Option<PathBuf>) -> Result<Self> {
        let transport_name = cli
            .transport
            .clone()
            .or_else(|| env_var(ENV_TRANSPORT))
            .unwrap_or(file.target.transport);
        let transport: TransportKind = transport_name.parse()?;

        let executable = cli
            .executable
            .clone()
            .or_else(|| env_var(ENV_EXECUTABLE).map(PathBuf::from))
            .or(file.target.executable);

        let endpoint = cli
            .endpoint
            .clone()
            .or_else(|| env_var(ENV_ENDPOINT))
            .unwrap_or(file.target.endpoint);

        let artifacts_dir = cli
            .artifacts_dir
            .clone()
            .or_else(|| env_var(ENV_ARTIFACTS_DIR).map(PathBuf::from))
            .unwrap_or(file.artifacts.dir);

        let limits = file.limits;
        let agent = AgentConfig {
            transport,
            executable,
            args: file.target.args,
            endpoint,
            action_timeout: Duration::from_millis(
                cli.action_timeout_ms.unwrap_or(limits.action_timeout_ms),
            ),
            max_steps_per_scenario: cli.max_steps.unwrap_or(limits.max_steps_per_scenario),
            seed: cli.seed.or(file.run.seed),
            settle_delay: Duration::from_millis(limits.settle_delay_ms),
            shutdown_grace: Duration::from_millis(limits.shutdown_grace_ms),
        };
        agent.validate()?;

        if transport == TransportKind::Pipe && agent.executable.is_none() {
            bail!(
                "no target executable configured; pass --executable, set {ENV_EXECUTABLE}, \
                 or set target.executable in the config file"
            );
        }

        Ok(Self {
            agent,
            artifacts_dir,
            repeat: cli.repeat.unwrap_or(file.run.repeat),
            scenarios: file.run.scenarios,
            source,
        })
    }
}

/// Read an env var, treating empty as unset.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    fn clear_env() {
        for name in [ENV_EXECUTABLE, ENV_ENDPOINT, ENV_TRANSPORT, ENV_ARTIFACTS_DIR] {
            unsafe { std::env::remove_var(name) };
        }
    }

    fn file_with_executable(path: &str) -> ConfigFile {
        let mut file = ConfigFile::default();
        file.target.executable = Some(PathBuf::from(path));
        file
    }

    #[test]
    fn empty_file_parses_to_defaults() {
        let config: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(config, ConfigFile::default());
        assert_eq!(config.run.repeat, DEFAULT_REPEAT);
        assert_eq!(config.limits.action_timeout_ms, 5000);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
            [target]
            executable = "./example_app_cli"

            [limits]
            max_steps_per_scenario = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.target.transport, "pipe");
        assert_eq!(config.limits.max_steps_per_scenario, 10);
        assert_eq!(config.limits.settle_delay_ms, 1000);
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("drover.toml");

        let mut original = file_with_executable("/opt/app/cli");
        original.run.seed = Some(42);
        original.run.scenarios = vec!["basic_launch_and_read".to_string()];
        save_config(&original, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(ENV_EXECUTABLE, "/from/env") };

        let cli = CliOverrides {
            executable: Some(PathBuf::from("/from/cli")),
            seed: Some(7),
            repeat: Some(1),
            ..CliOverrides::default()
        };
        let config = DroverConfig::resolve_with(&cli, file_with_executable("/from/file"), None).unwrap();
        assert_eq!(config.agent.executable, Some(PathBuf::from("/from/cli")));
        assert_eq!(config.agent.seed, Some(7));
        assert_eq!(config.repeat, 1);

        clear_env();
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(ENV_EXECUTABLE, "/from/env") };
        unsafe { std::env::set_var(ENV_ARTIFACTS_DIR, "/tmp/drover-artifacts") };

        let config =
            DroverConfig::resolve_with(&CliOverrides::default(), file_with_executable("/from/file"), None)
                .unwrap();
        assert_eq!(config.agent.executable, Some(PathBuf::from("/from/env")));
        assert_eq!(config.artifacts_dir, PathBuf::from("/tmp/drover-artifacts"));

        clear_env();
    }

    #[test]
    fn resolve_defaults_when_only_executable_set() {
        let _lock = lock_env();
        clear_env();

        let config =
            DroverConfig::resolve_with(&CliOverrides::default(), file_with_executable("/from/file"), None)
                .unwrap();
        assert_eq!(config.agent.transport, TransportKind::Pipe);
        assert_eq!(config.agent.action_timeout, AgentConfig::DEFAULT_ACTION_TIMEOUT);
        assert_eq!(config.agent.max_steps_per_scenario, AgentConfig::DEFAULT_MAX_STEPS);
        assert_eq!(config.artifacts_dir, PathBuf::from(DEFAULT_ARTIFACTS_DIR));
        assert_eq!(config.repeat, DEFAULT_REPEAT);
        assert!(config.scenarios.is_empty());
    }

    #[test]
    fn resolve_errors_when_pipe_has_no_executable() {
        let _lock = lock_env();
        clear_env();

        let err = DroverConfig::resolve_with(&CliOverrides::default(), ConfigFile::default(), None)
            .unwrap_err();
        assert!(err.to_string().contains("no target executable"), "got: {err}");
    }

    #[test]
    fn http_transport_needs_no_executable() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(ENV_TRANSPORT, "http") };
        unsafe { std::env::set_var(ENV_ENDPOINT, "http://localhost:9000/api") };

        let config =
            DroverConfig::resolve_with(&CliOverrides::default(), ConfigFile::default(), None).unwrap();
        assert_eq!(config.agent.transport, TransportKind::Http);
        assert_eq!(config.agent.endpoint, "http://localhost:9000/api");

        clear_env();
    }

    #[test]
    fn socket_transport_is_rejected() {
        let _lock = lock_env();
        clear_env();

        let cli = CliOverrides {
            transport: Some("socket".to_string()),
            ..CliOverrides::default()
        };
        let err = DroverConfig::resolve_with(&cli, ConfigFile::default(), None).unwrap_err();
        assert!(err.to_string().contains("socket transport is not implemented"), "got: {err}");
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = locate_config(Some(&tmp.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"), "got: {err}");
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("drover/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
