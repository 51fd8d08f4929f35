use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How instruction failures are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Any RUN/CMD failure aborts the build.
    #[default]
    Local,
    /// RUN/CMD failures are logged and the layer is skipped.
    Lite,
}

impl BuildMode {
    pub fn tolerates_failures(self) -> bool {
        self == BuildMode::Lite
    }
}

impl FromStr for BuildMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BuildMode::Local),
            "lite" => Ok(BuildMode::Lite),
            other => Err(CoreError::Config(format!(
                "unknown build mode '{other}' (expected 'local' or 'lite')"
            ))),
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Local => f.write_str("local"),
            BuildMode::Lite => f.write_str("lite"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub mode: BuildMode,
    pub no_cache: bool,
}

/// Timings of the cluster steady-state check that precedes a registry
/// snapshot: one settle delay, then up to `attempts` polls `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub settle: Duration,
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            attempts: 10,
        }
    }
}

impl ReadinessPolicy {
    /// No waiting at all; for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            settle: Duration::ZERO,
            interval: Duration::ZERO,
            attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry storage directory to overlay during builds. No registry
    /// cache is captured when unset.
    pub bind_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub settle_secs: u64,
    pub interval_secs: u64,
    pub attempts: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        let policy = ReadinessPolicy::default();
        Self {
            settle_secs: policy.settle.as_secs(),
            interval_secs: policy.interval.as_secs(),
            attempts: policy.attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub backend: String,
    pub shell: String,
    pub kubectl: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: "overlay".to_owned(),
            shell: "/bin/sh".to_owned(),
            kubectl: "kubectl".to_owned(),
        }
    }
}

/// User configuration, read from `~/.config/stratum/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    pub store_root: Option<PathBuf>,
    pub registry: RegistryConfig,
    pub readiness: ReadinessConfig,
    pub executor: ExecutorConfig,
}

impl StratumConfig {
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return Some(PathBuf::from(xdg).join("stratum").join("config.toml"));
            }
        }
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".config/stratum/config.toml"))
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            settle: Duration::from_secs(self.readiness.settle_secs),
            interval: Duration::from_secs(self.readiness.interval_secs),
            attempts: self.readiness.attempts,
        }
    }
}
