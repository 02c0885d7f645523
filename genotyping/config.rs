// ========================================================================================
//
//                             Workflow Configuration
//
// ========================================================================================
//
// Typed settings for planning, batch resources, dispatch and each caller. Every
// table rejects unknown keys, so a misspelled option fails at load time instead of
// silently falling back to a default.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::grouping::DEFAULT_GROUP_SIZE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Working directory '{0}' must be an absolute path to an existing directory")]
    WorkDir(PathBuf),
    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerConfig {
    pub work_dir: PathBuf,
    /// Defaults to `<work_dir>/log`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Partitions per grouping directory for every caller whose own table
    /// leaves `group_size` unset.
    #[serde(default = "default_group_size")]
    pub group_size: usize,
}

impl PlannerConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            log_dir: None,
            group_size: DEFAULT_GROUP_SIZE,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.work_dir.join(dir),
            None => self.work_dir.join("log"),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.work_dir.is_absolute() || !self.work_dir.is_dir() {
            return Err(ConfigError::WorkDir(self.work_dir.clone()));
        }
        if self.group_size == 0 {
            return Err(ConfigError::invalid("planner.group_size", "must be at least 1"));
        }
        Ok(())
    }
}

/// Resource hints passed to the batch scheduler. They never affect task identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BatchResources {
    pub memory_mb: u32,
    pub queue: String,
}

impl Default for BatchResources {
    fn default() -> Self {
        Self {
            memory_mb: 500,
            queue: "normal".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DispatchSettings {
    /// Concurrent chunks for the local dispatcher; all CPUs when unset.
    pub parallelism: Option<usize>,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            parallelism: None,
            timeout_secs: 24 * 60 * 60,
            poll_interval_ms: 500,
        }
    }
}

impl DispatchSettings {
    pub fn workers(&self) -> usize {
        self.parallelism.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GenoSnpOptions {
    pub chunk_size: u64,
    pub group_size: Option<usize>,
    pub cutoff: f64,
    pub plink: bool,
    /// Tees the raw intensities of every chunk to `<output>.raw.txt`.
    pub debug: bool,
}

impl Default for GenoSnpOptions {
    fn default() -> Self {
        Self {
            chunk_size: 20,
            group_size: None,
            cutoff: 0.7,
            plink: true,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IlluminusOptions {
    pub chunk_size: u64,
    pub group_size: Option<usize>,
    pub plink: bool,
}

impl Default for IlluminusOptions {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            group_size: None,
            plink: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ZCallOptions {
    pub chunk_size: u64,
    pub group_size: Option<usize>,
    /// First candidate integer z score.
    pub zstart: u32,
    /// Number of candidate z scores; evaluation is skipped when it is 1.
    pub ztotal: u32,
}

impl Default for ZCallOptions {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            group_size: None,
            zstart: 1,
            ztotal: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub planner: PlannerConfig,
    #[serde(default)]
    pub resources: BatchResources,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub genosnp: GenoSnpOptions,
    #[serde(default)]
    pub illuminus: IlluminusOptions,
    #[serde(default)]
    pub zcall: ZCallOptions,
}

fn default_group_size() -> usize {
    DEFAULT_GROUP_SIZE
}

impl WorkflowConfig {
    /// Defaults for every table, rooted at `work_dir`.
    pub fn for_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            planner: PlannerConfig::new(work_dir),
            resources: BatchResources::default(),
            dispatch: DispatchSettings::default(),
            genosnp: GenoSnpOptions::default(),
            illuminus: IlluminusOptions::default(),
            zcall: ZCallOptions::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses `path` without validating, so overrides can be applied first.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.planner.validate()?;

        let chunk_sizes = [
            ("genosnp.chunk_size", self.genosnp.chunk_size),
            ("illuminus.chunk_size", self.illuminus.chunk_size),
            ("zcall.chunk_size", self.zcall.chunk_size),
        ];
        for (key, size) in chunk_sizes {
            if size == 0 {
                return Err(ConfigError::invalid(key, "must be at least 1"));
            }
        }
        let group_sizes = [
            ("genosnp.group_size", self.genosnp.group_size),
            ("illuminus.group_size", self.illuminus.group_size),
            ("zcall.group_size", self.zcall.group_size),
        ];
        for (key, size) in group_sizes {
            if size == Some(0) {
                return Err(ConfigError::invalid(key, "must be at least 1"));
            }
        }

        if !(0.0..=1.0).contains(&self.genosnp.cutoff) {
            return Err(ConfigError::invalid(
                "genosnp.cutoff",
                format!("{} is outside [0, 1]", self.genosnp.cutoff),
            ));
        }
        if self.zcall.ztotal == 0 {
            return Err(ConfigError::invalid("zcall.ztotal", "must be at least 1"));
        }
        if self.zcall.zstart.checked_add(self.zcall.ztotal).is_none() {
            return Err(ConfigError::invalid(
                "zcall.ztotal",
                format!("zstart + ztotal exceeds {}", u32::MAX),
            ));
        }
        if self.resources.memory_mb == 0 {
            return Err(ConfigError::invalid("resources.memory_mb", "must be at least 1"));
        }
        if self.dispatch.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "dispatch.poll_interval_ms",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
