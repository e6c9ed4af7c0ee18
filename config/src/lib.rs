//! User settings, read from a TOML file.
//!
//! Every key is optional; anything missing takes its default.
//!
//! ```toml
//! poll_interval_ms = 100
//! join_timeout_ms = 500
//!
//! [snapshot]
//! max_depth = 2
//!
//! [frames]
//! skip_prefixes = ["/usr/share/lua"]
//! ```
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use transport::WorkerOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long the front end waits between polls of the worker.
    pub poll_interval_ms: u64,
    /// Grace period for a finished worker before it is killed.
    pub join_timeout_ms: u64,
    pub snapshot: SnapshotSettings,
    pub frames: FrameSettings,
    pub worker: WorkerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            join_timeout_ms: 500,
            snapshot: SnapshotSettings::default(),
            frames: FrameSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub max_depth: usize,
    pub max_repr_len: usize,
    pub max_stack_depth: usize,
    pub hide_builtin_globals: bool,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        let options = WorkerOptions::default();
        Self {
            max_depth: options.max_depth,
            max_repr_len: options.max_repr_len,
            max_stack_depth: options.max_stack_depth,
            hide_builtin_globals: options.hide_builtin_globals,
        }
    }
}

/// Which frames the stepper treats as internal and never pauses in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSettings {
    pub skip_non_file_sources: bool,
    pub skip_prefixes: Vec<PathBuf>,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            skip_non_file_sources: true,
            skip_prefixes: Vec::new(),
        }
    }
}

/// Overrides the worker executable. By default the front end re-runs
/// itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

impl Settings {
    /// `<config dir>/luadbg/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("luadbg").join("config.toml"))
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let settings = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), ?settings, "loaded config");
        Ok(settings)
    }

    /// Load from [`Settings::default_path`], or defaults if there is no
    /// config directory.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            max_depth: self.snapshot.max_depth,
            max_repr_len: self.snapshot.max_repr_len,
            max_stack_depth: self.snapshot.max_stack_depth,
            hide_builtin_globals: self.snapshot.hide_builtin_globals,
            skip_non_file_sources: self.frames.skip_non_file_sources,
            skip_prefixes: self.frames.skip_prefixes.clone(),
        }
    }
}
