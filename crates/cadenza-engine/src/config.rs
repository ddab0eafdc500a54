//! Engine settings persisted as JSON.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::ConfigError;
use crate::recording::RecordingMode;

const CONFIG_DIR: &str = "cadenza";
const CONFIG_FILE: &str = "engine.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    pub backend: BackendKind,
    /// Graph worker threads. `None` uses one per core, `Some(0)` runs every
    /// node on the audio callback thread.
    pub worker_threads: Option<usize>,
    /// Fraction of the block duration a cycle may take before it is
    /// abandoned as an xrun.
    pub deadline_factor: f64,
    pub realtime_priority: bool,
    pub rt_priority_level: i32,
    pub eager_plugin_instantiation: bool,
    /// `None` keeps every undo step.
    pub max_undo_depth: Option<usize>,
    pub param_queue_capacity: usize,
    pub default_recording_mode: RecordingMode,
    pub preroll_bars: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 512,
            input_channels: 2,
            output_channels: 2,
            backend: BackendKind::Dummy,
            worker_threads: None,
            deadline_factor: 1.0,
            realtime_priority: true,
            rt_priority_level: 70,
            eager_plugin_instantiation: true,
            max_undo_depth: None,
            param_queue_capacity: 1024,
            default_recording_mode: RecordingMode::Overwrite,
            preroll_bars: 0,
        }
    }
}

impl EngineConfig {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_worker_threads(mut self, workers: Option<usize>) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn with_deadline_factor(mut self, factor: f64) -> Self {
        self.deadline_factor = factor;
        self
    }

    pub fn with_realtime_priority(mut self, enabled: bool) -> Self {
        self.realtime_priority = enabled;
        self
    }

    pub fn with_eager_plugins(mut self, eager: bool) -> Self {
        self.eager_plugin_instantiation = eager;
        self
    }

    pub fn with_max_undo_depth(mut self, depth: Option<usize>) -> Self {
        self.max_undo_depth = depth;
        self
    }

    pub fn with_param_queue_capacity(mut self, capacity: usize) -> Self {
        self.param_queue_capacity = capacity;
        self
    }

    pub fn with_recording_mode(mut self, mode: RecordingMode) -> Self {
        self.default_recording_mode = mode;
        self
    }

    pub fn with_preroll_bars(mut self, bars: u32) -> Self {
        self.preroll_bars = bars;
        self
    }

    /// `<config dir>/cadenza/engine.json`.
    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Some(path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reads the per-user config file, falling back to defaults when it is
    /// missing or unreadable. Invalid fields are replaced by their defaults.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config.sanitized(),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "ignoring unreadable engine config");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(ConfigError::Invalid {
                field: "sample_rate",
                reason: format!("{} Hz is outside 8000..=384000", self.sample_rate),
            });
        }
        if !(16..=8192).contains(&self.block_size) {
            return Err(ConfigError::Invalid {
                field: "block_size",
                reason: format!("{} frames is outside 16..=8192", self.block_size),
            });
        }
        if self.output_channels == 0 || self.output_channels > 64 {
            return Err(ConfigError::Invalid {
                field: "output_channels",
                reason: format!("{} channels", self.output_channels),
            });
        }
        if self.input_channels > 64 {
            return Err(ConfigError::Invalid {
                field: "input_channels",
                reason: format!("{} channels", self.input_channels),
            });
        }
        if !(self.deadline_factor.is_finite() && self.deadline_factor > 0.0) {
            return Err(ConfigError::Invalid {
                field: "deadline_factor",
                reason: format!("{} must be positive", self.deadline_factor),
            });
        }
        if self.param_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "param_queue_capacity",
                reason: "must hold at least one event".into(),
            });
        }
        if self.max_undo_depth == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_undo_depth",
                reason: "use None for unlimited history".into(),
            });
        }
        Ok(())
    }

    /// Replaces each invalid field with its default and reports it.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        while let Err(err) = self.validate() {
            tracing::warn!(%err, "engine config value replaced by its default");
            match err {
                ConfigError::Invalid { field, .. } => match field {
                    "sample_rate" => self.sample_rate = defaults.sample_rate,
                    "block_size" => self.block_size = defaults.block_size,
                    "output_channels" => self.output_channels = defaults.output_channels,
                    "input_channels" => self.input_channels = defaults.input_channels,
                    "deadline_factor" => self.deadline_factor = defaults.deadline_factor,
                    "param_queue_capacity" => {
                        self.param_queue_capacity = defaults.param_queue_capacity
                    }
                    _ => self.max_undo_depth = defaults.max_undo_depth,
                },
                _ => return defaults,
            }
        }
        self
    }
}
