//! Static plugin metadata, as stored in projects and sent to the sandbox.

use std::collections::HashSet;
use std::path::PathBuf;

use cadenza_graph::{PortFlags, PortRange};
use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Upper bound on the audio channels a single plugin may declare.
pub const MAX_PLUGIN_CHANNELS: u16 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginFormat {
    /// Runs inside the engine process.
    Native,
    /// Runs in a sandbox process behind the shared-memory bridge.
    Bridged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginCategory {
    Instrument,
    Effect,
    MidiEffect,
    Modulator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub id: u32,
    pub name: String,
    pub range: PortRange,
    #[serde(default)]
    pub flags: PortFlags,
}

impl ParamInfo {
    pub fn new(id: u32, name: impl Into<String>, range: PortRange) -> Self {
        Self {
            id,
            name: name.into(),
            range,
            flags: PortFlags::automatable(),
        }
    }

    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub format: PluginFormat,
    /// Registry key, e.g. `cadenza:gain`.
    pub uri: String,
    /// Shared library to load before resolving `uri`. Built-in plugins have none.
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub version: String,
    pub category: PluginCategory,
    pub audio_inputs: u16,
    pub audio_outputs: u16,
    pub midi_inputs: u16,
    pub midi_outputs: u16,
    #[serde(default)]
    pub params: Vec<ParamInfo>,
}

impl PluginDescriptor {
    pub fn new(uri: impl Into<String>, name: impl Into<String>, category: PluginCategory) -> Self {
        Self {
            format: PluginFormat::Native,
            uri: uri.into(),
            path: None,
            name: name.into(),
            vendor: String::new(),
            version: String::new(),
            category,
            audio_inputs: 0,
            audio_outputs: 0,
            midi_inputs: 0,
            midi_outputs: 0,
            params: Vec::new(),
        }
    }

    pub fn with_format(mut self, format: PluginFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>, version: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.version = version.into();
        self
    }

    pub fn with_audio(mut self, inputs: u16, outputs: u16) -> Self {
        self.audio_inputs = inputs;
        self.audio_outputs = outputs;
        self
    }

    pub fn with_midi(mut self, inputs: u16, outputs: u16) -> Self {
        self.midi_inputs = inputs;
        self.midi_outputs = outputs;
        self
    }

    pub fn with_param(mut self, param: ParamInfo) -> Self {
        self.params.push(param);
        self
    }

    /// Same descriptor, hosted through the sandbox.
    pub fn bridged(&self) -> Self {
        self.clone().with_format(PluginFormat::Bridged)
    }

    pub fn param_index(&self, id: u32) -> Option<usize> {
        self.params.iter().position(|param| param.id == id)
    }

    pub fn has_midi_input(&self) -> bool {
        self.midi_inputs > 0
    }

    pub fn has_midi_output(&self) -> bool {
        self.midi_outputs > 0
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        if self.uri.trim().is_empty() {
            return Err(PluginError::InvalidDescriptor("empty uri".into()));
        }
        if self.name.trim().is_empty() {
            return Err(PluginError::InvalidDescriptor(format!(
                "{} has no name",
                self.uri
            )));
        }
        if self.audio_inputs > MAX_PLUGIN_CHANNELS || self.audio_outputs > MAX_PLUGIN_CHANNELS {
            return Err(PluginError::InvalidDescriptor(format!(
                "{} declares more than {MAX_PLUGIN_CHANNELS} audio channels",
                self.uri
            )));
        }
        if self.midi_inputs > 1 || self.midi_outputs > 1 {
            return Err(PluginError::InvalidDescriptor(format!(
                "{} declares more than one midi port per direction",
                self.uri
            )));
        }
        let mut ids = HashSet::with_capacity(self.params.len());
        for param in &self.params {
            if !ids.insert(param.id) {
                return Err(PluginError::InvalidDescriptor(format!(
                    "{} repeats parameter id {}",
                    self.uri, param.id
                )));
            }
            let range = param.range;
            if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                return Err(PluginError::InvalidDescriptor(format!(
                    "parameter {} of {} has an invalid range",
                    param.name, self.uri
                )));
            }
            if !(range.min..=range.max).contains(&range.default) {
                return Err(PluginError::InvalidDescriptor(format!(
                    "parameter {} of {} has a default outside its range",
                    param.name, self.uri
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new("test:fx", "Fx", PluginCategory::Effect)
            .with_audio(2, 2)
            .with_param(ParamInfo::new(0, "gain", PortRange::new(0.0, 2.0, 1.0)))
    }

    #[test]
    fn valid_descriptor_passes() {
        descriptor().validate().unwrap();
    }

    #[test]
    fn duplicate_param_ids_are_rejected() {
        let desc = descriptor().with_param(ParamInfo::new(0, "other", PortRange::unit()));
        assert!(matches!(
            desc.validate(),
            Err(PluginError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn default_outside_range_is_rejected() {
        let mut desc = descriptor();
        desc.params[0].range.default = 5.0;
        assert!(desc.validate().is_err());
    }

    #[test]
    fn descriptor_survives_json() {
        let desc = descriptor().bridged();
        let json = serde_json::to_string(&desc).unwrap();
        let back: PluginDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
        assert_eq!(back.format, PluginFormat::Bridged);
    }
}
