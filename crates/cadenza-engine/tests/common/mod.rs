#![allow(dead_code)]

use std::sync::Arc;

use cadenza_engine::EngineConfig;
use cadenza_graph::MidiBuffer;
use cadenza_plugin_host::{
    AudioBus, BridgeConfig, NativePlugin, NativeRegistry, PluginCategory, PluginDescriptor, PluginError,
    PluginHost,
};

pub const CRASH_URI: &str = "test:crash";
pub const OPAQUE_URI: &str = "test:opaque";

pub fn config(block_size: usize) -> EngineConfig {
    EngineConfig::default()
        .with_block_size(block_size)
        .with_worker_threads(Some(0))
        .with_realtime_priority(false)
        .with_deadline_factor(50.0)
}

pub fn crash_descriptor() -> PluginDescriptor {
    PluginDescriptor::new(CRASH_URI, "Crasher", PluginCategory::Effect).with_audio(2, 2)
}

pub fn opaque_descriptor() -> PluginDescriptor {
    PluginDescriptor::new(OPAQUE_URI, "Opaque", PluginCategory::Effect).with_audio(2, 2)
}

/// Fails on its second block.
#[derive(Default)]
struct Crasher {
    blocks: usize,
}

impl NativePlugin for Crasher {
    fn process(
        &mut self,
        _audio_in: &AudioBus,
        _midi_in: &MidiBuffer,
        _audio_out: &mut AudioBus,
        _midi_out: &mut MidiBuffer,
        _params: &[f32],
        _nframes: usize,
    ) -> Result<(), PluginError> {
        self.blocks += 1;
        if self.blocks > 1 {
            return Err(PluginError::Process("boom"));
        }
        Ok(())
    }
}

/// Keeps state it cannot serialize.
struct Opaque;

impl NativePlugin for Opaque {
    fn process(
        &mut self,
        audio_in: &AudioBus,
        _midi_in: &MidiBuffer,
        audio_out: &mut AudioBus,
        _midi_out: &mut MidiBuffer,
        _params: &[f32],
        nframes: usize,
    ) -> Result<(), PluginError> {
        audio_out.copy_from(audio_in, nframes);
        Ok(())
    }

    fn supports_state(&self) -> bool {
        false
    }
}

/// Built-in plugins plus the two test plugins above.
pub fn host() -> PluginHost {
    let registry = NativeRegistry::with_builtins();
    registry.register(crash_descriptor(), || Box::<Crasher>::default());
    registry.register(opaque_descriptor(), || Box::new(Opaque));
    PluginHost::new(Arc::new(registry), BridgeConfig::default())
}
