//! The single seam between the engine and any plugin format.

use cadenza_graph::MidiBuffer;

use crate::audio::AudioBus;
use crate::descriptor::{ParamInfo, PluginFormat};
use crate::error::PluginError;

/// Uniform contract over plugin formats.
///
/// `process` runs on the audio thread: implementations must not block or
/// allocate there. Everything else is called from the control thread.
pub trait PluginAdapter: Send {
    fn format(&self) -> PluginFormat;

    fn params(&self) -> &[ParamInfo];

    fn activate(&mut self, sample_rate: u32, max_block: usize) -> Result<(), PluginError>;

    fn deactivate(&mut self) -> Result<(), PluginError>;

    fn process(
        &mut self,
        audio_in: &AudioBus,
        midi_in: &MidiBuffer,
        audio_out: &mut AudioBus,
        midi_out: &mut MidiBuffer,
        nframes: usize,
    ) -> Result<(), PluginError>;

    /// Sets a parameter by its index in [`PluginAdapter::params`].
    fn set_param(&mut self, index: usize, value: f32);

    fn param(&self, index: usize) -> Option<f32>;

    fn save_state(&mut self) -> Result<Vec<u8>, PluginError>;

    fn restore_state(&mut self, blob: &[u8]) -> Result<(), PluginError>;

    fn latency_samples(&self) -> u32 {
        0
    }
}
