//! Lifecycle of one plugin slot.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use cadenza_graph::{ControlCell, MidiBuffer, ProcessError};
use parking_lot::Mutex;

use crate::adapter::PluginAdapter;
use crate::audio::AudioBus;
use crate::descriptor::PluginDescriptor;
use crate::error::PluginError;
use crate::host::PluginHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PluginState {
    Created = 0,
    Instantiated = 1,
    Active = 2,
    /// Instantiation failed; the slot keeps its descriptor and saved state.
    Disabled = 3,
    /// The plugin failed while processing and is bypassed.
    Crashed = 4,
}

impl PluginState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Instantiated,
            2 => Self::Active,
            3 => Self::Disabled,
            4 => Self::Crashed,
            _ => Self::Created,
        }
    }
}

/// A plugin slot shared between the control thread and the graph.
///
/// The audio thread only ever `try_lock`s the adapter; a contended lock
/// skips the plugin for one cycle instead of waiting.
pub struct PluginInstance {
    descriptor: PluginDescriptor,
    state: AtomicU8,
    enabled: AtomicBool,
    latency: AtomicU32,
    adapter: Mutex<Option<Box<dyn PluginAdapter>>>,
    params: Vec<ControlCell>,
    /// Last known state blob. Applied on instantiation and returned while the
    /// plugin cannot be asked directly.
    stored_state: Mutex<Option<Vec<u8>>>,
    last_error: Mutex<Option<String>>,
}

impl PluginInstance {
    pub fn new(descriptor: PluginDescriptor) -> Result<Arc<Self>, PluginError> {
        descriptor.validate()?;
        let params = descriptor
            .params
            .iter()
            .map(|param| ControlCell::new(param.range, param.flags))
            .collect();
        Ok(Arc::new(Self {
            descriptor,
            state: AtomicU8::new(PluginState::Created as u8),
            enabled: AtomicBool::new(true),
            latency: AtomicU32::new(0),
            adapter: Mutex::new(None),
            params,
            stored_state: Mutex::new(None),
            last_error: Mutex::new(None),
        }))
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PluginState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.state() == PluginState::Active
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// User bypass. Returns the previous value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::AcqRel)
    }

    pub fn latency_samples(&self) -> u32 {
        self.latency.load(Ordering::Acquire)
    }

    pub fn param_cells(&self) -> &[ControlCell] {
        &self.params
    }

    pub fn param_cell(&self, index: usize) -> Option<&ControlCell> {
        self.params.get(index)
    }

    /// Sets a parameter by index and returns the clamped value.
    pub fn set_param(&self, index: usize, value: f32) -> Option<f32> {
        self.params.get(index).map(|cell| cell.set(value))
    }

    pub fn param(&self, index: usize) -> Option<f32> {
        self.params.get(index).map(ControlCell::get)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Loads and activates the plugin. On failure the slot is left
    /// [`PluginState::Disabled`] and the error is returned for reporting.
    pub fn instantiate(
        &self,
        host: &PluginHost,
        sample_rate: u32,
        max_block: usize,
    ) -> Result<(), PluginError> {
        if matches!(self.state(), PluginState::Instantiated | PluginState::Active) {
            return Ok(());
        }
        match self.try_instantiate(host, sample_rate, max_block) {
            Ok(adapter) => {
                self.latency
                    .store(adapter.latency_samples(), Ordering::Release);
                *self.adapter.lock() = Some(adapter);
                *self.last_error.lock() = None;
                self.set_state(PluginState::Active);
                tracing::debug!(uri = %self.descriptor.uri, "plugin active");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(uri = %self.descriptor.uri, %err, "plugin disabled");
                *self.last_error.lock() = Some(err.to_string());
                self.set_state(PluginState::Disabled);
                Err(err)
            }
        }
    }

    fn try_instantiate(
        &self,
        host: &PluginHost,
        sample_rate: u32,
        max_block: usize,
    ) -> Result<Box<dyn PluginAdapter>, PluginError> {
        let mut adapter = host.load(&self.descriptor)?;
        self.set_state(PluginState::Instantiated);
        if let Some(blob) = self.stored_state.lock().as_deref() {
            adapter.restore_state(blob)?;
            for (index, cell) in self.params.iter().enumerate() {
                if let Some(value) = adapter.param(index) {
                    cell.set(value);
                }
            }
        }
        for (index, cell) in self.params.iter().enumerate() {
            adapter.set_param(index, cell.get());
        }
        adapter.activate(sample_rate, max_block)?;
        Ok(adapter)
    }

    pub fn deactivate(&self) -> Result<(), PluginError> {
        let mut guard = self.adapter.lock();
        let adapter = guard.as_mut().ok_or(PluginError::NotInstantiated)?;
        adapter.deactivate()?;
        if self.state() == PluginState::Active {
            self.set_state(PluginState::Instantiated);
        }
        Ok(())
    }

    /// Saves state first, then drops the adapter. The slot returns to
    /// [`PluginState::Created`] and can be instantiated again.
    pub fn release(&self) {
        if let Ok(blob) = self.save_state() {
            *self.stored_state.lock() = Some(blob);
        }
        let adapter = self.adapter.lock().take();
        if let Some(mut adapter) = adapter {
            if let Err(err) = adapter.deactivate() {
                tracing::debug!(uri = %self.descriptor.uri, %err, "deactivate on release failed");
            }
        }
        self.set_state(PluginState::Created);
    }

    pub fn save_state(&self) -> Result<Vec<u8>, PluginError> {
        if self.state() != PluginState::Crashed {
            if let Some(adapter) = self.adapter.lock().as_mut() {
                let blob = adapter.save_state()?;
                *self.stored_state.lock() = Some(blob.clone());
                return Ok(blob);
            }
        }
        self.stored_state.lock().clone().ok_or(PluginError::Unsavable)
    }

    /// Whether removing this plugin could be undone by re-creating it from
    /// saved state.
    pub fn can_save_state(&self) -> bool {
        self.save_state().is_ok()
    }

    pub fn restore_state(&self, blob: &[u8]) -> Result<(), PluginError> {
        if self.state() != PluginState::Crashed {
            if let Some(adapter) = self.adapter.lock().as_mut() {
                adapter.restore_state(blob)?;
                for (index, cell) in self.params.iter().enumerate() {
                    if let Some(value) = adapter.param(index) {
                        cell.set(value);
                    }
                }
            }
        }
        *self.stored_state.lock() = Some(blob.to_vec());
        Ok(())
    }

    /// Audio-thread entry point. `params` are the resolved control values in
    /// descriptor order; `changed` flags the ones to forward.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &self,
        audio_in: &AudioBus,
        midi_in: &MidiBuffer,
        audio_out: &mut AudioBus,
        midi_out: &mut MidiBuffer,
        params: &[f32],
        changed: &[bool],
        nframes: usize,
    ) -> Result<(), ProcessError> {
        if !self.is_active() {
            return Err(ProcessError::Skipped);
        }
        let Some(mut guard) = self.adapter.try_lock() else {
            return Err(ProcessError::Skipped);
        };
        let Some(adapter) = guard.as_mut() else {
            return Err(ProcessError::Skipped);
        };
        for (index, (value, dirty)) in params.iter().zip(changed).enumerate() {
            if *dirty {
                adapter.set_param(index, *value);
            }
        }
        match adapter.process(audio_in, midi_in, audio_out, midi_out, nframes) {
            Ok(()) => Ok(()),
            Err(PluginError::NotActive) => Err(ProcessError::Skipped),
            Err(_) => {
                self.set_state(PluginState::Crashed);
                Err(ProcessError::Failed("plugin process failed"))
            }
        }
    }

    /// Marks the slot crashed. Safe to call from the audio thread.
    pub fn mark_crashed(&self) {
        self.set_state(PluginState::Crashed);
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("uri", &self.descriptor.uri)
            .field("state", &self.state())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        if let Some(mut adapter) = self.adapter.get_mut().take() {
            let _ = adapter.deactivate();
        }
    }
}
