//! In-process plugins: the factory registry, dynamic libraries and the
//! adapter that wraps a [`NativePlugin`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cadenza_graph::MidiBuffer;
use libloading::Library;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::adapter::PluginAdapter;
use crate::audio::AudioBus;
use crate::descriptor::{ParamInfo, PluginDescriptor, PluginFormat};
use crate::error::PluginError;

/// Symbol every plugin library exports.
pub const ENTRY_SYMBOL: &str = "cadenza_plugin_entry";

/// Signature of [`ENTRY_SYMBOL`]. The library registers its factories into
/// the registry it is handed; it must be built with the same compiler as the
/// host.
pub type PluginEntry = unsafe fn(&mut NativeRegistry);

/// A plugin implemented against the host's own types.
///
/// `params` holds the current value of every parameter in descriptor order.
pub trait NativePlugin: Send {
    fn activate(&mut self, _sample_rate: u32, _max_block: usize) {}

    fn deactivate(&mut self) {}

    fn process(
        &mut self,
        audio_in: &AudioBus,
        midi_in: &MidiBuffer,
        audio_out: &mut AudioBus,
        midi_out: &mut MidiBuffer,
        params: &[f32],
        nframes: usize,
    ) -> Result<(), PluginError>;

    /// Plugins with opaque internal state they cannot serialize return false.
    fn supports_state(&self) -> bool {
        true
    }

    /// Internal state beyond parameter values.
    fn save_extra(&self) -> Vec<u8> {
        Vec::new()
    }

    fn restore_extra(&mut self, _blob: &[u8]) -> Result<(), PluginError> {
        Ok(())
    }

    fn latency_samples(&self) -> u32 {
        0
    }
}

pub trait PluginFactory: Send + Sync {
    fn descriptor(&self) -> PluginDescriptor;
    fn create(&self) -> Box<dyn NativePlugin>;
}

struct FnFactory<F> {
    descriptor: PluginDescriptor,
    create: F,
}

impl<F> PluginFactory for FnFactory<F>
where
    F: Fn() -> Box<dyn NativePlugin> + Send + Sync,
{
    fn descriptor(&self) -> PluginDescriptor {
        self.descriptor.clone()
    }

    fn create(&self) -> Box<dyn NativePlugin> {
        (self.create)()
    }
}

/// Keeps the library mapped for as long as one of its plugins lives.
struct LibraryFactory {
    inner: Box<dyn PluginFactory>,
    library: Arc<Library>,
}

impl PluginFactory for LibraryFactory {
    fn descriptor(&self) -> PluginDescriptor {
        self.inner.descriptor()
    }

    fn create(&self) -> Box<dyn NativePlugin> {
        Box::new(LibraryPlugin {
            plugin: self.inner.create(),
            _library: Arc::clone(&self.library),
        })
    }
}

// Field order matters: the plugin must drop before its library.
struct LibraryPlugin {
    plugin: Box<dyn NativePlugin>,
    _library: Arc<Library>,
}

impl NativePlugin for LibraryPlugin {
    fn activate(&mut self, sample_rate: u32, max_block: usize) {
        self.plugin.activate(sample_rate, max_block);
    }

    fn deactivate(&mut self) {
        self.plugin.deactivate();
    }

    fn process(
        &mut self,
        audio_in: &AudioBus,
        midi_in: &MidiBuffer,
        audio_out: &mut AudioBus,
        midi_out: &mut MidiBuffer,
        params: &[f32],
        nframes: usize,
    ) -> Result<(), PluginError> {
        self.plugin
            .process(audio_in, midi_in, audio_out, midi_out, params, nframes)
    }

    fn supports_state(&self) -> bool {
        self.plugin.supports_state()
    }

    fn save_extra(&self) -> Vec<u8> {
        self.plugin.save_extra()
    }

    fn restore_extra(&mut self, blob: &[u8]) -> Result<(), PluginError> {
        self.plugin.restore_extra(blob)
    }

    fn latency_samples(&self) -> u32 {
        self.plugin.latency_samples()
    }
}

/// Factories for native plugins, keyed by uri.
#[derive(Default)]
pub struct NativeRegistry {
    factories: RwLock<HashMap<String, Arc<dyn PluginFactory>>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the plugins shipped with the engine.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::builtin::register_builtins(&registry);
        registry
    }

    pub fn register_factory(&self, factory: Arc<dyn PluginFactory>) {
        let uri = factory.descriptor().uri;
        if self.factories.write().insert(uri.clone(), factory).is_some() {
            tracing::debug!(%uri, "replaced plugin factory");
        }
    }

    pub fn register<F>(&self, descriptor: PluginDescriptor, create: F)
    where
        F: Fn() -> Box<dyn NativePlugin> + Send + Sync + 'static,
    {
        self.register_factory(Arc::new(FnFactory { descriptor, create }));
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.factories.read().contains_key(uri)
    }

    pub fn descriptor(&self, uri: &str) -> Option<PluginDescriptor> {
        self.factories.read().get(uri).map(|factory| factory.descriptor())
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        let mut all: Vec<_> = self
            .factories
            .read()
            .values()
            .map(|factory| factory.descriptor())
            .collect();
        all.sort_by(|a, b| a.uri.cmp(&b.uri));
        all
    }

    pub fn factory(&self, uri: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.read().get(uri).cloned()
    }

    /// Loads a plugin library and registers everything it exports.
    ///
    /// # Safety
    ///
    /// Runs foreign initialisation code. The library must export
    /// [`ENTRY_SYMBOL`] with the [`PluginEntry`] signature.
    pub unsafe fn load_library(&self, path: impl AsRef<Path>) -> Result<Vec<String>, PluginError> {
        let path = path.as_ref().to_path_buf();
        let library = Library::new(&path).map_err(|err| PluginError::Library {
            path: path.clone(),
            message: err.to_string(),
        })?;
        let entry = *library
            .get::<PluginEntry>(ENTRY_SYMBOL.as_bytes())
            .map_err(|err| PluginError::Library {
                path: path.clone(),
                message: format!("missing entry symbol: {err}"),
            })?;
        let mut staging = NativeRegistry::new();
        entry(&mut staging);
        let library = Arc::new(library);
        let staged: Vec<_> = staging.factories.into_inner().into_values().collect();
        let mut uris = Vec::with_capacity(staged.len());
        for factory in staged {
            uris.push(factory.descriptor().uri);
            self.register_factory(Arc::new(LibraryFactory {
                inner: Box::new(SharedFactory(factory)),
                library: Arc::clone(&library),
            }));
        }
        tracing::info!(?path, plugins = uris.len(), "loaded plugin library");
        Ok(uris)
    }
}

struct SharedFactory(Arc<dyn PluginFactory>);

impl PluginFactory for SharedFactory {
    fn descriptor(&self) -> PluginDescriptor {
        self.0.descriptor()
    }

    fn create(&self) -> Box<dyn NativePlugin> {
        self.0.create()
    }
}

#[derive(Serialize, Deserialize)]
struct NativeState {
    params: Vec<f32>,
    #[serde(default)]
    extra: Vec<u8>,
}

/// [`PluginAdapter`] over an in-process [`NativePlugin`].
pub struct NativeAdapter {
    descriptor: PluginDescriptor,
    plugin: Box<dyn NativePlugin>,
    values: Vec<f32>,
    active: bool,
}

impl NativeAdapter {
    pub fn new(descriptor: PluginDescriptor, plugin: Box<dyn NativePlugin>) -> Self {
        let values = descriptor
            .params
            .iter()
            .map(|param| param.range.default)
            .collect();
        Self {
            descriptor,
            plugin,
            values,
            active: false,
        }
    }

    /// Instantiates `descriptor` from the registry, loading its library first
    /// when the uri is not registered yet.
    pub fn load(registry: &NativeRegistry, descriptor: &PluginDescriptor) -> Result<Self, PluginError> {
        descriptor.validate()?;
        if !registry.contains(&descriptor.uri) {
            if let Some(path) = &descriptor.path {
                // SAFETY: the path comes from a descriptor the user chose to load.
                unsafe { registry.load_library(path)? };
            }
        }
        let factory = registry
            .factory(&descriptor.uri)
            .ok_or_else(|| PluginError::NotFound(descriptor.uri.clone()))?;
        let registered = factory.descriptor();
        if registered.audio_inputs != descriptor.audio_inputs
            || registered.audio_outputs != descriptor.audio_outputs
            || registered.midi_inputs != descriptor.midi_inputs
            || registered.midi_outputs != descriptor.midi_outputs
            || registered.params.len() != descriptor.params.len()
        {
            return Err(PluginError::Instantiation(format!(
                "{} no longer matches its saved port layout",
                descriptor.uri
            )));
        }
        Ok(Self::new(registered, factory.create()))
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

impl PluginAdapter for NativeAdapter {
    fn format(&self) -> PluginFormat {
        PluginFormat::Native
    }

    fn params(&self) -> &[ParamInfo] {
        &self.descriptor.params
    }

    fn activate(&mut self, sample_rate: u32, max_block: usize) -> Result<(), PluginError> {
        if !self.active {
            self.plugin.activate(sample_rate, max_block);
            self.active = true;
        }
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), PluginError> {
        if self.active {
            self.plugin.deactivate();
            self.active = false;
        }
        Ok(())
    }

    fn process(
        &mut self,
        audio_in: &AudioBus,
        midi_in: &MidiBuffer,
        audio_out: &mut AudioBus,
        midi_out: &mut MidiBuffer,
        nframes: usize,
    ) -> Result<(), PluginError> {
        if !self.active {
            return Err(PluginError::NotActive);
        }
        self.plugin
            .process(audio_in, midi_in, audio_out, midi_out, &self.values, nframes)
    }

    fn set_param(&mut self, index: usize, value: f32) {
        if let (Some(slot), Some(info)) = (self.values.get_mut(index), self.descriptor.params.get(index)) {
            *slot = info.range.snap(value, info.flags);
        }
    }

    fn param(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }

    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        if !self.plugin.supports_state() {
            return Err(PluginError::Unsavable);
        }
        let state = NativeState {
            params: self.values.clone(),
            extra: self.plugin.save_extra(),
        };
        serde_json::to_vec(&state).map_err(|err| PluginError::State(err.to_string()))
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<(), PluginError> {
        let state: NativeState =
            serde_json::from_slice(blob).map_err(|err| PluginError::State(err.to_string()))?;
        if state.params.len() != self.values.len() {
            return Err(PluginError::State(format!(
                "expected {} parameters, found {}",
                self.values.len(),
                state.params.len()
            )));
        }
        for (index, value) in state.params.into_iter().enumerate() {
            self.set_param(index, value);
        }
        self.plugin.restore_extra(&state.extra)
    }

    fn latency_samples(&self) -> u32 {
        self.plugin.latency_samples()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered_and_sorted() {
        let registry = NativeRegistry::with_builtins();
        let uris: Vec<_> = registry.descriptors().into_iter().map(|d| d.uri).collect();
        let mut sorted = uris.clone();
        sorted.sort();
        assert_eq!(uris, sorted);
        assert!(registry.contains(crate::builtin::GAIN_URI));
    }

    #[test]
    fn unknown_uri_is_not_found() {
        let registry = NativeRegistry::with_builtins();
        let desc = PluginDescriptor::new(
            "missing:plugin",
            "Missing",
            crate::descriptor::PluginCategory::Effect,
        );
        assert!(matches!(
            NativeAdapter::load(&registry, &desc),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn missing_library_reports_path() {
        let registry = NativeRegistry::new();
        let desc = PluginDescriptor::new(
            "lib:plugin",
            "Lib",
            crate::descriptor::PluginCategory::Effect,
        )
        .with_path("/nonexistent/libplugin.so");
        assert!(matches!(
            NativeAdapter::load(&registry, &desc),
            Err(PluginError::Library { .. })
        ));
    }

    #[test]
    fn state_round_trips_parameters() {
        let registry = NativeRegistry::with_builtins();
        let desc = crate::builtin::gain_descriptor();
        let mut adapter = NativeAdapter::load(&registry, &desc).unwrap();
        adapter.set_param(0, 0.25);
        let blob = adapter.save_state().unwrap();
        adapter.set_param(0, 1.5);
        adapter.restore_state(&blob).unwrap();
        assert_eq!(adapter.param(0), Some(0.25));
    }

    #[test]
    fn process_requires_activation() {
        let registry = NativeRegistry::with_builtins();
        let desc = crate::builtin::gain_descriptor();
        let mut adapter = NativeAdapter::load(&registry, &desc).unwrap();
        let input = AudioBus::new(2, 16);
        let mut output = AudioBus::new(2, 16);
        let midi = MidiBuffer::with_capacity(4);
        let mut midi_out = MidiBuffer::with_capacity(4);
        assert!(matches!(
            adapter.process(&input, &midi, &mut output, &mut midi_out, 16),
            Err(PluginError::NotActive)
        ));
        adapter.activate(48_000, 16).unwrap();
        adapter
            .process(&input, &midi, &mut output, &mut midi_out, 16)
            .unwrap();
    }
}
