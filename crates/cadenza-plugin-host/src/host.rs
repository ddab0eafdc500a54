use std::sync::Arc;

use crate::adapter::PluginAdapter;
use crate::bridge::{BridgeConfig, BridgedAdapter};
use crate::descriptor::{PluginDescriptor, PluginFormat};
use crate::error::PluginError;
use crate::native::{NativeAdapter, NativeRegistry};

/// Creates adapters for descriptors, dispatching on their format.
#[derive(Clone)]
pub struct PluginHost {
    registry: Arc<NativeRegistry>,
    bridge: BridgeConfig,
}

impl PluginHost {
    pub fn new(registry: Arc<NativeRegistry>, bridge: BridgeConfig) -> Self {
        Self { registry, bridge }
    }

    /// Built-in plugins, bridged plugins run in the `cadenza-plugin-bridge`
    /// executable.
    pub fn with_builtins() -> Self {
        Self::new(Arc::new(NativeRegistry::with_builtins()), BridgeConfig::default())
    }

    pub fn registry(&self) -> &Arc<NativeRegistry> {
        &self.registry
    }

    pub fn bridge_config(&self) -> &BridgeConfig {
        &self.bridge
    }

    pub fn set_bridge_config(&mut self, bridge: BridgeConfig) {
        self.bridge = bridge;
    }

    pub fn load(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn PluginAdapter>, PluginError> {
        descriptor.validate()?;
        match descriptor.format {
            PluginFormat::Native => Ok(Box::new(NativeAdapter::load(&self.registry, descriptor)?)),
            PluginFormat::Bridged => Ok(Box::new(BridgedAdapter::spawn(
                &self.bridge,
                &self.registry,
                descriptor,
            )?)),
        }
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins", &self.registry.descriptors().len())
            .field("bridge", &self.bridge)
            .finish()
    }
}
