//! Plugin hosting for the Cadenza engine.
//!
//! Every plugin format sits behind [`PluginAdapter`]. Native plugins run in
//! process through [`NativeAdapter`]; plugins that need isolation run in a
//! sandbox process driven by [`BridgedAdapter`], which exchanges audio through
//! a shared-memory ring and control messages through a pipe. Parameters are
//! surfaced as control ports by [`PluginNode`], so they are automated and
//! routed like any other port.

pub mod adapter;
pub mod audio;
pub mod bridge;
pub mod builtin;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod instance;
pub mod native;
pub mod node;

pub use adapter::PluginAdapter;
pub use audio::AudioBus;
pub use bridge::{BridgeConfig, BridgeLauncher, BridgedAdapter, SandboxBroker};
pub use descriptor::{ParamInfo, PluginCategory, PluginDescriptor, PluginFormat};
pub use error::{BridgeError, PluginError};
pub use host::PluginHost;
pub use instance::{PluginInstance, PluginState};
pub use native::{NativeAdapter, NativePlugin, NativeRegistry, PluginEntry, ENTRY_SYMBOL};
pub use node::{PluginNode, PluginPorts};
