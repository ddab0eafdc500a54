//! Out-of-process hosting.
//!
//! [`BridgedAdapter`] owns a [`SharedRing`] for audio and a
//! [`SandboxBroker`] for control requests. The sandbox side is
//! [`server::serve`], run either by the `cadenza-plugin-bridge` binary or on a
//! thread of the host process.

pub mod adapter;
pub mod broker;
pub mod ipc;
pub mod ring;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use adapter::BridgedAdapter;
pub use broker::{PipeBroker, SandboxBroker};
pub use ipc::{BridgeCommand, BridgeEvent, BridgeReply, BridgeRequest, IpcTransport, BRIDGE_PROTOCOL};
pub use ring::{RingLayout, RingStatus, SharedRing, SharedRingDescriptor, BRIDGE_MIDI_CAPACITY};

use crate::error::BridgeError;
use crate::native::NativeRegistry;

/// Environment variable overriding the sandbox executable.
pub const BRIDGE_EXECUTABLE_ENV: &str = "CADENZA_PLUGIN_BRIDGE";
const BRIDGE_EXECUTABLE: &str = "cadenza-plugin-bridge";

/// Where the sandbox side of a bridged plugin runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeLauncher {
    /// A separate process speaking the bridge protocol on stdin/stdout.
    Process { executable: PathBuf },
    /// A thread of this process, connected through anonymous pipes. Keeps the
    /// protocol but not the crash isolation.
    InProcess,
}

impl BridgeLauncher {
    pub fn launch(
        &self,
        registry: &Arc<NativeRegistry>,
        timeout: Duration,
    ) -> Result<Box<dyn SandboxBroker>, BridgeError> {
        match self {
            Self::Process { executable } => {
                Ok(Box::new(PipeBroker::spawn_process(executable, timeout)?))
            }
            Self::InProcess => Ok(Box::new(PipeBroker::spawn_thread(
                Arc::clone(registry),
                timeout,
            )?)),
        }
    }
}

impl Default for BridgeLauncher {
    fn default() -> Self {
        Self::Process {
            executable: default_bridge_executable(),
        }
    }
}

/// Looks for the bridge next to the running executable, then on `PATH`.
pub fn default_bridge_executable() -> PathBuf {
    if let Some(path) = std::env::var_os(BRIDGE_EXECUTABLE_ENV) {
        return PathBuf::from(path);
    }
    let file_name = format!("{BRIDGE_EXECUTABLE}{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(file_name))
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub launcher: BridgeLauncher,
    /// Largest block the ring can carry.
    pub max_block: u32,
    pub midi_capacity: u32,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    pub fn in_process() -> Self {
        Self {
            launcher: BridgeLauncher::InProcess,
            ..Self::default()
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            launcher: BridgeLauncher::default(),
            max_block: 4096,
            midi_capacity: BRIDGE_MIDI_CAPACITY,
            handshake_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
        }
    }
}
