//! Host side of a sandboxed plugin.

use std::sync::Arc;
use std::time::Duration;

use cadenza_graph::MidiBuffer;

use crate::adapter::PluginAdapter;
use crate::audio::AudioBus;
use crate::bridge::broker::SandboxBroker;
use crate::bridge::ipc::{BridgeCommand, BridgeEvent};
use crate::bridge::ring::{RingLayout, RingStatus, SharedRing};
use crate::bridge::BridgeConfig;
use crate::descriptor::{ParamInfo, PluginDescriptor, PluginFormat};
use crate::error::{BridgeError, PluginError};
use crate::native::NativeRegistry;

/// Runs a plugin in a sandbox and exchanges audio through a [`SharedRing`].
///
/// `process` publishes the current input and returns the output the sandbox
/// rendered for the previous block, so the plugin reports one extra block of
/// latency. A sandbox that has not finished in time yields silence.
pub struct BridgedAdapter {
    descriptor: PluginDescriptor,
    broker: Box<dyn SandboxBroker>,
    ring: SharedRing,
    timeout: Duration,
    values: Vec<f32>,
    in_flight: Option<u32>,
    remote_latency: u32,
    block: u32,
    active: bool,
    late_blocks: u64,
}

impl BridgedAdapter {
    pub fn spawn(
        config: &BridgeConfig,
        registry: &Arc<NativeRegistry>,
        descriptor: &PluginDescriptor,
    ) -> Result<Self, PluginError> {
        let broker = config
            .launcher
            .launch(registry, config.handshake_timeout)?;
        Self::with_broker(config, broker, descriptor)
    }

    /// Loads `descriptor` through an already connected broker.
    pub fn with_broker(
        config: &BridgeConfig,
        mut broker: Box<dyn SandboxBroker>,
        descriptor: &PluginDescriptor,
    ) -> Result<Self, PluginError> {
        descriptor.validate()?;
        let layout = RingLayout {
            frames: config.max_block,
            inputs: u32::from(descriptor.audio_inputs),
            outputs: u32::from(descriptor.audio_outputs),
            params: descriptor.params.len() as u32,
            midi_capacity: config.midi_capacity,
        };
        let ring = SharedRing::create(layout)?;
        let values: Vec<f32> = descriptor
            .params
            .iter()
            .map(|param| param.range.default)
            .collect();
        for (index, value) in values.iter().enumerate() {
            ring.set_param(index, *value);
        }
        let reply = broker.request(
            BridgeCommand::Load {
                descriptor: descriptor.clone(),
                ring: ring.descriptor().clone(),
            },
            config.request_timeout,
        );
        let remote_latency = match reply {
            Ok(BridgeEvent::Loaded { latency }) => latency,
            Ok(other) => {
                return Err(BridgeError::Protocol(format!("load answered with {other:?}")).into())
            }
            Err(BridgeError::Remote(message)) => return Err(PluginError::Instantiation(message)),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            descriptor: descriptor.clone(),
            broker,
            ring,
            timeout: config.request_timeout,
            values,
            in_flight: None,
            remote_latency,
            block: 0,
            active: false,
            late_blocks: 0,
        })
    }

    /// Blocks whose output was not ready when the host collected it.
    pub fn late_blocks(&self) -> u64 {
        self.late_blocks
    }

    pub fn is_alive(&mut self) -> bool {
        self.ring.status() == RingStatus::Running && self.broker.is_alive()
    }

    fn request(&mut self, command: BridgeCommand) -> Result<BridgeEvent, PluginError> {
        self.broker
            .request(command, self.timeout)
            .map_err(PluginError::from)
    }
}

impl PluginAdapter for BridgedAdapter {
    fn format(&self) -> PluginFormat {
        PluginFormat::Bridged
    }

    fn params(&self) -> &[ParamInfo] {
        &self.descriptor.params
    }

    fn activate(&mut self, sample_rate: u32, max_block: usize) -> Result<(), PluginError> {
        let block = u32::try_from(max_block).unwrap_or(u32::MAX);
        if block > self.ring.layout().frames {
            return Err(PluginError::Instantiation(format!(
                "block of {max_block} frames exceeds the bridge capacity of {}",
                self.ring.layout().frames
            )));
        }
        match self.request(BridgeCommand::Activate {
            sample_rate,
            max_block: block,
        })? {
            BridgeEvent::Activated { latency } => {
                self.remote_latency = latency;
                self.block = block;
                self.in_flight = None;
                self.active = true;
                Ok(())
            }
            other => Err(BridgeError::Protocol(format!("activate answered with {other:?}")).into()),
        }
    }

    fn deactivate(&mut self) -> Result<(), PluginError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.in_flight = None;
        match self.request(BridgeCommand::Deactivate)? {
            BridgeEvent::Deactivated => Ok(()),
            other => Err(BridgeError::Protocol(format!("deactivate answered with {other:?}")).into()),
        }
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
        if self.ring.status() != RingStatus::Running {
            return Err(PluginError::Crashed);
        }
        audio_out.clear();
        if let Some(previous) = self.in_flight.take() {
            if !self.ring.read_output(previous, audio_out, midi_out, nframes) {
                self.late_blocks += 1;
            }
        }
        self.in_flight = Some(self.ring.publish_input(audio_in, midi_in, nframes));
        Ok(())
    }

    fn set_param(&mut self, index: usize, value: f32) {
        if let (Some(slot), Some(info)) = (self.values.get_mut(index), self.descriptor.params.get(index)) {
            *slot = info.range.snap(value, info.flags);
            self.ring.set_param(index, *slot);
        }
    }

    fn param(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }

    fn save_state(&mut self) -> Result<Vec<u8>, PluginError> {
        match self.request(BridgeCommand::SaveState)? {
            BridgeEvent::State { blob } => Ok(blob),
            BridgeEvent::Unsavable => Err(PluginError::Unsavable),
            other => Err(BridgeError::Protocol(format!("save answered with {other:?}")).into()),
        }
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<(), PluginError> {
        let reply = self.request(BridgeCommand::RestoreState {
            blob: blob.to_vec(),
        });
        match reply {
            Ok(BridgeEvent::Restored { params }) => {
                for (index, value) in params.into_iter().enumerate() {
                    self.set_param(index, value);
                }
                Ok(())
            }
            Ok(other) => Err(BridgeError::Protocol(format!("restore answered with {other:?}")).into()),
            Err(PluginError::Bridge(BridgeError::Remote(message))) => Err(PluginError::State(message)),
            Err(err) => Err(err),
        }
    }

    fn latency_samples(&self) -> u32 {
        self.remote_latency + self.block
    }
}

impl Drop for BridgedAdapter {
    fn drop(&mut self) {
        self.ring.set_status(RingStatus::Closed);
        if let Err(err) = self.broker.shutdown() {
            tracing::debug!(%err, "bridged plugin shutdown failed");
        }
    }
}
