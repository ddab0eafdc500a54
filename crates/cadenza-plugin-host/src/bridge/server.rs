//! Sandbox side of the bridge.

use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadenza_graph::MidiBuffer;
use parking_lot::Mutex;

use crate::adapter::PluginAdapter;
use crate::audio::AudioBus;
use crate::bridge::ipc::{
    BridgeCommand, BridgeEvent, BridgeReply, BridgeRequest, IpcTransport, BRIDGE_PROTOCOL,
};
use crate::bridge::ring::{RingStatus, SharedRing};
use crate::descriptor::PluginFormat;
use crate::error::{BridgeError, PluginError};
use crate::native::{NativeAdapter, NativeRegistry};

const IDLE_SPINS: u32 = 64;
const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Answers bridge requests until `Shutdown` or until the host hangs up.
pub fn serve<R, W>(reader: R, writer: W, registry: Arc<NativeRegistry>) -> Result<(), BridgeError>
where
    R: Read,
    W: Write,
{
    let transport = IpcTransport::new(reader, writer);
    let mut session: Option<SandboxSession> = None;
    loop {
        let request: BridgeRequest = match transport.recv() {
            Ok(request) => request,
            Err(BridgeError::Disconnected) => break,
            Err(err) => {
                if let Some(session) = session.take() {
                    session.stop();
                }
                return Err(err);
            }
        };
        let stop = matches!(request.command, BridgeCommand::Shutdown);
        let event = handle(request.command, &registry, &mut session);
        transport.send(&BridgeReply {
            id: request.id,
            event,
        })?;
        if stop {
            break;
        }
    }
    if let Some(session) = session.take() {
        session.stop();
    }
    Ok(())
}

fn handle(
    command: BridgeCommand,
    registry: &NativeRegistry,
    session: &mut Option<SandboxSession>,
) -> BridgeEvent {
    let result = match command {
        BridgeCommand::Hello { protocol } if protocol == BRIDGE_PROTOCOL => {
            Ok(BridgeEvent::Ready {
                protocol: BRIDGE_PROTOCOL,
            })
        }
        BridgeCommand::Hello { protocol } => Err(format!(
            "host speaks protocol {protocol}, sandbox speaks {BRIDGE_PROTOCOL}"
        )),
        BridgeCommand::Load { descriptor, ring } => {
            if let Some(previous) = session.take() {
                previous.stop();
            }
            let descriptor = descriptor.with_format(PluginFormat::Native);
            NativeAdapter::load(registry, &descriptor)
                .map_err(|err| err.to_string())
                .and_then(|adapter| {
                    let ring = SharedRing::open(&ring).map_err(|err| err.to_string())?;
                    let layout = ring.layout();
                    if layout.inputs != u32::from(descriptor.audio_inputs)
                        || layout.outputs != u32::from(descriptor.audio_outputs)
                        || layout.params as usize != descriptor.params.len()
                    {
                        return Err("ring layout does not match the plugin".to_string());
                    }
                    let latency = adapter.latency_samples();
                    tracing::info!(uri = %descriptor.uri, "sandbox loaded plugin");
                    *session = Some(SandboxSession::new(adapter, ring));
                    Ok(BridgeEvent::Loaded { latency })
                })
        }
        BridgeCommand::Activate {
            sample_rate,
            max_block,
        } => with_session(session, |session| session.activate(sample_rate, max_block)),
        BridgeCommand::Deactivate => with_session(session, |session| {
            session.halt();
            session.adapter.lock().deactivate()?;
            Ok(BridgeEvent::Deactivated)
        }),
        BridgeCommand::SaveState => with_session(session, |session| {
            match session.adapter.lock().save_state() {
                Ok(blob) => Ok(BridgeEvent::State { blob }),
                Err(PluginError::Unsavable) => Ok(BridgeEvent::Unsavable),
                Err(err) => Err(err),
            }
        }),
        BridgeCommand::RestoreState { blob } => with_session(session, |session| {
            let mut adapter = session.adapter.lock();
            adapter.restore_state(&blob)?;
            let params = (0..adapter.params().len())
                .filter_map(|index| adapter.param(index))
                .collect();
            Ok(BridgeEvent::Restored { params })
        }),
        BridgeCommand::Shutdown => Ok(BridgeEvent::Bye),
    };
    result.unwrap_or_else(|message| {
        tracing::warn!(%message, "sandbox request failed");
        BridgeEvent::Failed { message }
    })
}

fn with_session<F>(session: &mut Option<SandboxSession>, f: F) -> Result<BridgeEvent, String>
where
    F: FnOnce(&mut SandboxSession) -> Result<BridgeEvent, PluginError>,
{
    match session.as_mut() {
        Some(session) => f(session).map_err(|err| err.to_string()),
        None => Err("no plugin loaded".to_string()),
    }
}

struct SandboxSession {
    adapter: Arc<Mutex<NativeAdapter>>,
    ring: Arc<SharedRing>,
    running: Arc<AtomicBool>,
    audio: Option<JoinHandle<()>>,
}

impl SandboxSession {
    fn new(adapter: NativeAdapter, ring: SharedRing) -> Self {
        Self {
            adapter: Arc::new(Mutex::new(adapter)),
            ring: Arc::new(ring),
            running: Arc::new(AtomicBool::new(false)),
            audio: None,
        }
    }

    fn activate(&mut self, sample_rate: u32, max_block: u32) -> Result<BridgeEvent, PluginError> {
        let layout = self.ring.layout();
        if max_block > layout.frames {
            return Err(PluginError::Instantiation(format!(
                "block of {max_block} frames exceeds the ring ({} frames)",
                layout.frames
            )));
        }
        let latency = {
            let mut adapter = self.adapter.lock();
            adapter.activate(sample_rate, max_block as usize)?;
            adapter.latency_samples()
        };
        if self.audio.is_none() {
            self.running.store(true, Ordering::Release);
            let adapter = Arc::clone(&self.adapter);
            let ring = Arc::clone(&self.ring);
            let running = Arc::clone(&self.running);
            let handle = thread::Builder::new()
                .name("cadenza-sandbox-audio".into())
                .spawn(move || audio_loop(adapter, ring, running))
                .map_err(|err| PluginError::Instantiation(err.to_string()))?;
            self.audio = Some(handle);
        }
        Ok(BridgeEvent::Activated { latency })
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.audio.take() {
            if handle.join().is_err() {
                tracing::error!("sandbox audio thread panicked");
            }
        }
    }

    fn stop(mut self) {
        self.halt();
        let _ = self.adapter.lock().deactivate();
    }
}

fn audio_loop(adapter: Arc<Mutex<NativeAdapter>>, ring: Arc<SharedRing>, running: Arc<AtomicBool>) {
    let layout = ring.layout();
    let frames = layout.frames as usize;
    let mut audio_in = AudioBus::new(layout.inputs as usize, frames);
    let mut audio_out = AudioBus::new(layout.outputs as usize, frames);
    let capacity = layout.midi_capacity as usize;
    let mut midi_in = MidiBuffer::with_capacity(capacity);
    let mut midi_out = MidiBuffer::with_capacity(capacity);
    let mut params = vec![f32::NAN; layout.params as usize];
    let mut last = ring.input_generation();
    let mut idle = 0u32;

    while running.load(Ordering::Acquire) {
        let generation = ring.input_generation();
        if generation == last {
            idle += 1;
            if idle < IDLE_SPINS {
                std::hint::spin_loop();
            } else {
                thread::sleep(IDLE_SLEEP);
            }
            continue;
        }
        idle = 0;
        last = generation;
        let Some(nframes) = ring.read_input(generation, &mut audio_in, &mut midi_in) else {
            continue;
        };
        audio_out.clear();
        midi_out.clear();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut adapter = adapter.lock();
            for (index, previous) in params.iter_mut().enumerate() {
                if let Some(value) = ring.param(index) {
                    if value.to_bits() != previous.to_bits() {
                        adapter.set_param(index, value);
                        *previous = value;
                    }
                }
            }
            adapter.process(&audio_in, &midi_in, &mut audio_out, &mut midi_out, nframes)
        }));
        match outcome {
            Ok(Ok(())) => ring.write_output(generation, &audio_out, &midi_out, nframes),
            Ok(Err(err)) => {
                tracing::error!(%err, "plugin failed in sandbox");
                ring.set_status(RingStatus::Crashed);
                break;
            }
            Err(_) => {
                tracing::error!("plugin panicked in sandbox");
                ring.set_status(RingStatus::Crashed);
                break;
            }
        }
    }
}
