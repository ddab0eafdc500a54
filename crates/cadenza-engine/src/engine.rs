//! The real-time side of a session.
//!
//! [`Engine::process_cycle`] is the body of the audio callback. It reads the
//! published [`EngineState`], applies queued parameter events and automation
//! at cycle start, drives the graph pool once per transport segment, copies
//! the master output into the device buffer, and hands armed input to the
//! recording rings. It never blocks: if the control domain holds the core
//! the block is silenced and counted as an xrun.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadenza_graph::{
    CompiledGraph, CycleOutcome, CycleParams, GraphThreadPool, MidiBuffer, MidiEvent, MidiMessage, PoolConfig,
};
use cadenza_rt::{
    timed_event_queue, AudioMetrics, AudioMetricsCollector, AudioRenderer, CallbackHandle, InterleavedAudioBuffer,
    SnapshotCell, TimedEventReader, TimedEventWriter,
};
use parking_lot::Mutex;
use tracing::info;

use crate::automation::AutomationMode;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::ParamAddress;
use crate::processors::io::MasterOutNode;
use crate::recording::{AutomationSample, CaptureWriter};
use crate::runtime::{AutomationSnapshot, ParamTable};
use crate::transport::{CyclePlan, Transport, TransportShared, TransportState};

/// Pending MIDI input between callbacks.
const MIDI_INPUT_CAPACITY: usize = 1024;

/// A parameter write scheduled for the cycle containing its frame. `value`
/// is in the parameter's own range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamEvent {
    pub address: ParamAddress,
    pub value: f32,
}

/// Everything the audio thread reads for one cycle, replaced as a whole.
#[derive(Default)]
pub struct EngineState {
    pub graph: Option<Arc<CompiledGraph>>,
    pub params: ParamTable,
    pub automation: AutomationSnapshot,
    /// Whether any track records input.
    pub any_armed: bool,
}

struct AudioCore {
    pool: GraphThreadPool,
    params: TimedEventReader<ParamEvent>,
    capture: CaptureWriter,
    midi_in: MidiBuffer,
}

pub struct Engine {
    config: EngineConfig,
    state: SnapshotCell<EngineState>,
    core: Mutex<AudioCore>,
    params: TimedEventWriter<ParamEvent>,
    metrics: AudioMetricsCollector,
    transport: Arc<TransportShared>,
    frame: AtomicU64,
}

impl Engine {
    /// Starts the graph workers. `capture` receives armed input while the
    /// transport records.
    pub fn new(config: EngineConfig, transport: &Transport, capture: CaptureWriter) -> Result<Self, EngineError> {
        let metrics = AudioMetricsCollector::new(256);
        let pool = GraphThreadPool::new(
            PoolConfig {
                workers: config.worker_threads,
                rt_priority: config.realtime_priority.then_some(config.rt_priority_level),
                ..PoolConfig::default()
            },
            metrics.clone(),
        )?;
        let (writer, reader) = timed_event_queue(config.param_queue_capacity);
        info!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            workers = pool.worker_count(),
            "engine created"
        );
        Ok(Self {
            state: SnapshotCell::new(EngineState::default()),
            core: Mutex::new(AudioCore {
                pool,
                params: reader,
                capture,
                midi_in: MidiBuffer::with_capacity(MIDI_INPUT_CAPACITY),
            }),
            params: writer,
            metrics,
            transport: Arc::clone(transport.shared()),
            frame: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replaces the state the audio thread reads and returns the previous
    /// one. The caller keeps it alive until the audio thread has let go.
    pub fn publish(&self, state: EngineState) -> Arc<EngineState> {
        self.state.publish(Arc::new(state))
    }

    pub fn state(&self) -> Arc<EngineState> {
        self.state.load_full()
    }

    pub fn metrics(&self) -> AudioMetrics {
        self.metrics.snapshot()
    }

    pub fn metrics_collector(&self) -> &AudioMetricsCollector {
        &self.metrics
    }

    /// Frames processed since the engine started.
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Schedules a parameter write for the next cycle.
    pub fn queue_param(&self, address: ParamAddress, value: f32) -> Result<(), EngineError> {
        self.queue_param_at(self.frame(), address, value)
    }

    /// Schedules a parameter write at engine frame `frame`. It is applied at
    /// the start of the cycle containing that frame.
    pub fn queue_param_at(&self, frame: u64, address: ParamAddress, value: f32) -> Result<(), EngineError> {
        self.params
            .push(frame, ParamEvent { address, value })
            .map_err(|_| EngineError::QueueFull)
    }

    pub fn dropped_param_events(&self) -> u64 {
        self.params.dropped()
    }

    /// A handle for backends.
    pub fn callback_handle(self: &Arc<Self>) -> CallbackHandle {
        CallbackHandle::new(Box::new(EngineRenderer {
            engine: Arc::clone(self),
        }))
        .with_metrics(self.metrics.clone())
    }

    /// Renders `nframes` of interleaved output with no device input.
    pub fn process_cycle(&self, output: &mut [f32], nframes: usize) {
        self.process_with_input(&[], output, nframes);
    }

    /// Renders `nframes` of interleaved output. `inputs` is interleaved with
    /// the configured input channel count; a short slice reads as silence.
    pub fn process_with_input(&self, inputs: &[f32], output: &mut [f32], nframes: usize) {
        let channels = self.config.output_channels.max(1);
        let nframes = nframes.min(output.len() / channels);
        let Some(mut core) = self.core.try_lock() else {
            output.fill(0.0);
            self.metrics.register_xrun();
            return;
        };
        let block = self.config.block_size.max(1);
        let mut done = 0;
        let mut missed = false;
        while done < nframes {
            let chunk = block.min(nframes - done);
            let range = done * channels..(done + chunk) * channels;
            missed = self.render_chunk(&mut core, inputs, done, &mut output[range], chunk, missed);
            done += chunk;
        }
        if missed {
            // Chunks rendered before the miss are dropped too.
            output[..nframes * channels].fill(0.0);
        }
    }

    /// Renders one block. Once `missed` is set the graph is skipped but time
    /// still advances. Returns whether this or an earlier chunk missed its
    /// deadline.
    fn render_chunk(
        &self,
        core: &mut AudioCore,
        inputs: &[f32],
        input_offset: usize,
        output: &mut [f32],
        nframes: usize,
        missed: bool,
    ) -> bool {
        let started = Instant::now();
        let channels = self.config.output_channels.max(1);
        let state = self.state.load();
        let plan = self.transport.plan_cycle(nframes);
        let frame = self.frame.load(Ordering::Acquire);

        let params = &state.params;
        core.params.drain_until(frame + nframes as u64, |event| {
            if let Some(cell) = params.get(&event.payload.address) {
                cell.set(event.payload.value);
            }
        });
        self.apply_automation(core, &state.automation, &plan);

        output.fill(0.0);
        let graph = match state.graph.as_ref() {
            Some(graph) if !missed => graph,
            _ => {
                core.midi_in.clear();
                self.finish_chunk(frame, nframes, started);
                return missed;
            }
        };

        let input_channels = self.config.input_channels;
        let midi_in = &mut core.midi_in;
        graph.with_device_buffers(|device| {
            device.clear();
            for (channel, buffer) in device.audio_in.iter_mut().enumerate().take(input_channels) {
                for (index, sample) in buffer.iter_mut().take(nframes).enumerate() {
                    let at = (input_offset + index) * input_channels + channel;
                    *sample = inputs.get(at).copied().unwrap_or(0.0);
                }
            }
            for event in midi_in.iter() {
                device.midi_in.push(MidiEvent {
                    frame: event.frame.min(nframes.saturating_sub(1) as u32),
                    message: event.message,
                });
            }
        });
        midi_in.clear();

        let budget = Duration::from_secs_f64(
            nframes as f64 / f64::from(self.config.sample_rate.max(1)) * self.config.deadline_factor,
        );
        let deadline = started + budget;
        let capturing = plan.state == TransportState::Recording && state.any_armed;
        let (window_start, window_end) = self.transport.capture_window();
        for (index, segment) in plan.segments.iter().enumerate() {
            let params = CycleParams {
                local_offset: segment.offset,
                nframes: segment.frames,
                engine_frame: frame + segment.offset as u64,
                transport: plan.view(segment),
            };
            match core.pool.run_cycle(graph, params, deadline) {
                CycleOutcome::Completed => {}
                CycleOutcome::TimedOut | CycleOutcome::Busy => {
                    self.metrics.register_xrun();
                    self.finish_chunk(frame, nframes, started);
                    return true;
                }
            }
            graph.with_terminal_ports(|ports| {
                let (Some(left), Some(right)) = (ports.get(MasterOutNode::OUT_L), ports.get(MasterOutNode::OUT_R))
                else {
                    return;
                };
                let range = segment.offset..segment.offset + segment.frames;
                let sources = [&left.samples()[range.clone()], &right.samples()[range]];
                for (index, frame_out) in output[segment.offset * channels..(segment.offset + segment.frames) * channels]
                    .chunks_exact_mut(channels)
                    .enumerate()
                {
                    for (channel, sample) in frame_out.iter_mut().enumerate() {
                        *sample = sources[channel.min(1)][index];
                    }
                }
            });

            if !capturing {
                continue;
            }
            let start = segment.playhead.max(window_start);
            let end = (segment.playhead + segment.frames as u64).min(window_end);
            if start >= end {
                continue;
            }
            let local = (start - segment.playhead) as usize + segment.offset;
            let pass = plan.loop_pass - wraps_after(&plan, index);
            let capture = &mut core.capture;
            graph.with_device_buffers(|device| {
                capture.write(start, pass, &device.audio_in, &device.midi_in, local..local + (end - start) as usize);
            });
        }
        self.finish_chunk(frame, nframes, started);
        false
    }

    /// Drives automated parameters from their lanes while rolling and samples
    /// the ones being written while recording.
    fn apply_automation(&self, core: &mut AudioCore, automation: &AutomationSnapshot, plan: &CyclePlan) {
        if !plan.state.is_rolling() {
            return;
        }
        let Some(first) = plan.segments.first() else { return };
        let recording = plan.state == TransportState::Recording;
        for lane in &automation.lanes {
            if recording && lane.track.mode != AutomationMode::Read {
                core.capture.write_automation(AutomationSample {
                    target: lane.target,
                    position: first.playhead,
                    value: lane.cell.get_normalized(),
                });
            }
            if lane.is_writing() {
                continue;
            }
            if let Some(value) = lane.track.value_at(first.playhead) {
                lane.cell.set_normalized(value);
            }
        }
    }

    fn finish_chunk(&self, frame: u64, nframes: usize, started: Instant) {
        self.metrics.record_cycle(nframes, started.elapsed());
        self.frame.store(frame + nframes as u64, Ordering::Release);
    }

    /// Queues raw MIDI input for the next cycle. Called from the backend
    /// thread only.
    pub fn midi_in(&self, frame: u32, bytes: &[u8]) {
        let Some(message) = MidiMessage::from_bytes(bytes) else { return };
        if let Some(mut core) = self.core.try_lock() {
            core.midi_in.push(MidiEvent { frame, message });
        }
    }
}

/// Loop wraps between segment `index` and the end of the cycle.
fn wraps_after(plan: &CyclePlan, index: usize) -> u64 {
    plan.segments
        .windows(2)
        .skip(index)
        .filter(|pair| pair[1].playhead != pair[0].playhead + pair[0].frames as u64)
        .count() as u64
        + plan.trailing_wraps
}

struct EngineRenderer {
    engine: Arc<Engine>,
}

impl AudioRenderer for EngineRenderer {
    fn render(&mut self, buffer: &mut InterleavedAudioBuffer<'_>) {
        let frames = buffer.frames;
        if buffer.channels != self.engine.config.output_channels {
            buffer.silence();
            self.engine.metrics.register_xrun();
            return;
        }
        self.engine.process_with_input(buffer.inputs, buffer.outputs, frames);
    }

    fn midi_in(&mut self, frame: u32, bytes: &[u8]) {
        self.engine.midi_in(frame, bytes);
    }
}
