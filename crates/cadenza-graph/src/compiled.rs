//! Validated, executable form of the processing graph.
//!
//! A [`CompiledGraph`] is immutable in structure. Per-cycle state lives in
//! `UnsafeCell`s whose access is serialised by the dependency counters: a
//! node's state is touched only by the single thread that took it off the work
//! queue, and upstream buffers are read only after their producer has
//! released its completion with an `AcqRel` decrement.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use cadenza_rt::AudioMetricsCollector;

use crate::builder::GraphConfig;
use crate::error::ProcessError;
use crate::midi::MidiBuffer;
use crate::port::{NodeKey, Port, PortKind, PortValue};
use crate::processable::{NodeIo, ProcessContext, Processable, TransportView};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Source {
    pub node: usize,
    pub port: usize,
    pub multiplier: f32,
    pub enabled: bool,
}

/// Parameters of one pass over the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleParams {
    pub local_offset: usize,
    pub nframes: usize,
    pub engine_frame: u64,
    pub transport: TransportView,
}

/// Device capture data for the current block, written by the callback thread
/// before a pass starts.
#[derive(Debug, Clone)]
pub struct DeviceBuffers {
    pub audio_in: Vec<Vec<f32>>,
    pub midi_in: MidiBuffer,
}

impl DeviceBuffers {
    pub fn new(channels: usize, block_size: usize, midi_capacity: usize) -> Self {
        Self {
            audio_in: (0..channels).map(|_| vec![0.0; block_size]).collect(),
            midi_in: MidiBuffer::with_capacity(midi_capacity),
        }
    }

    pub fn clear(&mut self) {
        for channel in &mut self.audio_in {
            channel.fill(0.0);
        }
        self.midi_in.clear();
    }
}

struct NodeState {
    processable: Box<dyn Processable>,
    ports: Vec<Port>,
}

pub(crate) struct CompiledNode {
    key: NodeKey,
    name: String,
    state: UnsafeCell<NodeState>,
    /// Input port index and its sources in connection order, control inputs
    /// first.
    inputs: Vec<(usize, Vec<Source>)>,
    successors: Vec<usize>,
    initial_pending: u32,
    pending: AtomicU32,
    crashed: AtomicBool,
    latency: u32,
    path_latency: u32,
    processed: AtomicU64,
}

impl CompiledNode {
    pub(crate) fn new(
        key: NodeKey,
        processable: Box<dyn Processable>,
        ports: Vec<Port>,
        inputs: Vec<(usize, Vec<Source>)>,
        successors: Vec<usize>,
        initial_pending: u32,
        path_latency: u32,
    ) -> Self {
        let name = processable.name().to_owned();
        let latency = processable.latency_samples();
        Self {
            key,
            name,
            state: UnsafeCell::new(NodeState { processable, ports }),
            inputs,
            successors,
            initial_pending,
            pending: AtomicU32::new(initial_pending),
            crashed: AtomicBool::new(false),
            latency,
            path_latency,
            processed: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub key: NodeKey,
    pub name: String,
    pub latency: u32,
    pub path_latency: u32,
    pub crashed: bool,
    pub processed: u64,
}

/// Read-only description of a compiled graph for queries.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphInfo {
    pub nodes: Vec<NodeInfo>,
    /// Topological execution order.
    pub order: Vec<NodeKey>,
    pub terminal: NodeKey,
    pub connections: usize,
    pub total_latency: u32,
}

pub struct CompiledGraph {
    nodes: Vec<CompiledNode>,
    order: Vec<usize>,
    roots: Vec<usize>,
    terminal: usize,
    config: GraphConfig,
    connections: usize,
    cycle: UnsafeCell<CycleParams>,
    device: UnsafeCell<DeviceBuffers>,
    remaining: AtomicUsize,
    running: AtomicBool,
}

// Safety: see the module documentation. Every `UnsafeCell` is accessed either
// by the callback thread while `running` is false, or by the one worker that
// owns a node between its dispatch and its completion.
unsafe impl Sync for CompiledGraph {}

impl CompiledGraph {
    pub(crate) fn new(
        nodes: Vec<CompiledNode>,
        order: Vec<usize>,
        roots: Vec<usize>,
        terminal: usize,
        config: GraphConfig,
        connections: usize,
    ) -> Self {
        let device = DeviceBuffers::new(config.input_channels, config.block_size, config.midi_capacity);
        Self {
            nodes,
            order,
            roots,
            terminal,
            config,
            connections,
            cycle: UnsafeCell::new(CycleParams::default()),
            device: UnsafeCell::new(device),
            remaining: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> GraphConfig {
        self.config
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn roots(&self) -> &[usize] {
        &self.roots
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn execution_order(&self) -> Vec<NodeKey> {
        self.order.iter().map(|&i| self.nodes[i].key).collect()
    }

    pub fn terminal(&self) -> NodeKey {
        self.nodes[self.terminal].key
    }

    pub fn index_of(&self, key: NodeKey) -> Option<usize> {
        self.nodes.iter().position(|node| node.key == key)
    }

    pub fn is_crashed(&self, key: NodeKey) -> bool {
        self.index_of(key)
            .map(|i| self.nodes[i].crashed.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn crashed_nodes(&self) -> Vec<NodeKey> {
        self.nodes
            .iter()
            .filter(|node| node.crashed.load(Ordering::Acquire))
            .map(|node| node.key)
            .collect()
    }

    pub fn info(&self) -> GraphInfo {
        GraphInfo {
            nodes: self
                .nodes
                .iter()
                .map(|node| NodeInfo {
                    key: node.key,
                    name: node.name.clone(),
                    latency: node.latency,
                    path_latency: node.path_latency,
                    crashed: node.crashed.load(Ordering::Acquire),
                    processed: node.processed.load(Ordering::Relaxed),
                })
                .collect(),
            order: self.execution_order(),
            terminal: self.terminal(),
            connections: self.connections,
            total_latency: self.nodes[self.terminal].path_latency,
        }
    }

    /// Gives the callback thread mutable access to the device buffers. Returns
    /// `None` while a pass is in flight.
    pub fn with_device_buffers<R>(&self, f: impl FnOnce(&mut DeviceBuffers) -> R) -> Option<R> {
        if self.is_running() {
            return None;
        }
        // Safety: no pass is running, and only the callback thread starts passes.
        Some(f(unsafe { &mut *self.device.get() }))
    }

    /// Reads the ports of a node between passes.
    pub fn with_node_ports<R>(&self, key: NodeKey, f: impl FnOnce(&[Port]) -> R) -> Option<R> {
        if self.is_running() {
            return None;
        }
        let index = self.index_of(key)?;
        // Safety: no pass is running, so no thread holds the node state.
        let state = unsafe { &*self.nodes[index].state.get() };
        Some(f(&state.ports))
    }

    /// Reads the terminal node's ports between passes.
    pub fn with_terminal_ports<R>(&self, f: impl FnOnce(&[Port]) -> R) -> Option<R> {
        self.with_node_ports(self.terminal(), f)
    }

    /// Arms the graph for a pass. Returns false if the previous pass has not
    /// finished yet.
    pub(crate) fn begin_cycle(&self, params: CycleParams) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Safety: `running` was false, so no worker touches the cycle cell.
        unsafe {
            *self.cycle.get() = params;
        }
        for node in &self.nodes {
            node.pending.store(node.initial_pending, Ordering::Relaxed);
        }
        self.remaining.store(self.nodes.len(), Ordering::Release);
        if self.nodes.is_empty() {
            self.running.store(false, Ordering::Release);
        }
        true
    }

    /// Runs one pass on the calling thread in topological order.
    pub fn run_serial(&self, params: CycleParams, metrics: &AudioMetricsCollector) -> bool {
        if !self.begin_cycle(params) {
            return false;
        }
        for &index in &self.order {
            // Safety: serial execution in dependency order owns every node.
            unsafe { self.run_node(index, metrics) };
            self.complete_node(index, &mut |_| {});
        }
        true
    }

    /// Processes node `index` for the current pass.
    ///
    /// # Safety
    /// The caller must own the node for this pass: every predecessor has
    /// completed and no other thread runs the same node.
    pub(crate) unsafe fn run_node(&self, index: usize, metrics: &AudioMetricsCollector) {
        let node = &self.nodes[index];
        let params = *self.cycle.get();
        let device = &*self.device.get();
        let state = &mut *node.state.get();

        self.gather_inputs(node, &mut state.ports, &params);

        let ctx = ProcessContext {
            local_offset: params.local_offset,
            nframes: params.nframes,
            sample_rate: self.config.sample_rate,
            engine_frame: params.engine_frame,
            transport: params.transport,
            device,
        };
        let NodeState { processable, ports } = state;
        let mut io = NodeIo::new(ports, params.local_offset, params.nframes);
        io.silence_outputs();

        if node.crashed.load(Ordering::Relaxed) || processable.is_bypassed() {
            io.bypass();
        } else {
            let result = panic::catch_unwind(AssertUnwindSafe(|| processable.process(&ctx, &mut io)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(ProcessError::Skipped)) => {
                    io.silence_outputs();
                    io.bypass();
                }
                Ok(Err(ProcessError::Failed(_))) | Err(_) => {
                    node.crashed.store(true, Ordering::Release);
                    metrics.register_crash();
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| processable.on_crash()));
                    io.silence_outputs();
                    io.bypass();
                }
            }
        }
        node.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases the successors of `index`, handing any that became ready to
    /// `dispatch`. Returns true when this completion finished the pass.
    pub(crate) fn complete_node(&self, index: usize, dispatch: &mut dyn FnMut(usize)) -> bool {
        for &next in &self.nodes[index].successors {
            if self.nodes[next].pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                dispatch(next);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.running.store(false, Ordering::Release);
            return true;
        }
        false
    }

    /// Mixes upstream outputs into this node's inputs for the pass range.
    ///
    /// # Safety
    /// Same contract as [`CompiledGraph::run_node`].
    unsafe fn gather_inputs(&self, node: &CompiledNode, ports: &mut [Port], params: &CycleParams) {
        let offset = params.local_offset;
        let frames = params.nframes;
        let end = offset + frames;

        for (port_index, sources) in &node.inputs {
            let port = &mut ports[*port_index];
            match port.spec.kind {
                PortKind::Control => {
                    let base = match &port.cell {
                        Some(cell) => cell.get(),
                        None => port.control(),
                    };
                    let span = port.spec.range.span();
                    let mut modulation = 0.0;
                    for source in sources.iter().filter(|s| s.enabled) {
                        let upstream = self.source_port(source);
                        let value = match &upstream.value {
                            PortValue::Control(value) => *value,
                            PortValue::Cv(buf) => buf.get(offset).copied().unwrap_or(0.0),
                            _ => 0.0,
                        };
                        modulation += value * source.multiplier * span;
                    }
                    port.set_control(base + modulation);
                }
                PortKind::Audio | PortKind::Cv => {
                    port.clear_range(offset, frames);
                    let dst = port.samples_mut();
                    let end = end.min(dst.len());
                    for source in sources.iter().filter(|s| s.enabled) {
                        let src = self.source_port(source).samples();
                        let src_end = end.min(src.len());
                        if offset >= src_end {
                            continue;
                        }
                        for (out, sample) in dst[offset..src_end].iter_mut().zip(&src[offset..src_end]) {
                            *out += sample * source.multiplier;
                        }
                    }
                }
                PortKind::Midi => {
                    let Some(dst) = port.midi_mut() else { continue };
                    dst.clear_range(offset as u32, end as u32);
                    for source in sources.iter().filter(|s| s.enabled) {
                        if let Some(src) = self.source_port(source).midi() {
                            dst.merge_range(src, offset as u32, end as u32);
                        }
                    }
                }
            }
        }
    }

    /// # Safety
    /// The source node must have completed in the current pass.
    unsafe fn source_port(&self, source: &Source) -> &Port {
        let state = &*self.nodes[source.node].state.get();
        &state.ports[source.port]
    }
}
