use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::compiled::{CompiledGraph, CompiledNode, Source};
use crate::connection::{ConnectionSet, PortConnection};
use crate::error::GraphError;
use crate::midi::DEFAULT_MIDI_CAPACITY;
use crate::port::{ControlCell, NodeKey, Port, PortId, PortKind, PortSpec};
use crate::processable::Processable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Number of device capture channels exposed to input nodes.
    pub input_channels: usize,
    pub midi_capacity: usize,
}

impl GraphConfig {
    pub fn new(sample_rate: u32, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
            ..Self::default()
        }
    }

    pub fn with_input_channels(mut self, channels: usize) -> Self {
        self.input_channels = channels;
        self
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 512,
            input_channels: 2,
            midi_capacity: DEFAULT_MIDI_CAPACITY,
        }
    }
}

/// Identifies one rebuild request. A rebuild whose ticket has been
/// superseded by a newer request stops at the next checkpoint.
#[derive(Debug, Clone)]
pub struct RebuildTicket {
    generation: u64,
    latest: Arc<AtomicU64>,
}

impl RebuildTicket {
    /// Issues a ticket that supersedes every earlier one sharing `latest`.
    pub fn issue(latest: &Arc<AtomicU64>) -> Self {
        let generation = latest.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            generation,
            latest: Arc::clone(latest),
        }
    }

    /// A ticket nobody can supersede.
    pub fn detached() -> Self {
        Self::issue(&Arc::new(AtomicU64::new(0)))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_superseded(&self) -> bool {
        self.latest.load(Ordering::Acquire) != self.generation
    }

    fn checkpoint(&self) -> Result<(), GraphError> {
        if self.is_superseded() {
            Err(GraphError::Superseded)
        } else {
            Ok(())
        }
    }
}

struct NodeDecl {
    key: NodeKey,
    processable: Box<dyn Processable>,
    specs: Vec<PortSpec>,
}

/// Collects processables and connections and compiles them into an
/// executable graph.
pub struct GraphBuilder {
    nodes: Vec<NodeDecl>,
    index: HashMap<NodeKey, usize>,
    connections: Vec<PortConnection>,
    controls: HashMap<PortId, ControlCell>,
    terminal: Option<NodeKey>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            connections: Vec::new(),
            controls: HashMap::new(),
            terminal: None,
        }
    }

    pub fn add_node(
        &mut self,
        key: NodeKey,
        processable: Box<dyn Processable>,
    ) -> Result<(), GraphError> {
        if self.index.contains_key(&key) {
            return Err(GraphError::DuplicateNode(key));
        }
        let specs = processable.ports();
        self.index.insert(key, self.nodes.len());
        self.nodes.push(NodeDecl {
            key,
            processable,
            specs,
        });
        Ok(())
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.index.contains_key(&key)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn port_spec(&self, port: PortId) -> Option<&PortSpec> {
        let node = self.index.get(&port.node)?;
        self.nodes[*node].specs.get(usize::from(port.index))
    }

    /// Backs a control input with a cell owned by the control domain.
    pub fn bind_control(&mut self, port: PortId, cell: ControlCell) {
        self.controls.insert(port, cell);
    }

    pub fn connect(&mut self, connection: PortConnection) -> Result<(), GraphError> {
        let source = self
            .port_spec(connection.source)
            .ok_or(GraphError::MissingPort(connection.source))?;
        if !source.is_output() {
            return Err(GraphError::WrongDirection(connection.source));
        }
        let source_kind = source.kind;
        let dest = self
            .port_spec(connection.dest)
            .ok_or(GraphError::MissingPort(connection.dest))?;
        if !dest.is_input() {
            return Err(GraphError::WrongDirection(connection.dest));
        }
        if !source_kind.can_feed(dest.kind) {
            return Err(GraphError::IncompatibleKinds {
                from: source_kind,
                to: dest.kind,
            });
        }
        self.connections.push(connection);
        Ok(())
    }

    /// Adds every connection of `set` whose ports exist in this builder.
    /// Returns how many were skipped.
    pub fn connect_all(&mut self, set: &ConnectionSet) -> usize {
        let mut skipped = 0;
        for connection in set.iter() {
            if let Err(err) = self.connect(*connection) {
                tracing::debug!("skipping connection {:?}: {err}", connection);
                skipped += 1;
            }
        }
        skipped
    }

    pub fn set_terminal(&mut self, key: NodeKey) {
        self.terminal = Some(key);
    }

    /// Orders the nodes with Kahn's algorithm and allocates every port
    /// buffer. Fails on a residual cycle or when `ticket` is superseded.
    pub fn build(
        self,
        config: GraphConfig,
        ticket: &RebuildTicket,
    ) -> Result<CompiledGraph, GraphError> {
        ticket.checkpoint()?;
        let terminal_key = self.terminal.ok_or(GraphError::NoTerminal)?;
        let terminal = *self
            .index
            .get(&terminal_key)
            .ok_or(GraphError::MissingNode(terminal_key))?;

        let count = self.nodes.len();
        let mut sources: Vec<HashMap<u16, Vec<Source>>> = vec![HashMap::new(); count];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut indegree = vec![0u32; count];

        for connection in &self.connections {
            let from = self.index[&connection.source.node];
            let to = self.index[&connection.dest.node];
            sources[to]
                .entry(connection.dest.index)
                .or_default()
                .push(Source {
                    node: from,
                    port: usize::from(connection.source.index),
                    multiplier: connection.multiplier,
                    enabled: connection.enabled,
                });
            if !successors[from].contains(&to) {
                successors[from].push(to);
                indegree[to] += 1;
            }
        }

        ticket.checkpoint()?;

        let initial_pending = indegree.clone();
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| index)
            .collect();
        let roots: Vec<usize> = queue.iter().copied().collect();

        let mut order = Vec::with_capacity(count);
        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &next in &successors[index] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != count {
            let stuck = count - order.len();
            tracing::error!("graph rejected: {stuck} node(s) form a cycle");
            return Err(GraphError::Cycle(stuck));
        }

        ticket.checkpoint()?;

        let mut path_latency = vec![0u32; count];
        for &index in &order {
            let own = self.nodes[index].processable.latency_samples();
            let upstream = sources[index]
                .values()
                .flatten()
                .map(|source| path_latency[source.node])
                .max()
                .unwrap_or(0);
            path_latency[index] = upstream + own;
        }

        let mut nodes = Vec::with_capacity(count);
        for (index, decl) in self.nodes.into_iter().enumerate() {
            let NodeDecl {
                key,
                mut processable,
                specs,
            } = decl;
            processable.prepare(config.sample_rate, config.block_size);

            let ports: Vec<Port> = specs
                .into_iter()
                .enumerate()
                .map(|(port_index, spec)| {
                    let id = PortId::new(key, port_index as u16);
                    let mut port = Port::new(id, spec, config.block_size);
                    if port.spec.kind == PortKind::Control && port.spec.is_input() {
                        if let Some(cell) = self.controls.get(&id) {
                            port.set_control(cell.get());
                            port.cell = Some(cell.clone());
                        }
                    }
                    port
                })
                .collect();

            // Control inputs resolve before buffer inputs.
            let mut inputs: Vec<(usize, Vec<Source>)> = ports
                .iter()
                .enumerate()
                .filter(|(_, port)| port.spec.is_input())
                .map(|(port_index, _)| {
                    let feeding = sources[index]
                        .remove(&(port_index as u16))
                        .unwrap_or_default();
                    (port_index, feeding)
                })
                .collect();
            inputs.sort_by_key(|(port_index, _)| ports[*port_index].spec.kind != PortKind::Control);

            nodes.push(CompiledNode::new(
                key,
                processable,
                ports,
                inputs,
                std::mem::take(&mut successors[index]),
                initial_pending[index],
                path_latency[index],
            ));
        }

        ticket.checkpoint()?;

        tracing::debug!(
            nodes = count,
            connections = self.connections.len(),
            "compiled processing graph"
        );

        Ok(CompiledGraph::new(
            nodes,
            order,
            roots,
            terminal,
            config,
            self.connections.len(),
        ))
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}
