//! Translation of the project document into a processing graph.
//!
//! [`GraphPlan::build`] derives every node and connection from the project:
//! the implicit channel wiring (track processor, plugin chain, fader, direct
//! output, sends) followed by the user's explicit port connections. The plan
//! is pure data, so the control domain can validate an edit before any
//! processable exists. [`GraphPlan::instantiate`] then pairs the plan with the
//! live [`Runtime`] objects and yields a [`GraphBuilder`] ready to compile.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use cadenza_graph::{
    GraphBuilder, GraphError, NodeKey, PortConnection, PortDirection, PortId, PortKind, PortLookup,
    PortSpec, Processable,
};
use cadenza_plugin_host::{PluginNode, PluginPorts};

use crate::ids::{PluginId, SendId, TrackId};
use crate::model::{ProjectState, SendTarget, Track, TrackKind};
use crate::processors::{
    fader, macro_node, send, track, DeviceInputNode, FaderNode, MacroNode, MasterOutNode, SendNode,
    TrackProcessor,
};
use crate::runtime::Runtime;

/// Project object a graph node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    TrackProcessor(TrackId),
    Fader(TrackId),
    Send(SendId),
    Plugin(PluginId),
    Macro(TrackId, u8),
    DeviceInput,
    MasterOut,
}

impl NodeRef {
    pub fn key(self) -> NodeKey {
        let (tag, a, b): (u64, u32, u8) = match self {
            NodeRef::TrackProcessor(id) => (1, id.0, 0),
            NodeRef::Fader(id) => (2, id.0, 0),
            NodeRef::Send(id) => (3, id.0, 0),
            NodeRef::Plugin(id) => (4, id.0, 0),
            NodeRef::Macro(id, index) => (5, id.0, index),
            NodeRef::DeviceInput => (6, 0, 0),
            NodeRef::MasterOut => (7, 0, 0),
        };
        NodeKey(tag << 56 | u64::from(a) << 24 | u64::from(b))
    }

    pub fn from_key(key: NodeKey) -> Option<Self> {
        let tag = key.0 >> 56;
        let a = ((key.0 >> 24) & 0xffff_ffff) as u32;
        let b = (key.0 & 0xff) as u8;
        let node = match tag {
            1 => NodeRef::TrackProcessor(TrackId(a)),
            2 => NodeRef::Fader(TrackId(a)),
            3 => NodeRef::Send(SendId(a)),
            4 => NodeRef::Plugin(PluginId(a)),
            5 => NodeRef::Macro(TrackId(a), b),
            6 => NodeRef::DeviceInput,
            7 => NodeRef::MasterOut,
            _ => return None,
        };
        (node.key() == key).then_some(node)
    }

    pub fn port(self, index: usize) -> PortId {
        PortId::new(self.key(), index as u16)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::TrackProcessor(id) => write!(f, "{id} processor"),
            NodeRef::Fader(id) => write!(f, "{id} fader"),
            NodeRef::Send(id) => write!(f, "{id}"),
            NodeRef::Plugin(id) => write!(f, "{id}"),
            NodeRef::Macro(id, index) => write!(f, "{id} macro {}", index + 1),
            NodeRef::DeviceInput => f.write_str("device input"),
            NodeRef::MasterOut => f.write_str("master out"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub node: NodeRef,
    pub name: String,
    pub specs: Vec<PortSpec>,
}

/// Validated node and connection layout of a project.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    nodes: Vec<PlannedNode>,
    index: HashMap<NodeKey, usize>,
    /// Implicit wiring first, then user connections in creation order.
    connections: Vec<PortConnection>,
    implicit: usize,
    order: Vec<NodeKey>,
}

/// Audio and MIDI ports currently carrying a channel's signal while the
/// strip is wired up.
struct Chain {
    left: PortId,
    right: PortId,
    midi: Option<PortId>,
}

impl GraphPlan {
    pub fn build(project: &ProjectState) -> Result<Self, GraphError> {
        let master = project.master_id().ok_or(GraphError::NoTerminal)?;
        let mut plan = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            connections: Vec::new(),
            implicit: 0,
            order: Vec::new(),
        };
        plan.add(NodeRef::DeviceInput, "device input", DeviceInputNode::port_specs())?;
        plan.add(NodeRef::MasterOut, "master out", MasterOutNode::port_specs())?;

        for track in &project.tracks {
            plan.add_track(track)?;
        }
        for track in &project.tracks {
            plan.wire_track(project, track, master)?;
        }
        plan.implicit = plan.connections.len();

        for connection in project.connections.iter() {
            plan.check_ports(connection)?;
            plan.connections.push(*connection);
        }
        plan.order = plan.topological_order()?;
        Ok(plan)
    }

    fn add(&mut self, node: NodeRef, name: impl Into<String>, specs: Vec<PortSpec>) -> Result<(), GraphError> {
        let key = node.key();
        if self.index.contains_key(&key) {
            return Err(GraphError::DuplicateNode(key));
        }
        self.index.insert(key, self.nodes.len());
        self.nodes.push(PlannedNode {
            node,
            name: name.into(),
            specs,
        });
        Ok(())
    }

    fn add_track(&mut self, track: &Track) -> Result<(), GraphError> {
        if track.kind == TrackKind::Modulator {
            for index in 0..track.macros.len() {
                let node = NodeRef::Macro(track.id, index as u8);
                self.add(node, format!("{} macro {}", track.name, index + 1), MacroNode::port_specs())?;
            }
        }
        let Some(channel) = track.channel() else { return Ok(()) };
        self.add(NodeRef::TrackProcessor(track.id), track.name.clone(), TrackProcessor::port_specs())?;
        for (_, _, slot) in channel.plugins() {
            let name = format!("{}: {}", track.name, slot.descriptor.name);
            self.add(NodeRef::Plugin(slot.id), name, PluginPorts::specs(&slot.descriptor))?;
        }
        for send in &channel.sends {
            self.add(NodeRef::Send(send.id), format!("{} {}", track.name, send.id), SendNode::port_specs())?;
        }
        self.add(NodeRef::Fader(track.id), format!("{} fader", track.name), FaderNode::port_specs())
    }

    fn link(&mut self, source: PortId, dest: PortId) {
        self.connections.push(PortConnection::new(source, dest));
    }

    fn wire_track(&mut self, project: &ProjectState, track: &Track, master: TrackId) -> Result<(), GraphError> {
        let Some(channel) = track.channel() else { return Ok(()) };
        let head = NodeRef::TrackProcessor(track.id);
        if track.kind.can_record() {
            let input = NodeRef::DeviceInput;
            self.link(input.port(DeviceInputNode::OUT_L), head.port(track::IN_L));
            self.link(input.port(DeviceInputNode::OUT_R), head.port(track::IN_R));
            self.link(input.port(DeviceInputNode::MIDI_OUT), head.port(track::MIDI_IN));
        }

        let mut chain = Chain {
            left: head.port(track::OUT_L),
            right: head.port(track::OUT_R),
            midi: Some(head.port(track::MIDI_OUT)),
        };
        for (_, _, slot) in channel.plugins() {
            let node = NodeRef::Plugin(slot.id);
            let ports = PluginPorts::of(&slot.descriptor);
            if let Some(first) = ports.audio_in.clone().next() {
                self.link(chain.left, node.port(first));
                if let Some(second) = ports.audio_in.clone().nth(1) {
                    self.link(chain.right, node.port(second));
                }
            }
            if let (Some(midi_in), Some(source)) = (ports.midi_in, chain.midi) {
                self.link(source, node.port(midi_in));
            }
            if let Some(first) = ports.audio_out.clone().next() {
                let second = ports.audio_out.clone().nth(1).unwrap_or(first);
                chain.left = node.port(first);
                chain.right = node.port(second);
            }
            if ports.midi_in.is_some() {
                // MIDI effects replace the stream, instruments consume it.
                chain.midi = ports.midi_out.map(|port| node.port(port));
            }
        }

        let strip = NodeRef::Fader(track.id);
        self.link(chain.left, strip.port(fader::IN_L));
        self.link(chain.right, strip.port(fader::IN_R));
        if let Some(midi) = chain.midi {
            self.link(midi, strip.port(fader::MIDI_IN));
        }

        if track.id == master {
            self.link(strip.port(fader::POST_L), NodeRef::MasterOut.port(MasterOutNode::IN_L));
            self.link(strip.port(fader::POST_R), NodeRef::MasterOut.port(MasterOutNode::IN_R));
        } else if let Some(target) = channel.direct_out {
            let dest = NodeRef::TrackProcessor(target);
            self.require(dest)?;
            self.link(strip.port(fader::POST_L), dest.port(track::IN_L));
            self.link(strip.port(fader::POST_R), dest.port(track::IN_R));
            self.link(strip.port(fader::MIDI_OUT), dest.port(track::MIDI_IN));
        }

        for send_cfg in &channel.sends {
            let node = NodeRef::Send(send_cfg.id);
            let (left, right) = if send_cfg.pre_fader {
                (fader::PRE_L, fader::PRE_R)
            } else {
                (fader::POST_L, fader::POST_R)
            };
            self.link(strip.port(left), node.port(send::IN_L));
            self.link(strip.port(right), node.port(send::IN_R));
            let (dest_l, dest_r) = match send_cfg.target {
                SendTarget::Track(target) => {
                    let dest = NodeRef::TrackProcessor(target);
                    self.require(dest)?;
                    (dest.port(track::IN_L), dest.port(track::IN_R))
                }
                SendTarget::Sidechain { plugin, first_input } => {
                    let dest = NodeRef::Plugin(plugin);
                    self.require(dest)?;
                    let slot = project.plugin(plugin).ok_or(GraphError::MissingNode(dest.key()))?;
                    let ports = PluginPorts::of(&slot.descriptor);
                    let first = ports.audio_in.start + usize::from(first_input);
                    if first + 2 > ports.audio_in.end {
                        return Err(GraphError::MissingPort(dest.port(first + 1)));
                    }
                    (dest.port(first), dest.port(first + 1))
                }
            };
            self.link(node.port(send::OUT_L), dest_l);
            self.link(node.port(send::OUT_R), dest_r);
        }
        Ok(())
    }

    fn require(&self, node: NodeRef) -> Result<(), GraphError> {
        if self.index.contains_key(&node.key()) {
            Ok(())
        } else {
            Err(GraphError::MissingNode(node.key()))
        }
    }

    pub fn nodes(&self) -> &[PlannedNode] {
        &self.nodes
    }

    pub fn node(&self, node: NodeRef) -> Option<&PlannedNode> {
        self.index.get(&node.key()).map(|index| &self.nodes[*index])
    }

    pub fn contains(&self, node: NodeRef) -> bool {
        self.index.contains_key(&node.key())
    }

    /// Every connection, implicit wiring first.
    pub fn connections(&self) -> &[PortConnection] {
        &self.connections
    }

    pub fn implicit_connections(&self) -> &[PortConnection] {
        &self.connections[..self.implicit]
    }

    pub fn is_implicit(&self, source: PortId, dest: PortId) -> bool {
        self.implicit_connections()
            .iter()
            .any(|c| c.source == source && c.dest == dest)
    }

    /// Topological execution order.
    pub fn order(&self) -> &[NodeKey] {
        &self.order
    }

    pub fn spec(&self, port: PortId) -> Option<&PortSpec> {
        let node = self.index.get(&port.node)?;
        self.nodes[*node].specs.get(usize::from(port.index))
    }

    fn check_ports(&self, connection: &PortConnection) -> Result<(), GraphError> {
        let source = self.spec(connection.source).ok_or(GraphError::MissingPort(connection.source))?;
        if !source.is_output() {
            return Err(GraphError::WrongDirection(connection.source));
        }
        let dest = self.spec(connection.dest).ok_or(GraphError::MissingPort(connection.dest))?;
        if !dest.is_input() {
            return Err(GraphError::WrongDirection(connection.dest));
        }
        if !source.kind.can_feed(dest.kind) {
            return Err(GraphError::IncompatibleKinds {
                from: source.kind,
                to: dest.kind,
            });
        }
        Ok(())
    }

    /// Checks a new user connection against the complete graph, implicit
    /// wiring included.
    pub fn check_connection(&self, connection: &PortConnection) -> Result<(), GraphError> {
        self.check_ports(connection)?;
        let PortConnection { source, dest, .. } = *connection;
        if self.connections.iter().any(|c| c.source == source && c.dest == dest) {
            return Err(GraphError::DuplicateConnection { from: source, to: dest });
        }
        if self.would_cycle(source.node, dest.node) {
            return Err(GraphError::WouldCycle { from: source, to: dest });
        }
        Ok(())
    }

    /// Whether an edge `from -> to` would close a cycle.
    pub fn would_cycle(&self, from: NodeKey, to: NodeKey) -> bool {
        if from == to {
            return true;
        }
        let adjacency = self.adjacency();
        let mut stack = vec![to];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == from {
                return true;
            }
            if seen.insert(node) {
                if let Some(next) = adjacency.get(&node) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        false
    }

    fn adjacency(&self) -> HashMap<NodeKey, Vec<NodeKey>> {
        let mut adjacency: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();
        for connection in &self.connections {
            adjacency
                .entry(connection.source.node)
                .or_default()
                .push(connection.dest.node);
        }
        adjacency
    }

    fn topological_order(&self) -> Result<Vec<NodeKey>, GraphError> {
        let count = self.nodes.len();
        let mut indegree = vec![0usize; count];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
        for connection in &self.connections {
            let from = self.index[&connection.source.node];
            let to = self.index[&connection.dest.node];
            if !successors[from].contains(&to) {
                successors[from].push(to);
                indegree[to] += 1;
            }
        }
        let mut queue: VecDeque<usize> = (0..count).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(index) = queue.pop_front() {
            order.push(self.nodes[index].node.key());
            for &next in &successors[index] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if order.len() != count {
            return Err(GraphError::Cycle(count - order.len()));
        }
        Ok(order)
    }

    /// Creates the processables for every planned node, binds their control
    /// inputs to the runtime cells and adds all connections.
    pub fn instantiate(&self, runtime: &Runtime) -> Result<GraphBuilder, GraphError> {
        let mut builder = GraphBuilder::new();
        for planned in &self.nodes {
            let key = planned.node.key();
            let missing = GraphError::MissingNode(key);
            let processable: Box<dyn Processable> = match planned.node {
                NodeRef::TrackProcessor(id) => {
                    let track = runtime.track(id).ok_or(missing)?;
                    Box::new(TrackProcessor::new(planned.name.clone(), Arc::clone(track)))
                }
                NodeRef::Fader(id) => {
                    let track = runtime.track(id).ok_or(missing)?;
                    builder.bind_control(PortId::new(key, fader::AMP as u16), track.amp.clone());
                    builder.bind_control(PortId::new(key, fader::BALANCE as u16), track.balance.clone());
                    builder.bind_control(PortId::new(key, fader::MUTE as u16), track.mute.clone());
                    Box::new(FaderNode::new(planned.name.clone(), Arc::clone(track)))
                }
                NodeRef::Send(id) => {
                    let send_rt = runtime.send(id).ok_or(missing)?;
                    builder.bind_control(PortId::new(key, send::AMOUNT as u16), send_rt.amount.clone());
                    Box::new(SendNode::new(planned.name.clone(), Arc::clone(send_rt)))
                }
                NodeRef::Plugin(id) => {
                    let instance = runtime.plugin(id).ok_or(missing)?;
                    let ports = PluginPorts::of(instance.descriptor());
                    for (slot, port) in ports.params.clone().enumerate() {
                        if let Some(cell) = instance.param_cell(slot) {
                            builder.bind_control(PortId::new(key, port as u16), cell.clone());
                        }
                    }
                    Box::new(PluginNode::new(planned.name.clone(), Arc::clone(instance)))
                }
                NodeRef::Macro(id, index) => {
                    let track = runtime.track(id).ok_or(missing)?;
                    let cell = track.macros.get(usize::from(index)).ok_or(GraphError::MissingNode(key))?;
                    builder.bind_control(PortId::new(key, macro_node::VALUE as u16), cell.clone());
                    Box::new(MacroNode::new(planned.name.clone()))
                }
                NodeRef::DeviceInput => Box::new(DeviceInputNode),
                NodeRef::MasterOut => Box::new(MasterOutNode),
            };
            builder.add_node(key, processable)?;
        }
        for connection in &self.connections {
            builder.connect(*connection)?;
        }
        builder.set_terminal(NodeRef::MasterOut.key());
        Ok(builder)
    }
}

impl PortLookup for GraphPlan {
    fn port_info(&self, port: PortId) -> Option<(PortKind, PortDirection)> {
        self.spec(port).map(|spec| (spec.kind, spec.direction))
    }
}
