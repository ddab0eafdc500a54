use std::any::Any;

use cadenza_graph::{GraphError, PortConnection, PortId};

use super::{Action, ActionContext, ActionOutcome, Effects};
use crate::error::{ActionError, PortError};
use crate::graph::{GraphPlan, NodeRef};
use crate::model::{ParamAddress, ProjectState};

fn plan(project: &ProjectState) -> Result<GraphPlan, ActionError> {
    GraphPlan::build(project).map_err(graph_error)
}

fn graph_error(err: GraphError) -> ActionError {
    match err {
        GraphError::WouldCycle { .. } | GraphError::Cycle(_) => ActionError::WouldCycle,
        other => ActionError::Port(PortError::Graph(other)),
    }
}

fn require_node(plan: &GraphPlan, port: PortId) -> Result<(), ActionError> {
    match NodeRef::from_key(port.node) {
        Some(node) if plan.contains(node) => Ok(()),
        _ => Err(PortError::UnknownNode(port.node).into()),
    }
}

/// Adds a user connection between two ports.
pub struct Connect {
    connection: PortConnection,
}

impl Connect {
    pub fn new(connection: PortConnection) -> Self {
        Self { connection }
    }
}

impl Action for Connect {
    fn describe(&self) -> String {
        "Connect ports".to_owned()
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let plan = plan(project)?;
        require_node(&plan, self.connection.source)?;
        require_node(&plan, self.connection.dest)?;
        plan.check_connection(&self.connection).map_err(graph_error)?;
        project
            .connections
            .connect(&plan, self.connection)
            .map_err(graph_error)?;
        Ok(ActionOutcome::new(
            Disconnect::new(self.connection.source, self.connection.dest),
            Effects::graph(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Disconnect {
    source: PortId,
    dest: PortId,
}

impl Disconnect {
    pub fn new(source: PortId, dest: PortId) -> Self {
        Self { source, dest }
    }
}

impl Action for Disconnect {
    fn describe(&self) -> String {
        "Disconnect ports".to_owned()
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let plan = plan(project)?;
        if plan.is_implicit(self.source, self.dest) {
            return Err(PortError::Implicit.into());
        }
        let index = project
            .connections
            .position(self.source, self.dest)
            .ok_or(PortError::Graph(GraphError::MissingConnection {
                from: self.source,
                to: self.dest,
            }))?;
        let connection = project
            .connections
            .disconnect(self.source, self.dest)
            .map_err(graph_error)?;
        Ok(ActionOutcome::new(
            RestoreConnection { index, connection },
            Effects::graph(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Puts a removed connection back at its former rank, which decides the
/// order it is summed in.
struct RestoreConnection {
    index: usize,
    connection: PortConnection,
}

impl Action for RestoreConnection {
    fn describe(&self) -> String {
        "Connect ports".to_owned()
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let plan = plan(project)?;
        plan.check_connection(&self.connection).map_err(graph_error)?;
        project
            .connections
            .insert_at(&plan, self.index, self.connection)
            .map_err(graph_error)?;
        Ok(ActionOutcome::new(
            Disconnect::new(self.connection.source, self.connection.dest),
            Effects::graph(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SetConnectionMultiplier {
    source: PortId,
    dest: PortId,
    multiplier: f32,
}

impl SetConnectionMultiplier {
    pub fn new(source: PortId, dest: PortId, multiplier: f32) -> Self {
        Self {
            source,
            dest,
            multiplier,
        }
    }
}

impl Action for SetConnectionMultiplier {
    fn describe(&self) -> String {
        "Set connection level".to_owned()
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let previous = ctx
            .project
            .connections
            .set_multiplier(self.source, self.dest, self.multiplier)
            .map_err(graph_error)?;
        Ok(ActionOutcome::new(
            SetConnectionMultiplier::new(self.source, self.dest, previous),
            Effects::graph(),
        ))
    }

    fn should_merge(&self, previous: &dyn Action) -> bool {
        previous
            .as_any()
            .downcast_ref::<SetConnectionMultiplier>()
            .is_some_and(|p| p.source == self.source && p.dest == self.dest)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SetConnectionEnabled {
    source: PortId,
    dest: PortId,
    enabled: bool,
}

impl SetConnectionEnabled {
    pub fn new(source: PortId, dest: PortId, enabled: bool) -> Self {
        Self { source, dest, enabled }
    }
}

impl Action for SetConnectionEnabled {
    fn describe(&self) -> String {
        if self.enabled {
            "Enable connection".to_owned()
        } else {
            "Disable connection".to_owned()
        }
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let previous = ctx
            .project
            .connections
            .set_enabled(self.source, self.dest, self.enabled)
            .map_err(graph_error)?;
        Ok(ActionOutcome::new(
            SetConnectionEnabled::new(self.source, self.dest, previous),
            Effects::graph(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Writes a control value. Consecutive writes to the same control share
/// one history entry.
pub struct SetControlValue {
    address: ParamAddress,
    value: f32,
}

impl SetControlValue {
    pub fn new(address: ParamAddress, value: f32) -> Self {
        Self { address, value }
    }

    pub fn address(&self) -> ParamAddress {
        self.address
    }
}

impl Action for SetControlValue {
    fn describe(&self) -> String {
        format!("Set {}", self.address)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let previous = ctx.project.set_param_value(self.address, self.value)?;
        Ok(ActionOutcome::new(
            SetControlValue::new(self.address, previous),
            Effects::params(),
        ))
    }

    fn should_merge(&self, previous: &dyn Action) -> bool {
        previous
            .as_any()
            .downcast_ref::<SetControlValue>()
            .is_some_and(|p| p.address == self.address)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::run;
    use crate::actions::{AddPlugin, CreateTrack};
    use crate::ids::{ObjectId, TrackId};
    use crate::model::{SlotKind, TrackKind};
    use crate::processors::{fader, macro_node, track};
    use cadenza_graph::NodeKey;
    use cadenza_plugin_host::builtin;

    fn setup() -> (ProjectState, TrackId, TrackId, crate::ids::PluginId) {
        let mut project = ProjectState::new("p", 48_000);
        run(&mut project, &CreateTrack::new(TrackKind::Modulator, "Mod")).unwrap();
        let modulator = project.tracks[1].id;
        run(&mut project, &CreateTrack::new(TrackKind::Bus, "Bus")).unwrap();
        let bus = project.tracks[2].id;
        let outcome = run(
            &mut project,
            &AddPlugin::new(bus, SlotKind::Insert, 0, builtin::gain_descriptor()),
        )
        .unwrap();
        let ObjectId::Plugin(gain) = outcome.created[0] else {
            panic!("no plugin created");
        };
        (project, modulator, bus, gain)
    }

    #[test]
    fn macro_drives_a_plugin_parameter() {
        let (mut project, modulator, _, gain) = setup();
        let cv = NodeRef::Macro(modulator, 0).port(macro_node::CV_OUT);
        let param = NodeRef::Plugin(gain).port(4);
        let outcome = run(&mut project, &Connect::new(PortConnection::new(cv, param))).unwrap();
        assert!(outcome.effects.graph);
        assert_eq!(project.connections.len(), 1);
        assert!(project.ensure_invariants().is_ok());

        assert!(run(&mut project, &Connect::new(PortConnection::new(cv, param))).is_err());
        run(&mut project, &*outcome.inverse).unwrap();
        assert!(project.connections.is_empty());
    }

    #[test]
    fn implicit_wiring_cannot_be_disconnected() {
        let (mut project, _, bus, _) = setup();
        let master = project.master_id().unwrap();
        let source = NodeRef::Fader(bus).port(fader::POST_L);
        let dest = NodeRef::TrackProcessor(master).port(track::IN_L);
        assert_eq!(
            run(&mut project, &Disconnect::new(source, dest)).err(),
            Some(ActionError::Port(PortError::Implicit))
        );
    }

    #[test]
    fn feedback_connection_is_a_cycle() {
        let (mut project, _, bus, _) = setup();
        let master = project.master_id().unwrap();
        let source = NodeRef::Fader(master).port(fader::PRE_L);
        let dest = NodeRef::TrackProcessor(bus).port(track::IN_L);
        assert_eq!(
            run(&mut project, &Connect::new(PortConnection::new(source, dest))).err(),
            Some(ActionError::WouldCycle)
        );
    }

    #[test]
    fn unknown_nodes_are_rejected() {
        let (mut project, _, bus, _) = setup();
        let ghost = PortId::new(NodeKey(u64::MAX), 0);
        let dest = NodeRef::TrackProcessor(bus).port(track::IN_L);
        assert!(matches!(
            run(&mut project, &Connect::new(PortConnection::new(ghost, dest))),
            Err(ActionError::Port(PortError::UnknownNode(_)))
        ));
    }

    #[test]
    fn disconnect_restores_the_original_rank() {
        let (mut project, modulator, bus, gain) = setup();
        let param = NodeRef::Plugin(gain).port(4);
        let first = NodeRef::Macro(modulator, 0).port(macro_node::CV_OUT);
        let second = NodeRef::Macro(modulator, 1).port(macro_node::CV_OUT);
        let fader_amp = NodeRef::Fader(bus).port(fader::AMP);
        for (source, dest) in [(first, param), (second, param), (first, fader_amp)] {
            run(&mut project, &Connect::new(PortConnection::new(source, dest))).unwrap();
        }
        let before = project.connections.clone();
        let outcome = run(&mut project, &Disconnect::new(first, param)).unwrap();
        assert_eq!(project.connections.len(), 2);
        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project.connections, before);
    }

    #[test]
    fn control_writes_merge_per_address() {
        let a = SetControlValue::new(ParamAddress::amp(TrackId(1)), 0.5);
        let b = SetControlValue::new(ParamAddress::amp(TrackId(1)), 0.7);
        let c = SetControlValue::new(ParamAddress::balance(TrackId(1)), 0.7);
        assert!(b.should_merge(&a));
        assert!(!c.should_merge(&a));
    }
}
