//! Port-to-port routing with cycle rejection at creation time.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::port::{NodeKey, PortDirection, PortId, PortKind};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortConnection {
    pub source: PortId,
    pub dest: PortId,
    pub multiplier: f32,
    pub enabled: bool,
}

impl PortConnection {
    pub fn new(source: PortId, dest: PortId) -> Self {
        Self {
            source,
            dest,
            multiplier: 1.0,
            enabled: true,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f32) -> Self {
        self.multiplier = multiplier;
        self
    }
}

/// Resolves port kinds and directions for validation.
pub trait PortLookup {
    fn port_info(&self, port: PortId) -> Option<(PortKind, PortDirection)>;
}

impl<F> PortLookup for F
where
    F: Fn(PortId) -> Option<(PortKind, PortDirection)>,
{
    fn port_info(&self, port: PortId) -> Option<(PortKind, PortDirection)> {
        self(port)
    }
}

/// Ordered set of connections. Insertion order is preserved and defines how
/// several sources are merged into one destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSet {
    connections: Vec<PortConnection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortConnection> {
        self.connections.iter()
    }

    pub fn get(&self, source: PortId, dest: PortId) -> Option<&PortConnection> {
        self.connections
            .iter()
            .find(|c| c.source == source && c.dest == dest)
    }

    pub fn position(&self, source: PortId, dest: PortId) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| c.source == source && c.dest == dest)
    }

    /// Sources feeding `dest`, in connection-creation order.
    pub fn sources_of(&self, dest: PortId) -> impl Iterator<Item = &PortConnection> {
        self.connections.iter().filter(move |c| c.dest == dest)
    }

    pub fn destinations_of(&self, source: PortId) -> impl Iterator<Item = &PortConnection> {
        self.connections.iter().filter(move |c| c.source == source)
    }

    /// Adds a connection after validating both ends and the resulting
    /// topology.
    pub fn connect(
        &mut self,
        lookup: &dyn PortLookup,
        connection: PortConnection,
    ) -> Result<(), GraphError> {
        self.validate(lookup, &connection)?;
        self.connections.push(connection);
        Ok(())
    }

    /// Inserts at a given position, used to restore a removed connection at
    /// its original rank.
    pub fn insert_at(
        &mut self,
        lookup: &dyn PortLookup,
        index: usize,
        connection: PortConnection,
    ) -> Result<(), GraphError> {
        self.validate(lookup, &connection)?;
        let index = index.min(self.connections.len());
        self.connections.insert(index, connection);
        Ok(())
    }

    pub fn validate(
        &self,
        lookup: &dyn PortLookup,
        connection: &PortConnection,
    ) -> Result<(), GraphError> {
        let PortConnection { source, dest, .. } = *connection;
        let (source_kind, source_dir) = lookup
            .port_info(source)
            .ok_or(GraphError::MissingPort(source))?;
        let (dest_kind, dest_dir) = lookup
            .port_info(dest)
            .ok_or(GraphError::MissingPort(dest))?;
        if source_dir != PortDirection::Output {
            return Err(GraphError::WrongDirection(source));
        }
        if dest_dir != PortDirection::Input {
            return Err(GraphError::WrongDirection(dest));
        }
        if !source_kind.can_feed(dest_kind) {
            return Err(GraphError::IncompatibleKinds {
                from: source_kind,
                to: dest_kind,
            });
        }
        if self.get(source, dest).is_some() {
            return Err(GraphError::DuplicateConnection { from: source, to: dest });
        }
        if self.would_cycle(source.node, dest.node) {
            return Err(GraphError::WouldCycle { from: source, to: dest });
        }
        Ok(())
    }

    pub fn disconnect(&mut self, source: PortId, dest: PortId) -> Result<PortConnection, GraphError> {
        let index = self
            .position(source, dest)
            .ok_or(GraphError::MissingConnection { from: source, to: dest })?;
        Ok(self.connections.remove(index))
    }

    pub fn set_multiplier(
        &mut self,
        source: PortId,
        dest: PortId,
        multiplier: f32,
    ) -> Result<f32, GraphError> {
        let connection = self.find_mut(source, dest)?;
        Ok(std::mem::replace(&mut connection.multiplier, multiplier))
    }

    pub fn set_enabled(
        &mut self,
        source: PortId,
        dest: PortId,
        enabled: bool,
    ) -> Result<bool, GraphError> {
        let connection = self.find_mut(source, dest)?;
        Ok(std::mem::replace(&mut connection.enabled, enabled))
    }

    /// Drops every connection touching `node`, returning them with their
    /// former positions so they can be restored.
    pub fn remove_node(&mut self, node: NodeKey) -> Vec<(usize, PortConnection)> {
        let mut removed = Vec::new();
        let mut index = 0;
        let mut original = 0;
        while index < self.connections.len() {
            let connection = self.connections[index];
            if connection.source.node == node || connection.dest.node == node {
                self.connections.remove(index);
                removed.push((original, connection));
            } else {
                index += 1;
            }
            original += 1;
        }
        removed
    }

    /// Reinserts connections returned by [`ConnectionSet::remove_node`].
    /// Positions refer to the set as it was before removal.
    pub fn restore(&mut self, removed: &[(usize, PortConnection)]) {
        for (position, connection) in removed {
            let index = (*position).min(self.connections.len());
            self.connections.insert(index, *connection);
        }
    }

    /// Whether a new edge `from -> to` would close a cycle.
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
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = adjacency.get(&node) {
                stack.extend(next.iter().copied());
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

    fn find_mut(&mut self, source: PortId, dest: PortId) -> Result<&mut PortConnection, GraphError> {
        self.connections
            .iter_mut()
            .find(|c| c.source == source && c.dest == dest)
            .ok_or(GraphError::MissingConnection { from: source, to: dest })
    }
}
