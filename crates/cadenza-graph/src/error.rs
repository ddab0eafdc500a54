use thiserror::Error;

use crate::port::{NodeKey, PortId, PortKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("node {0:?} is already part of the graph")]
    DuplicateNode(NodeKey),
    #[error("node {0:?} not found")]
    MissingNode(NodeKey),
    #[error("port {0:?} not found")]
    MissingPort(PortId),
    #[error("port {0:?} has the wrong direction for this end of a connection")]
    WrongDirection(PortId),
    #[error("cannot connect a {from:?} output to a {to:?} input")]
    IncompatibleKinds { from: PortKind, to: PortKind },
    #[error("{from:?} is already connected to {to:?}")]
    DuplicateConnection { from: PortId, to: PortId },
    #[error("no connection from {from:?} to {to:?}")]
    MissingConnection { from: PortId, to: PortId },
    #[error("connecting {from:?} to {to:?} would create a cycle")]
    WouldCycle { from: PortId, to: PortId },
    #[error("graph contains a cycle through {0} node(s)")]
    Cycle(usize),
    #[error("no terminal node designated")]
    NoTerminal,
    #[error("graph rebuild superseded by a newer topology change")]
    Superseded,
}

/// Failure reported by a node from inside `process`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// The node could not run this cycle but is healthy, for example because a
    /// shared resource was busy. The node is bypassed for this cycle only.
    #[error("node skipped this cycle")]
    Skipped,
    /// The node is broken and must not run again.
    #[error("node failed: {0}")]
    Failed(&'static str),
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn connection_errors_name_both_ends_and_have_no_source() {
        let from = PortId::new(NodeKey(1), 2);
        let to = PortId::new(NodeKey(2), 0);
        let err = GraphError::WouldCycle { from, to };
        let text = err.to_string();
        assert!(text.starts_with("connecting PortId"));
        assert!(text.contains("NodeKey(1)") && text.contains("NodeKey(2)"));
        assert!(err.source().is_none());
        let err = GraphError::IncompatibleKinds {
            from: PortKind::Midi,
            to: PortKind::Audio,
        };
        assert_eq!(err.to_string(), "cannot connect a Midi output to a Audio input");
    }
}
