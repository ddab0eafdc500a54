//! Signal routing for the Cadenza engine.
//!
//! Processables declare typed ports, a [`ConnectionSet`] records the
//! port-to-port routing and refuses anything that would close a cycle, and
//! [`GraphBuilder`] turns both into a [`CompiledGraph`] ordered with Kahn's
//! algorithm. A [`GraphThreadPool`] executes compiled graphs once per audio
//! cycle.

pub mod builder;
pub mod compiled;
pub mod connection;
pub mod error;
pub mod midi;
pub mod pool;
pub mod port;
pub mod processable;

pub use builder::{GraphBuilder, GraphConfig, RebuildTicket};
pub use compiled::{CompiledGraph, CycleParams, DeviceBuffers, GraphInfo, NodeInfo};
pub use connection::{ConnectionSet, PortConnection, PortLookup};
pub use error::{GraphError, ProcessError};
pub use midi::{MidiBuffer, MidiEvent, MidiMessage};
pub use pool::{CycleOutcome, GraphThreadPool, PoolConfig};
pub use port::{
    ControlCell, NodeKey, Port, PortDirection, PortFlags, PortId, PortKind, PortRange, PortSpec,
    PortValue,
};
pub use processable::{NodeIo, ProcessContext, Processable, TransportView};
