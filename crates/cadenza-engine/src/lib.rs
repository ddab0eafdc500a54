//! Project model, transport, undo and session layer of the Cadenza engine.
//!
//! A [`Session`] owns one open project: its [`ProjectState`], the undo
//! history, the plugin instances and the real-time [`Engine`]. Every edit is
//! an [`Action`] submitted to the session; the session reconciles the
//! audio-side runtime after each one, rebuilding and publishing the
//! processing graph when the topology changed.

pub mod actions;
pub mod automation;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ids;
pub mod model;
pub mod persistence;
pub mod processors;
pub mod recording;
pub mod runtime;
pub mod session;
pub mod transport;

pub use actions::{
    Action, ActionContext, ActionOutcome, Applied, CompositeAction, Effects, PluginStates, Reversibility, UndoStack,
};
pub use automation::{AutomationCurve, AutomationMode, AutomationPoint, AutomationTrack, CurveKind, FadeCurve};
pub use backend::{open_backend, open_with_fallback, AudioBackend, BackendKind, BackendLatency, DummyBackend, StreamConfig};
pub use config::EngineConfig;
pub use engine::{Engine, EngineState, ParamEvent};
pub use error::{
    ActionError, BackendError, ConfigError, EngineError, PersistenceError, PortError, RecordingError,
    TransportError, VersionedMigrationError,
};
pub use graph::{GraphPlan, NodeRef};
pub use ids::{ClipId, IdAllocator, NoteId, ObjectId, PluginId, RegionId, SendId, TrackId};
pub use model::{
    AudioClip, AudioPool, Channel, ChannelSend, FaderControl, FaderState, Lane, MidiNote, ParamAddress,
    PluginSlot, ProjectState, Region, RegionContent, SendTarget, Track, TrackKind,
};
pub use persistence::{deserialize, load_project, save_project, serialize, PROJECT_SCHEMA_VERSION};
pub use recording::{RecordTake, RecordingManager, RecordingMode};
pub use session::{HealthReport, Session, TransportInfo};
pub use transport::{
    MusicalPosition, TempoCurve, TempoEvent, TempoMap, TimeSignature, Transport, TransportSettings, TransportState,
};
