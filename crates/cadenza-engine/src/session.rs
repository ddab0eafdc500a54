//! One open project and everything that runs it.
//!
//! The session is the control domain. It applies actions to the
//! [`ProjectState`] through the [`UndoStack`], then reconciles the live side:
//! plugin instances and track runtimes are synced, the graph is rebuilt when
//! the topology changed, and a fresh [`EngineState`] is published to the
//! audio thread. Superseded states are kept until the audio thread has let go
//! of them.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cadenza_graph::{GraphConfig, GraphInfo, NodeKey, RebuildTicket};
use cadenza_plugin_host::{PluginHost, PluginState};
use cadenza_rt::{AudioMetrics, CallbackHandle};
use tracing::{debug, error, info, warn};

use crate::actions::{Action, ActionContext, Applied, Effects, UndoStack};
use crate::automation::AutomationMode;
use crate::backend::{open_with_fallback, AudioBackend, BackendLatency, StreamConfig};
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineState};
use crate::error::{ActionError, EngineError};
use crate::graph::{GraphPlan, NodeRef};
use crate::ids::{PluginId, TrackId};
use crate::model::{ParamAddress, ProjectState, Track};
use crate::persistence::{load_project, save_project};
use crate::recording::{capture_channel, RecordingManager};
use crate::runtime::Runtime;
use crate::transport::{Transport, TransportState};

/// Seconds of armed input the capture rings hold between polls.
const CAPTURE_SECONDS: usize = 10;
const CAPTURE_EVENTS: usize = 16_384;

/// Counters gathered by [`Session::poll_health`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub metrics: AudioMetrics,
    /// Xruns since the previous poll.
    pub new_xruns: u64,
    /// Nodes that crashed since the previous poll.
    pub crashed: Vec<String>,
    pub dropped_param_events: u64,
    /// Set when punch-out ended a recording pass during this poll.
    pub committed: Option<Applied>,
}

/// Transport snapshot for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportInfo {
    pub state: TransportState,
    pub playhead: u64,
    pub frames_rolled: u64,
    /// Tempo at the playhead as of the last rendered cycle.
    pub bpm: f64,
}

pub struct Session {
    config: EngineConfig,
    project: ProjectState,
    history: UndoStack,
    runtime: Runtime,
    host: PluginHost,
    transport: Transport,
    engine: Arc<Engine>,
    backend: Option<(Box<dyn AudioBackend>, CallbackHandle)>,
    recording: RecordingManager,
    retired: Vec<Arc<EngineState>>,
    generation: Arc<AtomicU64>,
    instantiated: bool,
    seen_xruns: u64,
    seen_dropped: u64,
    seen_crashes: HashSet<NodeKey>,
    closed: bool,
}

impl Session {
    /// Opens `project` with the built-in plugin host.
    pub fn new(config: EngineConfig, project: ProjectState) -> Result<Self, EngineError> {
        Self::with_host(config, project, PluginHost::with_builtins())
    }

    pub fn with_host(config: EngineConfig, project: ProjectState, host: PluginHost) -> Result<Self, EngineError> {
        let config = config.sanitized();
        project.ensure_invariants()?;
        let transport = Transport::new(&project.transport, config.sample_rate);
        let capture_frames = config.sample_rate as usize * CAPTURE_SECONDS;
        let (writer, reader) = capture_channel(capture_frames, CAPTURE_EVENTS);
        let engine = Arc::new(Engine::new(config.clone(), &transport, writer)?);
        let mut session = Self {
            history: UndoStack::new(config.max_undo_depth),
            instantiated: config.eager_plugin_instantiation,
            config,
            project,
            runtime: Runtime::new(),
            host,
            transport,
            engine,
            backend: None,
            recording: RecordingManager::new(reader),
            retired: Vec::new(),
            generation: Arc::new(AtomicU64::new(0)),
            seen_xruns: 0,
            seen_dropped: 0,
            seen_crashes: HashSet::new(),
            closed: false,
        };
        session.reconcile(Effects::graph())?;
        info!(project = %session.project.name, tracks = session.project.tracks.len(), "session opened");
        Ok(session)
    }

    /// Opens an empty project at the configured sample rate.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let project = ProjectState::new("Untitled", config.sample_rate);
        Self::new(config, project)
    }

    pub fn open_project(config: EngineConfig, path: &Path) -> Result<Self, EngineError> {
        let project = load_project(path)?;
        Self::new(config, project)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn project(&self) -> &ProjectState {
        &self.project
    }

    pub fn history(&self) -> &UndoStack {
        &self.history
    }

    pub fn tracks(&self) -> &[Track] {
        &self.project.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.project.track(id)
    }

    pub fn transport(&self) -> TransportInfo {
        let shared = self.transport.shared();
        TransportInfo {
            state: shared.state(),
            playhead: shared.playhead(),
            frames_rolled: shared.frames_rolled(),
            bpm: shared.bpm(),
        }
    }

    pub fn graph_info(&self) -> Option<GraphInfo> {
        self.engine.state().graph.as_ref().map(|graph| graph.info())
    }

    pub fn metrics(&self) -> AudioMetrics {
        self.engine.metrics()
    }

    /// Lifecycle state of a plugin instance. `None` if the project has no
    /// such plugin.
    pub fn plugin_state(&self, id: PluginId) -> Option<PluginState> {
        self.runtime.plugin(id).map(|instance| instance.state())
    }

    /// Latency of the signal path into the master output, plus the device.
    pub fn latency(&self) -> (u32, BackendLatency) {
        let graph = self.graph_info().map_or(0, |info| info.total_latency);
        let device = self
            .backend
            .as_ref()
            .map(|(backend, callback)| {
                // What the device reported with its last period wins over
                // the backend's estimate.
                let estimate = backend.latency();
                let (input, output) = callback.reported_latency();
                BackendLatency {
                    input: input.unwrap_or(estimate.input),
                    output: output.unwrap_or(estimate.output),
                }
            })
            .unwrap_or_default();
        (graph, device)
    }

    /// Applies an action. Actions that cannot be undone are refused until
    /// confirmed with [`Session::submit_confirmed`].
    pub fn submit(&mut self, action: impl Action) -> Result<Applied, EngineError> {
        self.apply(Box::new(action), false)
    }

    /// Applies an action, accepting that it may empty the undo history.
    pub fn submit_confirmed(&mut self, action: impl Action) -> Result<Applied, EngineError> {
        self.apply(Box::new(action), true)
    }

    pub fn submit_boxed(&mut self, action: Box<dyn Action>, confirmed: bool) -> Result<Applied, EngineError> {
        self.apply(action, confirmed)
    }

    fn apply(&mut self, action: Box<dyn Action>, confirmed: bool) -> Result<Applied, EngineError> {
        let applied = {
            let mut ctx = ActionContext::new(&mut self.project, &self.runtime);
            self.history.submit(action, &mut ctx, confirmed)?
        };
        if let Err(err) = self.reconcile(applied.effects) {
            self.revert(&applied, "edit", |history, ctx| history.rollback(ctx));
            return Err(err);
        }
        Ok(applied)
    }

    /// Reverts the most recent history entry. Returns `None` when there is
    /// nothing to undo.
    pub fn undo(&mut self) -> Result<Option<Applied>, EngineError> {
        let applied = {
            let mut ctx = ActionContext::new(&mut self.project, &self.runtime);
            self.history.undo(&mut ctx)?
        };
        if let Some(applied) = &applied {
            debug!(action = %applied.description, "undone");
            if let Err(err) = self.reconcile(applied.effects) {
                self.revert(applied, "undo", |history, ctx| history.redo(ctx));
                return Err(err);
            }
        }
        Ok(applied)
    }

    pub fn redo(&mut self) -> Result<Option<Applied>, EngineError> {
        let applied = {
            let mut ctx = ActionContext::new(&mut self.project, &self.runtime);
            self.history.redo(&mut ctx)?
        };
        if let Some(applied) = &applied {
            debug!(action = %applied.description, "redone");
            if let Err(err) = self.reconcile(applied.effects) {
                self.revert(applied, "redo", |history, ctx| history.undo(ctx));
                return Err(err);
            }
        }
        Ok(applied)
    }

    /// Puts the project and history back after the live side refused
    /// `applied`, then reconciles again so the engine matches.
    fn revert(
        &mut self,
        applied: &Applied,
        step: &str,
        undo: impl FnOnce(&mut UndoStack, &mut ActionContext<'_>) -> Result<Option<Applied>, ActionError>,
    ) {
        let reverted = {
            let mut ctx = ActionContext::new(&mut self.project, &self.runtime);
            undo(&mut self.history, &mut ctx)
        };
        let effects = match reverted {
            Ok(Some(reverted)) => applied.effects | reverted.effects,
            Ok(None) => applied.effects,
            Err(err) => {
                error!(%err, action = %applied.description, step, "could not revert");
                return;
            }
        };
        warn!(action = %applied.description, step, "reverted after the engine refused it");
        if let Err(err) = self.reconcile(effects) {
            error!(%err, "engine out of sync with the project");
        }
    }

    /// Brings the runtime in line with the project after `effects`.
    fn reconcile(&mut self, effects: Effects) -> Result<(), EngineError> {
        let report = self.runtime.sync(
            &self.project,
            &self.host,
            self.config.sample_rate,
            self.config.block_size,
            self.instantiated,
        );
        for (plugin, err) in &report.failed {
            warn!(%plugin, %err, "plugin disabled");
        }
        if effects.transport {
            self.transport.apply(&self.project.transport);
        }

        let current = self.engine.state();
        let rebuild = effects.graph
            || !report.created.is_empty()
            || !report.released.is_empty()
            || current.graph.is_none();
        let graph = if rebuild {
            let ticket = RebuildTicket::issue(&self.generation);
            let plan = GraphPlan::build(&self.project)?;
            let graph_config = GraphConfig::new(self.config.sample_rate, self.config.block_size)
                .with_input_channels(self.config.input_channels);
            let compiled = plan.instantiate(&self.runtime)?.build(graph_config, &ticket)?;
            debug!(
                generation = ticket.generation(),
                nodes = compiled.node_count(),
                "graph rebuilt"
            );
            self.seen_crashes.clear();
            Some(Arc::new(compiled))
        } else {
            current.graph.clone()
        };
        drop(current);

        let params = self.runtime.param_table(&self.project);
        let automation = self.runtime.automation(&self.project, &params);
        let any_armed = self
            .project
            .tracks
            .iter()
            .any(|track| track.armed && track.kind.can_record());
        let previous = self.engine.publish(EngineState {
            graph,
            params,
            automation,
            any_armed,
        });
        self.retired.push(previous);
        self.reclaim();
        Ok(())
    }

    fn reclaim(&mut self) {
        self.retired.retain(|state| Arc::strong_count(state) > 1);
        self.runtime.reclaim();
    }

    /// Starts playback. Plugins deferred until first playback are
    /// instantiated here.
    pub fn play(&mut self) -> Result<(), EngineError> {
        self.ensure_instantiated()?;
        self.transport.play()?;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        self.transport.pause()?;
        Ok(())
    }

    /// Stops the transport. A recording pass is committed as one undoable
    /// action, which is returned.
    pub fn stop(&mut self) -> Result<Option<Applied>, EngineError> {
        let from = self.transport.stop()?;
        if from == TransportState::Recording || self.recording.is_active() {
            return self.commit_recording();
        }
        Ok(None)
    }

    /// Starts recording on every armed track, rolling first when stopped.
    pub fn record(&mut self) -> Result<(), EngineError> {
        self.ensure_instantiated()?;
        let bars = self.project.transport.preroll_bars.max(self.config.preroll_bars);
        let preroll = self.project.transport.tempo.samples_before(
            self.transport.playhead(),
            bars,
            self.config.sample_rate,
        );
        self.recording.begin(&self.project);
        for lane in self.project.tracks.iter().flat_map(|track| track.automation.iter()) {
            let writing = lane.mode == AutomationMode::Write;
            self.runtime.writing_flag(lane.target).store(writing, Ordering::Release);
        }
        if let Err(err) = self.transport.record(preroll) {
            self.recording.abort();
            self.clear_writing();
            return Err(err.into());
        }
        Ok(())
    }

    pub fn locate(&mut self, position: u64) {
        self.transport.locate(position);
    }

    /// The user grabbed a control. While recording, automation lanes in
    /// touch or latch mode start writing it.
    pub fn touch_param(&mut self, address: ParamAddress) {
        let writing = self.recording.touch(address);
        self.runtime.writing_flag(address).store(writing, Ordering::Release);
    }

    pub fn release_param(&mut self, address: ParamAddress) {
        let writing = self.recording.release(address);
        self.runtime.writing_flag(address).store(writing, Ordering::Release);
    }

    /// Writes a parameter value. The project value changes immediately and
    /// the audio thread picks it up at the start of the next cycle. Live
    /// control changes are not recorded in the undo history.
    pub fn set_param(&mut self, address: ParamAddress, value: f32) -> Result<(), EngineError> {
        self.project
            .set_param_value(address, value)
            .map_err(|err| match err {
                ActionError::NotFound { .. } => EngineError::UnknownParam(address.to_string()),
                other => other.into(),
            })?;
        let stored = self.project.param_value(address).unwrap_or(value);
        self.engine.queue_param(address, stored)
    }

    /// Renders `nframes` of interleaved output on the calling thread. Used
    /// when no backend drives the engine.
    pub fn render(&mut self, output: &mut [f32], nframes: usize) -> Result<(), EngineError> {
        if self.backend_running() {
            return Err(EngineError::BackendRunning);
        }
        self.engine.process_cycle(output, nframes);
        Ok(())
    }

    /// Checks the counters the audio thread keeps, logs anything new and
    /// drains the recording rings. Call it periodically from the control
    /// thread.
    pub fn poll_health(&mut self) -> Result<HealthReport, EngineError> {
        let metrics = self.engine.metrics();
        let new_xruns = metrics.xruns.saturating_sub(self.seen_xruns);
        if new_xruns > 0 {
            warn!(xruns = new_xruns, total = metrics.xruns, "audio xruns");
        }
        self.seen_xruns = metrics.xruns;

        let mut crashed = Vec::new();
        if let Some(graph) = self.engine.state().graph.as_ref() {
            for key in graph.crashed_nodes() {
                if self.seen_crashes.insert(key) {
                    let name = NodeRef::from_key(key).map_or_else(|| key.to_string(), |node| node.to_string());
                    error!(node = %name, "node crashed and is bypassed");
                    crashed.push(name);
                }
            }
        }

        let dropped = self.engine.dropped_param_events();
        let dropped_param_events = dropped.saturating_sub(self.seen_dropped);
        if dropped_param_events > 0 {
            warn!(dropped = dropped_param_events, "parameter events dropped");
        }
        self.seen_dropped = dropped;

        if let Err(err) = self.recording.poll() {
            warn!(%err, "recording input lost");
        }
        let mut committed = None;
        if self.recording.is_active() && self.transport.shared().past_punch_out() {
            if self.transport.state() == TransportState::Recording {
                self.transport.end_recording()?;
            }
            committed = self.commit_recording()?;
        }
        self.reclaim();

        Ok(HealthReport {
            metrics,
            new_xruns,
            crashed,
            dropped_param_events,
            committed,
        })
    }

    /// Saves the project, including plugin states and the playhead.
    pub fn save(&mut self, path: &Path) -> Result<(), EngineError> {
        let ids: Vec<PluginId> = self.project.plugins().map(|(_, slot)| slot.id).collect();
        for id in ids {
            let Some(instance) = self.runtime.plugin(id) else { continue };
            match instance.save_state() {
                Ok(blob) => {
                    if let Some(slot) = self.project.plugin_mut(id) {
                        slot.state = Some(blob);
                    }
                }
                Err(err) => debug!(plugin = %id, %err, "plugin state not saved"),
            }
        }
        self.project.transport.playhead = self.transport.playhead();
        save_project(&self.project, path)?;
        Ok(())
    }

    /// Replaces the open project with the one at `path`. The undo history
    /// is cleared.
    pub fn load(&mut self, path: &Path) -> Result<(), EngineError> {
        let project = load_project(path)?;
        if self.transport.state() != TransportState::Stopped {
            self.transport.stop()?;
        }
        self.recording.abort();
        self.clear_writing();
        self.engine.publish(EngineState::default());
        self.retired.clear();
        self.runtime.shutdown();
        self.history.clear();
        self.project = project;
        self.instantiated = self.config.eager_plugin_instantiation;
        self.transport.apply(&self.project.transport);
        self.transport.locate(self.project.transport.playhead);
        self.reconcile(Effects::graph())?;
        info!(path = %path.display(), "project replaced");
        Ok(())
    }

    /// Hands the engine to an audio backend of the configured kind. Falls
    /// back to the dummy backend when that kind cannot be opened.
    pub fn start_backend(&mut self) -> Result<(), EngineError> {
        if self.backend_running() {
            return Err(EngineError::BackendRunning);
        }
        let stream = StreamConfig {
            sample_rate: self.config.sample_rate,
            block_size: self.config.block_size,
            input_channels: self.config.input_channels,
            output_channels: self.config.output_channels,
        };
        let mut backend = open_with_fallback(self.config.backend, stream);
        let callback = self.engine.callback_handle();
        backend.start(callback.clone())?;
        info!(kind = ?backend.kind(), "backend started");
        self.backend = Some((backend, callback));
        Ok(())
    }

    pub fn stop_backend(&mut self) -> Result<(), EngineError> {
        if let Some((mut backend, _)) = self.backend.take() {
            backend.stop()?;
            info!(kind = ?backend.kind(), "backend stopped");
        }
        Ok(())
    }

    pub fn backend_running(&self) -> bool {
        self.backend.as_ref().is_some_and(|(backend, _)| backend.is_running())
    }

    /// Stops audio and releases every plugin.
    pub fn close(mut self) -> Result<(), EngineError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stopped = self.stop_backend();
        if self.transport.state() != TransportState::Stopped {
            self.transport.stop()?;
        }
        self.recording.abort();
        self.engine.publish(EngineState::default());
        self.retired.clear();
        self.runtime.shutdown();
        info!(project = %self.project.name, "session closed");
        stopped
    }

    fn ensure_instantiated(&mut self) -> Result<(), EngineError> {
        if self.instantiated {
            return Ok(());
        }
        self.instantiated = true;
        info!("instantiating plugins");
        self.reconcile(Effects::graph())
    }

    fn commit_recording(&mut self) -> Result<Option<Applied>, EngineError> {
        let commit = self.recording.finish(&mut self.project);
        self.clear_writing();
        match commit? {
            Some(action) => {
                let applied = self.submit(action)?;
                info!(created = applied.created.len(), "recording committed");
                Ok(Some(applied))
            }
            None => Ok(None),
        }
    }

    fn clear_writing(&mut self) {
        let targets: Vec<ParamAddress> = self
            .project
            .tracks
            .iter()
            .flat_map(|track| track.automation.iter().map(|lane| lane.target))
            .collect();
        for target in targets {
            self.runtime.writing_flag(target).store(false, Ordering::Release);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(%err, "session teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{AddPlugin, CreateTrack};
    use crate::model::{SlotKind, TrackKind};
    use cadenza_plugin_host::{builtin, PluginCategory, PluginDescriptor};

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_block_size(64)
            .with_worker_threads(Some(0))
            .with_realtime_priority(false)
    }

    #[test]
    fn new_sessions_publish_a_graph() {
        let session = Session::open(config()).unwrap();
        let info = session.graph_info().unwrap();
        assert!(!info.nodes.is_empty());
        assert_eq!(session.transport().state, TransportState::Stopped);
    }

    #[test]
    fn edits_rebuild_and_undo_restores() {
        let mut session = Session::open(config()).unwrap();
        let before = session.graph_info().unwrap().nodes.len();
        let applied = session.submit(CreateTrack::new(TrackKind::Audio, "Gtr")).unwrap();
        let track = applied.track().unwrap();
        assert!(session.track(track).is_some());
        assert!(session.graph_info().unwrap().nodes.len() > before);

        session.undo().unwrap().unwrap();
        assert!(session.track(track).is_none());
        assert_eq!(session.graph_info().unwrap().nodes.len(), before);
        assert!(session.undo().unwrap().is_none());
        session.redo().unwrap().unwrap();
        assert!(session.track(track).is_some());
    }

    #[test]
    fn lazy_plugins_wait_for_play() {
        let mut session = Session::open(config().with_eager_plugins(false)).unwrap();
        let track = session
            .submit(CreateTrack::new(TrackKind::Audio, "Bass"))
            .unwrap()
            .track()
            .unwrap();
        let plugin = session
            .submit(AddPlugin::new(track, SlotKind::Insert, 0, builtin::gain_descriptor()))
            .unwrap()
            .plugin()
            .unwrap();
        assert_eq!(session.plugin_state(plugin), Some(PluginState::Created));
        session.play().unwrap();
        assert_eq!(session.plugin_state(plugin), Some(PluginState::Active));
    }

    #[test]
    fn unknown_params_are_reported() {
        let mut session = Session::open(config()).unwrap();
        let err = session.set_param(ParamAddress::amp(TrackId(999)), 0.5).unwrap_err();
        assert!(matches!(err, EngineError::UnknownParam(_)));
    }

    #[test]
    fn set_param_is_live_and_not_undoable() {
        let mut session = Session::open(config()).unwrap();
        let track = session
            .submit(CreateTrack::new(TrackKind::Audio, "Keys"))
            .unwrap()
            .track()
            .unwrap();
        let depth = session.history().len();
        session.set_param(ParamAddress::amp(track), 0.25).unwrap();
        assert_eq!(session.project().param_value(ParamAddress::amp(track)), Some(0.25));
        assert_eq!(session.history().len(), depth);

        let mut output = vec![0.0; 64 * 2];
        session.render(&mut output, 64).unwrap();
        let state = session.engine().state();
        assert_eq!(state.params.get(&ParamAddress::amp(track)).unwrap().get(), 0.25);
    }

    #[test]
    fn edit_the_engine_refuses_is_rolled_back() {
        let mut session = Session::open(config()).unwrap();
        let track = session
            .submit(CreateTrack::new(TrackKind::Audio, "Gtr"))
            .unwrap()
            .track()
            .unwrap();
        let before = session.project().clone();
        let nodes = session.graph_info().unwrap().nodes.len();
        let depth = session.history().len();

        // No instance can be built for a nameless descriptor, so the graph
        // cannot be rebuilt.
        let broken = PluginDescriptor::new("urn:cadenza:broken", " ", PluginCategory::Effect).with_audio(2, 2);
        assert!(session.submit(AddPlugin::new(track, SlotKind::Insert, 0, broken)).is_err());
        assert_eq!(session.project().tracks, before.tracks);
        assert_eq!(session.history().len(), depth);
        assert_eq!(session.graph_info().unwrap().nodes.len(), nodes);

        session.undo().unwrap().unwrap();
        assert!(session.track(track).is_none());
    }

    #[test]
    fn stop_without_recording_commits_nothing() {
        let mut session = Session::open(config()).unwrap();
        session.play().unwrap();
        assert!(session.stop().unwrap().is_none());
        assert!(matches!(
            session.pause(),
            Err(EngineError::Transport(_))
        ));
    }
}
