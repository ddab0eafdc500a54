mod common;

use cadenza_engine::actions::{AddPlugin, CreateTrack, EditTransport, RemovePlugin, TransportEdit};
use cadenza_engine::model::SlotKind;
use cadenza_engine::{
    ActionError, EngineError, NodeRef, ProjectState, Session, TempoEvent, TrackKind, TransportError,
    TransportState,
};
use cadenza_plugin_host::{builtin, PluginState};

fn session(block_size: usize) -> Session {
    let config = common::config(block_size);
    let project = ProjectState::new("scenario", config.sample_rate);
    Session::with_host(config, project, common::host()).unwrap()
}

fn render_blocks(session: &mut Session, blocks: usize) -> Vec<f32> {
    let block = session.config().block_size;
    let channels = session.config().output_channels;
    let mut output = vec![0.0; block * channels];
    for _ in 0..blocks {
        session.render(&mut output, block).unwrap();
    }
    output
}

#[test]
fn four_blocks_of_512_advance_the_playhead_and_run_every_node() {
    let mut session = session(512);
    let track = session
        .submit(CreateTrack::new(TrackKind::Audio, "Drums"))
        .unwrap()
        .track()
        .unwrap();
    let plugin = session
        .submit(AddPlugin::new(track, SlotKind::Insert, 0, builtin::gain_descriptor()))
        .unwrap()
        .plugin()
        .unwrap();

    session.play().unwrap();
    render_blocks(&mut session, 4);

    assert_eq!(session.transport().playhead, 2048);
    assert_eq!(session.transport().frames_rolled, 2048);
    let info = session.graph_info().unwrap();
    let node = info
        .nodes
        .iter()
        .find(|node| node.key == NodeRef::Plugin(plugin).key())
        .unwrap();
    assert_eq!(node.processed, 4);
    let report = session.poll_health().unwrap();
    assert_eq!(report.metrics.xruns, 0);
    assert_eq!(report.metrics.cycles, 4);
    assert!(report.crashed.is_empty());
}

#[test]
fn playhead_wraps_inside_the_loop() {
    let block = 64;
    let mut session = session(block);
    session
        .submit(EditTransport::new(TransportEdit::LoopRange(0, 1_000)))
        .unwrap();
    session
        .submit(EditTransport::new(TransportEdit::LoopEnabled(true)))
        .unwrap();
    session.play().unwrap();

    for blocks in 1..=40 {
        render_blocks(&mut session, 1);
        let rolled = (blocks * block) as u64;
        assert_eq!(session.transport().playhead, rolled % 1_000, "after {blocks} blocks");
        assert_eq!(session.transport().frames_rolled, rolled);
    }
}

#[test]
fn tempo_changes_reach_the_audio_thread() {
    let mut session = session(64);
    // 60 bpm from the second beat, half a second in.
    session
        .submit(EditTransport::tempo_event(TempoEvent::constant(960, 60.0)))
        .unwrap();
    assert_eq!(session.transport().bpm, 120.0);
    session.locate(23_990);
    session.play().unwrap();
    render_blocks(&mut session, 1);
    assert_eq!(session.transport().bpm, 60.0);

    session.undo().unwrap().unwrap();
    render_blocks(&mut session, 1);
    assert_eq!(session.transport().bpm, 120.0);
}

#[test]
fn stopped_transport_does_not_move() {
    let mut session = session(64);
    session.locate(300);
    render_blocks(&mut session, 3);
    assert_eq!(session.transport().playhead, 300);
    assert_eq!(session.transport().state, TransportState::Stopped);
}

#[test]
fn illegal_transport_transitions_are_typed_errors() {
    let mut session = session(64);
    assert!(matches!(
        session.pause(),
        Err(EngineError::Transport(TransportError::IllegalTransition {
            from: TransportState::Stopped,
            to: TransportState::Paused,
        }))
    ));
    assert!(matches!(session.stop(), Err(EngineError::Transport(_))));

    session.play().unwrap();
    session.pause().unwrap();
    assert!(matches!(session.pause(), Err(EngineError::Transport(_))));
    session.play().unwrap();
    assert_eq!(session.transport().state, TransportState::Rolling);
    assert!(session.stop().unwrap().is_none());
    assert_eq!(session.transport().state, TransportState::Stopped);
}

#[test]
fn a_crashing_plugin_is_bypassed_and_reported_once() {
    let mut session = session(128);
    let track = session
        .submit(CreateTrack::new(TrackKind::Audio, "Fx"))
        .unwrap()
        .track()
        .unwrap();
    let crasher = session
        .submit(AddPlugin::new(track, SlotKind::Insert, 0, common::crash_descriptor()))
        .unwrap()
        .plugin()
        .unwrap();
    let other = session
        .submit(CreateTrack::new(TrackKind::Audio, "Clean"))
        .unwrap()
        .track()
        .unwrap();
    let healthy = session
        .submit(AddPlugin::new(other, SlotKind::Insert, 0, builtin::gain_descriptor()))
        .unwrap()
        .plugin()
        .unwrap();

    session.play().unwrap();
    render_blocks(&mut session, 3);

    let report = session.poll_health().unwrap();
    assert_eq!(report.crashed, vec![NodeRef::Plugin(crasher).to_string()]);
    assert_eq!(report.metrics.node_crashes, 1);
    assert_eq!(report.metrics.xruns, 0);
    assert_eq!(session.plugin_state(crasher), Some(PluginState::Crashed));
    assert_eq!(session.plugin_state(healthy), Some(PluginState::Active));

    let info = session.graph_info().unwrap();
    let healthy_node = info
        .nodes
        .iter()
        .find(|node| node.key == NodeRef::Plugin(healthy).key())
        .unwrap();
    assert_eq!(healthy_node.processed, 3);
    assert_eq!(session.transport().playhead, 3 * 128);

    render_blocks(&mut session, 1);
    assert!(session.poll_health().unwrap().crashed.is_empty());
}

#[test]
fn removing_an_unsavable_plugin_needs_confirmation() {
    let mut session = session(64);
    let track = session
        .submit(CreateTrack::new(TrackKind::Audio, "Keys"))
        .unwrap()
        .track()
        .unwrap();
    let plugin = session
        .submit(AddPlugin::new(track, SlotKind::Insert, 0, common::opaque_descriptor()))
        .unwrap()
        .plugin()
        .unwrap();
    assert_eq!(session.history().len(), 2);

    let err = session.submit(RemovePlugin::new(plugin)).unwrap_err();
    assert!(matches!(err, EngineError::Action(ActionError::ConfirmationRequired(_))));
    assert!(session.project().plugins().any(|(_, slot)| slot.id == plugin));
    assert_eq!(session.history().len(), 2);

    let applied = session.submit_confirmed(RemovePlugin::new(plugin)).unwrap();
    assert!(applied.history_cleared);
    assert!(session.history().is_empty());
    assert!(!session.project().plugins().any(|(_, slot)| slot.id == plugin));
    assert_eq!(session.plugin_state(plugin), None);
    assert!(session.undo().unwrap().is_none());
}

#[test]
fn removing_a_savable_plugin_is_undoable() {
    let mut session = session(64);
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

    let applied = session.submit(RemovePlugin::new(plugin)).unwrap();
    assert!(!applied.history_cleared);
    assert_eq!(session.plugin_state(plugin), None);

    session.undo().unwrap().unwrap();
    assert_eq!(session.plugin_state(plugin), Some(PluginState::Active));
    let info = session.graph_info().unwrap();
    assert!(info.nodes.iter().any(|node| node.key == NodeRef::Plugin(plugin).key()));
}

#[test]
fn a_second_backend_start_is_refused() {
    let mut session = session(64);
    session.start_backend().unwrap();
    assert!(session.backend_running());
    assert!(matches!(session.start_backend(), Err(EngineError::BackendRunning)));
    let waited = std::time::Instant::now();
    while session.latency().1.output == 0 && waited.elapsed() < std::time::Duration::from_secs(2) {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    // Reported by the dummy device with each period.
    assert_eq!(session.latency().1.output, 64);
    let mut output = vec![0.0; 128];
    assert!(matches!(session.render(&mut output, 64), Err(EngineError::BackendRunning)));
    session.stop_backend().unwrap();
    assert!(!session.backend_running());
    session.close().unwrap();
}
