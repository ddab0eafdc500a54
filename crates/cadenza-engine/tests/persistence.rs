mod common;

use std::fs;

use cadenza_engine::actions::{AddPlugin, AddRegion, CreateTrack, EditTransport};
use cadenza_engine::model::{ParamAddress, Region, SlotKind};
use cadenza_engine::{
    load_project, EngineError, PersistenceError, RegionId, Session, TempoEvent, TrackKind,
    VersionedMigrationError,
};
use cadenza_plugin_host::{builtin, PluginState};
use tempfile::TempDir;

#[test]
fn a_saved_session_reopens_with_the_same_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("song.cadenza.json");

    let mut session = Session::open(common::config(64)).unwrap();
    let track = session
        .submit(CreateTrack::new(TrackKind::Instrument, "Synth"))
        .unwrap()
        .track()
        .unwrap();
    let plugin = session
        .submit(AddPlugin::new(track, SlotKind::Instrument, 0, builtin::sine_descriptor()))
        .unwrap()
        .plugin()
        .unwrap();
    session
        .submit(AddRegion::new(track, 0, Region::midi(RegionId(0), 0, 4_800)))
        .unwrap();
    session.submit(EditTransport::tempo(98.0)).unwrap();
    session
        .submit(EditTransport::tempo_event(TempoEvent::linear(3_840, 98.0)))
        .unwrap();
    session
        .submit(EditTransport::tempo_event(TempoEvent::constant(7_680, 140.0)))
        .unwrap();
    session.set_param(ParamAddress::plugin(plugin, 0), 0.75).unwrap();
    session.locate(1_234);
    session.save(&path).unwrap();
    let saved = session.project().clone();
    session.close().unwrap();

    let reopened = Session::open_project(common::config(64), &path).unwrap();
    assert_eq!(reopened.project().tracks, saved.tracks);
    assert_eq!(reopened.project().transport, saved.transport);
    assert_eq!(reopened.project().transport.tempo.tempo_events().len(), 3);
    assert_eq!(reopened.project().transport.playhead, 1_234);
    assert_eq!(reopened.transport().playhead, 1_234);
    assert_eq!(reopened.plugin_state(plugin), Some(PluginState::Active));
    assert!(reopened.history().is_empty());

    let slot = reopened
        .project()
        .plugins()
        .find(|(_, slot)| slot.id == plugin)
        .map(|(_, slot)| slot.clone())
        .unwrap();
    assert_eq!(slot.params[0], 0.75);
    assert!(slot.state.is_some());
}

#[test]
fn ids_continue_after_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ids.json");
    let mut session = Session::open(common::config(64)).unwrap();
    let first = session
        .submit(CreateTrack::new(TrackKind::Audio, "One"))
        .unwrap()
        .track()
        .unwrap();
    session.undo().unwrap();
    session.save(&path).unwrap();

    session.load(&path).unwrap();
    let second = session
        .submit(CreateTrack::new(TrackKind::Audio, "Two"))
        .unwrap()
        .track()
        .unwrap();
    assert!(second.0 > first.0);
}

#[test]
fn foreign_versions_are_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("future.json");
    let mut session = Session::open(common::config(64)).unwrap();
    session.save(&path).unwrap();

    let mut document: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    document["version"] = serde_json::Value::from(99);
    fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();

    assert!(matches!(
        load_project(&path),
        Err(PersistenceError::Migration(VersionedMigrationError::UnsupportedVersion { found: 99, .. }))
    ));
    assert!(matches!(
        session.load(&path),
        Err(EngineError::Persistence(PersistenceError::Migration(_)))
    ));
    assert_eq!(session.tracks().len(), 1);
}

#[test]
fn garbage_is_malformed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.json");
    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        load_project(&path),
        Err(PersistenceError::Migration(VersionedMigrationError::Malformed(_)))
    ));
}
