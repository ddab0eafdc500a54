mod common;

use cadenza_engine::actions::{CreateTrack, DeleteTrack, EditTransport, SetTrackProperty, TrackProperty};
use cadenza_engine::{Action, ProjectState, Session, Track, TrackKind, TransportSettings};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Edit {
    Create(u8),
    Rename(usize, String),
    Mute(usize, bool),
    Delete(usize),
    Tempo(f64),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0u8..4).prop_map(Edit::Create),
        (any::<usize>(), "[a-z]{1,8}").prop_map(|(at, name)| Edit::Rename(at, name)),
        (any::<usize>(), any::<bool>()).prop_map(|(at, on)| Edit::Mute(at, on)),
        any::<usize>().prop_map(Edit::Delete),
        (40.0f64..240.0).prop_map(Edit::Tempo),
    ]
}

/// The action for `edit` against the current track list. Edits that need a
/// non-master track are skipped while there is none.
fn action(edit: &Edit, tracks: &[Track]) -> Option<Box<dyn Action>> {
    let pick = |at: usize| {
        let others = tracks.len().saturating_sub(1);
        (others > 0).then(|| tracks[1 + at % others].id)
    };
    Some(match edit {
        Edit::Create(kind) => {
            let kind = [TrackKind::Audio, TrackKind::Midi, TrackKind::Bus, TrackKind::Instrument][usize::from(*kind)];
            Box::new(CreateTrack::new(kind, format!("{kind:?}")))
        }
        Edit::Rename(at, name) => Box::new(SetTrackProperty::new(pick(*at)?, TrackProperty::Name(name.clone()))),
        Edit::Mute(at, on) => Box::new(SetTrackProperty::new(pick(*at)?, TrackProperty::Muted(*on))),
        Edit::Delete(at) => Box::new(DeleteTrack::new(pick(*at)?)),
        Edit::Tempo(bpm) => Box::new(EditTransport::tempo(*bpm)),
    })
}

fn snapshot(project: &ProjectState) -> (Vec<Track>, TransportSettings) {
    (project.tracks.clone(), project.transport.clone())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn undo_all_then_redo_all_round_trips(edits in prop::collection::vec(edit(), 1..24)) {
        let mut session = Session::open(common::config(64)).unwrap();
        let initial = snapshot(session.project());
        let mut states = vec![initial.clone()];
        for edit in &edits {
            let Some(action) = action(edit, session.tracks()) else { continue };
            let recorded = session.history().len();
            if session.submit_boxed(action, false).is_err() {
                continue;
            }
            if session.history().len() > recorded {
                states.push(snapshot(session.project()));
            } else if let Some(merged) = states.last_mut().filter(|_| recorded > 0) {
                // Folded into the previous entry, e.g. consecutive tempo edits.
                *merged = snapshot(session.project());
            }
        }
        let applied = session.history().len();
        prop_assert_eq!(applied, states.len() - 1);
        let last = states.last().cloned().unwrap();

        for expected in states.iter().rev().skip(1) {
            prop_assert!(session.undo().unwrap().is_some());
            prop_assert_eq!(&snapshot(session.project()), expected);
        }
        prop_assert!(session.undo().unwrap().is_none());
        prop_assert_eq!(snapshot(session.project()), initial);

        for expected in states.iter().skip(1) {
            prop_assert!(session.redo().unwrap().is_some());
            prop_assert_eq!(&snapshot(session.project()), expected);
        }
        prop_assert!(session.redo().unwrap().is_none());
        prop_assert_eq!(snapshot(session.project()), last);
        prop_assert!(session.project().ensure_invariants().is_ok());
    }

    #[test]
    fn a_new_edit_after_undo_drops_the_redo_branch(count in 2usize..8) {
        let mut session = Session::open(common::config(64)).unwrap();
        for index in 0..count {
            session.submit(CreateTrack::new(TrackKind::Audio, format!("T{index}"))).unwrap();
        }
        session.undo().unwrap();
        prop_assert!(session.history().can_redo());
        session.submit(EditTransport::tempo(100.0)).unwrap();
        prop_assert!(!session.history().can_redo());
        prop_assert_eq!(session.history().len(), count);
    }
}

#[test]
fn consecutive_tempo_edits_undo_as_one() {
    let mut session = Session::open(common::config(64)).unwrap();
    let initial = snapshot(session.project());
    session.submit(EditTransport::tempo(40.0)).unwrap();
    session.submit(EditTransport::tempo(40.0)).unwrap();
    session.submit(EditTransport::tempo(90.0)).unwrap();
    assert_eq!(session.history().len(), 1);
    assert!(session.undo().unwrap().is_some());
    assert_eq!(snapshot(session.project()), initial);
    assert!(session.redo().unwrap().is_some());
    assert_eq!(session.project().transport.tempo.initial_tempo().bpm, 90.0);
}
