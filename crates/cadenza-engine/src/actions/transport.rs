use std::any::Any;

use super::{Action, ActionContext, ActionOutcome, Effects};
use crate::error::{ActionError, TransportError};
use crate::transport::{validate_bpm, TempoEvent, TimeSignature};

/// A persisted transport setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportEdit {
    /// Bpm of the event at tick 0.
    Tempo(f64),
    /// Meter from tick 0.
    TimeSignature(TimeSignature),
    SetTempoEvent(TempoEvent),
    RemoveTempoEvent(u64),
    SetSignature(u64, TimeSignature),
    RemoveSignature(u64),
    LoopRange(u64, u64),
    PunchRange(u64, u64),
    LoopEnabled(bool),
    PunchEnabled(bool),
    PrerollBars(u32),
}

/// Changes tempo, meter, loop or punch settings. Playback state is not
/// part of the history; see [`crate::Session::play`] and friends.
pub struct EditTransport {
    edit: TransportEdit,
}

impl EditTransport {
    pub fn new(edit: TransportEdit) -> Self {
        Self { edit }
    }

    pub fn tempo(bpm: f64) -> Self {
        Self::new(TransportEdit::Tempo(bpm))
    }

    pub fn time_signature(numerator: u8, denominator: u8) -> Result<Self, TransportError> {
        Ok(Self::new(TransportEdit::TimeSignature(TimeSignature::new(
            numerator,
            denominator,
        )?)))
    }

    /// Adds a tempo event or replaces the one at the same tick.
    pub fn tempo_event(event: TempoEvent) -> Self {
        Self::new(TransportEdit::SetTempoEvent(event))
    }

    pub fn remove_tempo_event(tick: u64) -> Self {
        Self::new(TransportEdit::RemoveTempoEvent(tick))
    }

    pub fn signature_at(tick: u64, numerator: u8, denominator: u8) -> Result<Self, TransportError> {
        Ok(Self::new(TransportEdit::SetSignature(
            tick,
            TimeSignature::new(numerator, denominator)?,
        )))
    }

    pub fn remove_signature(tick: u64) -> Self {
        Self::new(TransportEdit::RemoveSignature(tick))
    }

    pub fn loop_range(start: u64, end: u64) -> Self {
        Self::new(TransportEdit::LoopRange(start, end))
    }

    pub fn edit(&self) -> TransportEdit {
        self.edit
    }
}

impl Action for EditTransport {
    fn describe(&self) -> String {
        match self.edit {
            TransportEdit::Tempo(bpm) => format!("Set tempo to {bpm} bpm"),
            TransportEdit::TimeSignature(sig) => {
                format!("Set time signature to {}/{}", sig.numerator, sig.denominator)
            }
            TransportEdit::SetTempoEvent(event) => {
                format!("Set tempo to {} bpm at tick {}", event.bpm, event.tick)
            }
            TransportEdit::RemoveTempoEvent(_) => "Remove tempo change".to_owned(),
            TransportEdit::SetSignature(tick, sig) => {
                format!("Set time signature to {}/{} at tick {tick}", sig.numerator, sig.denominator)
            }
            TransportEdit::RemoveSignature(_) => "Remove time signature change".to_owned(),
            TransportEdit::LoopRange(..) => "Set loop range".to_owned(),
            TransportEdit::PunchRange(..) => "Set punch range".to_owned(),
            TransportEdit::LoopEnabled(true) => "Enable loop".to_owned(),
            TransportEdit::LoopEnabled(false) => "Disable loop".to_owned(),
            TransportEdit::PunchEnabled(true) => "Enable punch".to_owned(),
            TransportEdit::PunchEnabled(false) => "Disable punch".to_owned(),
            TransportEdit::PrerollBars(bars) => format!("Set pre-roll to {bars} bar(s)"),
        }
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let settings = &mut ctx.project.transport;
        let previous = match self.edit {
            TransportEdit::Tempo(bpm) => {
                let first = settings.tempo.initial_tempo();
                settings.tempo.set_tempo(TempoEvent {
                    bpm: validate_bpm(bpm)?,
                    ..first
                })?;
                TransportEdit::Tempo(first.bpm)
            }
            TransportEdit::TimeSignature(sig) => {
                let previous = settings.tempo.initial_signature();
                settings.tempo.set_signature(0, sig)?;
                TransportEdit::TimeSignature(previous)
            }
            TransportEdit::SetTempoEvent(event) => match settings.tempo.set_tempo(event)? {
                Some(replaced) => TransportEdit::SetTempoEvent(replaced),
                None => TransportEdit::RemoveTempoEvent(event.tick),
            },
            TransportEdit::RemoveTempoEvent(tick) => {
                TransportEdit::SetTempoEvent(settings.tempo.remove_tempo(tick)?)
            }
            TransportEdit::SetSignature(tick, sig) => match settings.tempo.set_signature(tick, sig)? {
                Some(replaced) => TransportEdit::SetSignature(tick, replaced),
                None => TransportEdit::RemoveSignature(tick),
            },
            TransportEdit::RemoveSignature(tick) => {
                TransportEdit::SetSignature(tick, settings.tempo.remove_signature(tick)?)
            }
            TransportEdit::LoopRange(start, end) => {
                let previous = TransportEdit::LoopRange(settings.loop_start, settings.loop_end);
                settings.set_loop_range(start, end)?;
                previous
            }
            TransportEdit::PunchRange(start, end) => {
                let previous = TransportEdit::PunchRange(settings.punch_start, settings.punch_end);
                settings.set_punch_range(start, end)?;
                previous
            }
            TransportEdit::LoopEnabled(on) => {
                TransportEdit::LoopEnabled(std::mem::replace(&mut settings.loop_enabled, on))
            }
            TransportEdit::PunchEnabled(on) => {
                TransportEdit::PunchEnabled(std::mem::replace(&mut settings.punch_enabled, on))
            }
            TransportEdit::PrerollBars(bars) => {
                TransportEdit::PrerollBars(std::mem::replace(&mut settings.preroll_bars, bars))
            }
        };
        Ok(ActionOutcome::new(EditTransport::new(previous), Effects::transport()))
    }

    /// Tempo drags, including dragging one tempo event, and range drags
    /// collapse into one entry.
    fn should_merge(&self, previous: &dyn Action) -> bool {
        let Some(previous) = previous.as_any().downcast_ref::<EditTransport>() else {
            return false;
        };
        matches!(
            (self.edit, previous.edit),
            (TransportEdit::Tempo(_), TransportEdit::Tempo(_))
                | (TransportEdit::LoopRange(..), TransportEdit::LoopRange(..))
                | (TransportEdit::PunchRange(..), TransportEdit::PunchRange(..))
        ) || matches!(
            (self.edit, previous.edit),
            (TransportEdit::SetTempoEvent(a), TransportEdit::SetTempoEvent(b)) if a.tick == b.tick
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::run;
    use crate::actions::UndoStack;
    use crate::actions::{ActionContext, NoPlugins};
    use crate::model::ProjectState;

    #[test]
    fn invalid_values_are_rejected() {
        let mut project = ProjectState::new("p", 48_000);
        let before = project.clone();
        assert!(matches!(
            run(&mut project, &EditTransport::tempo(0.0)),
            Err(ActionError::Transport(TransportError::InvalidTempo(_)))
        ));
        assert!(run(&mut project, &EditTransport::loop_range(100, 100)).is_err());
        assert!(EditTransport::time_signature(7, 3).is_err());
        assert_eq!(project, before);
    }

    #[test]
    fn tempo_drag_is_one_undo_step() {
        let mut project = ProjectState::new("p", 48_000);
        let mut history = UndoStack::default();
        for bpm in [100.0, 110.0, 128.0] {
            let mut ctx = ActionContext::new(&mut project, &NoPlugins);
            history.submit(Box::new(EditTransport::tempo(bpm)), &mut ctx, false).unwrap();
        }
        assert_eq!(project.transport.tempo.initial_tempo().bpm, 128.0);
        assert_eq!(history.len(), 1);
        let mut ctx = ActionContext::new(&mut project, &NoPlugins);
        history.undo(&mut ctx).unwrap();
        assert_eq!(project.transport.tempo.initial_tempo().bpm, 120.0);
    }

    #[test]
    fn loop_range_inverse_restores_both_ends() {
        let mut project = ProjectState::new("p", 48_000);
        let (start, end) = (project.transport.loop_start, project.transport.loop_end);
        let outcome = run(&mut project, &EditTransport::loop_range(10, 20)).unwrap();
        assert_eq!((project.transport.loop_start, project.transport.loop_end), (10, 20));
        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!((project.transport.loop_start, project.transport.loop_end), (start, end));
    }

    #[test]
    fn tempo_event_is_removed_on_undo() {
        let mut project = ProjectState::new("p", 48_000);
        let before = project.clone();
        let ramp = TempoEvent::linear(3_840, 90.0);
        let outcome = run(&mut project, &EditTransport::tempo_event(ramp)).unwrap();
        assert_eq!(project.transport.tempo.tempo_events().len(), 2);
        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project, before);

        assert!(matches!(
            run(&mut project, &EditTransport::remove_tempo_event(0)),
            Err(ActionError::Transport(TransportError::FirstEventFixed))
        ));
        assert_eq!(project, before);
    }

    #[test]
    fn replaced_tempo_event_comes_back_on_undo() {
        let mut project = ProjectState::new("p", 48_000);
        run(&mut project, &EditTransport::tempo_event(TempoEvent::constant(960, 100.0))).unwrap();
        let with_event = project.clone();
        let outcome = run(&mut project, &EditTransport::tempo_event(TempoEvent::linear(960, 140.0))).unwrap();
        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project, with_event);

        let outcome = run(&mut project, &EditTransport::remove_tempo_event(960)).unwrap();
        assert_eq!(project.transport.tempo.tempo_events().len(), 1);
        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project, with_event);
    }

    #[test]
    fn meter_change_round_trips_through_undo() {
        let mut project = ProjectState::new("p", 48_000);
        let before = project.clone();
        let outcome = run(&mut project, &EditTransport::signature_at(7_680, 3, 4).unwrap()).unwrap();
        assert_eq!(project.transport.to_musical(384_000, 48_000).bar, 5);
        // Not on a bar line of the 3/4 section.
        assert!(matches!(
            run(&mut project, &EditTransport::signature_at(7_680 + 960, 4, 4).unwrap()),
            Err(ActionError::Transport(TransportError::OffBarLine { .. }))
        ));
        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project, before);
    }
}
