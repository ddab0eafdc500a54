use std::collections::VecDeque;

use super::{Action, ActionContext, ActionOutcome, Effects, Reversibility};
use crate::error::ActionError;
use crate::ids::{ObjectId, PluginId, RegionId, SendId, TrackId};

struct HistoryEntry {
    description: String,
    action: Box<dyn Action>,
    inverse: Box<dyn Action>,
}

/// Result of a successfully applied, undone or redone action.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub description: String,
    pub effects: Effects,
    pub created: Vec<ObjectId>,
    pub history_cleared: bool,
}

impl Applied {
    fn new(description: String, outcome: &ActionOutcome) -> Self {
        Self {
            description,
            effects: outcome.effects,
            created: outcome.created.clone(),
            history_cleared: false,
        }
    }

    pub fn track(&self) -> Option<TrackId> {
        self.created.iter().find_map(|id| match id {
            ObjectId::Track(id) => Some(*id),
            _ => None,
        })
    }

    pub fn region(&self) -> Option<RegionId> {
        self.created.iter().find_map(|id| match id {
            ObjectId::Region(id) => Some(*id),
            _ => None,
        })
    }

    pub fn plugin(&self) -> Option<PluginId> {
        self.created.iter().find_map(|id| match id {
            ObjectId::Plugin(id) => Some(*id),
            _ => None,
        })
    }

    pub fn send(&self) -> Option<SendId> {
        self.created.iter().find_map(|id| match id {
            ObjectId::Send(id) => Some(*id),
            _ => None,
        })
    }
}

/// What the latest submit replaced, kept until the next history change so
/// [`UndoStack::rollback`] can put it back.
struct Checkpoint {
    description: String,
    /// Inverse of the submitted action when it was not recorded.
    inverse: Option<Box<dyn Action>>,
    merged: Option<(HistoryEntry, Box<dyn Action>)>,
    /// Entries dropped from the front of the undo side, oldest first.
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
}

/// Linear undo history.
pub struct UndoStack {
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    max_depth: Option<usize>,
    checkpoint: Option<Checkpoint>,
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(None)
    }
}

impl UndoStack {
    /// `None` keeps every entry.
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            max_depth,
            checkpoint: None,
        }
    }

    pub fn len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.undo.back().map(|entry| entry.description.as_str())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.redo.last().map(|entry| entry.description.as_str())
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.checkpoint = None;
    }

    /// Performs `action` and records it. History-clearing actions are
    /// refused unless `confirmed`; once performed they empty the history
    /// instead of being recorded.
    pub fn submit(
        &mut self,
        action: Box<dyn Action>,
        ctx: &mut ActionContext<'_>,
        confirmed: bool,
    ) -> Result<Applied, ActionError> {
        self.checkpoint = None;
        let description = action.describe();
        let reversibility = action.reversibility(ctx.project, ctx.plugins);
        if reversibility == Reversibility::HistoryClearing && !confirmed {
            return Err(ActionError::ConfirmationRequired(description));
        }

        let merging = reversibility == Reversibility::FullyReversible
            && self
                .undo
                .back()
                .is_some_and(|entry| action.should_merge(&*entry.action));
        let mut merged_effects = Effects::NONE;
        let mut merged: Option<(HistoryEntry, Box<dyn Action>)> = None;
        if merging {
            if let Some(entry) = self.undo.pop_back() {
                match entry.inverse.perform(ctx) {
                    Ok(revert) => {
                        merged_effects = revert.effects;
                        merged = Some((entry, revert.inverse));
                    }
                    Err(err) => {
                        self.undo.push_back(entry);
                        return Err(err);
                    }
                }
            }
        }

        let outcome = match action.perform(ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.restore_merged(merged, ctx);
                return Err(err);
            }
        };
        if let Err(err) = ctx.project.ensure_invariants() {
            outcome.inverse.perform(ctx)?;
            self.restore_merged(merged, ctx);
            return Err(err);
        }

        let mut applied = Applied::new(description.clone(), &outcome);
        applied.effects = applied.effects | merged_effects;
        if reversibility == Reversibility::HistoryClearing {
            tracing::warn!(action = %description, dropped = self.undo.len(), "undo history cleared");
            self.checkpoint = Some(Checkpoint {
                description,
                inverse: Some(outcome.inverse),
                merged,
                undo: std::mem::take(&mut self.undo),
                redo: std::mem::take(&mut self.redo),
            });
            applied.history_cleared = true;
            return Ok(applied);
        }

        let recorded = match &merged {
            Some((entry, _)) => entry.description.clone(),
            None => description.clone(),
        };
        self.undo.push_back(HistoryEntry {
            description: recorded,
            action,
            inverse: outcome.inverse,
        });
        let mut trimmed = VecDeque::new();
        if let Some(max) = self.max_depth {
            while self.undo.len() > max {
                if let Some(entry) = self.undo.pop_front() {
                    trimmed.push_back(entry);
                }
            }
        }
        self.checkpoint = Some(Checkpoint {
            description,
            inverse: None,
            merged,
            undo: trimmed,
            redo: std::mem::take(&mut self.redo),
        });
        Ok(applied)
    }

    /// Reverts the latest submit, history included, as if it never
    /// happened. Used when the caller cannot apply the edited project.
    /// Returns `None` when there is no submit to revert.
    pub fn rollback(&mut self, ctx: &mut ActionContext<'_>) -> Result<Option<Applied>, ActionError> {
        let Some(checkpoint) = self.checkpoint.take() else {
            return Ok(None);
        };
        let Checkpoint {
            description,
            inverse,
            merged,
            undo,
            redo,
        } = checkpoint;
        let mut undo = undo;
        let inverse = match inverse {
            Some(inverse) => inverse,
            // With a zero depth limit the entry was trimmed right away.
            None => match self.undo.pop_back().or_else(|| undo.pop_back()) {
                Some(entry) => entry.inverse,
                None => return Ok(None),
            },
        };
        let outcome = inverse.perform(ctx)?;
        let mut applied = Applied::new(description, &outcome);
        applied.effects = applied.effects | self.restore_merged(merged, ctx);
        for entry in undo.into_iter().rev() {
            self.undo.push_front(entry);
        }
        self.redo = redo;
        Ok(Some(applied))
    }

    /// Re-applies the entry a failed merge had reverted.
    fn restore_merged(
        &mut self,
        merged: Option<(HistoryEntry, Box<dyn Action>)>,
        ctx: &mut ActionContext<'_>,
    ) -> Effects {
        let Some((entry, redo)) = merged else {
            return Effects::NONE;
        };
        match redo.perform(ctx) {
            Ok(outcome) => {
                self.undo.push_back(HistoryEntry {
                    description: entry.description,
                    action: entry.action,
                    inverse: outcome.inverse,
                });
                outcome.effects
            }
            Err(err) => {
                tracing::error!(%err, action = %entry.description, "could not restore merged edit");
                Effects::NONE
            }
        }
    }

    pub fn undo(&mut self, ctx: &mut ActionContext<'_>) -> Result<Option<Applied>, ActionError> {
        self.checkpoint = None;
        let Some(entry) = self.undo.pop_back() else {
            return Ok(None);
        };
        let outcome = match entry.inverse.perform(ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.undo.push_back(entry);
                return Err(err);
            }
        };
        let applied = Applied::new(entry.description.clone(), &outcome);
        self.redo.push(HistoryEntry {
            description: entry.description,
            action: outcome.inverse,
            inverse: entry.inverse,
        });
        Ok(Some(applied))
    }

    pub fn redo(&mut self, ctx: &mut ActionContext<'_>) -> Result<Option<Applied>, ActionError> {
        self.checkpoint = None;
        let Some(entry) = self.redo.pop() else {
            return Ok(None);
        };
        let outcome = match entry.action.perform(ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.redo.push(entry);
                return Err(err);
            }
        };
        if let Err(err) = ctx.project.ensure_invariants() {
            outcome.inverse.perform(ctx)?;
            self.redo.push(entry);
            return Err(err);
        }
        let applied = Applied::new(entry.description.clone(), &outcome);
        self.undo.push_back(HistoryEntry {
            description: entry.description,
            action: entry.action,
            inverse: outcome.inverse,
        });
        Ok(Some(applied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::FakePlugins;
    use crate::actions::{
        CreateTrack, NoPlugins, SavedPlugin, SetControlValue, SetTrackProperty, TrackProperty,
    };
    use crate::actions::{AddPlugin, DeleteTrack, RemovePlugin};
    use crate::model::{ParamAddress, ProjectState, SlotKind, TrackKind};
    use cadenza_plugin_host::builtin;

    fn submit(stack: &mut UndoStack, project: &mut ProjectState, action: impl Action) -> Applied {
        let mut ctx = ActionContext::new(project, &NoPlugins);
        stack.submit(Box::new(action), &mut ctx, false).unwrap()
    }

    fn undo(stack: &mut UndoStack, project: &mut ProjectState) -> Option<Applied> {
        let mut ctx = ActionContext::new(project, &NoPlugins);
        stack.undo(&mut ctx).unwrap()
    }

    fn redo(stack: &mut UndoStack, project: &mut ProjectState) -> Option<Applied> {
        let mut ctx = ActionContext::new(project, &NoPlugins);
        stack.redo(&mut ctx).unwrap()
    }

    #[test]
    fn undo_then_redo_restores_the_track() {
        let mut project = ProjectState::new("stack", 48_000);
        let mut stack = UndoStack::default();
        let track = submit(&mut stack, &mut project, CreateTrack::new(TrackKind::Audio, "Vox"))
            .track()
            .unwrap();
        let after = project.clone();

        assert!(undo(&mut stack, &mut project).is_some());
        assert!(project.track(track).is_none());
        assert!(redo(&mut stack, &mut project).is_some());
        assert_eq!(project, after);
        assert!(redo(&mut stack, &mut project).is_none());
    }

    #[test]
    fn new_action_discards_the_redo_branch() {
        let mut project = ProjectState::new("stack", 48_000);
        let mut stack = UndoStack::default();
        let track = submit(&mut stack, &mut project, CreateTrack::new(TrackKind::Audio, "A"))
            .track()
            .unwrap();
        submit(&mut stack, &mut project, SetTrackProperty::new(track, TrackProperty::Muted(true)));
        undo(&mut stack, &mut project);
        assert!(stack.can_redo());
        submit(&mut stack, &mut project, SetTrackProperty::new(track, TrackProperty::Soloed(true)));
        assert!(!stack.can_redo());
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn control_writes_on_one_port_merge() {
        let mut project = ProjectState::new("stack", 48_000);
        let mut stack = UndoStack::default();
        let track = submit(&mut stack, &mut project, CreateTrack::new(TrackKind::Audio, "A"))
            .track()
            .unwrap();
        let amp = ParamAddress::amp(track);
        for value in [0.2, 0.4, 0.6] {
            submit(&mut stack, &mut project, SetControlValue::new(amp, value));
        }
        assert_eq!(stack.len(), 2);
        assert_eq!(project.param_value(amp), Some(0.6));
        undo(&mut stack, &mut project);
        assert_eq!(project.param_value(amp), Some(1.0));
    }

    #[test]
    fn rollback_restores_the_merged_entry_and_redo_branch() {
        let mut project = ProjectState::new("stack", 48_000);
        let mut stack = UndoStack::default();
        let track = submit(&mut stack, &mut project, CreateTrack::new(TrackKind::Audio, "A"))
            .track()
            .unwrap();
        submit(&mut stack, &mut project, SetTrackProperty::new(track, TrackProperty::Muted(true)));
        undo(&mut stack, &mut project);
        let amp = ParamAddress::amp(track);
        submit(&mut stack, &mut project, SetControlValue::new(amp, 0.2));
        submit(&mut stack, &mut project, SetControlValue::new(amp, 0.4));
        assert_eq!(stack.len(), 2);

        let mut ctx = ActionContext::new(&mut project, &NoPlugins);
        let reverted = stack.rollback(&mut ctx).unwrap().unwrap();
        assert!(reverted.effects.params);
        assert!(stack.rollback(&mut ctx).unwrap().is_none());
        assert_eq!(project.param_value(amp), Some(0.2));
        assert_eq!(stack.len(), 2);
        assert!(!stack.can_redo());

        undo(&mut stack, &mut project);
        assert_eq!(project.param_value(amp), Some(1.0));
    }

    #[test]
    fn rollback_of_the_first_write_brings_back_redo() {
        let mut project = ProjectState::new("stack", 48_000);
        let mut stack = UndoStack::default();
        let track = submit(&mut stack, &mut project, CreateTrack::new(TrackKind::Audio, "A"))
            .track()
            .unwrap();
        submit(&mut stack, &mut project, SetTrackProperty::new(track, TrackProperty::Muted(true)));
        undo(&mut stack, &mut project);
        let before = project.clone();
        submit(&mut stack, &mut project, SetTrackProperty::new(track, TrackProperty::Soloed(true)));
        assert!(!stack.can_redo());

        let mut ctx = ActionContext::new(&mut project, &NoPlugins);
        stack.rollback(&mut ctx).unwrap().unwrap();
        assert_eq!(project, before);
        assert_eq!(stack.len(), 1);
        assert!(stack.can_redo());
        redo(&mut stack, &mut project);
        assert!(project.track(track).unwrap().muted);
    }

    #[test]
    fn depth_limit_drops_the_oldest_entries() {
        let mut project = ProjectState::new("stack", 48_000);
        let mut stack = UndoStack::new(Some(2));
        for name in ["a", "b", "c"] {
            submit(&mut stack, &mut project, CreateTrack::new(TrackKind::Bus, name));
        }
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.undo_description(), Some("Create track \"c\""));
    }

    #[test]
    fn unsavable_plugin_removal_needs_confirmation() {
        let mut project = ProjectState::new("stack", 48_000);
        let mut stack = UndoStack::default();
        let track = submit(&mut stack, &mut project, CreateTrack::new(TrackKind::Audio, "A"))
            .track()
            .unwrap();
        let plugin = submit(
            &mut stack,
            &mut project,
            AddPlugin::new(track, SlotKind::Insert, 0, builtin::gain_descriptor()),
        )
        .plugin()
        .unwrap();

        let mut plugins = FakePlugins::default();
        plugins.states.insert(plugin, SavedPlugin::Unsavable);
        let mut ctx = ActionContext::new(&mut project, &plugins);
        let refused = stack.submit(Box::new(RemovePlugin::new(plugin)), &mut ctx, false);
        assert!(matches!(refused, Err(ActionError::ConfirmationRequired(_))));
        assert_eq!(stack.len(), 2);

        let applied = stack
            .submit(Box::new(RemovePlugin::new(plugin)), &mut ctx, true)
            .unwrap();
        assert!(applied.history_cleared);
        assert!(!stack.can_undo());
        assert!(project.plugin(plugin).is_none());
    }

    #[test]
    fn saved_plugin_state_survives_track_deletion() {
        let mut project = ProjectState::new("stack", 48_000);
        let mut stack = UndoStack::default();
        let track = submit(&mut stack, &mut project, CreateTrack::new(TrackKind::Audio, "A"))
            .track()
            .unwrap();
        let plugin = submit(
            &mut stack,
            &mut project,
            AddPlugin::new(track, SlotKind::Insert, 0, builtin::gain_descriptor()),
        )
        .plugin()
        .unwrap();
        let mut plugins = FakePlugins::default();
        plugins.states.insert(plugin, SavedPlugin::Saved(vec![1, 2, 3]));
        let mut ctx = ActionContext::new(&mut project, &plugins);
        stack
            .submit(Box::new(DeleteTrack::new(track)), &mut ctx, false)
            .unwrap();
        stack.undo(&mut ctx).unwrap();
        assert_eq!(project.plugin(plugin).unwrap().state.as_deref(), Some(&[1, 2, 3][..]));
    }
}
