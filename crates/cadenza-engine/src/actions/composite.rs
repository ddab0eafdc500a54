use std::any::Any;

use super::{Action, ActionContext, ActionOutcome, Effects, PluginStates, Reversibility};
use crate::error::ActionError;
use crate::model::ProjectState;

/// A batch of actions applied and reverted as one history entry.
pub struct CompositeAction {
    description: String,
    actions: Vec<Box<dyn Action>>,
}

impl CompositeAction {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            actions: Vec::new(),
        }
    }

    pub fn with(mut self, action: impl Action) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn push(&mut self, action: impl Action) {
        self.actions.push(Box::new(action));
    }

    pub fn push_boxed(&mut self, action: Box<dyn Action>) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Action for CompositeAction {
    fn describe(&self) -> String {
        self.description.clone()
    }

    /// Applies members in order. When one fails, the members already applied
    /// are reverted in reverse order before the error is returned.
    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let mut inverses: Vec<Box<dyn Action>> = Vec::with_capacity(self.actions.len());
        let mut effects = Effects::NONE;
        let mut created = Vec::new();
        for action in &self.actions {
            match action.perform(ctx) {
                Ok(outcome) => {
                    effects = effects | outcome.effects;
                    created.extend(outcome.created);
                    inverses.push(outcome.inverse);
                }
                Err(err) => {
                    for inverse in inverses.iter().rev() {
                        if let Err(rollback) = inverse.perform(ctx) {
                            tracing::error!(%rollback, batch = %self.description, "batch rollback failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        inverses.reverse();
        Ok(ActionOutcome {
            inverse: Box::new(CompositeAction {
                description: self.description.clone(),
                actions: inverses,
            }),
            effects,
            created,
        })
    }

    fn reversibility(&self, project: &ProjectState, plugins: &dyn PluginStates) -> Reversibility {
        if self
            .actions
            .iter()
            .any(|action| action.reversibility(project, plugins) == Reversibility::HistoryClearing)
        {
            Reversibility::HistoryClearing
        } else {
            Reversibility::FullyReversible
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::run;
    use crate::actions::{CreateTrack, SetTrackProperty, TrackProperty};
    use crate::ids::TrackId;
    use crate::model::TrackKind;

    #[test]
    fn failing_member_rolls_back_the_batch() {
        let mut project = ProjectState::new("batch", 48_000);
        let before = project.clone();
        let batch = CompositeAction::new("setup")
            .with(CreateTrack::new(TrackKind::Audio, "A"))
            .with(SetTrackProperty::new(TrackId(99), TrackProperty::Muted(true)));
        assert!(run(&mut project, &batch).is_err());
        assert_eq!(project.tracks, before.tracks);
    }

    #[test]
    fn inverse_reverts_every_member() {
        let mut project = ProjectState::new("batch", 48_000);
        let batch = CompositeAction::new("two tracks")
            .with(CreateTrack::new(TrackKind::Audio, "A"))
            .with(CreateTrack::new(TrackKind::Bus, "B"));
        let outcome = run(&mut project, &batch).unwrap();
        assert_eq!(project.tracks.len(), 3);
        assert_eq!(outcome.created.len(), 2);
        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project.tracks.len(), 1);
    }
}
