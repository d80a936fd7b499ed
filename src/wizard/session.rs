use crate::errors::{EngineError, FieldErrors};
use crate::models::Photo;
use crate::wizard::draft::{DraftPatch, DraftStore, WizardDraft, primary_photo};
use crate::wizard::steps::{Flow, Step, validate_step, validate_submission};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum WizardAction {
    Next,
    Back,
    Patch(DraftPatch),
    /// Jump to an already visited step.
    Goto(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Transition {
    Advanced { from: usize, to: usize },
    Retreated { from: usize, to: usize },
    Blocked { step: usize, errors: FieldErrors },
    Patched { fields: Vec<&'static str> },
    Stayed { step: usize },
}

/// `{current_step, draft, errors}` driven by [`WizardSession::apply`].
#[derive(Debug, Clone)]
pub struct WizardSession {
    pub id: Uuid,
    flow: Flow,
    current_step: usize,
    furthest_step: usize,
    store: DraftStore,
    errors: FieldErrors,
    uploading: bool,
}

/// Owned copy of the session state handed back to API callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub flow: Flow,
    pub current_step: usize,
    pub step: Option<Step>,
    pub total_steps: usize,
    pub furthest_step: usize,
    pub uploading: bool,
    pub errors: FieldErrors,
    pub primary_photo: Option<Photo>,
    pub draft: WizardDraft,
}

impl WizardSession {
    pub fn new(flow: Flow, store: DraftStore) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow,
            current_step: 1,
            furthest_step: 1,
            store,
            errors: FieldErrors::new(),
            uploading: false,
        }
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn step(&self) -> Option<Step> {
        self.flow.step_at(self.current_step)
    }

    pub fn draft(&self) -> &WizardDraft {
        self.store.draft()
    }

    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    pub fn store_mut(&mut self) -> &mut DraftStore {
        &mut self.store
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    pub fn set_uploading(&mut self, uploading: bool) {
        self.uploading = uploading;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            flow: self.flow,
            current_step: self.current_step,
            step: self.step(),
            total_steps: self.flow.step_count(),
            furthest_step: self.furthest_step,
            uploading: self.uploading,
            errors: self.errors.clone(),
            primary_photo: primary_photo(self.store.draft()).cloned(),
            draft: self.store.draft().clone(),
        }
    }

    pub fn apply(&mut self, action: WizardAction) -> Transition {
        let transition = match action {
            WizardAction::Next => self.next(),
            WizardAction::Back => self.back(),
            WizardAction::Patch(patch) => {
                let fields = self.store.patch(patch);
                for field in &fields {
                    self.errors.remove(field);
                }
                Transition::Patched { fields }
            }
            WizardAction::Goto(target) => self.goto(target),
        };
        debug!(target: "rehoming.wizard", session = %self.id, ?transition, "applied wizard action");
        transition
    }

    fn next(&mut self) -> Transition {
        let from = self.current_step;
        let Some(step) = self.step() else {
            return Transition::Stayed { step: from };
        };
        let errors = validate_step(self.flow, step, self.store.draft());
        if !errors.is_empty() {
            self.errors = errors.clone();
            return Transition::Blocked { step: from, errors };
        }
        self.errors = FieldErrors::new();
        if from >= self.flow.step_count() {
            return Transition::Stayed { step: from };
        }
        self.current_step = from + 1;
        self.furthest_step = self.furthest_step.max(self.current_step);
        Transition::Advanced {
            from,
            to: self.current_step,
        }
    }

    fn back(&mut self) -> Transition {
        let from = self.current_step;
        self.errors = FieldErrors::new();
        if from <= 1 {
            return Transition::Stayed { step: from };
        }
        self.current_step = from - 1;
        Transition::Retreated {
            from,
            to: self.current_step,
        }
    }

    fn goto(&mut self, target: usize) -> Transition {
        let from = self.current_step;
        if target == 0 || target > self.furthest_step || target == from {
            return Transition::Stayed { step: from };
        }
        if target < from {
            self.errors = FieldErrors::new();
            self.current_step = target;
            return Transition::Retreated { from, to: target };
        }
        // Forward jumps re-check every step in between.
        for number in from..target {
            if let Some(step) = self.flow.step_at(number) {
                let errors = validate_step(self.flow, step, self.store.draft());
                if !errors.is_empty() {
                    self.current_step = number;
                    self.errors = errors.clone();
                    return Transition::Blocked {
                        step: number,
                        errors,
                    };
                }
            }
        }
        self.errors = FieldErrors::new();
        self.current_step = target;
        Transition::Advanced { from, to: target }
    }

    /// Submission is only reachable from the last step with every gate green.
    pub fn ready_for_submission(&mut self) -> Result<(), EngineError> {
        if self.current_step != self.flow.step_count() {
            return Err(EngineError::TransitionRejected(format!(
                "wizard is on step {} of {}",
                self.current_step,
                self.flow.step_count()
            )));
        }
        let errors = validate_submission(self.flow, self.store.draft());
        self.errors = errors.clone();
        errors.into_result()
    }
}
