use crate::errors::FieldErrors;
use crate::models::Species;
use crate::wizard::draft::WizardDraft;
use serde::{Deserialize, Serialize};

pub const MIN_REASON_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Initial rehoming request.
    Request,
    /// Listing creation from a confirmed request, or edit of a live listing.
    Listing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Reason,
    Urgency,
    Basics,
    Location,
    Medical,
    Behavior,
    StoryMedia,
    IdealHome,
    Terms,
    Review,
}

const REQUEST_STEPS: [Step; 5] = [
    Step::Reason,
    Step::Urgency,
    Step::Location,
    Step::IdealHome,
    Step::Terms,
];

const LISTING_STEPS: [Step; 7] = [
    Step::Basics,
    Step::Location,
    Step::Medical,
    Step::Behavior,
    Step::StoryMedia,
    Step::Terms,
    Step::Review,
];

impl Flow {
    pub fn steps(self) -> &'static [Step] {
        match self {
            Flow::Request => &REQUEST_STEPS,
            Flow::Listing => &LISTING_STEPS,
        }
    }

    pub fn step_count(self) -> usize {
        self.steps().len()
    }

    /// Steps are numbered from 1.
    pub fn step_at(self, number: usize) -> Option<Step> {
        number
            .checked_sub(1)
            .and_then(|index| self.steps().get(index).copied())
    }
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn check_basics(draft: &WizardDraft, errors: &mut FieldErrors) {
    if blank(&draft.pet_name) {
        errors.insert("pet_name", "Pet name is required.");
    }
    if Species::parse(&draft.species).is_none() {
        errors.insert("species", "Please choose a valid species.");
    }
}

fn check_location(draft: &WizardDraft, errors: &mut FieldErrors) {
    if blank(&draft.location_city) {
        errors.insert("location_city", "City is required.");
    }
    if blank(&draft.location_state) {
        errors.insert("location_state", "State is required.");
    }
}

fn check_behavior(draft: &WizardDraft, errors: &mut FieldErrors) {
    if draft.has_aggression() && blank(&draft.aggression_details) {
        errors.insert(
            "aggression_details",
            "Please describe the incident(s) so adopters can make an informed decision.",
        );
    }
}

fn check_reason(draft: &WizardDraft, errors: &mut FieldErrors) {
    if draft.reason.trim().chars().count() < MIN_REASON_CHARS {
        errors.insert(
            "reason",
            format!("Please provide at least {MIN_REASON_CHARS} characters."),
        );
    }
}

fn check_request_terms(draft: &WizardDraft, errors: &mut FieldErrors) {
    if draft.privacy_level.is_none() {
        errors.insert("privacy_level", "Choose who can see your request.");
    }
    if !draft.terms_accepted {
        errors.insert("terms_accepted", "You must accept the terms to continue.");
    }
}

/// Gate for a single step. Pure: the result only depends on the draft.
pub fn validate_step(flow: Flow, step: Step, draft: &WizardDraft) -> FieldErrors {
    let mut errors = FieldErrors::new();
    match step {
        Step::Basics => check_basics(draft, &mut errors),
        Step::Location => check_location(draft, &mut errors),
        Step::Behavior => check_behavior(draft, &mut errors),
        Step::Reason => check_reason(draft, &mut errors),
        Step::Terms if flow == Flow::Request => check_request_terms(draft, &mut errors),
        Step::Terms
        | Step::Urgency
        | Step::Medical
        | Step::StoryMedia
        | Step::IdealHome
        | Step::Review => {}
    }
    errors
}

pub fn can_advance(flow: Flow, step: Step, draft: &WizardDraft) -> bool {
    validate_step(flow, step, draft).is_empty()
}

/// Every step gate of the flow plus the checks that only apply at submit.
pub fn validate_submission(flow: Flow, draft: &WizardDraft) -> FieldErrors {
    let mut errors = FieldErrors::new();
    for step in flow.steps() {
        errors.extend(validate_step(flow, *step, draft));
    }
    match flow {
        Flow::Listing => {
            if blank(&draft.story) {
                errors.insert("story", "Tell adopters a little about your pet.");
            }
        }
        Flow::Request => {
            if draft.pet_id.is_none() {
                errors.insert("pet_id", "Select the pet to rehome.");
            }
        }
    }
    errors
}
