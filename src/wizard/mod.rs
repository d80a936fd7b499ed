pub mod draft;
pub mod session;
pub mod steps;

pub use draft::{DraftPatch, DraftSource, DraftStore, TriState, WizardDraft, init_draft, primary_photo};
pub use session::{SessionSnapshot, Transition, WizardAction, WizardSession};
pub use steps::{Flow, Step, can_advance, validate_step, validate_submission};
