//! Listing publisher: pet-profile sync followed by the listing commit.
//!
//! The two stages run strictly in order. A failed sync means the listing is
//! never attempted; a failed listing after a successful sync is reported as
//! [`EngineError::CommitPartialFailure`] so the caller can retry only the
//! listing stage with [`Publisher::retry_listing`].

use crate::backend::RehomingBackend;
use crate::errors::EngineError;
use crate::models::{
    ListingDetails, PetProfile, PetUpdate, RecordId, RehomingListing, RequestStatus, Species,
    StageReport,
};
use crate::wizard::draft::{TriState, WizardDraft};
use crate::wizard::steps::{Flow, validate_submission};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PublishTarget {
    /// New listing from a confirmed request.
    Create { request: RecordId },
    /// Edit of an existing listing; no request link is sent.
    Update { listing_id: RecordId },
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub listing: RehomingListing,
    pub pet: Option<PetProfile>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug)]
struct StageOutcome<T> {
    value: T,
    output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// Trait tags accumulated from the behaviour fields. Each rule is independent.
pub fn derive_traits(draft: &WizardDraft) -> Vec<String> {
    let mut traits = Vec::new();
    let mut tag = |on: bool, label: &str| {
        if on {
            traits.push(label.to_string());
        }
    };
    tag(draft.good_with_children.is_yes(), "Good with Kids");
    tag(draft.good_with_dogs.is_yes(), "Good with Dogs");
    tag(draft.good_with_cats.is_yes(), "Good with Cats");
    tag(draft.energy_level >= 4, "Energetic");
    tag(draft.energy_level <= 2, "Calm");
    tag(draft.affection_level >= 4, "Affectionate");
    tag(draft.affection_level <= 2, "Independent");
    tag(draft.house_trained == TriState::Yes, "House Trained");
    traits
}

pub fn pet_update_from(draft: &WizardDraft) -> Result<PetUpdate, EngineError> {
    let species = Species::parse(&draft.species)
        .ok_or_else(|| EngineError::validation("species", "Please choose a valid species."))?;
    let age = draft.age.trim();
    Ok(PetUpdate {
        name: draft.pet_name.trim().to_string(),
        species,
        breed: draft.breed.trim().to_string(),
        age: (!age.is_empty()).then(|| age.to_string()),
        gender: draft.gender,
        size_category: draft.size_category,
        spayed_neutered: draft.spayed.to_flag(),
        microchipped: draft.microchipped.to_flag(),
        traits: derive_traits(draft),
    })
}

#[derive(Clone)]
pub struct Publisher {
    backend: Arc<dyn RehomingBackend>,
}

impl Publisher {
    pub fn new(backend: Arc<dyn RehomingBackend>) -> Self {
        Self { backend }
    }

    /// Full two-stage commit. Nothing is written unless the draft passes
    /// every listing gate.
    pub async fn publish(
        &self,
        draft: &WizardDraft,
        target: &PublishTarget,
        access_token: &str,
    ) -> Result<PublishReceipt, EngineError> {
        validate_submission(Flow::Listing, draft).into_result()?;
        let pet_id = draft
            .pet_id
            .clone()
            .ok_or_else(|| EngineError::validation("pet_id", "Listing has no linked pet."))?;
        let update = pet_update_from(draft)?;
        let details = listing_details(draft, target)?;
        let mut stages = Vec::new();

        if let PublishTarget::Create { request } = target {
            self.capture_stage("verify_request", &mut stages, async {
                let request = self
                    .backend
                    .get_request(request, access_token)
                    .await
                    .map_err(|err| EngineError::from_backend("verify_request", err))?;
                if request.status != RequestStatus::Confirmed {
                    return Err(EngineError::TransitionRejected(format!(
                        "request {} is {}, not confirmed",
                        request.id,
                        request.status.as_str()
                    )));
                }
                Ok(StageOutcome::new((), json!({"request": request.id})))
            })
            .await?;
        }

        let pet = self
            .capture_stage("sync_pet", &mut stages, async {
                let pet = self
                    .backend
                    .update_pet(&pet_id, &update, access_token)
                    .await
                    .map_err(|err| EngineError::from_backend("sync_pet", err))?;
                let output = json!({"pet": pet.id, "traits": update.traits});
                Ok(StageOutcome::new(pet, output))
            })
            .await?;
        info!(target: "rehoming.publisher", pet_id = %pet_id, "pet_profile_synced");

        let listing = self
            .commit_listing(target, &details, access_token, &mut stages)
            .await
            .map_err(|err| {
                warn!(target: "rehoming.publisher", pet_id = %pet_id, error = %err, "listing_commit_failed");
                EngineError::CommitPartialFailure {
                    pet_id: pet_id.clone(),
                    detail: err.to_string(),
                }
            })?;

        Ok(PublishReceipt {
            listing,
            pet: Some(pet),
            stages,
        })
    }

    /// Re-runs only the listing stage after a partial failure.
    pub async fn retry_listing(
        &self,
        draft: &WizardDraft,
        target: &PublishTarget,
        access_token: &str,
    ) -> Result<PublishReceipt, EngineError> {
        validate_submission(Flow::Listing, draft).into_result()?;
        let details = listing_details(draft, target)?;
        let mut stages = Vec::new();
        let listing = self
            .commit_listing(target, &details, access_token, &mut stages)
            .await
            .map_err(|err| match draft.pet_id.clone() {
                Some(pet_id) => EngineError::CommitPartialFailure {
                    pet_id,
                    detail: err.to_string(),
                },
                None => err,
            })?;
        Ok(PublishReceipt {
            listing,
            pet: None,
            stages,
        })
    }

    async fn commit_listing(
        &self,
        target: &PublishTarget,
        details: &ListingDetails,
        access_token: &str,
        stages: &mut Vec<StageReport>,
    ) -> Result<RehomingListing, EngineError> {
        self.capture_stage("publish_listing", stages, async {
            let listing = match target {
                PublishTarget::Create { .. } => {
                    self.backend.create_listing(details, access_token).await
                }
                PublishTarget::Update { listing_id } => {
                    self.backend
                        .update_listing(listing_id, details, access_token)
                        .await
                }
            }
            .map_err(|err| EngineError::from_backend("publish_listing", err))?;
            info!(target: "rehoming.publisher", listing_id = %listing.id, "listing_published");
            let output = json!({
                "listing": listing.id,
                "photos": listing.details.photos.len(),
                "status": listing.details.status,
            });
            Ok(StageOutcome::new(listing, output))
        })
        .await
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, EngineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, EngineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn listing_details(
    draft: &WizardDraft,
    target: &PublishTarget,
) -> Result<ListingDetails, EngineError> {
    let request = match target {
        PublishTarget::Create { request } => Some(request.clone()),
        PublishTarget::Update { .. } => None,
    };
    draft.to_listing_details(request)
}
