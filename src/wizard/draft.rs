//! In-progress wizard form state.
//!
//! A [`DraftStore`] owns exactly one [`WizardDraft`] for the lifetime of a
//! wizard session. It is seeded once from a [`DraftSource`] and afterwards
//! only changes through [`DraftStore::patch`] and upload staging.

use crate::errors::EngineError;
use crate::models::{
    AggressionHistory, BehavioralProfile, CustomQuestions, Gender, ListingDetails,
    ListingLocation, ListingStatus, MedicalHistory, NewRehomingRequest, PetProfile, Photo,
    PrivacyLevel, RecordId, RehomingListing, RehomingRequest, SizeCategory, Species, Urgency,
    UserProfile,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Form representation of a boolean the owner may not know.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    Yes,
    No,
    #[default]
    Unknown,
}

impl TriState {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => TriState::Yes,
            Some(false) => TriState::No,
            None => TriState::Unknown,
        }
    }

    pub fn to_flag(self) -> Option<bool> {
        match self {
            TriState::Yes => Some(true),
            TriState::No => Some(false),
            TriState::Unknown => None,
        }
    }

    pub fn is_yes(self) -> bool {
        self == TriState::Yes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WizardDraft {
    pub pet_id: Option<RecordId>,
    pub request_id: Option<RecordId>,
    pub listing_id: Option<RecordId>,

    pub pet_name: String,
    pub species: String,
    pub breed: String,
    pub age: String,
    pub gender: Gender,
    pub size_category: Option<SizeCategory>,

    pub spayed: TriState,
    pub microchipped: TriState,
    pub vaccinations: TriState,
    pub medications: Vec<String>,
    pub conditions: Vec<String>,

    pub energy_level: u8,
    pub affection_level: u8,
    pub good_with_children: TriState,
    pub good_with_dogs: TriState,
    pub good_with_cats: TriState,
    pub house_trained: TriState,
    pub crate_trained: TriState,
    pub separation_anxiety: TriState,
    pub exercise_needs: Option<String>,
    pub aggression_person: TriState,
    pub aggression_animal: TriState,
    pub aggression_details: String,

    pub story: String,
    pub photos: Vec<Photo>,

    pub location_city: String,
    pub location_state: String,
    pub location_zip: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub enable_location_edit: bool,

    pub included_items: BTreeSet<String>,
    pub timeline: Option<NaiveDate>,
    pub stay_in_touch: bool,
    pub return_policy: bool,

    pub reason: String,
    pub urgency: Urgency,
    pub ideal_home_notes: String,
    pub privacy_level: Option<PrivacyLevel>,
    pub terms_accepted: bool,
}

impl Default for WizardDraft {
    fn default() -> Self {
        Self {
            pet_id: None,
            request_id: None,
            listing_id: None,
            pet_name: String::new(),
            species: String::new(),
            breed: String::new(),
            age: String::new(),
            gender: Gender::Unknown,
            size_category: None,
            spayed: TriState::Unknown,
            microchipped: TriState::Unknown,
            vaccinations: TriState::Unknown,
            medications: Vec::new(),
            conditions: Vec::new(),
            energy_level: 3,
            affection_level: 3,
            good_with_children: TriState::Unknown,
            good_with_dogs: TriState::Unknown,
            good_with_cats: TriState::Unknown,
            house_trained: TriState::Unknown,
            crate_trained: TriState::Unknown,
            separation_anxiety: TriState::Unknown,
            exercise_needs: None,
            aggression_person: TriState::No,
            aggression_animal: TriState::No,
            aggression_details: String::new(),
            story: String::new(),
            photos: Vec::new(),
            location_city: String::new(),
            location_state: String::new(),
            location_zip: String::new(),
            latitude: None,
            longitude: None,
            enable_location_edit: false,
            included_items: BTreeSet::new(),
            timeline: None,
            stay_in_touch: false,
            return_policy: false,
            reason: String::new(),
            urgency: Urgency::Flexible,
            ideal_home_notes: String::new(),
            privacy_level: Some(PrivacyLevel::Public),
            terms_accepted: false,
        }
    }
}

/// Primacy is positional: the first staged photo is the primary one.
pub fn primary_photo(draft: &WizardDraft) -> Option<&Photo> {
    draft.photos.first()
}

impl WizardDraft {
    pub fn has_aggression(&self) -> bool {
        self.aggression_person.is_yes() || self.aggression_animal.is_yes()
    }

    /// Builds the listing body. `request` is only carried on create.
    pub fn to_listing_details(
        &self,
        request: Option<RecordId>,
    ) -> Result<ListingDetails, EngineError> {
        let species = Species::parse(&self.species)
            .ok_or_else(|| EngineError::validation("species", "Please choose a valid species."))?;
        let details = self.aggression_details.trim();
        Ok(ListingDetails {
            request,
            pet: self.pet_id.clone(),
            pet_name: self.pet_name.trim().to_string(),
            species,
            breed: self.breed.trim().to_string(),
            age: self.age.trim().to_string(),
            gender: self.gender,
            size_category: self.size_category,
            medical_history: MedicalHistory {
                spayed_neutered: self.spayed.to_flag(),
                microchipped: self.microchipped.to_flag(),
                vaccinations_current: self.vaccinations.to_flag(),
                current_medications: self.medications.clone(),
                medical_conditions: self.conditions.clone(),
            },
            behavioral_profile: BehavioralProfile {
                energy_level: clamp_level(self.energy_level),
                affection_level: clamp_level(self.affection_level),
                good_with_children: self.good_with_children.to_flag(),
                good_with_dogs: self.good_with_dogs.to_flag(),
                good_with_cats: self.good_with_cats.to_flag(),
                house_trained: self.house_trained.to_flag(),
                crate_trained: self.crate_trained.to_flag(),
                separation_anxiety: self.separation_anxiety.to_flag(),
                exercise_needs: self.exercise_needs.clone(),
                aggression_history: AggressionHistory {
                    bitten_person: self.aggression_person.to_flag(),
                    bitten_animal: self.aggression_animal.to_flag(),
                },
            },
            aggression_details: (!details.is_empty()).then(|| details.to_string()),
            story: self.story.trim().to_string(),
            photos: self.photos.clone(),
            location: ListingLocation {
                city: self.location_city.trim().to_string(),
                state: self.location_state.trim().to_string(),
                zip: self.location_zip.trim().to_string(),
                lat: self.latitude,
                lon: self.longitude,
            },
            included_items: self.included_items.clone(),
            timeline: self.timeline,
            custom_questions: CustomQuestions {
                stay_in_touch: self.stay_in_touch,
                return_policy: self.return_policy,
            },
            status: ListingStatus::Active,
        })
    }

    pub fn to_request_payload(&self) -> Result<NewRehomingRequest, EngineError> {
        let pet = self
            .pet_id
            .clone()
            .ok_or_else(|| EngineError::validation("pet_id", "Select the pet to rehome."))?;
        let notes = self.ideal_home_notes.trim();
        Ok(NewRehomingRequest {
            pet,
            reason: self.reason.trim().to_string(),
            urgency: self.urgency,
            ideal_home_notes: (!notes.is_empty()).then(|| notes.to_string()),
            privacy_level: self.privacy_level.unwrap_or_default(),
            terms_accepted: self.terms_accepted,
            location_city: self.location_city.trim().to_string(),
            location_state: self.location_state.trim().to_string(),
            location_zip: self.location_zip.trim().to_string(),
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }
}

/// How a wizard session is seeded. Resolved once by [`init_draft`].
#[derive(Debug, Clone)]
pub enum DraftSource {
    Blank,
    ResumedRequest {
        request: RehomingRequest,
        pet: PetProfile,
        profile: Option<UserProfile>,
    },
    EditListing {
        listing: RehomingListing,
    },
}

pub fn init_draft(source: DraftSource) -> DraftStore {
    let mut store = DraftStore::default();
    match source {
        DraftSource::Blank => {}
        DraftSource::ResumedRequest {
            request,
            pet,
            profile,
        } => {
            store.init_from_request(&request, &pet, profile.as_ref());
        }
        DraftSource::EditListing { listing } => {
            store.init_from_listing(&listing);
        }
    }
    store
}

/// Energy and affection are a 1-5 scale in the form, the trait rules and the
/// listing alike.
fn clamp_level(level: u8) -> u8 {
    level.clamp(1, 5)
}

/// Partial update. Absent fields are left alone; for fields that are
/// themselves optional, an explicit `null` clears them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DraftPatch {
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub pet_id: Option<Option<RecordId>>,
    pub pet_name: Option<String>,
    pub species: Option<String>,
    pub breed: Option<String>,
    pub age: Option<String>,
    pub gender: Option<Gender>,
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub size_category: Option<Option<SizeCategory>>,
    pub spayed: Option<TriState>,
    pub microchipped: Option<TriState>,
    pub vaccinations: Option<TriState>,
    pub medications: Option<Vec<String>>,
    pub conditions: Option<Vec<String>>,
    pub energy_level: Option<u8>,
    pub affection_level: Option<u8>,
    pub good_with_children: Option<TriState>,
    pub good_with_dogs: Option<TriState>,
    pub good_with_cats: Option<TriState>,
    pub house_trained: Option<TriState>,
    pub crate_trained: Option<TriState>,
    pub separation_anxiety: Option<TriState>,
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub exercise_needs: Option<Option<String>>,
    pub aggression_person: Option<TriState>,
    pub aggression_animal: Option<TriState>,
    pub aggression_details: Option<String>,
    pub story: Option<String>,
    pub location_city: Option<String>,
    pub location_state: Option<String>,
    pub location_zip: Option<String>,
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub longitude: Option<Option<f64>>,
    pub enable_location_edit: Option<bool>,
    pub included_items: Option<BTreeSet<String>>,
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub timeline: Option<Option<NaiveDate>>,
    pub stay_in_touch: Option<bool>,
    pub return_policy: Option<bool>,
    pub reason: Option<String>,
    pub urgency: Option<Urgency>,
    pub ideal_home_notes: Option<String>,
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub privacy_level: Option<Option<PrivacyLevel>>,
    pub terms_accepted: Option<bool>,
}

macro_rules! merge_fields {
    ($store:expr, $patch:expr, $touched:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $store.draft.$field = value;
                $store.edited.insert(stringify!($field));
                $touched.push(stringify!($field));
            }
        )+
    };
}

#[derive(Debug, Clone, Default)]
pub struct DraftStore {
    draft: WizardDraft,
    edited: BTreeSet<&'static str>,
    populated: bool,
}

impl DraftStore {
    pub fn draft(&self) -> &WizardDraft {
        &self.draft
    }

    pub(crate) fn draft_mut(&mut self) -> &mut WizardDraft {
        &mut self.draft
    }

    pub(crate) fn mark_edited(&mut self, field: &'static str) {
        self.edited.insert(field);
    }

    pub fn is_edited(&self, field: &str) -> bool {
        self.edited.contains(field)
    }

    pub fn into_draft(self) -> WizardDraft {
        self.draft
    }

    /// Shallow merge. No validation happens here. Returns the touched fields.
    pub fn patch(&mut self, patch: DraftPatch) -> Vec<&'static str> {
        let mut touched = Vec::new();
        merge_fields!(self, patch, touched;
            pet_id, pet_name, species, breed, age, gender, size_category,
            spayed, microchipped, vaccinations, medications, conditions,
            energy_level, affection_level, good_with_children, good_with_dogs,
            good_with_cats, house_trained, crate_trained, separation_anxiety,
            exercise_needs, aggression_person, aggression_animal, aggression_details,
            story, location_city, location_state, location_zip, latitude, longitude,
            enable_location_edit, included_items, timeline, stay_in_touch, return_policy,
            reason, urgency, ideal_home_notes, privacy_level, terms_accepted,
        );
        self.draft.energy_level = clamp_level(self.draft.energy_level);
        self.draft.affection_level = clamp_level(self.draft.affection_level);
        touched
    }

    fn fill(&mut self, field: &'static str, apply: impl FnOnce(&mut WizardDraft)) {
        if !self.edited.contains(field) {
            apply(&mut self.draft);
        }
    }

    /// Seeds the draft from an existing request and its pet. Runs at most once
    /// per session and never overwrites a field the user already edited.
    pub fn init_from_request(
        &mut self,
        request: &RehomingRequest,
        pet: &PetProfile,
        profile: Option<&UserProfile>,
    ) -> bool {
        if self.populated {
            return false;
        }
        self.populated = true;
        self.draft.request_id = Some(request.id.clone());
        self.draft.pet_id = Some(request.pet.clone());

        self.fill("pet_name", |d| d.pet_name = pet.name.clone());
        self.fill("species", |d| d.species = pet.species.as_str().to_string());
        self.fill("breed", |d| d.breed = pet.breed.clone());
        self.fill("age", |d| d.age = pet.age.clone().unwrap_or_default());
        self.fill("gender", |d| d.gender = pet.gender);
        self.fill("size_category", |d| d.size_category = pet.size_category);
        self.fill("photos", |d| d.photos = pet.media.clone());
        self.fill("story", |d| d.story = request.reason.clone());
        self.fill("reason", |d| d.reason = request.reason.clone());
        self.fill("urgency", |d| d.urgency = request.urgency);
        self.fill("privacy_level", |d| {
            d.privacy_level = Some(request.privacy_level)
        });

        if request.has_location() {
            self.fill("location_city", |d| {
                d.location_city = request.location_city.clone()
            });
            self.fill("location_state", |d| {
                d.location_state = request.location_state.clone()
            });
            self.fill("location_zip", |d| {
                d.location_zip = request.location_zip.clone()
            });
            self.fill("latitude", |d| d.latitude = request.latitude);
            self.fill("longitude", |d| d.longitude = request.longitude);
        } else if let Some(profile) = profile {
            self.prefill_location(profile);
        }
        true
    }

    /// Fills empty, unedited location fields from the user's profile.
    pub fn prefill_location(&mut self, profile: &UserProfile) {
        let city = profile.location_city.clone().unwrap_or_default();
        let state = profile.location_state.clone().unwrap_or_default();
        let zip = profile.location_zip.clone().unwrap_or_default();
        if self.draft.location_city.trim().is_empty() {
            self.fill("location_city", |d| d.location_city = city);
        }
        if self.draft.location_state.trim().is_empty() {
            self.fill("location_state", |d| d.location_state = state);
        }
        if self.draft.location_zip.trim().is_empty() {
            self.fill("location_zip", |d| d.location_zip = zip);
        }
    }

    /// Full-fidelity population from a published listing (edit mode).
    pub fn init_from_listing(&mut self, listing: &RehomingListing) -> bool {
        if self.populated {
            return false;
        }
        self.populated = true;
        let src = &listing.details;
        let medical = &src.medical_history;
        let behavior = &src.behavioral_profile;
        self.draft = WizardDraft {
            pet_id: src.pet.clone(),
            request_id: None,
            listing_id: Some(listing.id.clone()),
            pet_name: src.pet_name.clone(),
            species: src.species.as_str().to_string(),
            breed: src.breed.clone(),
            age: src.age.clone(),
            gender: src.gender,
            size_category: src.size_category,
            spayed: TriState::from_flag(medical.spayed_neutered),
            microchipped: TriState::from_flag(medical.microchipped),
            vaccinations: TriState::from_flag(medical.vaccinations_current),
            medications: medical.current_medications.clone(),
            conditions: medical.medical_conditions.clone(),
            energy_level: clamp_level(behavior.energy_level),
            affection_level: clamp_level(behavior.affection_level),
            good_with_children: TriState::from_flag(behavior.good_with_children),
            good_with_dogs: TriState::from_flag(behavior.good_with_dogs),
            good_with_cats: TriState::from_flag(behavior.good_with_cats),
            house_trained: TriState::from_flag(behavior.house_trained),
            crate_trained: TriState::from_flag(behavior.crate_trained),
            separation_anxiety: TriState::from_flag(behavior.separation_anxiety),
            exercise_needs: behavior.exercise_needs.clone(),
            aggression_person: TriState::from_flag(behavior.aggression_history.bitten_person),
            aggression_animal: TriState::from_flag(behavior.aggression_history.bitten_animal),
            aggression_details: src.aggression_details.clone().unwrap_or_default(),
            story: src.story.clone(),
            photos: src.photos.clone(),
            location_city: src.location.city.clone(),
            location_state: src.location.state.clone(),
            location_zip: src.location.zip.clone(),
            latitude: src.location.lat,
            longitude: src.location.lon,
            enable_location_edit: false,
            included_items: src.included_items.clone(),
            timeline: src.timeline,
            stay_in_touch: src.custom_questions.stay_in_touch,
            return_policy: src.custom_questions.return_policy,
            ..WizardDraft::default()
        };
        true
    }
}
