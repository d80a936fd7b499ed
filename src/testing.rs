//! In-memory collaborators for unit and router tests.

use crate::backend::{BackendError, RehomingBackend};
use crate::models::{
    AggressionHistory, BehavioralProfile, CustomQuestions, Gender, ListingDetails,
    ListingLocation, ListingStatus, MedicalHistory, NewRehomingRequest, PetProfile, PetStatus,
    PetSummary, PetUpdate, Photo, PrivacyLevel, RecordId, RehomingListing, RehomingRequest,
    RequestStatus, SizeCategory, Species, Urgency, UserProfile,
};
use crate::uploads::{LocalFile, MediaUploader, UploadError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub const TOKEN: &str = "test-access-token";
pub const COOLING_MINUTES: i64 = 5;

pub fn sample_request(status: RequestStatus) -> RehomingRequest {
    RehomingRequest {
        id: RecordId::new("7"),
        pet: RecordId::new("3"),
        pet_details: Some(PetSummary {
            id: Some(RecordId::new("3")),
            name: Some("Max".into()),
            species: Some(Species::Dog),
        }),
        reason: "We are moving overseas and cannot bring Max with us, sadly.".into(),
        urgency: Urgency::Soon,
        ideal_home_notes: None,
        privacy_level: PrivacyLevel::Public,
        location_city: "Austin".into(),
        location_state: "TX".into(),
        location_zip: "78701".into(),
        latitude: None,
        longitude: None,
        status,
        cooling_period_end: None,
        created_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single(),
        confirmed_at: None,
        cancelled_at: None,
        cancellation_reason: None,
    }
}

pub fn sample_pet() -> PetProfile {
    PetProfile {
        id: RecordId::new("3"),
        name: "Max".into(),
        species: Species::Dog,
        breed: "Labrador".into(),
        age: Some("3 years".into()),
        gender: Gender::Male,
        size_category: Some(SizeCategory::Large),
        spayed_neutered: true,
        microchipped: false,
        status: PetStatus::Active,
        description: String::new(),
        media: vec![
            Photo {
                url: "https://img.test/max-1.jpg".into(),
                delete_url: None,
            },
            Photo {
                url: "https://img.test/max-2.jpg".into(),
                delete_url: None,
            },
        ],
        traits: Vec::new(),
    }
}

pub fn sample_listing() -> RehomingListing {
    RehomingListing {
        id: RecordId::new("11"),
        details: ListingDetails {
            request: None,
            pet: Some(RecordId::new("3")),
            pet_name: "Max".into(),
            species: Species::Dog,
            breed: "Labrador".into(),
            age: "3 years".into(),
            gender: Gender::Male,
            size_category: Some(SizeCategory::Large),
            medical_history: MedicalHistory {
                spayed_neutered: Some(true),
                microchipped: Some(false),
                vaccinations_current: None,
                current_medications: vec!["Heartgard".into()],
                medical_conditions: Vec::new(),
            },
            behavioral_profile: BehavioralProfile {
                good_with_children: Some(true),
                aggression_history: AggressionHistory::default(),
                ..BehavioralProfile::default()
            },
            aggression_details: None,
            story: "Max has been with us since he was a puppy.".into(),
            photos: vec![Photo {
                url: "https://img.test/max-1.jpg".into(),
                delete_url: Some("https://img.test/delete/max-1".into()),
            }],
            location: ListingLocation {
                city: "Austin".into(),
                state: "TX".into(),
                zip: "78701".into(),
                lat: Some(30.27),
                lon: Some(-97.74),
            },
            included_items: BTreeSet::from(["leash".to_string(), "crate".to_string()]),
            timeline: None,
            custom_questions: CustomQuestions {
                stay_in_touch: true,
                return_policy: false,
            },
            status: ListingStatus::Active,
        },
    }
}

#[derive(Default)]
struct FakeState {
    requests: BTreeMap<RecordId, RehomingRequest>,
    listings: BTreeMap<RecordId, RehomingListing>,
    pets: BTreeMap<RecordId, PetProfile>,
    profile: UserProfile,
    failures: HashMap<&'static str, BackendError>,
    delays: HashMap<&'static str, u64>,
    calls: HashMap<&'static str, usize>,
    tokens: Vec<String>,
    next_id: u64,
}

/// Scriptable stand-in for the REST backend. It applies the server's
/// transition rules so engine tests can observe rejections.
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 100,
                ..FakeState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_delay(self, op: &'static str, millis: u64) -> Self {
        self.lock().delays.insert(op, millis);
        self
    }

    pub fn fail(&self, op: &'static str, err: BackendError) {
        self.lock().failures.insert(op, err);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.lock().tokens.clone()
    }

    pub fn insert_request(&self, request: RehomingRequest) {
        self.lock().requests.insert(request.id.clone(), request);
    }

    pub fn insert_pet(&self, pet: PetProfile) {
        self.lock().pets.insert(pet.id.clone(), pet);
    }

    pub fn insert_listing(&self, listing: RehomingListing) {
        self.lock().listings.insert(listing.id.clone(), listing);
    }

    pub fn set_profile(&self, profile: UserProfile) {
        self.lock().profile = profile;
    }

    pub fn request(&self, id: &RecordId) -> Option<RehomingRequest> {
        self.lock().requests.get(id).cloned()
    }

    pub fn pet(&self, id: &RecordId) -> Option<PetProfile> {
        self.lock().pets.get(id).cloned()
    }

    pub fn listing(&self, id: &RecordId) -> Option<RehomingListing> {
        self.lock().listings.get(id).cloned()
    }

    async fn enter(&self, op: &'static str, access_token: &str) -> Result<(), BackendError> {
        let (delay, failure) = {
            let mut state = self.lock();
            *state.calls.entry(op).or_default() += 1;
            state.tokens.push(access_token.to_string());
            (state.delays.get(op).copied(), state.failures.get(op).cloned())
        };
        if let Some(millis) = delay {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        failure.map_or(Ok(()), Err)
    }

    fn next_id(state: &mut FakeState) -> RecordId {
        state.next_id += 1;
        RecordId::new(state.next_id.to_string())
    }
}

fn rejected(detail: &str) -> BackendError {
    BackendError::Rejected {
        status: 400,
        detail: detail.to_string(),
    }
}

#[async_trait]
impl RehomingBackend for FakeBackend {
    async fn list_requests(
        &self,
        access_token: &str,
    ) -> Result<Vec<RehomingRequest>, BackendError> {
        self.enter("list_requests", access_token).await?;
        Ok(self.lock().requests.values().cloned().collect())
    }

    async fn get_request(
        &self,
        id: &RecordId,
        access_token: &str,
    ) -> Result<RehomingRequest, BackendError> {
        self.enter("get_request", access_token).await?;
        self.request(id)
            .ok_or_else(|| BackendError::NotFound(format!("rehoming request {id}")))
    }

    async fn create_request(
        &self,
        payload: &NewRehomingRequest,
        access_token: &str,
    ) -> Result<RehomingRequest, BackendError> {
        self.enter("create_request", access_token).await?;
        let mut state = self.lock();
        let now = Utc::now();
        let request = RehomingRequest {
            id: Self::next_id(&mut state),
            pet: payload.pet.clone(),
            pet_details: None,
            reason: payload.reason.clone(),
            urgency: payload.urgency,
            ideal_home_notes: payload.ideal_home_notes.clone(),
            privacy_level: payload.privacy_level,
            location_city: payload.location_city.clone(),
            location_state: payload.location_state.clone(),
            location_zip: payload.location_zip.clone(),
            latitude: payload.latitude,
            longitude: payload.longitude,
            status: RequestStatus::CoolingPeriod,
            cooling_period_end: Some(now + ChronoDuration::minutes(COOLING_MINUTES)),
            created_at: Some(now),
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        };
        state.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn confirm_request(&self, id: &RecordId, access_token: &str) -> Result<(), BackendError> {
        self.enter("confirm_request", access_token).await?;
        let mut state = self.lock();
        let request = state
            .requests
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("rehoming request {id}")))?;
        let now = Utc::now();
        if !matches!(
            request.status,
            RequestStatus::CoolingPeriod | RequestStatus::Confirmed
        ) {
            return Err(rejected("Request cannot be confirmed."));
        }
        if request.cooling_period_end.is_some_and(|end| now < end) {
            return Err(rejected("Cooling period has not ended yet."));
        }
        request.status = RequestStatus::Confirmed;
        request.confirmed_at = Some(now);
        Ok(())
    }

    async fn cancel_request(
        &self,
        id: &RecordId,
        reason: &str,
        access_token: &str,
    ) -> Result<(), BackendError> {
        self.enter("cancel_request", access_token).await?;
        let mut state = self.lock();
        let request = state
            .requests
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("rehoming request {id}")))?;
        if request.status.is_terminal() {
            return Err(rejected("Request is already closed."));
        }
        request.status = RequestStatus::Cancelled;
        request.cancelled_at = Some(Utc::now());
        request.cancellation_reason = (!reason.is_empty()).then(|| reason.to_string());
        Ok(())
    }

    async fn get_listing(
        &self,
        id: &RecordId,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError> {
        self.enter("get_listing", access_token).await?;
        self.listing(id)
            .ok_or_else(|| BackendError::NotFound(format!("listing {id}")))
    }

    async fn create_listing(
        &self,
        payload: &ListingDetails,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError> {
        self.enter("create_listing", access_token).await?;
        let mut state = self.lock();
        let listing = RehomingListing {
            id: Self::next_id(&mut state),
            details: payload.clone(),
        };
        if let Some(request) = payload
            .request
            .as_ref()
            .and_then(|id| state.requests.get_mut(id))
        {
            request.status = RequestStatus::Active;
        }
        state.listings.insert(listing.id.clone(), listing.clone());
        Ok(listing)
    }

    async fn update_listing(
        &self,
        id: &RecordId,
        payload: &ListingDetails,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError> {
        self.enter("update_listing", access_token).await?;
        let mut state = self.lock();
        let listing = state
            .listings
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("listing {id}")))?;
        listing.details = payload.clone();
        Ok(listing.clone())
    }

    async fn get_pet(&self, id: &RecordId, access_token: &str) -> Result<PetProfile, BackendError> {
        self.enter("get_pet", access_token).await?;
        self.pet(id)
            .ok_or_else(|| BackendError::NotFound(format!("pet {id}")))
    }

    async fn update_pet(
        &self,
        id: &RecordId,
        payload: &PetUpdate,
        access_token: &str,
    ) -> Result<PetProfile, BackendError> {
        self.enter("update_pet", access_token).await?;
        let mut state = self.lock();
        let pet = state
            .pets
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("pet {id}")))?;
        pet.name = payload.name.clone();
        pet.species = payload.species;
        pet.breed = payload.breed.clone();
        pet.age = payload.age.clone();
        pet.gender = payload.gender;
        pet.size_category = payload.size_category;
        if let Some(spayed) = payload.spayed_neutered {
            pet.spayed_neutered = spayed;
        }
        if let Some(chipped) = payload.microchipped {
            pet.microchipped = chipped;
        }
        pet.traits = payload.traits.clone();
        Ok(pet.clone())
    }

    async fn get_profile(&self, access_token: &str) -> Result<UserProfile, BackendError> {
        self.enter("get_profile", access_token).await?;
        Ok(self.lock().profile.clone())
    }
}

/// Image host double. Files are addressed by name.
#[derive(Default)]
pub struct FakeUploader {
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: AtomicUsize,
}

impl FakeUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn with_delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaUploader for FakeUploader {
    async fn upload(&self, file: &LocalFile) -> Result<Photo, UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&file.name) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&file.name) {
            return Err(UploadError::Http("connection reset".into()));
        }
        Ok(Photo {
            url: format!("https://img.test/{}", file.name),
            delete_url: Some(format!("https://img.test/delete/{}", file.name)),
        })
    }
}
