use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Server-assigned identifier. The backend emits integers today, but the
/// engine never does arithmetic on ids so they are carried as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(value) => RecordId(value.to_string()),
            Raw::Text(value) => RecordId(value),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    CoolingPeriod,
    Confirmed,
    Active,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::CoolingPeriod => "cooling_period",
            RequestStatus::Confirmed => "confirmed",
            RequestStatus::Active => "active",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Active | RequestStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Immediate,
    Soon,
    #[default]
    Flexible,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    #[default]
    Public,
    Verified,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    Dog,
    Cat,
    Rabbit,
    Bird,
    Other,
}

impl Species {
    pub const ALL: [Species; 5] = [
        Species::Dog,
        Species::Cat,
        Species::Rabbit,
        Species::Bird,
        Species::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Species::Dog => "dog",
            Species::Cat => "cat",
            Species::Rabbit => "rabbit",
            Species::Bird => "bird",
            Species::Other => "other",
        }
    }

    /// Accepts form values in any case ("Dog", "dog", " DOG ").
    pub fn parse(input: &str) -> Option<Self> {
        let needle = input.trim().to_lowercase();
        Self::ALL.into_iter().find(|s| s.as_str() == needle)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PetStatus {
    #[default]
    Active,
    Rehomed,
    Deceased,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    PendingReview,
    #[default]
    Active,
    Paused,
    UnderReview,
    Rehomed,
    Closed,
}

/// A hosted image. Only completed uploads ever become a `Photo`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Photo {
    pub url: String,
    #[serde(default)]
    pub delete_url: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PetSummary {
    pub id: Option<RecordId>,
    pub name: Option<String>,
    pub species: Option<Species>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RehomingRequest {
    pub id: RecordId,
    pub pet: RecordId,
    #[serde(default)]
    pub pet_details: Option<PetSummary>,
    pub reason: String,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub ideal_home_notes: Option<String>,
    #[serde(default)]
    pub privacy_level: PrivacyLevel,
    #[serde(default)]
    pub location_city: String,
    #[serde(default)]
    pub location_state: String,
    #[serde(default)]
    pub location_zip: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub status: RequestStatus,
    #[serde(default)]
    pub cooling_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
}

impl RehomingRequest {
    pub fn has_location(&self) -> bool {
        !self.location_city.trim().is_empty() && !self.location_state.trim().is_empty()
    }
}

/// Payload for submitting a new rehoming request.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRehomingRequest {
    pub pet: RecordId,
    pub reason: String,
    pub urgency: Urgency,
    pub ideal_home_notes: Option<String>,
    pub privacy_level: PrivacyLevel,
    pub terms_accepted: bool,
    pub location_city: String,
    pub location_state: String,
    pub location_zip: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CancelRequestBody {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MedicalHistory {
    #[serde(default)]
    pub spayed_neutered: Option<bool>,
    #[serde(default)]
    pub microchipped: Option<bool>,
    #[serde(default)]
    pub vaccinations_current: Option<bool>,
    #[serde(default)]
    pub current_medications: Vec<String>,
    #[serde(default)]
    pub medical_conditions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AggressionHistory {
    #[serde(default)]
    pub bitten_person: Option<bool>,
    #[serde(default)]
    pub bitten_animal: Option<bool>,
}

impl AggressionHistory {
    pub fn any(&self) -> bool {
        self.bitten_person == Some(true) || self.bitten_animal == Some(true)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BehavioralProfile {
    pub energy_level: u8,
    pub affection_level: u8,
    #[serde(default)]
    pub good_with_children: Option<bool>,
    #[serde(default)]
    pub good_with_dogs: Option<bool>,
    #[serde(default)]
    pub good_with_cats: Option<bool>,
    #[serde(default)]
    pub house_trained: Option<bool>,
    #[serde(default)]
    pub crate_trained: Option<bool>,
    #[serde(default)]
    pub separation_anxiety: Option<bool>,
    #[serde(default)]
    pub exercise_needs: Option<String>,
    #[serde(default)]
    pub aggression_history: AggressionHistory,
}

impl Default for BehavioralProfile {
    fn default() -> Self {
        Self {
            energy_level: 3,
            affection_level: 3,
            good_with_children: None,
            good_with_dogs: None,
            good_with_cats: None,
            house_trained: None,
            crate_trained: None,
            separation_anxiety: None,
            exercise_needs: None,
            aggression_history: AggressionHistory::default(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ListingLocation {
    pub city: String,
    pub state: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CustomQuestions {
    #[serde(default)]
    pub stay_in_touch: bool,
    #[serde(default)]
    pub return_policy: bool,
}

/// Listing body shared by the create/update payloads and the stored record.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingDetails {
    #[serde(default)]
    pub request: Option<RecordId>,
    #[serde(default)]
    pub pet: Option<RecordId>,
    pub pet_name: String,
    pub species: Species,
    #[serde(default)]
    pub breed: String,
    #[serde(default)]
    pub age: String,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub size_category: Option<SizeCategory>,
    #[serde(default)]
    pub medical_history: MedicalHistory,
    #[serde(default)]
    pub behavioral_profile: BehavioralProfile,
    #[serde(default)]
    pub aggression_details: Option<String>,
    #[serde(default)]
    pub story: String,
    #[serde(default)]
    pub photos: Vec<Photo>,
    pub location: ListingLocation,
    #[serde(default)]
    pub included_items: BTreeSet<String>,
    #[serde(default)]
    pub timeline: Option<NaiveDate>,
    #[serde(default)]
    pub custom_questions: CustomQuestions,
    #[serde(default)]
    pub status: ListingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RehomingListing {
    pub id: RecordId,
    #[serde(flatten)]
    pub details: ListingDetails,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PetProfile {
    pub id: RecordId,
    pub name: String,
    pub species: Species,
    #[serde(default)]
    pub breed: String,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub size_category: Option<SizeCategory>,
    #[serde(default)]
    pub spayed_neutered: bool,
    #[serde(default)]
    pub microchipped: bool,
    #[serde(default)]
    pub status: PetStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub media: Vec<Photo>,
    #[serde(default)]
    pub traits: Vec<String>,
}

/// Partial pet profile written by the publisher's sync stage.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PetUpdate {
    pub name: String,
    pub species: Species,
    pub breed: String,
    pub age: Option<String>,
    pub gender: Gender,
    pub size_category: Option<SizeCategory>,
    pub spayed_neutered: Option<bool>,
    pub microchipped: Option<bool>,
    pub traits: Vec<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UserProfile {
    pub id: Option<RecordId>,
    #[serde(default)]
    pub location_city: Option<String>,
    #[serde(default)]
    pub location_state: Option<String>,
    #[serde(default)]
    pub location_zip: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, String>>,
}
