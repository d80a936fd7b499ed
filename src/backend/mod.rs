//! REST backend boundary.
//!
//! [`RehomingBackend`] is the seam the engine drives; [`HttpBackend`] talks to
//! the real API and the test suite swaps in an in-memory fake.

pub mod config;
pub mod listings;
pub mod pets;
pub mod requests;

use crate::http::build_client;
use crate::models::{
    ListingDetails, NewRehomingRequest, PetProfile, PetUpdate, RecordId, RehomingListing,
    RehomingRequest, UserProfile,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("backend unavailable: HTTP {0}")]
    Unavailable(u16),
    #[error("{0} not found")]
    NotFound(String),
    #[error("access token rejected: HTTP {0}")]
    Unauthorized(u16),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[async_trait]
pub trait RehomingBackend: Send + Sync {
    async fn list_requests(&self, access_token: &str)
    -> Result<Vec<RehomingRequest>, BackendError>;

    async fn get_request(
        &self,
        id: &RecordId,
        access_token: &str,
    ) -> Result<RehomingRequest, BackendError>;

    async fn create_request(
        &self,
        payload: &NewRehomingRequest,
        access_token: &str,
    ) -> Result<RehomingRequest, BackendError>;

    async fn confirm_request(&self, id: &RecordId, access_token: &str)
    -> Result<(), BackendError>;

    async fn cancel_request(
        &self,
        id: &RecordId,
        reason: &str,
        access_token: &str,
    ) -> Result<(), BackendError>;

    async fn get_listing(
        &self,
        id: &RecordId,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError>;

    async fn create_listing(
        &self,
        payload: &ListingDetails,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError>;

    async fn update_listing(
        &self,
        id: &RecordId,
        payload: &ListingDetails,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError>;

    async fn get_pet(&self, id: &RecordId, access_token: &str)
    -> Result<PetProfile, BackendError>;

    async fn update_pet(
        &self,
        id: &RecordId,
        payload: &PetUpdate,
        access_token: &str,
    ) -> Result<PetProfile, BackendError>;

    async fn get_profile(&self, access_token: &str) -> Result<UserProfile, BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    http: Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(config::API_ROOT.as_str())
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) fn client(&self) -> &Client {
        &self.http
    }
}

/// Lists come back either bare or wrapped in a paginated envelope.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum Page<T> {
    Plain(Vec<T>),
    Paginated { results: Vec<T> },
}

impl<T> Page<T> {
    pub(crate) fn into_items(self) -> Vec<T> {
        match self {
            Page::Plain(items) => items,
            Page::Paginated { results } => results,
        }
    }
}

pub(crate) async fn send(
    builder: RequestBuilder,
    access_token: &str,
    what: &str,
) -> Result<Response, BackendError> {
    let response = builder
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|err| BackendError::Request(err.to_string()))?;
    let status = response.status();
    debug!(target: "rehoming.backend", %status, what, "backend_response");
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound(what.to_string()));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(BackendError::Unauthorized(status.as_u16()));
    }
    if status.is_server_error() {
        return Err(BackendError::Unavailable(status.as_u16()));
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Rejected {
        status: status.as_u16(),
        detail: rejection_detail(&body).unwrap_or_else(|| format!("HTTP {status}")),
    })
}

pub(crate) async fn send_json<T: DeserializeOwned>(
    builder: RequestBuilder,
    access_token: &str,
    what: &str,
) -> Result<T, BackendError> {
    send(builder, access_token, what)
        .await?
        .json::<T>()
        .await
        .map_err(|err| BackendError::Deserialize(err.to_string()))
}

/// Pulls a human-readable message out of a DRF-style error body.
fn rejection_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    if let Some(detail) = value.get("detail").and_then(|v| v.as_str()) {
        return Some(detail.to_string());
    }
    if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
        return Some(error.to_string());
    }
    let fields = value.as_object()?;
    let joined = fields
        .iter()
        .map(|(field, messages)| {
            let text = match messages {
                serde_json::Value::Array(items) => items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            format!("{field}: {text}")
        })
        .collect::<Vec<_>>()
        .join("; ");
    (!joined.is_empty()).then_some(joined)
}

#[async_trait]
impl RehomingBackend for HttpBackend {
    async fn list_requests(
        &self,
        access_token: &str,
    ) -> Result<Vec<RehomingRequest>, BackendError> {
        requests::list(self, access_token).await
    }

    async fn get_request(
        &self,
        id: &RecordId,
        access_token: &str,
    ) -> Result<RehomingRequest, BackendError> {
        requests::get(self, id, access_token).await
    }

    async fn create_request(
        &self,
        payload: &NewRehomingRequest,
        access_token: &str,
    ) -> Result<RehomingRequest, BackendError> {
        requests::create(self, payload, access_token).await
    }

    async fn confirm_request(
        &self,
        id: &RecordId,
        access_token: &str,
    ) -> Result<(), BackendError> {
        requests::confirm(self, id, access_token).await
    }

    async fn cancel_request(
        &self,
        id: &RecordId,
        reason: &str,
        access_token: &str,
    ) -> Result<(), BackendError> {
        requests::cancel(self, id, reason, access_token).await
    }

    async fn get_listing(
        &self,
        id: &RecordId,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError> {
        listings::get(self, id, access_token).await
    }

    async fn create_listing(
        &self,
        payload: &ListingDetails,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError> {
        listings::create(self, payload, access_token).await
    }

    async fn update_listing(
        &self,
        id: &RecordId,
        payload: &ListingDetails,
        access_token: &str,
    ) -> Result<RehomingListing, BackendError> {
        listings::update(self, id, payload, access_token).await
    }

    async fn get_pet(
        &self,
        id: &RecordId,
        access_token: &str,
    ) -> Result<PetProfile, BackendError> {
        pets::get(self, id, access_token).await
    }

    async fn update_pet(
        &self,
        id: &RecordId,
        payload: &PetUpdate,
        access_token: &str,
    ) -> Result<PetProfile, BackendError> {
        pets::update(self, id, payload, access_token).await
    }

    async fn get_profile(&self, access_token: &str) -> Result<UserProfile, BackendError> {
        pets::profile(self, access_token).await
    }
}
