use crate::backend::config::LISTINGS_PATH;
use crate::backend::{BackendError, HttpBackend, send_json};
use crate::models::{ListingDetails, RecordId, RehomingListing};
use urlencoding::encode;

fn listing_url(backend: &HttpBackend, id: &RecordId) -> String {
    format!("{}{}/", backend.url(LISTINGS_PATH), encode(id.as_str()))
}

pub async fn get(
    backend: &HttpBackend,
    id: &RecordId,
    access_token: &str,
) -> Result<RehomingListing, BackendError> {
    let builder = backend.client().get(listing_url(backend, id));
    send_json(builder, access_token, &format!("listing {id}")).await
}

pub async fn create(
    backend: &HttpBackend,
    payload: &ListingDetails,
    access_token: &str,
) -> Result<RehomingListing, BackendError> {
    let builder = backend
        .client()
        .post(backend.url(LISTINGS_PATH))
        .json(payload);
    send_json(builder, access_token, "listings").await
}

pub async fn update(
    backend: &HttpBackend,
    id: &RecordId,
    payload: &ListingDetails,
    access_token: &str,
) -> Result<RehomingListing, BackendError> {
    let builder = backend
        .client()
        .patch(listing_url(backend, id))
        .json(payload);
    send_json(builder, access_token, &format!("listing {id}")).await
}
