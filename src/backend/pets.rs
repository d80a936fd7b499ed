use crate::backend::config::{PETS_PATH, PROFILE_PATH};
use crate::backend::{BackendError, HttpBackend, send_json};
use crate::models::{PetProfile, PetUpdate, RecordId, UserProfile};
use urlencoding::encode;

fn pet_url(backend: &HttpBackend, id: &RecordId) -> String {
    format!("{}{}/", backend.url(PETS_PATH), encode(id.as_str()))
}

pub async fn get(
    backend: &HttpBackend,
    id: &RecordId,
    access_token: &str,
) -> Result<PetProfile, BackendError> {
    let builder = backend.client().get(pet_url(backend, id));
    send_json(builder, access_token, &format!("pet {id}")).await
}

pub async fn update(
    backend: &HttpBackend,
    id: &RecordId,
    payload: &PetUpdate,
    access_token: &str,
) -> Result<PetProfile, BackendError> {
    let builder = backend.client().patch(pet_url(backend, id)).json(payload);
    send_json(builder, access_token, &format!("pet {id}")).await
}

pub async fn profile(
    backend: &HttpBackend,
    access_token: &str,
) -> Result<UserProfile, BackendError> {
    let builder = backend.client().get(backend.url(PROFILE_PATH));
    send_json(builder, access_token, "user profile").await
}
