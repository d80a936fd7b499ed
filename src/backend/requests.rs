use crate::backend::config::REQUESTS_PATH;
use crate::backend::{BackendError, HttpBackend, Page, send, send_json};
use crate::models::{CancelRequestBody, NewRehomingRequest, RecordId, RehomingRequest};
use urlencoding::encode;

fn request_url(backend: &HttpBackend, id: &RecordId, action: Option<&str>) -> String {
    let base = backend.url(REQUESTS_PATH);
    match action {
        Some(action) => format!("{base}{}/{action}/", encode(id.as_str())),
        None => format!("{base}{}/", encode(id.as_str())),
    }
}

pub async fn list(
    backend: &HttpBackend,
    access_token: &str,
) -> Result<Vec<RehomingRequest>, BackendError> {
    let builder = backend.client().get(backend.url(REQUESTS_PATH));
    let page: Page<RehomingRequest> = send_json(builder, access_token, "rehoming requests").await?;
    Ok(page.into_items())
}

pub async fn get(
    backend: &HttpBackend,
    id: &RecordId,
    access_token: &str,
) -> Result<RehomingRequest, BackendError> {
    let builder = backend.client().get(request_url(backend, id, None));
    send_json(builder, access_token, &format!("rehoming request {id}")).await
}

pub async fn create(
    backend: &HttpBackend,
    payload: &NewRehomingRequest,
    access_token: &str,
) -> Result<RehomingRequest, BackendError> {
    let builder = backend
        .client()
        .post(backend.url(REQUESTS_PATH))
        .json(payload);
    send_json(builder, access_token, "rehoming requests").await
}

pub async fn confirm(
    backend: &HttpBackend,
    id: &RecordId,
    access_token: &str,
) -> Result<(), BackendError> {
    let builder = backend
        .client()
        .post(request_url(backend, id, Some("confirm")));
    send(builder, access_token, &format!("rehoming request {id}")).await?;
    Ok(())
}

pub async fn cancel(
    backend: &HttpBackend,
    id: &RecordId,
    reason: &str,
    access_token: &str,
) -> Result<(), BackendError> {
    let body = CancelRequestBody {
        reason: reason.trim().to_string(),
    };
    let builder = backend
        .client()
        .post(request_url(backend, id, Some("cancel")))
        .json(&body);
    send(builder, access_token, &format!("rehoming request {id}")).await?;
    Ok(())
}
