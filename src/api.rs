use crate::backend::{BackendError, RehomingBackend};
use crate::errors::{EngineError, ErrorKind};
use crate::idempotency;
use crate::inflight::InFlightGuard;
use crate::jobs::{JobInfo, JobQueue, PublishJob};
use crate::lifecycle::{CurrentRequest, RequestLifecycle};
use crate::models::{ApiError, RecordId, UserProfile};
use crate::publisher::{PublishReceipt, PublishTarget, Publisher};
use crate::security::{AuthState, CallerContext, require_bearer};
use crate::sessions::SessionStore;
use crate::uploads::{self, BatchReport, LocalFile, MediaUploader};
use crate::wizard::{
    DraftPatch, DraftSource, Flow, SessionSnapshot, Transition, WizardAction, WizardDraft,
    WizardSession, init_draft,
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn RehomingBackend>,
    uploader: Arc<dyn MediaUploader>,
    sessions: SessionStore,
    lifecycle: RequestLifecycle,
    publisher: Publisher,
    queue: JobQueue,
    inflight: InFlightGuard,
    openapi: Arc<Value>,
    idempotency: Arc<Mutex<HashMap<String, (Instant, Value)>>>,
    prometheus_handle: Option<PrometheusHandle>,
    redis: Option<redis::Client>,
    max_upload_batch: usize,
}

impl AppState {
    /// Wires the engine around the given collaborators and starts the publish
    /// worker. Must be called inside a tokio runtime.
    pub fn new(
        backend: Arc<dyn RehomingBackend>,
        uploader: Arc<dyn MediaUploader>,
    ) -> (Self, JoinHandle<()>) {
        let inflight = InFlightGuard::new();
        let sessions = SessionStore::new();
        let publisher = Publisher::new(backend.clone());
        let (queue, worker) = JobQueue::spawn(publisher.clone(), sessions.clone());
        let state = Self {
            lifecycle: RequestLifecycle::new(backend.clone(), inflight.clone()),
            backend,
            uploader,
            sessions,
            publisher,
            queue,
            inflight,
            openapi: Arc::new(json!({"openapi": "3.0.3"})),
            idempotency: Arc::new(Mutex::new(HashMap::new())),
            prometheus_handle: None,
            redis: None,
            max_upload_batch: max_upload_batch_from_env(),
        };
        (state, worker)
    }

    pub fn with_openapi(mut self, openapi: Value) -> Self {
        self.openapi = Arc::new(openapi);
        self
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus_handle = Some(handle);
        self
    }

    pub fn with_redis(mut self, client: Option<redis::Client>) -> Self {
        self.redis = client;
        self
    }

    async fn cached(&self, key: &str) -> Option<Value> {
        if let Some(client) = &self.redis {
            return idempotency::redis_get(client, key).await;
        }
        let ttl = Duration::from_secs(idempotency::ttl_from_env());
        self.idempotency
            .lock()
            .await
            .get(key)
            .filter(|(stored, _)| stored.elapsed() <= ttl)
            .map(|(_, value)| value.clone())
    }

    async fn remember(&self, key: String, value: &Value) {
        if let Some(client) = &self.redis {
            idempotency::redis_set(client, &key, value, idempotency::ttl_from_env()).await;
            return;
        }
        let ttl = Duration::from_secs(idempotency::ttl_from_env());
        let mut guard = self.idempotency.lock().await;
        guard.retain(|_, (stored, _)| stored.elapsed() <= ttl);
        guard.insert(key, (Instant::now(), value.clone()));
    }
}

pub fn router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/wizard/sessions", post(create_session))
        .route(
            "/wizard/sessions/{id}",
            get(get_session).delete(close_session),
        )
        .route(
            "/wizard/sessions/{id}/draft",
            axum::routing::patch(patch_draft),
        )
        .route("/wizard/sessions/{id}/next", post(next_step))
        .route("/wizard/sessions/{id}/back", post(previous_step))
        .route("/wizard/sessions/{id}/goto", post(goto_step))
        .route(
            "/wizard/sessions/{id}/photos",
            post(upload_photos).delete(remove_photo),
        )
        .route("/wizard/sessions/{id}/submit", post(submit_session))
        .route("/wizard/sessions/{id}/retry-listing", post(retry_listing))
        .route("/wizard/sessions/{id}/publish-jobs", post(enqueue_publish))
        .route("/jobs/{id}", get(get_job_status))
        .route("/requests/current", get(current_request))
        .route("/requests/{id}/confirm", post(confirm_request))
        .route("/requests/{id}/cancel", post(cancel_request))
        .route_layer(middleware::from_fn_with_state(auth, require_bearer));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_from_env()))
}

fn body_limit_from_env() -> usize {
    std::env::var("BODY_LIMIT_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(16 * 1024 * 1024)
}

fn max_upload_batch_from_env() -> usize {
    std::env::var("MAX_UPLOAD_BATCH")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(10)
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "rehoming-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(EngineError::NotFound("openapi document".into()).into());
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state
        .prometheus_handle
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SessionSource {
    Blank {
        #[serde(default)]
        pet_id: Option<RecordId>,
    },
    ResumedRequest {
        request_id: RecordId,
    },
    EditListing {
        listing_id: RecordId,
    },
}

impl Default for SessionSource {
    fn default() -> Self {
        SessionSource::Blank { pet_id: None }
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    flow: Option<Flow>,
    #[serde(default)]
    source: SessionSource,
}

/// The profile only seeds location, so a lookup failure is tolerated. A
/// refused access token is not: no session is opened for it.
async fn load_profile(
    state: &AppState,
    context: &CallerContext,
) -> Result<Option<UserProfile>, EngineError> {
    match state.backend.get_profile(&context.access_token).await {
        Ok(profile) => Ok(Some(profile)),
        Err(err @ BackendError::Unauthorized(_)) => {
            Err(EngineError::from_backend("load_profile", err))
        }
        Err(err) => {
            warn!(target: "rehoming.wizard", error = %err, "profile_lookup_failed");
            Ok(None)
        }
    }
}

/// Open a wizard session.
///
/// - Method: `POST`
/// - Path: `/wizard/sessions`
/// - Body: `{flow?, source: {kind: blank|resumed_request|edit_listing, ...}}`
/// - Response: session snapshot
async fn create_session(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionSnapshot>), AppError> {
    crate::metrics::inc_requests("/wizard/sessions");
    let token = &context.access_token;
    let backend = &state.backend;

    let (flow, source, blank_pet) = match payload.source {
        SessionSource::Blank { pet_id } => (
            payload.flow.unwrap_or(Flow::Request),
            DraftSource::Blank,
            Some(pet_id),
        ),
        SessionSource::ResumedRequest { request_id } => {
            let request = backend
                .get_request(&request_id, token)
                .await
                .map_err(|err| EngineError::from_backend("load_request", err))?;
            if request.status.is_terminal() {
                return Err(EngineError::TransitionRejected(format!(
                    "request {} is {}",
                    request.id,
                    request.status.as_str()
                ))
                .into());
            }
            let pet = backend
                .get_pet(&request.pet, token)
                .await
                .map_err(|err| EngineError::from_backend("load_pet", err))?;
            let profile = if request.has_location() {
                None
            } else {
                load_profile(&state, &context).await?
            };
            (
                Flow::Listing,
                DraftSource::ResumedRequest {
                    request,
                    pet,
                    profile,
                },
                None,
            )
        }
        SessionSource::EditListing { listing_id } => {
            let listing = backend
                .get_listing(&listing_id, token)
                .await
                .map_err(|err| EngineError::from_backend("load_listing", err))?;
            (Flow::Listing, DraftSource::EditListing { listing }, None)
        }
    };

    let mut store = init_draft(source);
    if let Some(pet_id) = blank_pet {
        if let Some(pet_id) = pet_id {
            store.patch(DraftPatch {
                pet_id: Some(Some(pet_id)),
                ..DraftPatch::default()
            });
        }
        if let Some(profile) = load_profile(&state, &context).await? {
            store.prefill_location(&profile);
        }
    }

    let session = WizardSession::new(flow, store);
    let snapshot = session.snapshot();
    state.sessions.insert(context.caller, session).await;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_session(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = state
        .sessions
        .with_session(id, context.caller, |s| s.snapshot())
        .await?;
    Ok(Json(snapshot))
}

/// Exit the wizard; the draft is discarded.
async fn close_session(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.sessions.remove(id, context.caller).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct StepResponse {
    transition: Transition,
    session: SessionSnapshot,
}

async fn drive(
    state: &AppState,
    context: &CallerContext,
    id: Uuid,
    action: WizardAction,
) -> Result<Json<StepResponse>, AppError> {
    let response = state
        .sessions
        .with_session(id, context.caller, |s| {
            let transition = s.apply(action);
            StepResponse {
                transition,
                session: s.snapshot(),
            }
        })
        .await?;
    Ok(Json(response))
}

async fn patch_draft(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
    Json(patch): Json<DraftPatch>,
) -> Result<Json<StepResponse>, AppError> {
    drive(&state, &context, id, WizardAction::Patch(patch)).await
}

async fn next_step(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<StepResponse>, AppError> {
    drive(&state, &context, id, WizardAction::Next).await
}

async fn previous_step(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<StepResponse>, AppError> {
    drive(&state, &context, id, WizardAction::Back).await
}

#[derive(Debug, Deserialize)]
struct GotoRequest {
    step: usize,
}

async fn goto_step(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<GotoRequest>,
) -> Result<Json<StepResponse>, AppError> {
    drive(&state, &context, id, WizardAction::Goto(payload.step)).await
}

#[derive(Debug, Deserialize)]
struct UploadFileBody {
    name: String,
    /// Base64 payload, optionally as a `data:` URL.
    data: String,
}

#[derive(Debug, Deserialize)]
struct UploadPhotosRequest {
    files: Vec<UploadFileBody>,
}

#[derive(Debug, Serialize)]
struct UploadPhotosResponse {
    report: BatchReport,
    session: SessionSnapshot,
}

fn decode_files(
    files: Vec<UploadFileBody>,
    max_batch: usize,
) -> Result<Vec<LocalFile>, EngineError> {
    if files.is_empty() {
        return Err(EngineError::validation("files", "Select at least one photo."));
    }
    if files.len() > max_batch {
        return Err(EngineError::validation(
            "files",
            format!("At most {max_batch} photos can be uploaded at once."),
        ));
    }
    let mut errors = crate::errors::FieldErrors::new();
    let mut decoded = Vec::with_capacity(files.len());
    for (index, file) in files.into_iter().enumerate() {
        let raw = file.data.trim();
        let encoded = raw
            .split_once(";base64,")
            .map(|(_, rest)| rest)
            .unwrap_or(raw);
        match STANDARD.decode(encoded) {
            Ok(bytes) => decoded.push(LocalFile::new(file.name, bytes)),
            Err(err) => errors.insert(&format!("files[{index}]"), err.to_string()),
        }
    }
    errors.into_result()?;
    Ok(decoded)
}

/// Upload a batch of photos and append the successes to the draft.
///
/// - Method: `POST`
/// - Path: `/wizard/sessions/{id}/photos`
/// - Body: `{files: [{name, data}]}`
/// - Response: per-batch report plus the session snapshot
async fn upload_photos(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UploadPhotosRequest>,
) -> Result<Json<UploadPhotosResponse>, AppError> {
    crate::metrics::inc_requests("/wizard/sessions/photos");
    let files = decode_files(payload.files, state.max_upload_batch)?;

    state
        .sessions
        .with_session(id, context.caller, |s| {
            if s.is_uploading() {
                return Err(EngineError::InFlight("upload_photos"));
            }
            s.set_uploading(true);
            Ok(())
        })
        .await??;

    let results = uploads::upload_all(state.uploader.as_ref(), &files).await;

    let (outcome, session) = state
        .sessions
        .with_session(id, context.caller, |s| {
            let outcome = uploads::merge_batch(s.store_mut(), &files, results);
            s.set_uploading(false);
            (outcome, s.snapshot())
        })
        .await?;
    let report = outcome?;
    Ok(Json(UploadPhotosResponse { report, session }))
}

#[derive(Debug, Deserialize)]
struct RemovePhotoRequest {
    url: String,
}

async fn remove_photo(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RemovePhotoRequest>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let (removed, snapshot) = state
        .sessions
        .with_session(id, context.caller, |s| {
            let removed = uploads::remove_photo(s.store_mut(), &payload.url);
            (removed, s.snapshot())
        })
        .await?;
    if !removed {
        return Err(EngineError::NotFound(format!("photo {}", payload.url)).into());
    }
    Ok(Json(snapshot))
}

fn publish_target(draft: &WizardDraft) -> Result<PublishTarget, EngineError> {
    if let Some(listing_id) = &draft.listing_id {
        return Ok(PublishTarget::Update {
            listing_id: listing_id.clone(),
        });
    }
    match &draft.request_id {
        Some(request) => Ok(PublishTarget::Create {
            request: request.clone(),
        }),
        None => Err(EngineError::validation(
            "request_id",
            "A listing must start from a confirmed rehoming request.",
        )),
    }
}

async fn submittable_draft(
    state: &AppState,
    context: &CallerContext,
    id: Uuid,
) -> Result<(Flow, WizardDraft), EngineError> {
    state
        .sessions
        .with_session(id, context.caller, |s| {
            s.ready_for_submission()
                .map(|()| (s.flow(), s.draft().clone()))
        })
        .await?
}

#[derive(Debug, Serialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
enum SubmitOutcome {
    Request { current: CurrentRequest },
    Listing { receipt: PublishReceipt },
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Submit the wizard: creates the request (request flow) or runs the
/// two-stage publish (listing flow). Replays the stored response when the
/// same `Idempotency-Key` is presented again.
async fn submit_session(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/wizard/sessions/submit");
    let replay_key =
        idempotency_key(&headers).map(|key| format!("{:016x}:{id}:{key}", context.caller));
    if let Some(key) = &replay_key
        && let Some(existing) = state.cached(key).await
    {
        info!(target: "rehoming.api", session = %id, "idempotent_replay");
        return Ok(Json(existing));
    }

    let _permit = state.inflight.try_acquire(id.to_string(), "submit")?;
    let (flow, draft) = submittable_draft(&state, &context, id).await?;
    let outcome = match flow {
        Flow::Request => {
            let payload = draft.to_request_payload()?;
            let request = state
                .lifecycle
                .submit(&payload, &context.access_token)
                .await?;
            SubmitOutcome::Request {
                current: CurrentRequest::new(request, Utc::now()),
            }
        }
        Flow::Listing => {
            let target = publish_target(&draft)?;
            let receipt = state
                .publisher
                .publish(&draft, &target, &context.access_token)
                .await?;
            SubmitOutcome::Listing { receipt }
        }
    };

    // The draft is discarded once the server has accepted it.
    state.sessions.remove(id, context.caller).await.ok();
    let body = json!(outcome);
    if let Some(key) = replay_key {
        state.remember(key, &body).await;
    }
    Ok(Json(body))
}

/// Retry only the listing stage after a partial publish failure.
async fn retry_listing(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<PublishReceipt>, AppError> {
    let _permit = state.inflight.try_acquire(id.to_string(), "submit")?;
    let (flow, draft) = submittable_draft(&state, &context, id).await?;
    if flow != Flow::Listing {
        return Err(EngineError::TransitionRejected("only listings can be retried".into()).into());
    }
    let target = publish_target(&draft)?;
    let receipt = state
        .publisher
        .retry_listing(&draft, &target, &context.access_token)
        .await?;
    state.sessions.remove(id, context.caller).await.ok();
    Ok(Json(receipt))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_publish(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/wizard/sessions/publish-jobs");
    let permit = state.inflight.try_acquire(id.to_string(), "submit")?;
    let (flow, draft) = submittable_draft(&state, &context, id).await?;
    if flow != Flow::Listing {
        return Err(EngineError::TransitionRejected(
            "only listings can be published in the background".into(),
        )
        .into());
    }
    let target = publish_target(&draft)?;
    let job_id = state
        .queue
        .enqueue_publish(PublishJob {
            session: id,
            draft,
            target,
            context: context.clone(),
            permit,
        })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: job_id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobInfo>, AppError> {
    state
        .queue
        .get(id, context.caller)
        .await
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("job {id}")).into())
}

#[derive(Debug, Serialize)]
struct CurrentResponse {
    current: Option<CurrentRequest>,
}

async fn current_request(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
) -> Result<Json<CurrentResponse>, AppError> {
    crate::metrics::inc_requests("/requests/current");
    let current = state
        .lifecycle
        .current(&context.access_token, Utc::now())
        .await?;
    Ok(Json(CurrentResponse { current }))
}

async fn confirm_request(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<String>,
) -> Result<Json<CurrentRequest>, AppError> {
    crate::metrics::inc_requests("/requests/confirm");
    let request = state
        .lifecycle
        .confirm(&RecordId::new(id), &context.access_token, Utc::now())
        .await?;
    Ok(Json(CurrentRequest::new(request, Utc::now())))
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_request(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Path(id): Path<String>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<CurrentRequest>, AppError> {
    crate::metrics::inc_requests("/requests/cancel");
    let reason = payload
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());
    let request = state
        .lifecycle
        .cancel(&RecordId::new(id), reason, &context.access_token)
        .await?;
    Ok(Json(CurrentRequest::new(request, Utc::now())))
}

#[derive(Debug)]
pub struct AppError(EngineError);

impl From<EngineError> for AppError {
    fn from(value: EngineError) -> Self {
        Self(value)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ServerRejected => StatusCode::BAD_REQUEST,
        ErrorKind::Upload | ErrorKind::CommitPartialFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::TransitionRejected | ErrorKind::InFlight => StatusCode::CONFLICT,
        ErrorKind::NetworkFailure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let kind = err.kind();
        let fields = match &err {
            EngineError::Validation(fields) => Some(fields.clone().into_map()),
            EngineError::Upload { failures, .. } => Some(
                failures
                    .iter()
                    .map(|f| (format!("files[{}]", f.index), f.error.clone()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            EngineError::CommitPartialFailure { pet_id, .. } => {
                Some(BTreeMap::from([("pet_id".to_string(), pet_id.to_string())]))
            }
            _ => None,
        };
        if status_for(kind).is_server_error() {
            warn!(target: "rehoming.api", kind = kind.as_str(), error = %err, "request_failed");
        }
        let payload = ApiError {
            error: kind.as_str().to_string(),
            detail: Some(err.to_string()),
            fields,
        };
        (status_for(kind), Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestStatus;
    use crate::testing::{FakeBackend, FakeUploader, TOKEN, sample_pet, sample_request};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use base64::Engine as _;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        backend: Arc<FakeBackend>,
        sessions: SessionStore,
    }

    fn harness_with(backend: FakeBackend, uploader: FakeUploader) -> Harness {
        let backend = Arc::new(backend);
        let (state, _worker) = AppState::new(backend.clone(), Arc::new(uploader));
        let sessions = state.sessions.clone();
        let app = router(state, AuthState::with_limits(1000.0, 1000.0));
        Harness {
            app,
            backend,
            sessions,
        }
    }

    fn harness() -> Harness {
        let backend = FakeBackend::new();
        backend.set_profile(UserProfile {
            id: None,
            location_city: Some("Denver".into()),
            location_state: Some("CO".into()),
            location_zip: Some("80202".into()),
        });
        harness_with(backend, FakeUploader::new())
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
        extra: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn open_request_session(app: &Router) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/wizard/sessions",
            Some(TOKEN),
            Some(json!({"flow": "request", "source": {"kind": "blank", "pet_id": 3}})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    async fn fill_request_flow(app: &Router, id: &str) {
        let (status, _) = call(
            app,
            Method::PATCH,
            &format!("/wizard/sessions/{id}/draft"),
            Some(TOKEN),
            Some(json!({
                "reason": "We are relocating for work and Max cannot come along with us.",
                "urgency": "soon",
                "terms_accepted": true
            })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        for _ in 0..4 {
            let (_, body) = call(
                app,
                Method::POST,
                &format!("/wizard/sessions/{id}/next"),
                Some(TOKEN),
                None,
                &[],
            )
            .await;
            assert_eq!(body["transition"]["outcome"], "advanced");
        }
    }

    #[tokio::test]
    async fn health_is_public_and_wizard_is_not() {
        let h = harness();
        let (status, body) = call(&h.app, Method::GET, "/health", None, None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&h.app, Method::GET, "/requests/current", None, None, &[]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_token");
    }

    #[tokio::test]
    async fn request_flow_submits_and_discards_the_draft() {
        let h = harness();
        let id = open_request_session(&h.app).await;
        fill_request_flow(&h.app, &id).await;

        let (status, body) = call(
            &h.app,
            Method::POST,
            &format!("/wizard/sessions/{id}/submit"),
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["flow"], "request");
        assert_eq!(body["current"]["phase"], "cooling");
        assert_eq!(body["current"]["request"]["location_city"], "Denver");
        assert!(h.backend.tokens().iter().all(|t| t == TOKEN));

        let (status, _) = call(
            &h.app,
            Method::GET,
            &format!("/wizard/sessions/{id}"),
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn idempotent_submit_creates_one_request() {
        let h = harness();
        let id = open_request_session(&h.app).await;
        fill_request_flow(&h.app, &id).await;
        let uri = format!("/wizard/sessions/{id}/submit");
        let key = [("Idempotency-Key", "submit-1")];

        let (first_status, first) =
            call(&h.app, Method::POST, &uri, Some(TOKEN), None, &key).await;
        let (second_status, second) =
            call(&h.app, Method::POST, &uri, Some(TOKEN), None, &key).await;
        assert_eq!(first_status, StatusCode::OK);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(first, second);
        assert_eq!(h.backend.calls("create_request"), 1);
    }

    #[tokio::test]
    async fn blocked_step_reports_field_errors() {
        let h = harness();
        let (_, body) = call(
            &h.app,
            Method::POST,
            "/wizard/sessions",
            Some(TOKEN),
            Some(json!({"flow": "request"})),
            &[],
        )
        .await;
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &h.app,
            Method::POST,
            &format!("/wizard/sessions/{id}/next"),
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transition"]["outcome"], "blocked");
        assert!(body["session"]["errors"]["reason"].is_string());
        assert_eq!(body["session"]["current_step"], 1);
    }

    #[tokio::test]
    async fn sessions_are_scoped_to_the_caller() {
        let h = harness();
        let id = open_request_session(&h.app).await;
        let (status, _) = call(
            &h.app,
            Method::GET,
            &format!("/wizard/sessions/{id}"),
            Some("someone-else"),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn early_confirm_is_a_conflict() {
        let h = harness();
        let mut request = sample_request(RequestStatus::CoolingPeriod);
        request.cooling_period_end = Some(Utc::now() + chrono::Duration::minutes(5));
        h.backend.insert_request(request);

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/requests/7/confirm",
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "transition_rejected");
        assert_eq!(h.backend.calls("confirm_request"), 0);

        let (status, body) = call(
            &h.app,
            Method::GET,
            "/requests/current",
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current"]["phase"], "cooling");
        assert!(body["current"]["seconds_remaining"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn cancel_keeps_the_pet_and_ends_the_request() {
        let h = harness();
        h.backend.insert_request(sample_request(RequestStatus::CoolingPeriod));
        h.backend.insert_pet(sample_pet());

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/requests/7/cancel",
            Some(TOKEN),
            Some(json!({"reason": "  Changed our minds  "})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "cancelled");
        assert_eq!(body["request"]["cancellation_reason"], "Changed our minds");
        assert_eq!(h.backend.pet(&RecordId::new("3")), Some(sample_pet()));
    }

    #[tokio::test]
    async fn photo_batch_reports_partial_and_total_failures() {
        let h = harness_with(
            FakeBackend::new(),
            FakeUploader::new().failing("b.jpg").failing("c.jpg"),
        );
        let id = open_request_session(&h.app).await;
        let uri = format!("/wizard/sessions/{id}/photos");
        let file = |name: &str| json!({"name": name, "data": STANDARD.encode(name.as_bytes())});

        let (status, body) = call(
            &h.app,
            Method::POST,
            &uri,
            Some(TOKEN),
            Some(json!({"files": [file("a.jpg"), file("b.jpg")]})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["report"]["added"].as_array().unwrap().len(), 1);
        assert_eq!(body["session"]["primary_photo"]["url"], "https://img.test/a.jpg");
        assert_eq!(body["session"]["uploading"], false);

        let (status, body) = call(
            &h.app,
            Method::POST,
            &uri,
            Some(TOKEN),
            Some(json!({"files": [file("b.jpg"), file("c.jpg")]})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "upload");
        assert!(body["fields"]["files[1]"].is_string());

        let (_, body) = call(&h.app, Method::GET, &format!("/wizard/sessions/{id}"), Some(TOKEN), None, &[]).await;
        assert_eq!(body["draft"]["photos"].as_array().unwrap().len(), 1);
        assert_eq!(body["uploading"], false);
    }

    #[tokio::test]
    async fn resumed_request_opens_a_listing_session() {
        let h = harness();
        h.backend.insert_request(sample_request(RequestStatus::Confirmed));
        h.backend.insert_pet(sample_pet());

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/wizard/sessions",
            Some(TOKEN),
            Some(json!({"source": {"kind": "resumed_request", "request_id": "7"}})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["flow"], "listing");
        assert_eq!(body["total_steps"], 7);
        assert_eq!(body["draft"]["pet_name"], "Max");
        assert_eq!(body["draft"]["request_id"], "7");
        assert_eq!(body["primary_photo"]["url"], "https://img.test/max-1.jpg");
    }

    #[test]
    fn invalid_base64_is_a_field_error() {
        let err = decode_files(
            vec![UploadFileBody {
                name: "a.jpg".into(),
                data: "***".into(),
            }],
            10,
        )
        .unwrap_err();
        assert!(err.field_errors().unwrap().contains("files[0]"));

        let ok = decode_files(
            vec![UploadFileBody {
                name: "a.jpg".into(),
                data: format!("data:image/jpeg;base64,{}", STANDARD.encode(b"jpeg")),
            }],
            10,
        )
        .unwrap();
        assert_eq!(ok[0].bytes, b"jpeg");
    }

    async fn open_listing_session(h: &Harness) -> String {
        h.backend
            .insert_request(sample_request(RequestStatus::Confirmed));
        h.backend.insert_pet(sample_pet());
        let (status, body) = call(
            &h.app,
            Method::POST,
            "/wizard/sessions",
            Some(TOKEN),
            Some(json!({"source": {"kind": "resumed_request", "request_id": "7"}})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let id = body["id"].as_str().unwrap().to_string();
        for _ in 0..6 {
            let (_, body) = call(
                &h.app,
                Method::POST,
                &format!("/wizard/sessions/{id}/next"),
                Some(TOKEN),
                None,
                &[],
            )
            .await;
            assert_eq!(body["transition"]["outcome"], "advanced", "{body}");
        }
        id
    }

    async fn wait_for_job(app: &Router, job_id: &str) -> Value {
        for _ in 0..100 {
            let (_, body) = call(
                app,
                Method::GET,
                &format!("/jobs/{job_id}"),
                Some(TOKEN),
                None,
                &[],
            )
            .await;
            if body["state"] == "completed" || body["state"] == "failed" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not settle");
    }

    #[tokio::test]
    async fn goto_moves_between_visited_listing_steps() {
        let h = harness();
        let id = open_listing_session(&h).await;
        let uri = format!("/wizard/sessions/{id}/goto");

        let (_, body) = call(&h.app, Method::POST, &uri, Some(TOKEN), Some(json!({"step": 2})), &[]).await;
        assert_eq!(body["transition"]["outcome"], "retreated");
        assert_eq!(body["session"]["step"], "location");

        let (_, body) = call(&h.app, Method::POST, &uri, Some(TOKEN), Some(json!({"step": 7})), &[]).await;
        assert_eq!(body["transition"]["outcome"], "advanced");
        assert_eq!(body["session"]["step"], "review");
    }

    #[tokio::test]
    async fn partial_publish_keeps_the_draft_and_retry_only_reruns_the_listing() {
        let h = harness();
        let id = open_listing_session(&h).await;
        h.backend
            .fail("create_listing", BackendError::Unavailable(503));

        let (status, body) = call(
            &h.app,
            Method::POST,
            &format!("/wizard/sessions/{id}/submit"),
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY, "{body}");
        assert_eq!(body["error"], "commit_partial_failure");
        assert_eq!(body["fields"]["pet_id"], "3");

        let session_uri = format!("/wizard/sessions/{id}");
        let (status, _) = call(&h.app, Method::GET, &session_uri, Some(TOKEN), None, &[]).await;
        assert_eq!(status, StatusCode::OK);

        h.backend.clear_failures();
        let (status, body) = call(
            &h.app,
            Method::POST,
            &format!("/wizard/sessions/{id}/retry-listing"),
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["stages"][0]["name"], "publish_listing");
        assert_eq!(h.backend.calls("update_pet"), 1);
        assert_eq!(h.backend.calls("create_listing"), 2);

        let (status, _) = call(&h.app, Method::GET, &session_uri, Some(TOKEN), None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn background_publish_discards_the_draft_on_success() {
        let h = harness();
        let id = open_listing_session(&h).await;

        let (status, body) = call(
            &h.app,
            Method::POST,
            &format!("/wizard/sessions/{id}/publish-jobs"),
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let job = wait_for_job(&h.app, &job_id).await;
        assert_eq!(job["state"], "completed", "{job}");
        assert_eq!(h.backend.calls("create_listing"), 1);

        let (status, _) = call(
            &h.app,
            Method::GET,
            &format!("/jobs/{job_id}"),
            Some("someone-else"),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &h.app,
            Method::GET,
            &format!("/wizard/sessions/{id}"),
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn concurrent_submit_and_background_publish_create_one_listing() {
        let backend = FakeBackend::new().with_delay("create_listing", 150);
        let h = harness_with(backend, FakeUploader::new());
        let id = open_listing_session(&h).await;
        let submit_uri = format!("/wizard/sessions/{id}/submit");
        let jobs_uri = format!("/wizard/sessions/{id}/publish-jobs");

        let ((submit, _), (queued, job)) = tokio::join!(
            call(&h.app, Method::POST, &submit_uri, Some(TOKEN), None, &[]),
            call(&h.app, Method::POST, &jobs_uri, Some(TOKEN), None, &[]),
        );

        let losers = [StatusCode::CONFLICT, StatusCode::NOT_FOUND];
        if queued == StatusCode::ACCEPTED {
            assert!(losers.contains(&submit), "submit={submit}");
            let settled = wait_for_job(&h.app, job["job_id"].as_str().unwrap()).await;
            assert_eq!(settled["state"], "completed");
        } else {
            assert_eq!(submit, StatusCode::OK);
            assert!(losers.contains(&queued), "publish-jobs={queued}");
        }
        assert_eq!(h.backend.calls("update_pet"), 1);
        assert_eq!(h.backend.calls("create_listing"), 1);
    }

    #[tokio::test]
    async fn refused_access_token_opens_no_session() {
        let h = harness();
        h.backend
            .fail("get_profile", BackendError::Unauthorized(401));

        for n in 0..20 {
            let (status, body) = call(
                &h.app,
                Method::POST,
                "/wizard/sessions",
                Some(&format!("garbage-{n}")),
                Some(json!({"source": {"kind": "blank"}})),
                &[],
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["error"], "unauthorized");
        }
        assert_eq!(h.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn expired_token_on_confirm_is_unauthorized_not_a_conflict() {
        let h = harness();
        h.backend
            .insert_request(sample_request(RequestStatus::CoolingPeriod));
        h.backend
            .fail("confirm_request", BackendError::Unauthorized(401));

        let (status, body) = call(
            &h.app,
            Method::POST,
            "/requests/7/confirm",
            Some(TOKEN),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }
}
