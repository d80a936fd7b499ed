//! Rehoming request lifecycle.
//!
//! The backend owns `status` and `cooling_period_end`. Everything here either
//! derives a view from those two fields or asks the backend to transition and
//! then re-reads the request; the local copy is never edited in place.

use crate::backend::RehomingBackend;
use crate::errors::EngineError;
use crate::inflight::InFlightGuard;
use crate::models::{NewRehomingRequest, RecordId, RehomingRequest, RequestStatus};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Cooling,
    ReadyToConfirm,
    Live,
    Cancelled,
}

/// A missing deadline counts as elapsed.
pub fn cooling_elapsed(request: &RehomingRequest, now: DateTime<Utc>) -> bool {
    request.cooling_period_end.is_none_or(|end| now >= end)
}

pub fn derive_phase(request: &RehomingRequest, now: DateTime<Utc>) -> Phase {
    match request.status {
        RequestStatus::Active => Phase::Live,
        RequestStatus::Cancelled => Phase::Cancelled,
        RequestStatus::CoolingPeriod | RequestStatus::Confirmed => {
            if cooling_elapsed(request, now) {
                Phase::ReadyToConfirm
            } else {
                Phase::Cooling
            }
        }
    }
}

/// Recomputed on every read; `None` outside the cooling phase.
pub fn time_remaining(request: &RehomingRequest, now: DateTime<Utc>) -> Option<Duration> {
    if derive_phase(request, now) != Phase::Cooling {
        return None;
    }
    request.cooling_period_end.map(|end| end - now)
}

pub fn check_confirm(request: &RehomingRequest, now: DateTime<Utc>) -> Result<(), EngineError> {
    match request.status {
        RequestStatus::CoolingPeriod | RequestStatus::Confirmed => {
            if cooling_elapsed(request, now) {
                Ok(())
            } else {
                let ends = request
                    .cooling_period_end
                    .map(|end| end.to_rfc3339())
                    .unwrap_or_default();
                Err(EngineError::TransitionRejected(format!(
                    "cooling period ends at {ends}"
                )))
            }
        }
        other => Err(EngineError::TransitionRejected(format!(
            "cannot confirm a request that is {}",
            other.as_str()
        ))),
    }
}

pub fn check_cancel(request: &RehomingRequest) -> Result<(), EngineError> {
    match request.status {
        RequestStatus::CoolingPeriod | RequestStatus::Confirmed => Ok(()),
        other => Err(EngineError::TransitionRejected(format!(
            "cannot cancel a request that is {}",
            other.as_str()
        ))),
    }
}

fn newest<'a>(
    requests: &'a [RehomingRequest],
    filter: impl Fn(&RehomingRequest) -> bool,
) -> Option<&'a RehomingRequest> {
    requests
        .iter()
        .enumerate()
        .filter(|(_, request)| filter(request))
        .max_by_key(|(index, request)| (request.created_at, *index))
        .map(|(_, request)| request)
}

/// The one request shown to the user: the newest `confirmed` request, else
/// the newest non-terminal one, else the newest of any status.
pub fn select_current(requests: &[RehomingRequest]) -> Option<&RehomingRequest> {
    newest(requests, |r| r.status == RequestStatus::Confirmed)
        .or_else(|| newest(requests, |r| !r.status.is_terminal()))
        .or_else(|| newest(requests, |_| true))
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentRequest {
    pub request: RehomingRequest,
    pub phase: Phase,
    pub seconds_remaining: Option<i64>,
}

impl CurrentRequest {
    pub fn new(request: RehomingRequest, now: DateTime<Utc>) -> Self {
        let phase = derive_phase(&request, now);
        let seconds_remaining = time_remaining(&request, now).map(|left| left.num_seconds());
        Self {
            request,
            phase,
            seconds_remaining,
        }
    }
}

#[derive(Clone)]
pub struct RequestLifecycle {
    backend: Arc<dyn RehomingBackend>,
    inflight: InFlightGuard,
}

impl RequestLifecycle {
    pub fn new(backend: Arc<dyn RehomingBackend>, inflight: InFlightGuard) -> Self {
        Self { backend, inflight }
    }

    async fn refetch(
        &self,
        id: &RecordId,
        access_token: &str,
        stage: &'static str,
    ) -> Result<RehomingRequest, EngineError> {
        self.backend
            .get_request(id, access_token)
            .await
            .map_err(|err| EngineError::from_backend(stage, err))
    }

    pub async fn submit(
        &self,
        payload: &NewRehomingRequest,
        access_token: &str,
    ) -> Result<RehomingRequest, EngineError> {
        let _permit = self.inflight.try_acquire(payload.pet.as_str(), "submit_request")?;
        let created = self
            .backend
            .create_request(payload, access_token)
            .await
            .map_err(|err| EngineError::from_backend("submit_request", err))?;
        info!(target: "rehoming.api", request_id = %created.id, pet_id = %payload.pet, "rehoming_request_submitted");
        crate::metrics::transition("submit", "ok");
        self.refetch(&created.id, access_token, "submit_request").await
    }

    pub async fn confirm(
        &self,
        id: &RecordId,
        access_token: &str,
        now: DateTime<Utc>,
    ) -> Result<RehomingRequest, EngineError> {
        let _permit = self.inflight.try_acquire(id.as_str(), "confirm")?;
        let current = self.refetch(id, access_token, "confirm_request").await?;
        if let Err(err) = check_confirm(&current, now) {
            warn!(target: "rehoming.api", request_id = %id, error = %err, "confirm_rejected_preflight");
            crate::metrics::transition("confirm", "rejected");
            return Err(err);
        }
        self.backend
            .confirm_request(id, access_token)
            .await
            .map_err(|err| EngineError::from_transition("confirm_request", err))?;
        info!(target: "rehoming.api", request_id = %id, "rehoming_request_confirmed");
        crate::metrics::transition("confirm", "ok");
        self.refetch(id, access_token, "confirm_request").await
    }

    pub async fn cancel(
        &self,
        id: &RecordId,
        reason: Option<&str>,
        access_token: &str,
    ) -> Result<RehomingRequest, EngineError> {
        let _permit = self.inflight.try_acquire(id.as_str(), "cancel")?;
        let current = self.refetch(id, access_token, "cancel_request").await?;
        check_cancel(&current)?;
        self.backend
            .cancel_request(id, reason.unwrap_or_default(), access_token)
            .await
            .map_err(|err| EngineError::from_transition("cancel_request", err))?;
        info!(target: "rehoming.api", request_id = %id, pet_id = %current.pet, "rehoming_request_cancelled");
        crate::metrics::transition("cancel", "ok");
        self.refetch(id, access_token, "cancel_request").await
    }

    pub async fn current(
        &self,
        access_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CurrentRequest>, EngineError> {
        let requests = self
            .backend
            .list_requests(access_token)
            .await
            .map_err(|err| EngineError::from_backend("list_requests", err))?;
        Ok(select_current(&requests).map(|request| CurrentRequest::new(request.clone(), now)))
    }
}
