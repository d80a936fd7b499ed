use crate::{
    errors::{EngineError, ErrorKind},
    inflight::InFlightPermit,
    publisher::{PublishReceipt, PublishTarget, Publisher},
    security::CallerContext,
    sessions::SessionStore,
    wizard::WizardDraft,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
}

/// A background publish of one wizard session's draft.
pub struct PublishJob {
    pub session: Uuid,
    pub draft: WizardDraft,
    pub target: PublishTarget,
    pub context: CallerContext,
    /// The draft's submit slot. Held until the job settles.
    pub permit: InFlightPermit,
}

struct Job {
    id: Uuid,
    publish: PublishJob,
}

#[derive(Clone)]
struct JobRecord {
    owner: u64,
    state: JobState,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: PublishReceipt,
    },
    Failed {
        error: String,
        kind: ErrorKind,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    /// Starts the worker. A completed job discards its wizard session from
    /// `sessions`; a failed one leaves it so the owner can retry.
    pub fn spawn(publisher: Publisher, sessions: SessionStore) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                set_state(&statuses_bg, job.id, JobState::Running).await;

                let publish = &job.publish;
                let result = publisher
                    .publish(&publish.draft, &publish.target, &publish.context.access_token)
                    .await;
                let state = match result {
                    Ok(receipt) => {
                        info!(target: "rehoming.publisher", job_id = %job.id, listing_id = %receipt.listing.id, "publish_job_completed");
                        sessions
                            .remove(publish.session, publish.context.caller)
                            .await
                            .ok();
                        JobState::Completed { result: receipt }
                    }
                    Err(err) => {
                        warn!(target: "rehoming.publisher", job_id = %job.id, error = %err, "publish_job_failed");
                        JobState::Failed {
                            error: err.to_string(),
                            kind: err.kind(),
                        }
                    }
                };
                set_state(&statuses_bg, job.id, state).await;
                // Releases the submit slot only once the outcome is visible.
                drop(job);
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_publish(&self, publish: PublishJob) -> Result<Uuid, EngineError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(
                id,
                JobRecord {
                    owner: publish.context.caller,
                    state: JobState::Queued,
                },
            );
        }
        if self.tx.send(Job { id, publish }).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(EngineError::NetworkFailure {
                stage: "enqueue",
                detail: "publish worker not available".into(),
            });
        }
        Ok(id)
    }

    /// Jobs are only visible to the caller that queued them.
    pub async fn get(&self, id: Uuid, caller: u64) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard
            .get(&id)
            .filter(|record| record.owner == caller)
            .map(|record| JobInfo {
                id: id.to_string(),
                state: record.state.clone(),
            })
    }
}

async fn set_state(statuses: &Mutex<HashMap<Uuid, JobRecord>>, id: Uuid, state: JobState) {
    if let Some(record) = statuses.lock().await.get_mut(&id) {
        record.state = state;
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
