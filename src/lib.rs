//! Rehoming workflow engine: the request wizard, the cooling-period
//! lifecycle, media staging and the two-stage listing publish, served over
//! an authenticated JSON API.

pub mod api;
pub mod backend;
pub mod errors;
pub mod http;
pub mod idempotency;
pub mod inflight;
pub mod jobs;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod publisher;
pub mod security;
pub mod sessions;
pub mod uploads;
pub mod wizard;

#[cfg(test)]
pub mod testing;
