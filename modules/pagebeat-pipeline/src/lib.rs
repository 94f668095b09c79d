//! The audit pipeline: staged jobs that turn a submitted URL into a
//! scored PDF report and a signed webhook delivery.
//!
//! Admission enqueues `fetch_insights`; each stage enqueues the next on
//! success. The worker owns scheduling: per-stage deadlines, retry
//! backoff, quota deferrals, and terminal failure handling. Stages are
//! written to be replayed: a crashed worker's job is recovered and run
//! again, and every stage tolerates finding its own work already done.

pub mod admission;
pub mod deps;
pub mod error;
pub mod fetch;
pub mod notify;
pub mod pdf;
pub mod quota;
pub mod report;
pub mod screenshots;
pub mod signature;
pub mod webhook;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use deps::PipelineDeps;
pub use error::{StageError, StageResult};
pub use worker::Worker;
