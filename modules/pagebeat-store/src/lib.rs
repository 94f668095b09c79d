//! Persistence for audits, the job queue, windowed counters, and
//! cross-process leases.
//!
//! Four narrow traits cover the concerns; `PgStore` implements all of
//! them on one Postgres pool and `MemoryStore` mirrors the semantics
//! for tests and single-process runs.

pub mod memory;
pub mod pg;
pub mod schema;
pub mod traits;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use schema::ensure_schema;
pub use traits::{AuditStore, CounterStore, JobQueue, LockStore, NewWebhookDelivery};
