//! Worker orchestration modules.
//!
//! Covers worker process spawning, exit monitoring, the per-worker
//! lifecycle handle, and the account-keyed tenant registry.

pub mod child_monitor;
pub mod registry;
pub mod spawner;
pub mod worker_handle;

pub use registry::{StartAllSummary, TenantEntry, TenantRegistry};
pub use worker_handle::{EngineFacades, WorkerHandle};
