//! Services module

pub mod entities;
pub mod growth;
pub mod posts;
pub mod quota;
pub mod sanitize;
pub mod scheduler;
pub mod snapshot;
pub mod sync;

pub use entities::{delete_entity, get_entity, list_entities, register_entity, update_entity};
pub use growth::{period_bounds, GrowthCalculator};
pub use posts::{
    get_cursor, get_post, recent_post_ids, set_cursor, upsert_post, UpsertOutcome,
};
pub use quota::{QuotaConfig, QuotaStatus, QuotaTracker, QuotaUsage};
pub use sanitize::{canonical_post_url, sanitize_post, RejectReason, TEXT_CAP, TRUNCATION_MARKER};
pub use scheduler::{SchedulerStatus, SyncScheduler};
pub use snapshot::SnapshotStore;
pub use sync::{list_runs, save_run, RunStats, SyncEngine, SyncEngineConfig};
