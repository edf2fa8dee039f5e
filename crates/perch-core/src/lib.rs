//! # perch-core
//!
//! Core sync engine for Perch: polls a social platform's REST API for the
//! posts and follower metrics of a set of tracked organizations, persists
//! them to SQLite, and derives growth figures over time.
//!
//! This crate provides:
//! - Database operations (`db` module)
//! - Data models (`models` module)
//! - The platform API contract and HTTP client (`api` module)
//! - Quota tracking, incremental sync, growth math, scheduling (`services` module)
//! - Unified error handling (`error` module)

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

// Re-exports for convenience
pub use db::Database;
pub use error::{Error, Result};

// Re-export commonly used types from models
pub use models::{
    CreateEntity, FollowerSnapshot, GrowthPeriod, GrowthPeriodType, NewPost, Post, SyncCursor,
    SyncRun, TrackedEntity, UpdateEntity, WindowGrowth,
};

// Re-export commonly used types from api and services
pub use api::{ApiConfig, ApiError, HttpSocialApi, SocialApi};
pub use services::{
    GrowthCalculator, QuotaConfig, QuotaStatus, QuotaTracker, SchedulerStatus, SnapshotStore,
    SyncEngine, SyncEngineConfig, SyncScheduler,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
