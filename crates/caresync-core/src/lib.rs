//! caresync-core - Offline-first synchronization core for CareSync
//!
//! This crate contains the encrypted local store, the pending-change
//! queue, the push/pull sync engine, conflict resolution, clock-skew
//! correction, and the connectivity monitor used by all CareSync
//! device frontends.

pub mod api;
pub mod clock;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod network;
pub mod resolver;
pub mod status;
pub mod store;

pub use clock::{ClockConfig, ClockService};
pub use engine::{BackoffConfig, CycleOutcome, CycleStats, EngineConfig, SyncEngine};
pub use error::{Error, Result};
pub use models::{
    Conflict, EntityLocalId, EntityType, LocalEntity, PendingChange, SyncStatus,
};
pub use network::NetworkMonitor;
pub use resolver::{ConflictResolver, ResolutionPolicy};
pub use status::{BannerState, SyncSummary};
pub use store::{LocalStore, StorePath};
