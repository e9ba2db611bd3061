//! Client-side sync engine for the EduGo user data bundle.
//!
//! The bundle is a set of independently hashed buckets (menu, permissions,
//! screens, ...) cached in a local redb store and reconciled against the
//! server by comparing per-bucket hashes.

pub mod api;
pub mod bundle;
pub mod config;
pub mod service;
pub mod state;
pub mod store;

pub use api::{HttpSyncApi, SyncApi};
pub use bundle::{Bucket, ReceivedBundle, UserDataBundle};
pub use config::Config;
pub use service::{LaunchOutcome, SyncService};
pub use state::{BundleSyncState, SyncError, SyncGuard, SyncResult};
pub use store::LocalSyncStore;
