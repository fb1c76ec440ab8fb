#![warn(clippy::all, missing_docs)]

//! Core engine for the GW2 dashboard.
//!
//! This crate hosts API key management, the authenticated request
//! dispatcher, per-key account synchronisation and the build/equipment
//! resolution pipeline used by the command line frontend and any
//! future frontends.

pub mod api;
pub mod client;
pub mod config;
pub mod credentials;
pub mod fingerprint;
pub mod resolve;
pub mod storage;
pub mod sync;

pub use api::{ApiError, Dispatcher, RequestOptions};
pub use client::{AddResult, Gw2Client, Snapshot};
pub use config::AppConfig;
pub use credentials::{CredentialEntry, CredentialStore, SelectionState};
pub use resolve::{LatestRequest, ResolvedBuild, ResolvedEquipment};
pub use storage::{FileStateStore, MemoryStateStore, StateStore};
pub use sync::{AccountSnapshot, SyncEvent};
