pub mod audit;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod model;
pub mod quota;
pub mod reconciler;
pub mod rest;
pub mod scheduler;
pub mod store;

pub use audit::{OstackAuditLogger, create_audit_logger};
pub use config::SyncConfig;
pub use engine::{Intent, SubmitReceipt, SyncEngine};
pub use error::{Result, SyncError};
pub use model::{ResourceKind, ResourceRecord, ResourceState};
pub use store::{DataStore, Event, SqliteStore, StoreError};
