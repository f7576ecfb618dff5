//! Durable state: scope tree, resource records and the quota ledger.
//!
//! # Architecture
//!
//! ```text
//! executor / reconciler / ledger → Arc<dyn DataStore>
//!                                      ↓
//!                                SqliteStore (sqlx, one writer)
//! ```
//!
//! Every state change is a compare-and-set `UPDATE ... WHERE state = ?`
//! inside a transaction; events are broadcast after commit.

mod error;
mod event;
mod sqlite;
mod traits;

pub use error::{Result, StoreError};
pub use event::Event;
pub use sqlite::SqliteStore;
pub use traits::*;
