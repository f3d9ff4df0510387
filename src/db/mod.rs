//! Work item persistence: row models and SQL repositories.
//!
//! - `model`: raw rows as stored in SQLite and their conversion into domain items.
//! - `repo`: SQL-only functions plus the `WorkItemRepository` seam the producer
//!   depends on.
//!
//! Callers import from `media_producer::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::WorkItemRow;
