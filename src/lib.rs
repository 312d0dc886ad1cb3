//! Persistent knowledge graph memory backed by SQLite.
//!
//! Entities carry a type and a set of observations; relations are directed,
//! typed edges between entities. Every mutation is one transaction, every
//! read one snapshot. `search_nodes` uses FTS5 when available and falls back
//! to substring matching otherwise.

pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod manager;
mod mutation;
mod query;
pub mod schema;
pub mod search;
pub mod storage;
pub mod validation;

pub use error::{GraphError, Result};
pub use graph::{
    Entity, GraphStats, KnowledgeGraph, ObservationDeletion, ObservationInput, ObservationResult,
    Relation,
};
pub use manager::KnowledgeGraphManager;
pub use search::SearchMode;
pub use storage::{Database, StoreOptions};
