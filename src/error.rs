use thiserror::Error;

/// Errors crossing the knowledge graph core boundary.
///
/// Duplicate inserts and dangling references in relation/delete calls are
/// resolved inside the store and never show up here; the returned values
/// are the only signal of what was actually written.
#[derive(Debug, Error)]
pub enum GraphError {
    /// `add_observations` referenced an entity that does not exist.
    #[error("Cannot add observations: entity '{0}' does not exist")]
    EntityNotFound(String),

    /// Input rejected before it reached the store.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Schema initialization failed for a reason other than missing FTS5.
    #[error("Database setup failed: {0}")]
    Setup(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller cancelled the request; nothing was committed.
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking store task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl GraphError {
    /// True for errors caused by the request itself rather than the store.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::EntityNotFound(_) | Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
