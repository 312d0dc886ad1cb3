use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{self, Config};
use crate::error::{GraphError, Result};
use crate::graph::{
    Entity, GraphStats, KnowledgeGraph, ObservationDeletion, ObservationInput, ObservationResult,
    Relation,
};
use crate::storage::{Database, StoreOptions};
use crate::validation;

/// Manager for knowledge graph operations
///
/// Owns the store handle for the life of the process. Input is validated
/// here, then every store call runs on the blocking pool with the caller's
/// cancellation token.
pub struct KnowledgeGraphManager {
    db: Arc<Database>,
}

impl KnowledgeGraphManager {
    /// Create new manager with database at given path
    pub fn new(db_path: PathBuf) -> Result<Self> {
        Self::with_options(db_path, StoreOptions::default())
    }

    pub fn with_options(db_path: PathBuf, options: StoreOptions) -> Result<Self> {
        let db_path = config::validate_db_path(&db_path)?;
        let db = if config::is_in_memory(&db_path) {
            Database::open_in_memory_with(options)?
        } else {
            Database::open_with(&db_path, options)?
        };
        Ok(Self::from_database(db))
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_options(config.db_path.clone(), config.store_options())
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn run<T, F>(&self, cancel: CancellationToken, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &CancellationToken) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db, &cancel))
            .await
            .map_err(|e| GraphError::Task(e.to_string()))?
    }

    /// Create entities (returns only newly created entities)
    pub async fn create_entities(
        &self,
        entities: Vec<Entity>,
        cancel: CancellationToken,
    ) -> Result<Vec<Entity>> {
        validation::validate_entities(&entities)?;
        self.run(cancel, move |db, ct| db.create_entities(&entities, ct)).await
    }

    /// Create relations (returns only newly created relations)
    pub async fn create_relations(
        &self,
        relations: Vec<Relation>,
        cancel: CancellationToken,
    ) -> Result<Vec<Relation>> {
        validation::validate_relations(&relations)?;
        self.run(cancel, move |db, ct| db.create_relations(&relations, ct)).await
    }

    /// Add observations to multiple entities (fails if any entity is missing)
    pub async fn add_observations(
        &self,
        inputs: Vec<ObservationInput>,
        cancel: CancellationToken,
    ) -> Result<Vec<ObservationResult>> {
        validation::validate_observation_inputs(&inputs)?;
        self.run(cancel, move |db, ct| db.add_observations(&inputs, ct)).await
    }

    /// Delete entities (cascade deletes observations and relations)
    pub async fn delete_entities(&self, names: Vec<String>, cancel: CancellationToken) -> Result<usize> {
        validation::validate_names(&names, "entityNames")?;
        self.run(cancel, move |db, ct| db.delete_entities(&names, ct)).await
    }

    /// Delete observations from multiple entities
    pub async fn delete_observations(
        &self,
        deletions: Vec<ObservationDeletion>,
        cancel: CancellationToken,
    ) -> Result<()> {
        validation::validate_observation_deletions(&deletions)?;
        self.run(cancel, move |db, ct| db.delete_observations(&deletions, ct)).await
    }

    /// Delete relations
    pub async fn delete_relations(
        &self,
        relations: Vec<Relation>,
        cancel: CancellationToken,
    ) -> Result<usize> {
        validation::validate_relations(&relations)?;
        self.run(cancel, move |db, ct| db.delete_relations(&relations, ct)).await
    }

    /// Read entire knowledge graph
    pub async fn read_graph(&self, cancel: CancellationToken) -> Result<KnowledgeGraph> {
        self.run(cancel, |db, ct| db.read_graph(ct)).await
    }

    /// Search nodes by name, type, or observation content
    pub async fn search_nodes(&self, query: String, cancel: CancellationToken) -> Result<KnowledgeGraph> {
        validation::validate_query(&query)?;
        self.run(cancel, move |db, ct| db.search_nodes(&query, ct)).await
    }

    /// Open specific nodes by names
    pub async fn open_nodes(&self, names: Vec<String>, cancel: CancellationToken) -> Result<KnowledgeGraph> {
        validation::validate_names(&names, "names")?;
        self.run(cancel, move |db, ct| db.open_nodes(&names, ct)).await
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        self.run(CancellationToken::new(), |db, _| db.stats()).await
    }

    pub async fn rebuild_search_index(&self) -> Result<()> {
        self.run(CancellationToken::new(), |db, _| db.rebuild_search_index()).await
    }
}
