use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, CachedStatement, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::graph::{Entity, GraphStats, Relation};
use crate::schema;
use crate::search::SearchMode;

/// Tuning knobs for opening a [`Database`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Create full-text tables and triggers if the SQLite build supports them
    pub full_text: bool,
    /// Strategy used by `search_nodes`
    pub search_mode: SearchMode,
    /// How long a writer waits for the write lock before giving up
    pub busy_timeout: Duration,
    /// Pool size for file-backed stores (in-memory stores always use one)
    pub max_connections: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            full_text: true,
            search_mode: SearchMode::default(),
            busy_timeout: Duration::from_secs(5),
            max_connections: 8,
        }
    }
}

/// Connection customizer to set PRAGMAs on every new connection
#[derive(Debug)]
struct SqliteCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        // Enable FOREIGN KEY constraints (off by default!)
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA cache_size = -64000;",
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(())
    }
}

/// Store handle shared by every graph operation.
///
/// Writers take the SQLite write lock up front (`BEGIN IMMEDIATE`) and queue
/// on `busy_timeout`; readers run in a deferred transaction, which under WAL
/// pins one snapshot for the whole call.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    full_text: bool,
    search_mode: SearchMode,
}

impl Database {
    /// Open or create a database file with default options
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(options.max_connections.max(1))
            .connection_customizer(Box::new(SqliteCustomizer {
                busy_timeout: options.busy_timeout,
            }))
            .build(manager)?;

        {
            let conn = pool.get()?;
            // WAL mode for concurrent reads; persisted in the file
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }

        info!(path = %path.display(), "opened database");
        Self::initialize(pool, options)
    }

    /// Private store that lives as long as this handle.
    ///
    /// Every pooled connection to `:memory:` is its own database, so the pool
    /// is pinned to a single connection that never expires.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(StoreOptions::default())
    }

    pub fn open_in_memory_with(options: StoreOptions) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_customizer(Box::new(SqliteCustomizer {
                busy_timeout: options.busy_timeout,
            }))
            .build(SqliteConnectionManager::memory())?;

        debug!("opened in-memory database");
        Self::initialize(pool, options)
    }

    fn initialize(pool: Pool<SqliteConnectionManager>, options: StoreOptions) -> Result<Self> {
        let full_text = {
            let conn = pool.get()?;
            schema::initialize(&conn, options.full_text)?
        };

        info!(
            full_text,
            search_mode = %options.search_mode,
            "database initialized successfully"
        );
        Ok(Self {
            pool,
            full_text,
            search_mode: options.search_mode,
        })
    }

    /// Whether full-text tables and triggers were set up at open time
    pub fn is_full_text_enabled(&self) -> bool {
        self.full_text
    }

    pub fn search_mode(&self) -> SearchMode {
        self.search_mode
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits only if `f` succeeds and the call was not
    /// cancelled in the meantime; otherwise it is dropped and rolled back.
    pub(crate) fn write<T>(
        &self,
        cancel: &CancellationToken,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        check_cancelled(cancel)?;
        let mut conn = self.pool.get()?;
        let _watch = InterruptOnCancel::watch(&conn, cancel);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx).map_err(|e| cancelled_or(cancel, e))?;
        check_cancelled(cancel)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` inside one read transaction (a single consistent snapshot).
    pub(crate) fn read<T>(
        &self,
        cancel: &CancellationToken,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        check_cancelled(cancel)?;
        let mut conn = self.pool.get()?;
        let _watch = InterruptOnCancel::watch(&conn, cancel);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx).map_err(|e| cancelled_or(cancel, e))?;
        check_cancelled(cancel)?;
        tx.commit()?;
        Ok(value)
    }

    /// Row counts taken from one snapshot
    pub fn stats(&self) -> Result<GraphStats> {
        let full_text_enabled = self.full_text;
        self.read(&CancellationToken::new(), |tx| {
            let count = |table: &str| -> Result<u64> {
                let n: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
                Ok(n as u64)
            };
            Ok(GraphStats {
                entities: count("entities")?,
                observations: count("observations")?,
                relations: count("relations")?,
                full_text_enabled,
            })
        })
    }

    /// Rebuild and optimize the full-text indexes (e.g. after bulk imports).
    ///
    /// No-op when full-text search is disabled.
    pub fn rebuild_search_index(&self) -> Result<()> {
        if !self.full_text {
            debug!("full-text disabled, skipping index rebuild");
            return Ok(());
        }
        self.write(&CancellationToken::new(), |tx| schema::rebuild_full_text(tx))?;
        info!("full-text index rebuilt");
        Ok(())
    }
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(GraphError::Cancelled);
    }
    Ok(())
}

/// A statement aborted by the interrupt surfaces as a SQLite error
fn cancelled_or(cancel: &CancellationToken, err: GraphError) -> GraphError {
    if cancel.is_cancelled() {
        GraphError::Cancelled
    } else {
        err
    }
}

/// Interrupts the connection's running statement once the token fires.
///
/// Needs a tokio runtime (store calls run on `spawn_blocking`); without one
/// cancellation is only observed between statements. The watcher is aborted
/// on drop, before the connection goes back to the pool.
struct InterruptOnCancel(Option<JoinHandle<()>>);

impl InterruptOnCancel {
    fn watch(conn: &Connection, cancel: &CancellationToken) -> Self {
        let Ok(runtime) = Handle::try_current() else {
            return Self(None);
        };
        let interrupt = conn.get_interrupt_handle();
        let cancel = cancel.clone();
        Self(Some(runtime.spawn(async move {
            cancel.cancelled().await;
            interrupt.interrupt();
        })))
    }
}

impl Drop for InterruptOnCancel {
    fn drop(&mut self) {
        if let Some(watcher) = self.0.take() {
            watcher.abort();
        }
    }
}

/// Bind a key set as one parameter; SQL reads it back with `json_each(?N)`.
pub(crate) fn json_keys<T: serde::Serialize>(keys: &[T]) -> Result<String> {
    Ok(serde_json::to_string(keys)?)
}

pub(crate) fn lookup_entity_id(stmt: &mut CachedStatement<'_>, name: &str) -> Result<Option<i64>> {
    Ok(stmt.query_row(params![name], |row| row.get(0)).optional()?)
}

pub(crate) const SELECT_ENTITY_ID: &str = "SELECT id FROM entities WHERE name = ?1";

/// Load entities with their observations, in the order of `ids`.
pub(crate) fn load_entities(conn: &Connection, ids: &[i64]) -> Result<Vec<Entity>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let keys = json_keys(ids)?;

    let mut by_id: HashMap<i64, Entity> = HashMap::with_capacity(ids.len());
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, entity_type FROM entities
         WHERE id IN (SELECT value FROM json_each(?1))",
    )?;
    let rows = stmt.query_map(params![keys], |row| {
        Ok((row.get::<_, i64>(0)?, Entity::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
    })?;
    for row in rows {
        let (id, entity) = row?;
        by_id.insert(id, entity);
    }

    let mut stmt = conn.prepare_cached(
        "SELECT entity_id, content FROM observations
         WHERE entity_id IN (SELECT value FROM json_each(?1))
         ORDER BY id",
    )?;
    let rows = stmt.query_map(params![keys], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (id, content) = row?;
        if let Some(entity) = by_id.get_mut(&id) {
            entity.observations.push(content);
        }
    }

    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

/// Relations whose endpoints are both in `ids`, ordered by (from, to, type).
pub(crate) fn relations_among(conn: &Connection, ids: &[i64]) -> Result<Vec<Relation>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let keys = json_keys(ids)?;

    let mut stmt = conn.prepare_cached(
        "SELECT f.name, t.name, r.relation_type
         FROM relations r
         JOIN entities f ON r.from_entity_id = f.id
         JOIN entities t ON r.to_entity_id = t.id
         WHERE r.from_entity_id IN (SELECT value FROM json_each(?1))
           AND r.to_entity_id IN (SELECT value FROM json_each(?1))
         ORDER BY f.name, t.name, r.relation_type",
    )?;
    let rows = stmt.query_map(params![keys], |row| {
        Ok(Relation {
            from: row.get(0)?,
            to: row.get(1)?,
            relation_type: row.get(2)?,
        })
    })?;

    let mut relations = Vec::new();
    for row in rows {
        relations.push(row?);
    }
    Ok(relations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Entity;

    #[test]
    fn in_memory_store_survives_multiple_calls() {
        let db = Database::open_in_memory().unwrap();
        let ct = CancellationToken::new();
        db.create_entities(&[Entity::new("Alice", "person")], &ct).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.entities, 1);
        assert!(stats.full_text_enabled);
    }

    #[test]
    fn cancelled_write_commits_nothing() {
        let db = Database::open_in_memory().unwrap();
        let ct = CancellationToken::new();
        ct.cancel();

        let err = db
            .create_entities(&[Entity::new("Alice", "person")], &ct)
            .unwrap_err();
        assert!(matches!(err, GraphError::Cancelled));
        assert_eq!(db.stats().unwrap().entities, 0);
    }

    #[test]
    fn cancellation_inside_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let ct = CancellationToken::new();

        let err = db
            .write(&ct, |tx| {
                tx.execute(
                    "INSERT INTO entities (name, entity_type) VALUES ('Alice', 'person')",
                    [],
                )?;
                ct.cancel();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, GraphError::Cancelled));
        assert_eq!(db.stats().unwrap().entities, 0);
    }

    #[test]
    fn load_entities_keeps_requested_order() {
        let db = Database::open_in_memory().unwrap();
        let ct = CancellationToken::new();
        db.create_entities(
            &[
                Entity::new("A", "t").with_observations(["a1", "a2"]),
                Entity::new("B", "t").with_observations(["b1"]),
            ],
            &ct,
        )
        .unwrap();

        let loaded = db
            .read(&ct, |tx| load_entities(tx, &[2, 1, 99]))
            .unwrap();
        let names: Vec<_> = loaded.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["B", "A"]);
        assert_eq!(loaded[1].observations, ["a1", "a2"]);
    }

    #[test]
    fn rebuild_search_index_without_full_text_is_noop() {
        let db = Database::open_in_memory_with(StoreOptions {
            full_text: false,
            ..StoreOptions::default()
        })
        .unwrap();
        assert!(!db.is_full_text_enabled());
        db.rebuild_search_index().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_interrupts_running_statement() {
        let db = std::sync::Arc::new(Database::open_in_memory().unwrap());
        let ct = CancellationToken::new();

        let task = {
            let db = std::sync::Arc::clone(&db);
            let ct = ct.clone();
            tokio::task::spawn_blocking(move || {
                db.read(&ct, |tx| {
                    // Never finishes on its own
                    let n: i64 = tx.query_row(
                        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c)
                         SELECT COUNT(*) FROM c",
                        [],
                        |r| r.get(0),
                    )?;
                    Ok(n)
                })
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        ct.cancel();

        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("statement was not interrupted")
            .unwrap();
        assert!(matches!(result, Err(GraphError::Cancelled)));

        // The connection is usable again afterwards
        assert_eq!(db.stats().unwrap().entities, 0);
    }
}
