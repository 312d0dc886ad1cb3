//! Table, index, and full-text index setup.
//!
//! Every statement is idempotent, so [`initialize`] runs on each open.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{GraphError, Result};

const CORE_SCHEMA: &str = r#"
-- Entities: surrogate id internally, unique name externally
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL
) STRICT;

-- Observations: one row per (entity, content) pair
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    UNIQUE(entity_id, content),
    FOREIGN KEY(entity_id) REFERENCES entities(id) ON DELETE CASCADE
) STRICT;

-- Relations with FOREIGN KEY for cascade delete
CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_entity_id INTEGER NOT NULL,
    to_entity_id INTEGER NOT NULL,
    relation_type TEXT NOT NULL,
    UNIQUE(from_entity_id, to_entity_id, relation_type),
    FOREIGN KEY(from_entity_id) REFERENCES entities(id) ON DELETE CASCADE,
    FOREIGN KEY(to_entity_id) REFERENCES entities(id) ON DELETE CASCADE
) STRICT;

CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name);
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);
CREATE INDEX IF NOT EXISTS idx_observations_entity ON observations(entity_id);
CREATE INDEX IF NOT EXISTS idx_observations_content ON observations(content);
CREATE INDEX IF NOT EXISTS idx_relations_from ON relations(from_entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_type ON relations(relation_type);
"#;

const FULL_TEXT_TABLES: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
    entity_id UNINDEXED,
    name,
    entity_type,
    tokenize = 'porter unicode61'
);

CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    observation_id UNINDEXED,
    entity_id UNINDEXED,
    content,
    tokenize = 'porter unicode61'
);
"#;

// Shadow index maintenance. FK cascades fire the delete triggers too.
const FULL_TEXT_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS entities_ai AFTER INSERT ON entities BEGIN
    INSERT INTO entities_fts(entity_id, name, entity_type)
    VALUES (new.id, new.name, new.entity_type);
END;

CREATE TRIGGER IF NOT EXISTS entities_ad AFTER DELETE ON entities BEGIN
    DELETE FROM entities_fts WHERE entity_id = old.id;
END;

CREATE TRIGGER IF NOT EXISTS entities_au AFTER UPDATE ON entities BEGIN
    DELETE FROM entities_fts WHERE entity_id = old.id;
    INSERT INTO entities_fts(entity_id, name, entity_type)
    VALUES (new.id, new.name, new.entity_type);
END;

CREATE TRIGGER IF NOT EXISTS observations_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(observation_id, entity_id, content)
    VALUES (new.id, new.entity_id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS observations_ad AFTER DELETE ON observations BEGIN
    DELETE FROM observations_fts WHERE observation_id = old.id;
END;

CREATE TRIGGER IF NOT EXISTS observations_au AFTER UPDATE ON observations BEGIN
    DELETE FROM observations_fts WHERE observation_id = old.id;
    INSERT INTO observations_fts(observation_id, entity_id, content)
    VALUES (new.id, new.entity_id, new.content);
END;
"#;

const REBUILD_FULL_TEXT: &str = r#"
DELETE FROM entities_fts;
INSERT INTO entities_fts(entity_id, name, entity_type)
    SELECT id, name, entity_type FROM entities;

DELETE FROM observations_fts;
INSERT INTO observations_fts(observation_id, entity_id, content)
    SELECT id, entity_id, content FROM observations;

INSERT INTO entities_fts(entities_fts) VALUES ('optimize');
INSERT INTO observations_fts(observations_fts) VALUES ('optimize');
"#;

/// Create tables and indexes, then try to enable full-text search.
///
/// Returns whether full-text search is available. A SQLite build without
/// FTS5 only logs a warning; any other DDL failure is fatal.
pub fn initialize(conn: &Connection, want_full_text: bool) -> Result<bool> {
    conn.execute_batch(CORE_SCHEMA)
        .map_err(|e| GraphError::Setup(format!("failed to create core tables: {e}")))?;
    debug!("core schema ready");

    if !want_full_text {
        info!("Full-text search disabled by configuration, using substring search");
        return Ok(false);
    }

    // Tables, triggers and backfill land together or not at all
    let tx = conn.unchecked_transaction()?;
    if let Err(err) = tx.execute_batch(FULL_TEXT_TABLES) {
        if is_missing_fts5(&err) {
            warn!("FTS5 not available, skipping full-text search setup");
            return Ok(false);
        }
        return Err(GraphError::Setup(format!(
            "failed to create full-text tables: {err}"
        )));
    }

    tx.execute_batch(FULL_TEXT_TRIGGERS)
        .map_err(|e| GraphError::Setup(format!("failed to create full-text triggers: {e}")))?;

    // Rows written while full-text was off (or by an older store) are missing
    if index_out_of_sync(&tx)? {
        info!("Full-text index does not match base tables, rebuilding");
        rebuild_full_text(&tx)?;
    }
    tx.commit()?;

    info!("FTS5 enabled successfully");
    Ok(true)
}

/// Repopulate both shadow indexes from the base tables.
///
/// The caller owns the surrounding transaction.
pub fn rebuild_full_text(conn: &Connection) -> Result<()> {
    conn.execute_batch(REBUILD_FULL_TEXT)?;
    Ok(())
}

fn is_missing_fts5(err: &rusqlite::Error) -> bool {
    err.to_string().contains("no such module: fts5")
}

/// Row counts of the shadow indexes differ from their base tables
fn index_out_of_sync(conn: &Connection) -> Result<bool> {
    let stale = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM entities) != (SELECT COUNT(*) FROM entities_fts)
             OR (SELECT COUNT(*) FROM observations) != (SELECT COUNT(*) FROM observations_fts)",
        [],
        |row| row.get::<_, bool>(0),
    )?;
    Ok(stale)
}
