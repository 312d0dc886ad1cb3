use std::collections::HashMap;
use std::time::Instant;

use rusqlite::params;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::graph::{Entity, KnowledgeGraph, Relation};
use crate::search::matching_entity_ids;
use crate::storage::{json_keys, load_entities, relations_among, Database};

/// Reads. Each call sees one snapshot of the store.
impl Database {
    /// Read entire graph: entities by name, relations by (from, to, type)
    pub fn read_graph(&self, cancel: &CancellationToken) -> Result<KnowledgeGraph> {
        let start = Instant::now();
        let graph = self.read(cancel, |tx| {
            let mut entities = Vec::new();
            let mut index: HashMap<i64, usize> = HashMap::new();

            let mut stmt = tx.prepare_cached("SELECT id, name, entity_type FROM entities ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, Entity::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
            })?;
            for row in rows {
                let (id, entity) = row?;
                index.insert(id, entities.len());
                entities.push(entity);
            }

            let mut stmt = tx.prepare_cached("SELECT entity_id, content FROM observations ORDER BY id")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (id, content) = row?;
                if let Some(&pos) = index.get(&id) {
                    entities[pos].observations.push(content);
                }
            }

            let mut stmt = tx.prepare_cached(
                "SELECT f.name, t.name, r.relation_type
                 FROM relations r
                 JOIN entities f ON r.from_entity_id = f.id
                 JOIN entities t ON r.to_entity_id = t.id
                 ORDER BY f.name, t.name, r.relation_type",
            )?;
            let rows = stmt.query_map([], |row| {
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

            Ok(KnowledgeGraph { entities, relations })
        })?;

        info!(
            entities = graph.entities.len(),
            relations = graph.relations.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "graph read"
        );
        Ok(graph)
    }

    /// Entities matching `query`, plus the relations among them.
    ///
    /// An empty query matches every entity.
    pub fn search_nodes(&self, query: &str, cancel: &CancellationToken) -> Result<KnowledgeGraph> {
        let mode = self.search_mode();
        let full_text = self.is_full_text_enabled();

        let graph = self.read(cancel, |tx| {
            let ids = matching_entity_ids(tx, query, mode, full_text)?;
            let entities = load_entities(tx, &ids)?;
            let relations = relations_among(tx, &ids)?;
            Ok(KnowledgeGraph { entities, relations })
        })?;

        debug!(
            query,
            entities = graph.entities.len(),
            relations = graph.relations.len(),
            "search finished"
        );
        Ok(graph)
    }

    /// Open specific nodes by name, plus the relations among them.
    ///
    /// Unknown names are dropped and repeated names collapse to one entity.
    pub fn open_nodes(&self, names: &[String], cancel: &CancellationToken) -> Result<KnowledgeGraph> {
        if names.is_empty() {
            return Ok(KnowledgeGraph::default());
        }

        let keys = json_keys(names)?;
        self.read(cancel, |tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM entities
                 WHERE name IN (SELECT value FROM json_each(?1))
                 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![keys], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }

            let entities = load_entities(tx, &ids)?;
            let relations = relations_among(tx, &ids)?;
            Ok(KnowledgeGraph { entities, relations })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchMode;
    use crate::storage::StoreOptions;

    fn fruit_store(options: StoreOptions) -> Database {
        let db = Database::open_in_memory_with(options).unwrap();
        let ct = CancellationToken::new();
        db.create_entities(
            &[
                Entity::new("Apple", "Fruit").with_observations(["Red and tasty"]),
                Entity::new("Banana", "Fruit").with_observations(["Yellow and sweet"]),
                Entity::new("Carrot", "Vegetable").with_observations(["Orange root, tastes sweet"]),
            ],
            &ct,
        )
        .unwrap();
        db.create_relations(&[Relation::new("Banana", "Apple", "sits_next_to")], &ct)
            .unwrap();
        db
    }

    fn names(graph: &KnowledgeGraph) -> Vec<&str> {
        graph.entities.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn substring_mode_matches_partial_words_case_insensitively() {
        let db = fruit_store(StoreOptions {
            search_mode: SearchMode::Substring,
            ..StoreOptions::default()
        });
        let ct = CancellationToken::new();

        assert_eq!(names(&db.search_nodes("APP", &ct).unwrap()), ["Apple"]);
        assert_eq!(names(&db.search_nodes("fruit", &ct).unwrap()), ["Apple", "Banana"]);
        assert_eq!(names(&db.search_nodes("sweet", &ct).unwrap()), ["Banana", "Carrot"]);
        assert!(db.search_nodes("zebra", &ct).unwrap().is_empty());
    }

    #[test]
    fn full_text_mode_stems_words() {
        let db = fruit_store(StoreOptions::default());
        let ct = CancellationToken::new();

        // porter: "tasty"/"tastes" do not share a stem, "sweets" -> "sweet"
        assert_eq!(names(&db.search_nodes("sweets", &ct).unwrap()), ["Banana", "Carrot"]);
        let graph = db.search_nodes("fruit", &ct).unwrap();
        assert_eq!(names(&graph), ["Apple", "Banana"]);
        assert_eq!(graph.relations, [Relation::new("Banana", "Apple", "sits_next_to")]);
    }

    #[test]
    fn ranked_mode_puts_name_and_type_hits_first() {
        let db = fruit_store(StoreOptions {
            search_mode: SearchMode::Ranked,
            ..StoreOptions::default()
        });
        let ct = CancellationToken::new();
        db.create_entities(&[Entity::new("Orange", "Fruit")], &ct).unwrap();

        // "Orange" is a name for one entity and only an observation for Carrot
        assert_eq!(names(&db.search_nodes("orange", &ct).unwrap()), ["Orange", "Carrot"]);
    }

    #[test]
    fn full_text_operators_are_literal() {
        let db = fruit_store(StoreOptions::default());
        let ct = CancellationToken::new();

        assert!(db.search_nodes("apple OR banana", &ct).unwrap().is_empty());
        assert!(db.search_nodes("NOT \"", &ct).unwrap().is_empty());
    }

    #[test]
    fn read_graph_orders_entities_and_relations() {
        let db = fruit_store(StoreOptions::default());
        let ct = CancellationToken::new();
        db.create_relations(
            &[
                Relation::new("Apple", "Carrot", "b"),
                Relation::new("Apple", "Carrot", "a"),
                Relation::new("Apple", "Apple", "self"),
            ],
            &ct,
        )
        .unwrap();

        let graph = db.read_graph(&ct).unwrap();
        assert_eq!(names(&graph), ["Apple", "Banana", "Carrot"]);
        assert_eq!(
            graph.relations,
            [
                Relation::new("Apple", "Apple", "self"),
                Relation::new("Apple", "Carrot", "a"),
                Relation::new("Apple", "Carrot", "b"),
                Relation::new("Banana", "Apple", "sits_next_to"),
            ]
        );
    }
}
