use std::collections::HashSet;
use std::time::Instant;

use rusqlite::params;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::graph::{Entity, ObservationDeletion, ObservationInput, ObservationResult, Relation};
use crate::storage::{check_cancelled, json_keys, lookup_entity_id, Database, SELECT_ENTITY_ID};

const INSERT_ENTITY: &str =
    "INSERT INTO entities (name, entity_type) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING";
const INSERT_OBSERVATION: &str = "INSERT INTO observations (entity_id, content) VALUES (?1, ?2)
     ON CONFLICT(entity_id, content) DO NOTHING";
const INSERT_RELATION: &str =
    "INSERT INTO relations (from_entity_id, to_entity_id, relation_type) VALUES (?1, ?2, ?3)
     ON CONFLICT(from_entity_id, to_entity_id, relation_type) DO NOTHING";

/// Mutations. Each call is one write transaction; nothing is visible unless
/// the whole call succeeds.
impl Database {
    /// Create entities (returns only newly created entities, in input order).
    ///
    /// Names that already exist are skipped. Repeated observation strings
    /// within one entity are stored once.
    pub fn create_entities(
        &self,
        entities: &[Entity],
        cancel: &CancellationToken,
    ) -> Result<Vec<Entity>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        debug!(count = entities.len(), "creating entities");

        let created = self.write(cancel, |tx| {
            let mut insert_entity = tx.prepare_cached(INSERT_ENTITY)?;
            let mut insert_observation = tx.prepare_cached(INSERT_OBSERVATION)?;
            let mut created = Vec::new();

            for entity in entities {
                check_cancelled(cancel)?;
                // 0 rows: name already taken (possibly earlier in this batch)
                if insert_entity.execute(params![&entity.name, &entity.entity_type])? == 0 {
                    continue;
                }
                let entity_id = tx.last_insert_rowid();

                let observations = unique_in_order(&entity.observations);
                for content in &observations {
                    insert_observation.execute(params![entity_id, content])?;
                }

                created.push(Entity {
                    name: entity.name.clone(),
                    entity_type: entity.entity_type.clone(),
                    observations,
                });
            }
            Ok(created)
        })?;

        info!(
            requested = entities.len(),
            created = created.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "entities created"
        );
        Ok(created)
    }

    /// Create relations (returns only newly created relations, in input order).
    ///
    /// Relations naming a missing entity and existing triples are skipped.
    pub fn create_relations(
        &self,
        relations: &[Relation],
        cancel: &CancellationToken,
    ) -> Result<Vec<Relation>> {
        if relations.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let created = self.write(cancel, |tx| {
            let mut lookup = tx.prepare_cached(SELECT_ENTITY_ID)?;
            let mut insert = tx.prepare_cached(INSERT_RELATION)?;
            let mut created = Vec::new();

            for rel in relations {
                check_cancelled(cancel)?;
                let (Some(from_id), Some(to_id)) = (
                    lookup_entity_id(&mut lookup, &rel.from)?,
                    lookup_entity_id(&mut lookup, &rel.to)?,
                ) else {
                    debug!(from = %rel.from, to = %rel.to, "skipping relation with unknown endpoint");
                    continue;
                };

                if insert.execute(params![from_id, to_id, &rel.relation_type])? > 0 {
                    created.push(rel.clone());
                }
            }
            Ok(created)
        })?;

        info!(
            requested = relations.len(),
            created = created.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "relations created"
        );
        Ok(created)
    }

    /// Add observations to existing entities.
    ///
    /// Fails with [`GraphError::EntityNotFound`] (and writes nothing) if any
    /// entity is missing. Each result lists only the strings actually stored.
    pub fn add_observations(
        &self,
        inputs: &[ObservationInput],
        cancel: &CancellationToken,
    ) -> Result<Vec<ObservationResult>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let results = self.write(cancel, |tx| {
            let mut lookup = tx.prepare_cached(SELECT_ENTITY_ID)?;
            let mut insert = tx.prepare_cached(INSERT_OBSERVATION)?;
            let mut results = Vec::with_capacity(inputs.len());

            for input in inputs {
                check_cancelled(cancel)?;
                let entity_id = lookup_entity_id(&mut lookup, &input.entity_name)?
                    .ok_or_else(|| GraphError::EntityNotFound(input.entity_name.clone()))?;

                // The unique index also catches repeats within this call
                let mut added = Vec::new();
                for content in &input.contents {
                    if insert.execute(params![entity_id, content])? > 0 {
                        added.push(content.clone());
                    }
                }

                results.push(ObservationResult {
                    entity_name: input.entity_name.clone(),
                    added_observations: added,
                });
            }
            Ok(results)
        })?;

        info!(
            entities = results.len(),
            added = results.iter().map(|r| r.added_observations.len()).sum::<usize>(),
            "observations added"
        );
        Ok(results)
    }

    /// Delete entities by name (cascade deletes observations and relations).
    ///
    /// Unknown names are ignored. Returns the number of entities removed.
    pub fn delete_entities(&self, names: &[String], cancel: &CancellationToken) -> Result<usize> {
        if names.is_empty() {
            return Ok(0);
        }

        let keys = json_keys(names)?;
        let count = self.write(cancel, |tx| {
            Ok(tx.execute(
                "DELETE FROM entities WHERE name IN (SELECT value FROM json_each(?1))",
                params![keys],
            )?)
        })?;

        info!(requested = names.len(), deleted = count, "entities deleted");
        Ok(count)
    }

    /// Delete observations by exact content.
    ///
    /// Unknown entities and contents are ignored.
    pub fn delete_observations(
        &self,
        deletions: &[ObservationDeletion],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if deletions.is_empty() {
            return Ok(());
        }

        let removed = self.write(cancel, |tx| {
            let mut lookup = tx.prepare_cached(SELECT_ENTITY_ID)?;
            let mut delete =
                tx.prepare_cached("DELETE FROM observations WHERE entity_id = ?1 AND content = ?2")?;
            let mut removed = 0;

            for deletion in deletions {
                check_cancelled(cancel)?;
                let Some(entity_id) = lookup_entity_id(&mut lookup, &deletion.entity_name)? else {
                    continue;
                };
                for content in &deletion.observations {
                    removed += delete.execute(params![entity_id, content])?;
                }
            }
            Ok(removed)
        })?;

        info!(removed, "observations deleted");
        Ok(())
    }

    /// Delete relations by exact (from, to, type) triple.
    ///
    /// Unknown endpoints and triples are ignored. Returns the number removed.
    pub fn delete_relations(
        &self,
        relations: &[Relation],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if relations.is_empty() {
            return Ok(0);
        }

        let count = self.write(cancel, |tx| {
            let mut lookup = tx.prepare_cached(SELECT_ENTITY_ID)?;
            let mut delete = tx.prepare_cached(
                "DELETE FROM relations
                 WHERE from_entity_id = ?1 AND to_entity_id = ?2 AND relation_type = ?3",
            )?;
            let mut count = 0;

            for rel in relations {
                check_cancelled(cancel)?;
                let (Some(from_id), Some(to_id)) = (
                    lookup_entity_id(&mut lookup, &rel.from)?,
                    lookup_entity_id(&mut lookup, &rel.to)?,
                ) else {
                    continue;
                };
                count += delete.execute(params![from_id, to_id, &rel.relation_type])?;
            }
            Ok(count)
        })?;

        info!(requested = relations.len(), deleted = count, "relations deleted");
        Ok(count)
    }
}

/// First occurrence of each string, in input order
fn unique_in_order(items: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn unique_in_order_keeps_first_occurrence() {
        let items: Vec<String> = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unique_in_order(&items), ["b", "a", "c"]);
    }

    #[test]
    fn duplicate_names_within_one_batch_create_once() {
        let db = db();
        let ct = CancellationToken::new();
        let created = db
            .create_entities(
                &[
                    Entity::new("Alice", "person").with_observations(["x", "x", "y"]),
                    Entity::new("Alice", "robot"),
                ],
                &ct,
            )
            .unwrap();

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].entity_type, "person");
        assert_eq!(created[0].observations, ["x", "y"]);
        assert_eq!(db.stats().unwrap().observations, 2);
    }

    #[test]
    fn missing_entity_rolls_back_earlier_observations() {
        let db = db();
        let ct = CancellationToken::new();
        db.create_entities(&[Entity::new("Alice", "person")], &ct).unwrap();

        let err = db
            .add_observations(
                &[
                    ObservationInput {
                        entity_name: "Alice".into(),
                        contents: vec!["likes tea".into()],
                    },
                    ObservationInput {
                        entity_name: "Ghost".into(),
                        contents: vec!["boo".into()],
                    },
                ],
                &ct,
            )
            .unwrap_err();

        assert!(matches!(err, GraphError::EntityNotFound(ref name) if name == "Ghost"));
        assert_eq!(db.stats().unwrap().observations, 0);
    }

    #[test]
    fn same_entity_twice_in_one_call_reports_net_new_only() {
        let db = db();
        let ct = CancellationToken::new();
        db.create_entities(&[Entity::new("Alice", "person").with_observations(["a"])], &ct)
            .unwrap();

        let results = db
            .add_observations(
                &[
                    ObservationInput {
                        entity_name: "Alice".into(),
                        contents: vec!["a".into(), "b".into()],
                    },
                    ObservationInput {
                        entity_name: "Alice".into(),
                        contents: vec!["b".into(), "c".into()],
                    },
                ],
                &ct,
            )
            .unwrap();

        assert_eq!(results[0].added_observations, ["b"]);
        assert_eq!(results[1].added_observations, ["c"]);
    }

    #[test]
    fn delete_counts_only_existing_rows() {
        let db = db();
        let ct = CancellationToken::new();
        db.create_entities(&[Entity::new("A", "t"), Entity::new("B", "t")], &ct)
            .unwrap();
        db.create_relations(&[Relation::new("A", "B", "knows")], &ct).unwrap();

        let removed = db
            .delete_relations(
                &[
                    Relation::new("A", "B", "knows"),
                    Relation::new("A", "B", "knows"),
                    Relation::new("A", "Nobody", "knows"),
                ],
                &ct,
            )
            .unwrap();
        assert_eq!(removed, 1);

        let removed = db
            .delete_entities(&["A".into(), "A".into(), "Nobody".into()], &ct)
            .unwrap();
        assert_eq!(removed, 1);
    }
}
