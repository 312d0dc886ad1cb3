//! Request validation applied before anything reaches the store.

use crate::error::{GraphError, Result};
use crate::graph::{Entity, ObservationDeletion, ObservationInput, Relation};

// Validation constants
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_TYPE_LENGTH: usize = 100;
pub const MAX_OBSERVATION_LENGTH: usize = 5000;
pub const MAX_ITEMS_PER_REQUEST: usize = 1000;
pub const MAX_OBSERVATIONS_PER_ITEM: usize = 100;
pub const MAX_QUERY_LENGTH: usize = 500;

macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err(GraphError::Validation(format!($($arg)*)))
    };
}

/// Validate entity name (non-empty, bounded, no control characters)
pub fn validate_name(name: &str, field: &str) -> Result<()> {
    if name.is_empty() {
        invalid!("{field} cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        invalid!("{field} too long (max {MAX_NAME_LENGTH} bytes)");
    }
    if name.chars().any(char::is_control) {
        invalid!("{field} contains invalid characters");
    }
    Ok(())
}

/// Validate entity or relation type
pub fn validate_type(type_str: &str, field: &str) -> Result<()> {
    if type_str.is_empty() {
        invalid!("{field} cannot be empty");
    }
    if type_str.len() > MAX_TYPE_LENGTH {
        invalid!("{field} too long (max {MAX_TYPE_LENGTH} bytes)");
    }
    if type_str.chars().any(char::is_control) {
        invalid!("{field} contains invalid characters");
    }
    Ok(())
}

/// Validate observation content (newlines and tabs are fine, NUL is not)
pub fn validate_observation(obs: &str, field: &str) -> Result<()> {
    if obs.is_empty() {
        invalid!("{field} cannot be empty");
    }
    if obs.len() > MAX_OBSERVATION_LENGTH {
        invalid!("{field} too long (max {MAX_OBSERVATION_LENGTH} bytes)");
    }
    if obs.contains('\0') {
        invalid!("{field} contains null bytes");
    }
    Ok(())
}

pub fn validate_query(query: &str) -> Result<()> {
    if query.len() > MAX_QUERY_LENGTH {
        invalid!("Search query too long (max {MAX_QUERY_LENGTH} bytes)");
    }
    if query.contains('\0') {
        invalid!("Search query contains null bytes");
    }
    Ok(())
}

fn check_batch(len: usize, what: &str) -> Result<()> {
    if len > MAX_ITEMS_PER_REQUEST {
        invalid!("too many {what} in request: {len} (max {MAX_ITEMS_PER_REQUEST})");
    }
    Ok(())
}

fn check_observation_list(items: &[String], field: &str) -> Result<()> {
    if items.len() > MAX_OBSERVATIONS_PER_ITEM {
        invalid!(
            "{field}: too many observations: {} (max {MAX_OBSERVATIONS_PER_ITEM})",
            items.len()
        );
    }
    for (j, obs) in items.iter().enumerate() {
        validate_observation(obs, &format!("{field}[{j}]"))?;
    }
    Ok(())
}

pub fn validate_entities(entities: &[Entity]) -> Result<()> {
    check_batch(entities.len(), "entities")?;
    for (i, entity) in entities.iter().enumerate() {
        validate_name(&entity.name, &format!("entities[{i}].name"))?;
        validate_type(&entity.entity_type, &format!("entities[{i}].entityType"))?;
        check_observation_list(&entity.observations, &format!("entities[{i}].observations"))?;
    }
    Ok(())
}

pub fn validate_relations(relations: &[Relation]) -> Result<()> {
    check_batch(relations.len(), "relations")?;
    for (i, rel) in relations.iter().enumerate() {
        validate_name(&rel.from, &format!("relations[{i}].from"))?;
        validate_name(&rel.to, &format!("relations[{i}].to"))?;
        validate_type(&rel.relation_type, &format!("relations[{i}].relationType"))?;
    }
    Ok(())
}

pub fn validate_observation_inputs(inputs: &[ObservationInput]) -> Result<()> {
    check_batch(inputs.len(), "observation inputs")?;
    for (i, input) in inputs.iter().enumerate() {
        validate_name(&input.entity_name, &format!("observations[{i}].entityName"))?;
        check_observation_list(&input.contents, &format!("observations[{i}].contents"))?;
    }
    Ok(())
}

pub fn validate_observation_deletions(deletions: &[ObservationDeletion]) -> Result<()> {
    check_batch(deletions.len(), "deletions")?;
    for (i, deletion) in deletions.iter().enumerate() {
        validate_name(&deletion.entity_name, &format!("deletions[{i}].entityName"))?;
        check_observation_list(&deletion.observations, &format!("deletions[{i}].observations"))?;
    }
    Ok(())
}

pub fn validate_names(names: &[String], field: &str) -> Result<()> {
    check_batch(names.len(), field)?;
    for (i, name) in names.iter().enumerate() {
        validate_name(name, &format!("{field}[{i}]"))?;
    }
    Ok(())
}
