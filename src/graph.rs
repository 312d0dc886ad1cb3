use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Entity in the knowledge graph
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Entity {
    /// Unique name of the entity (serves as ID)
    pub name: String,

    /// Type of entity (person, organization, concept, etc.)
    #[serde(rename = "entityType")]
    pub entity_type: String,

    /// Facts about the entity; each string is stored at most once
    #[serde(default)]
    pub observations: Vec<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            observations: Vec::new(),
        }
    }

    pub fn with_observations<I, S>(mut self, observations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observations = observations.into_iter().map(Into::into).collect();
        self
    }
}

/// Directed relation between two entities
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct Relation {
    /// Source entity name
    pub from: String,

    /// Target entity name
    pub to: String,

    /// Type of relation, in active voice (works_at, knows, depends_on, etc.)
    #[serde(rename = "relationType")]
    pub relation_type: String,
}

impl Relation {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relation_type: relation_type.into(),
        }
    }
}

/// Snapshot of (part of) the knowledge graph
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct KnowledgeGraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl KnowledgeGraph {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

/// Input for adding observations to an entity
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservationInput {
    #[serde(rename = "entityName")]
    pub entity_name: String,
    pub contents: Vec<String>,
}

/// Result of adding observations
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservationResult {
    #[serde(rename = "entityName")]
    pub entity_name: String,
    #[serde(rename = "addedObservations")]
    pub added_observations: Vec<String>,
}

/// Input for deleting observations from an entity
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservationDeletion {
    #[serde(rename = "entityName")]
    pub entity_name: String,
    pub observations: Vec<String>,
}

/// Row counts of the store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub entities: u64,
    pub observations: u64,
    pub relations: u64,
    #[serde(rename = "fullTextEnabled")]
    pub full_text_enabled: bool,
}
