//! Monitored entities and their discovery.

use mesrun_core::BoxError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An external entity (a machine) analyzed by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredEntity {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub obsolete: bool,
}

impl MonitoredEntity {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            obsolete: false,
        }
    }
}

/// Source of monitored entities, queried once at engine construction.
pub trait EntityProvider: Send + Sync {
    fn monitored_entities(&self) -> Result<Vec<MonitoredEntity>, BoxError>;
}

/// A fixed list of entities.
#[derive(Debug, Clone, Default)]
pub struct StaticEntityProvider {
    entities: Vec<MonitoredEntity>,
}

impl StaticEntityProvider {
    pub fn new(entities: Vec<MonitoredEntity>) -> Self {
        Self { entities }
    }
}

impl EntityProvider for StaticEntityProvider {
    fn monitored_entities(&self) -> Result<Vec<MonitoredEntity>, BoxError> {
        Ok(self.entities.clone())
    }
}

/// Allow-list of entity ids. Unrestricted when built from an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    ids: Option<BTreeSet<u32>>,
}

impl EntityFilter {
    /// Accepts every entity.
    pub fn all() -> Self {
        Self::default()
    }

    /// Parses a comma, semicolon or space separated list of ids.
    ///
    /// Tokens that are not ids are logged and ignored. An empty list
    /// accepts every entity; a non-empty list without any valid id accepts
    /// none.
    pub fn parse(list: &str) -> Self {
        if list.is_empty() {
            return Self::all();
        }
        let mut ids = BTreeSet::new();
        for token in list
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            match token.parse::<u32>() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(_) => tracing::warn!("Invalid entity id '{}' in filter, ignored", token),
            }
        }
        if ids.is_empty() {
            tracing::warn!("No valid entity id in filter '{}', no entity selected", list);
        }
        Self { ids: Some(ids) }
    }

    pub fn accepts(&self, id: u32) -> bool {
        self.ids.as_ref().map_or(true, |ids| ids.contains(&id))
    }

    pub fn is_restricted(&self) -> bool {
        self.ids.is_some()
    }

    /// Keeps the accepted, non-obsolete entities, ordered by id.
    pub fn select(&self, entities: Vec<MonitoredEntity>) -> Vec<MonitoredEntity> {
        let mut selected: Vec<MonitoredEntity> = entities
            .into_iter()
            .filter(|e| !e.obsolete && self.accepts(e.id))
            .collect();
        selected.sort_by_key(|e| e.id);
        selected.dedup_by_key(|e| e.id);
        selected
    }
}
