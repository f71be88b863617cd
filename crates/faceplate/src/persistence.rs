//! Faceplate persistence records and the persistence collaborator.
//!
//! A faceplate record is the persisted configuration of one bound visual
//! panel: its binding definitions, script modules and notification channels.
//! The engine consumes records wholesale on load; it never edits them.

use std::fs;
use std::path::PathBuf;

use futures_util::future::LocalBoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::engine::events::EventHandler;
use crate::engine::graph::BindingDefinition;
use crate::error::PersistenceError;
use crate::value::Value;

/// Source text of one named script module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptModuleDef {
    pub name: String,
    pub source: String,
}

/// Externally-configured notification channel: extra store fields to watch
/// beyond what the binding expressions themselves reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Persisted configuration of one faceplate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceplateRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bindings: Vec<BindingDefinition>,
    #[serde(default)]
    pub modules: Vec<ScriptModuleDef>,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannel>,
    #[serde(default)]
    pub components: Vec<String>,
}

/// Persisted configuration of one visual component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
    #[serde(default)]
    pub events: IndexMap<String, EventHandler>,
}

/// The persistence collaborator, as seen by the engine and editor.
pub trait Persistence {
    fn read_faceplate<'a>(
        &'a self,
        id: &'a str,
    ) -> LocalBoxFuture<'a, Result<FaceplateRecord, PersistenceError>>;

    fn write_faceplate<'a>(
        &'a self,
        record: &'a FaceplateRecord,
    ) -> LocalBoxFuture<'a, Result<(), PersistenceError>>;

    fn read_components<'a>(
        &'a self,
        ids: &'a [String],
    ) -> LocalBoxFuture<'a, Result<Vec<ComponentRecord>, PersistenceError>>;

    fn create_component<'a>(
        &'a self,
        record: &'a ComponentRecord,
    ) -> LocalBoxFuture<'a, Result<(), PersistenceError>>;

    fn delete_component<'a>(
        &'a self,
        id: &'a str,
    ) -> LocalBoxFuture<'a, Result<(), PersistenceError>>;
}

/// File-based persistence: one JSON file per record under a base directory.
pub struct FilePersistence {
    base_path: PathBuf,
}

impl FilePersistence {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn faceplate_path(&self, id: &str) -> PathBuf {
        self.base_path.join("faceplates").join(format!("{id}.json"))
    }

    fn component_path(&self, id: &str) -> PathBuf {
        self.base_path.join("components").join(format!("{id}.json"))
    }

    fn load<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T, PersistenceError> {
        let raw = fs::read_to_string(path)
            .map_err(|_| PersistenceError::NotFound(path.display().to_string()))?;
        serde_json::from_str(&raw).map_err(|error| PersistenceError::Format(error.to_string()))
    }

    fn save<T: Serialize>(path: &PathBuf, record: &T) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| PersistenceError::Io(error.to_string()))?;
        }
        let json = serde_json::to_string_pretty(record)
            .map_err(|error| PersistenceError::Format(error.to_string()))?;
        fs::write(path, json).map_err(|error| PersistenceError::Io(error.to_string()))
    }
}

impl Persistence for FilePersistence {
    fn read_faceplate<'a>(
        &'a self,
        id: &'a str,
    ) -> LocalBoxFuture<'a, Result<FaceplateRecord, PersistenceError>> {
        Box::pin(async move { Self::load(&self.faceplate_path(id)) })
    }

    fn write_faceplate<'a>(
        &'a self,
        record: &'a FaceplateRecord,
    ) -> LocalBoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move { Self::save(&self.faceplate_path(&record.id), record) })
    }

    fn read_components<'a>(
        &'a self,
        ids: &'a [String],
    ) -> LocalBoxFuture<'a, Result<Vec<ComponentRecord>, PersistenceError>> {
        Box::pin(async move {
            ids.iter()
                .map(|id| Self::load(&self.component_path(id)))
                .collect()
        })
    }

    fn create_component<'a>(
        &'a self,
        record: &'a ComponentRecord,
    ) -> LocalBoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move { Self::save(&self.component_path(&record.id), record) })
    }

    fn delete_component<'a>(
        &'a self,
        id: &'a str,
    ) -> LocalBoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move {
            fs::remove_file(self.component_path(id))
                .map_err(|_| PersistenceError::NotFound(id.to_string()))
        })
    }
}
