//! In-memory collaborators.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    AccessControl, EndpointRecord, EndpointStore, EnvironmentStore, MockCollection,
    MockDataStore, SaveContext, SaveReceipt,
};
use crate::error::{Result, SandboxError};

/// Grants kept in two sets of (user, project) pairs. Editors can view.
#[derive(Debug, Default)]
pub struct MemoryAccessControl {
    editors: RwLock<HashSet<(String, String)>>,
    viewers: RwLock<HashSet<(String, String)>>,
}

impl MemoryAccessControl {
    /// Create an empty access table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `user_id` to edit `project_id`.
    pub fn grant_edit(&self, user_id: &str, project_id: &str) {
        self.editors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((user_id.to_string(), project_id.to_string()));
    }

    /// Allow `user_id` to view `project_id`.
    pub fn grant_view(&self, user_id: &str, project_id: &str) {
        self.viewers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((user_id.to_string(), project_id.to_string()));
    }

    fn contains(set: &RwLock<HashSet<(String, String)>>, user_id: &str, project_id: &str) -> bool {
        set.read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(user_id.to_string(), project_id.to_string()))
    }
}

#[async_trait]
impl AccessControl for MemoryAccessControl {
    async fn can_edit_project(&self, user_id: &str, project_id: &str) -> Result<bool> {
        Ok(Self::contains(&self.editors, user_id, project_id))
    }

    async fn can_view_project(&self, user_id: &str, project_id: &str) -> Result<bool> {
        Ok(Self::contains(&self.editors, user_id, project_id)
            || Self::contains(&self.viewers, user_id, project_id))
    }
}

/// Endpoints keyed by id.
#[derive(Debug, Default)]
pub struct MemoryEndpointStore {
    endpoints: RwLock<HashMap<String, EndpointRecord>>,
}

impl MemoryEndpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an endpoint.
    pub fn insert(&self, endpoint: EndpointRecord) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.id.clone(), endpoint);
    }

    /// Current copy of an endpoint.
    pub fn get(&self, endpoint_id: &str) -> Option<EndpointRecord> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint_id)
            .cloned()
    }
}

#[async_trait]
impl EndpointStore for MemoryEndpointStore {
    async fn endpoint(&self, endpoint_id: &str) -> Result<Option<EndpointRecord>> {
        Ok(self.get(endpoint_id))
    }

    async fn record_call(&self, endpoint_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint = endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| SandboxError::NotFound {
                kind: "endpoint",
                id: endpoint_id.to_string(),
            })?;
        endpoint.call_count += 1;
        endpoint.last_called_at = Some(at);
        Ok(())
    }
}

/// Previous contents of a collection, taken before a save.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionBackup {
    /// Version the backup holds.
    pub version: u64,
    /// Items at that version.
    pub items: Vec<Value>,
    /// Who triggered the save.
    pub saved_by: String,
    /// Execution that triggered the save.
    pub execution_id: String,
    /// When the backup was taken.
    pub taken_at: DateTime<Utc>,
}

/// Collections plus their backup history.
#[derive(Debug, Default)]
pub struct MemoryMockDataStore {
    collections: RwLock<HashMap<String, MockCollection>>,
    backups: RwLock<HashMap<String, Vec<CollectionBackup>>>,
}

impl MemoryMockDataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a collection.
    pub fn insert(&self, collection: MockCollection) {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.id.clone(), collection);
    }

    /// Current copy of a collection.
    pub fn get(&self, collection_id: &str) -> Option<MockCollection> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection_id)
            .cloned()
    }

    /// Backups taken for a collection, oldest first.
    pub fn backups(&self, collection_id: &str) -> Vec<CollectionBackup> {
        self.backups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn check_schema(collection: &MockCollection, items: &[Value]) -> Result<()> {
    let Some(schema) = &collection.schema else {
        return Ok(());
    };
    for (index, item) in items.iter().enumerate() {
        let Some(object) = item.as_object() else {
            return Err(SandboxError::Persistence(format!(
                "item {} of collection {} is not an object",
                index, collection.id
            )));
        };
        if let Some(missing) = schema.required.iter().find(|f| !object.contains_key(*f)) {
            return Err(SandboxError::Persistence(format!(
                "item {} of collection {} is missing required field `{}`",
                index, collection.id, missing
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl MockDataStore for MemoryMockDataStore {
    async fn collection(&self, collection_id: &str) -> Result<Option<MockCollection>> {
        Ok(self.get(collection_id))
    }

    async fn save_from_execution(
        &self,
        collection_id: &str,
        items: Vec<Value>,
        user_id: &str,
        context: &SaveContext,
    ) -> Result<SaveReceipt> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let collection = collections
            .get_mut(collection_id)
            .ok_or_else(|| SandboxError::NotFound {
                kind: "collection",
                id: collection_id.to_string(),
            })?;
        check_schema(collection, &items)?;

        let backup = CollectionBackup {
            version: collection.version,
            items: std::mem::replace(&mut collection.items, items),
            saved_by: user_id.to_string(),
            execution_id: context.execution_id.clone(),
            taken_at: Utc::now(),
        };
        collection.version += 1;
        let receipt = SaveReceipt {
            collection_id: collection.id.clone(),
            version: collection.version,
            item_count: collection.items.len(),
        };
        drop(collections);

        self.backups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection_id.to_string())
            .or_default()
            .push(backup);
        Ok(receipt)
    }
}

/// Variables per (project, environment), with one default per project.
#[derive(Debug, Default)]
pub struct MemoryEnvironmentStore {
    named: RwLock<HashMap<(String, String), BTreeMap<String, String>>>,
    defaults: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryEnvironmentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the variables of a named environment.
    pub fn insert(&self, project_id: &str, environment_id: &str, vars: BTreeMap<String, String>) {
        self.named
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((project_id.to_string(), environment_id.to_string()), vars);
    }

    /// Set the project's default environment.
    pub fn set_default(&self, project_id: &str, vars: BTreeMap<String, String>) {
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project_id.to_string(), vars);
    }
}

#[async_trait]
impl EnvironmentStore for MemoryEnvironmentStore {
    async fn variables(
        &self,
        project_id: &str,
        environment_id: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        match environment_id {
            Some(id) => self
                .named
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(project_id.to_string(), id.to_string()))
                .cloned()
                .ok_or_else(|| SandboxError::NotFound {
                    kind: "environment",
                    id: id.to_string(),
                }),
            None => Ok(self
                .defaults
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(project_id)
                .cloned()
                .unwrap_or_default()),
        }
    }
}
