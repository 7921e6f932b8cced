//! Typed key/value storage next to the database.

use crate::adapter::StorageAdapter;
use crate::{error::Result, Error};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Small values kept by the adapter outside any table, stored as JSON.
#[derive(Clone)]
pub struct LocalStorage {
    adapter: Arc<dyn StorageAdapter>,
}

impl LocalStorage {
    pub(crate) fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.adapter.get_local(key).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::Serialization(format!("local storage key '{}': {}", key, e))),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| Error::Serialization(format!("local storage key '{}': {}", key, e)))?;
        self.adapter.set_local(key, &json).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.adapter.remove_local(key).await
    }
}
