//! Per-user variable store and the diff applied after a run.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

/// One stored variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
}

/// Flat variable map as written to `variables.json`.
pub type VariableSet = BTreeMap<String, String>;

/// Backing store for user variables.
#[async_trait]
pub trait VariableStore: Send + Sync {
    /// All variables of `user_id`.
    async fn get(&self, user_id: &str) -> Result<Vec<Variable>>;

    /// Create or overwrite one variable.
    async fn set(&self, user_id: &str, key: &str, value: &str) -> Result<()>;

    /// Remove one variable.
    async fn delete(&self, user_id: &str, key: &str) -> Result<()>;
}

/// In-process [`VariableStore`].
#[derive(Debug, Default)]
pub struct MemoryVariableStore {
    users: Mutex<HashMap<String, VariableSet>>,
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current variables of `user_id` as a map.
    pub async fn snapshot(&self, user_id: &str) -> VariableSet {
        self.users
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VariableStore for MemoryVariableStore {
    async fn get(&self, user_id: &str) -> Result<Vec<Variable>> {
        Ok(self
            .snapshot(user_id)
            .await
            .into_iter()
            .map(|(key, value)| Variable { key, value })
            .collect())
    }

    async fn set(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        self.users
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, user_id: &str, key: &str) -> Result<()> {
        if let Some(vars) = self.users.lock().await.get_mut(user_id) {
            vars.remove(key);
        }
        Ok(())
    }
}

/// Changes between a snapshot and what the script left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableDiff {
    /// Added or changed keys with their new values.
    pub set: Vec<(String, String)>,
    /// Removed keys.
    pub deleted: Vec<String>,
}

impl VariableDiff {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.deleted.is_empty()
    }

    /// Apply to `store` for `user_id`. Stops at the first store error.
    pub async fn apply(&self, store: &dyn VariableStore, user_id: &str) -> Result<()> {
        for (key, value) in &self.set {
            store.set(user_id, key, value).await?;
        }
        for key in &self.deleted {
            store.delete(user_id, key).await?;
        }
        Ok(())
    }
}

/// Turn a `variables.json` object into a flat string map.
///
/// Keys starting with `__` are bookkeeping and dropped. Non-string values
/// are stored as their JSON text.
pub fn flatten(object: Map<String, Value>) -> VariableSet {
    object
        .into_iter()
        .filter(|(key, _)| !key.starts_with("__"))
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

/// Parse `variables.json` contents.
pub fn parse_variables(bytes: &[u8]) -> Result<VariableSet> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(object) => Ok(flatten(object)),
        other => Err(EngineError::VariableStore(format!(
            "variables file is not an object: {other}"
        ))),
    }
}

/// Compute what to write back for `after` relative to `before`.
pub fn diff_variables(before: &VariableSet, after: &VariableSet) -> VariableDiff {
    let set = after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let deleted = before
        .keys()
        .filter(|key| !after.contains_key(*key))
        .cloned()
        .collect();
    VariableDiff { set, deleted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> VariableSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_set_and_delete() {
        let diff = diff_variables(&vars(&[("a", "1")]), &vars(&[("b", "2")]));
        assert_eq!(diff.set, vec![("b".to_string(), "2".to_string())]);
        assert_eq!(diff.deleted, vec!["a".to_string()]);
    }

    #[test]
    fn test_diff_unchanged_is_empty() {
        let before = vars(&[("a", "1"), ("b", "2")]);
        assert!(diff_variables(&before, &before.clone()).is_empty());
    }

    #[test]
    fn test_diff_changed_value() {
        let diff = diff_variables(&vars(&[("a", "1")]), &vars(&[("a", "2")]));
        assert_eq!(diff.set, vec![("a".to_string(), "2".to_string())]);
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn test_parse_strips_bookkeeping_and_stringifies() {
        let raw = json!({
            "name": "x",
            "count": 3,
            "flags": {"on": true},
            "__updated__": "2024-01-01T00:00:00"
        });
        let parsed = parse_variables(raw.to_string().as_bytes()).unwrap();
        assert_eq!(
            parsed,
            vars(&[("count", "3"), ("flags", r#"{"on":true}"#), ("name", "x")])
        );
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(parse_variables(b"[1,2]").is_err());
        assert!(parse_variables(b"{oops").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_apply() {
        let store = MemoryVariableStore::new();
        store.set("u1", "a", "1").await.unwrap();

        let diff = diff_variables(&store.snapshot("u1").await, &vars(&[("b", "2")]));
        diff.apply(&store, "u1").await.unwrap();

        assert_eq!(store.snapshot("u1").await, vars(&[("b", "2")]));
        assert!(store.get("other").await.unwrap().is_empty());
    }
}
