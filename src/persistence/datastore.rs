//! In-memory relational datastore
//!
//! Table-per-name row storage with monotonically assigned ids and
//! predicate filtering, implementing the [`Datastore`] port.

use crate::domain::ports::{Datastore, FilterOp, QueryFilter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// In-memory [`Datastore`] implementation
#[derive(Default)]
pub struct MemoryDatastore {
    tables: DashMap<String, BTreeMap<i64, serde_json::Value>>,
    next_id: AtomicI64,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    fn matches(row: &serde_json::Value, filters: &[QueryFilter]) -> bool {
        filters.iter().all(|f| {
            let field_value = row.get(&f.field).unwrap_or(&serde_json::Value::Null);
            match f.op {
                FilterOp::Eq => *field_value == f.value,
                FilterOp::Ne => *field_value != f.value,
            }
        })
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn insert(&self, table: &str, row: serde_json::Value) -> Result<i64> {
        let mut row = row;
        let obj = row.as_object_mut().ok_or_else(|| {
            Error::Datastore(format!("{table}: row must be a JSON object"))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        obj.insert("id".to_string(), serde_json::Value::from(id));

        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(id, row);
        Ok(id)
    }

    async fn update(&self, table: &str, id: i64, row: serde_json::Value) -> Result<()> {
        let mut row = row;
        let obj = row.as_object_mut().ok_or_else(|| {
            Error::Datastore(format!("{table}: row must be a JSON object"))
        })?;
        obj.insert("id".to_string(), serde_json::Value::from(id));

        let mut rows = self
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::Datastore(format!("{table}: no such table")))?;
        match rows.insert(id, row) {
            Some(_) => Ok(()),
            None => {
                rows.remove(&id);
                Err(Error::NotFound {
                    kind: table.to_string(),
                    name: id.to_string(),
                })
            }
        }
    }

    async fn delete(&self, table: &str, id: i64) -> Result<()> {
        let mut rows = self
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::Datastore(format!("{table}: no such table")))?;
        rows.remove(&id).map(|_| ()).ok_or(Error::NotFound {
            kind: table.to_string(),
            name: id.to_string(),
        })
    }

    async fn query(&self, table: &str, filters: &[QueryFilter]) -> Result<Vec<serde_json::Value>> {
        let rows = match self.tables.get(table) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        Ok(rows
            .values()
            .filter(|row| Self::matches(row, filters))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let ds = MemoryDatastore::new();
        let first = ds.insert("t", json!({"name": "a"})).await.unwrap();
        let second = ds.insert("t", json!({"name": "b"})).await.unwrap();
        assert!(second > first);

        let rows = ds.query("t", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(first));
    }

    #[tokio::test]
    async fn test_query_filters() {
        let ds = MemoryDatastore::new();
        ds.insert("t", json!({"name": "a", "backend": "rid"})).await.unwrap();
        ds.insert("t", json!({"name": "b", "backend": "tdb"})).await.unwrap();

        let rows = ds
            .query("t", &[QueryFilter::eq("backend", "rid")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("a"));

        let rows = ds
            .query("t", &[QueryFilter::ne("name", "a")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("b"));
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_row() {
        let ds = MemoryDatastore::new();
        let id = ds.insert("t", json!({"name": "a"})).await.unwrap();

        ds.update("t", id, json!({"name": "a2"})).await.unwrap();
        let rows = ds.query("t", &[]).await.unwrap();
        assert_eq!(rows[0]["name"], json!("a2"));

        assert!(ds.update("t", id + 50, json!({})).await.is_err());
        ds.delete("t", id).await.unwrap();
        assert!(ds.delete("t", id).await.is_err());
    }
}
