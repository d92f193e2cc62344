use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::{PgPool, Row};
use tablegate_contracts::ColumnMetadata;
use tokio::sync::RwLock;

use crate::EngineError;

/// Fetches live column metadata for a validated schema/table pair. Zero
/// rows covers both "does not exist" and "not visible to this role";
/// callers cannot tell the two apart.
pub async fn fetch_columns(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Vec<ColumnMetadata>, EngineError> {
    let rows = sqlx::query(
        "SELECT column_name, data_type \
         FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 \
         ORDER BY ordinal_position",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(EngineError::store)?;

    if rows.is_empty() {
        return Err(EngineError::TableNotFound {
            schema: schema.to_string(),
            table: table.to_string(),
        });
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("column_name").map_err(EngineError::store)?;
        let declared_type: String = row.try_get("data_type").map_err(EngineError::store)?;
        columns.push(ColumnMetadata::new(name.to_ascii_lowercase(), declared_type));
    }
    Ok(columns)
}

/// Optional metadata cache. Entries are valid only for the generation
/// they were stored under; `invalidate` bumps the generation, so stale
/// column sets are never served after the host signals a schema change.
/// There is deliberately no TTL.
#[derive(Debug, Default)]
pub struct SchemaCache {
    generation: AtomicU64,
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    generation: u64,
    columns: Arc<Vec<ColumnMetadata>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn get(&self, schema: &str, table: &str) -> Option<Arc<Vec<ColumnMetadata>>> {
        let current = self.generation.load(Ordering::SeqCst);
        let entries = self.entries.read().await;
        let entry = entries.get(&(schema.to_string(), table.to_string()))?;
        if entry.generation == current {
            Some(Arc::clone(&entry.columns))
        } else {
            None
        }
    }

    pub async fn put(&self, schema: &str, table: &str, columns: Arc<Vec<ColumnMetadata>>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.generation == generation);
        entries.insert(
            (schema.to_string(), table.to_string()),
            CacheEntry {
                generation,
                columns,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Arc<Vec<ColumnMetadata>> {
        Arc::new(vec![
            ColumnMetadata::new("id", "uuid"),
            ColumnMetadata::new("name", "text"),
        ])
    }

    #[tokio::test]
    async fn cache_round_trips_within_one_generation() {
        let cache = SchemaCache::new();
        assert!(cache.get("public", "widgets").await.is_none());

        cache.put("public", "widgets", columns()).await;
        let hit = cache.get("public", "widgets").await.expect("should hit");
        assert_eq!(hit.len(), 2);
    }

    #[tokio::test]
    async fn invalidate_drops_every_prior_entry() {
        let cache = SchemaCache::new();
        cache.put("public", "widgets", columns()).await;
        cache.put("admin", "audit_log", columns()).await;

        cache.invalidate();

        assert!(cache.get("public", "widgets").await.is_none());
        assert!(cache.get("admin", "audit_log").await.is_none());

        // A fresh put under the new generation serves again.
        cache.put("public", "widgets", columns()).await;
        assert!(cache.get("public", "widgets").await.is_some());
    }

    #[tokio::test]
    async fn entries_are_keyed_by_schema_and_table() {
        let cache = SchemaCache::new();
        cache.put("public", "widgets", columns()).await;
        assert!(cache.get("admin", "widgets").await.is_none());
        assert!(cache.get("public", "gadgets").await.is_none());
    }
}
