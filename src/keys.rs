//! Resolve-or-create integer identifiers for level/topic/host/subscriber
//! names, memoized in-process for the lifetime of the interner.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::trace;

use crate::db::{Database, Row, Table};
use crate::Result;

/// Resolves `(table, name)` pairs to their database row, caching the result
/// so a second call for the same pair never touches the database.
///
/// Cheap to clone: the cache is shared via an `Arc`.
#[derive(Clone)]
pub struct Interner {
    db: Database,
    cache: Arc<RwLock<HashMap<(Table, String), Row>>>,
}

impl Interner {
    pub fn new(db: Database) -> Self {
        Interner {
            db,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolves `name` in `table`, creating it if it doesn't yet exist.
    ///
    /// A second call for the same `(table, name)` returns the cached row
    /// without a database round-trip. Concurrent first-time inserts of the
    /// same name are tolerated: a unique-constraint conflict falls back to
    /// re-reading the row that the other caller just inserted.
    pub async fn get(&self, table: Table, name: &str) -> Result<Row> {
        let key = (table, name.to_string());
        if let Some(row) = self.cache.read().await.get(&key) {
            return Ok(row.clone());
        }

        if let Some(row) = self.db.find_by_name(table, name).await? {
            self.cache.write().await.insert(key, row.clone());
            return Ok(row);
        }

        let row = match self.db.try_insert_name(table, name).await? {
            Some(row) => {
                trace!(table = ?table, name, id = row.id, "interned new name");
                row
            }
            None => {
                // Lost the race to a concurrent insert; the row now exists.
                self.db
                    .find_by_name(table, name)
                    .await?
                    .expect("row must exist after a unique-constraint conflict")
            }
        };

        self.cache.write().await.insert(key, row.clone());
        Ok(row)
    }
}
