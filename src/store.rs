//! The message layer and access layer, composed around a shared [`Database`]
//! handle and [`Interner`]. This is the one type most callers construct
//! directly; [`Publisher`](crate::publisher::Publisher) and
//! [`Subscriber`](crate::subscriber::Subscriber) each hold a `Store` clone.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::access::{Access, CursorPolicy};
use crate::config::DatabaseConfig;
use crate::db::{Database, Table};
use crate::keys::Interner;
use crate::message::Message;
use crate::Result;

/// The `message` and `access` table operations, backed by one connection
/// pool and one key interner.
#[derive(Clone)]
pub struct Store {
    db: Database,
    interner: Interner,
    cursor_policy: CursorPolicy,
}

impl Store {
    /// Connects to the backend named by `config` and runs migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let db = Database::connect(config).await?;
        db.migrate().await?;
        Ok(Store {
            interner: Interner::new(db.clone()),
            db,
            cursor_policy: CursorPolicy::default(),
        })
    }

    /// Builds a store around an already-connected, already-migrated
    /// [`Database`]. Useful for tests that want to reuse one pool across
    /// several stores.
    pub fn from_database(db: Database) -> Self {
        Store {
            interner: Interner::new(db.clone()),
            db,
            cursor_policy: CursorPolicy::default(),
        }
    }

    pub fn with_cursor_policy(mut self, policy: CursorPolicy) -> Self {
        self.cursor_policy = policy;
        self
    }

    pub(crate) fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Adds every message in `messages` to the database in a single
    /// transaction. An empty slice is a no-op.
    pub async fn publish(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut rows = Vec::with_capacity(messages.len());
        for message in messages {
            let topic = self.interner.get(Table::Topic, &message.topic).await?;
            let level = self.interner.get(Table::Level, &message.level).await?;
            let host = self.interner.get(Table::Host, &message.host).await?;
            rows.push((message.time, topic.id, level.id, host.id, message.text.clone()));
        }

        self.db.insert_messages(&rows).await?;
        debug!(count = messages.len(), "published messages");
        Ok(())
    }

    /// Returns up to `limit` messages on `topic` strictly after `after`,
    /// ordered by `time` ascending.
    pub async fn fetch(&self, topic: &str, after: DateTime<Utc>, limit: i64) -> Result<Vec<Message>> {
        let topic_row = self.interner.get(Table::Topic, topic).await?;
        let rows = self.db.fetch_messages(topic_row.id, after, limit).await?;
        Ok(rows
            .into_iter()
            .map(|row| Message {
                id: Some(row.id),
                time: row.time,
                topic: row.topic,
                level: row.level,
                host: row.host,
                text: row.text,
            })
            .collect())
    }

    /// Returns the current cursor for `(subscriber, topic)`, creating one
    /// per [`CursorPolicy`] if it doesn't yet exist.
    pub async fn latest(&self, subscriber: &str, topic: &str) -> Result<Access> {
        let subscriber_row = self.interner.get(Table::Subscriber, subscriber).await?;
        let topic_row = self.interner.get(Table::Topic, topic).await?;

        if let Some(time) = self.db.find_access(subscriber_row.id, topic_row.id).await? {
            return Ok(Access {
                subscriber: subscriber.to_string(),
                topic: topic.to_string(),
                time,
            });
        }

        let initial = match self.cursor_policy {
            CursorPolicy::Now => Utc::now(),
            CursorPolicy::Earliest => self
                .db
                .earliest_message_time(topic_row.id)
                .await?
                .unwrap_or_else(Utc::now),
        };

        if !self
            .db
            .try_insert_access(subscriber_row.id, topic_row.id, initial)
            .await?
        {
            // Lost the race to a concurrent first-time query; re-read it.
            let time = self
                .db
                .find_access(subscriber_row.id, topic_row.id)
                .await?
                .expect("access row must exist after a unique-constraint conflict");
            return Ok(Access {
                subscriber: subscriber.to_string(),
                topic: topic.to_string(),
                time,
            });
        }

        Ok(Access {
            subscriber: subscriber.to_string(),
            topic: topic.to_string(),
            time: initial,
        })
    }

    /// Advances the cursor for `(subscriber, topic)` to `time`. A `time`
    /// that does not advance the existing cursor is a no-op.
    pub async fn update(&self, subscriber: &str, topic: &str, time: DateTime<Utc>) -> Result<()> {
        let subscriber_row = self.interner.get(Table::Subscriber, subscriber).await?;
        let topic_row = self.interner.get(Table::Topic, topic).await?;

        if let Some(current) = self.db.find_access(subscriber_row.id, topic_row.id).await? {
            if time <= current {
                return Ok(());
            }
        }

        self.db.upsert_access(subscriber_row.id, topic_row.id, time).await
    }

    /// Returns every existing topic name equal to `root` or matching
    /// `root + sep + *`.
    pub async fn discover_topics(&self, root: &str, sep: char) -> Result<Vec<String>> {
        self.db.topics_under(root, sep).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    async fn memory_store() -> Store {
        let mapping = match json!({"backend": "sqlite", "database": ":memory:"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let config = DatabaseConfig::from_mapping(&mapping).unwrap();
        Store::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn publish_empty_batch_is_noop() {
        let store = memory_store().await;
        store.publish(&[]).await.unwrap();
        let messages = store.fetch("demo", DateTime::UNIX_EPOCH, 10).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn publish_then_fetch_round_trips_in_order() {
        let store = memory_store().await;
        let first = Message::new("hello", "demo", "INFO").with_host("h1");
        let second = Message::new("world", "demo", "INFO")
            .with_host("h1")
            .with_time(first.time + chrono::Duration::milliseconds(1));
        store.publish(&[first.clone(), second.clone()]).await.unwrap();

        let fetched = store.fetch("demo", DateTime::UNIX_EPOCH, 10).await.unwrap();
        let texts: Vec<_> = fetched.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["hello", "world"]);
        assert!(fetched.iter().all(|m| m.topic == "demo" && m.level == "INFO"));
    }

    #[tokio::test]
    async fn fetch_respects_after_and_limit() {
        let store = memory_store().await;
        let base = Utc::now();
        for i in 0..5 {
            let message = Message::new(format!("msg{i}"), "demo", "INFO")
                .with_time(base + chrono::Duration::milliseconds(i));
            store.publish(&[message]).await.unwrap();
        }

        let after = base + chrono::Duration::milliseconds(1);
        let fetched = store.fetch("demo", after, 2).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(fetched.iter().all(|m| m.time > after));
        assert!(fetched[0].time <= fetched[1].time);
    }

    #[tokio::test]
    async fn interning_the_same_name_twice_returns_the_same_id() {
        let store = memory_store().await;
        let first = store.interner().get(Table::Topic, "demo").await.unwrap();
        let second = store.interner().get(Table::Topic, "demo").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn latest_is_idempotent_and_update_is_monotonic() {
        let store = memory_store().await;
        let message = Message::new("hi", "demo", "INFO");
        store.publish(&[message.clone()]).await.unwrap();

        let first = store.latest("sub", "demo").await.unwrap();
        let second = store.latest("sub", "demo").await.unwrap();
        assert_eq!(first.time, second.time);

        let later = message.time + chrono::Duration::seconds(10);
        store.update("sub", "demo", later).await.unwrap();
        let advanced = store.latest("sub", "demo").await.unwrap();
        assert_eq!(advanced.time, later);

        // A non-advancing update is a no-op.
        store.update("sub", "demo", message.time).await.unwrap();
        let unchanged = store.latest("sub", "demo").await.unwrap();
        assert_eq!(unchanged.time, later);
    }

    #[tokio::test]
    async fn discover_topics_matches_root_and_prefixed_subtopics() {
        let store = memory_store().await;
        for topic in ["a", "a.b", "a.c", "b"] {
            store.publish(&[Message::new("x", topic, "INFO")]).await.unwrap();
        }
        let mut found = store.discover_topics("a", '.').await.unwrap();
        found.sort();
        assert_eq!(found, vec!["a", "a.b", "a.c"]);
    }

    #[tokio::test]
    async fn cursor_policy_now_skips_history() {
        let store = memory_store().await.with_cursor_policy(CursorPolicy::Now);
        let old = Message::new("old", "demo", "INFO")
            .with_time(Utc::now() - chrono::Duration::hours(1));
        store.publish(&[old]).await.unwrap();

        let access = store.latest("sub", "demo").await.unwrap();
        let fetched = store.fetch("demo", access.time - chrono::Duration::hours(2), 10).await.unwrap();
        // The cursor was seeded at "now", so the hour-old message is still
        // fetchable directly, but a subscriber resuming from `access.time`
        // would not see it.
        assert_eq!(fetched.len(), 1);
        assert!(access.time > fetched[0].time);
    }
}
