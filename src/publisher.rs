//! Accept messages via a bounded in-process queue; a background worker
//! drains the queue in batches and commits them to the store.
//!
//! Ported from `publisher.py`'s `Publishing`/`Publisher` pair: a
//! `threading.Thread` draining a `queue.Queue` becomes a `tokio::task`
//! draining a bounded `mpsc` channel.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use typed_builder::TypedBuilder;

use crate::message::Message;
use crate::store::Store;
use crate::{Error, Result};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`Publisher`].
#[derive(Clone, Debug, TypedBuilder)]
pub struct PublisherConfig {
    /// Default topic, used when a [`Publisher::write`] call omits one.
    #[builder(default, setter(strip_option, into))]
    pub topic: Option<String>,
    /// Default level, used when a [`Publisher::write`] call omits one.
    #[builder(default, setter(strip_option, into))]
    pub level: Option<String>,
    /// Maximum number of messages committed in a single batch.
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// Seconds to wait on the next message before committing the current
    /// (possibly partial) batch.
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig::builder().build()
    }
}

struct PendingMessage {
    text: String,
    topic: Option<String>,
    level: Option<String>,
}

/// Writes messages to the store through a bounded local queue, decoupling
/// the caller of [`Publisher::write`] from the latency of a database commit.
pub struct Publisher {
    sender: Option<mpsc::Sender<PendingMessage>>,
    receiver: Option<mpsc::Receiver<PendingMessage>>,
    handle: Option<JoinHandle<()>>,
    store: Store,
    batch_size: usize,
    timeout: Duration,
    default_topic: Option<String>,
    default_level: Option<String>,
}

impl Publisher {
    pub fn new(store: Store, config: PublisherConfig) -> Self {
        let (sender, receiver) = mpsc::channel(2 * config.batch_size.max(1));
        Publisher {
            sender: Some(sender),
            receiver: Some(receiver),
            handle: None,
            store,
            batch_size: config.batch_size,
            timeout: config.timeout,
            default_topic: config.topic,
            default_level: config.level,
        }
    }

    /// Spawns the background worker. A no-op if already started.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        let store = self.store.clone();
        let batch_size = self.batch_size;
        let timeout = self.timeout;
        let default_topic = self.default_topic.clone();
        let default_level = self.default_level.clone();
        self.handle = Some(tokio::spawn(async move {
            run_worker(store, receiver, batch_size, timeout, default_topic, default_level).await
        }));
    }

    /// Closes the queue, waits for every already-queued message to be
    /// committed (or logged and dropped on failure), and joins the worker.
    pub async fn stop(&mut self) {
        // Dropping the sender closes the channel; the worker drains what
        // remains and exits.
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(%err, "publisher worker panicked");
            }
        }
    }

    /// Runs `body` with the publisher started, stopping it afterward
    /// regardless of how `body` returns.
    pub async fn scoped<F, Fut, R>(store: Store, config: PublisherConfig, body: F) -> R
    where
        F: for<'p> FnOnce(&'p Publisher) -> Fut,
        Fut: Future<Output = R>,
    {
        let mut publisher = Publisher::new(store, config);
        publisher.start();
        let result = body(&publisher).await;
        publisher.stop().await;
        result
    }

    /// Enqueues a message for publishing. `topic`/`level` fall back to the
    /// values bound at construction; if neither is available the write
    /// still succeeds (validation happens inside the worker when the batch
    /// is built, per the at-publish-time validation rule).
    pub async fn write(
        &self,
        text: impl Into<String>,
        level: Option<&str>,
        topic: Option<&str>,
    ) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::validation("publisher is stopped"))?;
        let pending = PendingMessage {
            text: text.into(),
            topic: topic.map(str::to_string).or_else(|| self.default_topic.clone()),
            level: level.map(str::to_string).or_else(|| self.default_level.clone()),
        };
        sender
            .send(pending)
            .await
            .map_err(|_| Error::validation("publisher is stopped"))
    }
}

async fn run_worker(
    store: Store,
    mut receiver: mpsc::Receiver<PendingMessage>,
    batch_size: usize,
    timeout: Duration,
    default_topic: Option<String>,
    default_level: Option<String>,
) {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        batch.clear();
        let mut channel_closed = false;

        for _ in 0..batch_size.max(1) {
            match tokio::time::timeout(timeout, receiver.recv()).await {
                Ok(Some(pending)) => {
                    let topic = pending.topic.clone().or_else(|| default_topic.clone());
                    let level = pending.level.clone().or_else(|| default_level.clone());
                    match Message::try_from_parts(pending.text, topic, level, None, None) {
                        Ok(message) => {
                            debug!(topic = %message.topic, "buffering message");
                            batch.push(message);
                        }
                        Err(err) => error!(%err, "dropping message that failed validation"),
                    }
                }
                Ok(None) => {
                    channel_closed = true;
                    break;
                }
                Err(_elapsed) => break,
            }
        }

        if !batch.is_empty() {
            match store.publish(&batch).await {
                Ok(()) => info!(count = batch.len(), "published batch"),
                Err(err) => error!(%err, count = batch.len(), "failed to publish batch, dropping it"),
            }
        }

        if channel_closed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use chrono::Utc;
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
    async fn write_then_stop_drains_every_queued_message() {
        let store = memory_store().await;
        let mut publisher = Publisher::new(
            store.clone(),
            PublisherConfig::builder().topic("demo").level("INFO").build(),
        );
        publisher.start();
        for i in 0..5 {
            publisher.write(format!("msg{i}"), None, None).await.unwrap();
        }
        publisher.stop().await;

        let fetched = store.fetch("demo", Utc::now() - chrono::Duration::hours(1), 10).await.unwrap();
        assert_eq!(fetched.len(), 5);
    }

    #[tokio::test]
    async fn batch_size_one_commits_one_message_at_a_time() {
        let store = memory_store().await;
        let mut publisher = Publisher::new(
            store.clone(),
            PublisherConfig::builder()
                .topic("demo")
                .level("INFO")
                .batch_size(1)
                .timeout(Duration::from_millis(50))
                .build(),
        );
        publisher.start();
        publisher.write("one", None, None).await.unwrap();
        // Give the worker a moment to drain the single-item batch before
        // the second write is enqueued, so each write maps to its own commit.
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.write("two", None, None).await.unwrap();
        publisher.stop().await;

        let fetched = store.fetch("demo", Utc::now() - chrono::Duration::hours(1), 10).await.unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn write_without_topic_or_level_fails_at_publish_time() {
        let store = memory_store().await;
        let mut publisher = Publisher::new(store.clone(), PublisherConfig::default());
        publisher.start();
        // The write call itself succeeds (it only enqueues); validation
        // happens inside the worker when it builds the message.
        publisher.write("orphan", None, None).await.unwrap();
        publisher.stop().await;

        let fetched = store.fetch("demo", Utc::now() - chrono::Duration::hours(1), 10).await.unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn scoped_stops_the_publisher_after_the_body_returns() {
        let store = memory_store().await;
        Publisher::scoped(
            store.clone(),
            PublisherConfig::builder().topic("demo").level("INFO").build(),
            |publisher| async move {
                publisher.write("scoped", None, None).await.unwrap();
            },
        )
        .await;

        let fetched = store.fetch("demo", Utc::now() - chrono::Duration::hours(1), 10).await.unwrap();
        assert_eq!(fetched.len(), 1);
    }
}
