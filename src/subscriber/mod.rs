//! The subscriber engine: a name worker discovers topics, a manager spawns
//! one task per discovered topic, and each topic worker polls, enqueues,
//! and advances its own cursor. Ported from `subscriber.py`'s per-topic
//! polling loop, fanned out across the three worker roles this crate's
//! dynamic subtopic discovery requires.

mod manager;
mod name_worker;
mod topic_worker;

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::message::Message;
use crate::store::Store;

const TOPIC_QUEUE_CAPACITY: usize = 10;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_POLL: Duration = Duration::from_secs(1);
const DEFAULT_MANAGER_SPACING: Duration = Duration::from_millis(500);
const DEFAULT_SEPARATOR: char = '.';

/// Configuration for a [`Subscriber`].
#[derive(Clone, Debug, TypedBuilder)]
pub struct SubscriberConfig {
    /// Identifies this subscriber's cursor rows; distinct subscribers never
    /// share a cursor on the same topic.
    #[builder(setter(into))]
    pub name: String,
    /// Root topics to subscribe to. Each root and every topic matching
    /// `root + separator + *` is discovered and delivered.
    pub topics: Vec<String>,
    /// Maximum number of messages fetched per topic worker cycle.
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// How often each topic worker re-fetches, and the name worker
    /// re-discovers subtopics.
    #[builder(default = DEFAULT_POLL)]
    pub poll: Duration,
    /// Delimiter between a root and its subtopics.
    #[builder(default = DEFAULT_SEPARATOR)]
    pub separator: char,
    /// Spacing the manager leaves between starting two topic workers.
    #[builder(default = DEFAULT_MANAGER_SPACING)]
    pub manager_spacing: Duration,
    /// Default wait passed to [`Subscriber::get_message`] when a call
    /// doesn't supply its own. `None` waits indefinitely.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}

pub(crate) enum TopicEvent {
    Topic(String),
    Stop,
}

/// Discovers topics under a configured set of roots and delivers their
/// messages in order, resuming from a persisted per-topic cursor.
///
/// Consume it either by repeated [`Subscriber::get_message`] calls or as a
/// [`futures::Stream`].
pub struct Subscriber {
    store: Store,
    name: String,
    topics: Vec<String>,
    separator: char,
    batch_size: usize,
    poll: Duration,
    manager_spacing: Duration,
    default_timeout: Option<Duration>,

    message_tx: mpsc::Sender<Message>,
    message_rx: mpsc::Receiver<Message>,
    topic_tx: mpsc::Sender<TopicEvent>,
    topic_rx: Option<mpsc::Receiver<TopicEvent>>,

    name_cancel: CancellationToken,
    manager_handle: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn new(store: Store, config: SubscriberConfig) -> Self {
        let topic_count = config.topics.len().max(1);
        let (message_tx, message_rx) = mpsc::channel(topic_count * config.batch_size.max(1));
        let (topic_tx, topic_rx) = mpsc::channel(TOPIC_QUEUE_CAPACITY);

        Subscriber {
            store,
            name: config.name,
            topics: config.topics,
            separator: config.separator,
            batch_size: config.batch_size,
            poll: config.poll,
            manager_spacing: config.manager_spacing,
            default_timeout: config.timeout,
            message_tx,
            message_rx,
            topic_tx,
            topic_rx: Some(topic_rx),
            name_cancel: CancellationToken::new(),
            manager_handle: None,
        }
    }

    /// Spawns the name worker and manager. A no-op if already started.
    pub fn start(&mut self) {
        if self.manager_handle.is_some() {
            return;
        }
        let Some(topic_rx) = self.topic_rx.take() else {
            return;
        };

        self.name_cancel = CancellationToken::new();
        let name_handle = tokio::spawn(name_worker::run(
            self.store.clone(),
            self.topics.clone(),
            self.separator,
            self.poll,
            self.topic_tx.clone(),
            self.name_cancel.clone(),
        ));

        self.manager_handle = Some(tokio::spawn(manager::run(
            topic_rx,
            self.message_tx.clone(),
            self.store.clone(),
            self.name.clone(),
            self.batch_size as i64,
            self.poll,
            self.manager_spacing,
            name_handle,
            CancellationToken::new(),
        )));
    }

    /// Cancels the name worker, which pushes the STOP sentinel that drains
    /// the manager and every topic worker; then joins the manager.
    pub async fn stop(&mut self) {
        self.name_cancel.cancel();
        if let Some(handle) = self.manager_handle.take() {
            if let Err(err) = handle.await {
                tracing::error!(%err, "subscriber manager panicked");
            }
        }
    }

    /// Waits for the next message. `timeout` overrides the configured
    /// default; `None` for both means wait indefinitely. Returns `None`
    /// once the wait elapses with nothing delivered, or the engine has
    /// stopped and every already-queued message has been drained.
    pub async fn get_message(&mut self, timeout: Option<Duration>) -> Option<Message> {
        match timeout.or(self.default_timeout) {
            Some(duration) => tokio::time::timeout(duration, self.message_rx.recv())
                .await
                .ok()
                .flatten(),
            None => self.message_rx.recv().await,
        }
    }
}

impl Stream for Subscriber {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.get_mut().message_rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
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

    fn fast_poll_config(name: &str, topics: &[&str]) -> SubscriberConfig {
        SubscriberConfig::builder()
            .name(name)
            .topics(topics.iter().map(|t| t.to_string()).collect())
            .poll(Duration::from_millis(30))
            .manager_spacing(Duration::from_millis(10))
            .build()
    }

    // S1: single producer, single consumer.
    #[tokio::test]
    async fn delivers_published_messages_in_order() {
        let store = memory_store().await;
        store
            .publish(&[Message::new("hello", "demo", "INFO"), Message::new("world", "demo", "INFO")])
            .await
            .unwrap();

        let mut subscriber = Subscriber::new(store, fast_poll_config("sub1", &["demo"]));
        subscriber.start();

        let first = subscriber.get_message(Some(Duration::from_secs(1))).await.unwrap();
        let second = subscriber.get_message(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(first.text, "hello");
        assert_eq!(second.text, "world");
        assert_eq!(first.topic, "demo");
        assert_eq!(first.level, "INFO");

        let none = subscriber.get_message(Some(Duration::from_millis(200))).await;
        assert!(none.is_none());

        subscriber.stop().await;
    }

    // S2: resuming a subscriber with the same name does not replay.
    #[tokio::test]
    async fn reconstructed_subscriber_does_not_replay() {
        let store = memory_store().await;
        store.publish(&[Message::new("already seen", "demo", "INFO")]).await.unwrap();

        let mut first = Subscriber::new(store.clone(), fast_poll_config("sub2", &["demo"]));
        first.start();
        let delivered = first.get_message(Some(Duration::from_secs(1))).await;
        assert!(delivered.is_some());
        first.stop().await;

        let mut second = Subscriber::new(store, fast_poll_config("sub2", &["demo"]));
        second.start();
        let replayed = second.get_message(Some(Duration::from_millis(200))).await;
        assert!(replayed.is_none());
        second.stop().await;
    }

    // S3: a subtopic created after the subscriber starts is discovered.
    #[tokio::test]
    async fn discovers_subtopics_created_after_start() {
        let store = memory_store().await;
        store.publish(&[Message::new("pre-existing", "a.b", "INFO")]).await.unwrap();

        let mut subscriber = Subscriber::new(store.clone(), fast_poll_config("sub3", &["a"]));
        subscriber.start();

        store.publish(&[Message::new("on root", "a", "INFO")]).await.unwrap();
        store.publish(&[Message::new("new subtopic", "a.c", "INFO")]).await.unwrap();

        let mut texts = Vec::new();
        for _ in 0..3 {
            let message = subscriber
                .get_message(Some(Duration::from_secs(2)))
                .await
                .expect("expected a message from a, a.b, or a.c");
            texts.push(message.text);
        }
        texts.sort();
        assert_eq!(texts, vec!["new subtopic", "on root", "pre-existing"]);

        subscriber.stop().await;
    }

    // S4: two messages sharing the same `time` are both delivered.
    #[tokio::test]
    async fn delivers_both_messages_on_a_time_tie() {
        let store = memory_store().await;
        let shared_time = chrono::Utc::now();
        store
            .publish(&[
                Message::new("a", "demo", "INFO").with_time(shared_time),
                Message::new("b", "demo", "INFO").with_time(shared_time),
            ])
            .await
            .unwrap();

        let mut subscriber = Subscriber::new(store, fast_poll_config("sub4", &["demo"]));
        subscriber.start();

        let first = subscriber.get_message(Some(Duration::from_secs(1))).await.unwrap();
        let second = subscriber.get_message(Some(Duration::from_secs(1))).await.unwrap();
        let mut texts = vec![first.text, second.text];
        texts.sort();
        assert_eq!(texts, vec!["a", "b"]);

        subscriber.stop().await;
    }
}
