//! One task per Subscriber: discovers topics under each configured root and
//! feeds their names to the manager through the topic queue.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::store::Store;

use super::TopicEvent;

pub(super) async fn run(
    store: Store,
    roots: Vec<String>,
    separator: char,
    poll: Duration,
    topic_tx: mpsc::Sender<TopicEvent>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        for root in &roots {
            if topic_tx.send(TopicEvent::Topic(root.clone())).await.is_err() {
                return;
            }
            match store.discover_topics(root, separator).await {
                Ok(names) => {
                    for name in names {
                        if &name == root {
                            continue;
                        }
                        if topic_tx.send(TopicEvent::Topic(name)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => error!(%err, %root, "topic discovery failed, retrying next cycle"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.cancelled() => break,
        }
    }

    let _ = topic_tx.send(TopicEvent::Stop).await;
}
