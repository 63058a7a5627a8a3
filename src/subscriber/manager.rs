//! One task per Subscriber: consumes the topic queue, starts a topic worker
//! the first time each name is seen, and tears everything down on STOP.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::message::Message;
use crate::store::Store;

use super::{topic_worker, TopicEvent};

#[allow(clippy::too_many_arguments)]
pub(super) async fn run(
    mut topic_rx: mpsc::Receiver<TopicEvent>,
    message_tx: mpsc::Sender<Message>,
    store: Store,
    subscriber: String,
    batch_size: i64,
    poll: Duration,
    spacing: Duration,
    name_handle: JoinHandle<()>,
    topics_cancel: CancellationToken,
) {
    let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(event) = topic_rx.recv().await {
        match event {
            TopicEvent::Topic(name) => {
                if workers.contains_key(&name) {
                    continue;
                }
                let handle = tokio::spawn(topic_worker::run(
                    store.clone(),
                    subscriber.clone(),
                    name.clone(),
                    batch_size,
                    poll,
                    message_tx.clone(),
                    topics_cancel.clone(),
                ));
                workers.insert(name, handle);
                tokio::time::sleep(spacing).await;
            }
            TopicEvent::Stop => break,
        }
    }

    topics_cancel.cancel();
    for (topic, handle) in workers {
        if let Err(err) = handle.await {
            error!(%err, %topic, "topic worker panicked");
        }
    }
    if let Err(err) = name_handle.await {
        error!(%err, "name worker panicked");
    }
}
