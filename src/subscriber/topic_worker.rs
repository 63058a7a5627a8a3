//! One task per `(subscriber, topic)` pair currently active: loads its
//! starting cursor, then fetches, enqueues, and advances that cursor in a
//! loop until cancelled.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::message::Message;
use crate::store::Store;

pub(super) async fn run(
    store: Store,
    subscriber: String,
    topic: String,
    batch_size: i64,
    poll: Duration,
    message_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut cursor = match store.latest(&subscriber, &topic).await {
        Ok(access) => access.time,
        Err(err) => {
            error!(%err, %topic, "failed to load starting cursor, topic worker exiting");
            return;
        }
    };

    while !cancel.is_cancelled() {
        let started = Instant::now();

        match store.fetch(&topic, cursor, batch_size).await {
            Ok(messages) => {
                let mut last = cursor;
                let mut interrupted = false;
                for message in messages {
                    last = message.time;
                    if message_tx.send(message).await.is_err() {
                        // The subscriber was dropped; nothing left to feed.
                        return;
                    }
                    if cancel.is_cancelled() {
                        interrupted = true;
                        break;
                    }
                }
                if last > cursor {
                    match store.update(&subscriber, &topic, last).await {
                        Ok(()) => cursor = last,
                        Err(err) => {
                            error!(%err, %topic, "failed to advance cursor, retrying next cycle")
                        }
                    }
                }
                if interrupted {
                    break;
                }
            }
            Err(err) => error!(%err, %topic, "fetch failed, retrying next cycle"),
        }

        let remaining = poll.saturating_sub(started.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = cancel.cancelled() => break,
        }
    }
}
