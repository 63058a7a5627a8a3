//! Messages are plain data: a producer's topic, severity level, originating
//! host, and text. A message does not publish, fetch, or validate itself —
//! those are capabilities of the [message layer](crate::store::Store).

use chrono::{DateTime, Utc};
use gethostname::gethostname;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A message produced on a topic, tagged with a severity level and
/// originating host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the store on publish; `None` for a message not yet
    /// written.
    pub id: Option<i64>,
    pub time: DateTime<Utc>,
    pub topic: String,
    pub level: String,
    pub host: String,
    pub text: String,
}

impl Message {
    /// Constructs a message with `time` defaulted to now and `host`
    /// defaulted to the local hostname.
    pub fn new(text: impl Into<String>, topic: impl Into<String>, level: impl Into<String>) -> Self {
        Message {
            id: None,
            time: Utc::now(),
            topic: topic.into(),
            level: level.into(),
            host: local_hostname(),
            text: text.into(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Builds a message from fields that may not have been supplied yet
    /// (used by the publisher, whose `topic`/`level` may be bound globally
    /// at construction instead of per call). Fails with a validation error
    /// once `topic` or `level` is still missing after merging with bound
    /// defaults.
    pub(crate) fn try_from_parts(
        text: String,
        topic: Option<String>,
        level: Option<String>,
        host: Option<String>,
        time: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let topic = topic.ok_or_else(|| Error::validation("Message.topic is required"))?;
        let level = level.ok_or_else(|| Error::validation("Message.level is required"))?;
        Ok(Message {
            id: None,
            time: time.unwrap_or_else(Utc::now),
            topic,
            level,
            host: host.unwrap_or_else(local_hostname),
            text,
        })
    }
}

pub(crate) fn local_hostname() -> String {
    gethostname().to_string_lossy().into_owned()
}
