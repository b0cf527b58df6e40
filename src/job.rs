//! Job data model and reply decoding for the queue cluster's wire format.

use redis::Value;
use serde::{Deserialize, Serialize};

use std::borrow::Cow;
use std::time::Duration;

use crate::error::QueueError;

/// Retry window applied by the queue cluster when a job is added without an
/// explicit one.
pub(crate) const DEFAULT_RETRY: Duration = Duration::from_secs(300);

#[derive(Clone, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
/// Identifier assigned by the queue cluster when a job is added.
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        JobId(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
/// Name producers and consumers rendezvous on.
///
/// Use `QueueName::new` for static names:
///
/// ```rust
/// use relayq::QueueName;
///
/// const MAIL_QUEUE: QueueName = QueueName::new("mail");
/// ```
pub struct QueueName(Cow<'static, str>);

impl QueueName {
    pub const fn new(name: &'static str) -> Self {
        QueueName(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        QueueName(Cow::Owned(name))
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        QueueName(Cow::Owned(name.to_string()))
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
/// A job as seen by this client: the queue-assigned identifier, the opaque
/// body, and the retry window after which an unacknowledged delivery is
/// handed to another consumer.
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    pub body: String,
    pub retry: Duration,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// Per-job options honored by [`add`](crate::Producer::add_job).
pub struct AddOptions {
    /// Number of queue nodes that must replicate the job before the add
    /// returns. Defaults to the cluster's own policy.
    pub replicate: Option<u32>,
    /// Retry window; how long a delivery may stay unacknowledged before the
    /// job is requeued.
    pub retry: Option<Duration>,
    /// Hard expiry after which the queue drops the job entirely.
    pub ttl: Option<Duration>,
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        _ => None,
    }
}

impl Job {
    /// Decode a `SHOW <id>` reply: a flat array of field name / value pairs,
    /// or nil when the job is unknown to the node.
    pub(crate) fn from_show_reply(value: Value) -> Result<Option<Job>, QueueError> {
        let items = match value {
            Value::Nil => return Ok(None),
            Value::Array(items) => items,
            other => {
                return Err(QueueError::MalformedReply(format!(
                    "expected field/value array from SHOW, got {other:?}"
                )));
            }
        };
        let mut id = None;
        let mut queue = None;
        let mut body = None;
        let mut retry = None;
        for pair in items.chunks(2) {
            let [field, value] = pair else { continue };
            match text(field).as_deref() {
                Some("id") => id = text(value),
                Some("queue") => queue = text(value),
                Some("body") => body = text(value),
                Some("retry") => retry = integer(value),
                _ => {}
            }
        }
        let (Some(id), Some(queue)) = (id, queue) else {
            return Err(QueueError::MalformedReply(
                "SHOW reply missing id or queue".to_string(),
            ));
        };
        Ok(Some(Job {
            id: JobId(id),
            queue: QueueName::from(queue),
            body: body.unwrap_or_default(),
            retry: Duration::from_secs(retry.unwrap_or(0).max(0) as u64),
        }))
    }

    /// Decode a `GETJOB` reply: an array of `[queue, id, body]` triples, or
    /// nil when the blocking timeout expired. Only the first delivery is
    /// taken; the retry window is filled in by a follow-up `SHOW`.
    pub(crate) fn from_fetch_reply(value: Value) -> Result<Option<Job>, QueueError> {
        let deliveries = match value {
            Value::Nil => return Ok(None),
            Value::Array(deliveries) => deliveries,
            other => {
                return Err(QueueError::MalformedReply(format!(
                    "expected delivery array from GETJOB, got {other:?}"
                )));
            }
        };
        let Some(first) = deliveries.into_iter().next() else {
            return Ok(None);
        };
        let Value::Array(triple) = first else {
            return Err(QueueError::MalformedReply(
                "GETJOB delivery is not an array".to_string(),
            ));
        };
        let (Some(queue), Some(id), Some(body)) = (
            triple.first().and_then(text),
            triple.get(1).and_then(text),
            triple.get(2).and_then(text),
        ) else {
            return Err(QueueError::MalformedReply(
                "GETJOB delivery missing queue, id or body".to_string(),
            ));
        };
        Ok(Some(Job {
            id: JobId(id),
            queue: QueueName::from(queue),
            body,
            retry: DEFAULT_RETRY,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn show_reply_decodes_fields() {
        let reply = Value::Array(vec![
            bulk("id"),
            bulk("D-deadbeef-1234"),
            bulk("queue"),
            bulk("mail"),
            bulk("state"),
            bulk("queued"),
            bulk("retry"),
            Value::Int(120),
            bulk("body"),
            bulk("payload"),
        ]);
        let job = Job::from_show_reply(reply).unwrap().unwrap();
        assert_eq!(job.id.as_str(), "D-deadbeef-1234");
        assert_eq!(job.queue.as_str(), "mail");
        assert_eq!(job.body, "payload");
        assert_eq!(job.retry, Duration::from_secs(120));
    }

    #[test]
    fn show_reply_nil_means_unknown_job() {
        assert!(Job::from_show_reply(Value::Nil).unwrap().is_none());
    }

    #[test]
    fn show_reply_without_id_is_malformed() {
        let reply = Value::Array(vec![bulk("body"), bulk("payload")]);
        assert!(matches!(
            Job::from_show_reply(reply),
            Err(QueueError::MalformedReply(_))
        ));
    }

    #[test]
    fn fetch_reply_takes_first_delivery() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("mail"),
            bulk("D-deadbeef-1"),
            bulk("payload"),
        ])]);
        let job = Job::from_fetch_reply(reply).unwrap().unwrap();
        assert_eq!(job.queue.as_str(), "mail");
        assert_eq!(job.id.as_str(), "D-deadbeef-1");
        assert_eq!(job.body, "payload");
    }

    #[test]
    fn fetch_reply_nil_means_timeout() {
        assert!(Job::from_fetch_reply(Value::Nil).unwrap().is_none());
    }
}
