// src/rabbitmq/batch.rs
use std::fmt;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::MqError;

const MB: u64 = 1024 * 1024;

/// Messages handed to a batch publish.
///
/// `Materialized` input has a known length, which drives the sizing policy.
/// `Lazy` input is produced on demand and consumed exactly once, in order.
pub enum Batch<'a> {
    Materialized(Vec<Vec<u8>>),
    Lazy(BoxStream<'a, Vec<u8>>),
}

impl<'a> Batch<'a> {
    /// Wraps a single-pass iterator, e.g. rows read from a cursor.
    pub fn lazy<I>(messages: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'a,
    {
        Batch::Lazy(stream::iter(messages).boxed())
    }

    pub fn from_stream<S>(messages: S) -> Self
    where
        S: Stream<Item = Vec<u8>> + Send + 'a,
    {
        Batch::Lazy(messages.boxed())
    }

    /// Known length, `None` for lazy input.
    pub fn len(&self) -> Option<usize> {
        match self {
            Batch::Materialized(messages) => Some(messages.len()),
            Batch::Lazy(_) => None,
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, Batch::Lazy(_))
    }

    pub fn into_stream(self) -> BoxStream<'a, Vec<u8>> {
        match self {
            Batch::Materialized(messages) => stream::iter(messages).boxed(),
            Batch::Lazy(messages) => messages,
        }
    }
}

impl fmt::Debug for Batch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Batch::Materialized(messages) => f.debug_tuple("Materialized").field(&messages.len()).finish(),
            Batch::Lazy(_) => f.write_str("Lazy"),
        }
    }
}

impl From<Vec<Vec<u8>>> for Batch<'_> {
    fn from(messages: Vec<Vec<u8>>) -> Self {
        Batch::Materialized(messages)
    }
}

impl From<Vec<String>> for Batch<'_> {
    fn from(messages: Vec<String>) -> Self {
        Batch::Materialized(messages.into_iter().map(String::into_bytes).collect())
    }
}

impl From<Vec<&str>> for Batch<'_> {
    fn from(messages: Vec<&str>) -> Self {
        Batch::Materialized(messages.into_iter().map(|m| m.as_bytes().to_vec()).collect())
    }
}

/// Batches built from untyped JSON: only arrays are accepted. String
/// elements are sent as their UTF-8 bytes, anything else as encoded JSON.
impl TryFrom<Value> for Batch<'static> {
    type Error = MqError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Array(items) = value else {
            return Err(MqError::InvalidBatch(format!(
                "must be an array of messages, got {}",
                kind_of(&value)
            )));
        };

        let messages = items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => Ok(text.into_bytes()),
                other => serde_json::to_vec(&other),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Batch::Materialized(messages))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// How much client-side buffering a batch may use, by input size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Batches longer than this get `large_batch_budget_mb`.
    pub large_batch_threshold: usize,
    /// Batches longer than this get `huge_batch_budget_mb`.
    pub huge_batch_threshold: usize,
    pub large_batch_budget_mb: u64,
    pub huge_batch_budget_mb: u64,
    /// Lazy input has no length, so it always gets this budget.
    pub stream_budget_mb: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            large_batch_threshold: 5000,
            huge_batch_threshold: 10000,
            large_batch_budget_mb: 500,
            huge_batch_budget_mb: 1000,
            stream_budget_mb: 500,
        }
    }
}

/// Hint handed to the channel before a batch is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSizing {
    pub expected_messages: Option<usize>,
    /// `None` keeps the channel's own default.
    pub memory_budget_bytes: Option<u64>,
}

impl BatchPolicy {
    pub fn sizing(&self, batch: &Batch<'_>) -> BatchSizing {
        match batch.len() {
            Some(len) => BatchSizing {
                expected_messages: Some(len),
                memory_budget_bytes: self.budget_for_len(len),
            },
            None => BatchSizing {
                expected_messages: None,
                memory_budget_bytes: Some(self.stream_budget_mb * MB),
            },
        }
    }

    fn budget_for_len(&self, len: usize) -> Option<u64> {
        if len > self.huge_batch_threshold {
            Some(self.huge_batch_budget_mb * MB)
        } else if len > self.large_batch_threshold {
            Some(self.large_batch_budget_mb * MB)
        } else {
            None
        }
    }
}
