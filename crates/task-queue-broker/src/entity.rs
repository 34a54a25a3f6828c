use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        ExchangeSpec {
            name: name.into(),
            kind,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub exchange: ExchangeSpec,
    pub routing_key: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, exchange: ExchangeSpec, routing_key: impl Into<String>) -> Self {
        QueueSpec {
            name: name.into(),
            exchange,
            routing_key: routing_key.into(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Value of the `x-queue-type` argument, if declared
    pub fn queue_type(&self) -> Option<&str> {
        self.arguments.get("x-queue-type").and_then(Value::as_str)
    }
}

/// Queue type used for the delayed-delivery level queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Classic,
    Quorum,
}

impl QueueType {
    pub const ALL: [QueueType; 2] = [QueueType::Classic, QueueType::Quorum];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Classic => "classic",
            QueueType::Quorum => "quorum",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseQueueTypeError(pub String);

impl fmt::Display for ParseQueueTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let valid: Vec<&str> = QueueType::ALL.iter().map(QueueType::as_str).collect();
        write!(
            f,
            "Invalid queue type '{}'. Must be one of: {}",
            self.0,
            valid.join(", ")
        )
    }
}

impl std::error::Error for ParseQueueTypeError {}

impl FromStr for QueueType {
    type Err = ParseQueueTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseQueueTypeError(s.to_string()))
    }
}
