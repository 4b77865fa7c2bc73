use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One line of the experimental event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Nanoseconds since the session clock started.
    pub at_ns: u64,
    pub event: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl EventLogEntry {
    pub fn new(at_ns: u64, event: impl Into<String>) -> Self {
        Self {
            at_ns,
            event: event.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}
