//! Volume Actor Events
//!
//! Events are a name plus an argument map, used both for requests into an
//! actor and for the responses it hands back.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Event arguments
pub type EventArgs = BTreeMap<String, serde_json::Value>;

/// A named event with arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub args: EventArgs,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: EventArgs::new(),
        }
    }

    /// Add an argument, failing if it does not serialize to JSON
    pub fn try_with(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Internal(format!("event {} argument {}: {}", self.name, key, e)))?;
        self.args.insert(key, value);
        Ok(self)
    }

    /// Add an argument. One that fails to serialize is logged and left
    /// out, so readers see it as missing.
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.args.insert(key, value);
            }
            Err(e) => tracing::warn!("Dropping argument {} of event {}: {}", key, self.name, e),
        }
        self
    }

    /// Build an error response
    pub fn error(err: &Error) -> Self {
        Event::new("error").with("error", err.to_string())
    }

    pub fn is_error(&self) -> bool {
        self.name == "error"
    }

    /// Read a string argument
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }

    /// Deserialize a typed argument
    pub fn arg<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .args
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("event {} is missing argument {}", self.name, key)))?;
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        write!(f, "<Event {}: {}>", self.name, args.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_args() {
        let event = Event::new("update-dirty").with("dirty_bytes", 42i64).with("who", "node-1");
        assert_eq!(event.arg::<i64>("dirty_bytes").unwrap(), 42);
        assert_eq!(event.str_arg("who"), Some("node-1"));
        assert!(event.arg::<i64>("missing").is_err());
        assert_eq!(event.to_string(), "<Event update-dirty: dirty_bytes: 42, who: \"node-1\">");
    }

    #[test]
    fn test_unserializable_arg_is_reported() {
        let mut bad = std::collections::HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON object keys");

        let err = Event::new("status").try_with("bad", &bad).unwrap_err();
        assert!(err.to_string().contains("argument bad"));

        let event = Event::new("status").with("ok", 1).with("bad", &bad);
        assert_eq!(event.arg::<i32>("ok").unwrap(), 1);
        assert!(!event.args.contains_key("bad"));
        assert!(event.arg::<String>("bad").unwrap_err().to_string().contains("missing argument bad"));
    }
}
