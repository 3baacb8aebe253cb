//! Metadata attached to a download by its client.
//!
//! The map is free-form; only a handful of keys mean something to the engine.
//! Everything else is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const LOCAL_PATH_KEY: &str = "local-path";
pub const COMMAND_KEY: &str = "post-download-command";
pub const OBJECT_PATH_KEY: &str = "objectpath";

/// Token in command arguments replaced by the final file path.
pub const COMMAND_FILE_KEY: &str = "$file";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn with_local_path(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.with(LOCAL_PATH_KEY, path.to_string_lossy().into_owned())
    }

    #[must_use]
    pub fn with_command<I, S>(self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list: Vec<Value> = command
            .into_iter()
            .map(|s| Value::String(s.into()))
            .collect();
        self.with(COMMAND_KEY, Value::Array(list))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Explicit destination, honoured only for unconfined downloads.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.0
            .get(LOCAL_PATH_KEY)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    pub fn has_local_path(&self) -> bool {
        self.local_path().is_some()
    }

    /// The post-download command, program first.
    ///
    /// `None` when the key is absent. A present key that holds no usable
    /// strings yields an empty list, which callers treat as an error.
    pub fn command(&self) -> Option<Vec<String>> {
        let value = self.0.get(COMMAND_KEY)?;
        let command = match value {
            Value::String(s) if s.is_empty() => Vec::new(),
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        Some(command)
    }

    pub fn object_path(&self) -> Option<&str> {
        self.0.get(OBJECT_PATH_KEY).and_then(Value::as_str)
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_from_list() {
        let metadata = Metadata::new().with_command(["unzip", "$file", "-d", "/tmp"]);
        assert_eq!(
            metadata.command(),
            Some(vec![
                "unzip".to_string(),
                "$file".to_string(),
                "-d".to_string(),
                "/tmp".to_string()
            ])
        );
    }

    #[test]
    fn test_command_from_single_string() {
        let metadata = Metadata::new().with(COMMAND_KEY, "touch");
        assert_eq!(metadata.command(), Some(vec!["touch".to_string()]));
    }

    #[test]
    fn test_empty_command_is_present_but_empty() {
        let metadata = Metadata::new().with(COMMAND_KEY, json!([]));
        assert_eq!(metadata.command(), Some(Vec::new()));
        assert_eq!(Metadata::new().command(), None);
    }

    #[test]
    fn test_object_path_is_passed_through() {
        let metadata: Metadata = serde_json::from_value(json!({
            "objectpath": "/com/example/download/1",
            "title": "Backup"
        }))
        .unwrap();
        assert_eq!(metadata.object_path(), Some("/com/example/download/1"));
        assert_eq!(metadata.get("title"), Some(&json!("Backup")));
    }

    #[test]
    fn test_empty_local_path_is_ignored() {
        let metadata = Metadata::new().with(LOCAL_PATH_KEY, "");
        assert!(!metadata.has_local_path());
    }
}
