//! Named statement parameters.
//!
//! Parameters are keyed by their placeholder name including the prefix
//! (`:id`). A script binds, per statement, only the names that statement
//! references. List parameters travel as JSON arrays and are expanded with
//! `json_each(:name)` on the SQL side.

use super::{QueryError, QueryResult};
use rusqlite::types::Value;
use serde::Serialize;
use uuid::Uuid;

/// Ordered set of named parameter values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: Vec<(String, Value)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a raw SQLite value, replacing an earlier value of the same name.
    pub fn value(mut self, name: &str, value: Value) -> Self {
        match self.values.iter_mut().find(|(key, _)| key == name) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((name.to_string(), value)),
        }
        self
    }

    pub fn text(self, name: &str, value: impl Into<String>) -> Self {
        self.value(name, Value::Text(value.into()))
    }

    pub fn opt_text(self, name: &str, value: Option<&str>) -> Self {
        let value = value.map_or(Value::Null, |text| Value::Text(text.to_string()));
        self.value(name, value)
    }

    pub fn int(self, name: &str, value: i64) -> Self {
        self.value(name, Value::Integer(value))
    }

    /// Binds a UUID in its canonical hyphenated text form.
    pub fn uuid(self, name: &str, value: Uuid) -> Self {
        self.text(name, value.to_string())
    }

    /// Binds a JSON array of UUIDs, one element per id.
    pub fn uuid_list(self, name: &str, values: &[Uuid]) -> Self {
        let items: Vec<serde_json::Value> = values
            .iter()
            .map(|id| serde_json::Value::String(id.to_string()))
            .collect();
        self.text(name, serde_json::Value::Array(items).to_string())
    }

    /// Binds any serializable value as JSON text.
    ///
    /// # Errors
    /// - `InvalidParameter` when `value` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(self, name: &str, value: &T) -> QueryResult<Self> {
        let text = serde_json::to_string(value).map_err(|err| QueryError::InvalidParameter {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
        Ok(self.value(name, Value::Text(text)))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
