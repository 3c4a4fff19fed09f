//! Hierarchical parameter store.
//!
//! Parameters live in a nested TOML table.  A key such as
//! `normals/search_radius` looked up from namespace `/robot` resolves to the
//! path `robot → normals → search_radius`:
//!
//! ```toml
//! [robot.normals]
//! search_radius = 0.05
//! ```
//!
//! The store is built once at startup and handed to nodes read-only through
//! their context.

use normalcast_types::NormalsError;
use serde::de::DeserializeOwned;
use toml::{Table, Value};

use crate::names;

/// Read-mostly, namespace-aware parameter tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    root: Table,
}

impl ParameterStore {
    /// Wrap an already-parsed table.
    pub fn new(root: Table) -> Self {
        Self { root }
    }

    /// Parse a TOML document into a store.
    ///
    /// # Errors
    ///
    /// Returns [`NormalsError::Serialization`] when `raw` is not valid TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self, NormalsError> {
        let root: Table = raw
            .parse()
            .map_err(|e| NormalsError::Serialization(format!("Failed to parse parameters: {e}")))?;
        Ok(Self { root })
    }

    /// Return the raw value at an already-resolved absolute `path`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = names::segments(path);
        let mut value = self.root.get(segments.next()?)?;
        for segment in segments {
            value = value.as_table()?.get(segment)?;
        }
        Some(value)
    }

    /// Fetch and deserialize the parameter `key` resolved under `namespace`.
    ///
    /// Integers are accepted where floats are requested.
    ///
    /// # Errors
    ///
    /// * [`NormalsError::MissingParameter`] when the key is absent.
    /// * [`NormalsError::InvalidParameter`] when the value has the wrong type.
    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<T, NormalsError> {
        let path = names::resolve(namespace, key);
        let value = self
            .lookup(&path)
            .ok_or_else(|| NormalsError::MissingParameter(path.clone()))?;
        value.clone().try_into().map_err(|e: toml::de::Error| {
            NormalsError::InvalidParameter {
                key: path,
                reason: e.message().to_string(),
            }
        })
    }

    /// Like [`get`][Self::get], but an absent key yields `default`.
    ///
    /// A present key with the wrong type is still an error.
    pub fn get_or<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
        default: T,
    ) -> Result<T, NormalsError> {
        match self.get(namespace, key) {
            Err(NormalsError::MissingParameter(_)) => Ok(default),
            other => other,
        }
    }

    /// Set `key` (resolved from the root) to `value`, creating intermediate
    /// tables and replacing non-table values in the way.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let path = names::resolve("/", key);
        let mut segments: Vec<&str> = names::segments(&path).collect();
        let Some(leaf) = segments.pop() else {
            return;
        };
        let mut table = &mut self.root;
        for segment in segments {
            let entry = table
                .entry(segment.to_string())
                .or_insert_with(|| Value::Table(Table::new()));
            if !entry.is_table() {
                *entry = Value::Table(Table::new());
            }
            let Some(next) = entry.as_table_mut() else {
                return;
            };
            table = next;
        }
        table.insert(leaf.to_string(), value.into());
    }
}
