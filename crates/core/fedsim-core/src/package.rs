//! Packages exchanged between the coordinator and its clients
//!
//! A package is a keyed bag of JSON values. The engine only needs two things
//! from it: a deterministic size (the length of its JSON encoding) and the
//! parameter count of an optional `model` field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SimError};
use crate::types::{ClientId, Time};

/// Field holding model parameters, if any
pub const MODEL_FIELD: &str = "model";

/// Columnar result of a communication call: one sequence per field, aligned
/// to the order of the client ids it was produced for
pub type Columns = BTreeMap<String, Vec<Value>>;

/// Response (or outbound message) for a single client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Package(BTreeMap<String, Value>);

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialized size of the whole package
    pub fn size(&self) -> u64 {
        serde_json::to_vec(&self.0)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or_default()
    }

    /// Number of parameters in the `model` field (0 without one)
    pub fn model_size(&self) -> u64 {
        self.0.get(MODEL_FIELD).map_or(0, count_parameters)
    }
}

impl From<BTreeMap<String, Value>> for Package {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Package(fields)
    }
}

/// Numeric leaves of a JSON value
fn count_parameters(value: &Value) -> u64 {
    match value {
        Value::Number(_) => 1,
        Value::Array(items) => items.iter().map(count_parameters).sum(),
        Value::Object(fields) => fields.values().map(count_parameters).sum(),
        _ => 0,
    }
}

/// A package tagged with its sender and computed arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedPackage {
    #[serde(rename = "__cid")]
    pub cid: ClientId,
    #[serde(rename = "__t")]
    pub arrival: Time,
    pub package: Package,
}

/// Split a columnar result into one package per client
///
/// Every column must hold exactly `count` values.
pub fn transpose(columns: Columns, count: usize) -> Result<Vec<Package>> {
    let mut packages = vec![Package::new(); count];
    for (key, values) in columns {
        if values.len() != count {
            return Err(SimError::ArityMismatch {
                ids: count,
                values: values.len(),
            });
        }
        for (package, value) in packages.iter_mut().zip(values) {
            package.insert(key.clone(), value);
        }
    }
    Ok(packages)
}

/// Inverse of [`transpose`]; fields missing from a package become `null`
pub fn columns_of(packages: &[Package]) -> Columns {
    let mut columns = Columns::new();
    for key in packages.iter().flat_map(|p| p.keys()) {
        columns.entry(key.clone()).or_default();
    }
    for (key, values) in columns.iter_mut() {
        values.extend(
            packages
                .iter()
                .map(|p| p.get(key).cloned().unwrap_or(Value::Null)),
        );
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_size_counts_numbers() {
        let package = Package::new()
            .with(MODEL_FIELD, json!([[1.0, 2.0], [3.0, 4.0]]))
            .with("loss", 0.5);
        assert_eq!(package.model_size(), 4);
        assert_eq!(Package::new().with("loss", 0.5).model_size(), 0);
    }

    #[test]
    fn test_size_is_monotonic() {
        let small = Package::new().with(MODEL_FIELD, json!([1.0]));
        let large = Package::new().with(MODEL_FIELD, json!([1.0, 2.0, 3.0]));
        assert!(large.size() > small.size());
        assert_eq!(small.size(), small.clone().size());
    }

    #[test]
    fn test_transpose_aligns_columns() {
        let mut columns = Columns::new();
        columns.insert("loss".into(), vec![json!(0.1), json!(0.2)]);
        columns.insert("steps".into(), vec![json!(3), json!(4)]);

        let packages = transpose(columns, 2).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[1].get("loss"), Some(&json!(0.2)));
        assert_eq!(packages[0].get("steps"), Some(&json!(3)));
    }

    #[test]
    fn test_transpose_rejects_ragged_columns() {
        let mut columns = Columns::new();
        columns.insert("loss".into(), vec![json!(0.1)]);
        let err = transpose(columns, 2).unwrap_err();
        assert_eq!(err, SimError::ArityMismatch { ids: 2, values: 1 });
    }

    #[test]
    fn test_columns_of_fills_missing_fields() {
        let packages = vec![
            Package::new().with("loss", 0.1),
            Package::new().with("acc", 0.9),
        ];
        let columns = columns_of(&packages);
        assert_eq!(columns["loss"], vec![json!(0.1), Value::Null]);
        assert_eq!(columns["acc"], vec![Value::Null, json!(0.9)]);
    }
}
