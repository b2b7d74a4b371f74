//! Query and mutation models.
//!
//! A [`QueryOutcome`] has exactly one of two shapes: a row set (read) or a
//! write summary. Callers tell them apart by the presence of `results`.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::{AppError, AppResult};

/// One row or document, keyed by column/field name.
pub type Record = Map<String, Value>;

/// Result of an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutcome {
    Rows(RowSet),
    Write(WriteSummary),
}

/// Rows produced by a read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowSet {
    /// Row objects (or plain values, for `distinct`).
    pub results: Vec<Value>,
    /// Column names in result order.
    pub fields: Vec<String>,
    /// Number of rows returned.
    pub affected_rows: u64,
}

impl RowSet {
    pub fn new(results: Vec<Value>, fields: Vec<String>) -> Self {
        let affected_rows = results.len() as u64;
        Self {
            results,
            fields,
            affected_rows,
        }
    }
}

/// Summary of a write. Only the fields a backend reports are serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteSummary {
    pub affected_rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_ids: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upserted_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Rows echoed back by `RETURNING` / `OUTPUT` clauses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returning: Option<Vec<Value>>,
}

impl WriteSummary {
    pub fn affected(affected_rows: u64) -> Self {
        Self {
            affected_rows,
            ..Default::default()
        }
    }
}

impl QueryOutcome {
    pub fn rows(results: Vec<Value>, fields: Vec<String>) -> Self {
        QueryOutcome::Rows(RowSet::new(results, fields))
    }

    pub fn write(summary: WriteSummary) -> Self {
        QueryOutcome::Write(summary)
    }

    /// Rows affected (or returned, for reads).
    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryOutcome::Rows(rows) => rows.affected_rows,
            QueryOutcome::Write(write) => write.affected_rows,
        }
    }
}

/// Records passed to `insert_data`.
///
/// Accepts a single object or a non-empty array of objects. The column set is
/// the key set of the first record.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRows {
    records: Vec<Record>,
    single: bool,
}

impl InsertRows {
    pub fn from_value(value: &Value) -> AppResult<Self> {
        match value {
            Value::Object(record) => Ok(Self {
                records: vec![record.clone()],
                single: true,
            }),
            Value::Array(items) if items.is_empty() => {
                Err(AppError::Validation("No data provided for insertion".into()))
            }
            Value::Array(items) => {
                let records = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        item.as_object().cloned().ok_or_else(|| {
                            AppError::Validation(format!("Record {i} in 'data' is not an object"))
                        })
                    })
                    .collect::<AppResult<Vec<_>>>()?;
                Ok(Self {
                    records,
                    single: false,
                })
            }
            _ => Err(AppError::Validation(
                "'data' must be an object or an array of objects".into(),
            )),
        }
    }

    /// Column names, taken from the first record.
    pub fn columns(&self) -> Vec<String> {
        self.records
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Values of one record in column order; absent keys become NULL.
    pub fn values_of<'a>(&self, record: &'a Record, columns: &[String]) -> Vec<&'a Value> {
        const NULL: &Value = &Value::Null;
        columns
            .iter()
            .map(|c| record.get(c).unwrap_or(NULL))
            .collect()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Whether the caller passed a single object rather than an array.
    pub fn is_single(&self) -> bool {
        self.single
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Validates the `data`/`where` objects of an update or delete.
pub fn non_empty_object<'a>(value: &'a Value, name: &str) -> AppResult<&'a Record> {
    match value {
        Value::Object(map) if !map.is_empty() => Ok(map),
        Value::Object(_) => Err(AppError::Validation(format!("'{name}' must not be empty"))),
        _ => Err(AppError::Validation(format!("'{name}' must be an object"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_object_insert() {
        let rows = InsertRows::from_value(&json!({"name": "Ana", "age": 30})).unwrap();
        assert!(rows.is_single());
        assert_eq!(rows.columns(), vec!["name", "age"]);
    }

    #[test]
    fn test_empty_array_is_validation_error() {
        let err = InsertRows::from_value(&json!([])).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_non_object_record_is_rejected() {
        let err = InsertRows::from_value(&json!([{"a": 1}, 2])).unwrap_err();
        assert!(err.to_string().contains("Record 1"));
    }

    #[test]
    fn test_missing_keys_bind_null() {
        let rows = InsertRows::from_value(&json!([{"a": 1, "b": 2}, {"a": 3}])).unwrap();
        let columns = rows.columns();
        let second = rows.values_of(&rows.records()[1], &columns);
        assert_eq!(second, vec![&json!(3), &Value::Null]);
    }

    #[test]
    fn test_outcome_shapes_are_distinguishable() {
        let read = serde_json::to_value(QueryOutcome::rows(vec![json!({"id": 1})], vec!["id".into()]))
            .unwrap();
        assert_eq!(read["affected_rows"], json!(1));
        assert!(read.get("results").is_some());

        let write = serde_json::to_value(QueryOutcome::write(WriteSummary {
            insert_id: Some(json!(7)),
            ..WriteSummary::affected(1)
        }))
        .unwrap();
        assert_eq!(write, json!({"affected_rows": 1, "insert_id": 7}));
    }

    #[test]
    fn test_empty_where_is_rejected() {
        assert!(non_empty_object(&json!({}), "where").is_err());
        assert!(non_empty_object(&json!([1]), "where").is_err());
        assert!(non_empty_object(&json!({"id": 1}), "where").is_ok());
    }
}
