//! Table structure models.
//!
//! For SQL backends a [`TableStructure`] mirrors the catalog at query time.
//! For the document backend it is inferred from a bounded sample and is
//! advisory only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Structure of one table or collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TableStructure {
    /// Table or collection name.
    pub table_name: String,
    /// Columns in catalog order (first-seen order for documents).
    pub columns: Vec<ColumnInfo>,
    /// Indexes, one entry per index name.
    pub indexes: Vec<IndexInfo>,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Backend-native type string, or an inferred primitive for documents.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column accepts NULL (or may be absent, for documents).
    pub nullable: bool,
    /// Default value expression, if any.
    #[schema(value_type = Object)]
    pub default: Option<Value>,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
    /// Whether the column auto-increments, when the backend can tell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<bool>,
}

/// Index classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexKind {
    Primary,
    Unique,
    Index,
}

impl IndexKind {
    /// Classifies an index from its catalog flags.
    pub fn classify(primary: bool, unique: bool) -> Self {
        if primary {
            IndexKind::Primary
        } else if unique {
            IndexKind::Unique
        } else {
            IndexKind::Index
        }
    }
}

/// One index, with its columns in key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    #[serde(rename = "type")]
    pub kind: IndexKind,
}

/// One catalog row describing a single (index, column) pair.
///
/// SQL catalogs report indexes one row per indexed column; these rows are
/// folded into [`IndexInfo`] entries by [`fold_index_rows`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexColumnRow {
    pub index_name: String,
    pub column_name: String,
    pub unique: bool,
    pub primary: bool,
}

/// Groups per-column index rows by index name.
///
/// Index order follows the first appearance of each name; column order within
/// an index follows row order.
pub fn fold_index_rows<I>(rows: I) -> Vec<IndexInfo>
where
    I: IntoIterator<Item = IndexColumnRow>,
{
    let mut indexes: Vec<IndexInfo> = Vec::new();
    for row in rows {
        match indexes.iter_mut().find(|idx| idx.name == row.index_name) {
            Some(index) => index.columns.push(row.column_name),
            None => indexes.push(IndexInfo {
                kind: IndexKind::classify(row.primary, row.unique || row.primary),
                unique: row.unique || row.primary,
                columns: vec![row.column_name],
                name: row.index_name,
            }),
        }
    }
    indexes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: &str, column: &str, unique: bool, primary: bool) -> IndexColumnRow {
        IndexColumnRow {
            index_name: index.to_string(),
            column_name: column.to_string(),
            unique,
            primary,
        }
    }

    #[test]
    fn test_fold_groups_by_name_preserving_column_order() {
        let folded = fold_index_rows(vec![
            row("PRIMARY", "id", true, true),
            row("idx_name_email", "name", false, false),
            row("idx_name_email", "email", false, false),
            row("uq_email", "email", true, false),
        ]);

        assert_eq!(folded.len(), 3);
        assert_eq!(folded[0].kind, IndexKind::Primary);
        assert_eq!(folded[1].name, "idx_name_email");
        assert_eq!(folded[1].columns, vec!["name", "email"]);
        assert_eq!(folded[1].kind, IndexKind::Index);
        assert!(!folded[1].unique);
        assert_eq!(folded[2].kind, IndexKind::Unique);
    }

    #[test]
    fn test_fold_handles_interleaved_rows() {
        let folded = fold_index_rows(vec![
            row("a", "x", false, false),
            row("b", "y", false, false),
            row("a", "z", false, false),
        ]);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].columns, vec!["x", "z"]);
    }

    #[test]
    fn test_index_kind_serializes_uppercase() {
        let json = serde_json::to_value(IndexKind::Primary).unwrap();
        assert_eq!(json, serde_json::json!("PRIMARY"));
    }

    #[test]
    fn test_column_serializes_type_key() {
        let column = ColumnInfo {
            name: "id".into(),
            data_type: "INTEGER".into(),
            nullable: false,
            default: None,
            primary_key: true,
            auto_increment: None,
        };
        let json = serde_json::to_value(&column).unwrap();
        assert_eq!(json["type"], "INTEGER");
        assert!(json.get("auto_increment").is_none());
        assert!(json["default"].is_null());
    }
}
