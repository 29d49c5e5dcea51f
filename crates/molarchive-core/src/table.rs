//! Column-oriented data table owned by a record.
//!
//! The archive treats tables as opaque blobs: they only need to serialize
//! through the field protocol and report their column names.

use tracing::warn;

use crate::error::{ArchiveError, ArchiveResult};
use crate::protocol::{FieldValue, Value};

const HEADER: &str = "Header";
const TYPE: &str = "Type";
const VALUES: &str = "Values";

/// Values of one column.
#[derive(Debug, Clone)]
pub enum ColumnValues {
    /// Numeric column.
    Double(Vec<f64>),
    /// Text column.
    Text(Vec<String>),
}

impl ColumnValues {
    fn type_name(&self) -> &'static str {
        match self {
            ColumnValues::Double(_) => "Double",
            ColumnValues::Text(_) => "String",
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Double(v) => v.len(),
            ColumnValues::Text(v) => v.len(),
        }
    }

    /// Returns true if the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialEq for ColumnValues {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ColumnValues::Double(a), ColumnValues::Double(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_double(*x, *y))
            }
            (ColumnValues::Text(a), ColumnValues::Text(b)) => a == b,
            _ => false,
        }
    }
}

/// Equality that treats two NaNs as equal.
pub(crate) fn same_double(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column header.
    pub name: String,
    /// Column values.
    pub values: ColumnValues,
}

/// Ordered collection of named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    columns: Vec<Column>,
}

impl DataTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: appends a numeric column.
    pub fn with_doubles(mut self, name: &str, values: Vec<f64>) -> Self {
        self.set_column(name, ColumnValues::Double(values));
        self
    }

    /// Builder: appends a text column.
    pub fn with_text(mut self, name: &str, values: Vec<String>) -> Self {
        self.set_column(name, ColumnValues::Text(values));
        self
    }

    /// Adds a column, replacing any column with the same name in place.
    pub fn set_column(&mut self, name: &str, values: ColumnValues) {
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(column) => column.values = values,
            None => self.columns.push(Column {
                name: name.to_string(),
                values,
            }),
        }
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Numeric values of a column, if it is numeric.
    pub fn doubles(&self, name: &str) -> Option<&[f64]> {
        match &self.column(name)?.values {
            ColumnValues::Double(v) => Some(v),
            ColumnValues::Text(_) => None,
        }
    }

    /// Columns in order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Length of the longest column.
    pub fn row_count(&self) -> usize {
        self.columns.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }

    /// Returns true if the table has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Protocol view: an array of `{"Header", "Type", "Values"}` objects.
    pub fn to_field(&self) -> FieldValue<'_> {
        FieldValue::List(
            self.columns
                .iter()
                .map(|c| {
                    let values = match &c.values {
                        ColumnValues::Double(v) => FieldValue::Doubles(v),
                        ColumnValues::Text(v) => FieldValue::Strings(v),
                    };
                    FieldValue::Object(vec![
                        (HEADER, FieldValue::Str(&c.name)),
                        (TYPE, FieldValue::Str(c.values.type_name())),
                        (VALUES, values),
                    ])
                })
                .collect(),
        )
    }

    /// Rebuilds a table from its protocol form.
    ///
    /// Columns with an unknown type are dropped with a warning; a column
    /// without a header fails the whole table.
    pub fn from_value(field: &str, value: Value) -> ArchiveResult<Self> {
        let mut table = DataTable::new();
        for entry in value.into_array(field)? {
            let mut name = None;
            let mut kind = None;
            let mut values = None;
            for (key, v) in entry.into_object(field)? {
                match key.as_str() {
                    HEADER => name = Some(v.into_string(field)?),
                    TYPE => kind = Some(v.into_string(field)?),
                    VALUES => values = Some(v),
                    _ => {}
                }
            }
            let name = name.ok_or_else(|| ArchiveError::field(field, "column without Header"))?;
            let values = values.unwrap_or(Value::Array(Vec::new()));
            let column = match kind.as_deref().unwrap_or("Double") {
                "Double" | "double" => ColumnValues::Double(values.into_doubles(field)?),
                "String" | "string" => ColumnValues::Text(values.into_strings(field)?),
                other => {
                    warn!(field, column = %name, kind = other, "dropping column of unknown type");
                    continue;
                }
            };
            table.set_column(&name, column);
        }
        Ok(table)
    }
}

/// Key of a segment table: the (x-column, y-column) pair it was built from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentKey {
    /// X column name.
    pub x_column: String,
    /// Y column name.
    pub y_column: String,
}

impl SegmentKey {
    /// Creates a key.
    pub fn new(x_column: &str, y_column: &str) -> Self {
        Self {
            x_column: x_column.to_string(),
            y_column: y_column.to_string(),
        }
    }

    /// Protocol view: `{"xColumn", "yColumn"}`.
    pub fn to_field(&self) -> FieldValue<'_> {
        FieldValue::Object(vec![
            ("xColumn", FieldValue::Str(&self.x_column)),
            ("yColumn", FieldValue::Str(&self.y_column)),
        ])
    }

    /// Reads the pair back; accepts the legacy `xColumnName`/`yColumnName`.
    pub fn from_fields(field: &str, fields: &mut Vec<(String, Value)>) -> ArchiveResult<Self> {
        let mut x = None;
        let mut y = None;
        let mut i = 0;
        while i < fields.len() {
            match fields[i].0.as_str() {
                "xColumn" | "xColumnName" => {
                    let (_, v) = fields.remove(i);
                    x = Some(v.into_string(field)?);
                }
                "yColumn" | "yColumnName" => {
                    let (_, v) = fields.remove(i);
                    y = Some(v.into_string(field)?);
                }
                _ => i += 1,
            }
        }
        match (x, y) {
            (Some(x_column), Some(y_column)) => Ok(Self { x_column, y_column }),
            _ => Err(ArchiveError::field(field, "segment key needs xColumn and yColumn")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataTable {
        DataTable::new()
            .with_doubles("T", vec![0.0, 1.0, 2.0])
            .with_doubles("X", vec![1.5, f64::NAN, f64::INFINITY])
            .with_text("Label", vec!["a".into(), "b".into(), "c".into()])
    }

    #[test]
    fn test_column_names_and_rows() {
        let t = sample();
        assert_eq!(t.column_names().collect::<Vec<_>>(), vec!["T", "X", "Label"]);
        assert_eq!(t.row_count(), 3);
        assert_eq!(t.doubles("T"), Some(&[0.0, 1.0, 2.0][..]));
        assert!(t.doubles("Label").is_none());
    }

    #[test]
    fn test_set_column_replaces_in_place() {
        let mut t = sample();
        t.set_column("T", ColumnValues::Double(vec![9.0]));
        assert_eq!(t.columns()[0].name, "T");
        assert_eq!(t.doubles("T"), Some(&[9.0][..]));
        assert_eq!(t.columns().len(), 3);
    }

    #[test]
    fn test_nan_equality() {
        assert_eq!(sample(), sample());
        assert!(same_double(f64::NAN, f64::NAN));
        assert!(!same_double(1.0, f64::NAN));
    }

    #[test]
    fn test_json_round_trip() {
        let t = sample();
        let json = serde_json::to_string(&t.to_field()).unwrap();
        assert!(json.contains(r#""Header":"X","Type":"Double","Values":[1.5,"NaN","Infinity"]"#));
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(DataTable::from_value("Table", value).unwrap(), t);
    }

    #[test]
    fn test_unknown_column_type_dropped() {
        let value: Value = serde_json::from_str(
            r#"[{"Header": "A", "Type": "Blob", "Values": [1]}, {"Header": "B", "Values": [2]}]"#,
        )
        .unwrap();
        let t = DataTable::from_value("Table", value).unwrap();
        assert_eq!(t.column_names().collect::<Vec<_>>(), vec!["B"]);
    }

    #[test]
    fn test_missing_header_rejected() {
        let value: Value = serde_json::from_str(r#"[{"Type": "Double", "Values": [1]}]"#).unwrap();
        assert!(DataTable::from_value("Table", value).is_err());
    }

    #[test]
    fn test_segment_key_legacy_names() {
        let mut fields = vec![
            ("xColumnName".to_string(), Value::Str("T".into())),
            ("yColumnName".to_string(), Value::Str("X".into())),
            ("Table".to_string(), Value::Array(vec![])),
        ];
        let key = SegmentKey::from_fields("SegmentTables", &mut fields).unwrap();
        assert_eq!(key, SegmentKey::new("T", "X"));
        assert_eq!(fields.len(), 1);
    }
}
