//! Column-oriented result sets.
//!
//! Every read from the store comes back as a [`ColumnarData`]: the column names in
//! table order and one value vector per column. Charts consume exactly this shape, so
//! the sink can filter and forward batches without re-pivoting rows.

use rusqlite::types::ValueRef;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::core::ID_COLUMN;

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    /// SQL NULL.
    Null,
    /// Integer cell.
    Integer(i64),
    /// Floating point cell.
    Real(f64),
    /// Text cell.
    Text(String),
}

impl CellValue {
    /// Numeric view of the cell. `NUMERIC` affinity stores integral readings as
    /// integers, so both numeric variants are accepted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(v) => Some(*v as f64),
            CellValue::Real(v) => Some(*v),
            CellValue::Text(s) => s.trim().parse().ok(),
            CellValue::Null => None,
        }
    }

    /// Integer value, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// True for NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl From<ValueRef<'_>> for CellValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(v) => CellValue::Integer(v),
            ValueRef::Real(v) => CellValue::Real(v),
            ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            // Measurement columns are NUMERIC; blobs never reach a chart.
            ValueRef::Blob(_) => CellValue::Null,
        }
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Real(value)
    }
}

/// Column-oriented table slice: `{column: [values...]}` with stable column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnarData {
    columns: Vec<String>,
    values: Vec<Vec<CellValue>>,
}

impl ColumnarData {
    /// Empty data with the given columns.
    pub fn new(columns: Vec<String>) -> Self {
        let values = vec![Vec::new(); columns.len()];
        Self { columns, values }
    }

    /// Append one row. Missing trailing cells are padded with `Null`.
    pub fn push_row(&mut self, row: Vec<CellValue>) {
        let mut cells = row.into_iter();
        for column in &mut self.values {
            column.push(cells.next().unwrap_or(CellValue::Null));
        }
    }

    /// Column names in table order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values of one column.
    pub fn column(&self, name: &str) -> Option<&[CellValue]> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(&self.values[idx])
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.values.first().map(Vec::len).unwrap_or(0)
    }

    /// True when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row ids, skipping cells that are not integers.
    pub fn ids(&self) -> Vec<i64> {
        self.column(ID_COLUMN)
            .map(|ids| ids.iter().filter_map(CellValue::as_i64).collect())
            .unwrap_or_default()
    }

    /// Highest id, if any.
    pub fn max_id(&self) -> Option<i64> {
        self.ids().into_iter().max()
    }

    /// Keep only the rows whose index satisfies `keep`.
    pub fn select_rows(&self, mut keep: impl FnMut(usize) -> bool) -> Self {
        let selected: Vec<usize> = (0..self.len()).filter(|&i| keep(i)).collect();
        let values = self
            .values
            .iter()
            .map(|column| selected.iter().map(|&i| column[i].clone()).collect())
            .collect();
        Self {
            columns: self.columns.clone(),
            values,
        }
    }

    /// Rows whose id is strictly greater than `watermark`.
    pub fn rows_after(&self, watermark: i64) -> Self {
        let Some(ids) = self.column(ID_COLUMN) else {
            return self.clone();
        };
        let ids: Vec<Option<i64>> = ids.iter().map(CellValue::as_i64).collect();
        self.select_rows(|i| ids[i].is_some_and(|id| id > watermark))
    }

    pub(crate) fn reverse_rows(&mut self) {
        for column in &mut self.values {
            column.reverse();
        }
    }

    /// Iterate `(column, values)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[CellValue])> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(Vec::as_slice))
    }

    /// Consume into `(name, values)` pairs.
    pub fn into_columns(self) -> impl Iterator<Item = (String, Vec<CellValue>)> {
        self.columns.into_iter().zip(self.values)
    }
}

impl Serialize for ColumnarData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, values) in self.iter() {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ColumnarData {
        let mut data = ColumnarData::new(vec!["id".into(), "x".into()]);
        data.push_row(vec![CellValue::Integer(3), CellValue::Real(0.5)]);
        data.push_row(vec![CellValue::Integer(4)]);
        data.push_row(vec![CellValue::Integer(5), CellValue::Integer(2)]);
        data
    }

    #[test]
    fn short_rows_are_padded() {
        let data = sample();
        assert_eq!(data.len(), 3);
        assert!(data.column("x").unwrap()[1].is_null());
    }

    #[test]
    fn rows_after_filters_by_id() {
        let data = sample().rows_after(3);
        assert_eq!(data.ids(), vec![4, 5]);
        assert_eq!(data.column("x").unwrap()[1].as_f64(), Some(2.0));
        assert!(sample().rows_after(5).is_empty());
    }

    #[test]
    fn serializes_as_column_map() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["id"], serde_json::json!([3, 4, 5]));
        assert_eq!(json["x"], serde_json::json!([0.5, null, 2]));
    }
}
