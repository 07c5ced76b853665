use crate::{Error, Value};
use std::sync::Arc;

pub type ColumnNames = Arc<[String]>;
pub type Row = Box<[Value]>;

/// Immutable snapshot of one command's outcome.
///
/// A single submission can produce several of these: multi-statement text
/// yields one per statement and single-row mode yields one per row. Only the
/// final snapshot of a submission carries `last_result_set() == true`.
#[derive(Debug, Default, Clone)]
pub struct QueryResult {
    error: Option<String>,
    columns: ColumnNames,
    rows: Vec<Row>,
    rows_affected: u64,
    last_result_set: bool,
}

impl QueryResult {
    /// Builds a row-carrying result. Used by driver implementations.
    pub fn with_rows(columns: ColumnNames, rows: Vec<Row>, rows_affected: u64) -> Self {
        Self {
            error: None,
            columns,
            rows,
            rows_affected,
            last_result_set: true,
        }
    }

    /// Builds a rowless result for write commands.
    pub fn with_affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_result_set: true,
            ..Default::default()
        }
    }

    pub fn with_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            last_result_set: true,
            ..Default::default()
        }
    }

    pub fn from_error(error: Error) -> Self {
        Self::with_error(error.to_string())
    }

    /// Marks this result as an intermediate one of a larger submission.
    pub fn set_last_result_set(&mut self, last: bool) {
        self.last_result_set = last;
    }

    /// Splits a row-carrying result into one result per row, the shape
    /// single-row mode delivers. Used by driver implementations.
    pub fn into_single_rows(self) -> Vec<QueryResult> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| QueryResult::with_rows(columns.clone(), vec![row], 0))
            .collect()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_string(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }

    pub fn last_result_set(&self) -> bool {
        self.last_result_set
    }

    /// Number of rows in this result set.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of columns.
    pub fn fields(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn field_name(&self, column: usize) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }

    pub fn index_of_field(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn value(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    pub fn row(&self, row: usize) -> Option<RowView<'_>> {
        (row < self.rows.len()).then_some(RowView { result: self, row })
    }

    pub fn first(&self) -> Option<RowView<'_>> {
        self.row(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = RowView<'_>> {
        (0..self.rows.len()).map(|row| RowView { result: self, row })
    }
}

/// Borrowed view over one row with column addressing by index or name.
#[derive(Clone, Copy)]
pub struct RowView<'a> {
    result: &'a QueryResult,
    row: usize,
}

impl<'a> RowView<'a> {
    pub fn get(&self, column: usize) -> &'a Value {
        static NULL: Value = Value::Null;
        self.result.value(self.row, column).unwrap_or(&NULL)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&'a Value> {
        self.result
            .index_of_field(name)
            .and_then(|c| self.result.value(self.row, c))
    }

    pub fn len(&self) -> usize {
        self.result.fields()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueryResult {
        let columns: ColumnNames = vec!["id".to_string(), "name".to_string()].into();
        let rows = vec![
            vec![Value::Int64(1), Value::Text("a".into())].into_boxed_slice(),
            vec![Value::Int64(2), Value::Text("b".into())].into_boxed_slice(),
        ];
        QueryResult::with_rows(columns, rows, 0)
    }

    #[test]
    fn addressing() {
        let r = sample();
        assert_eq!(r.len(), 2);
        assert_eq!(r.fields(), 2);
        assert_eq!(r.index_of_field("name"), Some(1));
        assert_eq!(r.index_of_field("missing"), None);
        assert_eq!(r.first().unwrap().get(0).to_i64(), Some(1));
        assert_eq!(
            r.row(1).unwrap().get_by_name("name").unwrap().as_str(),
            Some("b")
        );
    }

    #[test]
    fn error_result() {
        let r = QueryResult::with_error("boom");
        assert!(r.has_error());
        assert_eq!(r.error_string(), "boom");
        assert!(r.last_result_set());
        assert!(r.is_empty());
    }

    #[test]
    fn iterates_in_order() {
        let ids: Vec<i64> = sample().iter().filter_map(|r| r.get(0).to_i64()).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
