//! Tabular query results.

use serde::Serialize;

/// The rows returned by a query. Values are kept as text, `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RowSet {
    /// An empty result with the given columns.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// A one row, one column result.
    pub fn scalar(column: impl Into<String>, value: Option<String>) -> Self {
        let mut set = Self::new([column.into()]);
        set.rows.push(vec![value]);
        set
    }

    /// Append a row. Missing trailing values are NULL.
    pub fn push<I>(&mut self, values: I)
    where
        I: IntoIterator<Item = Option<String>>,
    {
        let mut row: Vec<Option<String>> = values.into_iter().collect();
        row.resize(self.columns.len(), None);
        self.rows.push(row);
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate rows.
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row {
            columns: &self.columns,
            values,
        })
    }

    /// The first row, if any.
    pub fn first(&self) -> Option<Row<'_>> {
        self.rows().next()
    }

    /// First column of the first row.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first().and_then(|r| r.first()).and_then(|v| v.as_deref())
    }
}

/// A borrowed row of a [`RowSet`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [Option<String>],
}

impl<'a> Row<'a> {
    /// Value of a column by case-insensitive name. `None` for NULL or unknown columns.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
            .and_then(|v| v.as_deref())
    }

    /// Value of a column parsed as an unsigned integer.
    pub fn get_u64(&self, column: &str) -> Option<u64> {
        self.get(column).and_then(|v| v.trim().parse().ok())
    }
}
