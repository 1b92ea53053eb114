//! Blocking row sources and parameter bindings
//!
//! A [`RowSource`] is the database access surface the stream producer drives:
//! it executes a statement and invokes a callback once per row, in result
//! order, on the calling thread. Implementations are expected to block.
//!
//! # Example
//!
//! ```rust
//! use std::ops::ControlFlow;
//! use rowflux::source::{Bindings, MemoryRowSource, RowSource};
//!
//! let source = MemoryRowSource::new(vec![1, 2, 3]);
//! let mut seen = Vec::new();
//! source
//!     .execute_scan("SELECT n FROM numbers", &Bindings::new(), &mut |row, index| {
//!         seen.push((index, *row));
//!         ControlFlow::Continue(())
//!     })
//!     .unwrap();
//! assert_eq!(seen, vec![(0, 1), (1, 2), (2, 3)]);
//! ```

use std::ops::ControlFlow;

use crate::error::ScanError;

/// A value bound to a statement parameter
///
/// # Example
///
/// ```rust
/// use rowflux::source::BindValue;
///
/// let text: BindValue = "active".into();
/// let number: BindValue = 42_i64.into();
/// let missing: BindValue = Option::<i64>::None.into();
/// assert_eq!(missing, BindValue::Null);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    /// SQL NULL
    ///
    /// Untyped; backends that need a parameter type pick one (Postgres uses
    /// `text`), so cast it in the statement when comparing to other types.
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit integer value
    Integer(i64),
    /// 64-bit floating point value
    Float(f64),
    /// Text value
    Text(String),
    /// Binary value
    Bytes(Vec<u8>),
    /// JSON document
    Json(serde_json::Value),
    /// List of text values (for `= ANY(...)` style predicates)
    TextList(Vec<String>),
    /// List of integer values
    IntegerList(Vec<i64>),
}

impl From<&str> for BindValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for BindValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for BindValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for BindValue {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<f64> for BindValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for BindValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for BindValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<serde_json::Value> for BindValue {
    fn from(json: serde_json::Value) -> Self {
        Self::Json(json)
    }
}

impl From<Vec<String>> for BindValue {
    fn from(list: Vec<String>) -> Self {
        Self::TextList(list)
    }
}

impl From<Vec<i64>> for BindValue {
    fn from(list: Vec<i64>) -> Self {
        Self::IntegerList(list)
    }
}

impl<T: Into<BindValue>> From<Option<T>> for BindValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Named statement parameters, kept in insertion order
///
/// Positional drivers bind the values in the order they were added; named
/// drivers look them up with [`Bindings::get`]. Binding a name twice
/// replaces the earlier value without changing its position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    params: Vec<(String, BindValue)>,
}

impl Bindings {
    /// Create an empty set of bindings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, builder style
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<BindValue>) -> Self {
        self.bind(name, value);
        self
    }

    /// Add or replace a parameter
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<BindValue>) {
        let name = name.into();
        let value = value.into();
        match self.params.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
    }

    /// Look up a parameter by name
    pub fn get(&self, name: &str) -> Option<&BindValue> {
        self.params
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    /// Iterate over `(name, value)` pairs in binding order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindValue)> {
        self.params.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Iterate over values in binding order
    pub fn values(&self) -> impl Iterator<Item = &BindValue> {
        self.params.iter().map(|(_, value)| value)
    }

    /// Number of bound parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no parameters are bound
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Blocking, callback-driven database scan
///
/// `execute_scan` must call `on_row` synchronously, once per row, in result
/// order, and return once the rows are exhausted or the scan fails. When
/// `on_row` returns [`ControlFlow::Break`] the source must stop reading and
/// return; returning `Ok(())` or an error at that point are both accepted.
pub trait RowSource: Send + Sync + 'static {
    /// Raw row type handed to the row mapper
    type Row;

    /// Run `statement` with `bindings`, feeding every row to `on_row`
    fn execute_scan(
        &self,
        statement: &str,
        bindings: &Bindings,
        on_row: &mut dyn FnMut(&Self::Row, usize) -> ControlFlow<()>,
    ) -> Result<(), ScanError>;
}

/// Row source backed by an in-memory vector
///
/// Every statement yields the same rows. Useful as a fixture and for
/// streaming data that is already materialized.
#[derive(Debug, Clone, Default)]
pub struct MemoryRowSource<T> {
    rows: Vec<T>,
}

impl<T> MemoryRowSource<T> {
    /// Create a source over `rows`
    pub fn new(rows: Vec<T>) -> Self {
        Self { rows }
    }

    /// The rows this source yields
    pub fn rows(&self) -> &[T] {
        &self.rows
    }
}

impl<T> RowSource for MemoryRowSource<T>
where
    T: Send + Sync + 'static,
{
    type Row = T;

    fn execute_scan(
        &self,
        _statement: &str,
        _bindings: &Bindings,
        on_row: &mut dyn FnMut(&T, usize) -> ControlFlow<()>,
    ) -> Result<(), ScanError> {
        for (index, row) in self.rows.iter().enumerate() {
            if on_row(row, index).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_value_conversions() {
        assert_eq!(BindValue::from("a"), BindValue::Text("a".to_string()));
        assert_eq!(BindValue::from(7_i32), BindValue::Integer(7));
        assert_eq!(BindValue::from(1.5_f64), BindValue::Float(1.5));
        assert_eq!(BindValue::from(true), BindValue::Bool(true));
        assert_eq!(BindValue::from(Some("x")), BindValue::Text("x".to_string()));
        assert_eq!(BindValue::from(Option::<&str>::None), BindValue::Null);
        assert_eq!(
            BindValue::from(vec![1_i64, 2]),
            BindValue::IntegerList(vec![1, 2])
        );
        assert_eq!(
            BindValue::from(serde_json::json!({"a": 1})),
            BindValue::Json(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn test_bindings_keep_order_and_replace_in_place() {
        let bindings = Bindings::new()
            .with("status", "active")
            .with("limit", 10_i64)
            .with("status", "archived");

        assert_eq!(bindings.len(), 2);
        let names: Vec<&str> = bindings.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["status", "limit"]);
        assert_eq!(
            bindings.get("status"),
            Some(&BindValue::Text("archived".to_string()))
        );
        assert!(bindings.get("missing").is_none());
    }

    #[test]
    fn test_empty_bindings() {
        let bindings = Bindings::new();
        assert!(bindings.is_empty());
        assert_eq!(bindings.values().count(), 0);
    }

    #[test]
    fn test_memory_source_stops_on_break() {
        let source = MemoryRowSource::new(vec!["a", "b", "c"]);
        let mut seen = Vec::new();
        source
            .execute_scan("SELECT 1", &Bindings::new(), &mut |row, _| {
                seen.push(*row);
                if seen.len() == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }
}
