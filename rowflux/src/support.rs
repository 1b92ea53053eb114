//! Base types for data access objects that stream rows
//!
//! - [`StreamDaoSupport`]: a template plus a row source, for DAOs that map rows ad hoc
//! - [`StreamRepositorySupport`]: entity-typed, mapping rows through [`MapRow`]
//!
//! # Example
//!
//! ```rust,ignore
//! use rowflux::prelude::*;
//!
//! struct Order { id: i64, total: f64 }
//!
//! impl MapRow<PgRow> for Order {
//!     fn map_row(row: &PgRow, _index: usize) -> Self {
//!         Order { id: row.get("id"), total: row.get("total") }
//!     }
//! }
//!
//! let orders = StreamRepositorySupport::<PgRowSource, Order>::new(template, source);
//! let mut stream = orders.find_stream(
//!     "SELECT id, total FROM orders WHERE status = $1",
//!     Bindings::new().with("status", "open"),
//! );
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;
use crate::source::{Bindings, RowSource};
use crate::stream::{RowStream, StreamOptions, StreamTemplate};

/// Build `Self` from one raw row
pub trait MapRow<Row>: Sized {
    /// Map the row at `index` (zero-based) of the result
    fn map_row(row: &Row, index: usize) -> Self;
}

/// Streaming helper for DAOs
pub struct StreamDaoSupport<S: RowSource> {
    template: StreamTemplate,
    source: Arc<S>,
}

impl<S: RowSource> StreamDaoSupport<S> {
    /// Create a DAO helper over `source`
    pub fn new(template: StreamTemplate, source: Arc<S>) -> Self {
        Self { template, source }
    }

    /// The template used for every stream
    pub fn template(&self) -> &StreamTemplate {
        &self.template
    }

    /// The shared row source
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Stream `statement`, mapping rows with `mapper`
    pub fn select_stream<F, R>(
        &self,
        statement: impl Into<String>,
        bindings: Bindings,
        mapper: F,
    ) -> RowStream<R>
    where
        F: Fn(&S::Row, usize) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.template
            .stream(self.source.clone(), statement, bindings, mapper)
    }

    /// Stream `statement` with per-call options
    pub fn select_stream_with<F, R>(
        &self,
        statement: impl Into<String>,
        bindings: Bindings,
        mapper: F,
        options: StreamOptions,
    ) -> Result<RowStream<R>>
    where
        F: Fn(&S::Row, usize) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.template
            .stream_with(self.source.clone(), statement, bindings, mapper, options)
    }
}

impl<S: RowSource> Clone for StreamDaoSupport<S> {
    fn clone(&self) -> Self {
        Self {
            template: self.template.clone(),
            source: self.source.clone(),
        }
    }
}

impl<S: RowSource> fmt::Debug for StreamDaoSupport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDaoSupport")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

/// Streaming helper for repositories of entity `T`
pub struct StreamRepositorySupport<S: RowSource, T> {
    dao: StreamDaoSupport<S>,
    _entity: PhantomData<fn() -> T>,
}

impl<S, T> StreamRepositorySupport<S, T>
where
    S: RowSource,
    T: MapRow<S::Row> + Send + 'static,
{
    /// Create a repository helper over `source`
    pub fn new(template: StreamTemplate, source: Arc<S>) -> Self {
        Self {
            dao: StreamDaoSupport::new(template, source),
            _entity: PhantomData,
        }
    }

    /// Underlying DAO helper, for ad hoc projections
    pub fn dao(&self) -> &StreamDaoSupport<S> {
        &self.dao
    }

    /// Stream entities produced by `statement`
    pub fn find_stream(&self, statement: impl Into<String>, bindings: Bindings) -> RowStream<T> {
        self.dao.select_stream(statement, bindings, T::map_row)
    }

    /// Stream entities with per-call options
    pub fn find_stream_with(
        &self,
        statement: impl Into<String>,
        bindings: Bindings,
        options: StreamOptions,
    ) -> Result<RowStream<T>> {
        self.dao
            .select_stream_with(statement, bindings, T::map_row, options)
    }

    /// Stream any projection of the entity's rows
    pub fn find_stream_with_mapper<F, R>(
        &self,
        statement: impl Into<String>,
        bindings: Bindings,
        mapper: F,
    ) -> RowStream<R>
    where
        F: Fn(&S::Row, usize) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.dao.select_stream(statement, bindings, mapper)
    }
}

impl<S: RowSource, T> Clone for StreamRepositorySupport<S, T> {
    fn clone(&self) -> Self {
        Self {
            dao: self.dao.clone(),
            _entity: PhantomData,
        }
    }
}

impl<S: RowSource, T> fmt::Debug for StreamRepositorySupport<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRepositorySupport")
            .field("entity", &std::any::type_name::<T>())
            .field("dao", &self.dao)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::source::MemoryRowSource;
    use futures::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    struct Order {
        id: i64,
        customer: String,
    }

    impl MapRow<(i64, &'static str)> for Order {
        fn map_row(row: &(i64, &'static str), _index: usize) -> Self {
            Order {
                id: row.0,
                customer: row.1.to_string(),
            }
        }
    }

    fn orders() -> Arc<MemoryRowSource<(i64, &'static str)>> {
        Arc::new(MemoryRowSource::new(vec![(1, "ada"), (2, "grace"), (3, "linus")]))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dao_select_stream() {
        let dao = StreamDaoSupport::new(StreamTemplate::new(), orders());
        let names: Vec<String> = dao
            .select_stream("SELECT id, customer FROM orders", Bindings::new(), |row, _| {
                row.1.to_uppercase()
            })
            .map(|row| row.unwrap())
            .collect()
            .await;
        assert_eq!(names, vec!["ADA", "GRACE", "LINUS"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repository_maps_entities() {
        let repo = StreamRepositorySupport::<_, Order>::new(StreamTemplate::new(), orders());
        let found: Vec<Order> = repo
            .find_stream("SELECT id, customer FROM orders", Bindings::new())
            .map(|row| row.unwrap())
            .collect()
            .await;

        assert_eq!(found.len(), 3);
        assert_eq!(
            found[1],
            Order {
                id: 2,
                customer: "grace".to_string()
            }
        );

        let ids: Vec<i64> = repo
            .find_stream_with_mapper("SELECT id FROM orders", Bindings::new(), |row, _| row.0)
            .map(|row| row.unwrap())
            .collect()
            .await;
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_repository_rejects_invalid_options() {
        let repo = StreamRepositorySupport::<_, Order>::new(StreamTemplate::new(), orders());
        let result = repo.find_stream_with(
            "SELECT id, customer FROM orders",
            Bindings::new(),
            StreamOptions::new().queue_size(0),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
