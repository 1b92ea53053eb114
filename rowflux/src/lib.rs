//! # rowflux
//!
//! Stream the rows of blocking database scans as async [`Stream`]s.
//!
//! A blocking [`RowSource`](source::RowSource) runs on a scheduler thread and
//! pushes mapped rows into a bounded queue; the consumer pulls them through a
//! lazy [`RowStream`](stream::RowStream). The queue bound is the backpressure:
//! a consumer that stops pulling for longer than the buffer timeout gets the
//! stream closed instead of pinning a connection forever.
//!
//! ## Features
//!
//! - **Cold start**: nothing touches the database until the stream is polled
//! - **Bounded memory**: at most `queue_size` rows buffered per invocation
//! - **Prompt cancellation**: dropping the stream stops the scan at the next row
//! - **Failure routing**: transient source failures end the stream quietly, hard
//!   failures are reported to the scheduler
//! - **Managed execution**: [`ScanWorker`](scheduler::ScanWorker) tracks and limits scans
//! - **PostgreSQL**: `PgRowSource` over an sqlx pool (feature `database`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use rowflux::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let template = StreamTemplate::from_config(&config.stream)?;
//!     let source = Arc::new(MemoryRowSource::new(vec![(1_i64, "ada"), (2, "grace")]));
//!
//!     let mut names = template.stream(
//!         source,
//!         "SELECT id, name FROM users",
//!         Bindings::new(),
//!         |row, _index| row.1.to_string(),
//!     );
//!
//!     while let Some(name) = names.next().await {
//!         println!("{}", name?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! [`Stream`]: futures::Stream

pub mod config;
pub mod error;
pub mod observability;
pub mod scheduler;
pub mod source;
pub mod stream;
pub mod support;

#[cfg(feature = "database")]
pub mod database;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, DatabaseConfig, ServiceConfig, StreamConfig};
    pub use crate::error::{ClosureReason, Error, Result, ScanError, ScanErrorKind};
    pub use crate::observability::{init_tracing, shutdown_tracing};
    pub use crate::scheduler::{
        ElasticScheduler, ScanTask, ScanWorker, Scheduler, TaskFailure, TaskReport, TaskStatus,
    };
    pub use crate::source::{BindValue, Bindings, MemoryRowSource, RowSource};
    pub use crate::stream::{
        CancelHandle, Demand, RowStream, StreamOptions, StreamTemplate, Subscriber,
    };
    pub use crate::support::{MapRow, StreamDaoSupport, StreamRepositorySupport};

    #[cfg(feature = "database")]
    pub use crate::database::{create_pool, PgRowSource};

    #[cfg(feature = "database")]
    pub use sqlx::postgres::PgRow;

    #[cfg(feature = "database")]
    pub use sqlx::Row;
}
