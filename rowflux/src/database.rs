//! PostgreSQL row source and connection pool management

use std::ops::ControlFlow;
use std::time::Duration;

use futures::TryStreamExt;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tokio::runtime::Handle;

use crate::config::DatabaseConfig;
use crate::error::{Result, ScanError, ScanErrorKind};
use crate::source::{BindValue, Bindings, RowSource};

/// Create a PostgreSQL connection pool with retry logic
///
/// Retries up to `max_retries` times with exponential backoff.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    create_pool_with_retries(config, config.max_retries).await
}

async fn create_pool_with_retries(config: &DatabaseConfig, max_retries: u32) -> Result<PgPool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        attempts = attempt + 1,
                        "Database connection established after retry"
                    );
                } else {
                    tracing::info!(
                        max_connections = config.max_connections,
                        min_connections = config.min_connections,
                        "Database connection pool created"
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(
                        attempts = max_retries + 1,
                        error = %e,
                        "Failed to connect to database"
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    attempt,
                    error = %e,
                    retry_in = ?delay,
                    "Database connection attempt failed"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| {
            let kind = ScanError::from(e).kind;
            ScanError::new(
                kind,
                format!(
                    "Failed to connect to database at '{}'",
                    sanitize_connection_url(&config.url)
                ),
            )
            .into()
        })
}

/// Strip the password from a connection URL before logging it
pub fn sanitize_connection_url(url: &str) -> String {
    if let (Some(at_pos), Some(scheme_end)) = (url.rfind('@'), url.find("://")) {
        let credentials_start = scheme_end + 3;
        if at_pos > credentials_start {
            let credentials = &url[credentials_start..at_pos];
            if let Some(colon_pos) = credentials.find(':') {
                return format!(
                    "{}{}:***{}",
                    &url[..credentials_start],
                    &credentials[..colon_pos],
                    &url[at_pos..]
                );
            }
        }
    }
    url.to_string()
}

/// Row source backed by a PostgreSQL pool
///
/// Bindings are applied positionally (`$1`, `$2`, ...) in insertion order.
/// Rows are fetched one at a time from the calling thread, so the scan
/// never holds more than one row beyond what the stream has queued.
///
/// [`BindValue::Null`] carries no type, so it is sent as a `text` NULL.
/// Comparing it against a column of another type needs an explicit cast in
/// the statement, e.g. `WHERE parent_id IS NOT DISTINCT FROM $1::bigint`.
#[derive(Debug, Clone)]
pub struct PgRowSource {
    pool: PgPool,
    handle: Option<Handle>,
}

impl PgRowSource {
    /// Create a source over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool, handle: None }
    }

    /// Connect using `config`, retrying as configured
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        Ok(Self::new(pool).with_handle(Handle::current()))
    }

    /// Drive queries on `handle` instead of the calling thread's runtime
    #[must_use]
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// The underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &BindValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        // Sent as a text NULL; see `PgRowSource`
        BindValue::Null => query.bind(Option::<String>::None),
        BindValue::Bool(v) => query.bind(*v),
        BindValue::Integer(v) => query.bind(*v),
        BindValue::Float(v) => query.bind(*v),
        BindValue::Text(v) => query.bind(v.clone()),
        BindValue::Bytes(v) => query.bind(v.clone()),
        BindValue::Json(v) => query.bind(v.clone()),
        BindValue::TextList(v) => query.bind(v.clone()),
        BindValue::IntegerList(v) => query.bind(v.clone()),
    }
}

impl RowSource for PgRowSource {
    type Row = PgRow;

    fn execute_scan(
        &self,
        statement: &str,
        bindings: &Bindings,
        on_row: &mut dyn FnMut(&PgRow, usize) -> ControlFlow<()>,
    ) -> std::result::Result<(), ScanError> {
        let Some(handle) = self.handle.clone().or_else(|| Handle::try_current().ok()) else {
            return Err(ScanError::new(
                ScanErrorKind::Configuration,
                "no tokio runtime available for database scan",
            ));
        };

        let query = bindings
            .values()
            .fold(sqlx::query(statement), bind_value);
        let mut rows = query.fetch(&self.pool);

        // Each fetch is driven separately so `on_row` runs outside the runtime
        let mut index = 0;
        while let Some(row) = handle.block_on(rows.try_next())? {
            if on_row(&row, index).is_break() {
                tracing::debug!(rows = index + 1, "Database scan stopped early");
                break;
            }
            index += 1;
        }
        Ok(())
    }
}
