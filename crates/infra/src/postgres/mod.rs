//! PostgreSQL adapters for every store.
//!
//! ## Error Mapping
//!
//! SQLx errors become the store's `Storage(String)` variant, except where a
//! constraint carries meaning:
//!
//! | PostgreSQL code | Where | Meaning |
//! |-----------------|-------|---------|
//! | `23505` | `lcbackup_jobs_one_running_idx` on claim | course already running, claim yields nothing |
//! | `23505` | `lcbackup_catalog` insert | duplicate entry |
//!
//! ## Runtime
//!
//! The store traits are synchronous. Each adapter holds a [`PgContext`] with
//! a runtime handle and blocks on it, so calls must come from threads that
//! are not runtime workers (runner threads, `spawn_blocking`).
//!
//! ## Leases
//!
//! A claimed job carries `lease_expires_at`. Each claim first fails running
//! jobs past their lease, in the claim's transaction.

mod catalog;
mod courses;
mod jobs;
mod links;
mod locks;
mod uploads;


pub use catalog::PostgresCatalogStore;
pub use courses::PostgresCourseDirectory;
pub use jobs::PostgresJobQueue;
pub use links::PostgresProcessLinkStore;
pub use locks::PostgresExclusivityLock;
pub use uploads::PostgresUploadRecordStore;

use std::future::Future;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::DatabaseConfig;

const SCHEMA: &str = include_str!("../../migrations/0001_lcbackup.sql");

/// Pool plus the runtime the pool's futures are driven on.
#[derive(Debug, Clone)]
pub struct PgContext {
    pool: PgPool,
    handle: Handle,
}

impl PgContext {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| sqlx::Error::Configuration("database.url is not set".into()))?;
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
}

/// Create the `lcbackup_*` tables if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("lcbackup schema applied");
    Ok(())
}

fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("database error in {operation} ({code}): {}", db_err.message()),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Escape `LIKE` metacharacters so user input matches literally.
fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
