//! Sync executor
//!
//! Runs one [`SyncRequest`] end to end on a fresh connection:
//! validate and generate SQL, connect, begin, create the staging table,
//! bulk-load it, run the merge, commit. Any failure after `BEGIN` rolls the
//! transaction back before the error is returned.
//!
//! - TableSync: backend-agnostic entry point (single and batch apply, health check)
//! - SyncEngine: the one orchestration, parameterized by factory and dialect
//! - SyncState: where an operation is, reported in logs and errors

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction,
};
use crate::dialect::{dialect_for_type, SqlDialect};
use crate::error::{Error, ErrorCategory, Result};
use crate::request::{SyncRequest, TableRef};
use crate::staging::next_token;

/// Lifecycle of a single sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Nothing opened yet
    Idle,
    /// Connection established
    ConnectionOpen,
    /// Transaction started
    TransactionOpen,
    /// Staging table created
    StagingCreated,
    /// Rows bulk-loaded into staging
    Loaded,
    /// Merge statement executed
    MergeExecuted,
    /// Transaction committed
    Committed,
    /// Transaction rolled back
    RolledBack,
}

impl SyncState {
    /// Whether the operation has finished
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ConnectionOpen => "connection_open",
            Self::TransactionOpen => "transaction_open",
            Self::StagingCreated => "staging_created",
            Self::Loaded => "loaded",
            Self::MergeExecuted => "merge_executed",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// SQL generated for one request, before any I/O
#[derive(Debug, Clone)]
pub struct SyncPlan {
    /// Target table
    pub target: TableRef,
    /// Staging table for this call
    pub staging: TableRef,
    /// Creates the staging table
    pub staging_ddl: String,
    /// Merges staged rows into the target
    pub merge_sql: String,
    /// Drops the staging table before commit (SQL Server)
    pub cleanup_sql: Option<String>,
}

/// Sync statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Requests committed
    pub requests_applied: u64,
    /// Requests that failed (validation included)
    pub requests_failed: u64,
    /// Rows bulk-loaded into staging tables by committed requests
    pub rows_staged: u64,
    /// Target rows affected by committed requests
    pub rows_affected: u64,
    /// Total time spent in committed requests (milliseconds)
    pub total_apply_time_ms: u64,
    /// Staged rows per second over committed requests
    pub rows_per_second: f64,
}

/// Atomic sync statistics
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicSyncStats {
    pub requests_applied: AtomicU64,
    pub requests_failed: AtomicU64,
    pub rows_staged: AtomicU64,
    pub rows_affected: AtomicU64,
    pub total_apply_time_ms: AtomicU64,
}

impl AtomicSyncStats {
    /// Record a committed request
    pub fn record_success(&self, staged: u64, affected: u64, duration: Duration) {
        self.requests_applied.fetch_add(1, Ordering::Relaxed);
        self.rows_staged.fetch_add(staged, Ordering::Relaxed);
        self.rows_affected.fetch_add(affected, Ordering::Relaxed);
        self.total_apply_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> SyncStats {
        let rows = self.rows_staged.load(Ordering::Relaxed);
        let time_ms = self.total_apply_time_ms.load(Ordering::Relaxed);
        let rps = if time_ms > 0 {
            (rows as f64 * 1000.0) / time_ms as f64
        } else {
            0.0
        };

        SyncStats {
            requests_applied: self.requests_applied.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            rows_staged: rows,
            rows_affected: self.rows_affected.load(Ordering::Relaxed),
            total_apply_time_ms: time_ms,
            rows_per_second: rps,
        }
    }
}

/// Backend-agnostic bulk table synchronization
#[async_trait]
pub trait TableSync: Send + Sync {
    /// Backend this instance talks to
    fn database_type(&self) -> DatabaseType;

    /// Apply one request in its own transaction, returning affected rows
    async fn apply(&self, request: &SyncRequest) -> Result<u64>;

    /// Apply requests one after another, each in its own transaction.
    ///
    /// Results are in input order. A failure does not stop later requests
    /// and does not undo earlier committed ones.
    async fn apply_all(&self, requests: &[SyncRequest]) -> Vec<Result<u64>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.apply(request).await);
        }
        results
    }

    /// Open a connection, check that the server answers, close it again
    async fn health_check(&self) -> Result<()>;

    /// Get sync statistics
    fn stats(&self) -> SyncStats;
}

/// Staging-and-merge sync engine
pub struct SyncEngine {
    factory: Arc<dyn ConnectionFactory>,
    dialect: Box<dyn SqlDialect>,
    config: ConnectionConfig,
    stats: AtomicSyncStats,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("database_type", &self.factory.database_type())
            .field("dialect", &self.dialect.name())
            .field("config", &self.config)
            .finish()
    }
}

impl SyncEngine {
    /// Create an engine from its parts
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        dialect: Box<dyn SqlDialect>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            factory,
            dialect,
            config,
            stats: AtomicSyncStats::default(),
        }
    }

    /// Create a PostgreSQL engine
    #[cfg(feature = "postgres")]
    pub fn postgres(config: ConnectionConfig) -> Self {
        Self::new(
            Arc::new(crate::postgres::PgConnectionFactory),
            dialect_for_type(DatabaseType::PostgreSQL),
            config,
        )
    }

    /// Create a SQL Server engine
    #[cfg(feature = "sqlserver")]
    pub fn sqlserver(config: ConnectionConfig) -> Self {
        Self::new(
            Arc::new(crate::sqlserver::SqlServerConnectionFactory),
            dialect_for_type(DatabaseType::SqlServer),
            config,
        )
    }

    /// Connection settings
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// SQL dialect in use
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Validate `request` and generate every statement it needs.
    ///
    /// Pure; fails with a validation error before any connection is opened.
    pub fn plan(&self, request: &SyncRequest) -> Result<SyncPlan> {
        request.validate()?;

        let target = request.table.clone();
        let staging = self.dialect.staging_table(&target, &next_token());
        let staging_ddl = self
            .dialect
            .staging_ddl_sql(&target, &staging, &request.columns);
        let merge_sql =
            self.dialect
                .merge_sql(request.operation, &target, &staging, &request.columns)?;
        let cleanup_sql = self.dialect.staging_cleanup_sql(&staging);

        Ok(SyncPlan {
            target,
            staging,
            staging_ddl,
            merge_sql,
            cleanup_sql,
        })
    }

    fn transition(&self, state: &mut SyncState, next: SyncState, plan: &SyncPlan) {
        tracing::debug!(
            table = %plan.target,
            staging = %plan.staging,
            from = %state,
            to = %next,
            "sync state transition"
        );
        *state = next;
    }

    async fn run(
        &self,
        request: &SyncRequest,
        plan: &SyncPlan,
        state: &mut SyncState,
    ) -> Result<(u64, u64)> {
        let conn = self.factory.connect(&self.config).await?;
        self.transition(state, SyncState::ConnectionOpen, plan);

        let result = self
            .run_in_connection(conn.as_ref(), request, plan, state)
            .await;

        if let Err(e) = conn.close().await {
            tracing::debug!(table = %plan.target, error = %e, "closing connection failed");
        }
        result
    }

    async fn run_in_connection(
        &self,
        conn: &dyn Connection,
        request: &SyncRequest,
        plan: &SyncPlan,
        state: &mut SyncState,
    ) -> Result<(u64, u64)> {
        let tx = match self.config.isolation_level {
            Some(level) => conn.begin_with_isolation(level).await,
            None => conn.begin().await,
        }
        .map_err(|e| into_transaction_error("begin failed", e))?;
        self.transition(state, SyncState::TransactionOpen, plan);

        match self.stage_and_merge(tx.as_ref(), request, plan, state).await {
            Ok(counts) => {
                if let Err(e) = tx.commit().await {
                    tracing::warn!(
                        table = %plan.target,
                        error = %e,
                        "commit failed, transaction aborted by server"
                    );
                    return Err(into_transaction_error("commit failed", e));
                }
                self.transition(state, SyncState::Committed, plan);
                Ok(counts)
            }
            Err(e) => {
                tracing::warn!(
                    table = %plan.target,
                    state = %state,
                    error = %e,
                    "sync failed, rolling back"
                );
                match tx.rollback().await {
                    Ok(()) => {
                        self.transition(state, SyncState::RolledBack, plan);
                        Err(e)
                    }
                    Err(rollback) => {
                        tracing::error!(
                            table = %plan.target,
                            original = %e,
                            error = %rollback,
                            "rollback failed"
                        );
                        Err(Error::rollback_failed(&e, rollback))
                    }
                }
            }
        }
    }

    async fn stage_and_merge(
        &self,
        tx: &dyn Transaction,
        request: &SyncRequest,
        plan: &SyncPlan,
        state: &mut SyncState,
    ) -> Result<(u64, u64)> {
        let staging_name = plan.staging.qualified_name();

        tx.execute_batch(&plan.staging_ddl)
            .await
            .map_err(|e| Error::staging(&staging_name, e))?;
        self.transition(state, SyncState::StagingCreated, plan);

        let staged = tx
            .load(&plan.staging, &request.columns, &request.rows)
            .await
            .map_err(|e| Error::staging(&staging_name, e))?;
        if staged != request.rows.len() as u64 {
            return Err(Error::staging(
                &staging_name,
                Error::query(format!(
                    "bulk load staged {} of {} rows",
                    staged,
                    request.rows.len()
                )),
            ));
        }
        self.transition(state, SyncState::Loaded, plan);

        let affected = tx
            .execute(&plan.merge_sql)
            .await
            .map_err(|e| Error::merge(&plan.merge_sql, e))?;
        self.transition(state, SyncState::MergeExecuted, plan);

        if let Some(cleanup) = &plan.cleanup_sql {
            tx.execute(cleanup)
                .await
                .map_err(|e| Error::staging(&staging_name, e))?;
        }

        Ok((staged, affected))
    }
}

fn into_transaction_error(context: &str, e: Error) -> Error {
    if e.category() == ErrorCategory::Transaction {
        return e;
    }
    let message = format!("{}: {}", context, e);
    Error::transaction_with_source(message, e)
}

#[async_trait]
impl TableSync for SyncEngine {
    fn database_type(&self) -> DatabaseType {
        self.factory.database_type()
    }

    async fn apply(&self, request: &SyncRequest) -> Result<u64> {
        let start = Instant::now();

        let plan = match self.plan(request) {
            Ok(plan) => plan,
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };

        let mut state = SyncState::Idle;
        let outcome = match self.config.operation_timeout_ms {
            Some(ms) => {
                let limit = Duration::from_millis(ms);
                tokio::time::timeout(limit, self.run(request, &plan, &mut state))
                    .await
                    .ok()
            }
            None => Some(self.run(request, &plan, &mut state).await),
        };

        // dropping the timed-out future closed its connection; the server
        // aborts the transaction and drops the staging table with it
        let result = outcome.unwrap_or_else(|| {
            tracing::warn!(
                table = %plan.target,
                state = %state,
                "sync timed out, connection dropped"
            );
            Err(Error::timeout(format!(
                "{} {} did not finish within {}ms (state: {})",
                request.operation,
                plan.target,
                self.config.operation_timeout_ms.unwrap_or_default(),
                state
            )))
        });

        match result {
            Ok((staged, affected)) => {
                let elapsed = start.elapsed();
                self.stats.record_success(staged, affected, elapsed);
                tracing::info!(
                    table = %plan.target,
                    operation = %request.operation,
                    rows = staged,
                    affected,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "sync applied"
                );
                Ok(affected)
            }
            Err(e) => {
                self.stats.record_failure();
                Err(e)
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        let conn = self.factory.connect(&self.config).await?;
        let valid = conn.is_valid().await;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "closing connection failed");
        }

        if valid {
            Ok(())
        } else {
            tracing::warn!(database = %self.factory.database_type(), "health check failed");
            Err(Error::connection(format!(
                "{} connection did not answer",
                self.factory.database_type()
            )))
        }
    }

    fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }
}

/// Create a sync engine for a backend
pub fn sync_for(
    database_type: DatabaseType,
    config: ConnectionConfig,
) -> Result<Box<dyn TableSync>> {
    match database_type {
        #[cfg(feature = "postgres")]
        DatabaseType::PostgreSQL => Ok(Box::new(SyncEngine::postgres(config))),
        #[cfg(feature = "sqlserver")]
        DatabaseType::SqlServer => Ok(Box::new(SyncEngine::sqlserver(config))),
        #[allow(unreachable_patterns)]
        other => Err(Error::unsupported(format!(
            "{} support is not compiled in",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_terminal() {
        assert!(SyncState::Committed.is_terminal());
        assert!(SyncState::RolledBack.is_terminal());
        assert!(!SyncState::Loaded.is_terminal());
        assert_eq!(SyncState::MergeExecuted.to_string(), "merge_executed");
    }

    #[test]
    fn test_atomic_sync_stats() {
        let stats = AtomicSyncStats::default();

        stats.record_success(100, 98, Duration::from_millis(200));
        stats.record_success(50, 50, Duration::from_millis(100));
        stats.record_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_applied, 2);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.rows_staged, 150);
        assert_eq!(snapshot.rows_affected, 148);
        assert_eq!(snapshot.total_apply_time_ms, 300);
        assert!(snapshot.rows_per_second > 0.0);
    }
}
