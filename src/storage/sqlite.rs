//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Conditional updates
//! become `UPDATE ... WHERE status IN (...) AND worker_id IS ?` and the
//! affected-row count is returned as is. The `locks` table backs
//! [`LockService`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    ExecutionCondition, ExecutionFilter, ExecutionOrder, ExecutionUpdate, PageRequest, Storage,
    StorageError, UnitCondition, UnitFilter, UnitUpdate,
};
use crate::core::{
    AgentId, Clock, ExecutionId, ExecutionInstance, ExecutionStatus, IntegrationId, Iteration,
    IterationId, Priority, RetryClassName, SchedulableUnit, SystemClock, TenantId, UnitId,
    UnitRetry, UnitType,
};
use crate::lock::{Lease, LockService};

const UNIT_COLUMNS: &str = "id, tenant_id, integration_id, unit_type, active, frequency_secs, \
    full_frequency_secs, max_attempts, retry_wait_secs, timeout_secs, priority, last_iteration_id, \
    last_iteration_ts, last_full_iteration_ts, backpressure_threshold, callback_url, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, unit_id, tenant_id, integration_id, unit_type, status, worker_id, \
    attempt_count, max_attempts, retry_class, retry_wait_secs, timeout_secs, priority, partial, \
    iteration_id, iteration_ts, result, error, intermediate_state, status_changed_at, last_heartbeat, \
    created_at, updated_at";

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(other)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(other)?;

        let storage = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(other)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(other)?;

        let storage = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Use `clock` for lease expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn other(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(e.to_string())
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn json_to_string(value: &Option<serde_json::Value>) -> Result<Option<String>, StorageError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn string_to_json(s: Option<String>) -> Result<Option<serde_json::Value>, StorageError> {
    s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn row_to_unit(row: &SqliteRow) -> Result<SchedulableUnit, StorageError> {
    let last_iteration_id: Option<String> = row.try_get("last_iteration_id").map_err(other)?;
    let last_iteration_ts: Option<i64> = row.try_get("last_iteration_ts").map_err(other)?;
    let last_iteration = match (last_iteration_id, last_iteration_ts) {
        (Some(id), Some(ts)) => Some(Iteration::new(
            IterationId::from_uuid(parse_uuid(&id)?),
            from_millis(ts),
        )),
        _ => None,
    };
    let max_attempts: Option<i64> = row.try_get("max_attempts").map_err(other)?;
    let threshold: Option<i64> = row.try_get("backpressure_threshold").map_err(other)?;

    Ok(SchedulableUnit {
        id: UnitId::new(row.try_get::<String, _>("id").map_err(other)?),
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id").map_err(other)?),
        integration_id: row
            .try_get::<Option<String>, _>("integration_id")
            .map_err(other)?
            .map(IntegrationId::new),
        unit_type: UnitType::new(row.try_get::<String, _>("unit_type").map_err(other)?),
        active: row.try_get("active").map_err(other)?,
        frequency_secs: row.try_get("frequency_secs").map_err(other)?,
        full_frequency_secs: row.try_get("full_frequency_secs").map_err(other)?,
        retry: UnitRetry {
            max_attempts: max_attempts.map(|v| v.max(0) as u32),
            wait_secs: row.try_get("retry_wait_secs").map_err(other)?,
            timeout_secs: row.try_get("timeout_secs").map_err(other)?,
        },
        priority: Priority::from_i64(row.try_get("priority").map_err(other)?),
        last_iteration,
        last_full_iteration_ts: row
            .try_get::<Option<i64>, _>("last_full_iteration_ts")
            .map_err(other)?
            .map(from_millis),
        backpressure_threshold: threshold.map(|v| v.max(0) as usize),
        callback_url: row.try_get("callback_url").map_err(other)?,
        created_at: from_millis(row.try_get("created_at").map_err(other)?),
        updated_at: from_millis(row.try_get("updated_at").map_err(other)?),
    })
}

fn row_to_execution(row: &SqliteRow) -> Result<ExecutionInstance, StorageError> {
    let status: String = row.try_get("status").map_err(other)?;
    let id: String = row.try_get("id").map_err(other)?;
    let iteration_id: String = row.try_get("iteration_id").map_err(other)?;
    let attempt_count: i64 = row.try_get("attempt_count").map_err(other)?;
    let max_attempts: i64 = row.try_get("max_attempts").map_err(other)?;

    Ok(ExecutionInstance {
        id: ExecutionId::from_uuid(parse_uuid(&id)?),
        unit_id: UnitId::new(row.try_get::<String, _>("unit_id").map_err(other)?),
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id").map_err(other)?),
        integration_id: row
            .try_get::<Option<String>, _>("integration_id")
            .map_err(other)?
            .map(IntegrationId::new),
        unit_type: UnitType::new(row.try_get::<String, _>("unit_type").map_err(other)?),
        status: ExecutionStatus::from_str(&status)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?,
        worker_id: row
            .try_get::<Option<String>, _>("worker_id")
            .map_err(other)?
            .map(AgentId::new),
        attempt_count: attempt_count.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        retry_class: RetryClassName::new(row.try_get::<String, _>("retry_class").map_err(other)?),
        retry_wait_secs: row.try_get("retry_wait_secs").map_err(other)?,
        timeout_secs: row.try_get("timeout_secs").map_err(other)?,
        priority: Priority::from_i64(row.try_get("priority").map_err(other)?),
        partial: row.try_get("partial").map_err(other)?,
        iteration_id: IterationId::from_uuid(parse_uuid(&iteration_id)?),
        iteration_ts: from_millis(row.try_get("iteration_ts").map_err(other)?),
        result: string_to_json(row.try_get("result").map_err(other)?)?,
        error: string_to_json(row.try_get("error").map_err(other)?)?,
        intermediate_state: string_to_json(row.try_get("intermediate_state").map_err(other)?)?,
        status_changed_at: from_millis(row.try_get("status_changed_at").map_err(other)?),
        last_heartbeat: row
            .try_get::<Option<i64>, _>("last_heartbeat")
            .map_err(other)?
            .map(from_millis),
        created_at: from_millis(row.try_get("created_at").map_err(other)?),
        updated_at: from_millis(row.try_get("updated_at").map_err(other)?),
    })
}

/// Append ` AND column IN (?, ...)`. An empty set matches nothing.
fn push_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: Vec<String>) {
    if values.is_empty() {
        qb.push(" AND 0");
        return;
    }
    qb.push(" AND ").push(column).push(" IN (");
    let mut list = qb.separated(", ");
    for value in values {
        list.push_bind(value);
    }
    list.push_unseparated(")");
}

fn push_unit_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &UnitFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(active) = filter.active {
        qb.push(" AND active = ").push_bind(active);
    }
    if let Some(tenant) = &filter.tenant_id {
        qb.push(" AND tenant_id = ").push_bind(tenant.as_str().to_string());
    }
    if let Some(types) = &filter.unit_types {
        push_in(qb, "unit_type", types.iter().map(|t| t.to_string()).collect());
    }
    if let Some(after) = &filter.id_after {
        qb.push(" AND id > ").push_bind(after.as_str().to_string());
    }
}

fn push_execution_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ExecutionFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(ids) = &filter.ids {
        push_in(qb, "id", ids.iter().map(|id| id.to_string()).collect());
    }
    if let Some(ids) = &filter.unit_ids {
        push_in(qb, "unit_id", ids.iter().map(|id| id.to_string()).collect());
    }
    if let Some(statuses) = &filter.statuses {
        push_in(
            qb,
            "status",
            statuses.iter().map(|s| s.as_str().to_string()).collect(),
        );
    }
    if let Some(tenant) = &filter.tenant_id {
        qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
    }
    if let Some(integration) = &filter.integration_id {
        qb.push(" AND integration_id = ").push_bind(integration.to_string());
    }
    if let Some(classes) = &filter.retry_classes {
        push_in(qb, "retry_class", classes.iter().map(|c| c.to_string()).collect());
    }
    if filter.below_max_attempts {
        qb.push(" AND attempt_count < max_attempts");
    }
    if filter.attempts_exhausted {
        qb.push(" AND attempt_count >= max_attempts");
    }
    if let Some(ts) = filter.status_changed_before {
        qb.push(" AND status_changed_at < ").push_bind(to_millis(ts));
    }
    if let Some(ts) = filter.heartbeat_before {
        qb.push(" AND (last_heartbeat IS NULL OR last_heartbeat < ")
            .push_bind(to_millis(ts))
            .push(")");
    }
    if let Some(partial) = filter.partial {
        qb.push(" AND partial = ").push_bind(partial);
    }
    if let Some(iteration) = &filter.iteration_id {
        qb.push(" AND iteration_id = ").push_bind(iteration.to_string());
    }
    if let Some(ts) = filter.iteration_ts_at_or_after {
        qb.push(" AND iteration_ts >= ").push_bind(to_millis(ts));
    }
    if let Some(ts) = filter.iteration_ts_before {
        qb.push(" AND iteration_ts < ").push_bind(to_millis(ts));
    }
    if let Some(ts) = filter.created_before {
        qb.push(" AND created_at < ").push_bind(to_millis(ts));
    }
    if let Some(after) = &filter.id_after {
        qb.push(" AND id > ").push_bind(after.to_string());
    }
}

fn push_page(qb: &mut QueryBuilder<'_, Sqlite>, page: PageRequest) {
    qb.push(" LIMIT ")
        .push_bind(page.limit as i64)
        .push(" OFFSET ")
        .push_bind(page.offset as i64);
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_unit(&self, unit: SchedulableUnit) -> Result<(), StorageError> {
        let result = sqlx::query(&format!(
            "INSERT INTO units ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            UNIT_COLUMNS
        ))
        .bind(unit.id.as_str())
        .bind(unit.tenant_id.as_str())
        .bind(unit.integration_id.as_ref().map(|i| i.as_str()))
        .bind(unit.unit_type.as_str())
        .bind(unit.active)
        .bind(unit.frequency_secs)
        .bind(unit.full_frequency_secs)
        .bind(unit.retry.max_attempts.map(i64::from))
        .bind(unit.retry.wait_secs)
        .bind(unit.retry.timeout_secs)
        .bind(unit.priority.as_i64())
        .bind(unit.last_iteration.as_ref().map(|it| it.id.to_string()))
        .bind(unit.last_iteration.as_ref().map(|it| to_millis(it.ts)))
        .bind(unit.last_full_iteration_ts.map(to_millis))
        .bind(unit.backpressure_threshold.map(|t| t as i64))
        .bind(&unit.callback_url)
        .bind(to_millis(unit.created_at))
        .bind(to_millis(unit.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("unit: {}", unit.id)))
            }
            Err(e) => Err(other(e)),
        }
    }

    async fn get_unit(&self, id: &UnitId) -> Result<SchedulableUnit, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM units WHERE id = ?", UNIT_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(other)?
            .ok_or_else(|| StorageError::NotFound(format!("unit: {}", id)))?;
        row_to_unit(&row)
    }

    async fn list_units(
        &self,
        filter: &UnitFilter,
        page: PageRequest,
    ) -> Result<Vec<SchedulableUnit>, StorageError> {
        let mut qb = QueryBuilder::new(format!("SELECT {} FROM units", UNIT_COLUMNS));
        push_unit_filter(&mut qb, filter);
        qb.push(" ORDER BY id");
        push_page(&mut qb, page);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(other)?;
        rows.iter().map(row_to_unit).collect()
    }

    async fn update_unit(
        &self,
        id: &UnitId,
        update: &UnitUpdate,
        condition: &UnitCondition,
    ) -> Result<u64, StorageError> {
        let mut qb = QueryBuilder::new("UPDATE units SET updated_at = ");
        qb.push_bind(to_millis(update.now));
        if let Some(active) = update.active {
            qb.push(", active = ").push_bind(active);
        }
        if let Some(iteration) = &update.last_iteration {
            qb.push(", last_iteration_id = ")
                .push_bind(iteration.id.to_string())
                .push(", last_iteration_ts = ")
                .push_bind(to_millis(iteration.ts));
        }
        if let Some(ts) = update.last_full_iteration_ts {
            qb.push(", last_full_iteration_ts = ").push_bind(to_millis(ts));
        }
        qb.push(" WHERE id = ").push_bind(id.as_str().to_string());
        if let Some(expected) = condition.last_iteration_ts {
            qb.push(" AND last_iteration_ts IS ")
                .push_bind(expected.map(to_millis));
        }

        let result = qb.build().execute(&self.pool).await.map_err(other)?;
        Ok(result.rows_affected())
    }

    async fn insert_execution(&self, e: ExecutionInstance) -> Result<(), StorageError> {
        let result = sqlx::query(&format!(
            "INSERT INTO executions ({}) VALUES \
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            EXECUTION_COLUMNS
        ))
        .bind(e.id.to_string())
        .bind(e.unit_id.as_str())
        .bind(e.tenant_id.as_str())
        .bind(e.integration_id.as_ref().map(|i| i.as_str()))
        .bind(e.unit_type.as_str())
        .bind(e.status.as_str())
        .bind(e.worker_id.as_ref().map(|w| w.as_str()))
        .bind(i64::from(e.attempt_count))
        .bind(i64::from(e.max_attempts))
        .bind(e.retry_class.as_str())
        .bind(e.retry_wait_secs)
        .bind(e.timeout_secs)
        .bind(e.priority.as_i64())
        .bind(e.partial)
        .bind(e.iteration_id.to_string())
        .bind(to_millis(e.iteration_ts))
        .bind(json_to_string(&e.result)?)
        .bind(json_to_string(&e.error)?)
        .bind(json_to_string(&e.intermediate_state)?)
        .bind(to_millis(e.status_changed_at))
        .bind(e.last_heartbeat.map(to_millis))
        .bind(to_millis(e.created_at))
        .bind(to_millis(e.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("execution: {}", e.id)))
            }
            Err(err) => Err(other(err)),
        }
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInstance, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM executions WHERE id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?
        .ok_or_else(|| StorageError::NotFound(format!("execution: {}", id)))?;
        row_to_execution(&row)
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: PageRequest,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        let mut qb = QueryBuilder::new(format!("SELECT {} FROM executions", EXECUTION_COLUMNS));
        push_execution_filter(&mut qb, filter);
        qb.push(match filter.order {
            ExecutionOrder::IdAsc => " ORDER BY id",
            ExecutionOrder::IterationAsc => " ORDER BY iteration_ts, id",
            ExecutionOrder::IterationDesc => " ORDER BY iteration_ts DESC, id",
        });
        push_page(&mut qb, page);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(other)?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn count_executions(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> Result<usize, StorageError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM (SELECT 1 FROM executions");
        push_execution_filter(&mut qb, filter);
        qb.push(" LIMIT ").push_bind(limit as i64).push(")");

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(other)?;
        Ok(count.max(0) as usize)
    }

    async fn update_execution(
        &self,
        id: &ExecutionId,
        update: &ExecutionUpdate,
        condition: &ExecutionCondition,
    ) -> Result<u64, StorageError> {
        let now = to_millis(update.now);
        let mut qb = QueryBuilder::new("UPDATE executions SET updated_at = ");
        qb.push_bind(now);
        if let Some(status) = update.status {
            // Assignments all read the pre-update row.
            qb.push(", status_changed_at = CASE WHEN status <> ")
                .push_bind(status.as_str())
                .push(" THEN ")
                .push_bind(now)
                .push(" ELSE status_changed_at END, status = ")
                .push_bind(status.as_str());
        }
        if let Some(worker) = &update.worker_id {
            qb.push(", worker_id = ")
                .push_bind(worker.as_ref().map(|w| w.to_string()));
        }
        if update.increment_attempt {
            qb.push(", attempt_count = attempt_count + 1");
        }
        if let Some(hb) = update.heartbeat {
            qb.push(", last_heartbeat = ").push_bind(to_millis(hb));
        }
        if update.result.is_some() {
            qb.push(", result = ").push_bind(json_to_string(&update.result)?);
        }
        if update.error.is_some() {
            qb.push(", error = ").push_bind(json_to_string(&update.error)?);
        }
        if update.intermediate_state.is_some() {
            qb.push(", intermediate_state = ")
                .push_bind(json_to_string(&update.intermediate_state)?);
        }

        qb.push(" WHERE id = ").push_bind(id.to_string());
        if let Some(statuses) = &condition.status_in {
            push_in(
                &mut qb,
                "status",
                statuses.iter().map(|s| s.as_str().to_string()).collect(),
            );
        }
        if let Some(worker) = &condition.worker_id {
            qb.push(" AND worker_id IS ")
                .push_bind(worker.as_ref().map(|w| w.to_string()));
        }
        if let Some(ts) = condition.updated_at {
            qb.push(" AND updated_at = ").push_bind(to_millis(ts));
        }

        let result = qb.build().execute(&self.pool).await.map_err(other)?;
        Ok(result.rows_affected())
    }

    async fn delete_executions(&self, filter: &ExecutionFilter) -> Result<u64, StorageError> {
        let mut qb = QueryBuilder::new("DELETE FROM executions");
        push_execution_filter(&mut qb, filter);
        let result = qb.build().execute(&self.pool).await.map_err(other)?;
        Ok(result.rows_affected())
    }

    async fn list_iterations(
        &self,
        unit_id: &UnitId,
        page: PageRequest,
    ) -> Result<Vec<Iteration>, StorageError> {
        let mut qb = QueryBuilder::new(
            "SELECT iteration_id, MAX(iteration_ts) AS ts FROM executions WHERE unit_id = ",
        );
        qb.push_bind(unit_id.as_str().to_string())
            .push(" GROUP BY iteration_id ORDER BY ts DESC, iteration_id");
        push_page(&mut qb, page);

        let rows: Vec<(String, i64)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(other)?;
        rows.into_iter()
            .map(|(id, ts)| {
                Ok(Iteration::new(
                    IterationId::from_uuid(parse_uuid(&id)?),
                    from_millis(ts),
                ))
            })
            .collect()
    }
}

#[async_trait]
impl LockService for SqliteStorage {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StorageError> {
        let now = self.clock.now();
        let expires_at = crate::core::clock::after(now, ttl);
        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
            WHERE locks.expires_at <= ? OR locks.holder = excluded.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(to_millis(expires_at))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(other)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(Lease {
            name: name.to_string(),
            holder: holder.to_string(),
            expires_at,
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM locks WHERE name = ? AND holder = ?")
            .bind(&lease.name)
            .bind(&lease.holder)
            .execute(&self.pool)
            .await
            .map_err(other)?;
        Ok(result.rows_affected() > 0)
    }
}
