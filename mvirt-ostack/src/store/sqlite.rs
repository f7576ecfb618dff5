use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::debug;

use crate::lifecycle::{self, Transition};
use crate::model::{
    Demand, DriftReport, QuotaMetric, QuotaUsage, Reservation, ReservationStatus, ResourceKind,
    ResourceRecord, ResourceState, Scope, ScopeLevel,
};

use super::error::{Result, StoreError};
use super::event::Event;
use super::traits::{
    DataStore, LedgerStore, RecordFilter, RecordPatch, RecordStore, ReserveRequest, ScopeStore,
};

/// Scope chains deeper than this are treated as a cycle.
const MAX_SCOPE_DEPTH: usize = 16;

const RECORD_COLUMNS: &str = "id, kind, scope_id, backend_id, state, spec, pending_spec, \
                              attributes, error_message, reservation_id, created_at, modified_at";

/// SQLite-backed store for scopes, resource records and quota counters.
///
/// The pool holds a single connection so writers are serialized and every
/// read-check-write inside a transaction is atomic.
pub struct SqliteStore {
    pool: SqlitePool,
    events: broadcast::Sender<Event>,
}

impl SqliteStore {
    /// Open (or create) the database file `ostack.db` in `data_dir`.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("ostack.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await?;

        Self::with_pool(pool).await
    }

    /// Ephemeral database for development mode.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        let store = Self { pool, events };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scopes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                level TEXT NOT NULL,
                parent_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                backend_id TEXT,
                state TEXT NOT NULL,
                spec TEXT NOT NULL,
                pending_spec TEXT,
                attributes TEXT NOT NULL,
                error_message TEXT,
                reservation_id TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                UNIQUE (kind, backend_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_resources_scope ON resources (scope_id, kind)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quotas (
                scope_id TEXT NOT NULL,
                metric TEXT NOT NULL,
                usage INTEGER NOT NULL DEFAULT 0,
                quota_limit INTEGER,
                PRIMARY KEY (scope_id, metric)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                id TEXT PRIMARY KEY,
                scope_id TEXT NOT NULL,
                resource_id TEXT,
                amounts TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drift_reports (
                id TEXT PRIMARY KEY,
                scope_id TEXT NOT NULL,
                metric TEXT NOT NULL,
                recorded INTEGER NOT NULL,
                computed INTEGER NOT NULL,
                passes INTEGER NOT NULL,
                corrected INTEGER NOT NULL DEFAULT 0,
                resolved INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

// === Row helpers ===

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Internal(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse::<T>().map_err(StoreError::Internal)
}

fn row_to_record(row: &SqliteRow) -> Result<ResourceRecord> {
    let kind: String = row.get("kind");
    let state: String = row.get("state");
    let spec: String = row.get("spec");
    let pending_spec: Option<String> = row.get("pending_spec");
    let attributes: String = row.get("attributes");
    let created_at: String = row.get("created_at");
    let modified_at: String = row.get("modified_at");

    Ok(ResourceRecord {
        id: row.get("id"),
        kind: parse_enum(&kind)?,
        scope_id: row.get("scope_id"),
        backend_id: row.get("backend_id"),
        state: parse_enum(&state)?,
        spec: serde_json::from_str(&spec)?,
        pending_spec: pending_spec
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        attributes: serde_json::from_str(&attributes)?,
        error_message: row.get("error_message"),
        reservation_id: row.get("reservation_id"),
        created_at: parse_time(&created_at)?,
        modified_at: parse_time(&modified_at)?,
    })
}

fn row_to_scope(row: &SqliteRow) -> Result<Scope> {
    let level: String = row.get("level");
    Ok(Scope {
        id: row.get("id"),
        name: row.get("name"),
        level: parse_enum::<ScopeLevel>(&level)?,
        parent_id: row.get("parent_id"),
    })
}

fn row_to_usage(row: &SqliteRow) -> Result<QuotaUsage> {
    let metric: String = row.get("metric");
    Ok(QuotaUsage {
        scope_id: row.get("scope_id"),
        metric: parse_enum(&metric)?,
        usage: row.get("usage"),
        limit: row.get("quota_limit"),
    })
}

fn row_to_reservation(row: &SqliteRow) -> Result<Reservation> {
    let amounts: String = row.get("amounts");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    Ok(Reservation {
        id: row.get("id"),
        scope_id: row.get("scope_id"),
        resource_id: row.get("resource_id"),
        amounts: serde_json::from_str::<Demand>(&amounts)?,
        status: parse_enum(&status)?,
        created_at: parse_time(&created_at)?,
    })
}

fn row_to_drift(row: &SqliteRow) -> Result<DriftReport> {
    let metric: String = row.get("metric");
    let passes: i64 = row.get("passes");
    let corrected: i64 = row.get("corrected");
    let resolved: i64 = row.get("resolved");
    let first_seen: String = row.get("first_seen");
    let last_seen: String = row.get("last_seen");
    Ok(DriftReport {
        id: row.get("id"),
        scope_id: row.get("scope_id"),
        metric: parse_enum(&metric)?,
        recorded: row.get("recorded"),
        computed: row.get("computed"),
        passes: passes as u32,
        corrected: corrected != 0,
        resolved: resolved != 0,
        first_seen: parse_time(&first_seen)?,
        last_seen: parse_time(&last_seen)?,
    })
}

fn map_unique(e: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what()),
        _ => StoreError::Database(e),
    }
}

// === Transaction helpers ===

async fn fetch_record_in(conn: &mut SqliteConnection, id: &str) -> Result<Option<ResourceRecord>> {
    let sql = format!("SELECT {} FROM resources WHERE id = ?", RECORD_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(row_to_record).transpose()
}

async fn insert_record_in(conn: &mut SqliteConnection, record: &ResourceRecord) -> Result<()> {
    if !lifecycle::backend_id_consistent(record.state, record.backend_id.is_some()) {
        return Err(StoreError::Conflict(format!(
            "record {} in {} has inconsistent backend id",
            record.id, record.state
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO resources (id, kind, scope_id, backend_id, state, spec, pending_spec,
                               attributes, error_message, reservation_id, created_at,
                               modified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(record.kind.as_str())
    .bind(&record.scope_id)
    .bind(&record.backend_id)
    .bind(record.state.as_str())
    .bind(serde_json::to_string(&record.spec)?)
    .bind(record.pending_spec.as_ref().map(serde_json::to_string).transpose()?)
    .bind(serde_json::to_string(&record.attributes)?)
    .bind(&record.error_message)
    .bind(&record.reservation_id)
    .bind(record.created_at.to_rfc3339())
    .bind(record.modified_at.to_rfc3339())
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        map_unique(e, || {
            format!(
                "{} with backend id {:?} already exists",
                record.kind, record.backend_id
            )
        })
    })?;

    Ok(())
}

/// Write the mutable columns of `updated` if the row is still in `expected`.
async fn compare_and_set_in(
    conn: &mut SqliteConnection,
    updated: &ResourceRecord,
    expected: ResourceState,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE resources
        SET state = ?, backend_id = ?, spec = ?, pending_spec = ?, attributes = ?,
            error_message = ?, modified_at = ?
        WHERE id = ? AND state = ?
        "#,
    )
    .bind(updated.state.as_str())
    .bind(&updated.backend_id)
    .bind(serde_json::to_string(&updated.spec)?)
    .bind(updated.pending_spec.as_ref().map(serde_json::to_string).transpose()?)
    .bind(serde_json::to_string(&updated.attributes)?)
    .bind(&updated.error_message)
    .bind(updated.modified_at.to_rfc3339())
    .bind(&updated.id)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        map_unique(e, || {
            format!(
                "{} with backend id {:?} already exists",
                updated.kind, updated.backend_id
            )
        })
    })?;

    Ok(result.rows_affected() == 1)
}

fn apply_patch(
    mut record: ResourceRecord,
    state: ResourceState,
    patch: RecordPatch,
) -> Result<ResourceRecord> {
    if let Some(backend_id) = patch.backend_id {
        record.backend_id = Some(backend_id);
    }
    if let Some(attributes) = patch.attributes {
        record.attributes = attributes;
    }
    if let Some(spec) = patch.spec {
        record.spec = spec;
    }
    if let Some(pending) = patch.pending_spec {
        record.pending_spec = Some(pending);
    }
    if let Some(message) = patch.error_message {
        record.error_message = message;
    }
    record.state = state;
    record.modified_at = Utc::now();
    if state != ResourceState::Updating {
        record.pending_spec = None;
    }

    if !lifecycle::backend_id_consistent(record.state, record.backend_id.is_some()) {
        return Err(StoreError::Conflict(format!(
            "resource {} cannot be {} {} a backend id",
            record.id,
            record.state,
            if record.backend_id.is_some() { "with" } else { "without" }
        )));
    }
    Ok(record)
}

async fn scope_chain_in(conn: &mut SqliteConnection, id: &str) -> Result<Vec<Scope>> {
    let mut chain = Vec::new();
    let mut next = Some(id.to_string());

    while let Some(current) = next {
        if chain.len() >= MAX_SCOPE_DEPTH {
            return Err(StoreError::Conflict(format!(
                "scope chain of {} is deeper than {}",
                id, MAX_SCOPE_DEPTH
            )));
        }
        let row = sqlx::query("SELECT id, name, level, parent_id FROM scopes WHERE id = ?")
            .bind(&current)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scope '{}'", current)))?;
        let scope = row_to_scope(&row)?;
        next = scope.parent_id.clone();
        chain.push(scope);
    }

    Ok(chain)
}

async fn add_usage_in(
    conn: &mut SqliteConnection,
    scope_id: &str,
    metric: QuotaMetric,
    delta: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO quotas (scope_id, metric, usage, quota_limit)
        VALUES (?, ?, MAX(?, 0), NULL)
        ON CONFLICT(scope_id, metric) DO UPDATE SET usage = MAX(usage + ?, 0)
        "#,
    )
    .bind(scope_id)
    .bind(metric.as_str())
    .bind(delta)
    .bind(delta)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// === ScopeStore ===

#[async_trait]
impl ScopeStore for SqliteStore {
    async fn put_scope(&self, scope: &Scope) -> Result<()> {
        if let Some(parent) = &scope.parent_id {
            if parent == &scope.id {
                return Err(StoreError::Conflict(format!(
                    "scope {} cannot be its own parent",
                    scope.id
                )));
            }
            if self.get_scope(parent).await?.is_none() {
                return Err(StoreError::NotFound(format!("parent scope '{}'", parent)));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO scopes (id, name, level, parent_id) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, level = excluded.level, parent_id = excluded.parent_id
            "#,
        )
        .bind(&scope.id)
        .bind(&scope.name)
        .bind(scope.level.as_str())
        .bind(&scope.parent_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_scope(&self, id: &str) -> Result<Option<Scope>> {
        let row = sqlx::query("SELECT id, name, level, parent_id FROM scopes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_scope).transpose()
    }

    async fn list_scopes(&self) -> Result<Vec<Scope>> {
        let rows = sqlx::query("SELECT id, name, level, parent_id FROM scopes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_scope).collect()
    }

    async fn scope_chain(&self, id: &str) -> Result<Vec<Scope>> {
        let mut conn = self.pool.acquire().await?;
        scope_chain_in(&mut conn, id).await
    }

    async fn scope_subtree(&self, id: &str) -> Result<Vec<Scope>> {
        let root = self
            .get_scope(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scope '{}'", id)))?;

        let mut subtree = vec![root];
        let mut cursor = 0;
        while cursor < subtree.len() {
            if subtree.len() > 10_000 {
                return Err(StoreError::Conflict(format!("scope tree below {} is cyclic", id)));
            }
            let parent = subtree[cursor].id.clone();
            let rows = sqlx::query(
                "SELECT id, name, level, parent_id FROM scopes WHERE parent_id = ? ORDER BY id",
            )
            .bind(&parent)
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                subtree.push(row_to_scope(row)?);
            }
            cursor += 1;
        }

        Ok(subtree)
    }
}

// === RecordStore ===

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_record(&self, record: &ResourceRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_record_in(&mut conn, record).await?;
        self.emit(vec![Event::ResourceCreated(record.clone())]);
        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<Option<ResourceRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_record_in(&mut conn, id).await
    }

    async fn find_by_backend_id(
        &self,
        kind: ResourceKind,
        backend_id: &str,
    ) -> Result<Option<ResourceRecord>> {
        let sql = format!(
            "SELECT {} FROM resources WHERE kind = ? AND backend_id = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(backend_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<ResourceRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM resources
            WHERE (? IS NULL OR scope_id = ?)
              AND (? IS NULL OR kind = ?)
              AND (? IS NULL OR state = ?)
              AND (? OR state != 'DELETED')
            ORDER BY created_at, id
            "#,
            RECORD_COLUMNS
        );
        let kind = filter.kind.map(|k| k.as_str());
        let state = filter.state.map(|s| s.as_str());

        let rows = sqlx::query(&sql)
            .bind(filter.scope_id.as_deref())
            .bind(filter.scope_id.as_deref())
            .bind(kind)
            .bind(kind)
            .bind(state)
            .bind(state)
            .bind(filter.include_deleted || filter.state == Some(ResourceState::Deleted))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn transition(
        &self,
        id: &str,
        transition: Transition,
        patch: RecordPatch,
    ) -> Result<ResourceRecord> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_record_in(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("resource '{}'", id)))?;
        let requested = transition.target();

        if !transition.allows(current.state) {
            return Err(StoreError::StateConflict {
                resource_id: id.to_string(),
                current: current.state,
                requested,
            });
        }

        let from = current.state;
        let updated = apply_patch(current, requested, patch)?;
        if !compare_and_set_in(&mut tx, &updated, from).await? {
            return Err(StoreError::StateConflict {
                resource_id: id.to_string(),
                current: from,
                requested,
            });
        }

        tx.commit().await?;

        debug!(resource_id = %id, from = %from, to = %requested, "Resource transitioned");
        self.emit(vec![Event::ResourceStateChanged {
            id: id.to_string(),
            from,
            to: requested,
        }]);
        Ok(updated)
    }

    async fn patch_record(
        &self,
        id: &str,
        expected: ResourceState,
        patch: RecordPatch,
    ) -> Result<ResourceRecord> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_record_in(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("resource '{}'", id)))?;
        if current.state != expected {
            return Err(StoreError::StateConflict {
                resource_id: id.to_string(),
                current: current.state,
                requested: expected,
            });
        }

        let updated = apply_patch(current, expected, patch)?;
        if !compare_and_set_in(&mut tx, &updated, expected).await? {
            return Err(StoreError::StateConflict {
                resource_id: id.to_string(),
                current: expected,
                requested: expected,
            });
        }

        tx.commit().await?;

        self.emit(vec![Event::ResourcePatched { id: id.to_string() }]);
        Ok(updated)
    }
}

// === LedgerStore ===

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn reserve(&self, request: ReserveRequest) -> Result<Reservation> {
        let mut tx = self.pool.begin().await?;
        let chain = scope_chain_in(&mut tx, &request.scope_id).await?;

        if request.enforce_limits {
            for scope in &chain {
                for (metric, amount) in &request.amounts {
                    if *amount <= 0 {
                        continue;
                    }
                    let row = sqlx::query(
                        "SELECT usage, quota_limit FROM quotas WHERE scope_id = ? AND metric = ?",
                    )
                    .bind(&scope.id)
                    .bind(metric.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;

                    if let Some(row) = row {
                        let usage: i64 = row.get("usage");
                        let limit: Option<i64> = row.get("quota_limit");
                        if let Some(limit) = limit
                            && usage + amount > limit
                        {
                            return Err(StoreError::QuotaExceeded {
                                scope_id: scope.id.clone(),
                                metric: *metric,
                                usage,
                                requested: *amount,
                                limit,
                            });
                        }
                    }
                }
            }
        }

        for scope in &chain {
            for (metric, amount) in &request.amounts {
                add_usage_in(&mut tx, &scope.id, *metric, *amount).await?;
            }
        }

        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            scope_id: request.scope_id.clone(),
            resource_id: request.record.as_ref().map(|r| r.id.clone()),
            amounts: request.amounts.clone(),
            status: if request.committed {
                ReservationStatus::Committed
            } else {
                ReservationStatus::Pending
            },
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO reservations (id, scope_id, resource_id, amounts, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reservation.id)
        .bind(&reservation.scope_id)
        .bind(&reservation.resource_id)
        .bind(serde_json::to_string(&reservation.amounts)?)
        .bind(reservation.status.as_str())
        .bind(reservation.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let mut events = Vec::new();
        if let Some(mut record) = request.record {
            record.reservation_id = Some(reservation.id.clone());
            insert_record_in(&mut tx, &record).await?;
            events.push(Event::ResourceCreated(record));
        }

        tx.commit().await?;

        events.extend(chain.into_iter().map(|s| Event::QuotaChanged { scope_id: s.id }));
        self.emit(events);
        Ok(reservation)
    }

    async fn get_reservation(&self, id: &str) -> Result<Option<Reservation>> {
        let row = sqlx::query(
            "SELECT id, scope_id, resource_id, amounts, status, created_at FROM reservations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn commit_reservation(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE reservations SET status = 'committed' WHERE id = ? AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_reservation(id).await?.is_none() {
            return Err(StoreError::NotFound(format!("reservation '{}'", id)));
        }
        Ok(result.rows_affected() == 1)
    }

    async fn release_reservation(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, scope_id, resource_id, amounts, status, created_at FROM reservations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("reservation '{}'", id)))?;
        let reservation = row_to_reservation(&row)?;

        if reservation.status == ReservationStatus::Released {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE reservations SET status = 'released' WHERE id = ? AND status = ?",
        )
        .bind(id)
        .bind(reservation.status.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let chain = scope_chain_in(&mut tx, &reservation.scope_id).await?;
        for scope in &chain {
            for (metric, amount) in &reservation.amounts {
                add_usage_in(&mut tx, &scope.id, *metric, -amount).await?;
            }
        }

        sqlx::query("UPDATE resources SET reservation_id = NULL WHERE reservation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.emit(
            chain
                .into_iter()
                .map(|s| Event::QuotaChanged { scope_id: s.id })
                .collect(),
        );
        Ok(true)
    }

    async fn get_quota(&self, scope_id: &str) -> Result<Vec<QuotaUsage>> {
        let rows = sqlx::query(
            "SELECT scope_id, metric, usage, quota_limit FROM quotas WHERE scope_id = ? ORDER BY metric",
        )
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_usage).collect()
    }

    async fn set_limit(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        limit: Option<i64>,
    ) -> Result<QuotaUsage> {
        if self.get_scope(scope_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("scope '{}'", scope_id)));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO quotas (scope_id, metric, usage, quota_limit) VALUES (?, ?, 0, ?)
            ON CONFLICT(scope_id, metric) DO UPDATE SET quota_limit = excluded.quota_limit
            RETURNING scope_id, metric, usage, quota_limit
            "#,
        )
        .bind(scope_id)
        .bind(metric.as_str())
        .bind(limit)
        .fetch_one(&self.pool)
        .await?;

        self.emit(vec![Event::LimitChanged {
            scope_id: scope_id.to_string(),
            metric,
            limit,
        }]);
        row_to_usage(&row)
    }

    async fn overwrite_usage(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        usage: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quotas (scope_id, metric, usage, quota_limit) VALUES (?, ?, ?, NULL)
            ON CONFLICT(scope_id, metric) DO UPDATE SET usage = excluded.usage
            "#,
        )
        .bind(scope_id)
        .bind(metric.as_str())
        .bind(usage)
        .execute(&self.pool)
        .await?;

        self.emit(vec![Event::QuotaChanged {
            scope_id: scope_id.to_string(),
        }]);
        Ok(())
    }

    async fn count_pending_reservations(&self, scope_ids: &[String]) -> Result<u64> {
        let mut total = 0u64;
        for scope_id in scope_ids {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM reservations WHERE scope_id = ? AND status = 'pending'",
            )
            .bind(scope_id)
            .fetch_one(&self.pool)
            .await?;
            total += count as u64;
        }
        Ok(total)
    }

    async fn record_drift(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        recorded: i64,
        computed: i64,
    ) -> Result<DriftReport> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let open: Option<String> = sqlx::query_scalar(
            "SELECT id FROM drift_reports WHERE scope_id = ? AND metric = ? AND resolved = 0",
        )
        .bind(scope_id)
        .bind(metric.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let id = match open {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE drift_reports
                    SET recorded = ?, computed = ?, passes = passes + 1, last_seen = ?
                    WHERE id = ?
                    "#,
                )
                .bind(recorded)
                .bind(computed)
                .bind(&now)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO drift_reports (id, scope_id, metric, recorded, computed, passes,
                                               corrected, resolved, first_seen, last_seen)
                    VALUES (?, ?, ?, ?, ?, 1, 0, 0, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(scope_id)
                .bind(metric.as_str())
                .bind(recorded)
                .bind(computed)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        let row = sqlx::query("SELECT * FROM drift_reports WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        let report = row_to_drift(&row)?;

        tx.commit().await?;

        self.emit(vec![Event::DriftRecorded(report.clone())]);
        Ok(report)
    }

    async fn resolve_drift(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        corrected: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE drift_reports SET resolved = 1, corrected = ?
            WHERE scope_id = ? AND metric = ? AND resolved = 0
            "#,
        )
        .bind(corrected)
        .bind(scope_id)
        .bind(metric.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_drift(&self, scope_id: &str) -> Result<Vec<DriftReport>> {
        let rows = sqlx::query(
            "SELECT * FROM drift_reports WHERE scope_id = ? ORDER BY first_seen DESC, metric",
        )
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_drift).collect()
    }
}

impl DataStore for SqliteStore {
    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
