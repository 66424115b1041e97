use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use uuid::Uuid;

use crate::errors::RetryError;
use crate::models::{
    AutomationEvent, EventStatus, EventType, Lead, LeadActivity, LeadStatus, Page, Role,
    ScoreReason, User,
};

/// Setting keys for the outbound webhook configuration.
pub const WEBHOOK_TARGET_URL_KEY: &str = "WebhookTargetUrl";
pub const WEBHOOK_SECRET_KEY: &str = "WebhookSecret";

/// Async-safe handle to the leads database.
///
/// Wraps `LeadsDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<LeadsDb>>,
}

impl DbHandle {
    pub fn new(db: LeadsDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database at `path` and wrap it in a handle.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(LeadsDb::new(path)?))
    }

    /// In-memory database handle (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(LeadsDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&LeadsDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Query parameters for the paged lead list.
#[derive(Debug, Clone)]
pub struct LeadQuery {
    pub q: Option<String>,
    pub status: Option<LeadStatus>,
    pub source: Option<String>,
    pub min_score: Option<i32>,
    pub page: u32,
    pub page_size: u32,
    pub sort: LeadSort,
}

impl Default for LeadQuery {
    fn default() -> Self {
        Self {
            q: None,
            status: None,
            source: None,
            min_score: None,
            page: 1,
            page_size: 20,
            sort: LeadSort::CreatedAtDesc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeadSort {
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
    ScoreDesc,
}

impl LeadSort {
    fn order_clause(&self) -> &'static str {
        match self {
            Self::CreatedAtDesc => "created_at DESC",
            Self::CreatedAtAsc => "created_at ASC",
            Self::ScoreDesc => "score DESC, created_at DESC",
        }
    }
}

/// Query parameters for the paged automation-event list.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub status: Option<EventStatus>,
    pub event_type: Option<EventType>,
    pub lead_id: Option<Uuid>,
    pub page: u32,
    pub page_size: u32,
    pub created_asc: bool,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            status: None,
            event_type: None,
            lead_id: None,
            page: 1,
            page_size: 20,
            created_asc: false,
        }
    }
}

/// One event's computed post-dispatch state, applied back to the store after
/// the cycle finishes. `expected_attempts` is the attempts value read at
/// selection time; the update is skipped when another writer got there first.
#[derive(Debug, Clone)]
pub struct EventMutation {
    pub id: Uuid,
    pub expected_attempts: u32,
    pub attempts: u32,
    pub status: EventStatus,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Webhook delivery configuration read from the settings table.
#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub target_url: Option<String>,
    pub secret: Option<String>,
}

pub struct LeadsDb {
    conn: Connection,
}

impl LeadsDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS leads (
                    id TEXT PRIMARY KEY,
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    phone TEXT,
                    company TEXT,
                    source TEXT NOT NULL DEFAULT 'web',
                    status TEXT NOT NULL DEFAULT 'New',
                    score INTEGER NOT NULL DEFAULT 0,
                    score_reasons TEXT NOT NULL DEFAULT '[]',
                    message TEXT,
                    tags TEXT NOT NULL DEFAULT '[]',
                    metadata TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lead_activities (
                    id TEXT PRIMARY KEY,
                    lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                    type TEXT NOT NULL,
                    notes TEXT,
                    data TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS automation_events (
                    id TEXT PRIMARY KEY,
                    lead_id TEXT NOT NULL REFERENCES leads(id),
                    event_type TEXT NOT NULL,
                    payload TEXT,
                    target_url TEXT,
                    status TEXT NOT NULL DEFAULT 'Pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    last_attempt_at TEXT,
                    scheduled_at TEXT NOT NULL,
                    processed_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS settings_activities (
                    id TEXT PRIMARY KEY,
                    type TEXT NOT NULL,
                    data TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'ReadOnly',
                    password_hash TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status);
                CREATE INDEX IF NOT EXISTS idx_activities_lead ON lead_activities(lead_id);
                CREATE INDEX IF NOT EXISTS idx_events_lead ON automation_events(lead_id);
                CREATE INDEX IF NOT EXISTS idx_events_due
                    ON automation_events(status, scheduled_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Leads ─────────────────────────────────────────────────────────

    pub fn insert_lead(&self, lead: &Lead) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO leads
                 (id, first_name, last_name, email, phone, company, source, status,
                  score, score_reasons, message, tags, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    lead.id.to_string(),
                    lead.first_name,
                    lead.last_name,
                    lead.email,
                    lead.phone,
                    lead.company,
                    lead.source,
                    lead.status.as_str(),
                    lead.score,
                    serde_json::to_string(&lead.score_reasons)?,
                    lead.message,
                    serde_json::to_string(&lead.tags)?,
                    lead.metadata.as_ref().map(|m| m.to_string()),
                    ts(lead.created_at),
                    ts(lead.updated_at),
                ],
            )
            .context("Failed to insert lead")?;
        Ok(())
    }

    pub fn get_lead(&self, id: Uuid) -> Result<Option<Lead>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, first_name, last_name, email, phone, company, source, status,
                    score, score_reasons, message, tags, metadata, created_at, updated_at
             FROM leads WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id.to_string()], map_lead)?;
        rows.next().transpose().context("Failed to read lead row")
    }

    /// Overwrite a lead's mutable fields. Returns false when the id is unknown.
    pub fn update_lead(&self, lead: &Lead) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE leads SET
                    first_name = ?2, last_name = ?3, email = ?4, phone = ?5,
                    company = ?6, source = ?7, status = ?8, score = ?9,
                    score_reasons = ?10, message = ?11, tags = ?12, metadata = ?13,
                    updated_at = ?14
                 WHERE id = ?1",
                params![
                    lead.id.to_string(),
                    lead.first_name,
                    lead.last_name,
                    lead.email,
                    lead.phone,
                    lead.company,
                    lead.source,
                    lead.status.as_str(),
                    lead.score,
                    serde_json::to_string(&lead.score_reasons)?,
                    lead.message,
                    serde_json::to_string(&lead.tags)?,
                    lead.metadata.as_ref().map(|m| m.to_string()),
                    ts(lead.updated_at),
                ],
            )
            .context("Failed to update lead")?;
        Ok(changed > 0)
    }

    pub fn lead_exists(&self, id: Uuid) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM leads WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_leads(&self, query: &LeadQuery) -> Result<Page<Lead>> {
        let mut where_clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(q) = &query.q {
            let n = values.len() + 1;
            where_clauses.push(format!(
                "(first_name LIKE ?{n} OR last_name LIKE ?{n} \
                 OR email LIKE ?{n} OR company LIKE ?{n})"
            ));
            values.push(SqlValue::from(format!("%{}%", q)));
        }
        if let Some(status) = query.status {
            where_clauses.push(format!("status = ?{}", values.len() + 1));
            values.push(SqlValue::from(status.as_str().to_string()));
        }
        if let Some(source) = &query.source {
            where_clauses.push(format!("source = ?{}", values.len() + 1));
            values.push(SqlValue::from(source.clone()));
        }
        if let Some(min_score) = query.min_score {
            where_clauses.push(format!("score >= ?{}", values.len() + 1));
            values.push(SqlValue::from(i64::from(min_score)));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM leads{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let (page, offset) = page_offset(query.page, query.page_size, total as u64);
        let sql = format!(
            "SELECT id, first_name, last_name, email, phone, company, source, status,
                    score, score_reasons, message, tags, metadata, created_at, updated_at
             FROM leads{} ORDER BY {} LIMIT {} OFFSET {}",
            where_sql,
            query.sort.order_clause(),
            query.page_size,
            offset,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), map_lead)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read lead rows")?;

        Ok(Page::new(items, page, query.page_size, total as u64))
    }

    // ── Lead activities ───────────────────────────────────────────────

    pub fn insert_activity(&self, activity: &LeadActivity) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lead_activities (id, lead_id, type, notes, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    activity.id.to_string(),
                    activity.lead_id.to_string(),
                    activity.activity_type,
                    activity.notes,
                    activity.data.as_ref().map(|d| d.to_string()),
                    ts(activity.created_at),
                ],
            )
            .context("Failed to insert lead activity")?;
        Ok(())
    }

    /// Activities for a lead, most recent first.
    pub fn list_activities(&self, lead_id: Uuid) -> Result<Vec<LeadActivity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, lead_id, type, notes, data, created_at
             FROM lead_activities WHERE lead_id = ?1 ORDER BY created_at DESC",
        )?;
        stmt.query_map(params![lead_id.to_string()], map_activity)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read activity rows")
    }

    // ── Automation events ─────────────────────────────────────────────

    pub fn insert_event(&self, event: &AutomationEvent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO automation_events
                 (id, lead_id, event_type, payload, target_url, status, attempts,
                  last_error, last_attempt_at, scheduled_at, processed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    event.id.to_string(),
                    event.lead_id.to_string(),
                    event.event_type.as_str(),
                    event.payload,
                    event.target_url,
                    event.status.as_str(),
                    event.attempts,
                    event.last_error,
                    event.last_attempt_at.map(ts),
                    ts(event.scheduled_at),
                    event.processed_at.map(ts),
                    ts(event.created_at),
                ],
            )
            .context("Failed to insert automation event")?;
        Ok(())
    }

    pub fn get_event(&self, id: Uuid) -> Result<Option<AutomationEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM automation_events WHERE id = ?1",
            EVENT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], map_event)?;
        rows.next().transpose().context("Failed to read event row")
    }

    /// Candidate events for a dispatch cycle: retryable status, under the
    /// attempt ceiling, oldest schedule first. The time-based eligibility
    /// filters (scheduledAt, backoff window) are applied in memory by the
    /// dispatcher.
    pub fn due_events(&self, max_attempts: u32, limit: u32) -> Result<Vec<AutomationEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM automation_events
             WHERE (status = 'Pending' OR LOWER(status) = 'queued') AND attempts < ?1
             ORDER BY scheduled_at ASC, created_at ASC
             LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        stmt.query_map(params![max_attempts, limit], map_event)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read due events")
    }

    pub fn list_events(&self, query: &EventQuery) -> Result<Page<AutomationEvent>> {
        let mut where_clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        match query.status {
            // Pending still matches rows written with the legacy alias.
            Some(EventStatus::Pending) => {
                where_clauses
                    .push("(status = 'Pending' OR LOWER(status) = 'queued')".to_string());
            }
            Some(status) => {
                where_clauses.push(format!("status = ?{}", values.len() + 1));
                values.push(SqlValue::from(status.as_str().to_string()));
            }
            None => {}
        }
        if let Some(event_type) = query.event_type {
            where_clauses.push(format!("event_type = ?{}", values.len() + 1));
            values.push(SqlValue::from(event_type.as_str().to_string()));
        }
        if let Some(lead_id) = query.lead_id {
            where_clauses.push(format!("lead_id = ?{}", values.len() + 1));
            values.push(SqlValue::from(lead_id.to_string()));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM automation_events{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let (page, offset) = page_offset(query.page, query.page_size, total as u64);
        let order = if query.created_asc {
            "created_at ASC"
        } else {
            "created_at DESC"
        };
        let sql = format!(
            "SELECT {} FROM automation_events{} ORDER BY {} LIMIT {} OFFSET {}",
            EVENT_COLUMNS, where_sql, order, query.page_size, offset,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), map_event)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read event rows")?;

        Ok(Page::new(items, page, query.page_size, total as u64))
    }

    /// Persist a dispatch cycle's mutations in one transaction.
    ///
    /// Each row update is guarded on the attempts value read at selection
    /// time (optimistic concurrency): when a manual retry or a concurrent
    /// process advanced the row in the meantime, that event's mutation is
    /// dropped and the row is re-selected on a later cycle. Returns the
    /// number of rows actually written.
    pub fn apply_event_mutations(&self, mutations: &[EventMutation]) -> Result<usize> {
        if mutations.is_empty() {
            return Ok(0);
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut written = 0;
        for m in mutations {
            written += tx
                .execute(
                    "UPDATE automation_events SET
                        attempts = ?3, status = ?4, last_error = ?5,
                        last_attempt_at = ?6, processed_at = ?7
                     WHERE id = ?1 AND attempts = ?2",
                    params![
                        m.id.to_string(),
                        m.expected_attempts,
                        m.attempts,
                        m.status.as_str(),
                        m.last_error,
                        m.last_attempt_at.map(ts),
                        m.processed_at.map(ts),
                    ],
                )
                .context("Failed to apply event mutation")?;
        }
        tx.commit().context("Failed to commit dispatch batch")?;
        Ok(written)
    }

    /// Validate and apply a manual retry: reset the event to Pending, clear
    /// its error state, and record a WebhookRetryQueued activity.
    pub fn retry_event(&self, id: Uuid, retry_max_attempts: u32) -> Result<(), RetryError> {
        let row: Option<(String, u32, String)> = self
            .conn
            .query_row(
                "SELECT status, attempts, lead_id FROM automation_events WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(anyhow::Error::from(other)),
            })?;

        let Some((status, attempts, lead_id)) = row else {
            return Err(RetryError::NotFound { id });
        };

        if status.eq_ignore_ascii_case(EventStatus::Sent.as_str()) {
            return Err(RetryError::AlreadySent);
        }
        if attempts >= retry_max_attempts {
            return Err(RetryError::MaxAttemptsReached);
        }
        let retryable = status.eq_ignore_ascii_case(EventStatus::Failed.as_str())
            || status.eq_ignore_ascii_case(EventStatus::Pending.as_str())
            || status.eq_ignore_ascii_case(EventStatus::LEGACY_QUEUED);
        if !retryable {
            return Err(RetryError::NotRetryable);
        }

        let now = Utc::now();
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(anyhow::Error::from)?;
        tx.execute(
            "UPDATE automation_events SET
                status = 'Pending', last_error = NULL, last_attempt_at = NULL,
                processed_at = NULL
             WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(anyhow::Error::from)?;
        tx.execute(
            "INSERT INTO lead_activities (id, lead_id, type, notes, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                lead_id,
                crate::models::activity_types::WEBHOOK_RETRY_QUEUED,
                "Retry queued",
                serde_json::json!({
                    "automationEventId": id,
                    "attemptCount": attempts,
                })
                .to_string(),
                ts(now),
            ],
        )
        .map_err(anyhow::Error::from)?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok(())
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(anyhow::Error::from(other)).context("Failed to read setting"),
            })
    }

    pub fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value, ts(Utc::now())],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    pub fn webhook_config(&self) -> Result<WebhookConfig> {
        Ok(WebhookConfig {
            target_url: self
                .get_setting(WEBHOOK_TARGET_URL_KEY)?
                .filter(|v| !v.trim().is_empty()),
            secret: self
                .get_setting(WEBHOOK_SECRET_KEY)?
                .filter(|v| !v.trim().is_empty()),
        })
    }

    pub fn insert_settings_activity(
        &self,
        activity_type: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings_activities (id, type, data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    activity_type,
                    data.to_string(),
                    ts(Utc::now()),
                ],
            )
            .context("Failed to insert settings activity")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn insert_user(&self, user: &User, password_hash: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO users (id, email, name, role, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.id.to_string(),
                    user.email,
                    user.name,
                    user.role.as_str(),
                    password_hash,
                    ts(user.created_at),
                ],
            )
            .context("Failed to insert user")?;
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, name, role, created_at FROM users ORDER BY created_at ASC",
        )?;
        stmt.query_map([], map_user)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read user rows")
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, name, role, created_at FROM users WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id.to_string()], map_user)?;
        rows.next().transpose().context("Failed to read user row")
    }

    pub fn user_email_exists(&self, email: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE LOWER(email) = LOWER(?1)",
            params![email],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn set_user_role(&self, id: Uuid, role: Role) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET role = ?2 WHERE id = ?1",
            params![id.to_string(), role.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_user_password(&self, id: Uuid, password_hash: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET password_hash = ?2 WHERE id = ?1",
            params![id.to_string(), password_hash],
        )?;
        Ok(changed > 0)
    }
}

const EVENT_COLUMNS: &str = "id, lead_id, event_type, payload, target_url, status, attempts, \
     last_error, last_attempt_at, scheduled_at, processed_at, created_at";

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn map_lead(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    let id: String = row.get(0)?;
    let status: String = row.get(7)?;
    let score_reasons: String = row.get(9)?;
    let tags: String = row.get(11)?;
    let metadata: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(Lead {
        id: parse_uuid(0, &id)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        company: row.get(5)?,
        source: row.get(6)?,
        status: LeadStatus::normalize(&status)
            .ok_or_else(|| conversion_err(7, format!("unknown lead status: {}", status)))?,
        score: row.get(8)?,
        score_reasons: serde_json::from_str::<Vec<ScoreReason>>(&score_reasons)
            .unwrap_or_default(),
        message: row.get(10)?,
        tags: serde_json::from_str::<Vec<String>>(&tags).unwrap_or_default(),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: parse_ts(13, &created_at)?,
        updated_at: parse_ts(14, &updated_at)?,
    })
}

fn map_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeadActivity> {
    let id: String = row.get(0)?;
    let lead_id: String = row.get(1)?;
    let data: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(LeadActivity {
        id: parse_uuid(0, &id)?,
        lead_id: parse_uuid(1, &lead_id)?,
        activity_type: row.get(2)?,
        notes: row.get(3)?,
        data: data.and_then(|d| serde_json::from_str(&d).ok()),
        created_at: parse_ts(5, &created_at)?,
    })
}

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutomationEvent> {
    let id: String = row.get(0)?;
    let lead_id: String = row.get(1)?;
    let event_type: String = row.get(2)?;
    let status: String = row.get(5)?;
    let last_attempt_at: Option<String> = row.get(8)?;
    let scheduled_at: String = row.get(9)?;
    let processed_at: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;

    Ok(AutomationEvent {
        id: parse_uuid(0, &id)?,
        lead_id: parse_uuid(1, &lead_id)?,
        event_type: EventType::normalize(&event_type)
            .ok_or_else(|| conversion_err(2, format!("unknown event type: {}", event_type)))?,
        payload: row.get(3)?,
        target_url: row.get(4)?,
        status: EventStatus::normalize(&status)
            .ok_or_else(|| conversion_err(5, format!("unknown event status: {}", status)))?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        last_attempt_at: last_attempt_at.as_deref().map(|s| parse_ts(8, s)).transpose()?,
        scheduled_at: parse_ts(9, &scheduled_at)?,
        processed_at: processed_at.as_deref().map(|s| parse_ts(10, s)).transpose()?,
        created_at: parse_ts(11, &created_at)?,
    })
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let role: String = row.get(3)?;
    let created_at: String = row.get(4)?;

    Ok(User {
        id: parse_uuid(0, &id)?,
        email: row.get(1)?,
        name: row.get(2)?,
        role: Role::normalize(&role)
            .ok_or_else(|| conversion_err(3, format!("unknown role: {}", role)))?,
        created_at: parse_ts(4, &created_at)?,
    })
}

fn page_offset(page: u32, page_size: u32, total: u64) -> (u32, u64) {
    let page = page.max(1);
    let total_pages = if total == 0 {
        1
    } else {
        total.div_ceil(page_size.max(1) as u64) as u32
    };
    let page = page.min(total_pages);
    (page, u64::from(page - 1) * u64::from(page_size))
}


#[cfg(test)]
mod tests {
    use super::test_support::{sample_event, sample_lead};
    use super::*;

    #[test]
    fn test_insert_and_get_lead() {
        let db = LeadsDb::new_in_memory().unwrap();
        let lead = sample_lead();
        db.insert_lead(&lead).unwrap();

        let loaded = db.get_lead(lead.id).unwrap().unwrap();
        assert_eq!(loaded.email, "ada@example.com");
        assert_eq!(loaded.status, LeadStatus::New);
        assert!(db.get_lead(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_list_leads_filters_and_paging() {
        let db = LeadsDb::new_in_memory().unwrap();
        for i in 0..3 {
            let mut lead = sample_lead();
            lead.email = format!("lead{}@example.com", i);
            lead.score = i * 30;
            if i == 2 {
                lead.status = LeadStatus::Qualified;
            }
            db.insert_lead(&lead).unwrap();
        }

        let all = db.list_leads(&LeadQuery::default()).unwrap();
        assert_eq!(all.total_items, 3);

        let qualified = db
            .list_leads(&LeadQuery {
                status: Some(LeadStatus::Qualified),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(qualified.items.len(), 1);

        let high_score = db
            .list_leads(&LeadQuery {
                min_score: Some(50),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(high_score.items.len(), 1);
        assert_eq!(high_score.items[0].score, 60);

        let paged = db
            .list_leads(&LeadQuery {
                page: 2,
                page_size: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(paged.items.len(), 1);
        assert_eq!(paged.page, 2);
        assert_eq!(paged.total_pages, 2);
    }

    #[test]
    fn test_list_leads_search_matches_name_and_email() {
        let db = LeadsDb::new_in_memory().unwrap();
        let mut lead = sample_lead();
        lead.first_name = "Grace".into();
        lead.email = "grace@navy.mil".into();
        db.insert_lead(&lead).unwrap();
        db.insert_lead(&sample_lead()).unwrap();

        let hits = db
            .list_leads(&LeadQuery {
                q: Some("grace".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.items.len(), 1);
        assert_eq!(hits.items[0].first_name, "Grace");
    }

    #[test]
    fn test_due_events_excludes_terminal_and_capped() {
        let db = LeadsDb::new_in_memory().unwrap();
        let lead = sample_lead();
        db.insert_lead(&lead).unwrap();

        let pending = sample_event(lead.id, Some("http://example.com/hook"));
        db.insert_event(&pending).unwrap();

        let mut sent = sample_event(lead.id, Some("http://example.com/hook"));
        sent.status = EventStatus::Sent;
        db.insert_event(&sent).unwrap();

        let mut capped = sample_event(lead.id, Some("http://example.com/hook"));
        capped.attempts = 5;
        db.insert_event(&capped).unwrap();

        let due = db.due_events(5, 25).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, pending.id);
    }

    #[test]
    fn test_due_events_includes_legacy_queued_rows() {
        let db = LeadsDb::new_in_memory().unwrap();
        let lead = sample_lead();
        db.insert_lead(&lead).unwrap();
        let event = sample_event(lead.id, None);
        db.insert_event(&event).unwrap();
        // Simulate a row written by the legacy schema.
        db.conn
            .execute(
                "UPDATE automation_events SET status = 'queued' WHERE id = ?1",
                params![event.id.to_string()],
            )
            .unwrap();

        let due = db.due_events(5, 25).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, EventStatus::Pending);
    }

    #[test]
    fn test_due_events_orders_by_schedule_then_creation() {
        let db = LeadsDb::new_in_memory().unwrap();
        let lead = sample_lead();
        db.insert_lead(&lead).unwrap();

        let now = Utc::now();
        let mut late = sample_event(lead.id, None);
        late.scheduled_at = now - chrono::Duration::seconds(10);
        let mut early = sample_event(lead.id, None);
        early.scheduled_at = now - chrono::Duration::seconds(60);
        db.insert_event(&late).unwrap();
        db.insert_event(&early).unwrap();

        let due = db.due_events(5, 25).unwrap();
        assert_eq!(due[0].id, early.id);
        assert_eq!(due[1].id, late.id);
    }

    #[test]
    fn test_apply_event_mutations_guards_on_attempts() {
        let db = LeadsDb::new_in_memory().unwrap();
        let lead = sample_lead();
        db.insert_lead(&lead).unwrap();
        let event = sample_event(lead.id, Some("http://example.com/hook"));
        db.insert_event(&event).unwrap();

        let now = Utc::now();
        let fresh = EventMutation {
            id: event.id,
            expected_attempts: 0,
            attempts: 1,
            status: EventStatus::Sent,
            last_error: None,
            last_attempt_at: Some(now),
            processed_at: Some(now),
        };
        assert_eq!(db.apply_event_mutations(&[fresh.clone()]).unwrap(), 1);

        // Re-applying with a stale expected_attempts writes nothing.
        assert_eq!(db.apply_event_mutations(&[fresh]).unwrap(), 0);

        let loaded = db.get_event(event.id).unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Sent);
        assert_eq!(loaded.attempts, 1);
        assert!(loaded.processed_at.is_some());
    }

    #[test]
    fn test_retry_event_resets_state_and_records_activity() {
        let db = LeadsDb::new_in_memory().unwrap();
        let lead = sample_lead();
        db.insert_lead(&lead).unwrap();
        let mut event = sample_event(lead.id, Some("http://example.com/hook"));
        event.status = EventStatus::Failed;
        event.attempts = 5;
        event.last_error = Some("HTTP 500".into());
        event.last_attempt_at = Some(Utc::now());
        event.processed_at = Some(Utc::now());
        db.insert_event(&event).unwrap();

        db.retry_event(event.id, 10).unwrap();

        let loaded = db.get_event(event.id).unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Pending);
        assert!(loaded.last_error.is_none());
        assert!(loaded.last_attempt_at.is_none());
        assert!(loaded.processed_at.is_none());

        let activities = db.list_activities(lead.id).unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(
            activities[0].activity_type,
            crate::models::activity_types::WEBHOOK_RETRY_QUEUED
        );
    }

    #[test]
    fn test_retry_event_rejections() {
        let db = LeadsDb::new_in_memory().unwrap();
        let lead = sample_lead();
        db.insert_lead(&lead).unwrap();

        assert!(matches!(
            db.retry_event(Uuid::new_v4(), 10),
            Err(RetryError::NotFound { .. })
        ));

        let mut sent = sample_event(lead.id, None);
        sent.status = EventStatus::Sent;
        db.insert_event(&sent).unwrap();
        assert!(matches!(
            db.retry_event(sent.id, 10),
            Err(RetryError::AlreadySent)
        ));

        let mut maxed = sample_event(lead.id, None);
        maxed.status = EventStatus::Failed;
        maxed.attempts = 10;
        db.insert_event(&maxed).unwrap();
        assert!(matches!(
            db.retry_event(maxed.id, 10),
            Err(RetryError::MaxAttemptsReached)
        ));
    }

    #[test]
    fn test_list_events_status_filter_includes_legacy() {
        let db = LeadsDb::new_in_memory().unwrap();
        let lead = sample_lead();
        db.insert_lead(&lead).unwrap();

        let pending = sample_event(lead.id, None);
        db.insert_event(&pending).unwrap();
        let legacy = sample_event(lead.id, None);
        db.insert_event(&legacy).unwrap();
        db.conn
            .execute(
                "UPDATE automation_events SET status = 'queued' WHERE id = ?1",
                params![legacy.id.to_string()],
            )
            .unwrap();
        let mut failed = sample_event(lead.id, None);
        failed.status = EventStatus::Failed;
        db.insert_event(&failed).unwrap();

        let page = db
            .list_events(&EventQuery {
                status: Some(EventStatus::Pending),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total_items, 2);

        let failed_page = db
            .list_events(&EventQuery {
                status: Some(EventStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed_page.total_items, 1);
    }

    #[test]
    fn test_settings_roundtrip_and_webhook_config() {
        let db = LeadsDb::new_in_memory().unwrap();
        assert!(db.get_setting(WEBHOOK_TARGET_URL_KEY).unwrap().is_none());
        assert!(db.webhook_config().unwrap().target_url.is_none());

        db.upsert_setting(WEBHOOK_TARGET_URL_KEY, "https://example.com/hook")
            .unwrap();
        db.upsert_setting(WEBHOOK_SECRET_KEY, "s3cret-s3cret").unwrap();
        db.upsert_setting(WEBHOOK_TARGET_URL_KEY, "https://example.com/hook2")
            .unwrap();

        let config = db.webhook_config().unwrap();
        assert_eq!(config.target_url.as_deref(), Some("https://example.com/hook2"));
        assert_eq!(config.secret.as_deref(), Some("s3cret-s3cret"));
    }

    #[test]
    fn test_users_roundtrip() {
        let db = LeadsDb::new_in_memory().unwrap();
        let user = User {
            id: Uuid::new_v4(),
            email: "admin@example.com".into(),
            name: "Admin".into(),
            role: Role::Admin,
            created_at: Utc::now(),
        };
        db.insert_user(&user, "hash").unwrap();

        assert!(db.user_email_exists("ADMIN@example.com").unwrap());
        assert_eq!(db.list_users().unwrap().len(), 1);

        db.set_user_role(user.id, Role::Agent).unwrap();
        assert_eq!(db.get_user(user.id).unwrap().unwrap().role, Role::Agent);
    }

    #[tokio::test]
    async fn test_db_handle_call() {
        let handle = DbHandle::in_memory().unwrap();
        let lead = sample_lead();
        let lead_id = lead.id;
        handle.call(move |db| db.insert_lead(&lead)).await.unwrap();
        let loaded = handle
            .call(move |db| db.get_lead(lead_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, lead_id);
    }
}
