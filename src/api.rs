//! HTTP API surface: routing, request/response types, and handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Json, Router};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, DbHandle, EventQuery, LeadQuery, LeadSort, LeadsDb};
use crate::dispatch::{CycleStats, Dispatcher};
use crate::errors::RetryError;
use crate::models::{
    AutomationEvent, EventStatus, EventType, Lead, LeadActivity, LeadStatus, Role, User,
    WebhookSettings, activity_types,
};
use crate::scoring;
use crate::webhook;

const MAX_PAGE_SIZE: u32 = 100;
const MAX_NOTE_LEN: usize = 2000;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Clone)]
pub struct AppState {
    pub db: DbHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub http: reqwest::Client,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: DbHandle, config: Config) -> anyhow::Result<Self> {
        let dispatcher = Dispatcher::new(db.clone(), &config)?;
        let http = reqwest::Client::builder()
            .timeout(config.delivery_timeout)
            .build()?;
        Ok(Self {
            db,
            dispatcher: Arc::new(dispatcher),
            http,
            config: Arc::new(config),
        })
    }
}

/// API error envelope: JSON `{"error": ...}` with a mapped status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(e) => {
                tracing::error!(error = ?e, "Internal API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl From<RetryError> for ApiError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::NotFound { .. } => Self::NotFound(e.to_string()),
            RetryError::AlreadySent => Self::Conflict(e.to_string()),
            RetryError::MaxAttemptsReached | RetryError::NotRetryable => {
                Self::BadRequest(e.to_string())
            }
            RetryError::Database(inner) => Self::Internal(inner),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: AppState) -> Router {
    let dev_mode = state.config.dev_mode;
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/leads", get(list_leads).post(create_lead))
        .route("/api/leads/{id}", get(get_lead).put(update_lead))
        .route("/api/leads/{id}/status", patch(change_lead_status))
        .route("/api/leads/{id}/score", post(score_lead))
        .route("/api/leads/{id}/activities", get(list_lead_activities))
        .route("/api/leads/{id}/notes", post(add_lead_note))
        .route("/api/automation-events", get(list_events))
        .route("/api/automation-events/dispatch", post(dispatch_now))
        .route("/api/automation-events/{id}", get(get_event))
        .route("/api/automation-events/{id}/retry", post(retry_event))
        .route("/api/settings", get(get_settings))
        .route("/api/settings/webhook", patch(update_webhook_settings))
        .route("/api/settings/webhook/test", post(test_webhook))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/{id}/role", patch(change_user_role))
        .route("/api/users/{id}/password", post(change_user_password))
        .with_state(state);
    if dev_mode {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

async fn health() -> &'static str {
    "ok"
}

// ── Leads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeadListParams {
    q: Option<String>,
    status: Option<String>,
    source: Option<String>,
    min_score: Option<i32>,
    page: Option<u32>,
    page_size: Option<u32>,
    sort: Option<String>,
}

async fn list_leads(
    State(state): State<AppState>,
    Query(params): Query<LeadListParams>,
) -> ApiResult<Json<crate::models::Page<Lead>>> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            LeadStatus::normalize(s)
                .ok_or_else(|| ApiError::BadRequest(format!("Invalid status: {}", s)))
        })
        .transpose()?;
    let sort = match params.sort.as_deref() {
        None | Some("createdAt_desc") => LeadSort::CreatedAtDesc,
        Some("createdAt_asc") => LeadSort::CreatedAtAsc,
        Some("score_desc") => LeadSort::ScoreDesc,
        Some(other) => {
            return Err(ApiError::BadRequest(format!("Invalid sort: {}", other)));
        }
    };
    let query = LeadQuery {
        q: params.q.filter(|q| !q.trim().is_empty()),
        status,
        source: params.source.filter(|s| !s.trim().is_empty()),
        min_score: params.min_score,
        page: params.page.unwrap_or(1).max(1),
        page_size: params.page_size.unwrap_or(20).clamp(1, MAX_PAGE_SIZE),
        sort,
    };
    let page = state.db.call(move |db| db.list_leads(&query)).await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateLeadRequest {
    first_name: String,
    last_name: String,
    email: String,
    phone: Option<String>,
    company: Option<String>,
    source: Option<String>,
    message: Option<String>,
    tags: Option<Vec<String>>,
    metadata: Option<serde_json::Value>,
}

async fn create_lead(
    State(state): State<AppState>,
    Json(req): Json<CreateLeadRequest>,
) -> ApiResult<(StatusCode, Json<Lead>)> {
    if req.first_name.trim().is_empty() || req.last_name.trim().is_empty() {
        return Err(ApiError::BadRequest("Name is required.".into()));
    }
    if !is_valid_email(&req.email) {
        return Err(ApiError::BadRequest("Invalid email.".into()));
    }

    let now = Utc::now();
    let mut lead = Lead {
        id: Uuid::new_v4(),
        first_name: req.first_name.trim().to_string(),
        last_name: req.last_name.trim().to_string(),
        email: req.email.trim().to_string(),
        phone: req.phone.filter(|p| !p.trim().is_empty()),
        company: req.company.filter(|c| !c.trim().is_empty()),
        source: req
            .source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "web".to_string()),
        status: LeadStatus::New,
        score: 0,
        score_reasons: vec![],
        message: req.message,
        tags: req.tags.unwrap_or_default(),
        metadata: req.metadata,
        created_at: now,
        updated_at: now,
    };
    let (score, reasons) = scoring::score_lead(&lead);
    lead.score = score;
    lead.score_reasons = reasons;

    let stored = lead.clone();
    state
        .db
        .call(move |db| {
            db.insert_lead(&stored)?;
            enqueue_event(db, &stored, EventType::LeadCreated, false)?;
            Ok(())
        })
        .await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn get_lead(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Lead>> {
    let lead = state
        .db
        .call(move |db| db.get_lead(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", id)))?;
    Ok(Json(lead))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLeadRequest {
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    source: Option<String>,
    message: Option<String>,
    tags: Option<Vec<String>>,
    metadata: Option<serde_json::Value>,
}

async fn update_lead(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateLeadRequest>,
) -> ApiResult<Json<Lead>> {
    if let Some(email) = &req.email {
        if !is_valid_email(email) {
            return Err(ApiError::BadRequest("Invalid email.".into()));
        }
    }
    let lead = state
        .db
        .call(move |db| {
            let Some(mut lead) = db.get_lead(id)? else {
                return Ok(None);
            };
            if let Some(v) = req.first_name.filter(|v| !v.trim().is_empty()) {
                lead.first_name = v.trim().to_string();
            }
            if let Some(v) = req.last_name.filter(|v| !v.trim().is_empty()) {
                lead.last_name = v.trim().to_string();
            }
            if let Some(v) = req.email {
                lead.email = v.trim().to_string();
            }
            if let Some(v) = req.phone {
                lead.phone = Some(v).filter(|p| !p.trim().is_empty());
            }
            if let Some(v) = req.company {
                lead.company = Some(v).filter(|c| !c.trim().is_empty());
            }
            if let Some(v) = req.source.filter(|v| !v.trim().is_empty()) {
                lead.source = v;
            }
            if let Some(v) = req.message {
                lead.message = Some(v);
            }
            if let Some(v) = req.tags {
                lead.tags = v;
            }
            if let Some(v) = req.metadata {
                lead.metadata = Some(v);
            }
            lead.updated_at = Utc::now();
            db.update_lead(&lead)?;
            Ok(Some(lead))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", id)))?;
    Ok(Json(lead))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusChangeRequest {
    status: String,
}

async fn change_lead_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusChangeRequest>,
) -> ApiResult<Json<Lead>> {
    let new_status = LeadStatus::normalize(&req.status)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid status: {}", req.status)))?;

    let lead = state
        .db
        .call(move |db| {
            let Some(mut lead) = db.get_lead(id)? else {
                return Ok(None);
            };
            let old_status = lead.status;
            lead.status = new_status;
            lead.updated_at = Utc::now();
            db.update_lead(&lead)?;
            db.insert_activity(&LeadActivity {
                id: Uuid::new_v4(),
                lead_id: lead.id,
                activity_type: activity_types::STATUS_CHANGED.to_string(),
                notes: None,
                data: Some(serde_json::json!({
                    "from": old_status.as_str(),
                    "to": new_status.as_str(),
                })),
                created_at: Utc::now(),
            })?;
            enqueue_event(db, &lead, EventType::StatusChanged, true)?;
            Ok(Some(lead))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", id)))?;
    Ok(Json(lead))
}

async fn score_lead(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Lead>> {
    let lead = state
        .db
        .call(move |db| {
            let Some(mut lead) = db.get_lead(id)? else {
                return Ok(None);
            };
            let (score, reasons) = scoring::score_lead(&lead);
            lead.score = score;
            lead.score_reasons = reasons;
            lead.updated_at = Utc::now();
            db.update_lead(&lead)?;
            db.insert_activity(&LeadActivity {
                id: Uuid::new_v4(),
                lead_id: lead.id,
                activity_type: activity_types::SCORED.to_string(),
                notes: None,
                data: Some(serde_json::json!({
                    "score": lead.score,
                    "reasons": lead.score_reasons,
                })),
                created_at: Utc::now(),
            })?;
            enqueue_event(db, &lead, EventType::LeadScored, false)?;
            Ok(Some(lead))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", id)))?;
    Ok(Json(lead))
}

async fn list_lead_activities(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LeadActivity>>> {
    let activities = state
        .db
        .call(move |db| {
            if !db.lead_exists(id)? {
                return Ok(None);
            }
            db.list_activities(id).map(Some)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", id)))?;
    Ok(Json(activities))
}

#[derive(Debug, Deserialize)]
struct NoteRequest {
    notes: String,
}

async fn add_lead_note(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<NoteRequest>,
) -> ApiResult<(StatusCode, Json<LeadActivity>)> {
    let notes = req.notes.trim().to_string();
    if notes.is_empty() || notes.len() > MAX_NOTE_LEN {
        return Err(ApiError::BadRequest(format!(
            "Notes must be 1..={} characters.",
            MAX_NOTE_LEN
        )));
    }
    let activity = state
        .db
        .call(move |db| {
            if !db.lead_exists(id)? {
                return Ok(None);
            }
            let activity = LeadActivity {
                id: Uuid::new_v4(),
                lead_id: id,
                activity_type: activity_types::NOTE_ADDED.to_string(),
                notes: Some(notes),
                data: None,
                created_at: Utc::now(),
            };
            db.insert_activity(&activity)?;
            Ok(Some(activity))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", id)))?;
    Ok((StatusCode::CREATED, Json(activity)))
}

/// Create and persist an automation event for `lead` when a webhook target
/// is configured. When none is and `record_skip` is set, a WebhookSkipped
/// activity is recorded instead.
fn enqueue_event(
    db: &LeadsDb,
    lead: &Lead,
    event_type: EventType,
    record_skip: bool,
) -> anyhow::Result<Option<AutomationEvent>> {
    let config = db.webhook_config()?;
    let Some(target_url) = config.target_url else {
        if record_skip {
            db.insert_activity(&LeadActivity {
                id: Uuid::new_v4(),
                lead_id: lead.id,
                activity_type: activity_types::WEBHOOK_SKIPPED.to_string(),
                notes: Some("No webhook target configured".to_string()),
                data: Some(serde_json::json!({ "eventType": event_type.as_str() })),
                created_at: Utc::now(),
            })?;
        }
        return Ok(None);
    };

    let now = Utc::now();
    let event = AutomationEvent {
        id: Uuid::new_v4(),
        lead_id: lead.id,
        event_type,
        payload: Some(webhook::event_payload(event_type, lead)),
        target_url: Some(target_url),
        status: EventStatus::Pending,
        attempts: 0,
        last_error: None,
        last_attempt_at: None,
        scheduled_at: now,
        processed_at: None,
        created_at: now,
    };
    db.insert_event(&event)?;
    Ok(Some(event))
}

// ── Automation events ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListParams {
    status: Option<String>,
    event_type: Option<String>,
    lead_id: Option<Uuid>,
    page: Option<u32>,
    page_size: Option<u32>,
    sort: Option<String>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventListParams>,
) -> ApiResult<Json<crate::models::Page<AutomationEvent>>> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            EventStatus::normalize(s)
                .ok_or_else(|| ApiError::BadRequest(format!("Invalid status: {}", s)))
        })
        .transpose()?;
    let event_type = params
        .event_type
        .as_deref()
        .map(|s| {
            EventType::normalize(s)
                .ok_or_else(|| ApiError::BadRequest(format!("Invalid event type: {}", s)))
        })
        .transpose()?;
    let created_asc = match params.sort.as_deref() {
        None | Some("createdAt_desc") => false,
        Some("createdAt_asc") => true,
        Some(other) => {
            return Err(ApiError::BadRequest(format!("Invalid sort: {}", other)));
        }
    };
    let query = EventQuery {
        status,
        event_type,
        lead_id: params.lead_id,
        page: params.page.unwrap_or(1).max(1),
        page_size: params.page_size.unwrap_or(20).clamp(1, MAX_PAGE_SIZE),
        created_asc,
    };
    let page = state.db.call(move |db| db.list_events(&query)).await?;
    Ok(Json(page))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AutomationEvent>> {
    let event = state
        .db
        .call(move |db| db.get_event(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Automation event {} not found", id)))?;
    Ok(Json(event))
}

async fn retry_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let retry_max = state.config.retry_max_attempts;
    state
        .db
        .call(move |db| Ok(db.retry_event(id, retry_max)))
        .await??;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchResponse {
    selected: usize,
    attempted: usize,
    sent: usize,
    failed: usize,
    retried: usize,
}

impl From<CycleStats> for DispatchResponse {
    fn from(stats: CycleStats) -> Self {
        Self {
            selected: stats.selected,
            attempted: stats.attempted,
            sent: stats.sent,
            failed: stats.failed,
            retried: stats.retried,
        }
    }
}

/// Run one on-demand dispatch cycle (idempotent alongside the worker).
async fn dispatch_now(State(state): State<AppState>) -> ApiResult<Json<DispatchResponse>> {
    let stats = state.dispatcher.dispatch_pending().await?;
    Ok(Json(stats.into()))
}

// ── Settings ──────────────────────────────────────────────────────────

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<WebhookSettings>> {
    let config = state.db.call(|db| db.webhook_config()).await?;
    Ok(Json(WebhookSettings {
        webhook_target_url: config.target_url,
        has_webhook_secret: config.secret.is_some(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPatchRequest {
    webhook_target_url: Option<String>,
    webhook_secret: Option<String>,
    #[serde(default)]
    rotate_secret: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPatchResponse {
    webhook_target_url: Option<String>,
    has_webhook_secret: bool,
    /// Present only in the response that rotated it.
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_secret: Option<String>,
}

async fn update_webhook_settings(
    State(state): State<AppState>,
    Json(req): Json<WebhookPatchRequest>,
) -> ApiResult<Json<WebhookPatchResponse>> {
    if let Some(url) = &req.webhook_target_url {
        if !webhook::is_valid_webhook_url(url) {
            return Err(ApiError::BadRequest(
                "Webhook URL must be http(s) and at most 500 characters.".into(),
            ));
        }
    }
    if let Some(secret) = &req.webhook_secret {
        if !webhook::is_valid_secret(secret) {
            return Err(ApiError::BadRequest(format!(
                "Webhook secret must be {}..={} characters.",
                webhook::MIN_SECRET_LEN,
                webhook::MAX_SECRET_LEN
            )));
        }
    }
    if req.webhook_secret.is_some() && req.rotate_secret {
        return Err(ApiError::BadRequest(
            "Provide a secret or rotate it, not both.".into(),
        ));
    }

    let rotated = req.rotate_secret.then(webhook::generate_secret);
    let rotated_out = rotated.clone();
    let response = state
        .db
        .call(move |db| {
            let url_changed = req.webhook_target_url.is_some();
            if let Some(url) = &req.webhook_target_url {
                db.upsert_setting(db::WEBHOOK_TARGET_URL_KEY, url)?;
            }
            let secret_changed = if let Some(secret) = &rotated {
                db.upsert_setting(db::WEBHOOK_SECRET_KEY, secret)?;
                true
            } else if let Some(secret) = &req.webhook_secret {
                db.upsert_setting(db::WEBHOOK_SECRET_KEY, secret)?;
                true
            } else {
                false
            };
            if url_changed || secret_changed {
                db.insert_settings_activity(
                    "WebhookSettingsUpdated",
                    &serde_json::json!({
                        "targetUrlChanged": url_changed,
                        "secretChanged": secret_changed,
                        "secretRotated": rotated.is_some(),
                    }),
                )?;
            }
            let config = db.webhook_config()?;
            Ok(WebhookPatchResponse {
                webhook_target_url: config.target_url,
                has_webhook_secret: config.secret.is_some(),
                webhook_secret: None,
            })
        })
        .await?;
    Ok(Json(WebhookPatchResponse {
        webhook_secret: rotated_out,
        ..response
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TestWebhookResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn test_webhook(State(state): State<AppState>) -> ApiResult<Json<TestWebhookResponse>> {
    let config = state.db.call(|db| db.webhook_config()).await?;
    let Some(target_url) = config.target_url else {
        return Err(ApiError::BadRequest("No webhook target configured.".into()));
    };

    let result = webhook::post_webhook(
        &state.http,
        &target_url,
        webhook::TEST_EVENT,
        config.secret.as_deref(),
        webhook::test_payload(),
    )
    .await;

    let response = match result {
        Ok(response) => {
            let status = response.status();
            TestWebhookResponse {
                ok: status.is_success(),
                status_code: Some(status.as_u16()),
                error: (!status.is_success()).then(|| {
                    format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown")
                    )
                }),
            }
        }
        Err(e) => TestWebhookResponse {
            ok: false,
            status_code: None,
            error: Some(format!("Delivery error: {}", e)),
        },
    };
    Ok(Json(response))
}

// ── Users ─────────────────────────────────────────────────────────────

async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    let users = state.db.call(|db| db.list_users()).await?;
    Ok(Json(users))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserRequest {
    email: String,
    name: String,
    password: String,
    role: String,
}

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    if !is_valid_email(&req.email) {
        return Err(ApiError::BadRequest("Invalid email.".into()));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Name is required.".into()));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {} characters.",
            MIN_PASSWORD_LEN
        )));
    }
    let role = Role::normalize(&req.role)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid role: {}", req.role)))?;

    let user = User {
        id: Uuid::new_v4(),
        email: req.email.trim().to_string(),
        name: req.name.trim().to_string(),
        role,
        created_at: Utc::now(),
    };
    let hash = hash_password(&req.password);
    let stored = user.clone();
    let created = state
        .db
        .call(move |db| {
            if db.user_email_exists(&stored.email)? {
                return Ok(false);
            }
            db.insert_user(&stored, &hash)?;
            Ok(true)
        })
        .await?;
    if !created {
        return Err(ApiError::Conflict("Email already in use.".into()));
    }
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
struct RoleChangeRequest {
    role: String,
}

async fn change_user_role(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RoleChangeRequest>,
) -> ApiResult<Json<User>> {
    let role = Role::normalize(&req.role)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid role: {}", req.role)))?;
    let user = state
        .db
        .call(move |db| {
            if !db.set_user_role(id, role)? {
                return Ok(None);
            }
            db.get_user(id)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("User {} not found", id)))?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
struct PasswordChangeRequest {
    password: String,
}

async fn change_user_password(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PasswordChangeRequest>,
) -> ApiResult<StatusCode> {
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {} characters.",
            MIN_PASSWORD_LEN
        )));
    }
    let hash = hash_password(&req.password);
    let found = state
        .db
        .call(move |db| db.set_user_password(id, &hash))
        .await?;
    if !found {
        return Err(ApiError::NotFound(format!("User {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Salted SHA-256 digest stored as `salt$hex`.
fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{}${:x}", salt, hasher.finalize())
}

fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() || email.len() > 320 {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && !domain.is_empty() && domain.contains('.') && !domain.contains('@')
}
