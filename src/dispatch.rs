//! The automation-event dispatcher.
//!
//! Each cycle selects a batch of retryable events, delivers each one over
//! HTTP in order, and persists all outcomes in a single transaction. Delivery
//! failures are recorded on the event rows, never propagated; only selection
//! and persistence errors surface to the caller.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{DbHandle, EventMutation};
use crate::models::{AutomationEvent, EventStatus};
use crate::webhook;

const MISSING_TARGET_URL: &str = "Missing target URL.";
const MAX_ERROR_LEN: usize = 500;

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Outcome counts for one dispatch cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    /// Rows matched by the selection query.
    pub selected: usize,
    /// Rows that passed the time-based eligibility filters.
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Attempted but left Pending for a later retry.
    pub retried: usize,
    /// Mutations actually written (rows not raced by another writer).
    pub written: usize,
}

pub struct Dispatcher {
    db: DbHandle,
    client: reqwest::Client,
    max_attempts: u32,
    batch_size: u32,
}

impl Dispatcher {
    pub fn new(db: DbHandle, config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.delivery_timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            db,
            client,
            max_attempts: config.dispatch_max_attempts,
            batch_size: config.dispatch_batch_size,
        })
    }

    /// Run one dispatch cycle. Safe to invoke repeatedly and concurrently
    /// with manual retries: row updates are guarded on the attempts value
    /// read at selection time. A cycle with no candidates performs no write.
    pub async fn dispatch_pending(&self) -> Result<CycleStats> {
        let max_attempts = self.max_attempts;
        let batch_size = self.batch_size;
        let candidates = self
            .db
            .call(move |db| db.due_events(max_attempts, batch_size))
            .await?;

        let mut stats = CycleStats {
            selected: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(stats);
        }

        let secret = self
            .db
            .call(|db| db.webhook_config())
            .await?
            .secret;

        let now = Utc::now();
        let mut mutations = Vec::new();
        for event in candidates {
            if !is_eligible(&event, now) {
                continue;
            }
            stats.attempted += 1;
            let mutation = self.deliver(&event, secret.as_deref()).await;
            match mutation.status {
                EventStatus::Sent => stats.sent += 1,
                EventStatus::Failed => stats.failed += 1,
                EventStatus::Pending => stats.retried += 1,
            }
            mutations.push(mutation);
        }

        if mutations.is_empty() {
            debug!(selected = stats.selected, "No events eligible this cycle");
            return Ok(stats);
        }

        stats.written = self
            .db
            .call(move |db| db.apply_event_mutations(&mutations))
            .await
            .context("Failed to persist dispatch outcomes")?;

        info!(
            attempted = stats.attempted,
            sent = stats.sent,
            failed = stats.failed,
            retried = stats.retried,
            written = stats.written,
            "Dispatch cycle complete"
        );
        Ok(stats)
    }

    /// Attempt delivery of one event and compute its post-attempt state.
    async fn deliver(&self, event: &AutomationEvent, secret: Option<&str>) -> EventMutation {
        let attempts = event.attempts + 1;
        let attempt_time = Utc::now();
        let mut mutation = EventMutation {
            id: event.id,
            expected_attempts: event.attempts,
            attempts,
            status: EventStatus::Pending,
            last_error: event.last_error.clone(),
            last_attempt_at: Some(attempt_time),
            processed_at: None,
        };

        let Some(target_url) = event
            .target_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
        else {
            // Undeliverable regardless of retries; fail without a network call.
            mutation.status = EventStatus::Failed;
            mutation.last_error = Some(MISSING_TARGET_URL.to_string());
            mutation.processed_at = Some(attempt_time);
            warn!(event_id = %event.id, "Automation event has no target URL");
            return mutation;
        };

        let body = event.payload.clone().unwrap_or_else(|| "{}".to_string());
        let result = webhook::post_webhook(
            &self.client,
            target_url,
            event.event_type.as_str(),
            secret,
            body,
        )
        .await;

        let error = match result {
            Ok(response) if response.status().is_success() => {
                mutation.status = EventStatus::Sent;
                mutation.last_error = None;
                mutation.processed_at = Some(attempt_time);
                debug!(event_id = %event.id, attempts, "Webhook delivered");
                return mutation;
            }
            Ok(response) => {
                let status = response.status();
                format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )
            }
            Err(e) => format!("Delivery error: {}", e),
        };

        mutation.last_error = Some(truncate_error(error));
        if attempts >= self.max_attempts {
            mutation.status = EventStatus::Failed;
            mutation.processed_at = Some(attempt_time);
            warn!(
                event_id = %event.id,
                attempts,
                error = mutation.last_error.as_deref().unwrap_or_default(),
                "Webhook delivery failed permanently"
            );
        } else {
            warn!(
                event_id = %event.id,
                attempts,
                error = mutation.last_error.as_deref().unwrap_or_default(),
                "Webhook delivery failed, will retry"
            );
        }
        mutation
    }
}

/// Exponential backoff since the last attempt: 5s doubling per prior attempt,
/// capped at 60s. The first attempt has no delay.
pub fn backoff_delay(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(10);
    BACKOFF_CAP.min(BACKOFF_BASE * 2u32.pow(exponent))
}

fn is_eligible(event: &AutomationEvent, now: DateTime<Utc>) -> bool {
    if event.scheduled_at > now {
        return false;
    }
    match event.last_attempt_at {
        Some(last) if event.attempts > 0 => {
            let delay = chrono::Duration::from_std(backoff_delay(event.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            last + delay <= now
        }
        _ => true,
    }
}

fn truncate_error(mut error: String) -> String {
    if error.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !error.is_char_boundary(cut) {
            cut -= 1;
        }
        error.truncate(cut);
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{sample_event, sample_lead};
    use crate::models::{EventType, Lead};
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct Capture {
        requests: Arc<Mutex<Vec<(HeaderMap, String)>>>,
        status: Arc<Mutex<StatusCode>>,
    }

    /// Local listener that answers with a scripted status and records
    /// headers and bodies.
    async fn spawn_hook_server() -> (String, Capture) {
        let capture = Capture {
            requests: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(Mutex::new(StatusCode::OK)),
        };
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(capture): State<Capture>, headers: HeaderMap, body: String| async move {
                        capture.requests.lock().unwrap().push((headers, body));
                        *capture.status.lock().unwrap()
                    },
                ),
            )
            .with_state(capture.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, capture)
    }

    async fn setup() -> (DbHandle, Dispatcher, Lead) {
        let db = DbHandle::in_memory().unwrap();
        let lead = sample_lead();
        let insert = lead.clone();
        db.call(move |d| d.insert_lead(&insert)).await.unwrap();
        let dispatcher = Dispatcher::new(
            db.clone(),
            &Config {
                delivery_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        )
        .unwrap();
        (db, dispatcher, lead)
    }

    async fn insert_event(db: &DbHandle, event: crate::models::AutomationEvent) {
        db.call(move |d| d.insert_event(&event)).await.unwrap();
    }

    async fn load_event(db: &DbHandle, id: Uuid) -> crate::models::AutomationEvent {
        db.call(move |d| d.get_event(id)).await.unwrap().unwrap()
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(5), Duration::from_secs(60));
        assert_eq!(backoff_delay(100), Duration::from_secs(60));
    }

    #[test]
    fn test_eligibility_respects_future_schedule_and_backoff() {
        let now = Utc::now();
        let lead_id = Uuid::new_v4();

        let mut future = sample_event(lead_id, None);
        future.scheduled_at = now + chrono::Duration::seconds(60);
        assert!(!is_eligible(&future, now));

        let mut cooling = sample_event(lead_id, None);
        cooling.attempts = 1;
        cooling.last_attempt_at = Some(now - chrono::Duration::seconds(2));
        assert!(!is_eligible(&cooling, now));

        let mut cooled = sample_event(lead_id, None);
        cooled.attempts = 1;
        cooled.last_attempt_at = Some(now - chrono::Duration::seconds(6));
        assert!(is_eligible(&cooled, now));
    }

    #[tokio::test]
    async fn test_happy_path_marks_sent() {
        let (db, dispatcher, lead) = setup().await;
        let (url, capture) = spawn_hook_server().await;
        let event = sample_event(lead.id, Some(&url));
        let id = event.id;
        insert_event(&db, event).await;

        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.written, 1);

        let loaded = load_event(&db, id).await;
        assert_eq!(loaded.status, EventStatus::Sent);
        assert_eq!(loaded.attempts, 1);
        assert!(loaded.last_error.is_none());
        assert!(loaded.processed_at.is_some());
        assert!(loaded.last_attempt_at.is_some());

        let requests = capture.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(
            headers.get(webhook::EVENT_HEADER).unwrap(),
            EventType::StatusChanged.as_str()
        );
        assert!(headers.get(webhook::SECRET_HEADER).is_none());
        assert_eq!(body, r#"{"eventType":"StatusChanged"}"#);
    }

    #[tokio::test]
    async fn test_secret_header_attached_when_configured() {
        let (db, dispatcher, lead) = setup().await;
        let (url, capture) = spawn_hook_server().await;
        db.call(|d| d.upsert_setting(crate::db::WEBHOOK_SECRET_KEY, "hook-secret-1"))
            .await
            .unwrap();
        insert_event(&db, sample_event(lead.id, Some(&url))).await;

        dispatcher.dispatch_pending().await.unwrap();

        let requests = capture.requests.lock().unwrap();
        assert_eq!(
            requests[0].0.get(webhook::SECRET_HEADER).unwrap(),
            "hook-secret-1"
        );
    }

    #[tokio::test]
    async fn test_missing_target_url_fails_without_network() {
        let (db, dispatcher, lead) = setup().await;
        let event = sample_event(lead.id, None);
        let id = event.id;
        insert_event(&db, event).await;

        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.failed, 1);

        let loaded = load_event(&db, id).await;
        assert_eq!(loaded.status, EventStatus::Failed);
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("Missing target URL."));
        assert!(loaded.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_server_error_leaves_event_pending_under_ceiling() {
        let (db, dispatcher, lead) = setup().await;
        let (url, capture) = spawn_hook_server().await;
        *capture.status.lock().unwrap() = StatusCode::INTERNAL_SERVER_ERROR;
        let event = sample_event(lead.id, Some(&url));
        let id = event.id;
        insert_event(&db, event).await;

        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.failed, 0);

        let loaded = load_event(&db, id).await;
        assert_eq!(loaded.status, EventStatus::Pending);
        assert_eq!(loaded.attempts, 1);
        assert!(loaded.last_error.as_deref().unwrap().contains("500"));
        assert!(loaded.processed_at.is_none());
    }

    #[tokio::test]
    async fn test_mid_ceiling_failure_stays_pending() {
        let (db, dispatcher, lead) = setup().await;
        let (url, capture) = spawn_hook_server().await;
        *capture.status.lock().unwrap() = StatusCode::INTERNAL_SERVER_ERROR;
        let mut event = sample_event(lead.id, Some(&url));
        event.attempts = 3;
        event.last_attempt_at = Some(Utc::now() - chrono::Duration::seconds(120));
        let id = event.id;
        insert_event(&db, event).await;

        dispatcher.dispatch_pending().await.unwrap();

        let loaded = load_event(&db, id).await;
        assert_eq!(loaded.status, EventStatus::Pending);
        assert_eq!(loaded.attempts, 4);
        assert!(loaded.last_error.as_deref().unwrap().contains("500"));
        assert!(loaded.processed_at.is_none());
    }

    #[tokio::test]
    async fn test_failure_at_ceiling_goes_terminal() {
        let (db, dispatcher, lead) = setup().await;
        let (url, capture) = spawn_hook_server().await;
        *capture.status.lock().unwrap() = StatusCode::BAD_GATEWAY;
        let mut event = sample_event(lead.id, Some(&url));
        event.attempts = 4;
        event.last_attempt_at = Some(Utc::now() - chrono::Duration::seconds(120));
        let id = event.id;
        insert_event(&db, event).await;

        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.failed, 1);

        let loaded = load_event(&db, id).await;
        assert_eq!(loaded.status, EventStatus::Failed);
        assert_eq!(loaded.attempts, 5);
        assert!(loaded.last_error.as_deref().unwrap().contains("502"));
        assert!(loaded.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_transport_error_recorded_as_last_error() {
        let (db, dispatcher, lead) = setup().await;
        // Bind then drop so the port refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        drop(listener);

        let event = sample_event(lead.id, Some(&url));
        let id = event.id;
        insert_event(&db, event).await;

        dispatcher.dispatch_pending().await.unwrap();

        let loaded = load_event(&db, id).await;
        assert_eq!(loaded.status, EventStatus::Pending);
        assert_eq!(loaded.attempts, 1);
        assert!(loaded.last_error.as_deref().unwrap().starts_with("Delivery error:"));
    }

    #[tokio::test]
    async fn test_future_scheduled_event_is_skipped() {
        let (db, dispatcher, lead) = setup().await;
        let mut event = sample_event(lead.id, Some("http://127.0.0.1:1/hook"));
        event.scheduled_at = Utc::now() + chrono::Duration::minutes(5);
        let id = event.id;
        insert_event(&db, event).await;

        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.selected, 1);
        assert_eq!(stats.attempted, 0);
        assert_eq!(stats.written, 0);

        let loaded = load_event(&db, id).await;
        assert_eq!(loaded.attempts, 0);
        assert!(loaded.last_attempt_at.is_none());
    }

    #[tokio::test]
    async fn test_backoff_window_skips_recent_attempt() {
        let (db, dispatcher, lead) = setup().await;
        let mut event = sample_event(lead.id, Some("http://127.0.0.1:1/hook"));
        event.attempts = 2;
        event.last_attempt_at = Some(Utc::now() - chrono::Duration::seconds(3));
        insert_event(&db, event).await;

        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.attempted, 0);
    }

    #[tokio::test]
    async fn test_terminal_events_never_reattempted() {
        let (db, dispatcher, lead) = setup().await;
        let (url, capture) = spawn_hook_server().await;
        insert_event(&db, sample_event(lead.id, Some(&url))).await;

        dispatcher.dispatch_pending().await.unwrap();
        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats.selected, 0);
        assert_eq!(capture.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_cycle_writes_nothing() {
        let (_, dispatcher, _) = setup().await;
        let stats = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(stats, CycleStats::default());
    }
}
