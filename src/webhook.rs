//! Outbound webhook plumbing shared by the dispatcher and the settings
//! test endpoint: payload construction, delivery headers, URL validation,
//! and secret generation.

use chrono::Utc;
use uuid::Uuid;

use crate::models::{EventType, Lead};

/// Event-type header attached to every delivery.
pub const EVENT_HEADER: &str = "X-Aureli-Event";
/// Shared-secret header, attached only when a secret is configured.
pub const SECRET_HEADER: &str = "X-Aureli-Secret";

/// Event name used by the settings test endpoint.
pub const TEST_EVENT: &str = "TestWebhook";

pub const MAX_URL_LEN: usize = 500;
pub const MIN_SECRET_LEN: usize = 8;
pub const MAX_SECRET_LEN: usize = 200;

/// Serialized notification body for a lead lifecycle event.
pub fn event_payload(event_type: EventType, lead: &Lead) -> String {
    serde_json::json!({
        "eventType": event_type.as_str(),
        "occurredAt": Utc::now().to_rfc3339(),
        "lead": lead,
    })
    .to_string()
}

/// Body sent by `POST /api/settings/webhook/test`.
pub fn test_payload() -> String {
    serde_json::json!({
        "eventType": TEST_EVENT,
        "occurredAt": Utc::now().to_rfc3339(),
        "message": "Aureli webhook test",
    })
    .to_string()
}

/// Accepts absolute http/https URLs up to 500 characters.
pub fn is_valid_webhook_url(url: &str) -> bool {
    if url.is_empty() || url.len() > MAX_URL_LEN {
        return false;
    }
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

pub fn is_valid_secret(secret: &str) -> bool {
    (MIN_SECRET_LEN..=MAX_SECRET_LEN).contains(&secret.len())
}

/// Random 64-hex-char secret for the rotate action.
pub fn generate_secret() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// POST a JSON payload to a webhook target with the delivery headers set.
/// Transport errors (timeout, refused connection, DNS) surface as `Err`;
/// non-2xx responses come back as a normal `Response`.
pub async fn post_webhook(
    client: &reqwest::Client,
    url: &str,
    event_name: &str,
    secret: Option<&str>,
    body: String,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut request = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(EVENT_HEADER, event_name)
        .body(body);
    if let Some(secret) = secret {
        request = request.header(SECRET_HEADER, secret);
    }
    request.send().await
}
