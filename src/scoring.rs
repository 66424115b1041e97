//! Rule-based lead scoring.
//!
//! Pure function over the lead's contact info, message, source, and metadata.
//! Each matched rule contributes a delta and a reason row; the final score is
//! clamped to 0..=100.

use crate::models::{Lead, ScoreReason};

const HIGH_INTENT_KEYWORDS: &[&str] = &[
    "quote",
    "pricing",
    "price",
    "estimate",
    "book",
    "appointment",
    "schedule",
    "asap",
];

const SPAM_KEYWORDS: &[&str] = &[
    "backlinks",
    "seo services",
    "guest post",
    "rank your site",
    "casino",
];

const LOCAL_CITIES: &[&str] = &["riverside", "corona", "eastvale", "norco"];

/// Score a lead. Returns the clamped score and the contributing rules.
pub fn score_lead(lead: &Lead) -> (i32, Vec<ScoreReason>) {
    let mut score = 0;
    let mut reasons = Vec::new();
    let mut apply = |rule: &str, delta: i32| {
        score += delta;
        reasons.push(ScoreReason {
            rule: rule.to_string(),
            delta,
        });
    };

    let has_email = !lead.email.trim().is_empty();
    let has_phone = lead
        .phone
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());

    if has_email {
        apply("HasEmail", 20);
    }
    if has_phone {
        apply("HasPhone", 20);
    }

    let message = lead.message.as_deref().unwrap_or("").to_lowercase();
    if HIGH_INTENT_KEYWORDS.iter().any(|kw| message.contains(kw)) {
        apply("HighIntentKeyword", 15);
    }
    if SPAM_KEYWORDS.iter().any(|kw| message.contains(kw)) {
        apply("SpamKeyword", -30);
    }

    match lead.source.to_lowercase().as_str() {
        "google_ads" => apply("SourceGoogleAds", 10),
        "referral" => apply("SourceReferral", 8),
        _ => {}
    }

    let metadata = lead
        .metadata
        .as_ref()
        .map(|m| m.to_string().to_lowercase())
        .unwrap_or_default();
    if LOCAL_CITIES.iter().any(|city| metadata.contains(city)) {
        apply("LocalArea", 10);
    }

    if !has_email && !has_phone {
        apply("NoContactInfo", -15);
    }

    (score.clamp(0, 100), reasons)
}
