use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobflow::jobs::{HandlerError, HandlerOptions, HandlerRegistry, Job, JobContext};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

pub const RESUME_EXTRACT: &str = "resume-extract";
pub const WEBHOOK_EVENT: &str = "webhook-event";
pub const CRM_PEOPLE_SYNC: &str = "crm-people-sync";

#[derive(Debug, Deserialize)]
pub struct ResumeExtractPayload {
    pub contact_id: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventPayload {
    pub source: String,
    pub event: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct PeopleSyncPayload {
    /// Sync one contact; absent means a full sync.
    #[serde(default)]
    pub contact_id: Option<String>,
}

// Adapters for the CRM and extraction services are deployed separately; these
// handlers record what would be sent to them.

async fn resume_extract(
    p: ResumeExtractPayload,
    job: Job,
    ctx: JobContext,
) -> Result<Option<Value>, HandlerError> {
    if p.contact_id.trim().is_empty() {
        return Err(HandlerError::bad_payload("contact_id is empty"));
    }
    info!(
        job_id = %job.id,
        contact_id = %p.contact_id,
        attempt = ctx.attempt,
        "extracting resume"
    );
    Ok(Some(json!({
        "contact_id": p.contact_id,
        "attachment_id": p.attachment_id,
        "filename": p.filename,
        "extracted_at": Utc::now().to_rfc3339(),
    })))
}

async fn webhook_event(
    p: WebhookEventPayload,
    job: Job,
    _ctx: JobContext,
) -> Result<Option<Value>, HandlerError> {
    let event_id = match p.event.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "unknown".to_string(),
    };
    let mut keys: Vec<String> = p
        .event
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();

    info!(job_id = %job.id, source = %p.source, event_id = %event_id, "processing webhook");
    Ok(Some(json!({
        "source": p.source,
        "event_id": event_id,
        "received_at": job.created_at.to_rfc3339(),
        "payload_keys": keys,
    })))
}

async fn crm_people_sync(
    p: PeopleSyncPayload,
    job: Job,
    _ctx: JobContext,
) -> Result<Option<Value>, HandlerError> {
    let scope = match &p.contact_id {
        Some(id) => format!("contact:{id}"),
        None => "all".to_string(),
    };
    info!(job_id = %job.id, scope = %scope, "syncing people from crm");
    Ok(Some(json!({ "scope": scope })))
}

pub fn build_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    registry.register_typed(
        RESUME_EXTRACT,
        HandlerOptions::new()
            .max_concurrency(4)
            .timeout(Duration::from_secs(300)),
        resume_extract,
    );
    registry.register_typed(
        WEBHOOK_EVENT,
        HandlerOptions::new().timeout(Duration::from_secs(30)),
        webhook_event,
    );
    registry.register_typed(
        CRM_PEOPLE_SYNC,
        HandlerOptions::new()
            .max_concurrency(1)
            .timeout(Duration::from_secs(540)),
        crm_people_sync,
    );

    Arc::new(registry)
}
