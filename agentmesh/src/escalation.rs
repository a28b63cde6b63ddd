use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{MeshError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Escalation,
    RepairSummary,
    Recovery,
    ApprovalRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorNotice {
    pub kind: NoticeKind,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

impl OperatorNotice {
    pub fn new(kind: NoticeKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
            incident_id: None,
            at: Utc::now(),
        }
    }

    pub fn for_incident(mut self, incident_id: Uuid) -> Self {
        self.incident_id = Some(incident_id);
        self
    }
}

/// The single privileged, write-only notification target.
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn notify(&self, notice: OperatorNotice) -> Result<()>;
}

/// Sends a notice and logs instead of failing: losing the channel must not
/// stop the loop that is reporting to it.
pub async fn notify_or_log(channel: &dyn OperatorChannel, notice: OperatorNotice) {
    let kind = notice.kind;
    let title = notice.title.clone();
    if let Err(err) = channel.notify(notice).await {
        warn!(?kind, title = %title, "operator notification failed: {err}");
    }
}

/// Posts notices as JSON to a webhook, always addressed to the same
/// pre-authorized recipient.
pub struct WebhookChannel {
    http: reqwest::Client,
    url: String,
    recipient: String,
}

impl WebhookChannel {
    pub fn new(
        url: impl Into<String>,
        recipient: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MeshError::InvalidOperation(err.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
            recipient: recipient.into(),
        })
    }
}

#[async_trait]
impl OperatorChannel for WebhookChannel {
    async fn notify(&self, notice: OperatorNotice) -> Result<()> {
        let body = json!({
            "recipient": self.recipient,
            "notice": notice,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| MeshError::Network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(MeshError::Network(format!(
                "operator webhook failed with status {status}: {body}"
            )));
        }
        Ok(())
    }
}

/// Writes notices to the log. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl OperatorChannel for LogChannel {
    async fn notify(&self, notice: OperatorNotice) -> Result<()> {
        info!(
            kind = ?notice.kind,
            incident_id = ?notice.incident_id,
            title = %notice.title,
            "operator notice: {}",
            notice.body
        );
        Ok(())
    }
}

/// Keeps every notice in memory.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    notices: Mutex<Vec<OperatorNotice>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<OperatorNotice> {
        self.notices.lock().clone()
    }

    pub fn count(&self, kind: NoticeKind) -> usize {
        self.notices
            .lock()
            .iter()
            .filter(|notice| notice.kind == kind)
            .count()
    }
}

#[async_trait]
impl OperatorChannel for MemoryChannel {
    async fn notify(&self, notice: OperatorNotice) -> Result<()> {
        self.notices.lock().push(notice);
        Ok(())
    }
}
