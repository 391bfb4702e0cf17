//! Outbound HTTP callbacks: notification webhooks and status updates.

use async_trait::async_trait;
use serde::Serialize;
use shipyard_core::notify::{Notification, Notifier, StatusReporter, StatusUpdate};
use shipyard_core::{Error, Result};
use tracing::debug;
use url::Url;

/// POSTs every [`Notification`] as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        post_json(&self.client, &self.url, notification).await?;
        debug!(pipeline_id = %notification.pipeline_id, url = %self.url, "Delivered notification");
        Ok(())
    }
}

/// Sends [`StatusUpdate`]s to `{base}/pipelines/{pipeline_id}/status`.
pub struct HttpStatusReporter {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpStatusReporter {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn status_url(&self, update: &StatusUpdate) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{}/pipelines/{}/status", base, update.pipeline_id)
            .parse()
            .map_err(|e| Error::InvalidInput(format!("invalid status url: {}", e)))
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn report(&self, update: StatusUpdate) -> Result<()> {
        let url = self.status_url(&update)?;
        post_json(&self.client, &url, &update).await?;
        debug!(pipeline_id = %update.pipeline_id, status = %update.status, "Reported pipeline status");
        Ok(())
    }
}

async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &Url,
    body: &T,
) -> Result<()> {
    let response = client
        .post(url.clone())
        .header("User-Agent", "Shipyard")
        .json(body)
        .send()
        .await
        .map_err(|e| Error::ExecutionFailed(format!("request to {} failed: {}", url, e)))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let text = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", url, status, text.trim());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(Error::ExecutionFailed(message))
    } else {
        Err(Error::InvalidInput(message))
    }
}
