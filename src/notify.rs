//! Library rescan notification.
//!
//! After a successful library move the media server is asked to rescan.
//! Delivery is best effort: a failed webhook logs a warning and never
//! fails the job.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can ask the media library to rescan itself.
#[async_trait]
pub trait LibraryNotifier: Send + Sync {
    /// Trigger a rescan. Returns whether the notification was delivered.
    async fn notify_rescan(&self) -> bool;
}

/// Webhook-based notifier hitting a configured rescan URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    rescan_url: String,
}

impl WebhookNotifier {
    pub fn new(rescan_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self {
            client,
            rescan_url: rescan_url.into(),
        })
    }
}

#[async_trait]
impl LibraryNotifier for WebhookNotifier {
    async fn notify_rescan(&self) -> bool {
        if self.rescan_url.is_empty() {
            return false;
        }
        match self.client.get(&self.rescan_url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Library rescan triggered");
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "Library rescan request rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to reach library rescan endpoint");
                false
            }
        }
    }
}

/// No-op notifier used when no rescan URL is configured.
pub struct NoopNotifier;

#[async_trait]
impl LibraryNotifier for NoopNotifier {
    async fn notify_rescan(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_url_is_not_delivered() {
        let notifier = WebhookNotifier::new("").unwrap();
        assert!(!notifier.notify_rescan().await);
    }

    #[tokio::test]
    async fn test_noop() {
        assert!(!NoopNotifier.notify_rescan().await);
    }
}
