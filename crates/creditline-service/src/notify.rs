//! HTTP delivery of job notifications.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use creditline_engine::{JobNotification, Notifier, NotifyError};

/// Posts each [`JobNotification`] as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    /// Create a notifier that posts to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| NotifyError(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError(format!("notification endpoint returned {status}")));
        }

        tracing::debug!(
            process_id = %notification.process_id,
            status = notification.status.as_str(),
            "Job notification delivered"
        );
        Ok(())
    }
}
