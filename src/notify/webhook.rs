use futures::future::BoxFuture;
use serde_json::json;

use super::Notifier;
use crate::error::NotifyError;

/// Posts alerts as `{"text": ...}` to a chat-style incoming webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn post(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn deliver<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(self.post(text))
    }
}
