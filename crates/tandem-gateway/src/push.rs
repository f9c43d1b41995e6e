use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Payload contract of the external push-notification gateway.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub tag: String,
    pub data: serde_json::Value,
}

/// HTTP client for the push gateway. Without a configured endpoint, sends
/// are logged at debug level and dropped (the dev and test setup).
pub struct PushGateway {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl PushGateway {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    pub async fn send(&self, user_id: Uuid, message: &PushMessage) -> anyhow::Result<()> {
        let Some(endpoint) = &self.endpoint else {
            debug!("Push gateway disabled; dropping '{}' for {}", message.tag, user_id);
            return Ok(());
        };

        let payload = serde_json::json!({
            "user_id": user_id,
            "title": message.title,
            "body": message.body,
            "tag": message.tag,
            "data": message.data,
        });

        self.client
            .post(endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
