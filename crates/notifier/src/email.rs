//! Email delivery through a Resend-compatible HTTP API.

use async_trait::async_trait;
use courier_common::types::{Channel, Message, Recipient};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::gateway::GatewayClient;
use crate::provider::{ChannelProvider, DeliveryReceipt, TransportError};

/// Sends email through an HTTP gateway (`POST {url}` with a bearer key).
pub struct EmailProvider {
    client: GatewayClient,
    gateway_url: String,
    api_key: Option<String>,
    from: String,
}

impl EmailProvider {
    pub fn new(
        client: GatewayClient,
        gateway_url: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            client,
            gateway_url: gateway_url.into(),
            api_key,
            from: from.into(),
        }
    }
}

#[async_trait]
impl ChannelProvider for EmailProvider {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some() && !self.from.is_empty()
    }

    async fn deliver(
        &self,
        message: &Message,
        recipient: &Recipient,
        address: &str,
        cancel: CancellationToken,
    ) -> Result<DeliveryReceipt, TransportError> {
        let payload = json!({
            "from": self.from,
            "to": [address],
            "subject": message.content.subject,
            "text": message.content.plain_text,
            "html": message.content.html,
            "tags": [
                { "name": "message_id", "value": message.id.to_string() },
                { "name": "message_type", "value": message.kind.to_string() },
            ],
        });

        let response = self
            .client
            .post_json(&self.gateway_url, self.api_key.as_deref(), &payload, &cancel)
            .await?;

        let provider_id = response["id"].as_str().map(str::to_string);
        tracing::debug!(
            message_id = %message.id,
            user_id = %recipient.user_id,
            provider_id = ?provider_id,
            "Email accepted by gateway"
        );
        Ok(DeliveryReceipt::sent(provider_id))
    }
}
