//! Webhook delivery: the recipient's address is the URL to POST to.

use async_trait::async_trait;
use chrono::Utc;
use courier_common::types::{Channel, Message, Recipient};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::gateway::GatewayClient;
use crate::provider::{ChannelProvider, DeliveryReceipt, TransportError};

/// JSON body posted to webhook endpoints.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    message_id: Uuid,
    user_id: Uuid,
    message_type: String,
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    action_url: Option<&'a str>,
    variables: &'a serde_json::Map<String, serde_json::Value>,
    sent_at: String,
}

pub struct WebhookProvider {
    client: GatewayClient,
    enabled: bool,
}

impl WebhookProvider {
    pub fn new(client: GatewayClient, enabled: bool) -> Self {
        Self { client, enabled }
    }
}

#[async_trait]
impl ChannelProvider for WebhookProvider {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    fn is_available(&self) -> bool {
        self.enabled
    }

    async fn deliver(
        &self,
        message: &Message,
        recipient: &Recipient,
        address: &str,
        cancel: CancellationToken,
    ) -> Result<DeliveryReceipt, TransportError> {
        if !(address.starts_with("https://") || address.starts_with("http://")) {
            return Err(TransportError::new(553, "webhook address is not an http(s) URL"));
        }

        let payload = WebhookPayload {
            message_id: message.id,
            user_id: recipient.user_id,
            message_type: message.kind.to_string(),
            subject: &message.content.subject,
            text: &message.content.plain_text,
            action_url: message.content.action_url.as_deref(),
            variables: &message.content.variables,
            sent_at: Utc::now().to_rfc3339(),
        };

        self.client
            .post_json(address, None, &payload, &cancel)
            .await?;

        tracing::debug!(message_id = %message.id, user_id = %recipient.user_id, "Webhook delivered");
        Ok(DeliveryReceipt::sent(None))
    }
}
