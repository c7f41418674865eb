//! SMS delivery through an HTTP gateway.

use async_trait::async_trait;
use courier_common::types::{Channel, Message, Recipient};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::gateway::GatewayClient;
use crate::provider::{ChannelProvider, DeliveryReceipt, TransportError};

pub struct SmsProvider {
    client: GatewayClient,
    gateway_url: String,
}

impl SmsProvider {
    pub fn new(client: GatewayClient, gateway_url: impl Into<String>) -> Self {
        Self {
            client,
            gateway_url: gateway_url.into(),
        }
    }
}

#[async_trait]
impl ChannelProvider for SmsProvider {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn is_available(&self) -> bool {
        !self.gateway_url.is_empty()
    }

    async fn deliver(
        &self,
        message: &Message,
        recipient: &Recipient,
        address: &str,
        cancel: CancellationToken,
    ) -> Result<DeliveryReceipt, TransportError> {
        let payload = json!({
            "to": address,
            "body": message.content.plain_text,
            "reference": message.id,
        });

        let response = self
            .client
            .post_json(&self.gateway_url, None, &payload, &cancel)
            .await?;

        let provider_id = response["sid"]
            .as_str()
            .or_else(|| response["id"].as_str())
            .map(str::to_string);
        tracing::debug!(
            message_id = %message.id,
            user_id = %recipient.user_id,
            provider_id = ?provider_id,
            "SMS accepted by gateway"
        );
        Ok(DeliveryReceipt::sent(provider_id))
    }
}
