//! Mobile push delivery through an HTTP push gateway.

use async_trait::async_trait;
use courier_common::types::{Channel, DeliveryStatus, Message, Recipient};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::gateway::GatewayClient;
use crate::provider::{ChannelProvider, DeliveryReceipt, TransportError};

pub struct PushProvider {
    client: GatewayClient,
    gateway_url: String,
}

impl PushProvider {
    pub fn new(client: GatewayClient, gateway_url: impl Into<String>) -> Self {
        Self {
            client,
            gateway_url: gateway_url.into(),
        }
    }
}

#[async_trait]
impl ChannelProvider for PushProvider {
    fn channel(&self) -> Channel {
        Channel::Push
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
        // `address` is the device token
        let payload = json!({
            "token": address,
            "notification": {
                "title": message.content.subject,
                "body": message.content.plain_text,
            },
            "data": {
                "message_id": message.id,
                "message_type": message.kind,
                "action_url": message.content.action_url,
            },
        });

        let response = self
            .client
            .post_json(&self.gateway_url, None, &payload, &cancel)
            .await?;

        // Some gateways confirm delivery to the device synchronously
        let status = if response["delivered"].as_bool() == Some(true) {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        };
        let provider_id = response["id"].as_str().map(str::to_string);

        tracing::debug!(
            message_id = %message.id,
            user_id = %recipient.user_id,
            status = %status,
            "Push accepted by gateway"
        );
        Ok(DeliveryReceipt {
            provider_message_id: provider_id,
            status,
            code: 250,
        })
    }
}
