use async_trait::async_trait;
use courier_common::types::{Channel, DeliveryStatus, Message, Recipient};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Successful hand-off to a delivery gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Identifier assigned by the gateway, if it returned one.
    pub provider_message_id: Option<String>,
    /// `Sent` when the gateway accepted the message, `Delivered` when it confirmed delivery.
    pub status: DeliveryStatus,
    /// Transport code reported for the hand-off (2xx).
    pub code: u16,
}

impl DeliveryReceipt {
    pub fn sent(provider_message_id: Option<String>) -> Self {
        Self {
            provider_message_id,
            status: DeliveryStatus::Sent,
            code: 250,
        }
    }
}

/// Failure reported by a provider, expressed as a transport code plus text.
///
/// `code` is `None` when the provider only has free text; the classifier then
/// sniffs a code out of the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render(.code, .message))]
pub struct TransportError {
    pub code: Option<u16>,
    pub message: String,
    /// Raw gateway response body, kept for diagnostics only.
    pub detail: Option<String>,
}

fn render(code: &Option<u16>, message: &str) -> String {
    match code {
        Some(code) => format!("{code} {message}"),
        None => message.to_string(),
    }
}

impl TransportError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            detail: None,
        }
    }

    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// The error recorded when a delivery is abandoned because its send was cancelled.
    pub fn cancelled() -> Self {
        Self::new(451, "delivery cancelled")
    }
}

/// A delivery transport for one channel.
///
/// Implementations must be safe to call concurrently; the engine shares a single
/// instance across every in-flight delivery for its channel.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// The channel this provider delivers on.
    fn channel(&self) -> Channel;

    /// Whether the provider is configured and able to take deliveries right now.
    fn is_available(&self) -> bool;

    /// Deliver `message` to `recipient` at `address`.
    ///
    /// `cancel` fires when the caller gave up waiting; providers should abandon
    /// in-flight I/O and return [`TransportError::cancelled`].
    async fn deliver(
        &self,
        message: &Message,
        recipient: &Recipient,
        address: &str,
        cancel: CancellationToken,
    ) -> Result<DeliveryReceipt, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_when_present() {
        assert_eq!(
            TransportError::new(550, "mailbox unavailable").to_string(),
            "550 mailbox unavailable"
        );
        assert_eq!(TransportError::uncoded("boom").to_string(), "boom");
    }
}
