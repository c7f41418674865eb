//! In-process provider with scripted outcomes, for tests and local runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_common::types::{Channel, Message, Recipient};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::provider::{ChannelProvider, DeliveryReceipt, TransportError};

/// A delivery the provider was asked to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelivery {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub address: String,
}

/// Provider that replays queued outcomes, falling back to a default once the queue is empty.
#[derive(Clone)]
pub struct ScriptedProvider {
    channel: Channel,
    available: Arc<AtomicBool>,
    script: Arc<Mutex<VecDeque<Result<DeliveryReceipt, TransportError>>>>,
    fallback: Arc<Mutex<Result<DeliveryReceipt, TransportError>>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<RecordedDelivery>>>,
}

impl ScriptedProvider {
    /// A provider that accepts every delivery.
    pub fn accepting(channel: Channel) -> Self {
        Self::with_fallback(channel, Ok(DeliveryReceipt::sent(None)))
    }

    /// A provider that fails every delivery with `error`.
    pub fn failing(channel: Channel, error: TransportError) -> Self {
        Self::with_fallback(channel, Err(error))
    }

    fn with_fallback(channel: Channel, fallback: Result<DeliveryReceipt, TransportError>) -> Self {
        Self {
            channel,
            available: Arc::new(AtomicBool::new(true)),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(fallback)),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sleep this long (or until cancelled) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue an outcome for the next delivery.
    pub fn push_outcome(&self, outcome: Result<DeliveryReceipt, TransportError>) {
        self.script.lock().push_back(outcome);
    }

    /// Replace the outcome used once the queue is drained.
    pub fn set_fallback(&self, outcome: Result<DeliveryReceipt, TransportError>) {
        *self.fallback.lock() = outcome;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedDelivery> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ChannelProvider for ScriptedProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn deliver(
        &self,
        message: &Message,
        recipient: &Recipient,
        address: &str,
        cancel: CancellationToken,
    ) -> Result<DeliveryReceipt, TransportError> {
        self.calls.lock().push(RecordedDelivery {
            message_id: message.id,
            user_id: recipient.user_id,
            address: address.to_string(),
        });

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let next = self.script.lock().pop_front();
        match next {
            Some(outcome) => outcome,
            None => self.fallback.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::{MessageContent, MessageType};

    #[tokio::test]
    async fn test_script_then_fallback() {
        let provider = ScriptedProvider::accepting(Channel::Email);
        provider.push_outcome(Err(TransportError::new(421, "busy")));

        let recipient = Recipient::new(Uuid::new_v4());
        let message = Message::new(
            MessageType::KudosNotification,
            MessageContent::default(),
            vec![recipient.clone()],
        );

        let first = provider
            .deliver(&message, &recipient, "a@b.c", CancellationToken::new())
            .await;
        let second = provider
            .deliver(&message, &recipient, "a@b.c", CancellationToken::new())
            .await;

        assert_eq!(first.unwrap_err().code, Some(421));
        assert!(second.is_ok());
        assert_eq!(provider.call_count(), 2);
    }
}
