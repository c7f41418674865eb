//! Dispatch engine: fans a message out to its recipients' channels.
//!
//! For each recipient:
//! 1. Resolve preferences (snapshot on the recipient, else fetched with a timeout,
//!    else the most restrictive fallback)
//! 2. Skip globally disabled recipients, defer those inside quiet hours
//! 3. Attempt every eligible channel as its own task: rate limit, content check,
//!    provider call, classification, persistence, telemetry
//!
//! Per-channel tasks are spawned, so a cancelled send stops waiting but every
//! attempt that was started still lands in the attempt history.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    Channel, DeliveryAttempt, DeliveryError, DeliveryStatus, ErrorKind, Message, MessageStatus,
    NotificationPreferences, Recipient,
};
use courier_notifier::{ChannelProvider, TransportError};

use crate::classifier::{self, category_for, policy_for};
use crate::ratelimit::{RateLimitError, RateLimiter};
use crate::repository::{AttemptRepository, MessageRepository, PreferenceService, RepositoryError};
use crate::telemetry::Telemetry;
use crate::validation::{self, ValidationError};

/// Tuning knobs for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Recipients processed concurrently within one send.
    pub max_concurrent_recipients: usize,
    /// Provider calls in flight across all sends.
    pub max_concurrent_deliveries: usize,
    /// Upper bound on every repository / preference call.
    pub store_timeout: Duration,
    /// Whether attempts denied by the channel rate limiter may be retried.
    pub retry_rate_limited: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recipients: 16,
            max_concurrent_deliveries: 64,
            store_timeout: Duration::from_secs(2),
            retry_rate_limited: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("message store unavailable: {0}")]
    Storage(String),

    #[error("message {0} already exists")]
    Conflict(Uuid),

    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error("failed to deliver message {message_id} to any recipient ({failed} failed)")]
    NoRecipientsSucceeded { message_id: Uuid, failed: usize },

    #[error("send of message {0} was cancelled")]
    Cancelled(Uuid),
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(e) => AppError::Validation(e.to_string()),
            DispatchError::Storage(reason) => AppError::Unavailable(reason),
            DispatchError::Conflict(id) => AppError::Conflict(format!("Message {id} already exists")),
            DispatchError::NotFound(id) => AppError::NotFound(format!("Message {id} not found")),
            DispatchError::NoRecipientsSucceeded { message_id, failed } => AppError::Delivery {
                message_id,
                reason: format!("no recipient received the message ({failed} failed)"),
            },
            DispatchError::Cancelled(id) => AppError::Internal(format!("send of message {id} was cancelled")),
        }
    }
}

/// How one recipient came out of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecipientOutcome {
    Succeeded,
    Failed,
    /// Globally disabled or no eligible channel.
    Skipped,
    /// Inside quiet hours; left for the external scheduler.
    Deferred,
}

/// Per-channel attempt counts in a [`DeliverySummary`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    pub attempts: usize,
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySummary {
    pub total_recipients: usize,
    pub total_attempts: usize,
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
    pub pending: usize,
    pub by_channel: HashMap<Channel, ChannelSummary>,
}

impl DeliverySummary {
    fn from_attempts(total_recipients: usize, attempts: &[DeliveryAttempt]) -> Self {
        let mut summary = DeliverySummary {
            total_recipients,
            total_attempts: attempts.len(),
            ..Default::default()
        };
        for attempt in attempts {
            let channel = summary.by_channel.entry(attempt.channel).or_default();
            channel.attempts += 1;
            match attempt.status {
                DeliveryStatus::Sent => {
                    summary.sent += 1;
                    channel.sent += 1;
                }
                DeliveryStatus::Delivered => {
                    summary.delivered += 1;
                    channel.delivered += 1;
                }
                DeliveryStatus::Failed => {
                    summary.failed += 1;
                    channel.failed += 1;
                }
                DeliveryStatus::Pending => {
                    summary.pending += 1;
                    channel.pending += 1;
                }
            }
        }
        summary
    }
}

/// A message together with its full attempt history.
#[derive(Debug, Clone, Serialize)]
pub struct MessageStatusReport {
    pub message: Message,
    pub attempts: Vec<DeliveryAttempt>,
    pub summary: DeliverySummary,
}

/// Result of one `retry_failed` pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub message_id: Uuid,
    /// New attempts created.
    pub retried: usize,
    /// New attempts that were sent or delivered.
    pub succeeded: usize,
    /// Latest failed attempts left alone (permanent, exhausted, or no longer deliverable).
    pub skipped: usize,
    pub status: MessageStatus,
}

struct Inner {
    providers: RwLock<HashMap<Channel, Arc<dyn ChannelProvider>>>,
    messages: Arc<dyn MessageRepository>,
    attempts: Arc<dyn AttemptRepository>,
    preferences: Arc<dyn PreferenceService>,
    limiter: RateLimiter,
    telemetry: Arc<Telemetry>,
    delivery_slots: Arc<Semaphore>,
    config: DispatchConfig,
}

/// Cheaply cloneable handle to the dispatch engine.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        attempts: Arc<dyn AttemptRepository>,
        preferences: Arc<dyn PreferenceService>,
        limiter: RateLimiter,
        telemetry: Arc<Telemetry>,
        config: DispatchConfig,
    ) -> Self {
        let delivery_slots = Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1)));
        Self {
            inner: Arc::new(Inner {
                providers: RwLock::new(HashMap::new()),
                messages,
                attempts,
                preferences,
                limiter,
                telemetry,
                delivery_slots,
                config,
            }),
        }
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.inner.telemetry
    }

    /// Register `provider` for its channel, replacing any previous one.
    pub fn register_provider(&self, provider: Arc<dyn ChannelProvider>) {
        let channel = provider.channel();
        let replaced = self.inner.providers.write().insert(channel, provider).is_some();
        self.inner.telemetry.record_gauge(
            "providers_available",
            self.available_channels().len() as f64,
            &[],
        );
        tracing::info!(channel = %channel, replaced, "Channel provider registered");
    }

    /// Channels with a registered provider that is currently available.
    pub fn available_channels(&self) -> Vec<Channel> {
        let providers = self.inner.providers.read();
        let mut channels: Vec<Channel> = providers
            .iter()
            .filter(|(_, provider)| provider.is_available())
            .map(|(channel, _)| *channel)
            .collect();
        channels.sort();
        channels
    }

    fn provider_for(&self, channel: Channel) -> Option<Arc<dyn ChannelProvider>> {
        self.inner
            .providers
            .read()
            .get(&channel)
            .filter(|provider| provider.is_available())
            .cloned()
    }

    /// Deliver `message` to all of its recipients.
    pub async fn send(&self, message: Message) -> Result<Message, DispatchError> {
        self.send_with_cancel(message, CancellationToken::new()).await
    }

    /// Like [`Dispatcher::send`], but stops waiting when `cancel` fires.
    ///
    /// A cancelled send leaves the message `pending`; attempts already started
    /// still complete and are persisted.
    pub async fn send_with_cancel(
        &self,
        mut message: Message,
        cancel: CancellationToken,
    ) -> Result<Message, DispatchError> {
        validation::validate_message(&message)?;
        self.prepare(&mut message);

        self.store_call("create message", self.inner.messages.create(&message))
            .await?;

        let message_id = message.id;
        let shared = Arc::new(message.clone());
        let fanout = futures::stream::iter(message.recipients.clone())
            .map(|recipient| self.process_recipient(Arc::clone(&shared), recipient, cancel.clone()))
            .buffer_unordered(self.inner.config.max_concurrent_recipients.max(1))
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(message_id = %message_id, "Send cancelled, message left pending");
                self.inner.telemetry.increment_counter("messages_cancelled", &[]);
                return Err(DispatchError::Cancelled(message_id));
            }
            outcomes = fanout => outcomes,
        };

        let count = |wanted: RecipientOutcome| outcomes.iter().filter(|(_, o)| *o == wanted).count();
        let succeeded = count(RecipientOutcome::Succeeded);
        let failed = count(RecipientOutcome::Failed);
        let skipped = count(RecipientOutcome::Skipped);
        let deferred: Vec<Uuid> = outcomes
            .iter()
            .filter(|(_, o)| *o == RecipientOutcome::Deferred)
            .map(|(user_id, _)| *user_id)
            .collect();

        if !deferred.is_empty() {
            message
                .metadata
                .insert("deferred_recipients".to_string(), json!(deferred));
        }

        // Deferral is a scheduling decision; a send that only deferred stays pending
        message.status = if succeeded == 0 && failed == 0 && !deferred.is_empty() {
            MessageStatus::Pending
        } else {
            MessageStatus::derive(succeeded, failed)
        };
        message.updated_at = Utc::now();

        if let Err(e) = self
            .store_call("update message", self.inner.messages.update(&message))
            .await
        {
            tracing::error!(message_id = %message_id, error = %e, "Failed to persist message status");
        }

        self.inner
            .telemetry
            .increment_counter("messages_dispatched", &[("status", &message.status.to_string())]);
        tracing::info!(
            message_id = %message_id,
            status = %message.status,
            succeeded,
            failed,
            skipped,
            deferred = deferred.len(),
            "Message dispatched"
        );

        if message.status == MessageStatus::Failed {
            return Err(DispatchError::NoRecipientsSucceeded { message_id, failed });
        }
        Ok(message)
    }

    /// Validate and store `message` for delivery at `deliver_at` without touching any channel.
    pub async fn schedule(
        &self,
        mut message: Message,
        deliver_at: DateTime<Utc>,
    ) -> Result<Message, DispatchError> {
        validation::validate_message(&message)?;
        self.prepare(&mut message);
        message.metadata.insert("scheduled".to_string(), json!(true));
        message.metadata.insert(
            "scheduled_delivery".to_string(),
            json!(deliver_at.to_rfc3339()),
        );

        self.store_call("create message", self.inner.messages.create(&message))
            .await?;

        tracing::info!(
            message_id = %message.id,
            deliver_at = %deliver_at.to_rfc3339(),
            "Message scheduled"
        );
        Ok(message)
    }

    /// Stored messages, newest first.
    pub async fn list_messages(&self, limit: i64, offset: i64) -> Result<Vec<Message>, DispatchError> {
        self.store_call("list messages", self.inner.messages.list(limit, offset))
            .await
    }

    /// The message, every attempt made for it, and per-status counts.
    pub async fn get_status(&self, message_id: Uuid) -> Result<MessageStatusReport, DispatchError> {
        let message = self
            .store_call("get message", self.inner.messages.get(message_id))
            .await?
            .ok_or(DispatchError::NotFound(message_id))?;
        let attempts = self
            .store_call("list attempts", self.inner.attempts.list_for_message(message_id))
            .await?;

        let summary = DeliverySummary::from_attempts(message.recipients.len(), &attempts);
        Ok(MessageStatusReport {
            message,
            attempts,
            summary,
        })
    }

    /// Re-attempt the latest failed attempt of every (recipient, channel) pair whose
    /// error is retryable and whose retry budget is not spent.
    pub async fn retry_failed(&self, message_id: Uuid) -> Result<RetryReport, DispatchError> {
        let mut message = self
            .store_call("get message", self.inner.messages.get(message_id))
            .await?
            .ok_or(DispatchError::NotFound(message_id))?;
        let history = self
            .store_call("list attempts", self.inner.attempts.list_for_message(message_id))
            .await?;

        let mut latest: HashMap<(Uuid, Channel), DeliveryAttempt> = HashMap::new();
        for attempt in history {
            latest.insert((attempt.user_id, attempt.channel), attempt);
        }

        let shared = Arc::new(message.clone());
        let now = Utc::now();
        let mut skipped = 0;
        let mut handles = Vec::new();

        for attempt in latest.values().filter(|a| a.status == DeliveryStatus::Failed) {
            let Some(budget) = retry_budget(attempt) else {
                skipped += 1;
                continue;
            };
            if attempt.retry_count >= budget {
                skipped += 1;
                continue;
            }

            let Some(recipient) = message.recipient(attempt.user_id).cloned() else {
                skipped += 1;
                continue;
            };
            let preferences = self.resolve_preferences(&recipient).await;
            if !preferences.global_enabled || preferences.in_quiet_hours(now) {
                skipped += 1;
                continue;
            }
            let (Some(address), Some(provider)) = (
                preferences.address_for(attempt.channel).map(str::to_string),
                self.provider_for(attempt.channel),
            ) else {
                skipped += 1;
                continue;
            };

            let engine = self.clone();
            let shared = Arc::clone(&shared);
            let channel = attempt.channel;
            let retry_count = attempt.retry_count + 1;
            handles.push(tokio::spawn(async move {
                engine
                    .attempt_channel(
                        shared,
                        recipient,
                        channel,
                        provider,
                        address,
                        retry_count,
                        CancellationToken::new(),
                    )
                    .await
            }));
        }

        let mut retried = 0;
        let mut succeeded = 0;
        for handle in handles {
            match handle.await {
                Ok(attempt) => {
                    retried += 1;
                    if attempt.status.is_success() {
                        succeeded += 1;
                    }
                    latest.insert((attempt.user_id, attempt.channel), attempt);
                }
                Err(e) => {
                    tracing::error!(message_id = %message_id, error = %e, "Retry task panicked");
                }
            }
        }

        // Re-derive from the latest attempt of every (recipient, channel) pair
        let mut per_recipient: HashMap<Uuid, bool> = HashMap::new();
        for attempt in latest.values() {
            *per_recipient.entry(attempt.user_id).or_insert(false) |= attempt.status.is_success();
        }
        let ok = per_recipient.values().filter(|s| **s).count();
        let failed = per_recipient.len() - ok;
        if ok + failed > 0 {
            message.status = MessageStatus::derive(ok, failed);
        }
        message.updated_at = Utc::now();

        if let Err(e) = self
            .store_call("update message", self.inner.messages.update(&message))
            .await
        {
            tracing::error!(message_id = %message_id, error = %e, "Failed to persist message status");
        }

        tracing::info!(
            message_id = %message_id,
            retried,
            succeeded,
            skipped,
            status = %message.status,
            "Retried failed deliveries"
        );

        Ok(RetryReport {
            message_id,
            retried,
            succeeded,
            skipped,
            status: message.status,
        })
    }

    fn prepare(&self, message: &mut Message) {
        if message.id.is_nil() {
            message.id = Uuid::new_v4();
        }
        let removed = validation::dedup_recipients(&mut message.recipients);
        if removed > 0 {
            tracing::debug!(message_id = %message.id, removed, "Collapsed duplicate recipients");
        }
        message.status = MessageStatus::Pending;
        message.updated_at = Utc::now();
    }

    async fn process_recipient(
        &self,
        message: Arc<Message>,
        recipient: Recipient,
        cancel: CancellationToken,
    ) -> (Uuid, RecipientOutcome) {
        let user_id = recipient.user_id;
        let preferences = self.resolve_preferences(&recipient).await;

        if !preferences.global_enabled {
            tracing::debug!(message_id = %message.id, user_id = %user_id, "Notifications disabled for recipient");
            return (user_id, RecipientOutcome::Skipped);
        }
        if preferences.in_quiet_hours(Utc::now()) {
            tracing::debug!(message_id = %message.id, user_id = %user_id, "Recipient in quiet hours, deferring");
            return (user_id, RecipientOutcome::Deferred);
        }

        let eligible: Vec<(Channel, String, Arc<dyn ChannelProvider>)> = preferences
            .channels_for(message.kind)
            .into_iter()
            .filter_map(|channel| {
                let address = preferences.address_for(channel)?.to_string();
                let provider = self.provider_for(channel)?;
                Some((channel, address, provider))
            })
            .collect();

        if eligible.is_empty() {
            tracing::debug!(
                message_id = %message.id,
                user_id = %user_id,
                kind = %message.kind,
                "No eligible channels for recipient"
            );
            return (user_id, RecipientOutcome::Skipped);
        }

        let handles: Vec<_> = eligible
            .into_iter()
            .map(|(channel, address, provider)| {
                let engine = self.clone();
                let message = Arc::clone(&message);
                let recipient = recipient.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    engine
                        .attempt_channel(message, recipient, channel, provider, address, 0, cancel)
                        .await
                })
            })
            .collect();

        let mut any_success = false;
        for handle in handles {
            match handle.await {
                Ok(attempt) => any_success |= attempt.status.is_success(),
                Err(e) => {
                    tracing::error!(message_id = %message.id, user_id = %user_id, error = %e, "Delivery task panicked");
                }
            }
        }

        let outcome = if any_success {
            RecipientOutcome::Succeeded
        } else {
            RecipientOutcome::Failed
        };
        (user_id, outcome)
    }

    async fn resolve_preferences(&self, recipient: &Recipient) -> NotificationPreferences {
        if let Some(preferences) = &recipient.preferences {
            return preferences.clone();
        }

        let user_id = recipient.user_id;
        match self
            .store_call(
                "get preferences",
                self.inner.preferences.get_user_preferences(user_id),
            )
            .await
        {
            Ok(Some(preferences)) => preferences,
            Ok(None) => {
                tracing::debug!(user_id = %user_id, "No stored preferences, using restrictive defaults");
                NotificationPreferences::restrictive(user_id)
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Preference lookup failed, using restrictive defaults");
                NotificationPreferences::restrictive(user_id)
            }
        }
    }

    /// Run one channel attempt to completion and record it.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_channel(
        self,
        message: Arc<Message>,
        recipient: Recipient,
        channel: Channel,
        provider: Arc<dyn ChannelProvider>,
        address: String,
        retry_count: u32,
        cancel: CancellationToken,
    ) -> DeliveryAttempt {
        let mut attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            message_id: message.id,
            user_id: recipient.user_id,
            channel,
            status: DeliveryStatus::Pending,
            attempted_at: Utc::now(),
            error: None,
            retry_count,
            next_retry_at: None,
            provider_message_id: None,
            latency_ms: None,
        };

        match self.inner.limiter.check_channel(channel, &address).await {
            Ok(_) => self.deliver(&mut attempt, &message, &recipient, provider, &address, cancel).await,
            Err(denial) => self.reject_rate_limited(&mut attempt, denial),
        }

        if let Some(error) = &attempt.error {
            self.inner
                .telemetry
                .record_error(channel, error.kind.as_str(), &error.message);
        }

        if let Err(e) = self
            .store_call("create attempt", self.inner.attempts.create(&attempt))
            .await
        {
            tracing::error!(
                attempt_id = %attempt.id,
                message_id = %attempt.message_id,
                error = %e,
                "Failed to persist delivery attempt"
            );
        }

        self.inner.telemetry.record_attempt(&attempt);
        self.inner.telemetry.increment_counter(
            "delivery_attempts",
            &[("channel", channel.as_str()), ("status", &attempt.status.to_string())],
        );

        tracing::debug!(
            attempt_id = %attempt.id,
            message_id = %attempt.message_id,
            user_id = %attempt.user_id,
            channel = %channel,
            status = %attempt.status,
            retry_count,
            "Delivery attempt recorded"
        );
        attempt
    }

    async fn deliver(
        &self,
        attempt: &mut DeliveryAttempt,
        message: &Message,
        recipient: &Recipient,
        provider: Arc<dyn ChannelProvider>,
        address: &str,
        cancel: CancellationToken,
    ) {
        if let Err(e) = validation::validate_content(&message.content, attempt.channel) {
            let policy = policy_for(e.kind);
            attempt.status = DeliveryStatus::Failed;
            attempt.error = Some(DeliveryError {
                kind: e.kind,
                message: e.message,
                retryable: false,
                details: json!({
                    "category": category_for(e.kind).to_string(),
                    "max_retries": policy.max_retries,
                }),
            });
            return;
        }

        let result = match self.inner.delivery_slots.acquire().await {
            Ok(permit) => {
                self.record_in_flight();
                let started = Instant::now();
                let result = provider.deliver(message, recipient, address, cancel).await;
                let elapsed = started.elapsed();
                drop(permit);
                self.record_in_flight();
                attempt.latency_ms = Some(elapsed.as_millis() as u64);
                self.inner.telemetry.record_latency(attempt.channel, elapsed);
                result
            }
            Err(_) => Err(TransportError::new(421, "delivery slots closed")),
        };

        match result {
            Ok(receipt) => {
                attempt.status = receipt.status;
                attempt.provider_message_id = receipt.provider_message_id;
            }
            Err(e) => {
                let classification = classifier::classify_error(&e);
                if classification.is_success() {
                    attempt.status = DeliveryStatus::Sent;
                    return;
                }
                tracing::warn!(
                    message_id = %attempt.message_id,
                    user_id = %attempt.user_id,
                    channel = %attempt.channel,
                    kind = %classification.kind,
                    retryable = classification.retryable,
                    error = %e,
                    "Delivery failed"
                );
                attempt.status = DeliveryStatus::Failed;
                attempt.next_retry_at = classification.next_retry_at(attempt.attempted_at);
                attempt.error = Some(classification.into_delivery_error());
            }
        }
    }

    fn record_in_flight(&self) {
        let capacity = self.inner.config.max_concurrent_deliveries.max(1);
        let in_flight = capacity.saturating_sub(self.inner.delivery_slots.available_permits());
        self.inner
            .telemetry
            .record_gauge("deliveries_in_flight", in_flight as f64, &[]);
    }

    fn reject_rate_limited(&self, attempt: &mut DeliveryAttempt, denial: RateLimitError) {
        let policy = policy_for(ErrorKind::RateLimited);
        let retryable = self.inner.config.retry_rate_limited;
        let (message, mut details, reset) = match denial {
            RateLimitError::Exceeded(headers) => (
                format!("rate limited for channel {}", attempt.channel),
                json!({
                    "limit": headers.limit,
                    "reset": headers.reset,
                    "tier": headers.tier,
                }),
                DateTime::from_timestamp(headers.reset, 0),
            ),
            RateLimitError::StoreUnavailable(reason) => (
                format!("rate limit unavailable for channel {}", attempt.channel),
                json!({ "reason": reason }),
                None,
            ),
        };

        details["category"] = json!(category_for(ErrorKind::RateLimited).to_string());
        details["backoff_seconds"] = json!(policy.backoff_seconds);
        details["max_retries"] = json!(policy.max_retries);

        attempt.status = DeliveryStatus::Failed;
        attempt.next_retry_at = if retryable {
            reset.or_else(|| {
                Some(attempt.attempted_at + chrono::Duration::seconds(policy.backoff_seconds as i64))
            })
        } else {
            None
        };
        attempt.error = Some(DeliveryError {
            kind: ErrorKind::RateLimited,
            message,
            retryable,
            details,
        });
    }

    async fn store_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RepositoryError>>,
    ) -> Result<T, DispatchError> {
        match tokio::time::timeout(self.inner.config.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(RepositoryError::Conflict(id))) => Err(DispatchError::Conflict(id)),
            Ok(Err(e)) => Err(DispatchError::Storage(format!("{operation}: {e}"))),
            Err(_) => Err(DispatchError::Storage(format!(
                "{operation} timed out after {:?}",
                self.inner.config.store_timeout
            ))),
        }
    }
}

/// Retry budget for a failed attempt, or `None` if it must never be retried.
fn retry_budget(attempt: &DeliveryAttempt) -> Option<u32> {
    let error = attempt.error.as_ref().filter(|e| e.retryable)?;
    Some(policy_for(error.kind).max_retries)
}
