use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery transports a message can travel over.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
    Webhook,
}

impl Channel {
    /// Every channel, in a stable order.
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Push, Channel::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Webhook => "webhook",
        }
    }

    /// Position of this channel inside [`Channel::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Channel::Email => 0,
            Channel::Sms => 1,
            Channel::Push => 2,
            Channel::Webhook => 3,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "push" => Ok(Channel::Push),
            "webhook" => Ok(Channel::Webhook),
            other => Err(crate::error::AppError::Validation(format!(
                "Unknown channel '{}'. Valid channels: email, sms, push, webhook",
                other
            ))),
        }
    }
}

/// Kinds of notification the platform sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum MessageType {
    SubscriptionUpdate,
    CommentNotification,
    KudosNotification,
    SystemAlert,
    PasswordReset,
    AccountSecurity,
    CollectionUpdate,
    SeriesUpdate,
    Invitation,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::SubscriptionUpdate => write!(f, "subscription_update"),
            MessageType::CommentNotification => write!(f, "comment_notification"),
            MessageType::KudosNotification => write!(f, "kudos_notification"),
            MessageType::SystemAlert => write!(f, "system_alert"),
            MessageType::PasswordReset => write!(f, "password_reset"),
            MessageType::AccountSecurity => write!(f, "account_security"),
            MessageType::CollectionUpdate => write!(f, "collection_update"),
            MessageType::SeriesUpdate => write!(f, "series_update"),
            MessageType::Invitation => write!(f, "invitation"),
        }
    }
}

/// Aggregate status of a message across all of its recipients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Completed,
    Partial,
    Failed,
}

impl MessageStatus {
    /// Derive the message status from per-recipient outcomes.
    ///
    /// Recipients that were skipped or deferred are not counted in either total.
    pub fn derive(succeeded: usize, failed: usize) -> Self {
        if succeeded == 0 {
            MessageStatus::Failed
        } else if failed > 0 {
            MessageStatus::Partial
        } else {
            MessageStatus::Completed
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Pending => write!(f, "pending"),
            MessageStatus::Completed => write!(f, "completed"),
            MessageStatus::Partial => write!(f, "partial"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    /// Sent and delivered both count as a successful hand-off.
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Delivered)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Closed taxonomy of delivery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Produced by the transport code alone
    Success,
    ServiceUnavailable,
    MailboxBusy,
    InsufficientStorage,
    SyntaxError,
    ParameterError,
    CommandNotImplemented,
    BadSequence,
    ParameterNotImplemented,
    UserNotLocal,
    StorageExceeded,
    MailboxNameInvalid,
    TransactionFailed,
    TemporaryFailure,
    PermanentFailure,
    UnknownError,

    // Produced by refining a temporary failure through its text
    AuthFailed,
    RateLimited,
    ReputationIssue,
    DnsError,
    NetworkError,
    ContentFiltered,
    MailboxFull,
    MailboxUnavailable,
    InvalidRecipient,
    ServerError,
    ServerMaintenance,
    TlsError,
    FormatError,
    MessageTooLarge,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Success => "success",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::MailboxBusy => "mailbox_busy",
            ErrorKind::InsufficientStorage => "insufficient_storage",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::ParameterError => "parameter_error",
            ErrorKind::CommandNotImplemented => "command_not_implemented",
            ErrorKind::BadSequence => "bad_sequence",
            ErrorKind::ParameterNotImplemented => "parameter_not_implemented",
            ErrorKind::UserNotLocal => "user_not_local",
            ErrorKind::StorageExceeded => "storage_exceeded",
            ErrorKind::MailboxNameInvalid => "mailbox_name_invalid",
            ErrorKind::TransactionFailed => "transaction_failed",
            ErrorKind::TemporaryFailure => "temporary_failure",
            ErrorKind::PermanentFailure => "permanent_failure",
            ErrorKind::UnknownError => "unknown_error",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ReputationIssue => "reputation_issue",
            ErrorKind::DnsError => "dns_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ContentFiltered => "content_filtered",
            ErrorKind::MailboxFull => "mailbox_full",
            ErrorKind::MailboxUnavailable => "mailbox_unavailable",
            ErrorKind::InvalidRecipient => "invalid_recipient",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ServerMaintenance => "server_maintenance",
            ErrorKind::TlsError => "tls_error",
            ErrorKind::FormatError => "format_error",
            ErrorKind::MessageTooLarge => "message_too_large",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rendered message body. Templates are resolved before a message reaches the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub subject: String,
    pub plain_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    /// Free-form template variables carried along for providers.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// A logical notification addressed to one or more users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// `Uuid::nil()` until the dispatch engine assigns one.
    #[serde(default)]
    pub id: Uuid,
    pub kind: MessageType,
    pub content: MessageContent,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub status: MessageStatus,
    /// Free-form metadata (scheduled delivery markers, deferred recipients, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: MessageType, content: MessageContent, recipients: Vec<Recipient>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::nil(),
            kind,
            content,
            recipients,
            status: MessageStatus::Pending,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn recipient(&self, user_id: Uuid) -> Option<&Recipient> {
        self.recipients.iter().find(|r| r.user_id == user_id)
    }
}

/// A user the message is addressed to, with an optional preference snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: Uuid,
    /// `None` means the preferences are fetched lazily at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<NotificationPreferences>,
}

impl Recipient {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            preferences: None,
        }
    }

    pub fn with_preferences(preferences: NotificationPreferences) -> Self {
        Self {
            user_id: preferences.user_id,
            preferences: Some(preferences),
        }
    }
}

/// Per-channel switch and address (email, phone number, device token, URL).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreference {
    pub enabled: bool,
    #[serde(default)]
    pub address: String,
}

/// Which channels a given message type goes out on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTypePreference {
    pub enabled: bool,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

/// A user's window during which immediate delivery is deferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuietHours {
    pub enabled: bool,
    /// `HH:MM`, local to `timezone`
    pub start: String,
    /// `HH:MM`, local to `timezone`
    pub end: String,
    /// IANA zone name; unknown names fall back to UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl QuietHours {
    /// Whether `now` falls strictly inside the window.
    ///
    /// Windows that wrap midnight (`22:00`–`08:00`) are supported. A window whose
    /// start equals its end is empty.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }

        let tz: chrono_tz::Tz = self.timezone.parse().unwrap_or(chrono_tz::UTC);
        let local = now.with_timezone(&tz).time();
        let start = parse_hhmm(&self.start);
        let end = parse_hhmm(&self.end);

        if start <= end {
            local > start && local < end
        } else {
            local > start || local < end
        }
    }
}

/// Parse `HH:MM`, treating anything malformed as midnight.
fn parse_hhmm(value: &str) -> NaiveTime {
    NaiveTime::parse_from_str(value, "%H:%M").unwrap_or(NaiveTime::MIN)
}

/// Resolved notification preferences for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub global_enabled: bool,
    #[serde(default)]
    pub channels: HashMap<Channel, ChannelPreference>,
    #[serde(default)]
    pub message_types: HashMap<MessageType, MessageTypePreference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
}

impl NotificationPreferences {
    /// The most restrictive settings possible: nothing is delivered.
    ///
    /// Used whenever the real preferences cannot be fetched.
    pub fn restrictive(user_id: Uuid) -> Self {
        Self {
            user_id,
            global_enabled: false,
            channels: HashMap::new(),
            message_types: HashMap::new(),
            quiet_hours: None,
        }
    }

    /// Address for `channel` if the channel is enabled and has one.
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        self.channels
            .get(&channel)
            .filter(|c| c.enabled && !c.address.trim().is_empty())
            .map(|c| c.address.as_str())
    }

    /// Channels the user wants `kind` on, restricted to enabled channels with an address.
    ///
    /// Order follows the message-type configuration; duplicates are dropped.
    pub fn channels_for(&self, kind: MessageType) -> Vec<Channel> {
        let Some(config) = self.message_types.get(&kind).filter(|c| c.enabled) else {
            return Vec::new();
        };

        let mut channels = Vec::with_capacity(config.channels.len());
        for channel in &config.channels {
            if self.address_for(*channel).is_some() && !channels.contains(channel) {
                channels.push(*channel);
            }
        }
        channels
    }

    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours
            .as_ref()
            .is_some_and(|quiet| quiet.contains(now))
    }
}

/// Classified delivery failure attached to an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    /// Transport code/text, category, backoff and retry budget.
    #[serde(default)]
    pub details: serde_json::Value,
}

/// One recorded try to deliver a message to a recipient over a channel.
///
/// Attempts are append-only: retries produce new attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub attempted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
    /// 0 for the first try, previous + 1 for each retry.
    #[serde(default)]
    pub retry_count: u32,
    /// Earliest time an external retry trigger should re-attempt this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl DeliveryAttempt {
    /// Whether the external retry trigger may re-attempt this attempt.
    pub fn is_retryable_failure(&self) -> bool {
        self.status == DeliveryStatus::Failed
            && self.error.as_ref().is_some_and(|e| e.retryable)
    }
}

/// Rate-limit tiers, from least to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitTier {
    Anonymous,
    Public,
    Trusted,
    FirstParty,
    Admin,
}

impl std::fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitTier::Anonymous => write!(f, "anonymous"),
            RateLimitTier::Public => write!(f, "public"),
            RateLimitTier::Trusted => write!(f, "trusted"),
            RateLimitTier::FirstParty => write!(f, "first_party"),
            RateLimitTier::Admin => write!(f, "admin"),
        }
    }
}

/// Rate-limit state returned to callers on both allowed and denied requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current window ends.
    pub reset: i64,
    pub tier: String,
}

impl RateLimitHeaders {
    pub fn to_header_pairs(&self) -> [(&'static str, String); 4] {
        [
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            ("x-ratelimit-reset", self.reset.to_string()),
            ("x-ratelimit-tier", self.tier.clone()),
        ]
    }
}

/// Aggregated delivery metrics for a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    /// delivered / (sent + delivered + failed), 0 when nothing was attempted
    pub delivery_rate: f64,
    #[serde(rename = "average_latency_ms")]
    pub average_latency: u64,
    pub by_channel: HashMap<Channel, ChannelMetrics>,
}

/// Per-channel slice of [`MessageMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub delivery_rate: f64,
    #[serde(rename = "avg_latency_ms")]
    pub avg_latency: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quiet(start: &str, end: &str, timezone: &str) -> QuietHours {
        QuietHours {
            enabled: true,
            start: start.to_string(),
            end: end.to_string(),
            timezone: timezone.to_string(),
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(MessageStatus::derive(0, 0), MessageStatus::Failed);
        assert_eq!(MessageStatus::derive(0, 3), MessageStatus::Failed);
        assert_eq!(MessageStatus::derive(2, 1), MessageStatus::Partial);
        assert_eq!(MessageStatus::derive(3, 0), MessageStatus::Completed);
    }

    #[test]
    fn test_quiet_hours_same_day_window() {
        let q = quiet("09:00", "17:00", "UTC");
        assert!(q.contains(at(12, 0)));
        assert!(!q.contains(at(8, 30)));
        assert!(!q.contains(at(18, 0)));
    }

    #[test]
    fn test_quiet_hours_overnight_window() {
        let q = quiet("22:00", "08:00", "UTC");
        assert!(q.contains(at(23, 30)));
        assert!(q.contains(at(3, 0)));
        assert!(!q.contains(at(12, 0)));
    }

    #[test]
    fn test_quiet_hours_respects_timezone() {
        // 20:00 UTC is 22:00 in Berlin during summer time
        let q = quiet("21:00", "23:00", "Europe/Berlin");
        assert!(q.contains(at(20, 0)));
        assert!(!q.contains(at(22, 0)));
    }

    #[test]
    fn test_quiet_hours_disabled_or_empty() {
        let mut q = quiet("00:00", "23:59", "UTC");
        q.enabled = false;
        assert!(!q.contains(at(12, 0)));
        assert!(!quiet("10:00", "10:00", "UTC").contains(at(10, 0)));
    }

    #[test]
    fn test_channels_for_intersects_type_and_channel_settings() {
        let user_id = Uuid::new_v4();
        let mut prefs = NotificationPreferences::restrictive(user_id);
        prefs.global_enabled = true;
        prefs.channels.insert(
            Channel::Email,
            ChannelPreference {
                enabled: true,
                address: "reader@example.com".to_string(),
            },
        );
        prefs.channels.insert(
            Channel::Sms,
            ChannelPreference {
                enabled: false,
                address: "+15550100".to_string(),
            },
        );
        prefs.channels.insert(
            Channel::Push,
            ChannelPreference {
                enabled: true,
                address: String::new(),
            },
        );
        prefs.message_types.insert(
            MessageType::CommentNotification,
            MessageTypePreference {
                enabled: true,
                channels: vec![Channel::Sms, Channel::Email, Channel::Push, Channel::Email],
            },
        );

        assert_eq!(
            prefs.channels_for(MessageType::CommentNotification),
            vec![Channel::Email]
        );
        assert!(prefs.channels_for(MessageType::KudosNotification).is_empty());
    }

    #[test]
    fn test_preferences_json_uses_snake_case_keys() {
        let json = serde_json::json!({
            "user_id": Uuid::nil(),
            "global_enabled": true,
            "channels": { "email": { "enabled": true, "address": "a@b.c" } },
            "message_types": {
                "system_alert": { "enabled": true, "channels": ["email"] }
            }
        });
        let prefs: NotificationPreferences = serde_json::from_value(json).unwrap();
        assert_eq!(prefs.channels_for(MessageType::SystemAlert), vec![Channel::Email]);
    }

    #[test]
    fn test_channel_from_str() {
        assert_eq!("SMS".parse::<Channel>().unwrap(), Channel::Sms);
        assert!("pigeon".parse::<Channel>().is_err());
    }
}
