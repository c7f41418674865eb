//! Delivery error classifier.
//!
//! Maps a transport code and free-text response into an [`ErrorKind`], then
//! attaches the static retry policy for that kind. Classification is a pure
//! function: the same `(code, message)` always yields the same result.
//!
//! Only a generic `temporary_failure` is refined by its text. The keyword table
//! is evaluated in order and the first hit wins, so "authentication quota"
//! classifies as `auth_failed`, not `rate_limited`.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;

use courier_common::types::{DeliveryError, ErrorKind};
use courier_notifier::TransportError;

/// Backoff applied to kinds without a specific policy.
const DEFAULT_BACKOFF_SECONDS: u64 = 60;

/// Retry budget for kinds without a specific policy.
const DEFAULT_MAX_RETRIES: u32 = 1;

/// Ordered refinement table for `temporary_failure`.
const REFINEMENTS: &[(&[&str], ErrorKind)] = &[
    (&["authentication", "auth", "login", "password"], ErrorKind::AuthFailed),
    (&["invalid credentials", "bad username", "bad password"], ErrorKind::AuthFailed),
    (&["rate limit", "too many", "throttle", "quota"], ErrorKind::RateLimited),
    (&["hourly limit", "daily limit", "sending limit"], ErrorKind::RateLimited),
    (&["blacklist", "blocked", "reputation", "spam"], ErrorKind::ReputationIssue),
    (&["rbl", "dnsbl", "spamhaus", "barracuda"], ErrorKind::ReputationIssue),
    (&["dns", "domain not found", "host not found"], ErrorKind::DnsError),
    (&["network", "connection", "timeout", "unreachable"], ErrorKind::NetworkError),
    (&["content", "filtered", "policy", "virus"], ErrorKind::ContentFiltered),
    (&["attachment", "file type", "malware"], ErrorKind::ContentFiltered),
    (&["mailbox full", "quota exceeded", "over quota"], ErrorKind::MailboxFull),
    (&["mailbox unavailable", "mailbox disabled"], ErrorKind::MailboxUnavailable),
    (&["user unknown", "no such user", "invalid recipient"], ErrorKind::InvalidRecipient),
    (&["server error", "internal error", "service unavailable"], ErrorKind::ServerError),
    (&["maintenance", "temporarily unavailable"], ErrorKind::ServerMaintenance),
    (&["tls", "ssl", "certificate", "encryption"], ErrorKind::TlsError),
    (&["syntax error", "protocol error", "invalid format"], ErrorKind::FormatError),
    (&["message too large", "size limit"], ErrorKind::MessageTooLarge),
];

/// Broad grouping of error kinds for dashboards and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    None,
    Authentication,
    RateLimiting,
    Reputation,
    Connectivity,
    Content,
    Recipient,
    Server,
    Security,
    Format,
    Temporary,
    Permanent,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::None => "none",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimiting => "rate_limiting",
            ErrorCategory::Reputation => "reputation",
            ErrorCategory::Connectivity => "connectivity",
            ErrorCategory::Content => "content",
            ErrorCategory::Recipient => "recipient",
            ErrorCategory::Server => "server",
            ErrorCategory::Security => "security",
            ErrorCategory::Format => "format",
            ErrorCategory::Temporary => "temporary",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Result of classifying one transport response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub backoff_seconds: u64,
    pub max_retries: u32,
    pub category: ErrorCategory,
    pub transport_code: u16,
    pub transport_message: String,
}

impl Classification {
    pub fn is_success(&self) -> bool {
        self.kind == ErrorKind::Success
    }

    /// When an external retry trigger may re-attempt, or `None` if it must not.
    pub fn next_retry_at(&self, attempted_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.retryable
            .then(|| attempted_at + Duration::seconds(self.backoff_seconds as i64))
    }

    /// Build the error recorded on a failed attempt.
    pub fn into_delivery_error(self) -> DeliveryError {
        DeliveryError {
            kind: self.kind,
            retryable: self.retryable,
            details: json!({
                "transport_code": self.transport_code,
                "transport_message": self.transport_message,
                "category": self.category.to_string(),
                "backoff_seconds": self.backoff_seconds,
                "max_retries": self.max_retries,
            }),
            message: self.transport_message,
        }
    }
}

/// Classify a transport code and its accompanying text.
pub fn classify(code: u16, message: &str) -> Classification {
    let mut kind = kind_for_code(code);
    if kind == ErrorKind::TemporaryFailure {
        kind = refine(message);
    }

    let policy = policy_for(kind);
    Classification {
        kind,
        retryable: policy.retryable,
        backoff_seconds: policy.backoff_seconds,
        max_retries: policy.max_retries,
        category: category_for(kind),
        transport_code: code,
        transport_message: message.to_string(),
    }
}

/// Classify a provider error, sniffing a code from the text when none was reported.
pub fn classify_error(err: &TransportError) -> Classification {
    let code = err.code.unwrap_or_else(|| sniff_code(&err.message));
    classify(code, &err.message)
}

fn sniff_code(message: &str) -> u16 {
    ["550", "554", "451"]
        .into_iter()
        .find(|candidate| message.contains(candidate))
        .and_then(|candidate| candidate.parse().ok())
        .unwrap_or(500)
}

fn kind_for_code(code: u16) -> ErrorKind {
    match code {
        200..=299 => ErrorKind::Success,
        421 => ErrorKind::ServiceUnavailable,
        450 => ErrorKind::MailboxBusy,
        451 | 454 => ErrorKind::TemporaryFailure,
        452 => ErrorKind::InsufficientStorage,
        400..=499 => ErrorKind::TemporaryFailure,
        500 => ErrorKind::SyntaxError,
        501 => ErrorKind::ParameterError,
        502 => ErrorKind::CommandNotImplemented,
        503 => ErrorKind::BadSequence,
        504 => ErrorKind::ParameterNotImplemented,
        550 => ErrorKind::MailboxUnavailable,
        551 => ErrorKind::UserNotLocal,
        552 => ErrorKind::StorageExceeded,
        553 => ErrorKind::MailboxNameInvalid,
        554 => ErrorKind::TransactionFailed,
        500..=599 => ErrorKind::PermanentFailure,
        _ => ErrorKind::UnknownError,
    }
}

fn refine(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    REFINEMENTS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::TemporaryFailure)
}

/// Static retry policy for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retryable: bool,
    pub backoff_seconds: u64,
    pub max_retries: u32,
}

pub fn policy_for(kind: ErrorKind) -> RetryPolicy {
    let retryable = matches!(
        kind,
        ErrorKind::ServiceUnavailable
            | ErrorKind::MailboxBusy
            | ErrorKind::TemporaryFailure
            | ErrorKind::InsufficientStorage
            | ErrorKind::RateLimited
            | ErrorKind::DnsError
            | ErrorKind::NetworkError
            | ErrorKind::MailboxFull
            | ErrorKind::ServerError
            | ErrorKind::ServerMaintenance
            | ErrorKind::TlsError
            | ErrorKind::UnknownError
    );

    let backoff_seconds = match kind {
        ErrorKind::RateLimited => 300,
        ErrorKind::ServerMaintenance | ErrorKind::ServiceUnavailable => 600,
        ErrorKind::MailboxBusy | ErrorKind::InsufficientStorage => 180,
        ErrorKind::NetworkError | ErrorKind::DnsError => 120,
        ErrorKind::ServerError => 240,
        ErrorKind::TlsError => 60,
        _ => DEFAULT_BACKOFF_SECONDS,
    };

    let max_retries = match kind {
        ErrorKind::RateLimited => 5,
        ErrorKind::ServerMaintenance | ErrorKind::ServiceUnavailable => 3,
        ErrorKind::MailboxBusy => 4,
        ErrorKind::NetworkError | ErrorKind::DnsError => 3,
        ErrorKind::ServerError => 2,
        ErrorKind::TlsError => 2,
        ErrorKind::InsufficientStorage | ErrorKind::MailboxFull => 2,
        _ => DEFAULT_MAX_RETRIES,
    };

    RetryPolicy {
        retryable,
        backoff_seconds,
        max_retries,
    }
}

pub fn category_for(kind: ErrorKind) -> ErrorCategory {
    match kind {
        ErrorKind::Success => ErrorCategory::None,
        ErrorKind::AuthFailed => ErrorCategory::Authentication,
        ErrorKind::RateLimited => ErrorCategory::RateLimiting,
        ErrorKind::ReputationIssue => ErrorCategory::Reputation,
        ErrorKind::DnsError | ErrorKind::NetworkError => ErrorCategory::Connectivity,
        ErrorKind::ContentFiltered => ErrorCategory::Content,
        ErrorKind::MailboxFull | ErrorKind::MailboxUnavailable | ErrorKind::InvalidRecipient => {
            ErrorCategory::Recipient
        }
        ErrorKind::ServerError | ErrorKind::ServerMaintenance | ErrorKind::ServiceUnavailable => {
            ErrorCategory::Server
        }
        ErrorKind::TlsError => ErrorCategory::Security,
        ErrorKind::FormatError | ErrorKind::SyntaxError | ErrorKind::MessageTooLarge => {
            ErrorCategory::Format
        }
        ErrorKind::TemporaryFailure => ErrorCategory::Temporary,
        ErrorKind::PermanentFailure => ErrorCategory::Permanent,
        _ => ErrorCategory::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_codes() {
        let c = classify(250, "OK");
        assert!(c.is_success());
        assert!(!c.retryable);
        assert_eq!(c.category, ErrorCategory::None);
    }

    #[test]
    fn test_code_table() {
        let cases = [
            (421, ErrorKind::ServiceUnavailable, true),
            (450, ErrorKind::MailboxBusy, true),
            (452, ErrorKind::InsufficientStorage, true),
            (500, ErrorKind::SyntaxError, false),
            (501, ErrorKind::ParameterError, false),
            (502, ErrorKind::CommandNotImplemented, false),
            (503, ErrorKind::BadSequence, false),
            (504, ErrorKind::ParameterNotImplemented, false),
            (550, ErrorKind::MailboxUnavailable, false),
            (551, ErrorKind::UserNotLocal, false),
            (552, ErrorKind::StorageExceeded, false),
            (553, ErrorKind::MailboxNameInvalid, false),
            (554, ErrorKind::TransactionFailed, false),
            (599, ErrorKind::PermanentFailure, false),
            (999, ErrorKind::UnknownError, true),
        ];
        for (code, kind, retryable) in cases {
            let c = classify(code, "");
            assert_eq!(c.kind, kind, "code {code}");
            assert_eq!(c.retryable, retryable, "code {code}");
        }
    }

    #[test]
    fn test_unmatched_temporary_failure_stays_retryable() {
        let c = classify(451, "try again later");
        assert_eq!(c.kind, ErrorKind::TemporaryFailure);
        assert!(c.retryable);
        assert_eq!(c.backoff_seconds, 60);
        assert_eq!(c.max_retries, 1);
        assert_eq!(c.category, ErrorCategory::Temporary);
    }

    #[test]
    fn test_rate_limit_refinement() {
        let c = classify(451, "Too many messages, slow down");
        assert_eq!(c.kind, ErrorKind::RateLimited);
        assert!(c.retryable);
        assert_eq!(c.backoff_seconds, 300);
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.category, ErrorCategory::RateLimiting);
    }

    #[test]
    fn test_auth_precedes_rate_limit() {
        let c = classify(451, "Authentication quota reached");
        assert_eq!(c.kind, ErrorKind::AuthFailed);
        assert!(!c.retryable);
    }

    #[test]
    fn test_refinement_only_applies_to_temporary_failure() {
        // 550 is permanent no matter what the text says
        let c = classify(550, "rate limit exceeded");
        assert_eq!(c.kind, ErrorKind::MailboxUnavailable);
        assert!(!c.retryable);

        let c = classify(421, "authentication required");
        assert_eq!(c.kind, ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn test_refinement_is_case_insensitive() {
        assert_eq!(classify(454, "DNS lookup failed").kind, ErrorKind::DnsError);
        assert_eq!(classify(454, "Connection reset").kind, ErrorKind::NetworkError);
        assert_eq!(classify(454, "Listed on SPAMHAUS").kind, ErrorKind::ReputationIssue);
        assert_eq!(classify(454, "Server Maintenance window").kind, ErrorKind::ServerMaintenance);
        assert_eq!(classify(454, "Message too large").kind, ErrorKind::MessageTooLarge);
    }

    #[test]
    fn test_recipient_and_content_refinements() {
        let cases = [
            ("Rejected by content policy", ErrorKind::ContentFiltered, ErrorCategory::Content, false),
            ("Attachment file type not allowed", ErrorKind::ContentFiltered, ErrorCategory::Content, false),
            ("Mailbox full, try later", ErrorKind::MailboxFull, ErrorCategory::Recipient, true),
            ("Mailbox unavailable", ErrorKind::MailboxUnavailable, ErrorCategory::Recipient, false),
            ("Mailbox disabled by owner", ErrorKind::MailboxUnavailable, ErrorCategory::Recipient, false),
            ("No such user here", ErrorKind::InvalidRecipient, ErrorCategory::Recipient, false),
            ("Invalid recipient address", ErrorKind::InvalidRecipient, ErrorCategory::Recipient, false),
        ];
        for (text, kind, category, retryable) in cases {
            let c = classify(451, text);
            assert_eq!(c.kind, kind, "{text}");
            assert_eq!(c.category, category, "{text}");
            assert_eq!(c.retryable, retryable, "{text}");
        }

        let full = classify(451, "mailbox full");
        assert_eq!(full.max_retries, 2);
        assert_eq!(full.backoff_seconds, 60);
    }

    #[test]
    fn test_server_security_and_format_refinements() {
        let c = classify(451, "Internal error, please retry");
        assert_eq!(c.kind, ErrorKind::ServerError);
        assert!(c.retryable);
        assert_eq!(c.backoff_seconds, 240);
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.category, ErrorCategory::Server);

        let c = classify(454, "Certificate verify failed");
        assert_eq!(c.kind, ErrorKind::TlsError);
        assert!(c.retryable);
        assert_eq!(c.backoff_seconds, 60);
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.category, ErrorCategory::Security);
        assert_eq!(classify(454, "STARTTLS required").kind, ErrorKind::TlsError);

        let c = classify(451, "Syntax error in command");
        assert_eq!(c.kind, ErrorKind::FormatError);
        assert!(!c.retryable);
        assert_eq!(c.category, ErrorCategory::Format);
        assert_eq!(classify(451, "invalid format").kind, ErrorKind::FormatError);
    }

    #[test]
    fn test_first_matching_refinement_wins() {
        let c = classify(451, "rate limit hit after server error");
        assert_eq!(c.kind, ErrorKind::RateLimited);
        assert_eq!(c.category, ErrorCategory::RateLimiting);
    }

    #[test]
    fn test_code_range_sweep() {
        for code in 400..=499u16 {
            let c = classify(code, "");
            assert!(c.retryable, "code {code}");
            assert!(
                matches!(
                    c.category,
                    ErrorCategory::Server | ErrorCategory::Temporary | ErrorCategory::Unknown
                ),
                "code {code}"
            );
        }
        for code in 500..=599u16 {
            let c = classify(code, "");
            assert!(!c.retryable, "code {code}");
            assert!(c.next_retry_at(Utc::now()).is_none(), "code {code}");
        }
    }

    #[test]
    fn test_classification_is_deterministic() {
        assert_eq!(
            classify(451, "mailbox full for user"),
            classify(451, "mailbox full for user")
        );
    }

    #[test]
    fn test_classify_error_sniffs_code() {
        let c = classify_error(&TransportError::uncoded("remote said 550 no such mailbox"));
        assert_eq!(c.transport_code, 550);
        assert_eq!(c.kind, ErrorKind::MailboxUnavailable);

        let c = classify_error(&TransportError::uncoded("451 greylisted"));
        assert_eq!(c.kind, ErrorKind::TemporaryFailure);

        let c = classify_error(&TransportError::uncoded("something odd"));
        assert_eq!(c.transport_code, 500);
        assert_eq!(c.kind, ErrorKind::SyntaxError);
    }

    #[test]
    fn test_into_delivery_error_details() {
        let err = classify(421, "busy").into_delivery_error();
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
        assert_eq!(err.details["transport_code"], 421);
        assert_eq!(err.details["category"], "server");
        assert_eq!(err.details["backoff_seconds"], 600);
        assert_eq!(err.details["max_retries"], 3);
    }

    #[test]
    fn test_next_retry_at() {
        let now = Utc::now();
        assert_eq!(
            classify(450, "").next_retry_at(now),
            Some(now + Duration::seconds(180))
        );
        assert_eq!(classify(550, "").next_retry_at(now), None);
    }
}
