//! Message and per-channel content validation.

use thiserror::Error;
use uuid::Uuid;

use std::collections::HashSet;

use courier_common::types::{Channel, ErrorKind, Message, MessageContent, Recipient};

/// Longest plain-text body an SMS may carry.
pub const SMS_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message subject cannot be empty")]
    EmptySubject,

    #[error("message content cannot be empty")]
    EmptyBody,

    #[error("message must have at least one recipient")]
    NoRecipients,

    #[error("recipient at position {0} has no user id")]
    MissingUserId(usize),
}

/// Content that a specific channel cannot carry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ContentError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Reject messages that cannot be dispatched at all.
pub fn validate_message(message: &Message) -> Result<(), ValidationError> {
    if message.content.subject.trim().is_empty() {
        return Err(ValidationError::EmptySubject);
    }
    if message.content.plain_text.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    if message.recipients.is_empty() {
        return Err(ValidationError::NoRecipients);
    }

    if let Some(position) = message.recipients.iter().position(|r| r.user_id.is_nil()) {
        return Err(ValidationError::MissingUserId(position));
    }
    Ok(())
}

/// Drop repeated recipients, keeping the first entry for each user.
///
/// Returns the number of entries removed.
pub fn dedup_recipients(recipients: &mut Vec<Recipient>) -> usize {
    let before = recipients.len();
    let mut seen: HashSet<Uuid> = HashSet::with_capacity(before);
    recipients.retain(|r| seen.insert(r.user_id));
    before - recipients.len()
}

/// Check that `content` fits `channel`. Failures are permanent for that attempt.
pub fn validate_content(content: &MessageContent, channel: Channel) -> Result<(), ContentError> {
    match channel {
        Channel::Email => {
            if content.subject.trim().is_empty() || content.plain_text.trim().is_empty() {
                return Err(ContentError {
                    kind: ErrorKind::FormatError,
                    message: "email requires a subject and a body".to_string(),
                });
            }
        }
        Channel::Sms => {
            let length = content.plain_text.chars().count();
            if length > SMS_MAX_CHARS {
                return Err(ContentError {
                    kind: ErrorKind::MessageTooLarge,
                    message: format!(
                        "SMS content too long ({length} characters, max {SMS_MAX_CHARS})"
                    ),
                });
            }
        }
        Channel::Push | Channel::Webhook => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::{MessageType, Recipient};

    fn make_message(subject: &str, body: &str, recipients: Vec<Recipient>) -> Message {
        Message::new(
            MessageType::CommentNotification,
            MessageContent {
                subject: subject.to_string(),
                plain_text: body.to_string(),
                ..Default::default()
            },
            recipients,
        )
    }

    #[test]
    fn test_valid_message() {
        let msg = make_message("Hi", "Body", vec![Recipient::new(Uuid::new_v4())]);
        assert!(validate_message(&msg).is_ok());
    }

    #[test]
    fn test_rejects_missing_fields() {
        let one = vec![Recipient::new(Uuid::new_v4())];
        assert_eq!(
            validate_message(&make_message("", "Body", one.clone())),
            Err(ValidationError::EmptySubject)
        );
        assert_eq!(
            validate_message(&make_message("Hi", "  ", one)),
            Err(ValidationError::EmptyBody)
        );
        assert_eq!(
            validate_message(&make_message("Hi", "Body", vec![])),
            Err(ValidationError::NoRecipients)
        );
        assert_eq!(
            validate_message(&make_message("Hi", "Body", vec![Recipient::new(Uuid::nil())])),
            Err(ValidationError::MissingUserId(0))
        );
    }

    #[test]
    fn test_duplicate_recipients_are_valid_and_collapsed() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut msg = make_message(
            "Hi",
            "Body",
            vec![Recipient::new(id), Recipient::new(other), Recipient::new(id)],
        );
        assert!(validate_message(&msg).is_ok());

        assert_eq!(dedup_recipients(&mut msg.recipients), 1);
        let ids: Vec<Uuid> = msg.recipients.iter().map(|r| r.user_id).collect();
        assert_eq!(ids, vec![id, other]);
        assert_eq!(dedup_recipients(&mut msg.recipients), 0);
    }

    #[test]
    fn test_sms_length_counts_characters() {
        let mut content = MessageContent {
            subject: "s".into(),
            plain_text: "ü".repeat(SMS_MAX_CHARS),
            ..Default::default()
        };
        assert!(validate_content(&content, Channel::Sms).is_ok());

        content.plain_text.push('!');
        let err = validate_content(&content, Channel::Sms).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MessageTooLarge);

        // Other channels do not care about length
        assert!(validate_content(&content, Channel::Push).is_ok());
    }
}
