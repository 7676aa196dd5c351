use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column width of `email_queue.sender`.
pub const MAX_SENDER_LEN: usize = 255;
/// Upper bound on the stored failure text.
pub const MAX_ERROR_MESSAGE_LEN: usize = 65_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// `sent` and `failed` rows never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

/// One row of the relay queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub sender: String,
    pub recipients: String,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl QueuedMessage {
    /// Splits the stored comma-joined recipients into trimmed, non-empty addresses.
    pub fn recipient_list(&self) -> Vec<String> {
        self.recipients
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn delivered(&self, at: DateTime<Utc>) -> Transition {
        Transition::Sent { at }
    }

    /// Counts the failed attempt and decides between another retry and giving up.
    pub fn delivery_failed(&self, at: DateTime<Utc>, error: &str, max_attempts: u32) -> Transition {
        let attempt_count = self.attempt_count.saturating_add(1).min(max_attempts);
        let error_message = truncate_chars(error, MAX_ERROR_MESSAGE_LEN).to_string();

        if attempt_count >= max_attempts {
            Transition::Failed {
                attempt_count,
                at,
                error_message,
            }
        } else {
            Transition::Retry {
                attempt_count,
                at,
                error_message,
            }
        }
    }
}

/// A message accepted at the enqueue boundary, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: String,
    pub recipients: String,
    pub body: Vec<u8>,
}

impl NewMessage {
    pub fn new(sender: &str, recipients: &[String], body: Vec<u8>) -> Self {
        Self {
            sender: truncate_chars(sender, MAX_SENDER_LEN).to_string(),
            recipients: recipients.join(", "),
            body,
        }
    }

    pub fn has_recipients(&self) -> bool {
        self.recipients.split(',').any(|r| !r.trim().is_empty())
    }
}

/// A state change applied to a claimed `pending` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Sent {
        at: DateTime<Utc>,
    },
    Retry {
        attempt_count: u32,
        at: DateTime<Utc>,
        error_message: String,
    },
    Failed {
        attempt_count: u32,
        at: DateTime<Utc>,
        error_message: String,
    },
}

impl Transition {
    pub fn status(&self) -> MessageStatus {
        match self {
            Transition::Sent { .. } => MessageStatus::Sent,
            Transition::Retry { .. } => MessageStatus::Pending,
            Transition::Failed { .. } => MessageStatus::Failed,
        }
    }

    pub fn attempted_at(&self) -> DateTime<Utc> {
        match self {
            Transition::Sent { at }
            | Transition::Retry { at, .. }
            | Transition::Failed { at, .. } => *at,
        }
    }

    /// Applies the change to an in-memory copy of the row.
    ///
    /// `error_message` is left untouched on success.
    pub fn apply(&self, message: &mut QueuedMessage) {
        message.status = self.status();
        message.last_attempt_at = Some(self.attempted_at());
        match self {
            Transition::Sent { .. } => {}
            Transition::Retry {
                attempt_count,
                error_message,
                ..
            }
            | Transition::Failed {
                attempt_count,
                error_message,
                ..
            } => {
                message.attempt_count = *attempt_count;
                message.error_message = Some(error_message.clone());
            }
        }
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Cuts `value` to at most `max` characters without splitting a code point.
pub fn truncate_chars(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
