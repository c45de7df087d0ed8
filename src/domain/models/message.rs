//! Mailbox message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::Importance;

/// A message as materialized in the `messages` projection.
///
/// The message id is the sequence number of the originating `message_sent`
/// event, which keeps ids stable across projection rebuilds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub project_key: String,
    pub from_agent: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-recipient delivery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub message_id: i64,
    pub agent: String,
    pub read_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
}

/// Inbox view of a message. Bodies are deliberately absent: agents fetch
/// them one at a time through `read_message` to protect their context
/// windows.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub id: i64,
    pub from_agent: String,
    pub subject: String,
    pub thread_id: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}
