use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::constants::{BODY_HTML_PREVIEW_LIMIT, BODY_TEXT_PREVIEW_LIMIT};

/// The unit appended to the main stream: a bounded header+preview projection
/// of an email, never a full RFC 822 parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub uid: u64,
    pub uidvalidity: u64,
    pub mailbox: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub message_id: Option<String>,
    pub size: u64,
    pub headers: HashMap<String, String>,
    pub body_text_preview: String,
    pub body_html_preview: String,
    pub fetched_at: DateTime<Utc>,
}

impl EmailRecord {
    /// The idempotency key for this record: `message_id` when present, else
    /// the caller must fall back to the stream entry id.
    pub fn fingerprint(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Truncates body previews to the fixed bounds. Applied once at
    /// construction time so every record that reaches the stream already
    /// satisfies the size invariant.
    pub fn with_truncated_previews(mut self) -> Self {
        truncate_in_place(&mut self.body_text_preview, BODY_TEXT_PREVIEW_LIMIT);
        truncate_in_place(&mut self.body_html_preview, BODY_HTML_PREVIEW_LIMIT);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Truncates to at most `limit` chars, respecting UTF-8 boundaries.
fn truncate_in_place(s: &mut String, limit: usize) {
    if s.chars().count() <= limit {
        return;
    }
    let truncated: String = s.chars().take(limit).collect();
    *s = truncated;
}

/// The shape appended to the DLQ stream when an entry is given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub original_entry_id: String,
    pub failed_at: DateTime<Utc>,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    pub original_data: String,
    pub metadata: Option<String>,
}

impl DlqRecord {
    pub fn new(
        original_entry_id: impl Into<String>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        retry_count: u32,
        original_data: impl Into<String>,
    ) -> Self {
        Self {
            original_entry_id: original_entry_id.into(),
            failed_at: Utc::now(),
            error_type: error_type.into(),
            error_message: error_message.into(),
            retry_count,
            original_data: original_data.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}
