//! Immutable message snapshots.
//!
//! Backends hand out [`Message`] values and accept them back. A message is
//! never mutated in place across threads; changes produce a new snapshot via
//! the `with_*` builders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flag::{Flag, FlagSet};

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Display name.
    pub name: Option<String>,
    /// Email address.
    pub email: String,
}

impl Address {
    /// Creates an address without a display name.
    #[must_use]
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Creates an address with a display name.
    #[must_use]
    pub fn named(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Returns the display name, falling back to the address.
    #[must_use]
    pub fn display(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.email)
    }
}

/// One MIME body part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Part identifier within the message, e.g. `1.2`.
    pub id: String,
    /// MIME content type.
    pub mime_type: String,
    /// Size of the part in bytes.
    pub size: u64,
    /// Decoded content, if downloaded.
    pub content: Option<String>,
}

impl Part {
    /// Returns true for parts a reader displays inline.
    #[must_use]
    pub fn is_viewable(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        mime == "text/plain" || mime == "text/html"
    }
}

/// A snapshot of one message as known to a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server UID or local placeholder.
    pub uid: String,
    /// Message flags.
    pub flags: FlagSet,
    /// Total size in bytes.
    pub size: u64,
    /// Date the server received the message.
    pub internal_date: Option<DateTime<Utc>>,
    /// `Message-ID` header.
    pub message_id: Option<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Sender addresses.
    pub from: Vec<Address>,
    /// Recipient addresses.
    pub to: Vec<Address>,
    /// MIME structure. Empty when the structure is unknown.
    pub parts: Vec<Part>,
    /// Text body, complete or truncated depending on the download flag.
    pub body: Option<String>,
}

impl Message {
    /// Creates an empty message with the given UID.
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    /// Returns a copy with a different UID.
    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    /// Returns a copy with the flag set or cleared.
    #[must_use]
    pub fn with_flag(mut self, flag: Flag, value: bool) -> Self {
        self.flags.set(flag, value);
        self
    }

    /// Returns true if the message is older than the cutoff.
    ///
    /// Messages without an internal date are never considered old.
    #[must_use]
    pub fn is_older_than(&self, cutoff: Option<DateTime<Utc>>) -> bool {
        match (self.internal_date, cutoff) {
            (Some(date), Some(cutoff)) => date < cutoff,
            _ => false,
        }
    }

    /// Returns true when the envelope fields needed to list the message exist.
    #[must_use]
    pub fn has_envelope(&self) -> bool {
        self.subject.is_some() && !self.from.is_empty()
    }

    /// Returns the first sender, if any.
    #[must_use]
    pub fn sender(&self) -> Option<&Address> {
        self.from.first()
    }

    /// Returns a short plain-text preview of the body.
    #[must_use]
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.body.as_deref().or_else(|| {
            self.parts
                .iter()
                .filter(|p| p.is_viewable())
                .find_map(|p| p.content.as_deref())
        });
        text.unwrap_or_default()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(max_chars)
            .collect()
    }
}
