//! Controller and account configuration.
//!
//! Both structs deserialize from JSON with every field optional, so a
//! settings file only needs the values that differ from the defaults.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::error::Result;

/// Visible limit used when a folder has none stored.
pub const DEFAULT_VISIBLE_LIMIT: usize = 25;

/// Messages at or above this size are downloaded partially.
pub const DEFAULT_MAX_AUTO_DOWNLOAD_SIZE: u64 = 25 * 1024;

/// Send attempts before a message is left in the outbox.
pub const MAX_SEND_ATTEMPTS: u32 = 5;

/// Controller-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Delay before re-running a command that hit unavailable storage.
    #[serde(with = "duration_secs")]
    pub command_retry_delay: Duration,
    /// Send attempts per outbox message before it is left alone.
    pub max_send_attempts: u32,
    /// Threads for fire-and-forget operations.
    pub pool_size: usize,
    /// Buffer of the broadcast event channel.
    pub event_capacity: usize,
    /// Whether failures are recorded as messages in the error folder.
    pub error_folder_enabled: bool,
    /// Age after which error-folder messages are cleared.
    #[serde(with = "duration_secs")]
    pub error_retention: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            command_retry_delay: Duration::from_secs(30),
            max_send_attempts: MAX_SEND_ATTEMPTS,
            pool_size: 4,
            event_capacity: 256,
            error_folder_enabled: true,
            error_retention: Duration::from_secs(15 * 60),
        }
    }
}

impl ControllerConfig {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a configuration file, falling back to defaults if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Server protocol family of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Protocol {
    /// IMAP.
    #[default]
    Imap,
    /// POP3.
    Pop3,
    /// WebDAV (Exchange).
    WebDav,
}

impl Protocol {
    /// Returns true for protocols without reliable seen-state on the server.
    #[must_use]
    pub const fn is_legacy(self) -> bool {
        matches!(self, Self::Pop3 | Self::WebDav)
    }
}

/// What deleting a message does on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeletePolicy {
    /// Leave the server copy alone.
    Never,
    /// Delete (or move to trash) on the server.
    #[default]
    OnDelete,
    /// Only mark the server copy as read.
    MarkAsRead,
}

/// When deleted messages are expunged on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExpungePolicy {
    /// Right after each move or delete.
    #[default]
    Immediately,
    /// At the start of every poll.
    OnPoll,
    /// Only on explicit request.
    Manually,
}

/// Per-account settings.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Account identifier.
    pub id: AccountId,
    /// Display name.
    pub description: String,
    /// Primary address.
    pub email: String,
    /// Further addresses belonging to the account owner.
    pub identities: Vec<String>,
    /// Server protocol.
    pub protocol: Protocol,
    /// Inbox folder name.
    pub inbox_folder: String,
    /// Local-only folder holding unsent messages.
    pub outbox_folder: String,
    /// Drafts folder name.
    pub drafts_folder: Option<String>,
    /// Sent folder name.
    pub sent_folder: Option<String>,
    /// Trash folder name.
    pub trash_folder: Option<String>,
    /// Spam folder name.
    pub spam_folder: Option<String>,
    /// Local-only folder collecting failure reports.
    pub error_folder: String,
    /// Default visible limit and the step for loading more messages.
    pub display_count: usize,
    /// Messages larger than this many bytes are downloaded partially.
    pub max_auto_download_size: u64,
    /// Ignore server messages older than this many days.
    pub max_polled_message_age_days: Option<u32>,
    /// Remove local messages that disappeared from the server.
    pub sync_remote_deletions: bool,
    /// What deleting does on the server.
    pub delete_policy: DeletePolicy,
    /// When the server expunges.
    pub expunge_policy: ExpungePolicy,
    /// Show new-mail notifications.
    pub notify_new_mail: bool,
    /// Notify for messages sent from the account's own identities.
    pub notify_self: bool,
    /// For legacy protocols, ignore messages older than this when notifying.
    pub notify_only_newer_than: Option<DateTime<Utc>>,
    /// Minutes between automatic checks. `None` disables polling.
    pub check_interval_minutes: Option<u32>,
    /// Folders to subscribe to with push. `None` means every folder.
    pub push_folders: Option<Vec<String>>,
    /// Upper bound on pushed folders.
    pub max_push_folders: usize,
    /// Folders polled by check-mail. `None` means every local folder.
    pub sync_folders: Option<Vec<String>>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            id: AccountId(0),
            description: String::new(),
            email: String::new(),
            identities: Vec::new(),
            protocol: Protocol::default(),
            inbox_folder: "INBOX".to_string(),
            outbox_folder: "Outbox".to_string(),
            drafts_folder: Some("Drafts".to_string()),
            sent_folder: Some("Sent".to_string()),
            trash_folder: Some("Trash".to_string()),
            spam_folder: Some("Spam".to_string()),
            error_folder: "Errors".to_string(),
            display_count: DEFAULT_VISIBLE_LIMIT,
            max_auto_download_size: DEFAULT_MAX_AUTO_DOWNLOAD_SIZE,
            max_polled_message_age_days: None,
            sync_remote_deletions: true,
            delete_policy: DeletePolicy::default(),
            expunge_policy: ExpungePolicy::default(),
            notify_new_mail: true,
            notify_self: false,
            notify_only_newer_than: None,
            check_interval_minutes: Some(15),
            push_folders: None,
            max_push_folders: 10,
            sync_folders: None,
        }
    }
}

impl AccountConfig {
    /// Creates a configuration with defaults for the given account.
    #[must_use]
    pub fn new(id: AccountId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            ..Self::default()
        }
    }

    /// Server messages received before this instant are ignored.
    #[must_use]
    pub fn earliest_poll_date(&self) -> Option<DateTime<Utc>> {
        self.max_polled_message_age_days
            .map(|days| Utc::now() - chrono::Duration::days(i64::from(days)))
    }

    /// Polling interval, if polling is enabled.
    #[must_use]
    pub fn check_interval(&self) -> Option<chrono::Duration> {
        self.check_interval_minutes
            .filter(|m| *m > 0)
            .map(|m| chrono::Duration::minutes(i64::from(m)))
    }

    /// Returns true if `folder` is the inbox.
    #[must_use]
    pub fn is_inbox(&self, folder: &str) -> bool {
        folder.eq_ignore_ascii_case(&self.inbox_folder)
    }

    /// Returns true if `folder` is the trash folder.
    #[must_use]
    pub fn is_trash(&self, folder: &str) -> bool {
        self.trash_folder.as_deref() == Some(folder)
    }

    /// Returns true for trash, sent and drafts, which are created on demand.
    #[must_use]
    pub fn is_special(&self, folder: &str) -> bool {
        [&self.trash_folder, &self.sent_folder, &self.drafts_folder]
            .into_iter()
            .any(|f| f.as_deref() == Some(folder))
    }

    /// Returns true for folders that only exist locally.
    #[must_use]
    pub fn is_local_only(&self, folder: &str) -> bool {
        folder == self.outbox_folder || folder == self.error_folder
    }

    /// Returns true for folders whose new messages never notify.
    #[must_use]
    pub fn is_quiet(&self, folder: &str) -> bool {
        if self.is_inbox(folder) {
            return false;
        }
        [
            &self.trash_folder,
            &self.drafts_folder,
            &self.spam_folder,
            &self.sent_folder,
        ]
        .into_iter()
        .any(|f| f.as_deref() == Some(folder))
    }

    /// Returns true if `address` belongs to the account owner.
    #[must_use]
    pub fn is_identity(&self, address: &str) -> bool {
        address.eq_ignore_ascii_case(&self.email)
            || self
                .identities
                .iter()
                .any(|id| id.eq_ignore_ascii_case(address))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
