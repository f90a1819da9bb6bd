//! Local cache capability traits.
//!
//! The local store mirrors remote folders and holds the durable log of
//! pending remote mutations. All methods are blocking.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::flag::Flag;
use crate::message::Message;
use crate::remote::UidMap;
use crate::uid;

/// One entry of the pending-command log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    /// Store-assigned identifier, increasing in append order.
    pub id: u64,
    /// Command name.
    pub command: String,
    /// Ordered string arguments.
    pub args: Vec<String>,
}

/// The local persistent mirror for one account.
pub trait LocalStore: Send + Sync {
    /// Returns a handle for the named folder. The folder need not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn folder(&self, name: &str) -> Result<Arc<dyn LocalFolder>>;

    /// Names of existing local folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn folders(&self) -> Result<Vec<String>>;

    /// Deletes a folder and its messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn delete_folder(&self, name: &str) -> Result<()>;

    /// Returns the pending-command log in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    fn pending_commands(&self) -> Result<Vec<PendingRecord>>;

    /// Appends a command to the pending log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn add_pending_command(&self, command: &str, args: Vec<String>) -> Result<PendingRecord>;

    /// Removes one entry from the pending log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn remove_pending_command(&self, id: u64) -> Result<()>;

    /// Empties the pending log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn remove_all_pending_commands(&self) -> Result<()>;

    /// Storage used, in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn size(&self) -> Result<u64>;

    /// Reclaims space left by deleted messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn compact(&self) -> Result<()>;

    /// Removes every cached message while keeping folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn clear(&self) -> Result<()>;

    /// Resets every folder's visible limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn reset_visible_limits(&self, limit: usize) -> Result<()>;

    /// Returns false when the backing medium is not mounted.
    fn is_available(&self) -> bool {
        true
    }
}

/// A folder in the local store.
pub trait LocalFolder: Send + Sync {
    /// Folder name.
    fn name(&self) -> &str;

    /// Returns true if the folder exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn exists(&self) -> Result<bool>;

    /// Creates the folder. Returns false if it already existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn create(&self) -> Result<bool>;

    /// All messages in the folder, including ones marked deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn messages(&self) -> Result<Vec<Message>>;

    /// Looks up one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn message(&self, uid: &str) -> Result<Option<Message>>;

    /// Inserts or replaces a message by UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn store(&self, message: &Message) -> Result<()>;

    /// Sets or clears flags on a batch of messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn set_flags(&self, uids: &[String], flags: &[Flag], value: bool) -> Result<()>;

    /// Sets or clears flags on every message.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn set_flags_all(&self, flags: &[Flag], value: bool) -> Result<()>;

    /// Physically removes a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn destroy(&self, uid: &str) -> Result<()>;

    /// Rewrites a message's UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn change_uid(&self, old: &str, new: &str) -> Result<()>;

    /// Visible limit. `None` means the account default, `Some(0)` unlimited.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn visible_limit(&self) -> Result<Option<usize>>;

    /// Stores the visible limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn set_visible_limit(&self, limit: Option<usize>) -> Result<()>;

    /// Time of the last successful or failed poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn last_checked(&self) -> Result<Option<DateTime<Utc>>>;

    /// Stores the last-checked time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn set_last_checked(&self, at: DateTime<Utc>) -> Result<()>;

    /// Time of the last push-driven update.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn last_push(&self) -> Result<Option<DateTime<Utc>>>;

    /// Stores the last-push time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn set_last_push(&self, at: DateTime<Utc>) -> Result<()>;

    /// Last error shown for this folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn status(&self) -> Result<Option<String>>;

    /// Stores or clears the folder status.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn set_status(&self, status: Option<&str>) -> Result<()>;

    /// Opaque push resume token.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn push_state(&self) -> Result<Option<String>>;

    /// Stores the push resume token.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn set_push_state(&self, state: Option<&str>) -> Result<()>;

    /// Count of messages that are neither seen nor deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn unread_count(&self) -> Result<usize> {
        Ok(self
            .messages()?
            .iter()
            .filter(|m| !m.flags.is_seen() && !m.flags.is_deleted())
            .count())
    }

    /// Count of flagged messages that are not deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn flagged_count(&self) -> Result<usize> {
        Ok(self
            .messages()?
            .iter()
            .filter(|m| m.flags.is_flagged() && !m.flags.is_deleted())
            .count())
    }

    /// Copies messages into `dest` under fresh local UIDs.
    ///
    /// Returns a map from source UID to the UID of the copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn copy_messages(&self, uids: &[String], dest: &dyn LocalFolder) -> Result<UidMap> {
        let mut map = UidMap::new();
        for source in uids {
            let Some(message) = self.message(source)? else {
                continue;
            };
            let copy_uid = uid::new_local();
            dest.store(&message.with_uid(copy_uid.clone()))?;
            map.insert(source.clone(), copy_uid);
        }
        Ok(map)
    }

    /// Moves messages into `dest` under fresh local UIDs.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn move_messages(&self, uids: &[String], dest: &dyn LocalFolder) -> Result<UidMap> {
        let map = self.copy_messages(uids, dest)?;
        for source in map.keys() {
            self.destroy(source)?;
        }
        Ok(map)
    }
}
