//! Remote capability traits.
//!
//! These are the operations the controller needs from a mail server
//! backend. Every method is blocking; the controller calls them from its
//! worker thread or its blocking pool, never from an async context.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::message::{Message, Part};
use crate::profile::FetchProfile;

/// Map from a message's old UID to the UID it received in the destination.
pub type UidMap = HashMap<String, String>;

/// Mode a remote folder is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    ReadWrite,
}

/// Optional features a store supports.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Server-initiated push is available.
    pub push: bool,
    /// Messages can be copied server-side.
    pub copy: bool,
    /// Messages can be moved server-side.
    pub move_messages: bool,
    /// Flags can be stored server-side.
    pub store_flags: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            push: false,
            copy: true,
            move_messages: true,
            store_flags: true,
        }
    }
}

/// A remote mail store.
pub trait Store: Send + Sync {
    /// Returns a handle for the named folder. The folder need not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot produce a handle.
    fn folder(&self, name: &str) -> Result<Box<dyn RemoteFolder>>;

    /// Lists folder names on the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn list_folders(&self) -> Result<Vec<String>>;

    /// Returns the optional features this store supports.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Creates a pusher that reports to `receiver`.
    ///
    /// Returns `Ok(None)` for stores without push support.
    ///
    /// # Errors
    ///
    /// Returns an error if the pusher cannot be created.
    fn pusher(&self, receiver: Arc<dyn PushReceiver>) -> Result<Option<Box<dyn Pusher>>> {
        let _ = receiver;
        Ok(None)
    }

    /// Classifies an error raised while replaying a pending command.
    ///
    /// Permanent failures are discarded from the pending log instead of
    /// blocking it forever.
    fn is_permanent_failure(&self, error: &Error) -> bool {
        error.is_permanent()
    }
}

/// A folder on a remote store.
pub trait RemoteFolder: Send {
    /// Folder name.
    fn name(&self) -> &str;

    /// Returns true if the folder exists on the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be queried.
    fn exists(&self) -> Result<bool>;

    /// Creates the folder. Returns false if the server refused.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    fn create(&self) -> Result<bool>;

    /// Opens the folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be opened.
    fn open(&mut self, mode: OpenMode) -> Result<()>;

    /// Mode the folder is open in, if open.
    fn mode(&self) -> Option<OpenMode>;

    /// Closes the folder. Closing a closed folder is a no-op.
    fn close(&mut self);

    /// Number of messages in the folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder is not open or the query fails.
    fn message_count(&self) -> Result<usize>;

    /// Lists messages by 1-based sequence number, inclusive on both ends.
    ///
    /// Listed messages carry at least UID and flags. Messages received
    /// before `earliest` are omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn messages(
        &self,
        start: usize,
        end: usize,
        earliest: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    /// Looks up one message by UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn message(&self, uid: &str) -> Result<Option<Message>>;

    /// Fetches the requested items for a batch of messages.
    ///
    /// Unknown UIDs are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails.
    fn fetch(&self, uids: &[String], profile: &FetchProfile) -> Result<Vec<Message>>;

    /// Fetches the content of specific body parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails.
    fn fetch_parts(&self, uid: &str, part_ids: &[String]) -> Result<Vec<Part>>;

    /// Sets or clears flags on a batch of messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the change.
    fn set_flags(&self, uids: &[String], flags: &[Flag], value: bool) -> Result<()>;

    /// Sets or clears flags on every message in the folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the change.
    fn set_flags_all(&self, flags: &[Flag], value: bool) -> Result<()>;

    /// Copies messages to another folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    fn copy_messages(&self, uids: &[String], dest: &str) -> Result<UidMap>;

    /// Moves messages to another folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the move fails.
    fn move_messages(&self, uids: &[String], dest: &str) -> Result<UidMap>;

    /// Deletes messages, moving them to `trash` when the backend needs a
    /// trash folder for deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    fn delete_messages(&self, uids: &[String], trash: Option<&str>) -> Result<()>;

    /// Uploads a message. Returns the server UID when known.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    fn append(&self, message: &Message) -> Result<Option<String>>;

    /// Looks up a server UID by `Message-ID` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    fn uid_from_message_id(&self, message_id: &str) -> Result<Option<String>>;

    /// Permanently removes messages flagged deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the expunge fails.
    fn expunge(&self) -> Result<()>;

    /// Returns false if flags cannot be fetched separately.
    fn supports_fetching_flags(&self) -> bool {
        true
    }

    /// Derives a new push-state token after seeing `message`.
    fn new_push_state(&self, old: Option<&str>, message: &Message) -> Option<String> {
        let _ = (old, message);
        None
    }
}

/// Sends outgoing mail.
pub trait Transport: Send + Sync {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be delivered.
    fn send(&self, message: &Message) -> Result<()>;

    /// Classifies a send failure. Permanent failures demote the message to
    /// drafts instead of keeping it queued.
    fn is_permanent_failure(&self, error: &Error) -> bool {
        error.is_permanent()
    }
}

/// A long-lived push subscription.
pub trait Pusher: Send + Sync {
    /// Starts listening on the given folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    fn start(&self, folders: &[String]) -> Result<()>;

    /// Renews the subscription.
    fn refresh(&self);

    /// Stops listening.
    fn stop(&self);
}

/// Callbacks a [`Pusher`] drives.
///
/// Implementations may block the calling thread until the controller has
/// processed the event.
pub trait PushReceiver: Send + Sync {
    /// New messages arrived in `folder`.
    fn messages_arrived(&self, folder: &str, messages: Vec<Message>);

    /// Flags changed on existing messages in `folder`.
    fn messages_flags_changed(&self, folder: &str, messages: Vec<Message>);

    /// Messages were removed from `folder`.
    fn messages_removed(&self, folder: &str, uids: Vec<String>);

    /// The pusher lost track of `folder`; a full sync is needed.
    fn sync_folder(&self, folder: &str);

    /// The pusher failed.
    fn push_error(&self, message: &str, error: Option<&Error>);

    /// Returns the stored push-state token for `folder`.
    fn push_state(&self, folder: &str) -> Option<String>;

    /// Stores a push-state token for `folder`.
    fn set_push_state(&self, folder: &str, state: &str);

    /// Reports whether push is active for `folder`.
    fn set_push_active(&self, folder: &str, active: bool);
}
