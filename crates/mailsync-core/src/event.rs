//! Events emitted by the controller.
//!
//! Every state change the controller makes is reported as an [`Event`].
//! Observers match on the variants they care about and ignore the rest.

use mailsync_store::{Message, Part};
use serde::Serialize;

use crate::account::{AccountId, AccountStats};

/// A state change reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A mail check began. `None` means all accounts.
    CheckMailStarted {
        /// Account being checked.
        account: Option<AccountId>,
    },
    /// A mail check finished.
    CheckMailFinished {
        /// Account that was checked.
        account: Option<AccountId>,
    },

    /// Folder listing began.
    FolderListStarted {
        /// Account.
        account: AccountId,
    },
    /// A folder list is available.
    FolderListed {
        /// Account.
        account: AccountId,
        /// Folder names.
        folders: Vec<String>,
    },
    /// Folder listing finished.
    FolderListFinished {
        /// Account.
        account: AccountId,
    },
    /// Folder listing failed.
    FolderListFailed {
        /// Account.
        account: AccountId,
        /// Failure description.
        message: String,
    },

    /// Synchronization of a folder began.
    SyncStarted {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
    },
    /// Header download began.
    SyncHeadersStarted {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
    },
    /// One more header was processed.
    SyncHeadersProgress {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Headers processed so far.
        completed: usize,
        /// Headers in this pass.
        total: usize,
    },
    /// Header download finished.
    SyncHeadersFinished {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Messages on the server.
        total: usize,
        /// Headers retained for this pass.
        fetched: usize,
    },
    /// Generic progress. `folder` is `None` for account-level work.
    SyncProgress {
        /// Account.
        account: AccountId,
        /// Folder, if any.
        folder: Option<String>,
        /// Steps completed.
        completed: usize,
        /// Steps in total.
        total: usize,
    },
    /// An unseen message arrived.
    SyncNewMessage {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// The message.
        message: Message,
    },
    /// A message was added or its local copy changed.
    SyncAddOrUpdate {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// The stored message.
        message: Message,
    },
    /// A message was removed from the local folder.
    SyncRemoved {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// UID of the removed message.
        uid: String,
    },
    /// Synchronization of a folder finished.
    SyncFinished {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Messages on the server.
        total: usize,
        /// New messages downloaded.
        new: usize,
    },
    /// Synchronization of a folder failed.
    SyncFailed {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Failure description.
        message: String,
    },

    /// A message's UID changed. Consumers should update their indices.
    MessageUidChanged {
        /// Account.
        account: AccountId,
        /// Folder holding the message.
        folder: String,
        /// Previous UID.
        old_uid: String,
        /// New UID.
        new_uid: String,
    },
    /// A message is being deleted.
    MessageDeleted {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// UID.
        uid: String,
    },
    /// A local message changed outside of synchronization.
    LocalMessageUpdated {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Updated message.
        message: Message,
    },
    /// A message was loaded for display.
    MessageLoaded {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// The message.
        message: Message,
    },
    /// A message could not be loaded for display.
    MessageLoadFailed {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Message UID.
        uid: String,
        /// Failure description.
        message: String,
    },
    /// An attachment's content was downloaded.
    AttachmentLoaded {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Message UID.
        uid: String,
        /// The part, with content.
        part: Part,
    },
    /// An attachment could not be downloaded.
    AttachmentLoadFailed {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Message UID.
        uid: String,
        /// Part identifier.
        part_id: String,
        /// Failure description.
        message: String,
    },

    /// A folder's unread count changed.
    FolderStatusChanged {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// New unread count.
        unread: usize,
    },
    /// Account counters changed.
    AccountStatusChanged {
        /// Account.
        account: AccountId,
        /// Current counters.
        stats: AccountStats,
    },
    /// Local storage size changed.
    AccountSizeChanged {
        /// Account.
        account: AccountId,
        /// Size before, in bytes.
        old_size: u64,
        /// Size after, in bytes.
        new_size: u64,
    },

    /// Pending-command replay began.
    PendingCommandsProcessing {
        /// Account.
        account: AccountId,
    },
    /// One pending command began.
    PendingCommandStarted {
        /// Account.
        account: AccountId,
        /// Command name.
        title: String,
    },
    /// One pending command finished.
    PendingCommandCompleted {
        /// Account.
        account: AccountId,
        /// Command name.
        title: String,
    },
    /// Pending-command replay finished.
    PendingCommandsFinished {
        /// Account.
        account: AccountId,
    },

    /// Sending queued messages began.
    SendStarted {
        /// Account.
        account: AccountId,
    },
    /// Sending queued messages finished without failures.
    SendCompleted {
        /// Account.
        account: AccountId,
    },
    /// At least one queued message could not be sent.
    SendFailed {
        /// Account.
        account: AccountId,
        /// Last failure.
        message: String,
    },

    /// The trash was emptied locally.
    EmptyTrashCompleted {
        /// Account.
        account: AccountId,
    },

    /// A local search matched a message.
    SearchResult {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Matching message.
        message: Message,
    },
    /// A local search finished.
    SearchFinished {
        /// Matches found.
        count: usize,
    },

    /// Push was started or stopped for a folder.
    PushActive {
        /// Account.
        account: AccountId,
        /// Folder.
        folder: String,
        /// Whether push is now active.
        active: bool,
    },

    /// The worker finished a command.
    CommandCompleted {
        /// Whether more commands are queued.
        more_work: bool,
    },
}

impl Event {
    /// The account the event concerns, if any.
    #[must_use]
    pub const fn account(&self) -> Option<AccountId> {
        match self {
            Self::CheckMailStarted { account } | Self::CheckMailFinished { account } => *account,
            Self::FolderListStarted { account }
            | Self::FolderListed { account, .. }
            | Self::FolderListFinished { account }
            | Self::FolderListFailed { account, .. }
            | Self::SyncStarted { account, .. }
            | Self::SyncHeadersStarted { account, .. }
            | Self::SyncHeadersProgress { account, .. }
            | Self::SyncHeadersFinished { account, .. }
            | Self::SyncProgress { account, .. }
            | Self::SyncNewMessage { account, .. }
            | Self::SyncAddOrUpdate { account, .. }
            | Self::SyncRemoved { account, .. }
            | Self::SyncFinished { account, .. }
            | Self::SyncFailed { account, .. }
            | Self::MessageUidChanged { account, .. }
            | Self::MessageDeleted { account, .. }
            | Self::LocalMessageUpdated { account, .. }
            | Self::MessageLoaded { account, .. }
            | Self::MessageLoadFailed { account, .. }
            | Self::AttachmentLoaded { account, .. }
            | Self::AttachmentLoadFailed { account, .. }
            | Self::FolderStatusChanged { account, .. }
            | Self::AccountStatusChanged { account, .. }
            | Self::AccountSizeChanged { account, .. }
            | Self::PendingCommandsProcessing { account }
            | Self::PendingCommandStarted { account, .. }
            | Self::PendingCommandCompleted { account, .. }
            | Self::PendingCommandsFinished { account }
            | Self::SendStarted { account }
            | Self::SendCompleted { account }
            | Self::SendFailed { account, .. }
            | Self::EmptyTrashCompleted { account }
            | Self::SearchResult { account, .. }
            | Self::PushActive { account, .. } => Some(*account),
            Self::SearchFinished { .. } | Self::CommandCompleted { .. } => None,
        }
    }

    /// The folder the event concerns, if any.
    #[must_use]
    pub fn folder(&self) -> Option<&str> {
        match self {
            Self::SyncStarted { folder, .. }
            | Self::SyncHeadersStarted { folder, .. }
            | Self::SyncHeadersProgress { folder, .. }
            | Self::SyncHeadersFinished { folder, .. }
            | Self::SyncNewMessage { folder, .. }
            | Self::SyncAddOrUpdate { folder, .. }
            | Self::SyncRemoved { folder, .. }
            | Self::SyncFinished { folder, .. }
            | Self::SyncFailed { folder, .. }
            | Self::MessageUidChanged { folder, .. }
            | Self::MessageDeleted { folder, .. }
            | Self::LocalMessageUpdated { folder, .. }
            | Self::MessageLoaded { folder, .. }
            | Self::MessageLoadFailed { folder, .. }
            | Self::AttachmentLoaded { folder, .. }
            | Self::AttachmentLoadFailed { folder, .. }
            | Self::FolderStatusChanged { folder, .. }
            | Self::SearchResult { folder, .. }
            | Self::PushActive { folder, .. } => Some(folder),
            Self::SyncProgress { folder, .. } => folder.as_deref(),
            _ => None,
        }
    }

    /// Returns true for events that add, update or remove a message.
    #[must_use]
    pub const fn is_message_change(&self) -> bool {
        matches!(
            self,
            Self::SyncAddOrUpdate { .. } | Self::SyncRemoved { .. } | Self::SyncNewMessage { .. }
        )
    }
}
