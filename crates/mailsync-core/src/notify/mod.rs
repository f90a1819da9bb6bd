//! New-mail notifications.
//!
//! The [`Aggregator`] keeps one [`NotificationData`] per account, decides
//! which messages are worth announcing and renders a [`Summary`] for the
//! [`NotificationSink`].

mod data;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use mailsync_store::{Message, uid};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountId};

pub use data::{MAX_ACTIVE, MessageRef, NotificationContent, NotificationData, Removal};

const PREVIEW_CHARS: usize = 120;

/// Rendered notification for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Summary {
    /// Exactly one new message.
    Single {
        /// The message.
        reference: MessageRef,
        /// Sender line.
        sender: String,
        /// Subject line.
        subject: String,
        /// Body preview.
        preview: String,
    },
    /// Several new messages.
    Inbox {
        /// Account.
        account: AccountId,
        /// Messages announced.
        new_count: usize,
        /// Unread messages in the account.
        unread_count: usize,
        /// One line per message in the active window.
        lines: Vec<String>,
        /// Messages not shown as a line.
        more: usize,
    },
}

/// Folder a failed message can be found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SendFailureTarget {
    /// Still queued in the outbox; sending will be retried.
    Outbox,
    /// Moved to drafts; the user must fix and resend it.
    Drafts,
}

/// Presents notifications to the user.
pub trait NotificationSink: Send + Sync {
    /// Shows or updates the account notification. `ring` is true at most
    /// once per check cycle.
    fn show(&self, summary: &Summary, ring: bool);

    /// Removes the account notification.
    fn cancel(&self, account: AccountId);

    /// Reports a message that could not be sent.
    fn show_send_failed(&self, account: AccountId, message: &str, target: SendFailureTarget);

    /// Reports a server certificate that failed validation.
    fn show_certificate_error(&self, account: AccountId, message: &str);
}

/// A sink that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn show(&self, summary: &Summary, ring: bool) {
        match summary {
            Summary::Single {
                reference,
                sender,
                subject,
                ..
            } => info!(
                account = %reference.account,
                folder = %reference.folder,
                sender = %sender,
                subject = %subject,
                ring,
                "New message"
            ),
            Summary::Inbox {
                account,
                new_count,
                unread_count,
                ..
            } => info!(%account, new_count, unread_count, ring, "New messages"),
        }
    }

    fn cancel(&self, account: AccountId) {
        debug!(%account, "Notification cancelled");
    }

    fn show_send_failed(&self, account: AccountId, message: &str, target: SendFailureTarget) {
        warn!(%account, ?target, message, "Sending failed");
    }

    fn show_certificate_error(&self, account: AccountId, message: &str) {
        warn!(%account, message, "Certificate error");
    }
}

type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collects new messages into per-account notifications.
pub struct Aggregator {
    data: Mutex<HashMap<AccountId, Shared<NotificationData>>>,
    highest_notified: Mutex<HashMap<(AccountId, String), u64>>,
    sink: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("accounts", &lock(&self.data).len())
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Creates an aggregator writing to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            highest_notified: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// The sink notifications are written to.
    #[must_use]
    pub fn sink(&self) -> &dyn NotificationSink {
        self.sink.as_ref()
    }

    fn entry(&self, account: AccountId) -> Option<Shared<NotificationData>> {
        lock(&self.data).get(&account).cloned()
    }

    /// Returns true if a new message in `folder` should be announced.
    #[must_use]
    pub fn should_notify(&self, account: &Account, folder: &str, message: &Message) -> bool {
        let config = account.config();
        if !config.notify_new_mail || message.flags.is_seen() || config.is_quiet(folder) {
            return false;
        }
        if config.protocol.is_legacy() && message.is_older_than(config.notify_only_newer_than) {
            return false;
        }
        if let Some(n) = uid::numeric(&message.uid) {
            let key = (account.id(), folder.to_string());
            if lock(&self.highest_notified)
                .get(&key)
                .is_some_and(|highest| n <= *highest)
            {
                return false;
            }
        }
        let from_self = message
            .sender()
            .is_some_and(|sender| config.is_identity(&sender.email));
        !from_self || config.notify_self
    }

    /// Announces a message if it is eligible.
    ///
    /// Returns true if the message was added to the notification.
    pub fn on_new_message(&self, account: &Account, folder: &str, message: &Message) -> bool {
        if !self.should_notify(account, folder, message) {
            return false;
        }
        if let Some(n) = uid::numeric(&message.uid) {
            let key = (account.id(), folder.to_string());
            let mut highest = lock(&self.highest_notified);
            let entry = highest.entry(key).or_default();
            *entry = (*entry).max(n);
        }

        let content = content_for(account, folder, message);
        let shared = {
            let mut data = lock(&self.data);
            Arc::clone(data.entry(account.id()).or_insert_with(|| {
                // The triggering message is already stored as unread.
                let unread = account.unread_count().unwrap_or_default();
                Arc::new(Mutex::new(NotificationData::new(unread.saturating_sub(1))))
            }))
        };
        let snapshot = {
            let mut data = lock(&shared);
            data.add(content);
            data.clone()
        };

        let ring = account.claim_ring();
        if let Some(summary) = render(account.id(), &snapshot) {
            self.sink.show(&summary, ring);
        }
        true
    }

    /// Removes a message that was read, deleted or moved.
    pub fn on_message_resolved(&self, account: &Account, reference: &MessageRef) {
        let Some(shared) = self.entry(account.id()) else {
            return;
        };
        let snapshot = {
            let mut data = lock(&shared);
            if data.remove(reference) == Removal::NotFound {
                return;
            }
            data.clone()
        };
        if snapshot.is_empty() {
            self.clear(account.id());
        } else if let Some(summary) = render(account.id(), &snapshot) {
            self.sink.show(&summary, false);
        }
    }

    /// Renders the current notification for an account.
    #[must_use]
    pub fn render(&self, account: AccountId) -> Option<Summary> {
        let shared = self.entry(account)?;
        let snapshot = lock(&shared).clone();
        render(account, &snapshot)
    }

    /// Snapshot of an account's notification window.
    #[must_use]
    pub fn data(&self, account: AccountId) -> Option<NotificationData> {
        self.entry(account).map(|shared| lock(&shared).clone())
    }

    /// Drops the account's notification and cancels it.
    pub fn clear(&self, account: AccountId) {
        lock(&self.data).remove(&account);
        self.sink.cancel(account);
    }

    /// Clears the notification if the account has no unread messages left.
    pub fn clear_if_read(&self, account: &Account) {
        match account.unread_count() {
            Ok(0) => self.clear(account.id()),
            Ok(_) => {}
            Err(err) => debug!(account = %account.id(), error = %err, "Unread count unavailable"),
        }
    }
}

fn content_for(account: &Account, folder: &str, message: &Message) -> NotificationContent {
    let config = account.config();
    let sender = match message.sender() {
        Some(from) if config.is_identity(&from.email) => message
            .to
            .first()
            .map_or_else(String::new, |to| format!("To: {}", to.display())),
        Some(from) => from.display().to_string(),
        None => String::new(),
    };
    NotificationContent {
        reference: MessageRef::new(account.id(), folder, message.uid.clone()),
        sender,
        subject: message.subject.clone().unwrap_or_default(),
        preview: message.preview(PREVIEW_CHARS),
    }
}

fn render(account: AccountId, data: &NotificationData) -> Option<Summary> {
    match data.new_count() {
        0 => None,
        1 => data.active().next().map(|content| Summary::Single {
            reference: content.reference.clone(),
            sender: content.sender.clone(),
            subject: content.subject.clone(),
            preview: content.preview.clone(),
        }),
        new_count => {
            let lines: Vec<String> = data
                .active()
                .map(|c| format!("{} {}", c.sender, c.subject))
                .collect();
            Some(Summary::Inbox {
                account,
                new_count,
                unread_count: data.unread_count(),
                more: new_count - lines.len(),
                lines,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mailsync_store::memory::{MemoryLocalStore, MemoryStore, MemoryTransport};
    use mailsync_store::{Address, Flag, LocalStore};

    use super::*;
    use crate::config::{AccountConfig, Protocol};

    #[derive(Default)]
    struct RecordingSink {
        shown: Mutex<Vec<(Summary, bool)>>,
        cancelled: Mutex<Vec<AccountId>>,
    }

    impl NotificationSink for RecordingSink {
        fn show(&self, summary: &Summary, ring: bool) {
            self.shown.lock().unwrap().push((summary.clone(), ring));
        }

        fn cancel(&self, account: AccountId) {
            self.cancelled.lock().unwrap().push(account);
        }

        fn show_send_failed(&self, _: AccountId, _: &str, _: SendFailureTarget) {}

        fn show_certificate_error(&self, _: AccountId, _: &str) {}
    }

    fn account_with(config: AccountConfig) -> (Account, MemoryLocalStore) {
        let local = MemoryLocalStore::with_folders(&["INBOX"]);
        let account = Account::new(
            config,
            Arc::new(local.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryTransport::new()),
        );
        (account, local)
    }

    fn incoming(uid: &str, from: &str) -> Message {
        let mut message = Message::new(uid);
        message.subject = Some(format!("Subject {uid}"));
        message.from = vec![Address::new(from)];
        message.body = Some("Hello   there".into());
        message
    }

    fn setup() -> (Aggregator, Arc<RecordingSink>, Account, MemoryLocalStore) {
        let sink = Arc::new(RecordingSink::default());
        let aggregator = Aggregator::new(sink.clone());
        let (account, local) = account_with(AccountConfig::new(AccountId(1), "me@example.com"));
        (aggregator, sink, account, local)
    }

    #[test]
    fn test_single_then_inbox_summary() {
        let (aggregator, sink, account, local) = setup();
        let inbox = local.folder("INBOX").unwrap();
        for uid in ["10", "11"] {
            let message = incoming(uid, "alice@example.com");
            inbox.store(&message).unwrap();
            assert!(aggregator.on_new_message(&account, "INBOX", &message));
        }

        let shown = sink.shown.lock().unwrap();
        assert!(matches!(&shown[0], (Summary::Single { preview, .. }, true) if preview == "Hello there"));
        match &shown[1] {
            (
                Summary::Inbox {
                    new_count,
                    unread_count,
                    lines,
                    more,
                    ..
                },
                ring,
            ) => {
                assert_eq!(*new_count, 2);
                assert_eq!(*unread_count, 2);
                assert_eq!(lines.len(), 2);
                assert_eq!(*more, 0);
                assert!(!ring);
            }
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[test]
    fn test_old_uid_not_notified_twice() {
        let (aggregator, _, account, _) = setup();
        assert!(aggregator.on_new_message(&account, "INBOX", &incoming("20", "a@example.com")));
        assert!(!aggregator.on_new_message(&account, "INBOX", &incoming("19", "a@example.com")));
        assert!(!aggregator.on_new_message(&account, "INBOX", &incoming("20", "a@example.com")));
        assert!(aggregator.on_new_message(&account, "INBOX", &incoming("21", "a@example.com")));
    }

    #[test]
    fn test_eligibility_rules() {
        let (aggregator, _, account, _) = setup();
        let seen = incoming("1", "a@example.com").with_flag(Flag::Seen, true);
        assert!(!aggregator.should_notify(&account, "INBOX", &seen));
        assert!(!aggregator.should_notify(&account, "Spam", &incoming("2", "a@example.com")));
        assert!(!aggregator.should_notify(&account, "INBOX", &incoming("3", "ME@example.com")));
        assert!(aggregator.should_notify(&account, "Work", &incoming("4", "a@example.com")));

        let mut config = AccountConfig::new(AccountId(2), "me@example.com");
        config.protocol = Protocol::Pop3;
        config.notify_only_newer_than = Some(chrono::Utc::now());
        let (legacy, _) = account_with(config);
        let mut old = incoming("5", "a@example.com");
        old.internal_date = Some(chrono::Utc::now() - chrono::Duration::days(1));
        assert!(!aggregator.should_notify(&legacy, "INBOX", &old));
    }

    #[test]
    fn test_resolving_last_message_cancels() {
        let (aggregator, sink, account, _) = setup();
        aggregator.on_new_message(&account, "INBOX", &incoming("7", "a@example.com"));
        aggregator.on_message_resolved(&account, &MessageRef::new(AccountId(1), "INBOX", "7"));

        assert!(aggregator.render(AccountId(1)).is_none());
        assert_eq!(*sink.cancelled.lock().unwrap(), vec![AccountId(1)]);
    }

    #[test]
    fn test_overflow_reported_as_more() {
        let (aggregator, _, account, _) = setup();
        for uid in 1..=7 {
            aggregator.on_new_message(&account, "INBOX", &incoming(&uid.to_string(), "a@example.com"));
        }
        match aggregator.render(AccountId(1)).unwrap() {
            Summary::Inbox { lines, more, .. } => {
                assert_eq!(lines.len(), MAX_ACTIVE);
                assert_eq!(more, 2);
            }
            other => panic!("unexpected summary {other:?}"),
        }
    }
}
