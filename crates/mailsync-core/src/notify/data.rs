//! Per-account notification window.

use std::collections::VecDeque;

use serde::Serialize;

use crate::account::AccountId;

/// Entries shown individually before older ones overflow.
pub const MAX_ACTIVE: usize = 5;

/// Identifies a message across accounts and folders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MessageRef {
    /// Account.
    pub account: AccountId,
    /// Folder.
    pub folder: String,
    /// Message UID.
    pub uid: String,
}

impl MessageRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(account: AccountId, folder: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            account,
            folder: folder.into(),
            uid: uid.into(),
        }
    }
}

/// What a notification line shows for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationContent {
    /// The message.
    pub reference: MessageRef,
    /// Sender, or recipient for mail sent by the account owner.
    pub sender: String,
    /// Subject line.
    pub subject: String,
    /// Body preview.
    pub preview: String,
}

/// Where a removed message was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The message was not part of the notification.
    NotFound,
    /// Removed from the overflow list.
    Overflow,
    /// Removed from the active window. `restored` is the overflow entry
    /// that took its place, if any.
    Active {
        /// Entry moved back into the active window.
        restored: Option<MessageRef>,
    },
}

/// Messages currently announced for one account.
///
/// New messages enter at the front of the active window. Once the window
/// holds [`MAX_ACTIVE`] entries the oldest one moves to the front of the
/// overflow list.
#[derive(Debug, Clone, Default)]
pub struct NotificationData {
    unread_before_notification: usize,
    active: VecDeque<NotificationContent>,
    overflow: VecDeque<NotificationContent>,
}

impl NotificationData {
    /// Creates an empty window for an account that had `unread` unread
    /// messages before this notification started.
    #[must_use]
    pub fn new(unread: usize) -> Self {
        Self {
            unread_before_notification: unread,
            ..Self::default()
        }
    }

    /// Unread count when the notification was created.
    #[must_use]
    pub const fn unread_before_notification(&self) -> usize {
        self.unread_before_notification
    }

    /// Messages announced by this notification.
    #[must_use]
    pub fn new_count(&self) -> usize {
        self.active.len() + self.overflow.len()
    }

    /// Unread count to display.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.unread_before_notification + self.new_count()
    }

    /// Returns true if nothing is announced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_count() == 0
    }

    /// Entries in the active window, newest first.
    pub fn active(&self) -> impl Iterator<Item = &NotificationContent> {
        self.active.iter()
    }

    /// Overflow references, most recently displaced first.
    pub fn overflow(&self) -> impl Iterator<Item = &MessageRef> {
        self.overflow.iter().map(|c| &c.reference)
    }

    /// Returns true if the message is announced.
    #[must_use]
    pub fn contains(&self, reference: &MessageRef) -> bool {
        self.active
            .iter()
            .chain(self.overflow.iter())
            .any(|c| &c.reference == reference)
    }

    /// Announces a message. Returns the entry pushed into overflow, if any.
    ///
    /// Announcing a message twice is a no-op.
    pub fn add(&mut self, content: NotificationContent) -> Option<MessageRef> {
        if self.contains(&content.reference) {
            return None;
        }
        let displaced = if self.active.len() >= MAX_ACTIVE {
            self.active.pop_back().map(|oldest| {
                let reference = oldest.reference.clone();
                self.overflow.push_front(oldest);
                reference
            })
        } else {
            None
        };
        self.active.push_front(content);
        displaced
    }

    /// Removes a message, searching overflow first.
    pub fn remove(&mut self, reference: &MessageRef) -> Removal {
        if let Some(index) = self.overflow.iter().position(|c| &c.reference == reference) {
            self.overflow.remove(index);
            return Removal::Overflow;
        }
        let Some(index) = self.active.iter().position(|c| &c.reference == reference) else {
            return Removal::NotFound;
        };
        self.active.remove(index);
        let restored = self.overflow.pop_front().map(|content| {
            let reference = content.reference.clone();
            self.active.push_back(content);
            reference
        });
        Removal::Active { restored }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn content(uid: u32) -> NotificationContent {
        NotificationContent {
            reference: MessageRef::new(AccountId(1), "INBOX", uid.to_string()),
            sender: format!("sender{uid}@example.com"),
            subject: format!("Subject {uid}"),
            preview: String::new(),
        }
    }

    fn reference(uid: u32) -> MessageRef {
        content(uid).reference
    }

    #[test]
    fn test_sixth_message_overflows_oldest() {
        let mut data = NotificationData::new(0);
        for uid in 1..=5 {
            assert_eq!(data.add(content(uid)), None);
        }
        assert_eq!(data.add(content(6)), Some(reference(1)));
        assert_eq!(data.active().count(), MAX_ACTIVE);
        assert_eq!(data.new_count(), 6);
        assert_eq!(data.active().next().unwrap().reference, reference(6));
    }

    #[test]
    fn test_removing_active_restores_latest_overflow() {
        let mut data = NotificationData::new(2);
        for uid in 1..=7 {
            data.add(content(uid));
        }
        // Overflow now holds 2 then 1.
        assert_eq!(
            data.remove(&reference(5)),
            Removal::Active {
                restored: Some(reference(2))
            }
        );
        assert_eq!(data.active().last().unwrap().reference, reference(2));
        assert_eq!(data.overflow().collect::<Vec<_>>(), vec![&reference(1)]);
        assert_eq!(data.unread_count(), 2 + 6);
    }

    #[test]
    fn test_remove_searches_overflow_first() {
        let mut data = NotificationData::new(0);
        for uid in 1..=6 {
            data.add(content(uid));
        }
        assert_eq!(data.remove(&reference(1)), Removal::Overflow);
        assert_eq!(data.remove(&reference(1)), Removal::NotFound);
        assert_eq!(data.new_count(), 5);
    }

    #[test]
    fn test_duplicate_add_ignored() {
        let mut data = NotificationData::new(0);
        data.add(content(1));
        data.add(content(1));
        assert_eq!(data.new_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_window_invariants(ops in prop::collection::vec((any::<bool>(), 1u32..20), 1..80)) {
            let mut data = NotificationData::new(0);
            let mut announced = std::collections::HashSet::new();
            for (add, uid) in ops {
                if add {
                    data.add(content(uid));
                    announced.insert(uid);
                } else {
                    let overflow_before = data.overflow().count();
                    let active_before = data.active().count();
                    let removal = data.remove(&reference(uid));
                    if let Removal::Active { restored } = removal {
                        prop_assert_eq!(restored.is_some(), overflow_before > 0);
                        let expected = if overflow_before > 0 { active_before } else { active_before - 1 };
                        prop_assert_eq!(data.active().count(), expected);
                    }
                    announced.remove(&uid);
                }
                prop_assert!(data.active().count() <= MAX_ACTIVE);
                prop_assert_eq!(data.new_count(), announced.len());
                prop_assert!(data.overflow().count() == 0 || data.active().count() == MAX_ACTIVE);
            }
        }
    }
}
