//! What a running command needs to report its work.

use crate::account::Account;
use crate::error_folder::ErrorFolder;
use crate::event::Event;
use crate::listener::{Listener, ListenerSet};
use crate::notify::{Aggregator, MessageRef};
use crate::sync::Suppressed;

/// Borrowed controller state for one command on one account.
#[derive(Clone, Copy)]
pub(crate) struct Context<'a> {
    pub(crate) account: &'a Account,
    pub(crate) listeners: &'a ListenerSet,
    pub(crate) listener: Option<&'a dyn Listener>,
    pub(crate) errors: &'a ErrorFolder,
    pub(crate) notifications: &'a Aggregator,
    pub(crate) suppressed: &'a Suppressed,
}

impl Context<'_> {
    /// Delivers an event to the listener set and the command's listener.
    pub(crate) fn emit(&self, event: Event) {
        self.listeners.emit(self.listener, event);
    }

    /// Records a failure in the account's error folder.
    pub(crate) fn report(&self, subject: &str, detail: &str) {
        self.errors.add(self.account, subject, detail);
    }

    /// Removes a message from the account's notification.
    pub(crate) fn resolve(&self, folder: &str, uid: &str) {
        let reference = MessageRef::new(self.account.id(), folder, uid);
        self.notifications.on_message_resolved(self.account, &reference);
    }
}
