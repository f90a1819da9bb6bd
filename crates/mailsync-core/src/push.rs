//! Server push.
//!
//! A [`Pusher`](mailsync_store::Pusher) reports changes through a
//! [`PushReceiver`]. The bridge turns each report into a queued command and
//! blocks the pusher's thread until the command has run, so the pusher
//! never races ahead of the local store.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use mailsync_store::{Message, OpenMode, PushReceiver};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountId};
use crate::context::Context;
use crate::controller::{Controller, Inner};
use crate::error::Result;
use crate::event::Event;
use crate::listener::Listener;
use crate::queue::{Priority, on_worker_thread};
use crate::sync::{self, download, sync_flags, visible_limit};

/// Receives push reports for one account.
pub(crate) struct PushBridge {
    inner: Weak<Inner>,
    account: AccountId,
}

impl PushBridge {
    pub(crate) fn new(inner: &Arc<Inner>, account: AccountId) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            account,
        }
    }

    fn resolve(&self) -> Option<(Arc<Inner>, Arc<Account>)> {
        let inner = self.inner.upgrade()?;
        match inner.account(self.account) {
            Ok(account) => Some((inner, account)),
            Err(_) => {
                debug!(account = %self.account, "Push report for a removed account");
                None
            }
        }
    }

    /// Queues `work` and waits for it to finish.
    ///
    /// On the worker thread the work runs inline. Inside an async context
    /// the call returns without waiting.
    fn run_blocking<F>(&self, description: String, work: F)
    where
        F: FnOnce(&Inner, &Account) -> Result<()> + Send + 'static,
    {
        let Some((inner, account)) = self.resolve() else {
            return;
        };
        if on_worker_thread() {
            if let Err(err) = work(&inner, &account) {
                warn!(account = %self.account, error = %err, "Push processing failed");
            }
            return;
        }

        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some((work, tx)));
        let id = self.account;
        inner.submit(description, None, Priority::Background, move |inner, _| {
            let Some((work, tx)) = slot.lock().unwrap_or_else(PoisonError::into_inner).take()
            else {
                return Ok(());
            };
            let result = inner.account(id).and_then(|account| work(inner, &account));
            // The pusher may have given up waiting.
            let _ = tx.send(result);
            Ok(())
        });
        drop((inner, account));

        if Handle::try_current().is_ok() {
            debug!(account = %self.account, "Push report from an async context, not waiting");
            return;
        }
        match rx.blocking_recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(account = %self.account, error = %err, "Push processing failed"),
            Err(_) => debug!(account = %self.account, "Push command dropped before running"),
        }
    }
}

/// Applies pushed messages and records the outcome on the folder.
fn process(
    inner: &Inner,
    account: &Account,
    folder: &str,
    messages: Vec<Message>,
    flags_only: bool,
) -> Result<()> {
    let ctx = inner.context(account, None);
    let result = apply(&ctx, folder, messages, flags_only);
    if let Err(err) = &result {
        let message = format!("Push failed: {}", err.root_message());
        warn!(account = %account.id(), folder, error = %message, "Push processing failed");
        if let Err(err) = account
            .local_folder(folder)
            .and_then(|local| Ok(local.set_status(Some(&message))?))
        {
            debug!(folder, error = %err, "Could not record push failure");
        }
        ctx.emit(Event::SyncFailed {
            account: account.id(),
            folder: folder.to_string(),
            message,
        });
    }
    result
}

fn apply(ctx: &Context<'_>, folder: &str, messages: Vec<Message>, flags_only: bool) -> Result<()> {
    let account = ctx.account;
    let local = account.local_folder(folder)?;
    if !local.exists()? {
        local.create()?;
    }
    account.reset_ring();

    if flags_only {
        sync_flags(ctx, local.as_ref(), &messages)?;
    } else {
        let mut remote = account.remote().folder(folder)?;
        remote.open(OpenMode::ReadWrite)?;
        let known: HashMap<String, Message> = local
            .messages()?
            .into_iter()
            .map(|m| (m.uid.clone(), m))
            .collect();
        let limit = visible_limit(account, local.as_ref())?;
        let old_state = local.push_state()?;
        let new_state = messages
            .last()
            .and_then(|last| remote.new_push_state(old_state.as_deref(), last));
        download(ctx, remote.as_ref(), local.as_ref(), messages, &known, limit)?;
        if let Some(state) = new_state {
            local.set_push_state(Some(&state))?;
        }
        remote.close();
    }

    let unread = local.unread_count()?;
    local.set_last_push(Utc::now())?;
    local.set_status(None)?;
    if account.unread_count()? == 0 {
        ctx.notifications.clear(account.id());
    }
    ctx.emit(Event::FolderStatusChanged {
        account: account.id(),
        folder: folder.to_string(),
        unread,
    });
    Ok(())
}

fn remove(ctx: &Context<'_>, folder: &str, uids: &[String]) -> Result<()> {
    let account = ctx.account;
    let local = account.local_folder(folder)?;
    for uid in uids {
        local.destroy(uid)?;
        ctx.emit(Event::SyncRemoved {
            account: account.id(),
            folder: folder.to_string(),
            uid: uid.clone(),
        });
        ctx.resolve(folder, uid);
    }
    ctx.emit(Event::FolderStatusChanged {
        account: account.id(),
        folder: folder.to_string(),
        unread: local.unread_count()?,
    });
    Ok(())
}

/// Wakes a waiting pusher once a reconciliation of its folder ends.
struct FolderWaiter {
    account: AccountId,
    folder: String,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl Listener for FolderWaiter {
    fn on_event(&self, event: &Event) {
        let finished = matches!(event, Event::SyncFinished { .. } | Event::SyncFailed { .. })
            && event.account() == Some(self.account)
            && event.folder() == Some(self.folder.as_str());
        if finished
            && let Some(done) = self
                .done
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        {
            let _ = done.send(());
        }
    }
}

impl PushReceiver for PushBridge {
    fn messages_arrived(&self, folder: &str, messages: Vec<Message>) {
        debug!(account = %self.account, folder, count = messages.len(), "Push: messages arrived");
        let folder = folder.to_string();
        self.run_blocking(
            format!("push arrived {}:{folder}", self.account),
            move |inner, account| process(inner, account, &folder, messages, false),
        );
    }

    fn messages_flags_changed(&self, folder: &str, messages: Vec<Message>) {
        debug!(account = %self.account, folder, count = messages.len(), "Push: flags changed");
        let folder = folder.to_string();
        self.run_blocking(
            format!("push flags {}:{folder}", self.account),
            move |inner, account| process(inner, account, &folder, messages, true),
        );
    }

    fn messages_removed(&self, folder: &str, uids: Vec<String>) {
        debug!(account = %self.account, folder, count = uids.len(), "Push: messages removed");
        let folder = folder.to_string();
        self.run_blocking(
            format!("push removed {}:{folder}", self.account),
            move |inner, account| remove(&inner.context(account, None), &folder, &uids),
        );
    }

    fn sync_folder(&self, folder: &str) {
        let Some((inner, account)) = self.resolve() else {
            return;
        };
        if on_worker_thread() {
            if let Err(err) = sync::synchronize(&inner.context(&account, None), folder) {
                warn!(account = %self.account, folder, error = %err, "Push synchronization failed");
            }
            return;
        }

        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(FolderWaiter {
            account: self.account,
            folder: folder.to_string(),
            done: Mutex::new(Some(tx)),
        });
        inner.synchronize_mailbox(&account, folder, Some(waiter), Priority::Background);
        drop(inner);
        if Handle::try_current().is_ok() {
            return;
        }
        if rx.blocking_recv().is_err() {
            debug!(account = %self.account, folder, "Push synchronization dropped");
        }
    }

    fn push_error(&self, message: &str, error: Option<&mailsync_store::Error>) {
        warn!(account = %self.account, error = ?error, "Push error: {message}");
        if let Some(inner) = self.inner.upgrade()
            && error.is_some_and(mailsync_store::Error::is_certificate)
        {
            inner
                .notifications
                .sink()
                .show_certificate_error(self.account, message);
        }
    }

    fn push_state(&self, folder: &str) -> Option<String> {
        let (_, account) = self.resolve()?;
        match account.local_folder(folder).and_then(|l| Ok(l.push_state()?)) {
            Ok(state) => state,
            Err(err) => {
                debug!(account = %self.account, folder, error = %err, "Push state unavailable");
                None
            }
        }
    }

    fn set_push_state(&self, folder: &str, state: &str) {
        let Some((_, account)) = self.resolve() else {
            return;
        };
        if let Err(err) = account
            .local_folder(folder)
            .and_then(|l| Ok(l.set_push_state(Some(state))?))
        {
            warn!(account = %self.account, folder, error = %err, "Could not store push state");
        }
    }

    fn set_push_active(&self, folder: &str, active: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.emit(
                None,
                Event::PushActive {
                    account: self.account,
                    folder: folder.to_string(),
                    active,
                },
            );
        }
    }
}

impl Controller {
    /// Starts push for an account's push folders, replacing any running
    /// pusher.
    ///
    /// Returns false if the account has no folders to push or its store
    /// cannot push.
    ///
    /// # Errors
    ///
    /// Returns an error if the account is unknown or the pusher fails to
    /// start.
    pub fn setup_pushing(&self, account: AccountId) -> Result<bool> {
        let acct = self.inner.account(account)?;
        let config = acct.config();
        let mut seen = BTreeSet::new();
        let mut folders: Vec<String> = config
            .push_folders
            .clone()
            .unwrap_or_else(|| vec![config.inbox_folder.clone()])
            .into_iter()
            .filter(|f| !config.is_local_only(f) && seen.insert(f.clone()))
            .collect();
        folders.truncate(config.max_push_folders);

        let previous = self
            .inner
            .pushers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&account);
        if let Some(previous) = previous {
            previous.stop();
        }
        if folders.is_empty() {
            debug!(account = %account, "No folders to push");
            return Ok(false);
        }

        let receiver: Arc<dyn PushReceiver> = Arc::new(PushBridge::new(&self.inner, account));
        let Some(pusher) = acct.remote().pusher(receiver)? else {
            debug!(account = %account, "Store cannot push");
            return Ok(false);
        };
        pusher.start(&folders)?;
        info!(account = %account, ?folders, "Push started");
        self.inner
            .pushers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account, pusher);
        Ok(true)
    }

    /// Stops every running pusher.
    pub fn stop_all_pushing(&self) {
        let pushers: Vec<_> = self
            .inner
            .pushers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (account, pusher) in pushers {
            debug!(account = %account, "Stopping pusher");
            pusher.stop();
        }
    }

    /// Asks every running pusher to refresh its server connection.
    pub fn refresh_pushers(&self) {
        for pusher in self
            .inner
            .pushers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            pusher.refresh();
        }
    }

    /// A receiver feeding push reports for `account` into the controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`](crate::Error::AccountNotFound)
    /// for an unknown account.
    pub fn push_receiver(&self, account: AccountId) -> Result<Arc<dyn PushReceiver>> {
        self.inner.account(account)?;
        Ok(Arc::new(PushBridge::new(&self.inner, account)))
    }
}
