//! Read-only operations run on the blocking pool.

use std::collections::HashSet;
use std::sync::Arc;

use mailsync_store::{Flag, Message};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CommandListener, Controller, Inner};
use crate::account::{Account, AccountId};
use crate::error::Result;
use crate::event::Event;
use crate::listener::Listener;
use crate::queue::Priority;

/// Criteria for [`Controller::search_local_messages`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Case-insensitive text matched against subject, senders and body.
    /// Empty matches everything.
    pub text: String,
    /// Flags a match must carry.
    pub required: Vec<Flag>,
    /// Flags a match must not carry.
    pub forbidden: Vec<Flag>,
    /// Accounts to search. `None` searches every account.
    pub accounts: Option<Vec<AccountId>>,
    /// Folders to search. `None` searches every folder.
    pub folders: Option<Vec<String>>,
}

impl SearchQuery {
    /// Creates a query matching `text`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Returns true if `message` satisfies the query.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        if message.flags.is_deleted() {
            return false;
        }
        if !self.required.iter().all(|f| message.flags.contains(*f))
            || self.forbidden.iter().any(|f| message.flags.contains(*f))
        {
            return false;
        }
        if self.text.is_empty() {
            return true;
        }
        let needle = self.text.to_lowercase();
        let contains = |haystack: &str| haystack.to_lowercase().contains(&needle);
        message.subject.as_deref().is_some_and(contains)
            || message
                .from
                .iter()
                .any(|a| contains(&a.email) || a.name.as_deref().is_some_and(contains))
            || message.body.as_deref().is_some_and(contains)
    }
}

impl Inner {
    fn emit_local_folders(&self, account: &Account, listener: Option<&dyn Listener>) -> Result<()> {
        let folders = account.local().folders()?;
        self.emit(
            listener,
            Event::FolderListed {
                account: account.id(),
                folders,
            },
        );
        Ok(())
    }

    /// Mirrors the server's folder list locally, then reports it.
    fn refresh_folders(&self, account: &Account, listener: Option<&dyn Listener>) -> Result<()> {
        let config = account.config();
        let remote: HashSet<String> = account.remote().list_folders()?.into_iter().collect();
        for name in &remote {
            let local = account.local_folder(name)?;
            if !local.exists()? {
                local.create()?;
            }
        }
        for name in account.local().folders()? {
            let keep = remote.contains(&name)
                || config.is_inbox(&name)
                || config.is_special(&name)
                || config.is_local_only(&name);
            if !keep {
                info!(account = %account.id(), folder = %name, "Folder gone from server, deleting");
                account.local().delete_folder(&name)?;
            }
        }
        self.emit_local_folders(account, listener)
    }

    fn queue_folder_refresh(self: &Arc<Self>, id: AccountId, listener: CommandListener) {
        self.submit(
            format!("refresh folders {id}"),
            listener,
            Priority::Foreground,
            move |inner, listener| {
                let account = inner.account(id)?;
                inner.emit(listener, Event::FolderListStarted { account: id });
                match inner.refresh_folders(&account, listener) {
                    Ok(()) => {
                        inner.emit(listener, Event::FolderListFinished { account: id });
                        Ok(())
                    }
                    Err(err) if err.is_storage_unavailable() => Err(err),
                    Err(err) => {
                        warn!(account = %id, error = %err, "Folder refresh failed");
                        inner.emit(
                            listener,
                            Event::FolderListFailed {
                                account: id,
                                message: err.root_message(),
                            },
                        );
                        Ok(())
                    }
                }
            },
        );
    }
}

impl Controller {
    /// Lists the account's folders.
    ///
    /// The local list is reported from the pool. With `refresh_remote`, or
    /// when nothing is stored locally yet, a foreground command mirrors the
    /// server's folder list first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`](crate::Error::AccountNotFound)
    /// for an unknown account.
    pub fn list_folders(
        &self,
        account: AccountId,
        refresh_remote: bool,
        listener: CommandListener,
    ) -> Result<()> {
        self.inner.account(account)?;
        if refresh_remote {
            self.inner.queue_folder_refresh(account, listener);
            return Ok(());
        }
        self.inner.spawn("list folders", move |inner| {
            let Ok(acct) = inner.account(account) else {
                return;
            };
            let listener_ref = listener.as_deref();
            match acct.local().folders() {
                Ok(folders) if folders.is_empty() => {
                    inner.queue_folder_refresh(account, listener);
                }
                Ok(folders) => {
                    inner.emit(listener_ref, Event::FolderListStarted { account });
                    inner.emit(listener_ref, Event::FolderListed { account, folders });
                    inner.emit(listener_ref, Event::FolderListFinished { account });
                }
                Err(err) => {
                    inner.emit(
                        listener_ref,
                        Event::FolderListFailed {
                            account,
                            message: crate::Error::from(err).root_message(),
                        },
                    );
                }
            }
        });
        Ok(())
    }

    /// Loads a stored message for display and marks it read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`](crate::Error::AccountNotFound)
    /// for an unknown account.
    pub fn load_message_for_view(
        &self,
        account: AccountId,
        folder: &str,
        uid: &str,
        listener: CommandListener,
    ) -> Result<()> {
        self.inner.account(account)?;
        let (folder, uid) = (folder.to_string(), uid.to_string());
        self.inner.spawn("load message", move |inner| {
            let result = inner.account(account).and_then(|acct| {
                let Some(message) = acct.local_folder(&folder)?.message(&uid)? else {
                    debug!(account = %account, folder, uid, "Message not stored locally");
                    return Ok(());
                };
                let seen = message.flags.is_seen();
                inner.emit(
                    listener.as_deref(),
                    Event::MessageLoaded {
                        account,
                        folder: folder.clone(),
                        message,
                    },
                );
                if !seen {
                    inner.set_flag(&acct, &folder, &[uid.clone()], Flag::Seen, true)?;
                }
                Ok(())
            });
            if let Err(err) = result {
                warn!(account = %account, folder, uid, error = %err, "Loading message failed");
            }
        });
        Ok(())
    }

    /// Searches stored messages, reporting each match as an event.
    pub fn search_local_messages(&self, query: SearchQuery, listener: CommandListener) {
        self.inner.spawn("search", move |inner| {
            let listener = listener.as_deref();
            let mut count = 0;
            for account in inner.all_accounts() {
                if query
                    .accounts
                    .as_ref()
                    .is_some_and(|ids| !ids.contains(&account.id()))
                {
                    continue;
                }
                match search_account(inner, &account, &query, listener) {
                    Ok(found) => count += found,
                    Err(err) => {
                        warn!(account = %account.id(), error = %err, "Search failed");
                    }
                }
            }
            inner.emit(listener, Event::SearchFinished { count });
        });
    }

    /// Computes unread, flagged and size counters for an account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`](crate::Error::AccountNotFound)
    /// for an unknown account.
    pub fn account_stats(&self, account: AccountId, listener: CommandListener) -> Result<()> {
        self.inner.account(account)?;
        self.inner.spawn("account stats", move |inner| {
            match inner.account(account).and_then(|acct| acct.stats()) {
                Ok(stats) => inner.emit(
                    listener.as_deref(),
                    Event::AccountStatusChanged { account, stats },
                ),
                Err(err) => warn!(account = %account, error = %err, "Account stats unavailable"),
            }
        });
        Ok(())
    }
}

fn search_account(
    inner: &Inner,
    account: &Account,
    query: &SearchQuery,
    listener: Option<&dyn Listener>,
) -> Result<usize> {
    let mut count = 0;
    for folder in account.local().folders()? {
        if query
            .folders
            .as_ref()
            .is_some_and(|names| !names.contains(&folder))
        {
            continue;
        }
        for message in account.local_folder(&folder)?.messages()? {
            if query.matches(&message) {
                count += 1;
                inner.emit(
                    listener,
                    Event::SearchResult {
                        account: account.id(),
                        folder: folder.clone(),
                        message,
                    },
                );
            }
        }
    }
    Ok(count)
}
