//! Queued operations.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use mailsync_store::{Flag, Message, uid};
use tracing::{debug, info, warn};

use super::{CommandListener, Controller, Inner};
use crate::account::{Account, AccountId};
use crate::config::DeletePolicy;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::pending::{self, PendingCommand, queue_pending};
use crate::queue::Priority;
use crate::send;
use crate::sync;

impl Inner {
    /// Queues a reconciliation of one folder.
    pub(crate) fn synchronize_mailbox(
        self: &Arc<Self>,
        account: &Arc<Account>,
        folder: &str,
        listener: CommandListener,
        priority: Priority,
    ) {
        let id = account.id();
        let folder = folder.to_string();
        self.submit(
            format!("synchronize {id}:{folder}"),
            listener,
            priority,
            move |inner, listener| {
                let account = inner.account(id)?;
                sync::synchronize(&inner.context(&account, listener), &folder)
            },
        );
    }

    /// Queues a replay of the pending-command log.
    pub(crate) fn process_pending(self: &Arc<Self>, id: AccountId, listener: CommandListener) {
        self.submit(
            format!("process pending commands {id}"),
            listener,
            Priority::Background,
            move |inner, listener| {
                let account = inner.account(id)?;
                pending::replay(&inner.context(&account, listener)).map(|report| {
                    debug!(account = %id, processed = report.processed, "Pending commands replayed");
                })
            },
        );
    }

    pub(crate) fn send_pending(self: &Arc<Self>, id: AccountId, listener: CommandListener) {
        self.submit(
            format!("send pending messages {id}"),
            listener,
            Priority::Background,
            move |inner, listener| {
                let account = inner.account(id)?;
                send::send_pending(
                    &inner.context(&account, listener),
                    &inner.send_counts,
                    inner.config.max_send_attempts,
                )
            },
        );
    }

    /// Applies a flag change locally and queues it for the server.
    pub(crate) fn set_flag(
        self: &Arc<Self>,
        account: &Account,
        folder: &str,
        uids: &[String],
        flag: Flag,
        value: bool,
    ) -> Result<()> {
        let config = account.config();
        let local = account.local_folder(folder)?;
        local.set_flags(uids, &[flag], value)?;

        if folder == config.outbox_folder && flag == Flag::Flagged && !value {
            for uid in uids {
                self.send_counts.reset(uid);
            }
        }
        if flag == Flag::Seen && value {
            let ctx = self.context(account, None);
            for uid in uids {
                ctx.resolve(folder, uid);
            }
        }
        self.emit(
            None,
            Event::FolderStatusChanged {
                account: account.id(),
                folder: folder.to_string(),
                unread: local.unread_count()?,
            },
        );

        if config.is_local_only(folder) {
            return Ok(());
        }
        let remote_uids: Vec<String> = uids.iter().filter(|u| !uid::is_local(u)).cloned().collect();
        if remote_uids.is_empty() {
            return Ok(());
        }
        let id = account.id();
        let command = PendingCommand::SetFlag {
            folder: folder.to_string(),
            value,
            flag,
            uids: remote_uids,
        };
        self.submit(
            format!("set flag {flag} {id}:{folder}"),
            None,
            Priority::Background,
            move |inner, listener| {
                let account = inner.account(id)?;
                queue_pending(&account, &command)?;
                pending::replay(&inner.context(&account, listener)).map(|_| ())
            },
        );
        Ok(())
    }

    fn delete_locally(ctx: &Context<'_>, folder: &str, uids: &[String]) -> Result<Option<Vec<String>>> {
        let account = ctx.account;
        let config = account.config();
        let local = account.local_folder(folder)?;
        for uid in uids {
            ctx.emit(Event::MessageDeleted {
                account: account.id(),
                folder: folder.to_string(),
                uid: uid.clone(),
            });
            ctx.resolve(folder, uid);
        }

        let trash = match &config.trash_folder {
            Some(trash) if trash != folder => trash.clone(),
            _ => {
                local.set_flags(uids, &[Flag::Deleted], true)?;
                ctx.emit(Event::FolderStatusChanged {
                    account: account.id(),
                    folder: folder.to_string(),
                    unread: local.unread_count()?,
                });
                return Ok(None);
            }
        };

        let trash_local = account.local_folder(&trash)?;
        if !trash_local.exists()? {
            trash_local.create()?;
        }
        let map = local.move_messages(uids, trash_local.as_ref())?;
        for (changed, name) in [(&local, folder), (&trash_local, trash.as_str())] {
            ctx.emit(Event::FolderStatusChanged {
                account: account.id(),
                folder: name.to_string(),
                unread: changed.unread_count()?,
            });
        }
        Ok(Some(
            uids.iter()
                .map(|u| map.get(u).cloned().unwrap_or_default())
                .collect(),
        ))
    }

    fn delete_messages(ctx: &Context<'_>, folder: &str, uids: &[String]) -> Result<()> {
        let account = ctx.account;
        let config = account.config();
        let trash_uids = Self::delete_locally(ctx, folder, uids)?;

        if folder == config.outbox_folder {
            if let (Some(trash), Some(trash_uids)) = (&config.trash_folder, &trash_uids) {
                for uid in trash_uids.iter().filter(|u| !u.is_empty()) {
                    queue_pending(
                        account,
                        &PendingCommand::Append {
                            folder: trash.clone(),
                            uid: uid.clone(),
                        },
                    )?;
                }
            }
            return Ok(());
        }

        let remote_uids: Vec<String> = uids.iter().filter(|u| !uid::is_local(u)).cloned().collect();
        if remote_uids.is_empty() || config.is_local_only(folder) {
            return Ok(());
        }
        let command = match config.delete_policy {
            DeletePolicy::Never => return Ok(()),
            DeletePolicy::MarkAsRead => PendingCommand::SetFlag {
                folder: folder.to_string(),
                value: true,
                flag: Flag::Seen,
                uids: remote_uids,
            },
            DeletePolicy::OnDelete => match (&config.trash_folder, trash_uids) {
                (Some(trash), Some(trash_uids)) => {
                    let remap = uids
                        .iter()
                        .zip(trash_uids)
                        .filter(|(u, _)| !uid::is_local(u))
                        .map(|(_, t)| t)
                        .collect();
                    PendingCommand::MoveOrCopy {
                        src: folder.to_string(),
                        dest: trash.clone(),
                        is_copy: false,
                        uids: remote_uids,
                        remap: Some(remap),
                    }
                }
                _ => PendingCommand::SetFlag {
                    folder: folder.to_string(),
                    value: true,
                    flag: Flag::Deleted,
                    uids: remote_uids,
                },
            },
        };
        queue_pending(account, &command)?;
        Ok(())
    }

    fn move_or_copy(
        ctx: &Context<'_>,
        src: &str,
        dest: &str,
        uids: &[String],
        is_copy: bool,
    ) -> Result<()> {
        let account = ctx.account;
        let capabilities = account.remote().capabilities();
        let supported = if is_copy {
            capabilities.copy
        } else {
            capabilities.move_messages
        };
        if !supported {
            return Err(Error::Unsupported(format!(
                "{} on account {}",
                if is_copy { "copy" } else { "move" },
                account.id()
            )));
        }
        // Placeholders have not reached the server yet and cannot be moved
        // there.
        let uids: Vec<String> = uids.iter().filter(|u| !uid::is_local(u)).cloned().collect();
        if uids.is_empty() {
            return Ok(());
        }

        let local_src = account.local_folder(src)?;
        let local_dest = account.local_folder(dest)?;
        if !local_dest.exists()? {
            local_dest.create()?;
        }
        let map = if is_copy {
            local_src.copy_messages(&uids, local_dest.as_ref())?
        } else {
            local_src.move_messages(&uids, local_dest.as_ref())?
        };
        if !is_copy {
            for (old_uid, new_uid) in &map {
                ctx.emit(Event::MessageUidChanged {
                    account: account.id(),
                    folder: src.to_string(),
                    old_uid: old_uid.clone(),
                    new_uid: new_uid.clone(),
                });
            }
        }
        let moved: Vec<String> = uids.iter().filter(|u| map.contains_key(*u)).cloned().collect();
        if moved.is_empty() {
            return Ok(());
        }
        let remap = moved
            .iter()
            .map(|u| map.get(u).cloned().unwrap_or_default())
            .collect();
        queue_pending(
            account,
            &PendingCommand::MoveOrCopy {
                src: src.to_string(),
                dest: dest.to_string(),
                is_copy,
                uids: moved,
                remap: Some(remap),
            },
        )?;
        Ok(())
    }

    fn check_account(
        self: &Arc<Self>,
        account: &Arc<Account>,
        ignore_last_checked: bool,
        listener: &CommandListener,
    ) -> Result<()> {
        let id = account.id();
        let config = account.config();
        if !account.is_available() {
            info!(account = %id, "Storage unavailable, skipping mail check");
            return Ok(());
        }
        let interval = config.check_interval();
        if interval.is_none() && !ignore_last_checked {
            debug!(account = %id, "Polling disabled, skipping mail check");
            return Ok(());
        }

        account.reset_ring();
        self.send_pending(id, listener.clone());

        let mut folders: BTreeSet<String> = match &config.sync_folders {
            Some(folders) => folders.iter().cloned().collect(),
            None => account.local().folders()?.into_iter().collect(),
        };
        folders.insert(config.inbox_folder.clone());
        let now = Utc::now();
        for folder in folders {
            if config.is_local_only(&folder) {
                continue;
            }
            if !ignore_last_checked {
                let last_checked = account.local_folder(&folder)?.last_checked()?;
                if let (Some(last), Some(interval)) = (last_checked, interval)
                    && now - last < interval
                {
                    debug!(account = %id, folder, "Checked recently, skipping");
                    continue;
                }
            }
            self.synchronize_mailbox(account, &folder, listener.clone(), Priority::Background);
        }

        self.submit(
            format!("finish mail check {id}"),
            listener.clone(),
            Priority::Background,
            move |inner, _| {
                let account = inner.account(id)?;
                account.reset_ring();
                inner.notifications.clear_if_read(&account);
                Ok(())
            },
        );
        Ok(())
    }
}

impl Controller {
    /// Queues a reconciliation of `folder`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn synchronize_mailbox(
        &self,
        account: AccountId,
        folder: &str,
        listener: CommandListener,
    ) -> Result<()> {
        let account = self.inner.account(account)?;
        self.inner
            .synchronize_mailbox(&account, folder, listener, Priority::Background);
        Ok(())
    }

    /// Queues delivery of every message in the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn send_pending_messages(&self, account: AccountId, listener: CommandListener) -> Result<()> {
        self.inner.account(account)?;
        self.inner.send_pending(account, listener);
        Ok(())
    }

    /// Places a message in the outbox and queues delivery.
    ///
    /// Returns the message's local UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the account is unknown or the outbox cannot be
    /// written.
    pub fn send_message(
        &self,
        account: AccountId,
        message: &Message,
        listener: CommandListener,
    ) -> Result<String> {
        let account = self.inner.account(account)?;
        let outbox = account.local_folder(&account.config().outbox_folder)?;
        if !outbox.exists()? {
            outbox.create()?;
        }
        let local_uid = uid::new_local();
        outbox.store(&message.clone().with_uid(local_uid.clone()))?;
        self.inner.send_pending(account.id(), listener);
        Ok(local_uid)
    }

    /// Stores a draft locally and queues its upload. An existing draft is
    /// replaced.
    ///
    /// Returns the draft's local UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the account is unknown, has no drafts folder or
    /// the draft cannot be stored.
    pub fn save_draft(
        &self,
        account: AccountId,
        message: &Message,
        replaces: Option<&str>,
    ) -> Result<String> {
        let account = self.inner.account(account)?;
        let drafts = account
            .config()
            .drafts_folder
            .clone()
            .ok_or_else(|| Error::FolderNotFound("drafts".into()))?;
        let local = account.local_folder(&drafts)?;
        if !local.exists()? {
            local.create()?;
        }
        let local_uid = uid::new_local();
        let draft = message
            .clone()
            .with_uid(local_uid.clone())
            .with_flag(Flag::Seen, true)
            .with_flag(Flag::Draft, true);
        local.store(&draft)?;
        queue_pending(
            &account,
            &PendingCommand::Append {
                folder: drafts.clone(),
                uid: local_uid.clone(),
            },
        )?;
        if let Some(old) = replaces {
            let old = vec![old.to_string()];
            self.delete_messages(account.id(), &drafts, &old, None)?;
        } else {
            self.inner.process_pending(account.id(), None);
        }
        Ok(local_uid)
    }

    /// Queues a move of messages between folders.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn move_messages(
        &self,
        account: AccountId,
        src: &str,
        uids: &[String],
        dest: &str,
        listener: CommandListener,
    ) -> Result<()> {
        self.transfer(account, src, uids, dest, false, listener)
    }

    /// Queues a copy of messages between folders.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn copy_messages(
        &self,
        account: AccountId,
        src: &str,
        uids: &[String],
        dest: &str,
        listener: CommandListener,
    ) -> Result<()> {
        self.transfer(account, src, uids, dest, true, listener)
    }

    fn transfer(
        &self,
        account: AccountId,
        src: &str,
        uids: &[String],
        dest: &str,
        is_copy: bool,
        listener: CommandListener,
    ) -> Result<()> {
        self.inner.account(account)?;
        let (src, dest, uids) = (src.to_string(), dest.to_string(), uids.to_vec());
        let verb = if is_copy { "copy" } else { "move" };
        self.inner.submit(
            format!("{verb} {account}:{src} -> {dest}"),
            listener,
            Priority::Foreground,
            move |inner, listener| {
                let account = inner.account(account)?;
                let ctx = inner.context(&account, listener);
                Inner::move_or_copy(&ctx, &src, &dest, &uids, is_copy)?;
                pending::replay(&ctx).map(|_| ())
            },
        );
        Ok(())
    }

    /// Deletes messages: moves them to the trash, or marks them deleted when
    /// they already are in the trash.
    ///
    /// The messages are hidden from synchronization until the command runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn delete_messages(
        &self,
        account: AccountId,
        folder: &str,
        uids: &[String],
        listener: CommandListener,
    ) -> Result<()> {
        self.inner.account(account)?;
        self.inner.suppressed.suppress(account, folder, uids);
        let (folder, uids) = (folder.to_string(), uids.to_vec());
        self.inner.submit(
            format!("delete {account}:{folder}"),
            listener,
            Priority::Background,
            move |inner, listener| {
                let result = inner.account(account).and_then(|acct| {
                    let ctx = inner.context(&acct, listener);
                    Inner::delete_messages(&ctx, &folder, &uids)?;
                    pending::replay(&ctx).map(|_| ())
                });
                inner.suppressed.unsuppress(account, &folder, &uids);
                result
            },
        );
        Ok(())
    }

    /// Sets or clears a flag.
    ///
    /// The local copies change before this returns. The server is updated
    /// by a queued command.
    ///
    /// # Errors
    ///
    /// Returns an error if the account is unknown or the local store cannot
    /// be updated.
    pub fn set_flag(
        &self,
        account: AccountId,
        folder: &str,
        uids: &[String],
        flag: Flag,
        value: bool,
    ) -> Result<()> {
        let account = self.inner.account(account)?;
        self.inner.set_flag(&account, folder, uids, flag, value)
    }

    /// Marks every message in a folder as read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn mark_all_messages_read(
        &self,
        account: AccountId,
        folder: &str,
        listener: CommandListener,
    ) -> Result<()> {
        self.inner.account(account)?;
        let folder = folder.to_string();
        self.inner.submit(
            format!("mark all read {account}:{folder}"),
            listener,
            Priority::Background,
            move |inner, listener| {
                let account = inner.account(account)?;
                let ctx = inner.context(&account, listener);
                let local = account.local_folder(&folder)?;
                local.set_flags_all(&[Flag::Seen], true)?;
                ctx.emit(Event::FolderStatusChanged {
                    account: account.id(),
                    folder: folder.clone(),
                    unread: local.unread_count()?,
                });
                inner.notifications.clear_if_read(&account);
                if account.config().is_local_only(&folder) {
                    return Ok(());
                }
                queue_pending(
                    &account,
                    &PendingCommand::MarkAllAsRead {
                        folder: folder.clone(),
                    },
                )?;
                pending::replay(&ctx).map(|_| ())
            },
        );
        Ok(())
    }

    /// Marks everything in the trash deleted and queues the server purge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn empty_trash(&self, account: AccountId, listener: CommandListener) -> Result<()> {
        self.inner.account(account)?;
        self.inner.submit(
            format!("empty trash {account}"),
            listener,
            Priority::Background,
            move |inner, listener| {
                let account = inner.account(account)?;
                let Some(trash) = account.config().trash_folder.clone() else {
                    warn!(account = %account.id(), "No trash folder configured");
                    return Ok(());
                };
                let ctx = inner.context(&account, listener);
                account.local_folder(&trash)?.set_flags_all(&[Flag::Deleted], true)?;
                ctx.emit(Event::EmptyTrashCompleted {
                    account: account.id(),
                });
                queue_pending(&account, &PendingCommand::EmptyTrash)?;
                pending::replay(&ctx).map(|_| ())
            },
        );
        Ok(())
    }

    /// Queues an expunge of a remote folder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn expunge(&self, account: AccountId, folder: &str, listener: CommandListener) -> Result<()> {
        self.inner.account(account)?;
        let folder = folder.to_string();
        self.inner.submit(
            format!("expunge {account}:{folder}"),
            listener,
            Priority::Background,
            move |inner, listener| {
                let account = inner.account(account)?;
                queue_pending(
                    &account,
                    &PendingCommand::Expunge {
                        folder: folder.clone(),
                    },
                )?;
                pending::replay(&inner.context(&account, listener)).map(|_| ())
            },
        );
        Ok(())
    }

    /// Queues compaction of the local store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn compact(&self, account: AccountId, listener: CommandListener) -> Result<()> {
        self.resize(account, false, listener)
    }

    /// Queues removal of every locally stored message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn clear(&self, account: AccountId, listener: CommandListener) -> Result<()> {
        self.resize(account, true, listener)
    }

    fn resize(&self, account: AccountId, clear: bool, listener: CommandListener) -> Result<()> {
        self.inner.account(account)?;
        let verb = if clear { "clear" } else { "compact" };
        self.inner.submit(
            format!("{verb} {account}"),
            listener,
            Priority::Background,
            move |inner, listener| {
                let account = inner.account(account)?;
                let local = account.local();
                let old_size = local.size()?;
                if clear {
                    local.clear()?;
                    local.reset_visible_limits(account.config().display_count)?;
                } else {
                    local.compact()?;
                }
                let new_size = local.size()?;
                info!(account = %account.id(), old_size, new_size, "Local store resized");
                inner.emit(
                    listener,
                    Event::AccountSizeChanged {
                        account: account.id(),
                        old_size,
                        new_size,
                    },
                );
                if clear {
                    inner.emit(
                        listener,
                        Event::AccountStatusChanged {
                            account: account.id(),
                            stats: account.stats()?,
                        },
                    );
                }
                Ok(())
            },
        );
        Ok(())
    }

    /// Checks one account, or every account when `account` is `None`.
    ///
    /// Sends the outbox and queues a background reconciliation of each
    /// synchronized folder not checked within the account's interval.
    /// `ignore_last_checked` forces every folder and also checks accounts
    /// with polling disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn check_mail(
        &self,
        account: Option<AccountId>,
        ignore_last_checked: bool,
        listener: CommandListener,
    ) -> Result<()> {
        if let Some(id) = account {
            self.inner.account(id)?;
        }
        self.inner.submit(
            "check mail",
            listener.clone(),
            Priority::Background,
            move |inner, command_listener| {
                inner.emit(command_listener, Event::CheckMailStarted { account });
                let accounts = match account {
                    Some(id) => vec![inner.account(id)?],
                    None => inner.all_accounts(),
                };
                for acct in &accounts {
                    if let Err(err) = inner.check_account(acct, ignore_last_checked, &listener) {
                        if err.is_storage_unavailable() {
                            return Err(err);
                        }
                        warn!(account = %acct.id(), error = %err, "Mail check failed");
                    }
                }
                inner.submit(
                    "finish check mail",
                    listener.clone(),
                    Priority::Background,
                    move |inner, listener| {
                        inner.emit(listener, Event::CheckMailFinished { account });
                        Ok(())
                    },
                );
                Ok(())
            },
        );
        Ok(())
    }

    /// Raises a folder's visible limit by the account's display count and
    /// queues a reconciliation.
    ///
    /// # Errors
    ///
    /// Returns an error if the account is unknown or the limit cannot be
    /// stored.
    pub fn load_more_messages(
        &self,
        account: AccountId,
        folder: &str,
        listener: CommandListener,
    ) -> Result<()> {
        let account = self.inner.account(account)?;
        let local = account.local_folder(folder)?;
        let step = account.config().display_count;
        let current = local.visible_limit()?.unwrap_or(step);
        if current > 0 {
            local.set_visible_limit(Some(current + step))?;
        }
        self.inner
            .synchronize_mailbox(&account, folder, listener, Priority::Foreground);
        Ok(())
    }

    /// Drops every entry of the pending-command log.
    ///
    /// # Errors
    ///
    /// Returns an error if the account is unknown or the log cannot be
    /// cleared.
    pub fn clear_all_pending(&self, account: AccountId) -> Result<()> {
        let account = self.inner.account(account)?;
        account.local().remove_all_pending_commands()?;
        info!(account = %account.id(), "Pending commands cleared");
        Ok(())
    }
}
