//! Completing messages from the server when a reader opens them.

use mailsync_store::{FetchItem, Flag, Message, OpenMode, Part, RemoteFolder, uid};
use tracing::{debug, warn};

use super::{CommandListener, Controller};
use crate::account::{Account, AccountId};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::Priority;

fn open_for_reading(account: &Account, folder: &str) -> Result<Box<dyn RemoteFolder>> {
    let mut remote = account.remote().folder(folder)?;
    if !remote.exists()? {
        return Err(Error::FolderNotFound(folder.to_string()));
    }
    remote.open(OpenMode::ReadOnly)?;
    Ok(remote)
}

fn stored_message(account: &Account, folder: &str, uid: &str) -> Result<Message> {
    account
        .local_folder(folder)?
        .message(uid)?
        .ok_or_else(|| Error::MessageNotFound {
            folder: folder.to_string(),
            uid: uid.to_string(),
        })
}

/// Returns the complete message, fetching its body from the server unless
/// it is already fully downloaded.
pub(crate) fn download_full(ctx: &Context<'_>, folder: &str, uid: &str) -> Result<Message> {
    let account = ctx.account;
    let mut message = stored_message(account, folder, uid)?;
    if message.flags.contains(Flag::DownloadedFull) || uid::is_local(uid) {
        return Ok(message);
    }

    debug!(account = %account.id(), folder, uid, "Downloading complete message");
    let remote = open_for_reading(account, folder)?;
    let fetched = remote
        .fetch(&[uid.to_string()], &FetchItem::Body.into())?
        .into_iter()
        .next()
        .ok_or_else(|| Error::MessageNotFound {
            folder: folder.to_string(),
            uid: uid.to_string(),
        })?;
    message.parts = fetched.parts;
    message.body = fetched.body;
    message.flags.remove(Flag::DownloadedPartial);
    message.flags.insert(Flag::DownloadedFull);

    account.local_folder(folder)?.store(&message)?;
    ctx.emit(Event::LocalMessageUpdated {
        account: account.id(),
        folder: folder.to_string(),
        message: message.clone(),
    });
    Ok(message)
}

/// Returns one part of a stored message with its content, fetching the
/// content from the server when it is missing locally.
pub(crate) fn download_part(
    ctx: &Context<'_>,
    folder: &str,
    uid: &str,
    part_id: &str,
) -> Result<Part> {
    let account = ctx.account;
    let mut message = stored_message(account, folder, uid)?;
    let not_found = || Error::PartNotFound {
        uid: uid.to_string(),
        part_id: part_id.to_string(),
    };
    let index = message
        .parts
        .iter()
        .position(|p| p.id == part_id)
        .ok_or_else(not_found)?;
    if message.parts[index].content.is_some() {
        return Ok(message.parts[index].clone());
    }

    debug!(account = %account.id(), folder, uid, part_id, "Downloading attachment");
    let remote = open_for_reading(account, folder)?;
    let content = remote
        .fetch_parts(uid, &[part_id.to_string()])?
        .into_iter()
        .find(|p| p.id == part_id)
        .and_then(|p| p.content)
        .ok_or_else(not_found)?;
    message.parts[index].content = Some(content);

    account.local_folder(folder)?.store(&message)?;
    ctx.emit(Event::LocalMessageUpdated {
        account: account.id(),
        folder: folder.to_string(),
        message: message.clone(),
    });
    Ok(message.parts.swap_remove(index))
}

impl Controller {
    /// Loads a message for display, first downloading whatever the
    /// synchronization left out, and marks it read.
    ///
    /// Emits [`Event::MessageLoaded`] on success and
    /// [`Event::MessageLoadFailed`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn load_message_for_view_remote(
        &self,
        account: AccountId,
        folder: &str,
        uid: &str,
        listener: CommandListener,
    ) -> Result<()> {
        self.inner.account(account)?;
        let (folder, uid) = (folder.to_string(), uid.to_string());
        self.inner.submit(
            format!("load remote message {account}:{folder}:{uid}"),
            listener,
            Priority::Foreground,
            move |inner, listener| {
                let acct = inner.account(account)?;
                let ctx = inner.context(&acct, listener);
                match download_full(&ctx, &folder, &uid) {
                    Ok(message) => {
                        let seen = message.flags.is_seen();
                        ctx.emit(Event::MessageLoaded {
                            account,
                            folder: folder.clone(),
                            message,
                        });
                        if !seen {
                            inner.set_flag(&acct, &folder, &[uid.clone()], Flag::Seen, true)?;
                        }
                        Ok(())
                    }
                    Err(err) if err.is_storage_unavailable() => Err(err),
                    Err(err) => {
                        warn!(account = %account, folder, uid, error = %err, "Loading message failed");
                        ctx.emit(Event::MessageLoadFailed {
                            account,
                            folder: folder.clone(),
                            uid: uid.clone(),
                            message: err.root_message(),
                        });
                        Ok(())
                    }
                }
            },
        );
        Ok(())
    }

    /// Downloads the content of one message part.
    ///
    /// Emits [`Event::AttachmentLoaded`] on success and
    /// [`Event::AttachmentLoadFailed`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown account.
    pub fn load_attachment(
        &self,
        account: AccountId,
        folder: &str,
        uid: &str,
        part_id: &str,
        listener: CommandListener,
    ) -> Result<()> {
        self.inner.account(account)?;
        let (folder, uid, part_id) = (folder.to_string(), uid.to_string(), part_id.to_string());
        self.inner.submit(
            format!("load attachment {account}:{folder}:{uid}:{part_id}"),
            listener,
            Priority::Foreground,
            move |inner, listener| {
                let acct = inner.account(account)?;
                let ctx = inner.context(&acct, listener);
                match download_part(&ctx, &folder, &uid, &part_id) {
                    Ok(part) => {
                        ctx.emit(Event::AttachmentLoaded {
                            account,
                            folder: folder.clone(),
                            uid: uid.clone(),
                            part,
                        });
                        Ok(())
                    }
                    Err(err) if err.is_storage_unavailable() => Err(err),
                    Err(err) => {
                        warn!(account = %account, folder, uid, part_id, error = %err, "Loading attachment failed");
                        ctx.emit(Event::AttachmentLoadFailed {
                            account,
                            folder: folder.clone(),
                            uid: uid.clone(),
                            part_id: part_id.clone(),
                            message: err.root_message(),
                        });
                        Ok(())
                    }
                }
            },
        );
        Ok(())
    }
}
