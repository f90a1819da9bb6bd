//! Outbox delivery.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use mailsync_store::{Flag, LocalFolder, Message};
use tracing::{error, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::notify::SendFailureTarget;
use crate::pending::{PendingCommand, queue_pending};

/// Send attempts per outbox message.
///
/// Counts live only in memory, so a restart grants every message a fresh
/// set of attempts.
#[derive(Debug, Default)]
pub struct SendCounts {
    attempts: Mutex<HashMap<String, u32>>,
}

impl SendCounts {
    /// Attempts made for `uid` so far.
    #[must_use]
    pub fn get(&self, uid: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .copied()
            .unwrap_or_default()
    }

    fn increment(&self, uid: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = attempts.entry(uid.to_string()).or_default();
        *count += 1;
        *count
    }

    /// Forgets the attempts made for `uid`.
    pub fn reset(&self, uid: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
    }
}

struct Failure {
    message: String,
    target: SendFailureTarget,
}

/// Sends every message in the outbox.
///
/// # Errors
///
/// Returns an error if local storage is unavailable or a local folder
/// operation fails. Transport failures are reported through events.
pub(crate) fn send_pending(ctx: &Context<'_>, counts: &SendCounts, max_attempts: u32) -> Result<()> {
    let account = ctx.account;
    let config = account.config();
    if !account.is_available() {
        return Err(Error::Store(mailsync_store::Error::StorageUnavailable(
            format!("local store for account {} is not available", account.id()),
        )));
    }

    let outbox = account.local_folder(&config.outbox_folder)?;
    ctx.emit(Event::SendStarted {
        account: account.id(),
    });

    let mut last_failure = None;
    for message in outbox.messages()? {
        if message.flags.is_deleted() {
            outbox.destroy(&message.uid)?;
            continue;
        }
        if counts.get(&message.uid) >= max_attempts {
            warn!(account = %account.id(), uid = %message.uid, "Send attempts exhausted, skipping");
            last_failure = Some(Failure {
                message: format!(
                    "Giving up on message {} after {max_attempts} attempts",
                    message.uid
                ),
                target: SendFailureTarget::Outbox,
            });
            continue;
        }
        if let Some(failure) = send_one(ctx, counts, outbox.as_ref(), &message)? {
            last_failure = Some(failure);
        }
    }

    match last_failure {
        None => ctx.emit(Event::SendCompleted {
            account: account.id(),
        }),
        Some(failure) => {
            ctx.emit(Event::SendFailed {
                account: account.id(),
                message: failure.message.clone(),
            });
            ctx.notifications
                .sink()
                .show_send_failed(account.id(), &failure.message, failure.target);
        }
    }
    Ok(())
}

fn send_one(
    ctx: &Context<'_>,
    counts: &SendCounts,
    outbox: &dyn LocalFolder,
    message: &Message,
) -> Result<Option<Failure>> {
    let account = ctx.account;
    let config = account.config();
    let uids = [message.uid.clone()];
    let attempt = counts.increment(&message.uid);

    outbox.set_flags(&uids, &[Flag::SendInProgress], true)?;
    let sent = account.transport().send(message);
    outbox.set_flags(&uids, &[Flag::SendInProgress], false)?;

    match sent {
        Ok(()) => {
            info!(account = %account.id(), uid = %message.uid, attempt, "Message sent");
            outbox.set_flags(&uids, &[Flag::Seen], true)?;
            counts.reset(&message.uid);
            match &config.sent_folder {
                Some(sent_folder) => file_into(ctx, outbox, &message.uid, sent_folder)?,
                None => outbox.destroy(&message.uid)?,
            }
            Ok(None)
        }
        Err(err) => {
            let detail = err.to_string();
            error!(account = %account.id(), uid = %message.uid, attempt, error = %detail, "Send failed");
            outbox.set_flags(&uids, &[Flag::SendFailed], true)?;
            ctx.emit(Event::SyncFailed {
                account: account.id(),
                folder: config.outbox_folder.clone(),
                message: detail.clone(),
            });
            ctx.report("Sending message failed", &detail);

            let target = match &config.drafts_folder {
                Some(drafts) if account.transport().is_permanent_failure(&err) => {
                    file_into(ctx, outbox, &message.uid, drafts)?;
                    counts.reset(&message.uid);
                    SendFailureTarget::Drafts
                }
                _ => SendFailureTarget::Outbox,
            };
            Ok(Some(Failure {
                message: detail,
                target,
            }))
        }
    }
}

/// Moves a message out of the outbox and queues its upload.
fn file_into(ctx: &Context<'_>, outbox: &dyn LocalFolder, uid: &str, folder: &str) -> Result<()> {
    let dest = ctx.account.local_folder(folder)?;
    if !dest.exists()? {
        dest.create()?;
    }
    let map = outbox.move_messages(&[uid.to_string()], dest.as_ref())?;
    if let Some(new_uid) = map.get(uid) {
        queue_pending(
            ctx.account,
            &PendingCommand::Append {
                folder: folder.to_string(),
                uid: new_uid.clone(),
            },
        )?;
    }
    Ok(())
}
