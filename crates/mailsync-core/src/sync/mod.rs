//! Mailbox reconciliation.
//!
//! A pass over one folder replays pending commands, lists the visible
//! window of the remote folder, removes local messages the server no
//! longer has, downloads what is missing and brings flags up to date.

mod download;

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use mailsync_store::{LocalFolder, Message, OpenMode, uid};
use tracing::{debug, error, info, warn};

use crate::account::{Account, AccountId};
use crate::config::ExpungePolicy;
use crate::context::Context;
use crate::error::Result;
use crate::event::Event;
use crate::pending;

pub(crate) use download::{download, sync_flags};

/// Messages with a local delete in flight. Synchronization skips them so a
/// deleted message does not reappear before the server catches up.
#[derive(Debug, Default)]
pub struct Suppressed {
    uids: Mutex<HashSet<(AccountId, String, String)>>,
}

impl Suppressed {
    fn key(account: AccountId, folder: &str, uid: &str) -> (AccountId, String, String) {
        (account, folder.to_string(), uid.to_string())
    }

    /// Hides messages from synchronization.
    pub fn suppress(&self, account: AccountId, folder: &str, uids: &[String]) {
        let mut set = self.uids.lock().unwrap_or_else(PoisonError::into_inner);
        for uid in uids {
            set.insert(Self::key(account, folder, uid));
        }
    }

    /// Makes messages visible to synchronization again.
    pub fn unsuppress(&self, account: AccountId, folder: &str, uids: &[String]) {
        let mut set = self.uids.lock().unwrap_or_else(PoisonError::into_inner);
        for uid in uids {
            set.remove(&Self::key(account, folder, uid));
        }
    }

    /// Returns true if the message is hidden.
    #[must_use]
    pub fn contains(&self, account: AccountId, folder: &str, uid: &str) -> bool {
        self.uids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&Self::key(account, folder, uid))
    }
}

/// Resolves a folder's visible limit. `None` means unlimited.
pub(crate) fn visible_limit(account: &Account, local: &dyn LocalFolder) -> Result<Option<usize>> {
    let limit = local
        .visible_limit()?
        .unwrap_or(account.config().display_count);
    Ok((limit > 0).then_some(limit))
}

/// Synchronizes one folder, reporting failures through events.
///
/// Only unavailable storage is returned as an error so that the worker
/// can retry the pass later.
pub(crate) fn synchronize(ctx: &Context<'_>, folder: &str) -> Result<()> {
    let account = ctx.account;
    ctx.emit(Event::SyncStarted {
        account: account.id(),
        folder: folder.to_string(),
    });
    if account.config().is_local_only(folder) {
        finish_empty(ctx, folder);
        return Ok(());
    }

    match run(ctx, folder) {
        Ok(()) => Ok(()),
        Err(err) if err.is_storage_unavailable() => Err(err),
        Err(err) => {
            let message = err.root_message();
            error!(account = %account.id(), folder, error = %message, "Synchronization failed");
            match account.local_folder(folder) {
                Ok(local) => {
                    let now = Utc::now();
                    if let Err(err) = local
                        .set_status(Some(&message))
                        .and_then(|()| local.set_last_checked(now))
                    {
                        warn!(folder, error = %err, "Could not record folder status");
                    }
                }
                Err(err) => warn!(folder, error = %err, "Could not record folder status"),
            }
            if err.is_certificate() {
                ctx.notifications
                    .sink()
                    .show_certificate_error(account.id(), &message);
            }
            ctx.emit(Event::SyncFailed {
                account: account.id(),
                folder: folder.to_string(),
                message: message.clone(),
            });
            ctx.report(&format!("Synchronizing {folder} failed"), &message);
            Ok(())
        }
    }
}

fn finish_empty(ctx: &Context<'_>, folder: &str) {
    ctx.emit(Event::SyncFinished {
        account: ctx.account.id(),
        folder: folder.to_string(),
        total: 0,
        new: 0,
    });
}

fn run(ctx: &Context<'_>, folder: &str) -> Result<()> {
    let account = ctx.account;
    let id = account.id();
    let config = account.config();

    let pending_failure = match pending::replay(ctx) {
        Ok(_) => None,
        Err(err) if err.is_storage_unavailable() => return Err(err),
        Err(err) => {
            let message = err.root_message();
            ctx.report("Processing pending commands failed", &message);
            Some(message)
        }
    };

    let local = account.local_folder(folder)?;
    if !local.exists()? {
        local.create()?;
    }
    let mut local_messages: HashMap<String, Message> = local
        .messages()?
        .into_iter()
        .map(|m| (m.uid.clone(), m))
        .collect();

    let mut remote = account.remote().folder(folder)?;
    if !remote.exists()? {
        if !config.is_special(folder) {
            debug!(account = %id, folder, "Remote folder does not exist");
            finish_empty(ctx, folder);
            return Ok(());
        }
        if !remote.create()? {
            info!(account = %id, folder, "Could not create remote folder");
            finish_empty(ctx, folder);
            return Ok(());
        }
    }

    remote.open(OpenMode::ReadWrite)?;
    if config.expunge_policy == ExpungePolicy::OnPoll && remote.mode() == Some(OpenMode::ReadWrite) {
        remote.expunge()?;
    }

    let count = remote.message_count()?;
    let limit = visible_limit(account, local.as_ref())?;
    let earliest = config.earliest_poll_date();
    ctx.emit(Event::SyncHeadersStarted {
        account: id,
        folder: folder.to_string(),
    });
    let window = if count == 0 {
        Vec::new()
    } else {
        let start = limit.map_or(1, |limit| count.saturating_sub(limit) + 1);
        remote.messages(start.max(1), count, earliest)?
    };
    for completed in 1..=window.len() {
        ctx.emit(Event::SyncHeadersProgress {
            account: id,
            folder: folder.to_string(),
            completed,
            total: window.len(),
        });
    }
    ctx.emit(Event::SyncHeadersFinished {
        account: id,
        folder: folder.to_string(),
        total: count,
        fetched: window.len(),
    });

    if config.sync_remote_deletions {
        let remote_uids: HashSet<&str> = window.iter().map(|m| m.uid.as_str()).collect();
        let mut gone: Vec<String> = local_messages
            .keys()
            .filter(|u| !uid::is_local(u) && !remote_uids.contains(u.as_str()))
            .cloned()
            .collect();
        uid::sort_newest_first(&mut gone, String::as_str);
        for uid in gone {
            local.destroy(&uid)?;
            local_messages.remove(&uid);
            ctx.emit(Event::SyncRemoved {
                account: id,
                folder: folder.to_string(),
                uid: uid.clone(),
            });
            ctx.resolve(folder, &uid);
        }
    }

    let new = download(
        ctx,
        remote.as_ref(),
        local.as_ref(),
        window,
        &local_messages,
        limit,
    )?;

    let unread = local.unread_count()?;
    ctx.emit(Event::FolderStatusChanged {
        account: id,
        folder: folder.to_string(),
        unread,
    });
    local.set_last_checked(Utc::now())?;
    local.set_status(None)?;
    remote.close();
    info!(account = %id, folder, total = count, new, "Synchronized folder");
    ctx.emit(Event::SyncFinished {
        account: id,
        folder: folder.to_string(),
        total: count,
        new,
    });

    if let Some(failure) = pending_failure {
        local.set_status(Some(&failure))?;
        ctx.emit(Event::SyncFailed {
            account: id,
            folder: folder.to_string(),
            message: failure,
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mailsync_store::memory::Operation;
    use mailsync_store::{Address, Flag, LocalStore, Store};

    use super::*;
    use crate::context::fixture::Fixture;

    fn remote_message(uid: &str) -> Message {
        let mut message = Message::new(uid);
        message.subject = Some(format!("Message {uid}"));
        message.from = vec![Address::new("alice@example.com")];
        message.body = Some(format!("Body of {uid}"));
        message.size = 100;
        message
    }

    fn downloaded(uid: &str) -> Message {
        remote_message(uid).with_flag(Flag::DownloadedFull, true)
    }

    fn message_events(events: &[Event]) -> Vec<&Event> {
        events.iter().filter(|e| e.is_message_change()).collect()
    }

    #[test]
    fn test_reconcile_removes_and_downloads() {
        let fixture = Fixture::new();
        let inbox = fixture.local.folder("INBOX").unwrap();
        for uid in ["1", "2", "3"] {
            inbox.store(&downloaded(uid)).unwrap();
        }
        for uid in ["2", "3", "4"] {
            fixture.remote.insert("INBOX", remote_message(uid));
        }

        synchronize(&fixture.context(), "INBOX").unwrap();

        let mut uids: Vec<String> = inbox.messages().unwrap().into_iter().map(|m| m.uid).collect();
        uids.sort();
        assert_eq!(uids, vec!["2", "3", "4"]);

        let events = fixture.take_events();
        let removed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::SyncRemoved { uid, .. } if uid == "1"))
            .collect();
        let added: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::SyncAddOrUpdate { message, .. } if message.uid == "4"))
            .collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(added.len(), 1);
        assert_eq!(message_events(&events).len(), 3, "removed, added and new");
        assert!(events.contains(&Event::SyncFinished {
            account: fixture.account.id(),
            folder: "INBOX".into(),
            total: 3,
            new: 1,
        }));
        let stored = inbox.message("4").unwrap().unwrap();
        assert!(stored.flags.contains(Flag::DownloadedFull));
        assert_eq!(stored.body.as_deref(), Some("Body of 4"));
    }

    #[test]
    fn test_second_pass_is_quiet() {
        let fixture = Fixture::new();
        for uid in ["5", "6"] {
            fixture.remote.insert("INBOX", remote_message(uid));
        }
        synchronize(&fixture.context(), "INBOX").unwrap();
        fixture.take_events();
        let inbox = fixture.local.folder("INBOX").unwrap();
        let before = inbox.messages().unwrap();

        synchronize(&fixture.context(), "INBOX").unwrap();

        let events = fixture.take_events();
        assert!(message_events(&events).is_empty());
        let mut after = inbox.messages().unwrap();
        let mut before = before;
        before.sort_by(|a, b| a.uid.cmp(&b.uid));
        after.sort_by(|a, b| a.uid.cmp(&b.uid));
        assert_eq!(before, after);
        assert!(inbox.last_checked().unwrap().is_some());
    }

    #[test]
    fn test_visible_limit_keeps_newest() {
        let fixture = Fixture::new();
        let inbox = fixture.local.folder("INBOX").unwrap();
        inbox.set_visible_limit(Some(10)).unwrap();
        for uid in 1..=30 {
            fixture.remote.insert("INBOX", remote_message(&uid.to_string()));
        }
        // Older copies the window no longer covers.
        for uid in ["3", "4"] {
            inbox.store(&downloaded(uid)).unwrap();
        }

        synchronize(&fixture.context(), "INBOX").unwrap();

        let mut uids: Vec<u64> = inbox
            .messages()
            .unwrap()
            .iter()
            .filter_map(|m| uid::numeric(&m.uid))
            .collect();
        uids.sort_unstable();
        assert_eq!(uids, (21..=30).collect::<Vec<_>>());
    }

    #[test]
    fn test_flag_changes_are_synced() {
        let fixture = Fixture::new();
        fixture.remote.insert("INBOX", remote_message("8"));
        synchronize(&fixture.context(), "INBOX").unwrap();
        fixture.take_events();

        fixture.remote.set_flag("INBOX", "8", Flag::Seen, true);
        synchronize(&fixture.context(), "INBOX").unwrap();

        let inbox = fixture.local.folder("INBOX").unwrap();
        assert!(inbox.message("8").unwrap().unwrap().flags.is_seen());
        let events = fixture.take_events();
        assert_eq!(message_events(&events).len(), 1);
    }

    #[test]
    fn test_large_message_downloaded_partially() {
        let fixture = Fixture::new();
        let mut big = remote_message("9");
        big.size = 1024 * 1024;
        big.body = None;
        big.parts = vec![
            mailsync_store::Part {
                id: "1".into(),
                mime_type: "text/plain".into(),
                size: 20,
                content: Some("readable".into()),
            },
            mailsync_store::Part {
                id: "2".into(),
                mime_type: "application/pdf".into(),
                size: 1024 * 1000,
                content: Some("binary".into()),
            },
        ];
        fixture.remote.insert("INBOX", big);

        synchronize(&fixture.context(), "INBOX").unwrap();

        let stored = fixture.local.folder("INBOX").unwrap().message("9").unwrap().unwrap();
        assert!(stored.flags.contains(Flag::DownloadedPartial));
        assert_eq!(stored.parts[0].content.as_deref(), Some("readable"));
        assert_eq!(stored.parts[1].content, None);
    }

    #[test]
    fn test_missing_special_folder_is_created() {
        let fixture = Fixture::new();
        synchronize(&fixture.context(), "Sent").unwrap();
        assert!(fixture.remote.list_folders().unwrap().contains(&"Sent".to_string()));
    }

    #[test]
    fn test_failure_sets_status_and_reports() {
        let fixture = Fixture::new();
        fixture.remote.add_folder("INBOX");
        fixture.remote.fail_next(
            Operation::Open,
            mailsync_store::Error::Timeout(std::time::Duration::from_secs(30)),
        );

        synchronize(&fixture.context(), "INBOX").unwrap();

        let inbox = fixture.local.folder("INBOX").unwrap();
        assert!(inbox.status().unwrap().unwrap().contains("timed out"));
        assert!(fixture
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::SyncFailed { .. })));
        assert_eq!(fixture.local.folder("Errors").unwrap().messages().unwrap().len(), 1);
    }

    #[test]
    fn test_unavailable_storage_is_returned() {
        let fixture = Fixture::new();
        fixture.local.set_available(false);
        let err = synchronize(&fixture.context(), "INBOX").unwrap_err();
        assert!(err.is_storage_unavailable());
    }

    #[test]
    fn test_suppressed_messages_are_skipped() {
        let fixture = Fixture::new();
        fixture.remote.insert("INBOX", remote_message("12"));
        fixture
            .suppressed
            .suppress(fixture.account.id(), "INBOX", &["12".to_string()]);

        synchronize(&fixture.context(), "INBOX").unwrap();

        assert!(fixture.local.folder("INBOX").unwrap().message("12").unwrap().is_none());
    }

    #[test]
    fn test_outbox_is_never_synchronized() {
        let fixture = Fixture::new();
        synchronize(&fixture.context(), "Outbox").unwrap();
        let events = fixture.take_events();
        assert_eq!(events.len(), 2);
        assert!(fixture.local.folders().unwrap().is_empty());
    }
}
