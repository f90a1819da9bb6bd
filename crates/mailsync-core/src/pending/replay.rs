//! Replays the pending-command log against the server.

use mailsync_store::{Flag, LocalFolder, OpenMode, RemoteFolder, uid};
use tracing::{debug, info, warn};

use super::PendingCommand;
use crate::account::Account;
use crate::config::ExpungePolicy;
use crate::context::Context;
use crate::error::{Disposition, Error, Result};
use crate::event::Event;

/// Outcome of a replay that ran to the end of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries removed from the log.
    pub processed: usize,
    /// Entries discarded because they can never succeed.
    pub permanent_failures: Vec<String>,
}

fn is_permanent(account: &Account, err: &Error) -> bool {
    match err.store_error() {
        Some(store) => !store.is_storage_unavailable() && account.remote().is_permanent_failure(store),
        None => err.disposition() == Disposition::Permanent,
    }
}

/// Runs every pending command in log order.
///
/// A command that fails permanently is reported and dropped. A transient
/// failure stops the replay and leaves that command first in the log.
pub(crate) fn replay(ctx: &Context<'_>) -> Result<ReplayReport> {
    let account = ctx.account;
    let id = account.id();
    let records = account.local().pending_commands()?;
    let mut report = ReplayReport::default();
    if records.is_empty() {
        return Ok(report);
    }

    ctx.emit(Event::PendingCommandsProcessing { account: id });
    let total = records.len();
    let mut outcome = Ok(());
    for (index, record) in records.iter().enumerate() {
        let title = record.command.clone();
        ctx.emit(Event::PendingCommandStarted {
            account: id,
            title: title.clone(),
        });
        debug!(account = %id, command = %title, args = ?record.args, "Replaying pending command");

        match PendingCommand::decode(record).and_then(|command| run(ctx, &command)) {
            Ok(()) => {}
            Err(err) if is_permanent(account, &err) => {
                let detail = err.root_message();
                warn!(account = %id, command = %title, error = %detail, "Dropping pending command");
                ctx.report(&format!("Pending command {title} failed"), &detail);
                report.permanent_failures.push(format!("{title}: {detail}"));
            }
            Err(err) => {
                warn!(account = %id, command = %title, error = %err, "Pending command failed, will retry");
                outcome = Err(err);
                break;
            }
        }

        if let Err(err) = account.local().remove_pending_command(record.id) {
            outcome = Err(err.into());
            break;
        }
        report.processed += 1;
        ctx.emit(Event::SyncProgress {
            account: id,
            folder: None,
            completed: index + 1,
            total,
        });
        ctx.emit(Event::PendingCommandCompleted { account: id, title });
    }
    ctx.emit(Event::PendingCommandsFinished { account: id });
    outcome.map(|()| report)
}

fn run(ctx: &Context<'_>, command: &PendingCommand) -> Result<()> {
    let config = ctx.account.config();
    if command.folder() == Some(config.error_folder.as_str()) {
        return Ok(());
    }
    match command {
        PendingCommand::Append { folder, uid } => append(ctx, folder, uid),
        PendingCommand::SetFlag {
            folder,
            value,
            flag,
            uids,
        } => set_flag(ctx, folder, *value, *flag, uids),
        PendingCommand::MoveOrCopy {
            src,
            dest,
            is_copy,
            uids,
            remap,
        } => move_or_copy(ctx, src, dest, *is_copy, uids, remap.as_deref()),
        PendingCommand::MarkAllAsRead { folder } => mark_all_as_read(ctx, folder),
        PendingCommand::Expunge { folder } => expunge(ctx, folder),
        PendingCommand::EmptyTrash => empty_trash(ctx),
    }
}

/// Opens a remote folder read-write. `None` if it is missing or the server
/// only grants read access.
fn open_writable(account: &Account, name: &str) -> Result<Option<Box<dyn RemoteFolder>>> {
    let mut remote = account.remote().folder(name)?;
    if !remote.exists()? {
        return Ok(None);
    }
    remote.open(OpenMode::ReadWrite)?;
    if remote.mode() != Some(OpenMode::ReadWrite) {
        return Ok(None);
    }
    Ok(Some(remote))
}

fn expunge_if_immediate(account: &Account, remote: &dyn RemoteFolder) -> Result<()> {
    if account.config().expunge_policy == ExpungePolicy::Immediately {
        remote.expunge()?;
    }
    Ok(())
}

/// Rewrites a local UID to the one the server assigned.
pub(crate) fn change_uid(
    ctx: &Context<'_>,
    local: &dyn LocalFolder,
    old_uid: &str,
    new_uid: &str,
) -> Result<()> {
    if old_uid == new_uid {
        return Ok(());
    }
    local.change_uid(old_uid, new_uid)?;
    ctx.emit(Event::MessageUidChanged {
        account: ctx.account.id(),
        folder: local.name().to_string(),
        old_uid: old_uid.to_string(),
        new_uid: new_uid.to_string(),
    });
    Ok(())
}

fn append(ctx: &Context<'_>, folder: &str, message_uid: &str) -> Result<()> {
    let account = ctx.account;
    let local = account.local_folder(folder)?;
    let Some(message) = local.message(message_uid)? else {
        return Ok(());
    };

    let remote = account.remote().folder(folder)?;
    if !remote.exists()? && !remote.create()? {
        info!(account = %account.id(), folder, "Cannot create remote folder, dropping upload");
        return Ok(());
    }
    let Some(mut remote) = open_writable(account, folder)? else {
        return Ok(());
    };

    let existing = if uid::is_local(message_uid) {
        None
    } else {
        remote.message(message_uid)?
    };

    match existing {
        None => {
            if message.flags.contains(Flag::RemoteCopyStarted) {
                // An earlier upload may have reached the server before we
                // learned its UID.
                if let Some(message_id) = message.message_id.as_deref() {
                    if let Some(server_uid) = remote.uid_from_message_id(message_id)? {
                        change_uid(ctx, local.as_ref(), message_uid, &server_uid)?;
                        remote.close();
                        return Ok(());
                    }
                }
            }
            let uids = [message_uid.to_string()];
            local.set_flags(&uids, &[Flag::RemoteCopyStarted], true)?;
            if let Some(server_uid) = remote.append(&message)? {
                change_uid(ctx, local.as_ref(), message_uid, &server_uid)?;
                local.set_flags(&[server_uid], &[Flag::RemoteCopyStarted], false)?;
            }
        }
        Some(remote_message) if remote_message.internal_date > message.internal_date => {
            debug!(uid = message_uid, "Server copy is newer, discarding local copy");
            local.destroy(message_uid)?;
        }
        Some(_) => {
            if let Some(server_uid) = remote.append(&message)? {
                change_uid(ctx, local.as_ref(), message_uid, &server_uid)?;
            }
            remote.set_flags(&[message_uid.to_string()], &[Flag::Deleted], true)?;
            expunge_if_immediate(account, remote.as_ref())?;
        }
    }
    remote.close();
    Ok(())
}

fn set_flag(ctx: &Context<'_>, folder: &str, value: bool, flag: Flag, uids: &[String]) -> Result<()> {
    let account = ctx.account;
    if flag != Flag::Deleted && !account.remote().capabilities().store_flags {
        return Ok(());
    }
    let uids: Vec<String> = uids.iter().filter(|u| !uid::is_local(u)).cloned().collect();
    if uids.is_empty() {
        return Ok(());
    }
    let Some(mut remote) = open_writable(account, folder)? else {
        return Ok(());
    };
    remote.set_flags(&uids, &[flag], value)?;
    remote.close();
    Ok(())
}

fn move_or_copy(
    ctx: &Context<'_>,
    src: &str,
    dest: &str,
    is_copy: bool,
    uids: &[String],
    remap: Option<&[String]>,
) -> Result<()> {
    let account = ctx.account;
    let mut remote = account.remote().folder(src)?;
    if !remote.exists()? {
        return Err(mailsync_store::Error::FolderNotFound(src.to_string()).into());
    }
    remote.open(OpenMode::ReadWrite)?;
    if remote.mode() != Some(OpenMode::ReadWrite) {
        return Err(mailsync_store::Error::ReadOnly(src.to_string()).into());
    }

    let pairs: Vec<(String, Option<String>)> = uids
        .iter()
        .enumerate()
        .filter(|(_, u)| !uid::is_local(u))
        .map(|(i, u)| (u.clone(), remap.and_then(|r| r.get(i).cloned())))
        .collect();
    if pairs.is_empty() {
        return Ok(());
    }
    let server_uids: Vec<String> = pairs.iter().map(|(u, _)| u.clone()).collect();

    if !is_copy && account.config().is_trash(dest) {
        debug!(src, dest, count = server_uids.len(), "Move to trash becomes a delete");
        remote.delete_messages(&server_uids, Some(dest))?;
    } else {
        let map = if is_copy {
            remote.copy_messages(&server_uids, dest)?
        } else {
            remote.move_messages(&server_uids, dest)?
        };
        if remap.is_some() {
            let local_dest = account.local_folder(dest)?;
            for (old, placeholder) in &pairs {
                if let (Some(placeholder), Some(new_uid)) = (placeholder, map.get(old)) {
                    if local_dest.message(placeholder)?.is_some() {
                        change_uid(ctx, local_dest.as_ref(), placeholder, new_uid)?;
                    }
                }
            }
        }
    }

    if !is_copy {
        expunge_if_immediate(account, remote.as_ref())?;
    }
    remote.close();
    Ok(())
}

fn mark_all_as_read(ctx: &Context<'_>, folder: &str) -> Result<()> {
    let account = ctx.account;
    let local = account.local_folder(folder)?;
    let unread: Vec<_> = local
        .messages()?
        .into_iter()
        .filter(|m| !m.flags.is_seen() && !m.flags.is_deleted())
        .collect();
    let uids: Vec<String> = unread.iter().map(|m| m.uid.clone()).collect();
    if !uids.is_empty() {
        local.set_flags(&uids, &[Flag::Seen], true)?;
    }
    for message in unread {
        ctx.emit(Event::LocalMessageUpdated {
            account: account.id(),
            folder: folder.to_string(),
            message: message.with_flag(Flag::Seen, true),
        });
    }
    ctx.emit(Event::FolderStatusChanged {
        account: account.id(),
        folder: folder.to_string(),
        unread: 0,
    });

    let Some(mut remote) = open_writable(account, folder)? else {
        return Ok(());
    };
    match remote.set_flags_all(&[Flag::Seen], true) {
        Err(mailsync_store::Error::Unsupported(reason)) => {
            info!(folder, reason = %reason, "Server cannot mark all messages read");
        }
        other => other?,
    }
    remote.close();
    Ok(())
}

fn expunge(ctx: &Context<'_>, folder: &str) -> Result<()> {
    let Some(mut remote) = open_writable(ctx.account, folder)? else {
        return Ok(());
    };
    remote.expunge()?;
    remote.close();
    Ok(())
}

fn empty_trash(ctx: &Context<'_>) -> Result<()> {
    let account = ctx.account;
    let Some(trash) = account.config().trash_folder.as_deref() else {
        return Ok(());
    };
    let Some(mut remote) = open_writable(account, trash)? else {
        return Ok(());
    };
    remote.set_flags_all(&[Flag::Deleted], true)?;
    expunge_if_immediate(account, remote.as_ref())?;
    remote.close();
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mailsync_store::memory::Operation;
    use mailsync_store::{LocalStore, Message};

    use super::*;
    use crate::context::fixture::Fixture;
    use crate::pending::queue_pending;

    fn seed(fixture: &Fixture, folder: &str, uids: &[&str]) {
        let local = fixture.local.folder(folder).unwrap();
        for uid in uids {
            fixture.remote.insert(folder, Message::new(*uid));
            local.store(&Message::new(*uid)).unwrap();
        }
    }

    fn set_seen(uids: &[&str]) -> PendingCommand {
        PendingCommand::SetFlag {
            folder: "INBOX".into(),
            value: true,
            flag: Flag::Seen,
            uids: uids.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_replay_in_order_and_clears_log() {
        let fixture = Fixture::new();
        seed(&fixture, "INBOX", &["1", "2"]);
        fixture.remote.add_folder("Archive");
        queue_pending(&fixture.account, &set_seen(&["1"])).unwrap();
        queue_pending(
            &fixture.account,
            &PendingCommand::MoveOrCopy {
                src: "INBOX".into(),
                dest: "Archive".into(),
                is_copy: false,
                uids: vec!["1".into()],
                remap: None,
            },
        )
        .unwrap();

        let report = replay(&fixture.context()).unwrap();

        assert_eq!(report.processed, 2);
        assert!(fixture.local.pending_commands().unwrap().is_empty());
        let archived = fixture.remote.messages_in("Archive");
        assert_eq!(archived.len(), 1);
        assert!(archived[0].flags.is_seen());

        let titles: Vec<String> = fixture
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                Event::PendingCommandCompleted { title, .. } => Some(title),
                _ => None,
            })
            .collect();
        assert_eq!(titles, vec!["set_flag_bulk", "move_or_copy_bulk"]);
    }

    #[test]
    fn test_transient_failure_halts_replay() {
        let fixture = Fixture::new();
        seed(&fixture, "INBOX", &["1", "2"]);
        queue_pending(&fixture.account, &set_seen(&["1"])).unwrap();
        queue_pending(&fixture.account, &set_seen(&["2"])).unwrap();
        fixture.remote.fail_next(
            Operation::SetFlags,
            mailsync_store::Error::Connection("reset".into()),
        );

        assert!(replay(&fixture.context()).is_err());

        let pending = fixture.local.pending_commands().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].args[3], "1");

        let report = replay(&fixture.context()).unwrap();
        assert_eq!(report.processed, 2);
        assert!(fixture.remote.messages_in("INBOX").iter().all(|m| m.flags.is_seen()));
    }

    #[test]
    fn test_permanent_failure_is_dropped_and_reported() {
        let fixture = Fixture::new();
        seed(&fixture, "INBOX", &["1"]);
        fixture
            .local
            .add_pending_command("frobnicate", vec![])
            .unwrap();
        queue_pending(&fixture.account, &set_seen(&["1"])).unwrap();

        let report = replay(&fixture.context()).unwrap();

        assert_eq!(report.permanent_failures.len(), 1);
        assert!(report.permanent_failures[0].starts_with("frobnicate"));
        assert!(fixture.local.pending_commands().unwrap().is_empty());
        assert!(fixture.remote.messages_in("INBOX")[0].flags.is_seen());
        let errors = fixture.local.folder("Errors").unwrap().messages().unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_move_from_missing_folder_is_permanent() {
        let fixture = Fixture::new();
        queue_pending(
            &fixture.account,
            &PendingCommand::MoveOrCopy {
                src: "Gone".into(),
                dest: "Archive".into(),
                is_copy: true,
                uids: vec!["5".into()],
                remap: None,
            },
        )
        .unwrap();

        let report = replay(&fixture.context()).unwrap();
        assert_eq!(report.permanent_failures.len(), 1);
    }

    #[test]
    fn test_append_rewrites_local_uid() {
        let fixture = Fixture::new();
        fixture.remote.add_folder("Sent");
        let sent = fixture.local.folder("Sent").unwrap();
        let placeholder = uid::new_local();
        let mut message = Message::new(placeholder.clone());
        message.message_id = Some("<a@example.com>".into());
        sent.store(&message).unwrap();
        queue_pending(
            &fixture.account,
            &PendingCommand::Append {
                folder: "Sent".into(),
                uid: placeholder.clone(),
            },
        )
        .unwrap();

        replay(&fixture.context()).unwrap();

        let remote = fixture.remote.messages_in("Sent");
        assert_eq!(remote.len(), 1);
        let server_uid = remote[0].uid.clone();
        assert!(sent.message(&server_uid).unwrap().is_some());
        assert!(sent.message(&placeholder).unwrap().is_none());
        assert!(fixture.take_events().contains(&Event::MessageUidChanged {
            account: fixture.account.id(),
            folder: "Sent".into(),
            old_uid: placeholder,
            new_uid: server_uid,
        }));
    }

    #[test]
    fn test_interrupted_append_is_not_duplicated() {
        let fixture = Fixture::new();
        let mut uploaded = Message::new("9");
        uploaded.message_id = Some("<dup@example.com>".into());
        fixture.remote.insert("Drafts", uploaded.clone());

        let drafts = fixture.local.folder("Drafts").unwrap();
        let placeholder = uid::new_local();
        drafts
            .store(
                &uploaded
                    .with_uid(placeholder.clone())
                    .with_flag(Flag::RemoteCopyStarted, true),
            )
            .unwrap();
        queue_pending(
            &fixture.account,
            &PendingCommand::Append {
                folder: "Drafts".into(),
                uid: placeholder,
            },
        )
        .unwrap();

        replay(&fixture.context()).unwrap();

        assert_eq!(fixture.remote.messages_in("Drafts").len(), 1);
        assert!(drafts.message("9").unwrap().is_some());
    }

    #[test]
    fn test_move_with_remap_rewrites_placeholders() {
        let fixture = Fixture::new();
        seed(&fixture, "INBOX", &["3"]);
        fixture.remote.add_folder("Archive");
        let inbox = fixture.local.folder("INBOX").unwrap();
        let archive = fixture.local.folder("Archive").unwrap();
        let map = inbox.move_messages(&["3".to_string()], archive.as_ref()).unwrap();
        let placeholder = map["3"].clone();
        queue_pending(
            &fixture.account,
            &PendingCommand::MoveOrCopy {
                src: "INBOX".into(),
                dest: "Archive".into(),
                is_copy: false,
                uids: vec!["3".into()],
                remap: Some(vec![placeholder.clone()]),
            },
        )
        .unwrap();

        replay(&fixture.context()).unwrap();

        let server_uid = fixture.remote.messages_in("Archive")[0].uid.clone();
        assert!(archive.message(&placeholder).unwrap().is_none());
        assert!(archive.message(&server_uid).unwrap().is_some());
        assert!(fixture.remote.messages_in("INBOX").is_empty());
    }

    #[test]
    fn test_mark_all_as_read_updates_both_sides() {
        let fixture = Fixture::new();
        seed(&fixture, "INBOX", &["1", "2"]);
        queue_pending(
            &fixture.account,
            &PendingCommand::MarkAllAsRead {
                folder: "INBOX".into(),
            },
        )
        .unwrap();

        replay(&fixture.context()).unwrap();

        let inbox = fixture.local.folder("INBOX").unwrap();
        assert_eq!(inbox.unread_count().unwrap(), 0);
        assert!(fixture.remote.messages_in("INBOX").iter().all(|m| m.flags.is_seen()));
        let updates = fixture
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, Event::LocalMessageUpdated { .. }))
            .count();
        assert_eq!(updates, 2);
    }

    #[test]
    fn test_empty_log_emits_nothing() {
        let fixture = Fixture::new();
        let report = replay(&fixture.context()).unwrap();
        assert_eq!(report, ReplayReport::default());
        assert!(fixture.take_events().is_empty());
    }
}
