//! Message download and flag reconciliation.

use std::collections::HashMap;

use mailsync_store::{FetchItem, FetchProfile, Flag, LocalFolder, Message, RemoteFolder, uid};
use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::event::Event;

/// Downloads the window's missing messages and updates flags of the rest.
///
/// Returns the number of new unread messages.
pub(crate) fn download(
    ctx: &Context<'_>,
    remote: &dyn RemoteFolder,
    local: &dyn LocalFolder,
    window: Vec<Message>,
    local_messages: &HashMap<String, Message>,
    limit: Option<usize>,
) -> Result<usize> {
    let account = ctx.account;
    let folder = local.name();

    let mut missing = Vec::new();
    let mut known = Vec::new();
    let mut ready = Vec::new();
    for listed in window {
        if ctx.suppressed.contains(account.id(), folder, &listed.uid) {
            continue;
        }
        match local_messages.get(&listed.uid) {
            _ if listed.flags.is_deleted() => known.push(listed),
            Some(existing) if existing.flags.is_downloaded() => known.push(listed),
            None if listed.flags.is_downloaded() => ready.push(listed),
            _ => missing.push(listed),
        }
    }

    let mut new = 0;
    if !ready.is_empty() {
        // Listings that already carry content are stored as they are.
        let mut progress = Progress {
            completed: 0,
            total: ready.len(),
            new: 0,
        };
        for message in &ready {
            save(ctx, local, message, &mut progress)?;
        }
        new += progress.new;
    }
    if !missing.is_empty() {
        uid::sort_newest_first(&mut missing, |m| m.uid.as_str());
        if let Some(limit) = limit {
            missing.truncate(limit);
        }
        debug!(account = %account.id(), folder, count = missing.len(), "Downloading messages");
        new += fetch_missing(ctx, remote, local, &missing)?;
    }

    if remote.supports_fetching_flags() {
        sync_flags(ctx, local, &known)?;
    }

    if let Some(limit) = limit {
        purge(ctx, local, limit)?;
    }
    Ok(new)
}

fn fetch_missing(
    ctx: &Context<'_>,
    remote: &dyn RemoteFolder,
    local: &dyn LocalFolder,
    missing: &[Message],
) -> Result<usize> {
    let uids: Vec<String> = missing.iter().map(|m| m.uid.clone()).collect();
    let envelopes = remote.fetch(
        &uids,
        &FetchProfile::new()
            .with(FetchItem::Flags)
            .with(FetchItem::Envelope),
    )?;
    for envelope in &envelopes {
        if local.message(&envelope.uid)?.is_none() {
            local.store(envelope)?;
        }
    }

    let config = ctx.account.config();
    let earliest = config.earliest_poll_date();
    let max_size = config.max_auto_download_size;
    let (large, small): (Vec<Message>, Vec<Message>) = envelopes
        .into_iter()
        .filter(|m| !m.flags.is_deleted() && !m.is_older_than(earliest))
        .partition(|m| m.size > max_size);
    let total = small.len() + large.len();
    let mut progress = Progress {
        completed: 0,
        total,
        new: 0,
    };

    if !small.is_empty() {
        let uids: Vec<String> = small.iter().map(|m| m.uid.clone()).collect();
        let bodies = remote.fetch(&uids, &FetchItem::Body.into())?;
        for mut message in small {
            if let Some(body) = bodies.iter().find(|b| b.uid == message.uid) {
                message.parts.clone_from(&body.parts);
                message.body.clone_from(&body.body);
            }
            message.flags.insert(Flag::DownloadedFull);
            save(ctx, local, &message, &mut progress)?;
        }
    }

    for mut message in large {
        let uids = [message.uid.clone()];
        let structure = remote.fetch(&uids, &FetchItem::Structure.into())?;
        let parts = structure
            .into_iter()
            .next()
            .map(|m| m.parts)
            .unwrap_or_default();
        let state = if parts.is_empty() {
            let sane = remote.fetch(&uids, &FetchItem::BodySane.into())?.into_iter().next();
            let size = sane.as_ref().map_or(message.size, |m| m.size);
            message.body = sane.and_then(|m| m.body);
            sane_download_state(size, max_size)
        } else {
            let viewable: Vec<String> = parts
                .iter()
                .filter(|p| p.is_viewable())
                .map(|p| p.id.clone())
                .collect();
            let contents = if viewable.is_empty() {
                Vec::new()
            } else {
                remote.fetch_parts(&message.uid, &viewable)?
            };
            message.parts = parts
                .into_iter()
                .map(|mut part| {
                    part.content = contents
                        .iter()
                        .find(|c| c.id == part.id)
                        .and_then(|c| c.content.clone());
                    part
                })
                .collect();
            Flag::DownloadedPartial
        };
        message.flags.insert(state);
        save(ctx, local, &message, &mut progress)?;
    }

    Ok(progress.new)
}

/// Download state after a sane-body fetch of a message reported at `size`.
///
/// Only a message strictly below the threshold counts as complete.
const fn sane_download_state(size: u64, max_size: u64) -> Flag {
    if size < max_size {
        Flag::DownloadedFull
    } else {
        Flag::DownloadedPartial
    }
}

struct Progress {
    completed: usize,
    total: usize,
    new: usize,
}

fn save(
    ctx: &Context<'_>,
    local: &dyn LocalFolder,
    message: &Message,
    progress: &mut Progress,
) -> Result<()> {
    let account = ctx.account;
    let folder = local.name();
    local.store(message)?;
    progress.completed += 1;
    ctx.emit(Event::SyncAddOrUpdate {
        account: account.id(),
        folder: folder.to_string(),
        message: message.clone(),
    });
    ctx.emit(Event::SyncProgress {
        account: account.id(),
        folder: Some(folder.to_string()),
        completed: progress.completed,
        total: progress.total,
    });
    if !message.flags.is_seen() {
        progress.new += 1;
        ctx.emit(Event::SyncNewMessage {
            account: account.id(),
            folder: folder.to_string(),
            message: message.clone(),
        });
        ctx.notifications.on_new_message(account, folder, message);
    }
    Ok(())
}

/// Copies server flags onto the local copies of `messages`.
///
/// Messages the server marked deleted are marked deleted locally and
/// reported as removed. Returns the number of messages that changed.
pub(crate) fn sync_flags(
    ctx: &Context<'_>,
    local: &dyn LocalFolder,
    messages: &[Message],
) -> Result<usize> {
    let account = ctx.account;
    let folder = local.name();
    let mut changed = 0;
    for remote in messages {
        let Some(mut message) = local.message(&remote.uid)? else {
            continue;
        };
        if message.flags.is_deleted() {
            continue;
        }
        if remote.flags.is_deleted() && account.config().sync_remote_deletions {
            message.flags.insert(Flag::Deleted);
            local.store(&message)?;
            changed += 1;
            ctx.emit(Event::SyncRemoved {
                account: account.id(),
                folder: folder.to_string(),
                uid: message.uid.clone(),
            });
            ctx.resolve(folder, &message.uid);
            continue;
        }

        let mut differs = false;
        for flag in Flag::SYNCED {
            differs |= message.flags.set(flag, remote.flags.contains(flag));
        }
        if !differs {
            continue;
        }
        local.store(&message)?;
        changed += 1;
        ctx.emit(Event::SyncAddOrUpdate {
            account: account.id(),
            folder: folder.to_string(),
            message: message.clone(),
        });
        if message.flags.is_seen() {
            ctx.resolve(folder, &message.uid);
        }
    }
    Ok(changed)
}

/// Drops the oldest server messages beyond the visible limit.
fn purge(ctx: &Context<'_>, local: &dyn LocalFolder, limit: usize) -> Result<()> {
    let folder = local.name();
    let mut uids: Vec<String> = local
        .messages()?
        .into_iter()
        .map(|m| m.uid)
        .filter(|u| !uid::is_local(u))
        .collect();
    if uids.len() <= limit {
        return Ok(());
    }
    uid::sort_newest_first(&mut uids, String::as_str);
    for uid in uids.into_iter().skip(limit) {
        local.destroy(&uid)?;
        ctx.emit(Event::SyncRemoved {
            account: ctx.account.id(),
            folder: folder.to_string(),
            uid: uid.clone(),
        });
        ctx.resolve(folder, &uid);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use mailsync_store::{LocalStore, Store};

    use super::*;
    use crate::config::DEFAULT_MAX_AUTO_DOWNLOAD_SIZE;
    use crate::context::fixture::Fixture;

    fn stored(uid: &str, flags: &[Flag]) -> Message {
        let mut message = Message::new(uid).with_flag(Flag::DownloadedFull, true);
        for flag in flags {
            message.flags.insert(*flag);
        }
        message
    }

    #[test]
    fn test_remote_deletion_marks_local_deleted() {
        let fixture = Fixture::new();
        let inbox = fixture.local.folder("INBOX").unwrap();
        inbox.store(&stored("7", &[])).unwrap();

        let remote = Message::new("7").with_flag(Flag::Deleted, true);
        let changed = sync_flags(&fixture.context(), inbox.as_ref(), &[remote]).unwrap();

        assert_eq!(changed, 1);
        assert!(inbox.message("7").unwrap().unwrap().flags.is_deleted());
        assert!(matches!(
            fixture.take_events().as_slice(),
            [Event::SyncRemoved { uid, .. }] if uid == "7"
        ));
    }

    #[test]
    fn test_internal_flags_survive_flag_sync() {
        let fixture = Fixture::new();
        let inbox = fixture.local.folder("INBOX").unwrap();
        inbox.store(&stored("3", &[Flag::Seen])).unwrap();

        let remote = Message::new("3").with_flag(Flag::Flagged, true);
        sync_flags(&fixture.context(), inbox.as_ref(), &[remote]).unwrap();

        let flags = inbox.message("3").unwrap().unwrap().flags;
        assert!(flags.is_flagged());
        assert!(!flags.is_seen());
        assert!(flags.contains(Flag::DownloadedFull));
    }

    #[test]
    fn test_unchanged_flags_emit_nothing() {
        let fixture = Fixture::new();
        let inbox = fixture.local.folder("INBOX").unwrap();
        inbox.store(&stored("4", &[Flag::Seen])).unwrap();

        let remote = Message::new("4").with_flag(Flag::Seen, true);
        let changed = sync_flags(&fixture.context(), inbox.as_ref(), &[remote]).unwrap();

        assert_eq!(changed, 0);
        assert!(fixture.take_events().is_empty());
    }

    #[test]
    fn test_purge_keeps_placeholders_and_newest() {
        let fixture = Fixture::new();
        let inbox = fixture.local.folder("INBOX").unwrap();
        for uid in ["1", "2", "3", "4"] {
            inbox.store(&stored(uid, &[])).unwrap();
        }
        let draft = uid::new_local();
        inbox.store(&stored(&draft, &[])).unwrap();

        purge(&fixture.context(), inbox.as_ref(), 2).unwrap();

        let mut uids: Vec<String> = inbox.messages().unwrap().into_iter().map(|m| m.uid).collect();
        uids.sort();
        let mut expected = vec!["3".to_string(), "4".to_string(), draft];
        expected.sort();
        assert_eq!(uids, expected);
    }

    fn sized(uid: &str, size: u64) -> Message {
        let mut message = Message::new(uid);
        message.size = size;
        message.subject = Some(format!("Message {uid}"));
        message.body = Some("x".repeat(4096));
        message
    }

    fn download_sized(sizes: &[(&str, u64)]) -> (Fixture, Arc<dyn LocalFolder>) {
        let fixture = Fixture::new();
        fixture.remote.add_folder("INBOX");
        let mut window = Vec::new();
        for (uid, size) in sizes {
            fixture.remote.insert("INBOX", sized(uid, *size));
            let mut listed = Message::new(*uid);
            listed.size = *size;
            window.push(listed);
        }
        let remote = fixture.remote.folder("INBOX").unwrap();
        let inbox = fixture.local.folder("INBOX").unwrap();
        download(
            &fixture.context(),
            remote.as_ref(),
            inbox.as_ref(),
            window,
            &HashMap::new(),
            None,
        )
        .unwrap();
        (fixture, inbox)
    }

    #[test]
    fn test_message_at_threshold_downloads_fully() {
        let max = DEFAULT_MAX_AUTO_DOWNLOAD_SIZE;
        let (_fixture, inbox) = download_sized(&[("1", max - 1), ("2", max)]);

        for uid in ["1", "2"] {
            let stored = inbox.message(uid).unwrap().unwrap();
            assert!(stored.flags.contains(Flag::DownloadedFull), "uid {uid}");
            assert!(!stored.flags.contains(Flag::DownloadedPartial), "uid {uid}");
            assert_eq!(stored.body.map(|b| b.len()), Some(4096));
        }
    }

    #[test]
    fn test_message_above_threshold_downloads_partially() {
        let max = DEFAULT_MAX_AUTO_DOWNLOAD_SIZE;
        let (_fixture, inbox) = download_sized(&[("3", max + 1)]);

        let stored = inbox.message("3").unwrap().unwrap();
        assert!(stored.flags.contains(Flag::DownloadedPartial));
        assert!(!stored.flags.contains(Flag::DownloadedFull));
        assert_eq!(stored.body.map(|b| b.len()), Some(2048));
    }

    #[test]
    fn test_sane_download_state_boundaries() {
        assert_eq!(sane_download_state(99, 100), Flag::DownloadedFull);
        assert_eq!(sane_download_state(100, 100), Flag::DownloadedPartial);
        assert_eq!(sane_download_state(101, 100), Flag::DownloadedPartial);
    }
}
