//! Integration tests driving the controller against the in-memory backends.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailsync_core::{
    Account, AccountConfig, AccountId, Controller, ControllerConfig, Event, Listener,
    NotificationSink, SendFailureTarget, Summary,
};
use mailsync_store::memory::{MemoryLocalStore, MemoryStore, MemoryTransport, Operation};
use mailsync_store::{
    Address, Capabilities, Flag, LocalStore, Message, OpenMode, Part, Store,
};

const WAIT: Duration = Duration::from_secs(10);
const ACCOUNT: AccountId = AccountId(1);

#[derive(Default)]
struct RecordingSink {
    shown: Mutex<Vec<Summary>>,
    cancelled: Mutex<usize>,
    send_failures: Mutex<Vec<SendFailureTarget>>,
}

impl NotificationSink for RecordingSink {
    fn show(&self, summary: &Summary, _ring: bool) {
        self.shown.lock().unwrap().push(summary.clone());
    }

    fn cancel(&self, _account: AccountId) {
        *self.cancelled.lock().unwrap() += 1;
    }

    fn show_send_failed(&self, _account: AccountId, _message: &str, target: SendFailureTarget) {
        self.send_failures.lock().unwrap().push(target);
    }

    fn show_certificate_error(&self, _account: AccountId, _message: &str) {}
}

struct Harness {
    controller: Controller,
    local: MemoryLocalStore,
    remote: MemoryStore,
    transport: MemoryTransport,
    sink: Arc<RecordingSink>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with(ControllerConfig::default(), MemoryStore::new())
    }

    fn with(config: ControllerConfig, remote: MemoryStore) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let controller = Controller::new(config, sink.clone()).unwrap();
        let local = MemoryLocalStore::new();
        let transport = MemoryTransport::new();
        controller.add_account(Account::new(
            AccountConfig::new(ACCOUNT, "me@example.com"),
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            Arc::new(transport.clone()),
        ));

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&events);
        controller.add_listener(Arc::new(move |event: &Event| {
            recorder.lock().unwrap().push(event.clone());
        }));
        Self {
            controller,
            local,
            remote,
            transport,
            sink,
            events,
        }
    }

    /// Waits until everything queued so far has run.
    fn settle(&self) {
        let (listener, rx) = signal(|event| matches!(event, Event::CommandCompleted { .. }));
        self.controller
            .synchronize_mailbox(ACCOUNT, "Outbox", Some(listener))
            .unwrap();
        rx.recv_timeout(WAIT).unwrap();
    }

    fn sync(&self, folder: &str) {
        self.controller
            .synchronize_mailbox(ACCOUNT, folder, None)
            .unwrap();
        self.settle();
    }

    fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn local_uids(&self, folder: &str) -> Vec<u64> {
        let mut uids: Vec<u64> = self
            .local
            .folder(folder)
            .unwrap()
            .messages()
            .unwrap()
            .iter()
            .filter(|m| !m.flags.is_deleted())
            .filter_map(|m| m.uid.parse().ok())
            .collect();
        uids.sort_unstable();
        uids
    }
}

/// A listener that signals once `matches` accepts an event.
fn signal(
    matches: impl Fn(&Event) -> bool + Send + Sync + 'static,
) -> (Arc<dyn Listener>, Receiver<()>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(Some(tx));
    let listener: Arc<dyn Listener> = Arc::new(move |event: &Event| {
        if matches(event) {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    });
    (listener, rx)
}

fn incoming(uid: u64) -> Message {
    let mut message = Message::new(uid.to_string());
    message.subject = Some(format!("Message {uid}"));
    message.from = vec![Address::new("alice@example.com")];
    message.body = Some("Hello there".into());
    message.size = 512;
    message
}

fn message_changes(events: &[Event]) -> usize {
    events.iter().filter(|e| e.is_message_change()).count()
}

#[test]
fn test_reconcile_removes_and_adds() {
    let harness = Harness::new();
    let inbox = harness.local.folder("INBOX").unwrap();
    for uid in 1..=3 {
        inbox
            .store(&incoming(uid).with_flag(Flag::DownloadedFull, true))
            .unwrap();
    }
    for uid in 2..=4 {
        harness.remote.insert("INBOX", incoming(uid));
    }

    harness.sync("INBOX");

    assert_eq!(harness.local_uids("INBOX"), vec![2, 3, 4]);
    let events = harness.take_events();
    let removed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::SyncRemoved { uid, .. } => Some(uid.as_str()),
            _ => None,
        })
        .collect();
    let added: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::SyncAddOrUpdate { message, .. } => Some(message.uid.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec!["1"]);
    assert_eq!(added, vec!["4"]);
}

#[test]
fn test_second_reconcile_changes_nothing() {
    let harness = Harness::new();
    for uid in 1..=5 {
        harness.remote.insert("INBOX", incoming(uid));
    }
    harness.sync("INBOX");
    harness.take_events();
    let first_check = harness
        .local
        .folder("INBOX")
        .unwrap()
        .last_checked()
        .unwrap()
        .unwrap();

    harness.sync("INBOX");

    let events = harness.take_events();
    assert_eq!(message_changes(&events), 0);
    assert!(events.iter().any(|e| matches!(e, Event::SyncFinished { new: 0, .. })));
    let second_check = harness
        .local
        .folder("INBOX")
        .unwrap()
        .last_checked()
        .unwrap()
        .unwrap();
    assert!(second_check >= first_check);
    assert_eq!(harness.local_uids("INBOX"), (1..=5).collect::<Vec<_>>());
}

#[test]
fn test_visible_limit_keeps_largest_uids() {
    let harness = Harness::new();
    for uid in 1..=40 {
        harness.remote.insert("INBOX", incoming(uid));
    }

    harness.sync("INBOX");

    assert_eq!(harness.local_uids("INBOX"), (16..=40).collect::<Vec<_>>());
}

#[test]
fn test_load_more_raises_limit() {
    let harness = Harness::new();
    for uid in 1..=40 {
        harness.remote.insert("INBOX", incoming(uid));
    }
    harness.sync("INBOX");

    harness
        .controller
        .load_more_messages(ACCOUNT, "INBOX", None)
        .unwrap();
    harness.settle();

    assert_eq!(harness.local_uids("INBOX"), (1..=40).collect::<Vec<_>>());
}

#[test]
fn test_set_flag_applies_locally_then_remotely() {
    let harness = Harness::new();
    harness.remote.insert("INBOX", incoming(42));
    harness.sync("INBOX");
    harness.take_events();

    harness
        .controller
        .set_flag(ACCOUNT, "INBOX", &["42".to_string()], Flag::Seen, true)
        .unwrap();

    let local = harness.local.folder("INBOX").unwrap();
    assert!(local.message("42").unwrap().unwrap().flags.is_seen());
    assert!(harness.take_events().contains(&Event::FolderStatusChanged {
        account: ACCOUNT,
        folder: "INBOX".into(),
        unread: 0,
    }));

    harness.settle();
    assert!(harness.remote.messages_in("INBOX")[0].flags.is_seen());
    assert!(harness.local.pending_commands().unwrap().is_empty());
}

#[test]
fn test_pending_commands_replay_in_order() {
    let harness = Harness::new();
    harness.remote.insert("INBOX", incoming(7));
    harness.sync("INBOX");
    let uids = ["7".to_string()];

    harness
        .remote
        .fail_next(Operation::SetFlags, mailsync_store::Error::Connection("reset".into()));
    harness
        .controller
        .set_flag(ACCOUNT, "INBOX", &uids, Flag::Flagged, true)
        .unwrap();
    harness.settle();
    // The connection failure left the command in the log.
    assert_eq!(harness.local.pending_commands().unwrap().len(), 1);
    assert!(!harness.remote.messages_in("INBOX")[0].flags.is_flagged());

    harness
        .controller
        .set_flag(ACCOUNT, "INBOX", &uids, Flag::Flagged, false)
        .unwrap();
    harness.settle();

    assert!(harness.local.pending_commands().unwrap().is_empty());
    assert!(!harness.remote.messages_in("INBOX")[0].flags.is_flagged());
}

#[test]
fn test_foreground_runs_before_background() {
    let harness = Harness::new();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let gate: Arc<dyn Listener> = Arc::new(move |event: &Event| {
        if matches!(event, Event::SyncStarted { .. }) {
            let _ = release_rx.lock().unwrap().recv_timeout(WAIT);
        }
    });
    harness
        .controller
        .synchronize_mailbox(ACCOUNT, "Outbox", Some(gate))
        .unwrap();

    harness
        .controller
        .synchronize_mailbox(ACCOUNT, "Archive", None)
        .unwrap();
    harness
        .controller
        .load_more_messages(ACCOUNT, "INBOX", None)
        .unwrap();
    release_tx.send(()).unwrap();
    harness.settle();

    let started: Vec<String> = harness
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            Event::SyncStarted { folder, .. } if folder != "Outbox" => Some(folder),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["INBOX".to_string(), "Archive".to_string()]);
}

#[test]
fn test_push_arrival_blocks_until_stored() {
    let remote = MemoryStore::with_capabilities(Capabilities {
        push: true,
        ..Capabilities::default()
    });
    let harness = Harness::with(ControllerConfig::default(), remote);
    assert!(harness.controller.setup_pushing(ACCOUNT).unwrap());
    let pusher = harness.remote.pushers().remove(0);
    assert_eq!(pusher.folders(), vec!["INBOX".to_string()]);
    assert!(harness.take_events().contains(&Event::PushActive {
        account: ACCOUNT,
        folder: "INBOX".into(),
        active: true,
    }));

    let uid = harness
        .remote
        .insert("INBOX", incoming(9).with_flag(Flag::Seen, true));
    let mut listed = harness.remote.folder("INBOX").unwrap();
    listed.open(OpenMode::ReadOnly).unwrap();
    let arrived = listed.messages(1, 1, None).unwrap();

    pusher.receiver().messages_arrived("INBOX", arrived);

    let local = harness.local.folder("INBOX").unwrap();
    assert!(local.message(&uid).unwrap().is_some());
    assert!(local.last_push().unwrap().is_some());
    assert!(*harness.sink.cancelled.lock().unwrap() >= 1);

    pusher.receiver().messages_removed("INBOX", vec![uid.clone()]);
    assert!(local.message(&uid).unwrap().is_none());

    harness.controller.stop_all_pushing();
    assert!(!pusher.is_running());
}

#[test]
fn test_push_sync_folder_waits_for_finish() {
    let remote = MemoryStore::with_capabilities(Capabilities {
        push: true,
        ..Capabilities::default()
    });
    let harness = Harness::with(ControllerConfig::default(), remote);
    harness.remote.insert("INBOX", incoming(3));
    let receiver = harness.controller.push_receiver(ACCOUNT).unwrap();

    receiver.sync_folder("INBOX");

    assert_eq!(harness.local_uids("INBOX"), vec![3]);
}

#[test]
fn test_failed_sends_stop_at_max_attempts() {
    let config = ControllerConfig {
        max_send_attempts: 2,
        ..ControllerConfig::default()
    };
    let harness = Harness::with(config, MemoryStore::new());
    for _ in 0..2 {
        harness
            .transport
            .fail_next(mailsync_store::Error::Connection("refused".into()));
    }
    let mut message = Message::default();
    message.subject = Some("Report".into());
    message.to = vec![Address::new("bob@example.com")];
    harness
        .controller
        .send_message(ACCOUNT, &message, None)
        .unwrap();
    harness.settle();
    harness
        .controller
        .send_pending_messages(ACCOUNT, None)
        .unwrap();
    harness.settle();

    // Both attempts used up: the transport would succeed now, but the
    // message is no longer tried.
    harness
        .controller
        .send_pending_messages(ACCOUNT, None)
        .unwrap();
    harness.settle();

    assert!(harness.transport.sent().is_empty());
    assert_eq!(
        harness.local.folder("Outbox").unwrap().messages().unwrap().len(),
        1
    );
    let failures = harness.sink.send_failures.lock().unwrap().clone();
    assert_eq!(failures, vec![SendFailureTarget::Outbox; 3]);
}

#[test]
fn test_successful_send_files_into_sent() {
    let harness = Harness::new();
    harness.remote.add_folder("Sent");
    let mut message = Message::default();
    message.subject = Some("Hi".into());
    harness
        .controller
        .send_message(ACCOUNT, &message, None)
        .unwrap();
    harness.settle();
    // The upload is replayed by the next command touching the account.
    harness.sync("Sent");

    assert_eq!(harness.transport.sent().len(), 1);
    assert_eq!(harness.remote.messages_in("Sent").len(), 1);
    assert!(harness.local.pending_commands().unwrap().is_empty());
}

#[test]
fn test_delete_moves_to_trash() {
    let harness = Harness::new();
    harness.remote.add_folder("Trash");
    harness.remote.insert("INBOX", incoming(5));
    harness.sync("INBOX");

    harness
        .controller
        .delete_messages(ACCOUNT, "INBOX", &["5".to_string()], None)
        .unwrap();
    harness.settle();

    assert!(harness.local_uids("INBOX").is_empty());
    assert_eq!(
        harness.local.folder("Trash").unwrap().messages().unwrap().len(),
        1
    );
    assert!(harness.remote.messages_in("INBOX").is_empty());
    assert_eq!(harness.remote.messages_in("Trash").len(), 1);
    assert!(harness
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::MessageDeleted { uid, .. } if uid == "5")));
}

#[test]
fn test_check_mail_syncs_inbox() {
    let harness = Harness::new();
    harness.remote.insert("INBOX", incoming(11));
    let (listener, finished) = signal(|event| matches!(event, Event::CheckMailFinished { .. }));

    harness
        .controller
        .check_mail(None, true, Some(listener))
        .unwrap();
    finished.recv_timeout(WAIT).unwrap();

    assert_eq!(harness.local_uids("INBOX"), vec![11]);
    let events = harness.take_events();
    assert!(events.contains(&Event::CheckMailStarted { account: None }));
    assert!(matches!(
        harness.sink.shown.lock().unwrap().last(),
        Some(Summary::Single { .. })
    ));
}

#[test]
fn test_late_listener_sees_failed_sync() {
    let harness = Harness::new();
    harness.remote.add_folder("INBOX");
    harness.remote.fail_next(
        Operation::Open,
        mailsync_store::Error::Connection("unreachable".into()),
    );
    harness.sync("INBOX");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    harness.controller.add_listener(Arc::new(move |event: &Event| {
        recorder.lock().unwrap().push(event.clone());
    }));

    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, Event::SyncFailed { folder, .. } if folder == "INBOX")));
}

#[test]
fn test_list_folders_mirrors_server() {
    let harness = Harness::new();
    for name in ["INBOX", "Archive", "Projects"] {
        harness.remote.add_folder(name);
    }
    harness.local.folder("Stale").unwrap().create().unwrap();
    let (listener, finished) = signal(|event| matches!(event, Event::FolderListFinished { .. }));

    harness
        .controller
        .list_folders(ACCOUNT, true, Some(listener))
        .unwrap();
    finished.recv_timeout(WAIT).unwrap();

    let folders = harness.local.folders().unwrap();
    assert!(folders.contains(&"Archive".to_string()));
    assert!(folders.contains(&"Projects".to_string()));
    assert!(!folders.contains(&"Stale".to_string()));
}

#[test]
fn test_search_reports_matches() {
    let harness = Harness::new();
    for uid in 1..=3 {
        harness.remote.insert("INBOX", incoming(uid));
    }
    harness.sync("INBOX");
    let (listener, finished) = signal(|event| matches!(event, Event::SearchFinished { .. }));

    harness
        .controller
        .search_local_messages(mailsync_core::SearchQuery::new("message 2"), Some(listener));
    finished.recv_timeout(WAIT).unwrap();

    let events = harness.take_events();
    assert!(events.contains(&Event::SearchFinished { count: 1 }));
}

#[test]
fn test_stop_is_idempotent() {
    let harness = Harness::new();
    harness.controller.stop();
    harness.controller.stop();
    assert_eq!(harness.controller.queued(), 0);
    assert_eq!(harness.remote.list_folders().unwrap(), Vec::<String>::new());
}

fn with_attachment(uid: u64) -> Message {
    let mut message = incoming(uid);
    message.size = 64 * 1024;
    message.parts = vec![
        Part {
            id: "1".into(),
            mime_type: "text/plain".into(),
            size: 11,
            content: Some("Hello there".into()),
        },
        Part {
            id: "2".into(),
            mime_type: "application/pdf".into(),
            size: 60 * 1024,
            content: Some("%PDF-1.7".into()),
        },
    ];
    message
}

#[test]
fn test_view_remote_completes_partial_message() {
    let harness = Harness::new();
    harness.remote.insert("INBOX", with_attachment(8));
    harness.sync("INBOX");
    let inbox = harness.local.folder("INBOX").unwrap();
    let partial = inbox.message("8").unwrap().unwrap();
    assert!(partial.flags.contains(Flag::DownloadedPartial));
    assert_eq!(partial.parts[1].content, None);
    harness.take_events();

    harness
        .controller
        .load_message_for_view_remote(ACCOUNT, "INBOX", "8", None)
        .unwrap();
    harness.settle();

    let stored = inbox.message("8").unwrap().unwrap();
    assert!(stored.flags.contains(Flag::DownloadedFull));
    assert!(!stored.flags.contains(Flag::DownloadedPartial));
    assert!(stored.flags.is_seen());
    assert_eq!(stored.parts[1].content.as_deref(), Some("%PDF-1.7"));
    let loaded = harness.take_events().into_iter().find_map(|e| match e {
        Event::MessageLoaded { message, .. } => Some(message),
        _ => None,
    });
    assert_eq!(loaded.map(|m| m.flags.contains(Flag::DownloadedFull)), Some(true));
}

#[test]
fn test_view_remote_reports_server_failure() {
    let harness = Harness::new();
    harness.remote.insert("INBOX", with_attachment(8));
    harness.sync("INBOX");
    harness.take_events();
    harness.remote.fail_next(
        Operation::Fetch,
        mailsync_store::Error::Connection("connection reset".into()),
    );

    harness
        .controller
        .load_message_for_view_remote(ACCOUNT, "INBOX", "8", None)
        .unwrap();
    harness.settle();

    let events = harness.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::MessageLoadFailed { uid, message, .. }
            if uid == "8" && message.contains("connection reset")
    )));
    assert!(!events.iter().any(|e| matches!(e, Event::MessageLoaded { .. })));
    let stored = harness.local.folder("INBOX").unwrap().message("8").unwrap().unwrap();
    assert!(stored.flags.contains(Flag::DownloadedPartial));
    assert!(!stored.flags.is_seen());
}

#[test]
fn test_load_attachment_downloads_one_part() {
    let harness = Harness::new();
    harness.remote.insert("INBOX", with_attachment(8));
    harness.sync("INBOX");
    harness.take_events();

    harness
        .controller
        .load_attachment(ACCOUNT, "INBOX", "8", "2", None)
        .unwrap();
    harness
        .controller
        .load_attachment(ACCOUNT, "INBOX", "8", "9", None)
        .unwrap();
    harness.settle();

    let events = harness.take_events();
    let loaded: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::AttachmentLoaded { part, .. } => Some(part.content.as_deref()),
            _ => None,
        })
        .collect();
    assert_eq!(loaded, vec![Some("%PDF-1.7")]);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::AttachmentLoadFailed { part_id, .. } if part_id == "9"
    )));
    let stored = harness.local.folder("INBOX").unwrap().message("8").unwrap().unwrap();
    assert_eq!(stored.parts[1].content.as_deref(), Some("%PDF-1.7"));
    assert!(stored.flags.contains(Flag::DownloadedPartial));
}
