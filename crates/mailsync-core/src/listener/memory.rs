//! Replays in-progress state to listeners that register late.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::Listener;
use crate::account::AccountId;
use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Started,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Default)]
struct Memory {
    syncing: Option<Phase>,
    sending: Option<Phase>,
    processing: Option<Phase>,
    push_active: Option<bool>,
    failure: Option<String>,
    pending_title: Option<String>,
    completed: usize,
    total: usize,
    remote_total: usize,
    new_messages: usize,
}

type Key = (AccountId, Option<String>);

/// Remembers the last known sync, send, push and replay state per
/// account and folder.
///
/// The controller registers it ahead of every other listener so that a
/// listener added later can be brought up to date with [`replay`](Self::replay).
#[derive(Debug, Default)]
pub struct MemorizingListener {
    memories: Mutex<BTreeMap<Key, Memory>>,
}

impl MemorizingListener {
    /// Creates an empty memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, key: Key, f: impl FnOnce(&mut Memory)) {
        let mut memories = self.memories.lock().unwrap_or_else(PoisonError::into_inner);
        f(memories.entry(key).or_default());
    }

    /// Re-emits remembered state to `target`.
    pub fn replay(&self, target: &dyn Listener) {
        let snapshot: Vec<(Key, Memory)> = self
            .memories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect();

        for ((account, folder), memory) in snapshot {
            for event in replay_events(account, folder, &memory) {
                target.on_event(&event);
            }
        }
    }
}

fn replay_events(account: AccountId, folder: Option<String>, memory: &Memory) -> Vec<Event> {
    let mut events = Vec::new();
    let message = memory.failure.clone().unwrap_or_default();

    if let Some(folder) = folder.clone() {
        match memory.syncing {
            Some(Phase::Started) => events.push(Event::SyncStarted {
                account,
                folder: folder.clone(),
            }),
            Some(Phase::Finished) => events.push(Event::SyncFinished {
                account,
                folder: folder.clone(),
                total: memory.remote_total,
                new: memory.new_messages,
            }),
            Some(Phase::Failed) => events.push(Event::SyncFailed {
                account,
                folder: folder.clone(),
                message: message.clone(),
            }),
            None => {}
        }
        if let Some(active) = memory.push_active {
            events.push(Event::PushActive {
                account,
                folder,
                active,
            });
        }
    }

    match memory.sending {
        Some(Phase::Started) => events.push(Event::SendStarted { account }),
        Some(Phase::Finished) => events.push(Event::SendCompleted { account }),
        Some(Phase::Failed) => events.push(Event::SendFailed { account, message }),
        None => {}
    }

    match memory.processing {
        Some(Phase::Started) => {
            events.push(Event::PendingCommandsProcessing { account });
            if let Some(title) = memory.pending_title.clone() {
                events.push(Event::PendingCommandStarted { account, title });
            }
        }
        Some(Phase::Finished | Phase::Failed) => {
            events.push(Event::PendingCommandsFinished { account });
        }
        None => {}
    }

    let in_progress = memory.syncing == Some(Phase::Started)
        || memory.sending == Some(Phase::Started)
        || memory.processing == Some(Phase::Started);
    if in_progress && memory.total > 0 {
        events.push(Event::SyncProgress {
            account,
            folder,
            completed: memory.completed,
            total: memory.total,
        });
    }
    events
}

impl Listener for MemorizingListener {
    fn on_event(&self, event: &Event) {
        let Some(account) = event.account() else {
            return;
        };
        let folder = event.folder().map(ToString::to_string);

        match event {
            Event::SyncStarted { .. } => self.update((account, folder), |m| {
                m.syncing = Some(Phase::Started);
                m.completed = 0;
                m.total = 0;
                m.failure = None;
            }),
            Event::SyncFinished { total, new, .. } => {
                let (total, new) = (*total, *new);
                self.update((account, folder), |m| {
                    m.syncing = Some(Phase::Finished);
                    m.remote_total = total;
                    m.new_messages = new;
                });
            }
            Event::SyncFailed { message, .. } => self.update((account, folder), |m| {
                m.syncing = Some(Phase::Failed);
                m.failure = Some(message.clone());
            }),
            Event::SyncProgress {
                completed, total, ..
            } => {
                let (completed, total) = (*completed, *total);
                self.update((account, folder), |m| {
                    m.completed = completed;
                    m.total = total;
                });
            }
            Event::PushActive { active, .. } => {
                let active = *active;
                self.update((account, folder), |m| m.push_active = Some(active));
            }
            Event::SendStarted { .. } => self.update((account, None), |m| {
                m.sending = Some(Phase::Started);
                m.failure = None;
            }),
            Event::SendCompleted { .. } => {
                self.update((account, None), |m| m.sending = Some(Phase::Finished));
            }
            Event::SendFailed { message, .. } => self.update((account, None), |m| {
                m.sending = Some(Phase::Failed);
                m.failure = Some(message.clone());
            }),
            Event::PendingCommandsProcessing { .. } => self.update((account, None), |m| {
                m.processing = Some(Phase::Started);
                m.pending_title = None;
            }),
            Event::PendingCommandStarted { title, .. } => {
                self.update((account, None), |m| m.pending_title = Some(title.clone()));
            }
            Event::PendingCommandsFinished { .. } => self.update((account, None), |m| {
                m.processing = Some(Phase::Finished);
                m.pending_title = None;
            }),
            _ => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn collect(memory: &MemorizingListener) -> Vec<Event> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        memory.replay(&move |event: &Event| sink.lock().unwrap().push(event.clone()));
        let events = seen.lock().unwrap().clone();
        events
    }

    #[test]
    fn test_replays_sync_in_progress() {
        let memory = MemorizingListener::new();
        let account = AccountId(1);
        memory.on_event(&Event::SyncStarted {
            account,
            folder: "INBOX".into(),
        });
        memory.on_event(&Event::SyncProgress {
            account,
            folder: Some("INBOX".into()),
            completed: 3,
            total: 10,
        });

        let events = collect(&memory);
        assert_eq!(
            events,
            vec![
                Event::SyncStarted {
                    account,
                    folder: "INBOX".into()
                },
                Event::SyncProgress {
                    account,
                    folder: Some("INBOX".into()),
                    completed: 3,
                    total: 10
                },
            ]
        );
    }

    #[test]
    fn test_replays_failure_and_send_state() {
        let memory = MemorizingListener::new();
        let account = AccountId(4);
        memory.on_event(&Event::SyncFailed {
            account,
            folder: "Work".into(),
            message: "timeout".into(),
        });
        memory.on_event(&Event::SendStarted { account });

        let events = collect(&memory);
        assert!(events.contains(&Event::SyncFailed {
            account,
            folder: "Work".into(),
            message: "timeout".into()
        }));
        assert!(events.contains(&Event::SendStarted { account }));
    }

    #[test]
    fn test_replays_pending_command_title() {
        let memory = MemorizingListener::new();
        let account = AccountId(2);
        memory.on_event(&Event::PendingCommandsProcessing { account });
        memory.on_event(&Event::PendingCommandStarted {
            account,
            title: "append".into(),
        });

        let events = collect(&memory);
        assert_eq!(
            events,
            vec![
                Event::PendingCommandsProcessing { account },
                Event::PendingCommandStarted {
                    account,
                    title: "append".into()
                },
            ]
        );
    }

    #[test]
    fn test_ignores_unscoped_events() {
        let memory = MemorizingListener::new();
        memory.on_event(&Event::CommandCompleted { more_work: false });
        assert!(collect(&memory).is_empty());
    }
}
