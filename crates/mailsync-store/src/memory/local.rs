//! In-memory local store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::lock;
use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::local::{LocalFolder, LocalStore, PendingRecord};
use crate::message::Message;

#[derive(Debug, Default)]
struct FolderState {
    exists: bool,
    messages: Vec<Message>,
    visible_limit: Option<usize>,
    last_checked: Option<DateTime<Utc>>,
    last_push: Option<DateTime<Utc>>,
    status: Option<String>,
    push_state: Option<String>,
}

#[derive(Debug, Default)]
struct PendingLog {
    next_id: u64,
    records: Vec<PendingRecord>,
}

#[derive(Debug, Default)]
struct Shared {
    folders: Mutex<BTreeMap<String, Arc<Mutex<FolderState>>>>,
    pending: Mutex<PendingLog>,
    unavailable: AtomicBool,
}

impl Shared {
    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            warn!("Local store is not mounted");
            return Err(Error::StorageUnavailable("local store is not mounted".into()));
        }
        Ok(())
    }
}

/// In-memory [`LocalStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryLocalStore {
    shared: Arc<Shared>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with the given folders already present.
    #[must_use]
    pub fn with_folders(names: &[&str]) -> Self {
        let store = Self::new();
        {
            let mut folders = lock(&store.shared.folders);
            for name in names {
                let state = FolderState {
                    exists: true,
                    ..FolderState::default()
                };
                folders.insert((*name).to_string(), Arc::new(Mutex::new(state)));
            }
        }
        store
    }

    /// Simulates the storage medium being unmounted or remounted.
    pub fn set_available(&self, available: bool) {
        debug!(available, "Local store availability changed");
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    fn state(&self, name: &str) -> Arc<Mutex<FolderState>> {
        Arc::clone(
            lock(&self.shared.folders)
                .entry(name.to_string())
                .or_default(),
        )
    }
}

impl LocalStore for MemoryLocalStore {
    fn folder(&self, name: &str) -> Result<Arc<dyn LocalFolder>> {
        self.shared.check_available()?;
        Ok(Arc::new(MemoryLocalFolder {
            name: name.to_string(),
            state: self.state(name),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn folders(&self) -> Result<Vec<String>> {
        self.shared.check_available()?;
        Ok(lock(&self.shared.folders)
            .iter()
            .filter(|(_, state)| lock(state).exists)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn delete_folder(&self, name: &str) -> Result<()> {
        self.shared.check_available()?;
        if let Some(state) = lock(&self.shared.folders).remove(name) {
            let mut state = lock(&state);
            state.exists = false;
            state.messages.clear();
        }
        Ok(())
    }

    fn pending_commands(&self) -> Result<Vec<PendingRecord>> {
        self.shared.check_available()?;
        Ok(lock(&self.shared.pending).records.clone())
    }

    fn add_pending_command(&self, command: &str, args: Vec<String>) -> Result<PendingRecord> {
        self.shared.check_available()?;
        let mut log = lock(&self.shared.pending);
        log.next_id += 1;
        let record = PendingRecord {
            id: log.next_id,
            command: command.to_string(),
            args,
        };
        log.records.push(record.clone());
        Ok(record)
    }

    fn remove_pending_command(&self, id: u64) -> Result<()> {
        self.shared.check_available()?;
        lock(&self.shared.pending).records.retain(|r| r.id != id);
        Ok(())
    }

    fn remove_all_pending_commands(&self) -> Result<()> {
        self.shared.check_available()?;
        lock(&self.shared.pending).records.clear();
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        self.shared.check_available()?;
        let folders = lock(&self.shared.folders);
        Ok(folders
            .values()
            .map(|state| lock(state).messages.iter().map(|m| m.size).sum::<u64>())
            .sum())
    }

    fn compact(&self) -> Result<()> {
        self.shared.check_available()?;
        for state in lock(&self.shared.folders).values() {
            lock(state).messages.retain(|m| !m.flags.is_deleted());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.shared.check_available()?;
        for state in lock(&self.shared.folders).values() {
            lock(state).messages.clear();
        }
        Ok(())
    }

    fn reset_visible_limits(&self, limit: usize) -> Result<()> {
        self.shared.check_available()?;
        for state in lock(&self.shared.folders).values() {
            lock(state).visible_limit = Some(limit);
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.shared.unavailable.load(Ordering::SeqCst)
    }
}

/// Folder handle returned by [`MemoryLocalStore`].
#[derive(Debug)]
pub struct MemoryLocalFolder {
    name: String,
    state: Arc<Mutex<FolderState>>,
    shared: Arc<Shared>,
}

impl MemoryLocalFolder {
    fn with_state<T>(&self, f: impl FnOnce(&mut FolderState) -> T) -> Result<T> {
        self.shared.check_available()?;
        Ok(f(&mut lock(&self.state)))
    }
}

impl LocalFolder for MemoryLocalFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> Result<bool> {
        self.with_state(|s| s.exists)
    }

    fn create(&self) -> Result<bool> {
        self.with_state(|s| !std::mem::replace(&mut s.exists, true))
    }

    fn messages(&self) -> Result<Vec<Message>> {
        self.with_state(|s| s.messages.clone())
    }

    fn message(&self, uid: &str) -> Result<Option<Message>> {
        self.with_state(|s| s.messages.iter().find(|m| m.uid == uid).cloned())
    }

    fn store(&self, message: &Message) -> Result<()> {
        self.with_state(|s| {
            s.exists = true;
            match s.messages.iter_mut().find(|m| m.uid == message.uid) {
                Some(existing) => *existing = message.clone(),
                None => s.messages.push(message.clone()),
            }
        })
    }

    fn set_flags(&self, uids: &[String], flags: &[Flag], value: bool) -> Result<()> {
        self.with_state(|s| {
            for message in s.messages.iter_mut().filter(|m| uids.contains(&m.uid)) {
                for flag in flags {
                    message.flags.set(*flag, value);
                }
            }
        })
    }

    fn set_flags_all(&self, flags: &[Flag], value: bool) -> Result<()> {
        self.with_state(|s| {
            for message in &mut s.messages {
                for flag in flags {
                    message.flags.set(*flag, value);
                }
            }
        })
    }

    fn destroy(&self, uid: &str) -> Result<()> {
        self.with_state(|s| s.messages.retain(|m| m.uid != uid))
    }

    fn change_uid(&self, old: &str, new: &str) -> Result<()> {
        self.with_state(|s| {
            if let Some(message) = s.messages.iter_mut().find(|m| m.uid == old) {
                message.uid = new.to_string();
            }
        })
    }

    fn visible_limit(&self) -> Result<Option<usize>> {
        self.with_state(|s| s.visible_limit)
    }

    fn set_visible_limit(&self, limit: Option<usize>) -> Result<()> {
        self.with_state(|s| s.visible_limit = limit)
    }

    fn last_checked(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_state(|s| s.last_checked)
    }

    fn set_last_checked(&self, at: DateTime<Utc>) -> Result<()> {
        self.with_state(|s| s.last_checked = Some(at))
    }

    fn last_push(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_state(|s| s.last_push)
    }

    fn set_last_push(&self, at: DateTime<Utc>) -> Result<()> {
        self.with_state(|s| s.last_push = Some(at))
    }

    fn status(&self) -> Result<Option<String>> {
        self.with_state(|s| s.status.clone())
    }

    fn set_status(&self, status: Option<&str>) -> Result<()> {
        self.with_state(|s| s.status = status.map(ToString::to_string))
    }

    fn push_state(&self) -> Result<Option<String>> {
        self.with_state(|s| s.push_state.clone())
    }

    fn set_push_state(&self, state: Option<&str>) -> Result<()> {
        self.with_state(|s| s.push_state = state.map(ToString::to_string))
    }
}
