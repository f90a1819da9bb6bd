//! In-memory remote store, transport and pusher.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::lock;
use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::message::{Message, Part};
use crate::profile::{FetchItem, FetchProfile};
use crate::remote::{
    Capabilities, OpenMode, PushReceiver, Pusher, RemoteFolder, Store, Transport, UidMap,
};
use crate::uid;

/// Remote operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Folder listing.
    ListFolders,
    /// Folder creation.
    Create,
    /// Opening a folder.
    Open,
    /// Listing or fetching messages.
    Fetch,
    /// Storing flags.
    SetFlags,
    /// Copying or moving messages.
    CopyOrMove,
    /// Deleting messages.
    Delete,
    /// Uploading a message.
    Append,
    /// Expunging a folder.
    Expunge,
}

#[derive(Debug, Default)]
struct RemoteFolderState {
    messages: Vec<Message>,
    next_uid: u64,
}

impl RemoteFolderState {
    fn insert(&mut self, message: Message) -> String {
        let uid = match uid::numeric(&message.uid) {
            Some(n) => {
                self.next_uid = self.next_uid.max(n + 1);
                message.uid.clone()
            }
            None => self.assign_uid(),
        };
        let mut message = message.with_uid(uid.clone());
        message.flags = message.flags.without_internal();
        self.messages.retain(|m| m.uid != uid);
        self.messages.push(message);
        self.messages
            .sort_by_key(|m| uid::numeric(&m.uid).unwrap_or_default());
        uid
    }

    fn assign_uid(&mut self) -> String {
        self.next_uid = self.next_uid.max(1);
        let uid = self.next_uid.to_string();
        self.next_uid += 1;
        uid
    }
}

#[derive(Debug, Default)]
struct Shared {
    folders: Mutex<BTreeMap<String, RemoteFolderState>>,
    failures: Mutex<HashMap<Operation, VecDeque<Error>>>,
    read_only: Mutex<HashSet<String>>,
    refuse_create: AtomicBool,
    pushers: Mutex<Vec<MemoryPusher>>,
}

impl Shared {
    fn check(&self, op: Operation) -> Result<()> {
        match lock(&self.failures).get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                warn!(operation = ?op, error = %err, "Failing remote operation");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// In-memory remote [`Store`].
///
/// UIDs are numeric and increase per folder. Messages inserted with a
/// numeric UID keep it.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    capabilities: Capabilities,
    sane_body_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store with default capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    /// Creates an empty store advertising the given capabilities.
    #[must_use]
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            shared: Arc::default(),
            capabilities,
            sane_body_limit: 2048,
        }
    }

    /// Creates a folder.
    pub fn add_folder(&self, name: &str) {
        lock(&self.shared.folders).entry(name.to_string()).or_default();
    }

    /// Places a message in a folder, creating the folder if needed.
    ///
    /// Returns the UID the message was stored under.
    pub fn insert(&self, folder: &str, message: Message) -> String {
        lock(&self.shared.folders)
            .entry(folder.to_string())
            .or_default()
            .insert(message)
    }

    /// Returns a folder's messages in UID order.
    #[must_use]
    pub fn messages_in(&self, folder: &str) -> Vec<Message> {
        lock(&self.shared.folders)
            .get(folder)
            .map(|f| f.messages.clone())
            .unwrap_or_default()
    }

    /// Removes a message without going through a folder handle.
    pub fn remove(&self, folder: &str, uid: &str) {
        if let Some(f) = lock(&self.shared.folders).get_mut(folder) {
            f.messages.retain(|m| m.uid != uid);
        }
    }

    /// Sets a flag without going through a folder handle.
    pub fn set_flag(&self, folder: &str, uid: &str, flag: Flag, value: bool) {
        if let Some(f) = lock(&self.shared.folders).get_mut(folder) {
            for message in f.messages.iter_mut().filter(|m| m.uid == uid) {
                message.flags.set(flag, value);
            }
        }
    }

    /// Makes the next call of `op` fail with `error`.
    ///
    /// Failures queue up; each call consumes one.
    pub fn fail_next(&self, op: Operation, error: Error) {
        debug!(operation = ?op, error = %error, "Queued remote failure");
        lock(&self.shared.failures).entry(op).or_default().push_back(error);
    }

    /// Makes read-write opens of `folder` fall back to read-only.
    pub fn set_read_only(&self, folder: &str) {
        lock(&self.shared.read_only).insert(folder.to_string());
    }

    /// Makes folder creation report failure.
    pub fn refuse_create(&self, refuse: bool) {
        self.shared.refuse_create.store(refuse, Ordering::SeqCst);
    }

    /// Pushers created so far.
    #[must_use]
    pub fn pushers(&self) -> Vec<MemoryPusher> {
        lock(&self.shared.pushers).clone()
    }
}

impl Store for MemoryStore {
    fn folder(&self, name: &str) -> Result<Box<dyn RemoteFolder>> {
        Ok(Box::new(MemoryRemoteFolder {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
            mode: None,
            sane_body_limit: self.sane_body_limit,
        }))
    }

    fn list_folders(&self) -> Result<Vec<String>> {
        self.shared.check(Operation::ListFolders)?;
        Ok(lock(&self.shared.folders).keys().cloned().collect())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn pusher(&self, receiver: Arc<dyn PushReceiver>) -> Result<Option<Box<dyn Pusher>>> {
        if !self.capabilities.push {
            return Ok(None);
        }
        let pusher = MemoryPusher::new(receiver);
        lock(&self.shared.pushers).push(pusher.clone());
        Ok(Some(Box::new(pusher)))
    }
}

/// Folder handle returned by [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryRemoteFolder {
    name: String,
    shared: Arc<Shared>,
    mode: Option<OpenMode>,
    sane_body_limit: usize,
}

impl MemoryRemoteFolder {
    fn with_folder<T>(&self, f: impl FnOnce(&mut RemoteFolderState) -> T) -> Result<T> {
        let mut folders = lock(&self.shared.folders);
        let folder = folders
            .get_mut(&self.name)
            .ok_or_else(|| Error::FolderNotFound(self.name.clone()))?;
        Ok(f(folder))
    }

    fn require_write(&self) -> Result<()> {
        match self.mode {
            Some(OpenMode::ReadWrite) => Ok(()),
            _ => Err(Error::ReadOnly(self.name.clone())),
        }
    }

    fn transfer(&self, uids: &[String], dest: &str, remove_source: bool) -> Result<UidMap> {
        self.shared.check(Operation::CopyOrMove)?;
        self.require_write()?;
        let mut folders = lock(&self.shared.folders);
        let source = folders
            .get_mut(&self.name)
            .ok_or_else(|| Error::FolderNotFound(self.name.clone()))?;
        let moving: Vec<Message> = source
            .messages
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .cloned()
            .collect();
        if remove_source {
            source.messages.retain(|m| !uids.contains(&m.uid));
        }
        let target = folders
            .get_mut(dest)
            .ok_or_else(|| Error::FolderNotFound(dest.to_string()))?;
        let mut map = UidMap::new();
        for message in moving {
            let old = message.uid.clone();
            let new = target.assign_uid();
            target.insert(message.with_uid(new.clone()));
            map.insert(old, new);
        }
        Ok(map)
    }

    fn project(&self, message: &Message, profile: &FetchProfile) -> Message {
        let mut out = Message::new(message.uid.clone());
        out.size = message.size;
        out.internal_date = message.internal_date;
        if profile.contains(FetchItem::Flags) {
            out.flags = message.flags.clone();
        }
        if profile.contains(FetchItem::Envelope) {
            out.message_id.clone_from(&message.message_id);
            out.subject.clone_from(&message.subject);
            out.from.clone_from(&message.from);
            out.to.clone_from(&message.to);
        }
        if profile.contains(FetchItem::Structure) {
            out.parts = message
                .parts
                .iter()
                .map(|p| Part {
                    content: None,
                    ..p.clone()
                })
                .collect();
        }
        if profile.contains(FetchItem::Body) {
            out.parts.clone_from(&message.parts);
            out.body.clone_from(&message.body);
        } else if profile.contains(FetchItem::BodySane) {
            out.body = message
                .body
                .as_ref()
                .map(|b| b.chars().take(self.sane_body_limit).collect());
        }
        out
    }
}

impl RemoteFolder for MemoryRemoteFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> Result<bool> {
        Ok(lock(&self.shared.folders).contains_key(&self.name))
    }

    fn create(&self) -> Result<bool> {
        self.shared.check(Operation::Create)?;
        if self.shared.refuse_create.load(Ordering::SeqCst) {
            return Ok(false);
        }
        lock(&self.shared.folders)
            .entry(self.name.clone())
            .or_default();
        Ok(true)
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.shared.check(Operation::Open)?;
        if !self.exists()? {
            return Err(Error::FolderNotFound(self.name.clone()));
        }
        let read_only = lock(&self.shared.read_only).contains(&self.name);
        self.mode = Some(if read_only { OpenMode::ReadOnly } else { mode });
        Ok(())
    }

    fn mode(&self) -> Option<OpenMode> {
        self.mode
    }

    fn close(&mut self) {
        self.mode = None;
    }

    fn message_count(&self) -> Result<usize> {
        self.with_folder(|f| f.messages.len())
    }

    fn messages(
        &self,
        start: usize,
        end: usize,
        earliest: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.shared.check(Operation::Fetch)?;
        self.with_folder(|f| {
            f.messages
                .iter()
                .enumerate()
                .filter(|(i, _)| (start..=end).contains(&(i + 1)))
                .map(|(_, m)| m)
                .filter(|m| !m.is_older_than(earliest))
                .map(|m| {
                    let mut listed = Message::new(m.uid.clone());
                    listed.flags = m.flags.clone();
                    listed.size = m.size;
                    listed.internal_date = m.internal_date;
                    listed
                })
                .collect()
        })
    }

    fn message(&self, uid: &str) -> Result<Option<Message>> {
        self.with_folder(|f| f.messages.iter().find(|m| m.uid == uid).cloned())
    }

    fn fetch(&self, uids: &[String], profile: &FetchProfile) -> Result<Vec<Message>> {
        self.shared.check(Operation::Fetch)?;
        let stored = self.with_folder(|f| f.messages.clone())?;
        Ok(uids
            .iter()
            .filter_map(|uid| stored.iter().find(|m| &m.uid == uid))
            .map(|m| self.project(m, profile))
            .collect())
    }

    fn fetch_parts(&self, uid: &str, part_ids: &[String]) -> Result<Vec<Part>> {
        self.shared.check(Operation::Fetch)?;
        self.with_folder(|f| {
            f.messages
                .iter()
                .find(|m| m.uid == uid)
                .map(|m| {
                    m.parts
                        .iter()
                        .filter(|p| part_ids.contains(&p.id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn set_flags(&self, uids: &[String], flags: &[Flag], value: bool) -> Result<()> {
        self.shared.check(Operation::SetFlags)?;
        self.require_write()?;
        self.with_folder(|f| {
            for message in f.messages.iter_mut().filter(|m| uids.contains(&m.uid)) {
                for flag in flags {
                    message.flags.set(*flag, value);
                }
            }
        })
    }

    fn set_flags_all(&self, flags: &[Flag], value: bool) -> Result<()> {
        self.shared.check(Operation::SetFlags)?;
        self.require_write()?;
        self.with_folder(|f| {
            for message in &mut f.messages {
                for flag in flags {
                    message.flags.set(*flag, value);
                }
            }
        })
    }

    fn copy_messages(&self, uids: &[String], dest: &str) -> Result<UidMap> {
        self.transfer(uids, dest, false)
    }

    fn move_messages(&self, uids: &[String], dest: &str) -> Result<UidMap> {
        self.transfer(uids, dest, true)
    }

    fn delete_messages(&self, uids: &[String], trash: Option<&str>) -> Result<()> {
        self.shared.check(Operation::Delete)?;
        match trash {
            Some(trash) if trash != self.name && self.shared_has(trash) => {
                self.transfer(uids, trash, true).map(|_| ())
            }
            _ => {
                self.require_write()?;
                self.with_folder(|f| {
                    for message in f.messages.iter_mut().filter(|m| uids.contains(&m.uid)) {
                        message.flags.insert(Flag::Deleted);
                    }
                })
            }
        }
    }

    fn append(&self, message: &Message) -> Result<Option<String>> {
        self.shared.check(Operation::Append)?;
        self.with_folder(|f| {
            let uid = f.assign_uid();
            Some(f.insert(message.clone().with_uid(uid)))
        })
    }

    fn uid_from_message_id(&self, message_id: &str) -> Result<Option<String>> {
        self.with_folder(|f| {
            f.messages
                .iter()
                .find(|m| m.message_id.as_deref() == Some(message_id))
                .map(|m| m.uid.clone())
        })
    }

    fn expunge(&self) -> Result<()> {
        self.shared.check(Operation::Expunge)?;
        self.require_write()?;
        self.with_folder(|f| f.messages.retain(|m| !m.flags.is_deleted()))
    }
}

impl MemoryRemoteFolder {
    fn shared_has(&self, folder: &str) -> bool {
        lock(&self.shared.folders).contains_key(folder)
    }
}

/// In-memory [`Transport`] that records what it sends.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    sent: Arc<Mutex<Vec<Message>>>,
    failures: Arc<Mutex<VecDeque<Error>>>,
}

impl MemoryTransport {
    /// Creates a transport that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next send fail with `error`.
    pub fn fail_next(&self, error: Error) {
        lock(&self.failures).push_back(error);
    }

    /// Messages sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        lock(&self.sent).clone()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: &Message) -> Result<()> {
        if let Some(err) = lock(&self.failures).pop_front() {
            warn!(uid = %message.uid, error = %err, "Failing send");
            return Err(err);
        }
        debug!(uid = %message.uid, "Message sent");
        lock(&self.sent).push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
struct PusherState {
    folders: Vec<String>,
    running: bool,
    refreshes: usize,
}

/// In-memory [`Pusher`]. Tests drive its receiver directly.
#[derive(Clone)]
pub struct MemoryPusher {
    receiver: Arc<dyn PushReceiver>,
    state: Arc<Mutex<PusherState>>,
}

impl std::fmt::Debug for MemoryPusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryPusher")
            .field("folders", &state.folders)
            .field("running", &state.running)
            .finish_non_exhaustive()
    }
}

impl MemoryPusher {
    fn new(receiver: Arc<dyn PushReceiver>) -> Self {
        Self {
            receiver,
            state: Arc::default(),
        }
    }

    /// The receiver this pusher reports to.
    #[must_use]
    pub fn receiver(&self) -> Arc<dyn PushReceiver> {
        Arc::clone(&self.receiver)
    }

    /// Folders passed to the last start.
    #[must_use]
    pub fn folders(&self) -> Vec<String> {
        lock(&self.state).folders.clone()
    }

    /// Returns true between start and stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Number of refresh calls.
    #[must_use]
    pub fn refreshes(&self) -> usize {
        lock(&self.state).refreshes
    }
}

impl Pusher for MemoryPusher {
    fn start(&self, folders: &[String]) -> Result<()> {
        debug!(?folders, "Push started");
        let mut state = lock(&self.state);
        state.folders = folders.to_vec();
        state.running = true;
        for folder in folders {
            self.receiver.set_push_active(folder, true);
        }
        Ok(())
    }

    fn refresh(&self) {
        lock(&self.state).refreshes += 1;
    }

    fn stop(&self) {
        let folders = {
            let mut state = lock(&self.state);
            state.running = false;
            state.folders.clone()
        };
        for folder in folders {
            self.receiver.set_push_active(&folder, false);
        }
    }
}
