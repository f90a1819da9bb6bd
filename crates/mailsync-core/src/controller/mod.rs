//! The controller: accounts, listeners, the command worker and the pool.
//!
//! Every public operation returns immediately. Work that talks to a server
//! is queued for the single worker thread; read-only local work runs on a
//! small blocking pool.

mod ops;
mod pool;
mod view;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use mailsync_store::Pusher;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::account::{Account, AccountId};
use crate::config::ControllerConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::error_folder::ErrorFolder;
use crate::event::Event;
use crate::listener::{Listener, ListenerId, ListenerSet, MemorizingListener};
use crate::notify::{Aggregator, NotificationSink};
use crate::queue::{CommandQueue, Priority, Work, Worker};
use crate::send::SendCounts;
use crate::sync::Suppressed;

pub use pool::SearchQuery;

/// Listener attached to a single command.
pub type CommandListener = Option<Arc<dyn Listener>>;

/// State shared by the controller, queued commands, pool tasks and push
/// bridges.
pub(crate) struct Inner {
    pub(crate) config: ControllerConfig,
    accounts: RwLock<BTreeMap<AccountId, Arc<Account>>>,
    queue: Arc<CommandQueue>,
    pub(crate) listeners: Arc<ListenerSet>,
    memory: Arc<MemorizingListener>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    errors: ErrorFolder,
    pub(crate) notifications: Aggregator,
    suppressed: Suppressed,
    send_counts: SendCounts,
    pub(crate) pushers: Mutex<HashMap<AccountId, Box<dyn Pusher>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("accounts", &self.read_accounts().len())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn read_accounts(&self) -> RwLockReadGuard<'_, BTreeMap<AccountId, Arc<Account>>> {
        self.accounts.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up an account.
    pub(crate) fn account(&self, id: AccountId) -> Result<Arc<Account>> {
        self.read_accounts()
            .get(&id)
            .cloned()
            .ok_or(Error::AccountNotFound(id))
    }

    pub(crate) fn all_accounts(&self) -> Vec<Arc<Account>> {
        self.read_accounts().values().cloned().collect()
    }

    /// Borrows what a command on `account` needs to report its work.
    pub(crate) fn context<'a>(
        &'a self,
        account: &'a Account,
        listener: Option<&'a dyn Listener>,
    ) -> Context<'a> {
        Context {
            account,
            listeners: &self.listeners,
            listener,
            errors: &self.errors,
            notifications: &self.notifications,
            suppressed: &self.suppressed,
        }
    }

    pub(crate) fn emit(&self, listener: Option<&dyn Listener>, event: Event) {
        self.listeners.emit(listener, event);
    }

    /// Queues work for the worker thread.
    ///
    /// Work holds only a weak reference, so queued commands never keep a
    /// dropped controller alive.
    pub(crate) fn submit<F>(
        self: &Arc<Self>,
        description: impl Into<String>,
        listener: CommandListener,
        priority: Priority,
        work: F,
    ) where
        F: Fn(&Arc<Self>, Option<&dyn Listener>) -> Result<()> + Send + Sync + 'static,
    {
        let inner = Arc::downgrade(self);
        let command_listener = listener.clone();
        let work: Work = Arc::new(move || match inner.upgrade() {
            Some(inner) => work(&inner, command_listener.as_deref()),
            None => Ok(()),
        });
        self.queue.submit(description, listener, work, priority);
    }

    /// Runs read-only work on the pool.
    pub(crate) fn spawn<F>(self: &Arc<Self>, description: &'static str, work: F)
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        if self.queue.is_closed() {
            debug!(task = description, "Controller stopped, dropping pool task");
            return;
        }
        let inner = Arc::clone(self);
        self.handle.spawn_blocking(move || {
            debug!(task = description, "Running pool task");
            work(&inner);
        });
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.queue.is_closed()
    }
}

/// Mail synchronization controller.
///
/// Create one per process with [`Controller::new`], register accounts and
/// listeners, then call operations. Call [`Controller::stop`] (or drop the
/// controller) to shut down the worker and the pool.
pub struct Controller {
    pub(crate) inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Starts a controller with its worker thread and pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or the worker thread cannot be
    /// started.
    pub fn new(config: ControllerConfig, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.pool_size.max(1))
            .thread_name("mailsync-pool")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let listeners = Arc::new(ListenerSet::new(config.event_capacity));
        let memory = Arc::new(MemorizingListener::new());
        listeners.add(Arc::clone(&memory) as Arc<dyn Listener>);

        let queue = Arc::new(CommandQueue::new());
        let worker = Worker::spawn(
            Arc::clone(&queue),
            Arc::clone(&listeners),
            handle.clone(),
            config.command_retry_delay,
        )?;

        let inner = Arc::new(Inner {
            errors: ErrorFolder::new(config.error_folder_enabled, config.error_retention),
            config,
            accounts: RwLock::new(BTreeMap::new()),
            queue,
            listeners,
            memory,
            runtime: Mutex::new(Some(runtime)),
            handle,
            notifications: Aggregator::new(sink),
            suppressed: Suppressed::default(),
            send_counts: SendCounts::default(),
            pushers: Mutex::new(HashMap::new()),
        });
        info!("Controller started");
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Controller settings.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Registers an account, replacing any account with the same id.
    pub fn add_account(&self, account: Account) -> Arc<Account> {
        let account = Arc::new(account);
        info!(account = %account.id(), email = %account.config().email, "Account added");
        self.inner
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.id(), Arc::clone(&account));
        account
    }

    /// Unregisters an account, stopping its pusher and clearing its
    /// notification.
    pub fn remove_account(&self, id: AccountId) -> Option<Arc<Account>> {
        let removed = self
            .inner
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            let pusher = self
                .inner
                .pushers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if let Some(pusher) = pusher {
                pusher.stop();
            }
            self.inner.notifications.clear(id);
            info!(account = %id, "Account removed");
        }
        removed
    }

    /// Looks up an account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] if no account has this id.
    pub fn account(&self, id: AccountId) -> Result<Arc<Account>> {
        self.inner.account(id)
    }

    /// Every registered account, ordered by id.
    #[must_use]
    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.inner.all_accounts()
    }

    /// Registers a listener, then replays the state of operations already
    /// in progress to it.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = self.inner.listeners.add(Arc::clone(&listener));
        self.inner.memory.replay(listener.as_ref());
        id
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Subscribes to every future event through a broadcast channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.listeners.subscribe()
    }

    /// The notification aggregator.
    #[must_use]
    pub fn notifications(&self) -> &Aggregator {
        &self.inner.notifications
    }

    /// Number of commands waiting for the worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Stops pushers, the worker and the pool. Queued commands are dropped.
    ///
    /// Safe to call more than once.
    pub fn stop(&self) {
        if !self.inner.is_running() {
            return;
        }
        self.stop_all_pushing();
        self.inner.queue.close();
        if let Some(mut worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.join();
        }
        let runtime = self
            .inner
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        info!("Controller stopped");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}
