//! Accounts known to the controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mailsync_store::{LocalFolder, LocalStore, Store, Transport};
use serde::{Deserialize, Serialize};

use crate::config::AccountConfig;
use crate::error::Result;

/// Unique identifier for an account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct AccountId(pub i64);

impl AccountId {
    /// Create a new account ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate counters for an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStats {
    /// Unread messages across synchronized folders.
    pub unread: usize,
    /// Flagged messages across synchronized folders.
    pub flagged: usize,
    /// Local storage used, in bytes.
    pub size: u64,
}

/// An account: its configuration and the backends serving it.
pub struct Account {
    config: AccountConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    ring_notified: AtomicBool,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.config.id)
            .field("email", &self.config.email)
            .finish_non_exhaustive()
    }
}

impl Account {
    /// Creates an account from its configuration and backends.
    #[must_use]
    pub fn new(
        config: AccountConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            local,
            remote,
            transport,
            ring_notified: AtomicBool::new(false),
        }
    }

    /// Account identifier.
    #[must_use]
    pub const fn id(&self) -> AccountId {
        self.config.id
    }

    /// Account settings.
    #[must_use]
    pub const fn config(&self) -> &AccountConfig {
        &self.config
    }

    /// Local mirror.
    #[must_use]
    pub fn local(&self) -> &dyn LocalStore {
        self.local.as_ref()
    }

    /// Remote store.
    #[must_use]
    pub fn remote(&self) -> &dyn Store {
        self.remote.as_ref()
    }

    /// Outgoing transport.
    #[must_use]
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Returns false when the local storage medium is missing.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.local.is_available()
    }

    /// Opens a local folder handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store is unavailable.
    pub fn local_folder(&self, name: &str) -> Result<Arc<dyn LocalFolder>> {
        Ok(self.local.folder(name)?)
    }

    /// Starts a new check cycle: the next notification may ring again.
    pub fn reset_ring(&self) {
        self.ring_notified.store(false, Ordering::SeqCst);
    }

    /// Claims the ring for the current cycle. True only for the first caller.
    pub fn claim_ring(&self) -> bool {
        !self.ring_notified.swap(true, Ordering::SeqCst)
    }

    /// Unread count across folders, excluding local-only folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store is unavailable.
    pub fn unread_count(&self) -> Result<usize> {
        Ok(self.stats()?.unread)
    }

    /// Computes unread, flagged and size counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store is unavailable.
    pub fn stats(&self) -> Result<AccountStats> {
        let mut stats = AccountStats {
            size: self.local.size()?,
            ..AccountStats::default()
        };
        for name in self.local.folders()? {
            if self.config.is_local_only(&name) {
                continue;
            }
            let folder = self.local.folder(&name)?;
            stats.unread += folder.unread_count()?;
            stats.flagged += folder.flagged_count()?;
        }
        Ok(stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mailsync_store::memory::{MemoryLocalStore, MemoryStore, MemoryTransport};
    use mailsync_store::{Flag, Message};

    use super::*;

    fn account(local: &MemoryLocalStore) -> Account {
        Account::new(
            AccountConfig::new(AccountId(7), "me@example.com"),
            Arc::new(local.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryTransport::new()),
        )
    }

    #[test]
    fn test_ring_claimed_once_per_cycle() {
        let account = account(&MemoryLocalStore::new());
        assert!(account.claim_ring());
        assert!(!account.claim_ring());
        account.reset_ring();
        assert!(account.claim_ring());
    }

    #[test]
    fn test_stats_skip_local_only_folders() {
        let local = MemoryLocalStore::with_folders(&["INBOX", "Outbox"]);
        let account = account(&local);
        local
            .folder("INBOX")
            .unwrap()
            .store(&Message::new("1").with_flag(Flag::Flagged, true))
            .unwrap();
        local
            .folder("Outbox")
            .unwrap()
            .store(&Message::new("mailsync-local:1"))
            .unwrap();

        let stats = account.stats().unwrap();
        assert_eq!(stats.unread, 1);
        assert_eq!(stats.flagged, 1);
    }

    #[test]
    fn test_account_id_display() {
        assert_eq!(AccountId::new(42).to_string(), "42");
    }
}
