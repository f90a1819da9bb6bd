//! In-memory backends.
//!
//! Complete implementations of every capability trait, backed by
//! mutex-guarded maps. They keep no state on disk and are meant for tests,
//! demos and as a reference for real backends. The remote side exposes
//! failure injection so callers can exercise error paths deterministically.

mod local;
mod remote;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use local::{MemoryLocalFolder, MemoryLocalStore};
pub use remote::{MemoryPusher, MemoryRemoteFolder, MemoryStore, MemoryTransport, Operation};

/// Locks a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
