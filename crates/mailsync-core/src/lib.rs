//! # mailsync-core
//!
//! Offline-first mail synchronization controller.
//!
//! This crate provides:
//! - A two-tier command queue drained by a single worker thread
//! - The durable pending-command log and its in-order replay
//! - Mailbox reconciliation with visible limits and partial downloads
//! - Outbox delivery with bounded send attempts
//! - New-mail notification aggregation
//! - A blocking push bridge for server push
//! - Listener fan-out with replay of in-progress state

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod config;
mod context;
mod controller;
mod error;
mod error_folder;
pub mod event;
pub mod listener;
pub mod notify;
pub mod pending;
mod push;
pub mod queue;
mod send;
mod sync;

pub use account::{Account, AccountId, AccountStats};
pub use config::{AccountConfig, ControllerConfig, DeletePolicy, ExpungePolicy, Protocol};
pub use controller::{CommandListener, Controller, SearchQuery};
pub use error::{Disposition, Error, Result};
pub use error_folder::ErrorFolder;
pub use event::Event;
pub use listener::{Listener, ListenerId, MemorizingListener};
pub use notify::{Aggregator, NotificationSink, SendFailureTarget, Summary, TracingSink};
pub use pending::{PendingCommand, ReplayReport};
pub use queue::Priority;
pub use send::SendCounts;
pub use sync::Suppressed;
