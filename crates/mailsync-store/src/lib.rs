//! # mailsync-store
//!
//! Storage and transport contracts for the mailsync controller.
//!
//! This crate provides:
//! - The message model: [`Message`] snapshots, [`Flag`]s, UIDs
//! - Remote capability traits: [`Store`], [`RemoteFolder`], [`Transport`], [`Pusher`]
//! - Local capability traits: [`LocalStore`], [`LocalFolder`] and the pending-command log
//! - The shared error taxonomy with its permanent/transient classification
//! - In-memory implementations of every trait in [`memory`]

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod error;
pub mod flag;
pub mod local;
pub mod memory;
pub mod message;
pub mod profile;
pub mod remote;
pub mod uid;

pub use error::{Error, Result};
pub use flag::{Flag, FlagSet};
pub use local::{LocalFolder, LocalStore, PendingRecord};
pub use message::{Address, Message, Part};
pub use profile::{FetchItem, FetchProfile};
pub use remote::{
    Capabilities, OpenMode, PushReceiver, Pusher, RemoteFolder, Store, Transport, UidMap,
};
