//! The pending-command log.
//!
//! Remote mutations are applied locally first and recorded here. Each entry
//! is replayed against the server, strictly in append order, before the
//! account is synchronized.

mod replay;

use mailsync_store::{Flag, PendingRecord};

use crate::account::Account;
use crate::error::{Error, Result};

pub use replay::ReplayReport;
pub(crate) use replay::replay;

/// A remote mutation awaiting confirmation from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCommand {
    /// Upload a local message.
    Append {
        /// Folder holding the message.
        folder: String,
        /// Local UID of the message.
        uid: String,
    },
    /// Set or clear a flag on several messages.
    SetFlag {
        /// Folder holding the messages.
        folder: String,
        /// New flag value.
        value: bool,
        /// The flag.
        flag: Flag,
        /// Message UIDs.
        uids: Vec<String>,
    },
    /// Move or copy several messages.
    MoveOrCopy {
        /// Source folder.
        src: String,
        /// Destination folder.
        dest: String,
        /// Copy instead of move.
        is_copy: bool,
        /// Source UIDs.
        uids: Vec<String>,
        /// Local destination UID for each source UID, when known. Used to
        /// rewrite local copies to the UIDs the server assigns.
        remap: Option<Vec<String>>,
    },
    /// Mark every message in a folder as read.
    MarkAllAsRead {
        /// Folder.
        folder: String,
    },
    /// Expunge a folder.
    Expunge {
        /// Folder.
        folder: String,
    },
    /// Delete everything in the trash.
    EmptyTrash,
}

const APPEND: &str = "append";
const SET_FLAG_BULK: &str = "set_flag_bulk";
const MOVE_OR_COPY_BULK: &str = "move_or_copy_bulk";
const MOVE_OR_COPY_BULK_NEW: &str = "move_or_copy_bulk_new";
const MARK_ALL_AS_READ: &str = "mark_all_as_read";
const EXPUNGE: &str = "expunge";
const EMPTY_TRASH: &str = "empty_trash";

impl PendingCommand {
    /// Persisted command name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Append { .. } => APPEND,
            Self::SetFlag { .. } => SET_FLAG_BULK,
            Self::MoveOrCopy { remap: None, .. } => MOVE_OR_COPY_BULK,
            Self::MoveOrCopy { remap: Some(_), .. } => MOVE_OR_COPY_BULK_NEW,
            Self::MarkAllAsRead { .. } => MARK_ALL_AS_READ,
            Self::Expunge { .. } => EXPUNGE,
            Self::EmptyTrash => EMPTY_TRASH,
        }
    }

    /// Folder the command operates on, if it names one.
    #[must_use]
    pub fn folder(&self) -> Option<&str> {
        match self {
            Self::Append { folder, .. }
            | Self::SetFlag { folder, .. }
            | Self::MarkAllAsRead { folder }
            | Self::Expunge { folder } => Some(folder),
            Self::MoveOrCopy { src, .. } => Some(src),
            Self::EmptyTrash => None,
        }
    }

    /// Encodes the command as ordered string arguments.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Append { folder, uid } => vec![folder.clone(), uid.clone()],
            Self::SetFlag {
                folder,
                value,
                flag,
                uids,
            } => {
                let mut args = vec![folder.clone(), value.to_string(), flag.as_str().to_string()];
                args.extend(uids.iter().cloned());
                args
            }
            Self::MoveOrCopy {
                src,
                dest,
                is_copy,
                uids,
                remap,
            } => {
                let mut args = vec![src.clone(), dest.clone(), is_copy.to_string()];
                match remap {
                    None => args.extend(uids.iter().cloned()),
                    Some(new_uids) => {
                        args.push("true".to_string());
                        args.push(uids.len().to_string());
                        args.extend(uids.iter().cloned());
                        args.extend(new_uids.iter().cloned());
                    }
                }
                args
            }
            Self::MarkAllAsRead { folder } | Self::Expunge { folder } => vec![folder.clone()],
            Self::EmptyTrash => Vec::new(),
        }
    }

    /// Decodes a log entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPendingCommand`] for unknown names or
    /// malformed arguments.
    pub fn decode(record: &PendingRecord) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPendingCommand {
            command: record.command.clone(),
            reason: reason.to_string(),
        };
        let args = &record.args;
        let arg = |i: usize| {
            args.get(i)
                .cloned()
                .ok_or_else(|| invalid(&format!("missing argument {i}")))
        };
        let flag_value = |i: usize| -> Result<bool> {
            arg(i)?
                .parse()
                .map_err(|_| invalid(&format!("argument {i} is not a boolean")))
        };

        let command = match record.command.as_str() {
            APPEND => Self::Append {
                folder: arg(0)?,
                uid: arg(1)?,
            },
            SET_FLAG_BULK => Self::SetFlag {
                folder: arg(0)?,
                value: flag_value(1)?,
                flag: Flag::parse(&arg(2)?).ok_or_else(|| invalid("unknown flag"))?,
                uids: args.iter().skip(3).cloned().collect(),
            },
            MOVE_OR_COPY_BULK => Self::MoveOrCopy {
                src: arg(0)?,
                dest: arg(1)?,
                is_copy: flag_value(2)?,
                uids: args.iter().skip(3).cloned().collect(),
                remap: None,
            },
            MOVE_OR_COPY_BULK_NEW => {
                let count: usize = arg(4)?
                    .parse()
                    .map_err(|_| invalid("UID count is not a number"))?;
                if args.len() != 5 + count * 2 {
                    return Err(invalid("UID remap table is incomplete"));
                }
                Self::MoveOrCopy {
                    src: arg(0)?,
                    dest: arg(1)?,
                    is_copy: flag_value(2)?,
                    uids: args[5..5 + count].to_vec(),
                    remap: Some(args[5 + count..].to_vec()),
                }
            }
            MARK_ALL_AS_READ => Self::MarkAllAsRead { folder: arg(0)? },
            EXPUNGE => Self::Expunge { folder: arg(0)? },
            EMPTY_TRASH => Self::EmptyTrash,
            _ => return Err(invalid("unknown command")),
        };
        Ok(command)
    }
}

/// Appends a command to the account's pending log.
pub(crate) fn queue_pending(account: &Account, command: &PendingCommand) -> Result<PendingRecord> {
    let record = account
        .local()
        .add_pending_command(command.name(), command.args())?;
    tracing::debug!(account = %account.id(), command = command.name(), id = record.id, "Queued pending command");
    Ok(record)
}
