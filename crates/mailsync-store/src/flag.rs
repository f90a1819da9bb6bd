//! Message flags.

use serde::{Deserialize, Serialize};

/// Message flags.
///
/// The first six variants mirror server-side flags. The remaining ones are
/// internal bookkeeping that never leaves the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    /// Message has been read.
    Seen,
    /// Message has been answered.
    Answered,
    /// Message has been forwarded.
    Forwarded,
    /// Message is flagged for special attention.
    Flagged,
    /// Message is marked for deletion.
    Deleted,
    /// Message is a draft.
    Draft,
    /// The complete message body is stored locally.
    DownloadedFull,
    /// Only the envelope and viewable text parts are stored locally.
    DownloadedPartial,
    /// An upload of this message to the server has begun.
    RemoteCopyStarted,
    /// The message is being handed to the transport.
    SendInProgress,
    /// The last send attempt failed.
    SendFailed,
}

impl Flag {
    /// Flags compared between local and remote copies during flag sync.
    pub const SYNCED: [Self; 4] = [Self::Seen, Self::Flagged, Self::Answered, Self::Forwarded];

    /// Parses a flag name as written by [`Flag::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let flag = match s.to_uppercase().as_str() {
            "SEEN" => Self::Seen,
            "ANSWERED" => Self::Answered,
            "FORWARDED" => Self::Forwarded,
            "FLAGGED" => Self::Flagged,
            "DELETED" => Self::Deleted,
            "DRAFT" => Self::Draft,
            "X_DOWNLOADED_FULL" => Self::DownloadedFull,
            "X_DOWNLOADED_PARTIAL" => Self::DownloadedPartial,
            "X_REMOTE_COPY_STARTED" => Self::RemoteCopyStarted,
            "X_SEND_IN_PROGRESS" => Self::SendInProgress,
            "X_SEND_FAILED" => Self::SendFailed,
            _ => return None,
        };
        Some(flag)
    }

    /// Returns the flag's persisted name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Seen => "SEEN",
            Self::Answered => "ANSWERED",
            Self::Forwarded => "FORWARDED",
            Self::Flagged => "FLAGGED",
            Self::Deleted => "DELETED",
            Self::Draft => "DRAFT",
            Self::DownloadedFull => "X_DOWNLOADED_FULL",
            Self::DownloadedPartial => "X_DOWNLOADED_PARTIAL",
            Self::RemoteCopyStarted => "X_REMOTE_COPY_STARTED",
            Self::SendInProgress => "X_SEND_IN_PROGRESS",
            Self::SendFailed => "X_SEND_FAILED",
        }
    }

    /// Returns true for flags that only exist in the local store.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::DownloadedFull
                | Self::DownloadedPartial
                | Self::RemoteCopyStarted
                | Self::SendInProgress
                | Self::SendFailed
        )
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Collection of message flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet {
    flags: Vec<Flag>,
}

impl FlagSet {
    /// Creates an empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a flag.
    pub fn insert(&mut self, flag: Flag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    /// Removes a flag.
    pub fn remove(&mut self, flag: Flag) {
        self.flags.retain(|f| *f != flag);
    }

    /// Adds or removes a flag. Returns true if the set changed.
    pub fn set(&mut self, flag: Flag, value: bool) -> bool {
        if self.contains(flag) == value {
            return false;
        }
        if value {
            self.flags.push(flag);
        } else {
            self.remove(flag);
        }
        true
    }

    /// Returns true if the flag is present.
    #[must_use]
    pub fn contains(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Returns true if the message has been seen.
    #[must_use]
    pub fn is_seen(&self) -> bool {
        self.contains(Flag::Seen)
    }

    /// Returns true if the message is flagged.
    #[must_use]
    pub fn is_flagged(&self) -> bool {
        self.contains(Flag::Flagged)
    }

    /// Returns true if the message is marked for deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.contains(Flag::Deleted)
    }

    /// Returns true if any part of the body has been downloaded.
    #[must_use]
    pub fn is_downloaded(&self) -> bool {
        self.contains(Flag::DownloadedFull) || self.contains(Flag::DownloadedPartial)
    }

    /// Returns a copy without internal bookkeeping flags.
    #[must_use]
    pub fn without_internal(&self) -> Self {
        self.iter().copied().filter(|f| !f.is_internal()).collect()
    }

    /// Returns an iterator over the flags.
    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.flags.iter()
    }

    /// Returns the number of flags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Returns true if there are no flags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

impl FromIterator<Flag> for FlagSet {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        let mut set = Self::new();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

impl IntoIterator for FlagSet {
    type Item = Flag;
    type IntoIter = std::vec::IntoIter<Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.flags.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parse_round_trip() {
        for flag in [
            Flag::Seen,
            Flag::Forwarded,
            Flag::Deleted,
            Flag::DownloadedPartial,
            Flag::SendFailed,
        ] {
            assert_eq!(Flag::parse(flag.as_str()), Some(flag));
        }
        assert_eq!(Flag::parse("seen"), Some(Flag::Seen));
        assert_eq!(Flag::parse("$Junk"), None);
    }

    #[test]
    fn test_flag_set_set_reports_change() {
        let mut flags = FlagSet::new();
        assert!(flags.set(Flag::Seen, true));
        assert!(!flags.set(Flag::Seen, true));
        assert!(flags.is_seen());
        assert!(flags.set(Flag::Seen, false));
        assert!(flags.is_empty());
    }

    #[test]
    fn test_flag_set_dedupes() {
        let flags: FlagSet = [Flag::Seen, Flag::Seen, Flag::DownloadedFull]
            .into_iter()
            .collect();
        assert_eq!(flags.len(), 2);
        assert!(flags.is_downloaded());
        assert!(Flag::DownloadedFull.is_internal());
        assert!(!Flag::Flagged.is_internal());
    }
}
