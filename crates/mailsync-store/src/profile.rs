//! Fetch profiles.

/// One item a fetch can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchItem {
    /// Message flags.
    Flags,
    /// Subject, addresses, dates, size and message-id.
    Envelope,
    /// MIME structure without part contents.
    Structure,
    /// The complete body.
    Body,
    /// A truncated body, bounded by the backend's sane-size limit.
    BodySane,
}

/// The set of items a fetch should populate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchProfile {
    items: Vec<FetchItem>,
}

impl FetchProfile {
    /// Creates an empty profile.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the profile with an item added.
    #[must_use]
    pub fn with(mut self, item: FetchItem) -> Self {
        if !self.items.contains(&item) {
            self.items.push(item);
        }
        self
    }

    /// Returns true if the item is requested.
    #[must_use]
    pub fn contains(&self, item: FetchItem) -> bool {
        self.items.contains(&item)
    }

    /// Returns true if no items are requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<FetchItem> for FetchProfile {
    fn from(item: FetchItem) -> Self {
        Self::new().with(item)
    }
}
