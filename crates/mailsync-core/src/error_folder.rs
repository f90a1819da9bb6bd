//! Failure reports stored as messages in a local-only folder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use mailsync_store::{Address, Message, uid};
use tracing::{debug, warn};

use crate::account::Account;
use crate::error::Result;

/// Writes failure reports into each account's error folder.
///
/// Writing is best effort. A failure while writing a report is logged and
/// never reported again, and a report raised while another is being
/// written is dropped.
#[derive(Debug)]
pub struct ErrorFolder {
    enabled: bool,
    retention: Duration,
    busy: AtomicBool,
}

impl ErrorFolder {
    /// Creates a writer. Reports older than `retention` are purged on write.
    #[must_use]
    pub const fn new(enabled: bool, retention: Duration) -> Self {
        Self {
            enabled,
            retention,
            busy: AtomicBool::new(false),
        }
    }

    /// Records a failure for `account`.
    pub fn add(&self, account: &Account, subject: &str, detail: &str) {
        if !self.enabled {
            return;
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!(account = %account.id(), subject, "Error report already in progress, dropping");
            return;
        }
        if let Err(err) = self.write(account, subject, detail) {
            warn!(account = %account.id(), error = %err, "Could not write error report");
        }
        self.busy.store(false, Ordering::SeqCst);
    }

    fn write(&self, account: &Account, subject: &str, detail: &str) -> Result<()> {
        let folder = account.local_folder(&account.config().error_folder)?;
        if !folder.exists()? {
            folder.create()?;
        }

        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention));
        for message in folder.messages()? {
            if message.is_older_than(cutoff) {
                folder.destroy(&message.uid)?;
            }
        }

        let mut report = Message::new(uid::new_local());
        report.internal_date = Some(now);
        report.subject = Some(subject.to_string());
        report.from = vec![Address::named("mailsync", "mailsync@localhost")];
        report.body = Some(detail.to_string());
        report.size = detail.len() as u64;
        folder.store(&report)?;
        Ok(())
    }
}
