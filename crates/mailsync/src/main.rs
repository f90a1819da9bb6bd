//! `mailsync` - runs one mail check against in-memory backends
//!
//! Every controller event is printed to stdout as one JSON line.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use mailsync_core::{
    Account, AccountConfig, AccountId, Controller, ControllerConfig, Event, Listener, TracingSink,
};
use mailsync_store::memory::{MemoryLocalStore, MemoryStore, MemoryTransport};
use mailsync_store::{Address, Capabilities, Message};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for the mail check to finish.
const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings read from `settings.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    controller: ControllerConfig,
    accounts: Vec<AccountConfig>,
    /// Messages placed in each account's server inbox before the check.
    seed_messages: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            accounts: vec![AccountConfig::new(AccountId(1), "demo@example.com")],
            seed_messages: 5,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailsync=debug,mailsync_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting mailsync");

    let settings = load_settings()?;
    let controller = Controller::new(settings.controller.clone(), Arc::new(TracingSink))
        .context("failed to start controller")?;
    controller.add_listener(Arc::new(|event: &Event| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(error = %err, "Could not serialize event"),
        }
    }));

    for config in settings.accounts {
        let remote = seeded_store(&config, settings.seed_messages);
        let account = controller.add_account(Account::new(
            config,
            Arc::new(MemoryLocalStore::new()),
            Arc::new(remote),
            Arc::new(MemoryTransport::new()),
        ));
        info!(account = %account.id(), email = %account.config().email, "Account added");
    }

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(Some(tx));
    let finished: Arc<dyn Listener> = Arc::new(move |event: &Event| {
        if matches!(event, Event::CheckMailFinished { .. })
            && let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take()
        {
            let _ = tx.send(());
        }
    });
    controller.check_mail(None, true, Some(finished))?;
    rx.recv_timeout(CHECK_TIMEOUT)
        .context("mail check did not finish in time")?;

    for account in controller.accounts() {
        match controller.setup_pushing(account.id()) {
            Ok(started) => info!(account = %account.id(), started, "Push setup"),
            Err(err) => warn!(account = %account.id(), error = %err, "Push setup failed"),
        }
    }

    controller.stop();
    info!("Stopped");
    Ok(())
}

/// Loads settings, falling back to defaults when the file is missing.
fn load_settings() -> Result<Settings> {
    let settings_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailsync")
        .join("settings.json");

    if !settings_path.exists() {
        return Ok(Settings::default());
    }

    let contents = std::fs::read_to_string(&settings_path)
        .with_context(|| format!("failed to read {}", settings_path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", settings_path.display()))
}

/// Builds a server with the account's special folders and some unread mail.
fn seeded_store(config: &AccountConfig, count: usize) -> MemoryStore {
    let store = MemoryStore::with_capabilities(Capabilities {
        push: true,
        ..Capabilities::default()
    });
    store.add_folder(&config.inbox_folder);
    for folder in [&config.sent_folder, &config.trash_folder, &config.drafts_folder]
        .into_iter()
        .flatten()
    {
        store.add_folder(folder);
    }

    let now = Utc::now();
    for n in 1..=count {
        let mut message = Message::new(n.to_string());
        message.subject = Some(format!("Welcome message {n}"));
        message.from = vec![Address::named("Mailsync", "hello@mailsync.invalid")];
        message.to = vec![Address::new(config.email.clone())];
        message.body = Some(format!("This is seeded message number {n}."));
        message.size = 256;
        message.internal_date = Some(now);
        store.insert(&config.inbox_folder, message);
    }
    store
}
