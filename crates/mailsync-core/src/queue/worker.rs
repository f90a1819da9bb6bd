//! The worker thread draining the command queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::{Command, CommandQueue};
use crate::error::Result;
use crate::event::Event;
use crate::listener::ListenerSet;

/// Name of the worker thread.
pub(crate) const WORKER_THREAD: &str = "mailsync-worker";

/// Returns true when called from a worker thread.
pub(crate) fn on_worker_thread() -> bool {
    std::thread::current().name() == Some(WORKER_THREAD)
}

/// Owns the single thread that executes queued commands.
#[derive(Debug)]
pub struct Worker {
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Starts the worker thread.
    ///
    /// Commands failing with unavailable storage are put back after
    /// `retry_delay` using a timer on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(
        queue: Arc<CommandQueue>,
        listeners: Arc<ListenerSet>,
        runtime: Handle,
        retry_delay: Duration,
    ) -> Result<Self> {
        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD.to_string())
            .spawn(move || run(&queue, &listeners, &runtime, retry_delay))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Waits for the thread to exit. The queue must be closed first.
    ///
    /// Called from the worker thread itself (a listener stopping the
    /// controller), this detaches instead of deadlocking.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                debug!("Worker asked to join itself, detaching");
                return;
            }
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

fn run(queue: &Arc<CommandQueue>, listeners: &ListenerSet, runtime: &Handle, retry_delay: Duration) {
    info!("Worker started");
    while let Some(command) = queue.take() {
        debug!(
            command = %command.description,
            sequence = command.sequence,
            "Running command"
        );
        execute(queue, runtime, retry_delay, &command);

        let more_work = !queue.is_empty();
        listeners.emit(
            command.listener.as_deref(),
            Event::CommandCompleted { more_work },
        );
    }
    info!("Worker stopped");
}

fn execute(queue: &Arc<CommandQueue>, runtime: &Handle, retry_delay: Duration, command: &Command) {
    let work = Arc::clone(&command.work);
    match panic::catch_unwind(AssertUnwindSafe(|| work())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_storage_unavailable() => {
            warn!(
                command = %command.description,
                delay = ?retry_delay,
                "Storage unavailable, rescheduling command"
            );
            let queue = Arc::clone(queue);
            let command = command.clone();
            runtime.spawn(async move {
                tokio::time::sleep(retry_delay).await;
                queue.put(command);
            });
        }
        Ok(Err(err)) => {
            error!(command = %command.description, error = %err, "Command failed");
        }
        Err(_) => {
            error!(command = %command.description, "Command panicked");
        }
    }
}
