//! Tracking for spawned tasks.
//!
//! The supervisor spawns one task per live conversation plus a handful of
//! short-lived store writers; on shutdown they are all aborted by name so the
//! log shows what was still running.

use std::sync::Mutex as StdMutex;

use tokio::task::JoinHandle;
use tracing::warn;

pub struct TaskManager {
    tasks: StdMutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Spawn a task under a name used in shutdown logging.
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock().unwrap();
        // drop bookkeeping for tasks that already finished
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((name.into(), handle));
    }

    /// Abort everything still running, most recently spawned first.
    pub fn abort_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        while let Some((name, handle)) = tasks.pop() {
            if !handle.is_finished() {
                warn!("Killed task: {name}");
            }
            handle.abort();
        }
    }
}
