//! Session-to-supervisor status reporting.
//!
//! Each conversation task holds a [`StatusSender`] and reports its own end;
//! the supervisor's central loop reacts by marking the tenant idle and
//! rebinding its sockets. This replaces child reaping: a session that
//! returns, for whatever reason, always reports before its task finishes.

/// The kind of event being reported to the supervisor.
#[derive(Debug)]
pub enum State {
    /// The conversation for this tenant is over and its sockets are gone.
    SessionEnded { port2: u16 },
    /// Informational only.
    Healthy(String),
}

/// Wraps a status update, passed through the supervisor's status channel.
#[derive(Debug)]
pub struct Status {
    pub state: State,
}

/// Cloneable handle for reporting status from spawned tasks.
#[derive(Clone, Debug)]
pub struct StatusSender {
    inner: async_channel::Sender<Status>,
}

impl StatusSender {
    pub fn new(inner: async_channel::Sender<Status>) -> Self {
        Self { inner }
    }

    /// Best-effort send: a closed channel means the supervisor is already
    /// shutting down, which no sender needs to handle.
    pub async fn send(&self, state: State) {
        let _ = self.inner.send(Status { state }).await;
    }
}
