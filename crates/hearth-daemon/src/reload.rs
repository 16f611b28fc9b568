//! Process signals that drive the session loop.

use std::io;

/// What the session loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Shut the session down and bring a fresh one up.
    Reload,
    /// Shut the session down and exit.
    Shutdown,
}

/// `SIGHUP` reloads; `SIGINT` and `SIGTERM` shut down.
#[cfg(unix)]
pub(crate) struct Signals {
    hangup: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    /// Register the handlers. Must run inside the runtime.
    pub(crate) fn install() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next control signal.
    pub(crate) async fn next(&mut self) -> Control {
        tokio::select! {
            _ = self.hangup.recv() => Control::Reload,
            _ = self.terminate.recv() => Control::Shutdown,
            _ = tokio::signal::ctrl_c() => Control::Shutdown,
        }
    }
}

/// Only Ctrl+C is available; there is no reload signal.
#[cfg(not(unix))]
pub(crate) struct Signals;

#[cfg(not(unix))]
impl Signals {
    pub(crate) fn install() -> io::Result<Self> {
        Ok(Self)
    }

    pub(crate) async fn next(&mut self) -> Control {
        let _ = tokio::signal::ctrl_c().await;
        Control::Shutdown
    }
}
