use anyhow::Context as _;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;

/// An async OS signal, queued for synchronous handling by the event loop.
/// No work happens in signal context: the runtime's handler only marks the
/// signal pending, and the stream below forwards one event per delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGTERM / SIGINT / SIGQUIT: begin shutdown.
    Shutdown(&'static str),
    /// SIGHUP: reload the configuration.
    Reload,
    /// SIGUSR2: rotate the activity log and every child log.
    Rotate,
    /// SIGCHLD: one or more children are reapable.
    Child,
}

/// Install handlers for the signals the daemon accepts and funnel them
/// into a single queue. Everything else keeps its default disposition.
pub fn spawn_listener() -> anyhow::Result<mpsc::UnboundedReceiver<SignalEvent>> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut term = unix_signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut quit = unix_signal(SignalKind::quit()).context("SIGQUIT handler")?;
    let mut hup = unix_signal(SignalKind::hangup()).context("SIGHUP handler")?;
    let mut usr2 = unix_signal(SignalKind::user_defined2()).context("SIGUSR2 handler")?;
    let mut child = unix_signal(SignalKind::child()).context("SIGCHLD handler")?;

    tokio::spawn(async move {
        loop {
            let ev = tokio::select! {
                _ = term.recv() => SignalEvent::Shutdown("SIGTERM"),
                _ = int.recv() => SignalEvent::Shutdown("SIGINT"),
                _ = quit.recv() => SignalEvent::Shutdown("SIGQUIT"),
                _ = hup.recv() => SignalEvent::Reload,
                _ = usr2.recv() => SignalEvent::Rotate,
                _ = child.recv() => SignalEvent::Child,
            };
            if tx.send(ev).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}
