use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::watch;

/// Shutdown request broadcast by the [`Controller`] to subscribed services.
///
/// A receiver has to ensure that it does not take longer than `timeout` to wind
/// down. Ideally, open work is finished in an orderly manner but no new requests
/// are accepted anymore. After the timeout the runtime stops regardless of what
/// receivers do.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

type ShutdownChannel = (
    watch::Sender<Option<Shutdown>>,
    watch::Receiver<Option<Shutdown>>,
);

/// Global [`ShutdownChannel`] for all services.
static SHUTDOWN: OnceCell<ShutdownChannel> = OnceCell::new();

fn shutdown_channel() -> &'static ShutdownChannel {
    SHUTDOWN.get_or_init(|| watch::channel(None))
}

/// Notifies a service about an upcoming shutdown.
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Wait for a shutdown.
    ///
    /// This method is cancellation safe and can be used in `select!`.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = &*self.0.borrow_and_update() {
                return shutdown.clone();
            }

            if self.0.changed().await.is_err() {
                return Shutdown { timeout: None };
            }
        }
    }
}

/// Coordinates graceful shutdown of the system runtime.
///
/// [`Controller::start`] spawns a task that listens for termination signals.
/// Services obtain a [`ShutdownHandle`] and receive a [`Shutdown`] message when a
/// signal arrives or [`Controller::trigger_shutdown`] is invoked, for instance
/// through the `/quitquitquit` admin endpoint.
///
/// `SIGTERM` requests a graceful shutdown with the configured timeout, while
/// `SIGINT` and `SIGQUIT` force an immediate stop. A second signal during a
/// graceful shutdown upgrades it to an immediate one.
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts a controller that monitors shutdown signals.
    pub fn start(shutdown_timeout: Duration) {
        tokio::spawn(monitor_shutdown(shutdown_timeout));
    }

    /// Initiates the shutdown process of the system.
    pub fn trigger_shutdown(timeout: Option<Duration>) {
        let (tx, _) = shutdown_channel();
        tx.send(Some(Shutdown { timeout })).ok();
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        let (_, rx) = shutdown_channel();
        ShutdownHandle(rx.clone())
    }

    /// Waits for the shutdown and its timeout to elapse.
    ///
    /// This resolves after the first shutdown signal plus its graceful timeout,
    /// or immediately if another signal upgrades the shutdown in the meantime.
    pub async fn shutdown() {
        let mut handle = Controller::shutdown_handle();
        let shutdown = handle.notified().await;

        if let Some(timeout) = shutdown.timeout {
            let mut immediate = Controller::shutdown_handle();
            tokio::select! {
                shutdown = immediate.notified() => {
                    if shutdown.timeout.is_none() {
                        return;
                    }
                    tokio::time::sleep(timeout).await;
                },
                _ = tokio::time::sleep(timeout) => (),
            }
        }
    }
}

#[cfg(unix)]
async fn monitor_shutdown(timeout: Duration) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_quit = signal(SignalKind::quit())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    loop {
        let timeout = tokio::select! {
            biased;

            Some(()) = sig_int.recv() => {
                tally_log::info!("SIGINT received, exiting");
                None
            }
            Some(()) = sig_quit.recv() => {
                tally_log::info!("SIGQUIT received, exiting");
                None
            }
            Some(()) = sig_term.recv() => {
                tally_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
                Some(timeout)
            }

            else => break,
        };

        Controller::trigger_shutdown(timeout);
    }

    Ok(())
}

#[cfg(not(unix))]
async fn monitor_shutdown(_timeout: Duration) -> std::io::Result<()> {
    let mut ctrl_c = tokio::signal::windows::ctrl_c()?;

    while ctrl_c.recv().await.is_some() {
        tally_log::info!("CTRL-C received, exiting");
        Controller::trigger_shutdown(None);
    }

    Ok(())
}
