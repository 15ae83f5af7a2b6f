//! Engine readiness bridged into the async runtime.
//!
//! The preferred path registers a callback with the engine that releases a
//! [`Notify`] permit, so no extra thread is needed. Engines that cannot call
//! back get a dedicated worker thread that blocks in
//! [`Session::wait_for_alert`] and hands readiness over a channel.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender, TryRecvError};
use tokio::sync::{Notify, mpsc};

use super::AlertError;
use crate::engine::{Alert, Session};

/// Upper bound on how long the worker thread blocks per wait.
pub const MAX_THREAD_WAIT: Duration = Duration::from_secs(1);

/// How readiness is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    /// Notification callback, falling back to the worker thread.
    #[default]
    Auto,
    /// Notification callback only.
    Notify,
    /// Worker thread only.
    Thread,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::Auto => write!(f, "auto"),
            SourceMode::Notify => write!(f, "notify"),
            SourceMode::Thread => write!(f, "thread"),
        }
    }
}

impl FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(SourceMode::Auto),
            "notify" => Ok(SourceMode::Notify),
            "thread" => Ok(SourceMode::Thread),
            _ => Err(format!(
                "invalid alert source '{s}', expected auto, notify or thread"
            )),
        }
    }
}

/// Worker thread blocking in [`Session::wait_for_alert`].
///
/// Dropping the drain sender disconnects the thread's handshake channel,
/// which is its only stop signal.
struct ThreadWaiter {
    ready_rx: mpsc::Receiver<()>,
    drained_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadWaiter {
    fn spawn(session: Arc<dyn Session>, wait: Duration) -> Result<Self, AlertError> {
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (drained_tx, drained_rx) = channel::bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("undertow-alerts".to_string())
            .spawn(move || {
                loop {
                    match session.wait_for_alert(wait) {
                        Ok(false) => {
                            if let Err(TryRecvError::Disconnected) = drained_rx.try_recv() {
                                break;
                            }
                        }
                        Ok(true) => {
                            if ready_tx.blocking_send(()).is_err() {
                                break;
                            }
                            // Pending alerts keep the engine ready, so wait for
                            // the drain before waiting again
                            if drained_rx.recv().is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!("Alert wait failed: {}", e);
                            break;
                        }
                    }
                }
                tracing::debug!("Alert thread exiting");
            })
            .map_err(|e| {
                tracing::error!("Failed to spawn alert thread: {}", e);
                AlertError::SourceClosed
            })?;

        Ok(Self {
            ready_rx,
            drained_tx: Some(drained_tx),
            thread: Some(thread),
        })
    }

    fn ack(&self) {
        if let Some(drained_tx) = &self.drained_tx {
            let _ = drained_tx.send(());
        }
    }

    /// Disconnects the thread and hands back its join handle, if it was
    /// not taken yet.
    fn stop(&mut self) -> Option<JoinHandle<()>> {
        self.drained_tx = None;
        self.ready_rx.close();
        self.thread.take()
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }
}

fn join_waiter(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        tracing::error!("Alert thread panicked");
    }
}

enum Readiness {
    Notify(Arc<Notify>),
    Thread(ThreadWaiter),
}

/// Delivers every queued engine alert exactly once, in emission order.
pub struct AlertSource {
    session: Arc<dyn Session>,
    readiness: Readiness,
    closed: bool,
}

impl AlertSource {
    /// Starts observing engine readiness.
    ///
    /// `thread_wait` bounds each blocking wait of the worker thread and is
    /// clamped to [`MAX_THREAD_WAIT`].
    ///
    /// # Errors
    ///
    /// - `AlertError::Unsupported` - The engine offers no way to observe readiness in `mode`
    /// - `AlertError::Engine` - Registration failed for another reason
    pub fn open(
        session: Arc<dyn Session>,
        mode: SourceMode,
        thread_wait: Duration,
    ) -> Result<Self, AlertError> {
        let thread_wait = thread_wait.clamp(Duration::from_millis(1), MAX_THREAD_WAIT);

        let readiness = match mode {
            SourceMode::Notify => Self::register(&session)?.ok_or(AlertError::Unsupported)?,
            SourceMode::Thread => Self::start_thread(&session, thread_wait)?,
            SourceMode::Auto => match Self::register(&session)? {
                Some(readiness) => readiness,
                None => {
                    tracing::info!(
                        "Alert notification unsupported, falling back to a wait thread"
                    );
                    Self::start_thread(&session, thread_wait)?
                }
            },
        };

        Ok(Self {
            session,
            readiness,
            closed: false,
        })
    }

    /// Registers the readiness callback. `Ok(None)` means the engine cannot
    /// call back.
    fn register(session: &Arc<dyn Session>) -> Result<Option<Readiness>, AlertError> {
        let notify = Arc::new(Notify::new());
        let callback_notify = Arc::clone(&notify);
        match session.set_alert_notify(Some(Arc::new(move || callback_notify.notify_one()))) {
            Ok(()) => Ok(Some(Readiness::Notify(notify))),
            Err(e) if e.is_not_supported() => Ok(None),
            Err(e) => Err(AlertError::Engine(e)),
        }
    }

    fn start_thread(
        session: &Arc<dyn Session>,
        thread_wait: Duration,
    ) -> Result<Readiness, AlertError> {
        match session.wait_for_alert(Duration::ZERO) {
            Ok(_) => {}
            Err(e) if e.is_not_supported() => return Err(AlertError::Unsupported),
            Err(e) => return Err(AlertError::Engine(e)),
        }
        let waiter = ThreadWaiter::spawn(Arc::clone(session), thread_wait)?;
        Ok(Readiness::Thread(waiter))
    }

    pub fn mode(&self) -> SourceMode {
        match self.readiness {
            Readiness::Notify(_) => SourceMode::Notify,
            Readiness::Thread(_) => SourceMode::Thread,
        }
    }

    /// Waits until at least one alert is queued, then drains the queue.
    ///
    /// The returned batch is never empty. Cancelling the future before it
    /// completes leaves the engine queue untouched.
    ///
    /// # Errors
    ///
    /// - `AlertError::SourceClosed` - The source was closed or its thread died
    /// - `AlertError::Engine` - Popping alerts failed
    pub async fn wait_and_drain(&mut self) -> Result<Vec<Alert>, AlertError> {
        if self.closed {
            return Err(AlertError::SourceClosed);
        }
        loop {
            match &mut self.readiness {
                Readiness::Notify(notify) => {
                    notify.notified().await;
                    let alerts = self.session.pop_alerts()?;
                    if !alerts.is_empty() {
                        return Ok(alerts);
                    }
                }
                Readiness::Thread(waiter) => {
                    waiter
                        .ready_rx
                        .recv()
                        .await
                        .ok_or(AlertError::SourceClosed)?;
                    let alerts = self.session.pop_alerts();
                    waiter.ack();
                    let alerts = alerts?;
                    if !alerts.is_empty() {
                        return Ok(alerts);
                    }
                }
            }
        }
    }

    /// Stops observing readiness. Safe to call more than once.
    ///
    /// A worker thread is joined before returning, which blocks for at most
    /// one thread wait. Async callers should prefer [`shutdown`](Self::shutdown).
    pub fn close(&mut self) {
        if let Some(thread) = self.stop() {
            join_waiter(thread);
        }
    }

    /// Like [`close`](Self::close), but joins the worker thread on the
    /// blocking pool.
    pub async fn shutdown(&mut self) {
        let Some(thread) = self.stop() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || join_waiter(thread)).await {
            tracing::warn!("Joining alert thread did not finish: {}", e);
        }
    }

    /// Whether a worker thread is still alive.
    pub fn has_running_thread(&self) -> bool {
        match &self.readiness {
            Readiness::Notify(_) => false,
            Readiness::Thread(waiter) => waiter.is_running(),
        }
    }

    fn stop(&mut self) -> Option<JoinHandle<()>> {
        if self.closed {
            return None;
        }
        self.closed = true;
        match &mut self.readiness {
            Readiness::Notify(_) => {
                if let Err(e) = self.session.set_alert_notify(None) {
                    tracing::debug!("Failed to clear alert notification: {}", e);
                }
                None
            }
            Readiness::Thread(waiter) => waiter.stop(),
        }
    }
}

impl Drop for AlertSource {
    fn drop(&mut self) {
        self.close();
    }
}
