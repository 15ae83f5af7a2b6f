//! Piece scheduling for concurrent readers.
//!
//! Two strategies coexist. [`read_pieces`](PieceScheduler::read_pieces) sets
//! engine deadlines through a shared [`PieceWindow`] and receives piece data
//! as alerts. [`wait_pieces`](PieceScheduler::wait_pieces) polls the piece
//! bitmap and needs neither deadlines nor the alert driver.

pub mod read;
pub mod wait;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub use read::{PieceData, ReadScope};
pub use wait::WaitScope;
pub use window::PieceWindow;

use crate::alerts::{AlertDriver, AlertError};
use crate::config::SchedulerConfig;
use crate::engine::{EngineError, PieceIndex, Session, TorrentHandle};

/// Errors surfaced to piece readers and waiters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Torrent handle is no longer valid")]
    HandleInvalid,

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Piece {piece} is out of range")]
    OutOfRange { piece: PieceIndex },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Alert delivery failed: {0}")]
    Alert(AlertError),
}

impl From<EngineError> for SchedulerError {
    fn from(error: EngineError) -> Self {
        if error.is_invalid_handle() {
            SchedulerError::HandleInvalid
        } else {
            SchedulerError::Engine(error)
        }
    }
}

impl From<AlertError> for SchedulerError {
    fn from(error: AlertError) -> Self {
        match error {
            AlertError::HandleInvalid => SchedulerError::HandleInvalid,
            AlertError::Engine(e) => SchedulerError::from(e),
            other => SchedulerError::Alert(other),
        }
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_panic() {
            std::panic::resume_unwind(error.into_panic());
        }
        SchedulerError::Cancelled
    }
}

/// Handle to window map shared by the scheduler and its read scopes.
#[derive(Default)]
pub(crate) struct WindowRegistry {
    windows: Mutex<HashMap<TorrentHandle, Arc<PieceWindow>>>,
}

impl WindowRegistry {
    fn get_or_create(
        &self,
        handle: TorrentHandle,
        create: impl FnOnce() -> PieceWindow,
    ) -> Arc<PieceWindow> {
        let mut windows = self.windows.lock();
        Arc::clone(windows.entry(handle).or_insert_with(|| Arc::new(create())))
    }

    pub(crate) fn forget(&self, handle: TorrentHandle) -> bool {
        let removed = self.windows.lock().remove(&handle).is_some();
        if removed {
            tracing::debug!("Forgot piece window for {}", handle);
        }
        removed
    }

    fn len(&self) -> usize {
        self.windows.lock().len()
    }
}

/// Per-handle piece windows plus the two read strategies.
pub struct PieceScheduler {
    driver: AlertDriver,
    session: Arc<dyn Session>,
    config: SchedulerConfig,
    windows: Arc<WindowRegistry>,
}

impl PieceScheduler {
    pub fn new(driver: AlertDriver, config: SchedulerConfig) -> Self {
        let session = Arc::clone(driver.service().session());
        Self {
            driver,
            session,
            config,
            windows: Arc::new(WindowRegistry::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Shared deadline window for `handle`, created on first use.
    pub fn window(&self, handle: TorrentHandle) -> Arc<PieceWindow> {
        self.windows.get_or_create(handle, || {
            PieceWindow::new(
                Arc::clone(&self.session),
                handle,
                self.config.piece_deadline,
            )
        })
    }

    /// Drops the window of a removed torrent. Scopes still reading keep
    /// their own reference until they end.
    ///
    /// A read that finds its handle invalid forgets the window too, so a
    /// read started after removal does not leave an entry behind.
    pub fn forget(&self, handle: TorrentHandle) -> bool {
        self.windows.forget(handle)
    }

    /// Number of handles with a live window.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Reads `pieces` in the given order with minimum-latency deadlines.
    ///
    /// Must be called within a Tokio runtime.
    pub fn read_pieces(
        &self,
        handle: TorrentHandle,
        pieces: impl IntoIterator<Item = PieceIndex>,
    ) -> ReadScope {
        ReadScope::new(
            &self.driver,
            Arc::clone(&self.windows),
            self.window(handle),
            pieces.into_iter().collect(),
            self.config.read_window,
        )
    }

    /// Waits for `pieces` to become available, polling every
    /// `poll_interval`.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::OutOfRange` - A piece is negative or past the known piece count
    /// - `SchedulerError::HandleInvalid` - The torrent is not tracked
    /// - `SchedulerError::Engine` - The first status query failed
    pub async fn wait_pieces(
        &self,
        handle: TorrentHandle,
        pieces: impl IntoIterator<Item = PieceIndex>,
        poll_interval: Duration,
    ) -> Result<WaitScope, SchedulerError> {
        WaitScope::start(
            Arc::clone(&self.session),
            handle,
            pieces.into_iter().collect(),
            poll_interval,
        )
        .await
    }
}
