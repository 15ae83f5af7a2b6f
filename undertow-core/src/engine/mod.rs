//! Boundary to the native torrent engine.
//!
//! The engine runs its own threads and is only reachable through the
//! synchronous [`Session`] surface. Everything in this crate that talks to
//! the engine goes through this trait, so a real binding and the in-memory
//! [`SimulatedSession`] are interchangeable.

pub mod alert;
pub mod error;
pub mod sim;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use alert::{Alert, AlertCategory, AlertKind, TorrentState};
pub use error::{ErrorCategory, EngineError};
pub use sim::SimulatedSession;

/// Generation-checked identity of one torrent inside the engine.
///
/// Slots are reused after removal, generations are not, so a stale handle
/// never aliases a newer torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentHandle {
    slot: u32,
    generation: u32,
}

impl TorrentHandle {
    pub fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn slot(self) -> u32 {
        self.slot
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TorrentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Signed like the engine's own piece index type. Negative values are never
/// valid and are rejected as out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub i32);

impl PieceIndex {
    pub fn new(index: i32) -> Self {
        Self(index)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Position in a piece bitmap, or `None` for negative indices.
    pub fn as_usize(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for PieceIndex {
    fn from(index: i32) -> Self {
        Self(index)
    }
}

/// Flags for [`Session::set_piece_deadline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeadlineFlags {
    /// Post a [`Alert::ReadPiece`] with the piece data once it is available.
    pub alert_when_available: bool,
}

impl DeadlineFlags {
    pub const ALERT_WHEN_AVAILABLE: Self = Self {
        alert_when_available: true,
    };
}

/// Optional parts of a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    /// Fill in [`TorrentStatus::pieces`].
    pub query_pieces: bool,
}

impl StatusFlags {
    pub const QUERY_PIECES: Self = Self { query_pieces: true };
}

/// Snapshot of a torrent's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentStatus {
    pub state: TorrentState,
    /// One entry per piece, `true` when the piece is available. Empty until
    /// the piece count is known and the initial check has finished.
    pub pieces: Vec<bool>,
}

/// Callback the engine invokes when its alert queue becomes non-empty.
///
/// Called from engine-owned threads. Must not block.
pub type AlertNotify = Arc<dyn Fn() + Send + Sync>;

/// Synchronous surface of the native engine.
///
/// Methods documented as blocking must be offloaded with
/// `tokio::task::spawn_blocking` by async callers. Every per-handle method
/// fails with [`EngineError::invalid_handle`] once the handle is no longer
/// tracked.
pub trait Session: Send + Sync + 'static {
    /// Registers (or with `None`, clears) the readiness callback.
    ///
    /// If alerts are already queued the callback fires during registration.
    ///
    /// # Errors
    ///
    /// - `EngineError::not_supported` - The platform cannot deliver readiness notifications
    fn set_alert_notify(&self, notify: Option<AlertNotify>) -> Result<(), EngineError>;

    /// Blocks for at most `max_wait` until an alert is queued. Does not
    /// consume alerts.
    ///
    /// # Errors
    ///
    /// - `EngineError::not_supported` - No blocking wait is available either
    fn wait_for_alert(&self, max_wait: Duration) -> Result<bool, EngineError>;

    /// Takes every currently queued alert, in emission order. Never blocks.
    fn pop_alerts(&self) -> Result<Vec<Alert>, EngineError>;

    /// Currently applied category mask.
    fn alert_mask(&self) -> AlertCategory;

    /// Replaces the applied category mask. Never fails.
    fn apply_alert_mask(&self, mask: AlertCategory);

    /// Whether the handle is still tracked. Blocking.
    fn is_tracked(&self, handle: TorrentHandle) -> Result<bool, EngineError>;

    /// Queries the torrent's status. Blocking.
    fn status(&self, handle: TorrentHandle, flags: StatusFlags)
    -> Result<TorrentStatus, EngineError>;

    /// Asks the engine to fetch `piece` within `deadline`.
    fn set_piece_deadline(
        &self,
        handle: TorrentHandle,
        piece: PieceIndex,
        deadline: Duration,
        flags: DeadlineFlags,
    ) -> Result<(), EngineError>;

    /// Clears any deadline on `piece`.
    fn reset_piece_deadline(&self, handle: TorrentHandle, piece: PieceIndex)
    -> Result<(), EngineError>;
}
