//! Refcounted deadline table for one torrent.
//!
//! A piece carries an engine deadline exactly while at least one scope
//! wants it. The refcount update and the matching engine call happen under
//! one lock, so concurrent scopes cannot interleave a set with a reset.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::SchedulerError;
use crate::engine::{DeadlineFlags, PieceIndex, Session, TorrentHandle};

pub struct PieceWindow {
    session: Arc<dyn Session>,
    handle: TorrentHandle,
    deadline: Duration,
    refcounts: Mutex<HashMap<PieceIndex, usize>>,
}

impl PieceWindow {
    pub fn new(session: Arc<dyn Session>, handle: TorrentHandle, deadline: Duration) -> Self {
        Self {
            session,
            handle,
            deadline,
            refcounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self) -> TorrentHandle {
        self.handle
    }

    pub fn refcount(&self, piece: PieceIndex) -> usize {
        self.refcounts.lock().get(&piece).copied().unwrap_or(0)
    }

    /// Pieces with a nonzero refcount, in index order.
    pub fn wanted(&self) -> Vec<PieceIndex> {
        let mut wanted: Vec<_> = self.refcounts.lock().keys().copied().collect();
        wanted.sort();
        wanted
    }

    /// Moves one scope from wanting `old` to wanting `new`.
    ///
    /// Pieces entering the set get a deadline when their count leaves zero;
    /// a piece some other scope already wants is re-armed so this scope
    /// still gets its read notification. Pieces leaving the set lose their
    /// deadline when their count reaches zero.
    ///
    /// Refcounts are always updated in full. The first engine failure is
    /// returned after the remaining pieces have been processed.
    pub fn delta(
        &self,
        old: &BTreeSet<PieceIndex>,
        new: &BTreeSet<PieceIndex>,
    ) -> Result<(), SchedulerError> {
        let mut first_error = None;
        let mut refcounts = self.refcounts.lock();

        for &piece in new.difference(old) {
            let count = refcounts.entry(piece).or_insert(0);
            *count += 1;
            let result = self.session.set_piece_deadline(
                self.handle,
                piece,
                self.deadline,
                DeadlineFlags::ALERT_WHEN_AVAILABLE,
            );
            if let Err(e) = result {
                tracing::debug!("Failed to set deadline on {} piece {}: {}", self.handle, piece, e);
                first_error.get_or_insert(SchedulerError::from(e));
            }
        }

        for &piece in old.difference(new) {
            let Some(count) = refcounts.get_mut(&piece) else {
                tracing::warn!("Piece {} released without being wanted", piece);
                continue;
            };
            *count -= 1;
            if *count > 0 {
                continue;
            }
            refcounts.remove(&piece);
            if let Err(e) = self.session.reset_piece_deadline(self.handle, piece) {
                tracing::debug!("Failed to reset deadline on {} piece {}: {}", self.handle, piece, e);
                first_error.get_or_insert(SchedulerError::from(e));
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Drops one scope's claim on `pieces` without touching the engine.
    ///
    /// Used once the handle is known to be invalid, where engine calls can
    /// only fail.
    pub fn discard(&self, pieces: &BTreeSet<PieceIndex>) {
        let mut refcounts = self.refcounts.lock();
        for piece in pieces {
            if let Some(count) = refcounts.get_mut(piece) {
                *count -= 1;
                if *count == 0 {
                    refcounts.remove(piece);
                }
            }
        }
    }
}

impl std::fmt::Debug for PieceWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceWindow")
            .field("handle", &self.handle)
            .field("wanted", &self.wanted())
            .finish()
    }
}
