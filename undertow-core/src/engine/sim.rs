//! In-memory engine for tests and demos.
//!
//! Behaves like the native engine where this crate depends on it:
//! mask-filtered alert queue, readiness callback on the empty-to-non-empty
//! transition, slot reuse with bumped generations, and `ReadPiece` alerts for
//! pieces armed with `ALERT_WHEN_AVAILABLE`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::{
    Alert, AlertCategory, AlertNotify, DeadlineFlags, EngineError, ErrorCategory, PieceIndex,
    Session, StatusFlags, TorrentHandle, TorrentState, TorrentStatus,
};

const EINVAL: i32 = 22;

struct SimTorrent {
    name: String,
    pieces: Vec<Bytes>,
    have: Vec<bool>,
    state: TorrentState,
    deadlines: BTreeMap<PieceIndex, Duration>,
    read_requests: BTreeSet<PieceIndex>,
}

impl SimTorrent {
    fn piece_slot(&self, piece: PieceIndex) -> Result<usize, EngineError> {
        piece
            .as_usize()
            .filter(|&index| index < self.pieces.len())
            .ok_or_else(|| EngineError {
                category: ErrorCategory::Generic,
                code: EINVAL,
                message: format!("invalid piece index {piece}"),
            })
    }

    fn pieces_known(&self) -> bool {
        !matches!(
            self.state,
            TorrentState::CheckingFiles
                | TorrentState::DownloadingMetadata
                | TorrentState::CheckingResumeData
        )
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    torrent: Option<SimTorrent>,
}

#[derive(Default)]
struct SimState {
    slots: Vec<Slot>,
    alerts: VecDeque<Alert>,
    mask: AlertCategory,
}

impl SimState {
    fn torrent(&self, handle: TorrentHandle) -> Result<&SimTorrent, EngineError> {
        self.slots
            .get(handle.slot() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.torrent.as_ref())
            .ok_or_else(EngineError::invalid_handle)
    }

    fn torrent_mut(&mut self, handle: TorrentHandle) -> Result<&mut SimTorrent, EngineError> {
        self.slots
            .get_mut(handle.slot() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.torrent.as_mut())
            .ok_or_else(EngineError::invalid_handle)
    }

    /// Queues `alert` if its category is enabled. Returns true when the queue
    /// went from empty to non-empty.
    fn post(&mut self, alert: Alert) -> bool {
        if !self.mask.intersects(alert.category()) {
            return false;
        }
        let was_empty = self.alerts.is_empty();
        self.alerts.push_back(alert);
        was_empty
    }
}

/// Simulated engine session.
pub struct SimulatedSession {
    state: Mutex<SimState>,
    alert_ready: Condvar,
    notify: Mutex<Option<AlertNotify>>,
    notify_supported: bool,
    wait_supported: bool,
    status_queries: AtomicUsize,
}

impl Default for SimulatedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSession {
    /// Creates an empty session with every alert category disabled.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            alert_ready: Condvar::new(),
            notify: Mutex::new(None),
            notify_supported: true,
            wait_supported: true,
            status_queries: AtomicUsize::new(0),
        }
    }

    /// Controls whether [`Session::set_alert_notify`] is available.
    pub fn with_notify_support(mut self, supported: bool) -> Self {
        self.notify_supported = supported;
        self
    }

    /// Controls whether [`Session::wait_for_alert`] is available.
    pub fn with_wait_support(mut self, supported: bool) -> Self {
        self.wait_supported = supported;
        self
    }

    /// Adds a torrent whose piece data is `pieces`, none of it downloaded yet.
    pub fn add_torrent(&self, name: &str, pieces: Vec<Bytes>) -> TorrentHandle {
        self.insert_torrent(name, pieces, TorrentState::Downloading)
    }

    /// Adds a torrent that stays in the checking state, with an unknown piece
    /// bitmap, until [`finish_checking`](Self::finish_checking).
    pub fn add_torrent_checking(&self, name: &str, pieces: Vec<Bytes>) -> TorrentHandle {
        self.insert_torrent(name, pieces, TorrentState::CheckingFiles)
    }

    fn insert_torrent(&self, name: &str, pieces: Vec<Bytes>, state: TorrentState) -> TorrentHandle {
        let piece_count = pieces.len();
        let torrent = SimTorrent {
            name: name.to_string(),
            pieces,
            have: vec![false; piece_count],
            state,
            deadlines: BTreeMap::new(),
            read_requests: BTreeSet::new(),
        };

        let mut state = self.state.lock();
        let slot = match state.slots.iter().position(|slot| slot.torrent.is_none()) {
            Some(slot) => slot,
            None => {
                state.slots.push(Slot::default());
                state.slots.len() - 1
            }
        };
        let entry = &mut state.slots[slot];
        entry.generation += 1;
        entry.torrent = Some(torrent);
        let handle = TorrentHandle::new(slot as u32, entry.generation);

        let mut became_ready = state.post(Alert::AddTorrent {
            handle: Some(handle),
            name: name.to_string(),
            error: None,
        });
        became_ready |= state.post(Alert::TorrentAdded {
            handle,
            name: name.to_string(),
        });
        drop(state);
        self.signal(became_ready);
        handle
    }

    /// Completes the initial check, making the piece bitmap known.
    pub fn finish_checking(&self, handle: TorrentHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let torrent = state.torrent_mut(handle)?;
        let previous = torrent.state;
        torrent.state = TorrentState::Downloading;
        let name = torrent.name.clone();
        let mut became_ready = state.post(Alert::StateChanged {
            handle,
            name: name.clone(),
            previous,
            state: TorrentState::Downloading,
        });
        became_ready |= state.post(Alert::TorrentChecked { handle, name });
        drop(state);
        self.signal(became_ready);
        Ok(())
    }

    /// Removes a torrent. Its handle becomes invalid immediately.
    pub fn remove_torrent(&self, handle: TorrentHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.torrent(handle)?;
        let torrent = state.slots[handle.slot() as usize]
            .torrent
            .take()
            .ok_or_else(EngineError::invalid_handle)?;
        let became_ready = state.post(Alert::TorrentRemoved {
            handle,
            name: torrent.name,
        });
        drop(state);
        self.signal(became_ready);
        Ok(())
    }

    /// Marks a piece as downloaded and verified.
    pub fn feed_piece(&self, handle: TorrentHandle, piece: PieceIndex) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let torrent = state.torrent_mut(handle)?;
        let index = torrent.piece_slot(piece)?;
        torrent.have[index] = true;
        let name = torrent.name.clone();
        let read = torrent
            .read_requests
            .remove(&piece)
            .then(|| torrent.pieces[index].clone());
        let finished = torrent.have.iter().all(|&have| have);
        let previous = torrent.state;
        if finished {
            torrent.state = TorrentState::Finished;
        }

        let mut became_ready = state.post(Alert::PieceFinished {
            handle,
            name: name.clone(),
            piece,
        });
        if let Some(data) = read {
            became_ready |= state.post(Alert::ReadPiece {
                handle,
                name: name.clone(),
                piece,
                data,
                error: None,
            });
        }
        if finished && previous != TorrentState::Finished {
            became_ready |= state.post(Alert::StateChanged {
                handle,
                name,
                previous,
                state: TorrentState::Finished,
            });
        }
        drop(state);
        self.signal(became_ready);
        Ok(())
    }

    /// Fails a pending read of `piece` with `error`.
    pub fn fail_piece(
        &self,
        handle: TorrentHandle,
        piece: PieceIndex,
        error: EngineError,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let torrent = state.torrent_mut(handle)?;
        torrent.piece_slot(piece)?;
        let name = torrent.name.clone();
        let became_ready = state.post(Alert::ReadPiece {
            handle,
            name,
            piece,
            data: Bytes::new(),
            error: Some(error),
        });
        drop(state);
        self.signal(became_ready);
        Ok(())
    }

    /// Posts a session log alert.
    pub fn post_log(&self, message: &str) {
        let became_ready = self.state.lock().post(Alert::Log {
            message: message.to_string(),
        });
        self.signal(became_ready);
    }

    /// Pieces that currently carry a deadline, in index order.
    pub fn piece_deadlines(&self, handle: TorrentHandle) -> Result<Vec<PieceIndex>, EngineError> {
        let state = self.state.lock();
        Ok(state.torrent(handle)?.deadlines.keys().copied().collect())
    }

    pub fn has_deadline(&self, handle: TorrentHandle, piece: PieceIndex) -> bool {
        let state = self.state.lock();
        state
            .torrent(handle)
            .map(|torrent| torrent.deadlines.contains_key(&piece))
            .unwrap_or(false)
    }

    /// Number of alerts waiting to be popped.
    pub fn queued_alerts(&self) -> usize {
        self.state.lock().alerts.len()
    }

    /// Total [`Session::status`] calls so far, including failed ones.
    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }

    fn signal(&self, became_ready: bool) {
        if !became_ready {
            return;
        }
        self.alert_ready.notify_all();
        let notify = self.notify.lock().clone();
        if let Some(notify) = notify {
            notify();
        }
    }
}

impl Session for SimulatedSession {
    fn set_alert_notify(&self, notify: Option<AlertNotify>) -> Result<(), EngineError> {
        if !self.notify_supported {
            return Err(EngineError::not_supported());
        }
        let fire_now = notify.is_some() && !self.state.lock().alerts.is_empty();
        *self.notify.lock() = notify.clone();
        if let (true, Some(notify)) = (fire_now, notify) {
            notify();
        }
        Ok(())
    }

    fn wait_for_alert(&self, max_wait: Duration) -> Result<bool, EngineError> {
        if !self.wait_supported {
            return Err(EngineError::not_supported());
        }
        let mut state = self.state.lock();
        self.alert_ready
            .wait_while_for(&mut state, |state| state.alerts.is_empty(), max_wait);
        Ok(!state.alerts.is_empty())
    }

    fn pop_alerts(&self) -> Result<Vec<Alert>, EngineError> {
        Ok(self.state.lock().alerts.drain(..).collect())
    }

    fn alert_mask(&self) -> AlertCategory {
        self.state.lock().mask
    }

    fn apply_alert_mask(&self, mask: AlertCategory) {
        self.state.lock().mask = mask;
    }

    fn is_tracked(&self, handle: TorrentHandle) -> Result<bool, EngineError> {
        Ok(self.state.lock().torrent(handle).is_ok())
    }

    fn status(
        &self,
        handle: TorrentHandle,
        flags: StatusFlags,
    ) -> Result<TorrentStatus, EngineError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let torrent = state.torrent(handle)?;
        let pieces = if flags.query_pieces && torrent.pieces_known() {
            torrent.have.clone()
        } else {
            Vec::new()
        };
        Ok(TorrentStatus {
            state: torrent.state,
            pieces,
        })
    }

    fn set_piece_deadline(
        &self,
        handle: TorrentHandle,
        piece: PieceIndex,
        deadline: Duration,
        flags: DeadlineFlags,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let torrent = state.torrent_mut(handle)?;
        let index = torrent.piece_slot(piece)?;
        torrent.deadlines.insert(piece, deadline);
        if !flags.alert_when_available {
            return Ok(());
        }
        if !torrent.have[index] {
            torrent.read_requests.insert(piece);
            return Ok(());
        }
        let alert = Alert::ReadPiece {
            handle,
            name: torrent.name.clone(),
            piece,
            data: torrent.pieces[index].clone(),
            error: None,
        };
        let became_ready = state.post(alert);
        drop(state);
        self.signal(became_ready);
        Ok(())
    }

    fn reset_piece_deadline(
        &self,
        handle: TorrentHandle,
        piece: PieceIndex,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let torrent = state.torrent_mut(handle)?;
        torrent.piece_slot(piece)?;
        torrent.deadlines.remove(&piece);
        torrent.read_requests.remove(&piece);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::engine::AlertKind;

    fn pieces(count: usize) -> Vec<Bytes> {
        (0..count).map(|i| Bytes::from(vec![i as u8; 16])).collect()
    }

    #[test]
    fn test_mask_filters_alerts() {
        let session = SimulatedSession::new();
        session.add_torrent("hidden", pieces(2));
        assert_eq!(session.queued_alerts(), 0);

        session.apply_alert_mask(AlertCategory::STATUS);
        session.add_torrent("visible", pieces(2));
        let kinds: Vec<_> = session
            .pop_alerts()
            .unwrap()
            .iter()
            .map(Alert::kind)
            .collect();
        assert_eq!(kinds, vec![AlertKind::AddTorrent, AlertKind::TorrentAdded]);
    }

    #[test]
    fn test_notify_fires_on_empty_to_non_empty() {
        let session = SimulatedSession::new();
        session.apply_alert_mask(AlertCategory::SESSION_LOG);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        session
            .set_alert_notify(Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        session.post_log("one");
        session.post_log("two");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        session.pop_alerts().unwrap();
        session.post_log("three");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_notify_fires_on_registration_with_pending_alerts() {
        let session = SimulatedSession::new();
        session.apply_alert_mask(AlertCategory::SESSION_LOG);
        session.post_log("early");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        session
            .set_alert_notify(Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_handle_is_invalid_and_slot_reused() {
        let session = SimulatedSession::new();
        let first = session.add_torrent("a", pieces(1));
        session.remove_torrent(first).unwrap();
        assert!(!session.is_tracked(first).unwrap());
        let err = session
            .status(first, StatusFlags::QUERY_PIECES)
            .unwrap_err();
        assert!(err.is_invalid_handle());

        let second = session.add_torrent("b", pieces(1));
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second, first);
        assert!(!session.is_tracked(first).unwrap());
    }

    #[test]
    fn test_read_alert_when_available() {
        let session = SimulatedSession::new();
        session.apply_alert_mask(AlertCategory::STORAGE);
        let handle = session.add_torrent("t", pieces(3));
        session
            .set_piece_deadline(
                handle,
                PieceIndex(1),
                Duration::ZERO,
                DeadlineFlags::ALERT_WHEN_AVAILABLE,
            )
            .unwrap();
        assert_eq!(session.queued_alerts(), 0);

        session.feed_piece(handle, PieceIndex(1)).unwrap();
        let alerts = session.pop_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        match &alerts[0] {
            Alert::ReadPiece { piece, data, .. } => {
                assert_eq!(*piece, PieceIndex(1));
                assert_eq!(data.as_ref(), &[1u8; 16]);
            }
            other => panic!("unexpected alert {other:?}"),
        }

        // Already available: the alert is immediate
        session
            .set_piece_deadline(
                handle,
                PieceIndex(1),
                Duration::ZERO,
                DeadlineFlags::ALERT_WHEN_AVAILABLE,
            )
            .unwrap();
        assert_eq!(session.queued_alerts(), 1);
    }

    #[test]
    fn test_checking_torrent_has_unknown_bitmap() {
        let session = SimulatedSession::new();
        let handle = session.add_torrent_checking("t", pieces(4));
        let status = session.status(handle, StatusFlags::QUERY_PIECES).unwrap();
        assert!(status.pieces.is_empty());

        session.finish_checking(handle).unwrap();
        let status = session.status(handle, StatusFlags::QUERY_PIECES).unwrap();
        assert_eq!(status.pieces, vec![false; 4]);
    }

    #[test]
    fn test_wait_for_alert_times_out() {
        let session = SimulatedSession::new();
        assert!(!session.wait_for_alert(Duration::from_millis(10)).unwrap());
        session.apply_alert_mask(AlertCategory::SESSION_LOG);
        session.post_log("ready");
        assert!(session.wait_for_alert(Duration::from_millis(10)).unwrap());
        // Waiting does not consume
        assert_eq!(session.queued_alerts(), 1);
    }
}
