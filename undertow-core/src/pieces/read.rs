//! Deadline-driven piece reads.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;

use super::{PieceWindow, SchedulerError, WindowRegistry};
use crate::alerts::{AlertDriver, SubscribeRequest, Subscription};
use crate::engine::{Alert, AlertCategory, AlertKind, EngineError, PieceIndex, TorrentHandle};

/// One piece's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceData {
    pub piece: PieceIndex,
    pub data: Bytes,
}

/// An in-progress [`read_pieces`](super::PieceScheduler::read_pieces).
///
/// Yields pieces in request order. At most `window_size` upcoming pieces
/// hold a deadline at any time. Dropping the scope, at any point, gives its
/// deadlines back to the shared [`PieceWindow`].
pub struct ReadScope {
    registry: Arc<WindowRegistry>,
    window: Arc<PieceWindow>,
    subscription: Subscription,
    pieces: Vec<PieceIndex>,
    cursor: usize,
    window_size: usize,
    current: BTreeSet<PieceIndex>,
    ready: HashMap<PieceIndex, Result<Bytes, EngineError>>,
    handle_invalid: bool,
    finished: bool,
}

impl ReadScope {
    pub(crate) fn new(
        driver: &AlertDriver,
        registry: Arc<WindowRegistry>,
        window: Arc<PieceWindow>,
        pieces: Vec<PieceIndex>,
        window_size: usize,
    ) -> Self {
        let subscription = driver.subscribe(
            SubscribeRequest::new([AlertKind::ReadPiece, AlertKind::TorrentRemoved])
                .for_handle(window.handle())
                .with_mask(AlertCategory::STORAGE | AlertCategory::STATUS)
                .raise_if_removed(),
        );
        Self {
            registry,
            window,
            subscription,
            pieces,
            cursor: 0,
            window_size: window_size.max(1),
            current: BTreeSet::new(),
            ready: HashMap::new(),
            handle_invalid: false,
            finished: false,
        }
    }

    pub fn handle(&self) -> TorrentHandle {
        self.window.handle()
    }

    /// Pieces this scope currently holds a deadline claim on.
    pub fn current_window(&self) -> &BTreeSet<PieceIndex> {
        &self.current
    }

    /// Returns the next piece in request order, or `None` once every piece
    /// was yielded or an error ended the scope.
    pub async fn next(&mut self) -> Option<Result<PieceData, SchedulerError>> {
        if self.finished {
            return None;
        }
        if self.cursor >= self.pieces.len() {
            self.finish();
            return None;
        }
        match self.advance().await {
            Ok(piece) => Some(Ok(piece)),
            Err(e) => {
                if e == SchedulerError::HandleInvalid {
                    self.handle_invalid = true;
                }
                self.finish();
                Some(Err(e))
            }
        }
    }

    async fn advance(&mut self) -> Result<PieceData, SchedulerError> {
        let end = (self.cursor + self.window_size).min(self.pieces.len());
        let wanted: BTreeSet<PieceIndex> = self.pieces[self.cursor..end].iter().copied().collect();
        if let Some(&piece) = wanted.iter().find(|piece| piece.as_usize().is_none()) {
            return Err(SchedulerError::OutOfRange { piece });
        }
        if wanted != self.current {
            let old = std::mem::replace(&mut self.current, wanted);
            self.ready.retain(|piece, _| self.current.contains(piece));
            self.window.delta(&old, &self.current)?;
        }

        let piece = self.pieces[self.cursor];
        loop {
            if let Some(result) = self.ready.get(&piece) {
                let result = result.clone();
                self.cursor += 1;
                return result
                    .map(|data| PieceData { piece, data })
                    .map_err(SchedulerError::from);
            }

            let alert = self.subscription.next().await?;
            match &*alert {
                Alert::ReadPiece {
                    piece: read,
                    data,
                    error,
                    ..
                } if self.current.contains(read) => {
                    let result = match error {
                        Some(e) => Err(e.clone()),
                        None => Ok(data.clone()),
                    };
                    self.ready.insert(*read, result);
                }
                Alert::TorrentRemoved { .. } => return Err(SchedulerError::HandleInvalid),
                _ => {}
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.ready.clear();
        let old = std::mem::take(&mut self.current);
        if self.handle_invalid {
            self.window.discard(&old);
            self.registry.forget(self.handle());
        } else if !old.is_empty() {
            if let Err(e) = self.window.delta(&old, &BTreeSet::new()) {
                tracing::debug!("Releasing read window on {} failed: {}", self.handle(), e);
            }
        }
    }

    /// Adapts the scope into a stream of pieces.
    pub fn into_stream(self) -> impl Stream<Item = Result<PieceData, SchedulerError>> {
        futures::stream::unfold(self, |mut scope| async move {
            let item = scope.next().await?;
            Some((item, scope))
        })
    }
}

impl Drop for ReadScope {
    fn drop(&mut self) {
        self.finish();
    }
}
