//! Availability polling.
//!
//! A background task re-reads the torrent's piece bitmap every poll interval
//! and publishes it over a `watch` channel. The foreground walks the
//! requested pieces in order and waits on that channel.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::SchedulerError;
use crate::engine::{PieceIndex, Session, StatusFlags, TorrentHandle};

#[derive(Debug, Clone, Default)]
struct Availability {
    have: Vec<bool>,
    failure: Option<SchedulerError>,
}

impl Availability {
    fn has(&self, index: usize) -> bool {
        self.have.get(index).copied().unwrap_or(false)
    }
}

/// An in-progress [`wait_pieces`](super::PieceScheduler::wait_pieces).
pub struct WaitScope {
    handle: TorrentHandle,
    pieces: Vec<PieceIndex>,
    cursor: usize,
    availability: watch::Receiver<Availability>,
    poller: JoinHandle<()>,
    finished: bool,
}

impl WaitScope {
    pub(crate) async fn start(
        session: Arc<dyn Session>,
        handle: TorrentHandle,
        pieces: Vec<PieceIndex>,
        poll_interval: Duration,
    ) -> Result<Self, SchedulerError> {
        if let Some(&piece) = pieces.iter().find(|piece| piece.as_usize().is_none()) {
            return Err(SchedulerError::OutOfRange { piece });
        }

        let have = query_pieces(&session, handle).await?;
        if !have.is_empty() {
            check_bounds(&pieces, have.len())?;
        }

        let (tx, availability) = watch::channel(Availability {
            have,
            failure: None,
        });
        let poller = tokio::spawn(poll(session, handle, pieces.clone(), poll_interval, tx));

        Ok(Self {
            handle,
            pieces,
            cursor: 0,
            availability,
            poller,
            finished: false,
        })
    }

    pub fn handle(&self) -> TorrentHandle {
        self.handle
    }

    /// Returns the next requested piece once it is available, or `None`
    /// after the last one.
    pub async fn next(&mut self) -> Option<Result<PieceIndex, SchedulerError>> {
        if self.finished {
            return None;
        }
        let Some(&piece) = self.pieces.get(self.cursor) else {
            self.finish();
            return None;
        };
        // Validated non-negative in `start`
        let index = piece.as_usize().unwrap_or(usize::MAX);

        let outcome = match self
            .availability
            .wait_for(|state| state.has(index) || state.failure.is_some())
            .await
        {
            Ok(state) if state.has(index) => Ok(piece),
            Ok(state) => Err(state.failure.clone().unwrap_or(SchedulerError::Cancelled)),
            Err(_) => Err(SchedulerError::Cancelled),
        };

        match outcome {
            Ok(piece) => {
                self.cursor += 1;
                Some(Ok(piece))
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.poller.abort();
    }

    /// Adapts the scope into a stream of piece indices.
    pub fn into_stream(self) -> impl Stream<Item = Result<PieceIndex, SchedulerError>> {
        futures::stream::unfold(self, |mut scope| async move {
            let item = scope.next().await?;
            Some((item, scope))
        })
    }
}

impl Drop for WaitScope {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn query_pieces(
    session: &Arc<dyn Session>,
    handle: TorrentHandle,
) -> Result<Vec<bool>, SchedulerError> {
    let session = Arc::clone(session);
    let status =
        tokio::task::spawn_blocking(move || session.status(handle, StatusFlags::QUERY_PIECES))
            .await??;
    Ok(status.pieces)
}

fn check_bounds(pieces: &[PieceIndex], piece_count: usize) -> Result<(), SchedulerError> {
    match pieces
        .iter()
        .find(|piece| piece.as_usize().is_none_or(|index| index >= piece_count))
    {
        Some(&piece) => Err(SchedulerError::OutOfRange { piece }),
        None => Ok(()),
    }
}

async fn poll(
    session: Arc<dyn Session>,
    handle: TorrentHandle,
    pieces: Vec<PieceIndex>,
    poll_interval: Duration,
    tx: watch::Sender<Availability>,
) {
    let mut checked = !tx.borrow().have.is_empty();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and the bitmap was just read
    ticker.tick().await;

    loop {
        if all_available(&pieces, &tx.borrow()) {
            tracing::trace!("All waited pieces on {} available, poller done", handle);
            return;
        }
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }

        let have = match query_pieces(&session, handle).await {
            Ok(have) => have,
            Err(e) => {
                tracing::debug!("Piece poll on {} failed: {}", handle, e);
                tx.send_modify(|state| state.failure = Some(e));
                return;
            }
        };
        if have.is_empty() {
            continue;
        }
        if !checked {
            checked = true;
            if let Err(e) = check_bounds(&pieces, have.len()) {
                tx.send_modify(|state| state.failure = Some(e));
                return;
            }
        }
        tx.send_if_modified(|state| {
            if state.have == have {
                return false;
            }
            state.have = have;
            true
        });
    }
}

fn all_available(pieces: &[PieceIndex], state: &Availability) -> bool {
    pieces
        .iter()
        .all(|piece| piece.as_usize().is_some_and(|index| state.has(index)))
}
