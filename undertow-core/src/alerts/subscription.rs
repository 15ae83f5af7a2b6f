//! Consumer side of the alert fan-out.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::driver::DriverShared;
use super::{AlertError, AlertFilter, SubscriberId};
use crate::engine::{Alert, AlertCategory};

#[derive(Default)]
struct SlotState {
    queue: VecDeque<Arc<Alert>>,
    /// Counted in the driver's busy total while set.
    holding: bool,
    failure: Option<AlertError>,
    closed: bool,
}

impl SlotState {
    fn release(&mut self, busy: &watch::Sender<usize>) {
        if self.holding {
            self.holding = false;
            busy.send_modify(|count| *count -= 1);
        }
    }
}

/// Single-slot mailbox shared between the driver and one subscription.
#[derive(Default)]
pub(crate) struct Slot {
    state: Mutex<SlotState>,
    ready: Notify,
}

impl Slot {
    pub(crate) fn closed() -> Self {
        let slot = Self::default();
        slot.state.lock().closed = true;
        slot
    }

    /// Appends one batch slice and marks the slot busy until it is consumed.
    pub(crate) fn deliver(&self, alerts: Vec<Arc<Alert>>, busy: &watch::Sender<usize>) {
        let mut state = self.state.lock();
        if state.failure.is_some() || state.closed || alerts.is_empty() {
            return;
        }
        state.queue.extend(alerts);
        if !state.holding {
            state.holding = true;
            busy.send_modify(|count| *count += 1);
        }
        drop(state);
        self.ready.notify_one();
    }

    /// Ends delivery with `error`. Undelivered alerts are discarded and the
    /// first failure wins.
    pub(crate) fn fail(&self, error: AlertError, busy: &watch::Sender<usize>) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(error);
        }
        state.queue.clear();
        state.release(busy);
        drop(state);
        self.ready.notify_one();
    }

    /// Stops accepting alerts. Already queued alerts are still handed out
    /// before [`AlertError::Shutdown`].
    pub(crate) fn close(&self, busy: &watch::Sender<usize>) {
        let mut state = self.state.lock();
        state.closed = true;
        state.release(busy);
        drop(state);
        self.ready.notify_one();
    }

    fn release(&self, busy: &watch::Sender<usize>) {
        self.state.lock().release(busy);
    }
}

/// A live filter over the alert stream.
///
/// Dropping the subscription unregisters it, gives back its alert
/// categories and, if it was holding an undelivered slice, unblocks the
/// driver.
pub struct Subscription {
    pub(crate) id: SubscriberId,
    pub(crate) filter: AlertFilter,
    pub(crate) mask: AlertCategory,
    pub(crate) slot: Arc<Slot>,
    pub(crate) shared: Arc<DriverShared>,
    pub(crate) liveness: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn filter(&self) -> &AlertFilter {
        &self.filter
    }

    /// Waits for the next matching alert.
    ///
    /// # Errors
    ///
    /// - `AlertError::HandleInvalid` - The watched torrent is gone
    /// - `AlertError::Engine` - The liveness check failed
    /// - `AlertError::Shutdown` - The driver stopped and no alerts remain
    pub async fn next(&mut self) -> Result<Arc<Alert>, AlertError> {
        loop {
            {
                let mut state = self.slot.state.lock();
                if let Some(error) = &state.failure {
                    return Err(error.clone());
                }
                if let Some(alert) = state.queue.pop_front() {
                    if state.queue.is_empty() {
                        state.release(&self.shared.busy);
                    }
                    return Ok(alert);
                }
                state.release(&self.shared.busy);
                if state.closed {
                    return Err(AlertError::Shutdown);
                }
            }
            self.slot.ready.notified().await;
        }
    }

    /// Adapts the subscription into a stream that ends after its first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Arc<Alert>, AlertError>> {
        futures::stream::unfold(Some(self), |subscription| async move {
            let mut subscription = subscription?;
            match subscription.next().await {
                Ok(alert) => Some((Ok(alert), Some(subscription))),
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.liveness.take() {
            task.abort();
        }
        self.shared.unsubscribe(self.id, &self.filter);
        self.slot.release(&self.shared.busy);
        self.shared.service.dec_alert_mask(self.mask);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("mask", &self.mask)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(message: &str) -> Arc<Alert> {
        Arc::new(Alert::Log {
            message: message.to_string(),
        })
    }

    #[test]
    fn test_deliver_counts_busy_once_per_slice() {
        let (busy, rx) = watch::channel(0usize);
        let slot = Slot::default();
        slot.deliver(vec![log("a")], &busy);
        slot.deliver(vec![log("b")], &busy);
        assert_eq!(*rx.borrow(), 1);

        slot.close(&busy);
        assert_eq!(*rx.borrow(), 0);
        assert_eq!(slot.state.lock().queue.len(), 2);
    }

    #[test]
    fn test_failure_is_sticky_and_discards_queue() {
        let (busy, rx) = watch::channel(0usize);
        let slot = Slot::default();
        slot.deliver(vec![log("a")], &busy);
        slot.fail(AlertError::HandleInvalid, &busy);
        slot.fail(AlertError::Shutdown, &busy);
        slot.deliver(vec![log("b")], &busy);

        let state = slot.state.lock();
        assert_eq!(state.failure, Some(AlertError::HandleInvalid));
        assert!(state.queue.is_empty());
        assert_eq!(*rx.borrow(), 0);
    }
}
