//! Alert pump and fan-out.
//!
//! One pump loop owns the [`AlertSource`]. Each cycle it waits until every
//! subscriber has consumed its previous slice, drains one batch, logs it and
//! routes it through the [`SubscriberIndex`]. Subscribers never see alerts
//! out of engine order because only one batch is ever in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::source::AlertSource;
use super::subscription::{Slot, Subscription};
use super::{AlertError, AlertFilter, SubscribeRequest, SubscriberId, SubscriberIndex, log_alert};
use crate::engine::Alert;
use crate::session::SessionService;

#[derive(Default)]
struct DriverState {
    index: SubscriberIndex,
    slots: HashMap<SubscriberId, Arc<Slot>>,
    next_id: SubscriberId,
    closed: bool,
}

/// State shared by the driver handle and every live subscription.
pub(crate) struct DriverShared {
    pub(crate) service: Arc<SessionService>,
    /// Number of subscriptions holding an unconsumed slice.
    pub(crate) busy: watch::Sender<usize>,
    state: Mutex<DriverState>,
    shutdown: CancellationToken,
    stall_timeout: Duration,
}

impl DriverShared {
    pub(crate) fn unsubscribe(&self, id: SubscriberId, filter: &AlertFilter) {
        let mut state = self.state.lock();
        if state.slots.remove(&id).is_some() {
            state.index.remove(id, filter);
        }
    }

    fn close_all(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for slot in state.slots.values() {
            slot.close(&self.busy);
        }
    }
}

/// Fans engine alerts out to subscriptions.
///
/// Cheap to clone; clones share the same subscriber set.
#[derive(Clone)]
pub struct AlertDriver {
    shared: Arc<DriverShared>,
}

impl AlertDriver {
    /// `stall_timeout` is how long the pump waits for slow subscribers
    /// before logging a warning and waiting again.
    pub fn new(service: Arc<SessionService>, stall_timeout: Duration) -> Self {
        let (busy, _) = watch::channel(0);
        Self {
            shared: Arc::new(DriverShared {
                service,
                busy,
                state: Mutex::new(DriverState::default()),
                shutdown: CancellationToken::new(),
                stall_timeout,
            }),
        }
    }

    pub fn service(&self) -> &Arc<SessionService> {
        &self.shared.service
    }

    /// Registers interest in alerts matching `request`.
    ///
    /// The categories the request needs stay enabled on the engine until
    /// the returned subscription is dropped. With `raise_if_removed` and a
    /// handle, a liveness check runs in the background and fails the
    /// subscription with [`AlertError::HandleInvalid`] if the torrent is
    /// not tracked.
    ///
    /// Must be called within a Tokio runtime.
    pub fn subscribe(&self, request: SubscribeRequest) -> Subscription {
        let filter = request.filter();
        let mask = request.required_mask();
        self.shared.service.inc_alert_mask(mask);

        let (id, slot) = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            if state.closed {
                (id, Arc::new(Slot::closed()))
            } else {
                let slot = Arc::new(Slot::default());
                state.index.insert(id, &filter);
                state.slots.insert(id, Arc::clone(&slot));
                (id, slot)
            }
        };

        let liveness = match (request.raise_if_removed, request.handle) {
            (true, Some(handle)) => {
                let shared = Arc::clone(&self.shared);
                let slot = Arc::clone(&slot);
                Some(tokio::spawn(async move {
                    let session = Arc::clone(shared.service.session());
                    let tracked =
                        tokio::task::spawn_blocking(move || session.is_tracked(handle)).await;
                    match tracked {
                        Ok(Ok(true)) => {}
                        Ok(Ok(false)) => slot.fail(AlertError::HandleInvalid, &shared.busy),
                        Ok(Err(e)) => slot.fail(AlertError::from(e), &shared.busy),
                        Err(e) => tracing::warn!("Liveness check for {} did not finish: {}", handle, e),
                    }
                }))
            }
            _ => None,
        };

        tracing::trace!("Subscription {} registered: {:?}", id, filter);
        Subscription {
            id,
            filter,
            mask,
            slot,
            shared: Arc::clone(&self.shared),
            liveness,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Pumps alerts until [`shutdown`](Self::shutdown) is called.
    ///
    /// On exit every subscription is closed, so waiting consumers resolve
    /// with [`AlertError::Shutdown`] once their queued alerts are consumed,
    /// and the source is closed.
    ///
    /// # Errors
    ///
    /// Returns the first error from the source. That error is fatal to the
    /// pump and is logged before returning.
    pub async fn run(&self, mut source: AlertSource) -> Result<(), AlertError> {
        tracing::debug!("Alert driver running ({} source)", source.mode());
        let shutdown = self.shared.shutdown.clone();

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                pumped = self.pump(&mut source) => {
                    if let Err(e) = pumped {
                        tracing::error!("Alert driver failed: {}", e);
                        break Err(e);
                    }
                }
            }
        };

        self.shared.close_all();
        source.shutdown().await;
        tracing::debug!("Alert driver stopped");
        result
    }

    async fn pump(&self, source: &mut AlertSource) -> Result<(), AlertError> {
        self.wait_for_subscribers().await;
        let alerts = source.wait_and_drain().await?;
        self.dispatch(alerts);
        Ok(())
    }

    async fn wait_for_subscribers(&self) {
        let mut busy = self.shared.busy.subscribe();
        loop {
            let waited = tokio::time::timeout(
                self.shared.stall_timeout,
                busy.wait_for(|count| *count == 0),
            )
            .await
            .map(|_| ());
            if waited.is_ok() {
                return;
            }
            tracing::warn!(
                "Timeout waiting for alert subscribers ({} busy after {:?}), retrying",
                *busy.borrow(),
                self.shared.stall_timeout
            );
        }
    }

    fn dispatch(&self, alerts: Vec<Alert>) {
        for alert in &alerts {
            log_alert(alert);
        }
        let alerts: Vec<Arc<Alert>> = alerts.into_iter().map(Arc::new).collect();

        let state = self.shared.state.lock();
        for (id, slice) in state.index.route(&alerts) {
            if let Some(slot) = state.slots.get(&id) {
                slot.deliver(slice, &self.shared.busy);
            }
        }
    }

    /// Stops the pump and closes every subscription.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.close_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Waits until no subscription holds an unconsumed slice.
    ///
    /// # Errors
    ///
    /// - `AlertError::IdleTimeout` - Some subscriber was still busy after `timeout`
    pub async fn wait_until_idle(&self, timeout: Duration) -> Result<(), AlertError> {
        let mut busy = self.shared.busy.subscribe();
        match tokio::time::timeout(timeout, busy.wait_for(|count| *count == 0)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(AlertError::IdleTimeout { waited: timeout }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AlertCategory, AlertKind, Session, SimulatedSession};

    fn driver() -> (Arc<SimulatedSession>, AlertDriver) {
        driver_with_stall(Duration::from_secs(10))
    }

    fn driver_with_stall(stall_timeout: Duration) -> (Arc<SimulatedSession>, AlertDriver) {
        let engine = Arc::new(SimulatedSession::new());
        let service = Arc::new(SessionService::new(engine.clone(), AlertCategory::ERROR));
        (engine, AlertDriver::new(service, stall_timeout))
    }

    #[tokio::test]
    async fn test_subscribe_enables_and_drop_releases_mask() {
        let (engine, driver) = driver();
        let subscription = driver.subscribe(SubscribeRequest::new([AlertKind::ReadPiece]));
        assert_eq!(
            engine.alert_mask(),
            AlertCategory::ERROR | AlertCategory::STORAGE
        );
        assert_eq!(driver.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(engine.alert_mask(), AlertCategory::ERROR);
        assert_eq!(driver.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_feeds_only_matching_subscribers() {
        let (_engine, driver) = driver();
        let mut logs = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));
        let removed = driver.subscribe(SubscribeRequest::new([AlertKind::TorrentRemoved]));

        driver.dispatch(vec![Alert::Log {
            message: "hello".to_string(),
        }]);
        assert_eq!(*driver.shared.busy.borrow(), 1);

        let alert = logs.next().await.unwrap();
        assert_eq!(alert.message(), "hello");
        assert_eq!(*driver.shared.busy.borrow(), 0);
        drop(removed);
    }

    #[tokio::test]
    async fn test_dropping_busy_subscription_unblocks_pump() {
        let (_engine, driver) = driver();
        let subscription = driver.subscribe(SubscribeRequest::default());
        driver.dispatch(vec![Alert::Log {
            message: "pending".to_string(),
        }]);
        assert!(
            driver
                .wait_until_idle(Duration::from_millis(20))
                .await
                .is_err()
        );

        drop(subscription);
        driver
            .wait_until_idle(Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_is_closed() {
        let (_engine, driver) = driver();
        driver.shutdown();
        let mut late = driver.subscribe(SubscribeRequest::default());
        assert_eq!(late.next().await.unwrap_err(), AlertError::Shutdown);
        assert_eq!(driver.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_keeps_pump_waiting() {
        let (_engine, driver) = driver_with_stall(Duration::from_millis(10));
        let mut slow = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));
        driver.dispatch(vec![Alert::Log {
            message: "held".to_string(),
        }]);

        let mut waiting = tokio_test::task::spawn(driver.wait_for_subscribers());
        tokio_test::assert_pending!(waiting.poll());
        // Several stall timeouts pass without the wait giving up
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio_test::assert_pending!(waiting.poll());

        slow.next().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap();
    }
}
