//! Alert delivery from the engine to in-process consumers.
//!
//! [`AlertSource`] turns engine readiness into awaitable batches,
//! [`AlertDriver`] pumps those batches and fans them out to
//! [`Subscription`]s.

pub mod driver;
pub mod index;
pub mod source;
pub mod subscription;

use std::time::Duration;

pub use driver::AlertDriver;
pub use index::{AlertFilter, SubscriberId, SubscriberIndex};
pub use source::{AlertSource, SourceMode};
pub use subscription::Subscription;

use crate::engine::{Alert, AlertCategory, AlertKind, EngineError, TorrentHandle};

/// Errors surfaced by alert delivery.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlertError {
    #[error("Torrent handle is no longer valid")]
    HandleInvalid,

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Alert driver shut down")]
    Shutdown,

    #[error("Engine supports neither alert notification nor blocking waits")]
    Unsupported,

    #[error("Alert source closed")]
    SourceClosed,

    #[error("Subscribers still busy after {waited:?}")]
    IdleTimeout { waited: Duration },
}

impl From<EngineError> for AlertError {
    fn from(error: EngineError) -> Self {
        if error.is_invalid_handle() {
            AlertError::HandleInvalid
        } else {
            AlertError::Engine(error)
        }
    }
}

/// Parameters for [`AlertDriver::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeRequest {
    /// Kinds to deliver. Empty means all kinds.
    pub kinds: Vec<AlertKind>,
    /// Restrict delivery to one torrent.
    pub handle: Option<TorrentHandle>,
    /// Extra categories to enable for the subscription's lifetime, on top of
    /// the ones implied by `kinds`.
    pub mask: AlertCategory,
    /// Fail with [`AlertError::HandleInvalid`] if `handle` is not tracked.
    pub raise_if_removed: bool,
}

impl SubscribeRequest {
    pub fn new(kinds: impl IntoIterator<Item = AlertKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn for_handle(mut self, handle: TorrentHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_mask(mut self, mask: AlertCategory) -> Self {
        self.mask |= mask;
        self
    }

    pub fn raise_if_removed(mut self) -> Self {
        self.raise_if_removed = true;
        self
    }

    /// Categories the engine must emit for this subscription to see its
    /// kinds.
    pub fn required_mask(&self) -> AlertCategory {
        self.kinds
            .iter()
            .fold(self.mask, |mask, kind| mask | kind.category())
    }

    pub(crate) fn filter(&self) -> AlertFilter {
        AlertFilter::new(self.kinds.iter().copied(), self.handle)
    }
}

/// Logs one alert the way the pump sees it.
pub fn log_alert(alert: &Alert) {
    let line = format_alert(alert);
    if alert.error().is_some() {
        tracing::error!("{}", line);
    } else {
        tracing::debug!("{}", line);
    }
}

pub(crate) fn format_alert(alert: &Alert) -> String {
    let message = alert.message();
    let mut line = format!("{}: ", alert.kind().name());
    if let Some(name) = alert.torrent_name() {
        if !message.contains(name) {
            line.push_str(name);
            line.push_str(": ");
        }
    }
    line.push_str(&message);
    if let Some(error) = alert.error() {
        line.push_str(&format!(
            " [{} ({} {})]",
            error.message, error.category, error.code
        ));
    }
    line
}
