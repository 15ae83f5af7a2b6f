//! Centralized configuration for Undertow.
//!
//! All tunable parameters for alert delivery and piece scheduling are
//! defined here.

use std::time::Duration;

use crate::UndertowError;
use crate::alerts::SourceMode;
use crate::alerts::source::MAX_THREAD_WAIT;
use crate::engine::AlertCategory;

/// Central configuration for all Undertow components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub alerts: AlertConfig,
    pub scheduler: SchedulerConfig,
}

/// Alert source and driver configuration.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// How engine readiness is observed
    pub source_mode: SourceMode,
    /// Upper bound of one blocking wait on the fallback thread
    pub thread_wait: Duration,
    /// How long the pump waits for slow subscribers before warning
    pub stall_timeout: Duration,
    /// Categories enabled regardless of subscriptions
    pub alert_mask: AlertCategory,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            source_mode: SourceMode::Auto,
            thread_wait: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(10),
            alert_mask: AlertCategory::ERROR,
        }
    }
}

/// Piece scheduling configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pieces ahead of the cursor that hold a deadline per read
    pub read_window: usize,
    /// Deadline handed to the engine for wanted pieces
    pub piece_deadline: Duration,
    /// Bitmap poll period for waiters
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            read_window: 30,
            piece_deadline: Duration::ZERO, // Fetch immediately
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("UNDERTOW_ALERT_SOURCE") {
            match mode.parse::<SourceMode>() {
                Ok(mode) => config.alerts.source_mode = mode,
                Err(e) => tracing::warn!("Ignoring UNDERTOW_ALERT_SOURCE: {}", e),
            }
        }

        if let Ok(wait) = std::env::var("UNDERTOW_THREAD_WAIT_MS") {
            if let Ok(millis) = wait.parse::<u64>() {
                config.alerts.thread_wait = Duration::from_millis(millis);
            }
        }

        if let Ok(timeout) = std::env::var("UNDERTOW_STALL_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.alerts.stall_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(window) = std::env::var("UNDERTOW_READ_WINDOW") {
            if let Ok(pieces) = window.parse::<usize>() {
                config.scheduler.read_window = pieces;
            }
        }

        if let Ok(interval) = std::env::var("UNDERTOW_POLL_INTERVAL_MS") {
            if let Ok(millis) = interval.parse::<u64>() {
                config.scheduler.poll_interval = Duration::from_millis(millis);
            }
        }

        config
    }

    /// Creates a configuration with short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            alerts: AlertConfig {
                thread_wait: Duration::from_millis(20),
                stall_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                read_window: 4,
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        }
    }

    /// Checks value ranges that the components rely on.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Configuration` - A value is zero or out of range
    pub fn validate(&self) -> Result<(), UndertowError> {
        let wait = self.alerts.thread_wait;
        if wait.is_zero() || wait > MAX_THREAD_WAIT {
            return Err(UndertowError::Configuration {
                reason: format!(
                    "alert thread wait must be in (0, {MAX_THREAD_WAIT:?}], got {wait:?}"
                ),
            });
        }
        if self.alerts.stall_timeout.is_zero() {
            return Err(UndertowError::Configuration {
                reason: "stall timeout must be positive".to_string(),
            });
        }
        if self.scheduler.read_window == 0 {
            return Err(UndertowError::Configuration {
                reason: "read window must hold at least one piece".to_string(),
            });
        }
        if self.scheduler.poll_interval.is_zero() {
            return Err(UndertowError::Configuration {
                reason: "poll interval must be positive".to_string(),
            });
        }
        Ok(())
    }
}
