//! Undertow Core - async coordination for a native torrent engine
//!
//! Fans the engine's alert stream out to independent subscribers and
//! schedules piece deadlines for concurrent readers of the same torrent.

pub mod alerts;
pub mod config;
pub mod engine;
pub mod pieces;
pub mod services;
pub mod session;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use alerts::{AlertDriver, AlertError, AlertSource, SourceMode, SubscribeRequest, Subscription};
pub use config::{AlertConfig, SchedulerConfig, UndertowConfig};
pub use engine::{
    Alert, AlertCategory, AlertKind, EngineError, PieceIndex, Session, SimulatedSession,
    TorrentHandle,
};
pub use pieces::{PieceData, PieceScheduler, ReadScope, SchedulerError, WaitScope};
pub use services::Services;
pub use session::SessionService;

/// Errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Alert(e) => match e {
                AlertError::Unsupported => {
                    "This engine build cannot report alerts; use polling instead".to_string()
                }
                AlertError::Shutdown => "Service is shutting down".to_string(),
                _ => "Alert delivery failed".to_string(),
            },
            UndertowError::Scheduler(e) => match e {
                SchedulerError::HandleInvalid => "Torrent is no longer available".to_string(),
                SchedulerError::OutOfRange { piece } => {
                    format!("Piece {piece} does not exist in this torrent")
                }
                _ => "Piece scheduling failed".to_string(),
            },
            UndertowError::Engine(e) => format!("Engine error: {}", e.message),
            UndertowError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Scheduler(SchedulerError::OutOfRange { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let config = UndertowError::Configuration {
            reason: "read window must hold at least one piece".to_string(),
        };
        assert!(config.is_user_error());
        assert!(config.user_message().contains("read window"));

        let range = UndertowError::from(SchedulerError::OutOfRange {
            piece: PieceIndex(12),
        });
        assert!(range.is_user_error());
        assert_eq!(range.user_message(), "Piece 12 does not exist in this torrent");

        let gone = UndertowError::from(SchedulerError::HandleInvalid);
        assert!(!gone.is_user_error());
    }
}
