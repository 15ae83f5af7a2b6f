//! Error codes reported by the native engine.
//!
//! The engine reports failures as a (category, code) pair plus a message.
//! Code `0` in any category means success and never becomes an error value.

use std::fmt;

/// Generic-category errno for "operation not supported".
const ENOTSUP: i32 = 95;

/// Error category an engine error code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Portable errno values.
    Generic,
    /// Platform-specific OS errors.
    System,
    /// Engine-specific codes.
    Libtorrent,
    Http,
    Upnp,
    Socks,
    I2p,
    Bdecode,
}

impl ErrorCategory {
    /// Returns the category name as the engine spells it.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCategory::Generic => "generic",
            ErrorCategory::System => "system",
            ErrorCategory::Libtorrent => "libtorrent",
            ErrorCategory::Http => "http",
            ErrorCategory::Upnp => "upnp",
            ErrorCategory::Socks => "socks",
            ErrorCategory::I2p => "i2p",
            ErrorCategory::Bdecode => "bdecode",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Well-known codes in [`ErrorCategory::Libtorrent`].
pub mod codes {
    pub const DUPLICATE_TORRENT: i32 = 19;
    pub const INVALID_TORRENT_HANDLE: i32 = 20;
    pub const INVALID_SESSION_HANDLE: i32 = 115;
}

/// A failed native engine operation.
///
/// Wraps the engine's own error code and category verbatim so callers can
/// match on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub category: ErrorCategory,
    pub code: i32,
    pub message: String,
}

impl EngineError {
    /// Creates an error from a raw engine code.
    ///
    /// Returns `None` for code `0`, which the engine uses to mean success.
    pub fn from_code(category: ErrorCategory, code: i32, message: impl Into<String>) -> Option<Self> {
        if code == 0 {
            return None;
        }
        Some(Self {
            category,
            code,
            message: message.into(),
        })
    }

    /// The handle is not (or no longer) tracked by the engine.
    pub fn invalid_handle() -> Self {
        Self {
            category: ErrorCategory::Libtorrent,
            code: codes::INVALID_TORRENT_HANDLE,
            message: "invalid torrent handle used".to_string(),
        }
    }

    /// The torrent was already present in the session.
    pub fn duplicate_torrent() -> Self {
        Self {
            category: ErrorCategory::Libtorrent,
            code: codes::DUPLICATE_TORRENT,
            message: "torrent already exists in session".to_string(),
        }
    }

    /// The operation is not available on this platform or build.
    pub fn not_supported() -> Self {
        Self {
            category: ErrorCategory::Generic,
            code: ENOTSUP,
            message: "operation not supported".to_string(),
        }
    }

    pub fn is_invalid_handle(&self) -> bool {
        self.category == ErrorCategory::Libtorrent
            && (self.code == codes::INVALID_TORRENT_HANDLE
                || self.code == codes::INVALID_SESSION_HANDLE)
    }

    pub fn is_not_supported(&self) -> bool {
        self.category == ErrorCategory::Generic && self.code == ENOTSUP
    }
}
