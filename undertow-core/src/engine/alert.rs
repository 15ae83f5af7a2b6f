//! Alerts posted by the engine.
//!
//! Alerts form a closed set. Routing and filtering match on [`AlertKind`],
//! a fieldless mirror of the [`Alert`] variants, rather than inspecting
//! payloads.

use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use bytes::Bytes;

use super::{EngineError, PieceIndex, TorrentHandle};

/// Bit-set of alert categories the engine is asked to emit.
///
/// The engine drops any alert whose category is not in its applied mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AlertCategory(u32);

impl AlertCategory {
    pub const NONE: Self = Self(0);
    pub const ERROR: Self = Self(1 << 0);
    pub const PEER: Self = Self(1 << 1);
    pub const PORT_MAPPING: Self = Self(1 << 2);
    pub const STORAGE: Self = Self(1 << 3);
    pub const TRACKER: Self = Self(1 << 4);
    pub const CONNECT: Self = Self(1 << 5);
    pub const STATUS: Self = Self(1 << 6);
    pub const IP_BLOCK: Self = Self(1 << 8);
    pub const PERFORMANCE_WARNING: Self = Self(1 << 9);
    pub const DHT: Self = Self(1 << 10);
    pub const STATS: Self = Self(1 << 11);
    pub const SESSION_LOG: Self = Self(1 << 13);
    pub const TORRENT_LOG: Self = Self(1 << 14);
    pub const PEER_LOG: Self = Self(1 << 15);
    pub const INCOMING_REQUEST: Self = Self(1 << 16);
    pub const DHT_LOG: Self = Self(1 << 17);
    pub const DHT_OPERATION: Self = Self(1 << 18);
    pub const PORT_MAPPING_LOG: Self = Self(1 << 19);
    pub const PICKER_LOG: Self = Self(1 << 20);
    pub const FILE_PROGRESS: Self = Self(1 << 21);
    pub const PIECE_PROGRESS: Self = Self(1 << 22);
    pub const UPLOAD: Self = Self(1 << 23);
    pub const BLOCK_PROGRESS: Self = Self(1 << 24);

    const NAMED: &'static [(Self, &'static str)] = &[
        (Self::ERROR, "error"),
        (Self::PEER, "peer"),
        (Self::PORT_MAPPING, "port_mapping"),
        (Self::STORAGE, "storage"),
        (Self::TRACKER, "tracker"),
        (Self::CONNECT, "connect"),
        (Self::STATUS, "status"),
        (Self::IP_BLOCK, "ip_block"),
        (Self::PERFORMANCE_WARNING, "performance_warning"),
        (Self::DHT, "dht"),
        (Self::STATS, "stats"),
        (Self::SESSION_LOG, "session_log"),
        (Self::TORRENT_LOG, "torrent_log"),
        (Self::PEER_LOG, "peer_log"),
        (Self::INCOMING_REQUEST, "incoming_request"),
        (Self::DHT_LOG, "dht_log"),
        (Self::DHT_OPERATION, "dht_operation"),
        (Self::PORT_MAPPING_LOG, "port_mapping_log"),
        (Self::PICKER_LOG, "picker_log"),
        (Self::FILE_PROGRESS, "file_progress"),
        (Self::PIECE_PROGRESS, "piece_progress"),
        (Self::UPLOAD, "upload"),
        (Self::BLOCK_PROGRESS, "block_progress"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Splits the set into its single-bit members, lowest bit first.
    pub fn bits(self) -> impl Iterator<Item = AlertCategory> {
        let mut remaining = self.0;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let lowest = remaining & remaining.wrapping_neg();
            remaining &= remaining - 1;
            Some(AlertCategory(lowest))
        })
    }

    /// Name of a single-bit category, if it is one of the named bits.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(category, _)| *category == self)
            .map(|(_, name)| *name)
    }
}

impl BitOr for AlertCategory {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AlertCategory {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AlertCategory {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for bit in self.bits() {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            match bit.name() {
                Some(name) => f.write_str(name)?,
                None => write!(f, "{:#x}", bit.0)?,
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Lifecycle state of a torrent inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    CheckingFiles,
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    CheckingResumeData,
}

/// Discriminant of [`Alert`], used as a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlertKind {
    AddTorrent,
    TorrentAdded,
    TorrentRemoved,
    StateChanged,
    PieceFinished,
    ReadPiece,
    TorrentError,
    TorrentChecked,
    SaveResumeData,
    SaveResumeDataFailed,
    ListenSucceeded,
    ListenFailed,
    Log,
}

impl AlertKind {
    pub fn name(self) -> &'static str {
        match self {
            AlertKind::AddTorrent => "add_torrent_alert",
            AlertKind::TorrentAdded => "torrent_added_alert",
            AlertKind::TorrentRemoved => "torrent_removed_alert",
            AlertKind::StateChanged => "state_changed_alert",
            AlertKind::PieceFinished => "piece_finished_alert",
            AlertKind::ReadPiece => "read_piece_alert",
            AlertKind::TorrentError => "torrent_error_alert",
            AlertKind::TorrentChecked => "torrent_checked_alert",
            AlertKind::SaveResumeData => "save_resume_data_alert",
            AlertKind::SaveResumeDataFailed => "save_resume_data_failed_alert",
            AlertKind::ListenSucceeded => "listen_succeeded_alert",
            AlertKind::ListenFailed => "listen_failed_alert",
            AlertKind::Log => "log_alert",
        }
    }

    /// Category the engine files this kind of alert under.
    pub fn category(self) -> AlertCategory {
        match self {
            AlertKind::AddTorrent
            | AlertKind::TorrentAdded
            | AlertKind::TorrentRemoved
            | AlertKind::StateChanged
            | AlertKind::TorrentChecked
            | AlertKind::ListenSucceeded => AlertCategory::STATUS,
            AlertKind::PieceFinished => AlertCategory::PIECE_PROGRESS,
            AlertKind::ReadPiece | AlertKind::SaveResumeData => AlertCategory::STORAGE,
            AlertKind::TorrentError
            | AlertKind::SaveResumeDataFailed
            | AlertKind::ListenFailed => AlertCategory::ERROR,
            AlertKind::Log => AlertCategory::SESSION_LOG,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable event record produced by the engine.
#[derive(Debug, Clone)]
pub enum Alert {
    /// Result of an asynchronous add. `handle` is absent when adding failed.
    AddTorrent {
        handle: Option<TorrentHandle>,
        name: String,
        error: Option<EngineError>,
    },
    TorrentAdded {
        handle: TorrentHandle,
        name: String,
    },
    TorrentRemoved {
        handle: TorrentHandle,
        name: String,
    },
    StateChanged {
        handle: TorrentHandle,
        name: String,
        previous: TorrentState,
        state: TorrentState,
    },
    PieceFinished {
        handle: TorrentHandle,
        name: String,
        piece: PieceIndex,
    },
    /// Piece data, posted for pieces armed with `ALERT_WHEN_AVAILABLE`.
    ReadPiece {
        handle: TorrentHandle,
        name: String,
        piece: PieceIndex,
        data: Bytes,
        error: Option<EngineError>,
    },
    TorrentError {
        handle: TorrentHandle,
        name: String,
        error: EngineError,
    },
    TorrentChecked {
        handle: TorrentHandle,
        name: String,
    },
    SaveResumeData {
        handle: TorrentHandle,
        name: String,
    },
    SaveResumeDataFailed {
        handle: TorrentHandle,
        name: String,
        error: EngineError,
    },
    ListenSucceeded {
        address: SocketAddr,
    },
    ListenFailed {
        address: SocketAddr,
        error: EngineError,
    },
    Log {
        message: String,
    },
}

impl Alert {
    pub fn kind(&self) -> AlertKind {
        match self {
            Alert::AddTorrent { .. } => AlertKind::AddTorrent,
            Alert::TorrentAdded { .. } => AlertKind::TorrentAdded,
            Alert::TorrentRemoved { .. } => AlertKind::TorrentRemoved,
            Alert::StateChanged { .. } => AlertKind::StateChanged,
            Alert::PieceFinished { .. } => AlertKind::PieceFinished,
            Alert::ReadPiece { .. } => AlertKind::ReadPiece,
            Alert::TorrentError { .. } => AlertKind::TorrentError,
            Alert::TorrentChecked { .. } => AlertKind::TorrentChecked,
            Alert::SaveResumeData { .. } => AlertKind::SaveResumeData,
            Alert::SaveResumeDataFailed { .. } => AlertKind::SaveResumeDataFailed,
            Alert::ListenSucceeded { .. } => AlertKind::ListenSucceeded,
            Alert::ListenFailed { .. } => AlertKind::ListenFailed,
            Alert::Log { .. } => AlertKind::Log,
        }
    }

    pub fn category(&self) -> AlertCategory {
        self.kind().category()
    }

    /// Torrent this alert concerns, for torrent-scoped alerts.
    pub fn handle(&self) -> Option<TorrentHandle> {
        match self {
            Alert::AddTorrent { handle, .. } => *handle,
            Alert::TorrentAdded { handle, .. }
            | Alert::TorrentRemoved { handle, .. }
            | Alert::StateChanged { handle, .. }
            | Alert::PieceFinished { handle, .. }
            | Alert::ReadPiece { handle, .. }
            | Alert::TorrentError { handle, .. }
            | Alert::TorrentChecked { handle, .. }
            | Alert::SaveResumeData { handle, .. }
            | Alert::SaveResumeDataFailed { handle, .. } => Some(*handle),
            Alert::ListenSucceeded { .. } | Alert::ListenFailed { .. } | Alert::Log { .. } => None,
        }
    }

    pub fn torrent_name(&self) -> Option<&str> {
        match self {
            Alert::AddTorrent { name, .. }
            | Alert::TorrentAdded { name, .. }
            | Alert::TorrentRemoved { name, .. }
            | Alert::StateChanged { name, .. }
            | Alert::PieceFinished { name, .. }
            | Alert::ReadPiece { name, .. }
            | Alert::TorrentError { name, .. }
            | Alert::TorrentChecked { name, .. }
            | Alert::SaveResumeData { name, .. }
            | Alert::SaveResumeDataFailed { name, .. } => Some(name),
            Alert::ListenSucceeded { .. } | Alert::ListenFailed { .. } | Alert::Log { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&EngineError> {
        match self {
            Alert::AddTorrent { error, .. } | Alert::ReadPiece { error, .. } => error.as_ref(),
            Alert::TorrentError { error, .. }
            | Alert::SaveResumeDataFailed { error, .. }
            | Alert::ListenFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Human-readable description, as the engine would render it.
    pub fn message(&self) -> String {
        match self {
            Alert::AddTorrent { name, error, .. } => match error {
                Some(error) => format!("failed to add torrent {name}: {error}"),
                None => format!("added torrent {name}"),
            },
            Alert::TorrentAdded { name, .. } => format!("{name} added"),
            Alert::TorrentRemoved { name, .. } => format!("{name} removed"),
            Alert::StateChanged {
                name,
                previous,
                state,
                ..
            } => format!("{name}: state changed {previous:?} -> {state:?}"),
            Alert::PieceFinished { name, piece, .. } => {
                format!("{name} piece: {piece} finished downloading")
            }
            Alert::ReadPiece {
                name, piece, data, ..
            } => format!("{name}: piece {piece} size {}", data.len()),
            Alert::TorrentError { name, error, .. } => format!("{name} ERROR: {error}"),
            Alert::TorrentChecked { name, .. } => format!("{name} checked"),
            Alert::SaveResumeData { name, .. } => format!("{name} resume data generated"),
            Alert::SaveResumeDataFailed { name, error, .. } => {
                format!("{name} resume data was not generated: {error}")
            }
            Alert::ListenSucceeded { address } => format!("successfully listening on {address}"),
            Alert::ListenFailed { address, error } => {
                format!("listening on {address} failed: {error}")
            }
            Alert::Log { message } => message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_bits_are_single_and_ordered() {
        let mask = AlertCategory::STATUS | AlertCategory::ERROR | AlertCategory::STORAGE;
        let bits: Vec<_> = mask.bits().collect();
        assert_eq!(
            bits,
            vec![
                AlertCategory::ERROR,
                AlertCategory::STORAGE,
                AlertCategory::STATUS
            ]
        );
        assert_eq!(AlertCategory::NONE.bits().count(), 0);
    }

    #[test]
    fn test_category_display() {
        let mask = AlertCategory::STATUS | AlertCategory::ERROR;
        assert_eq!(mask.to_string(), "error|status");
        assert_eq!(AlertCategory::NONE.to_string(), "none");
        assert_eq!(AlertCategory::from_bits(1 << 30).to_string(), "0x40000000");
    }

    #[test]
    fn test_alert_accessors() {
        let handle = TorrentHandle::new(3, 1);
        let alert = Alert::ReadPiece {
            handle,
            name: "movie.mkv".to_string(),
            piece: PieceIndex(7),
            data: Bytes::from_static(b"abcd"),
            error: None,
        };
        assert_eq!(alert.kind(), AlertKind::ReadPiece);
        assert_eq!(alert.category(), AlertCategory::STORAGE);
        assert_eq!(alert.handle(), Some(handle));
        assert_eq!(alert.message(), "movie.mkv: piece 7 size 4");
        assert!(alert.error().is_none());

        let log = Alert::Log {
            message: "hello".to_string(),
        };
        assert_eq!(log.handle(), None);
        assert_eq!(log.torrent_name(), None);
    }
}
