//! Operation-level error taxonomy
//! Only these conditions propagate past an engine's `recover` boundary;
//! per-entry problems (corrupt structures, chain cycles, failed writes)
//! are counted in `ScanStatistics` and never abort a scan.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The block source could not be opened or sized at all.
    #[error("device unreadable: {0}")]
    DeviceUnreadable(String),

    /// Neither offset 0 nor any MBR partition produced a valid boot sector
    /// for the requested filesystem.
    #[error("no valid {fs} boot sector found")]
    NoValidBootSector { fs: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write summary report: {0}")]
    ReportWrite(String),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
