//! Error kinds shared by both recovery pipelines.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic at bytenr {bytenr}")]
    BadMagic { bytenr: u64 },

    #[error("bad checksum at bytenr {bytenr}")]
    BadChecksum { bytenr: u64 },

    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    /// Two same-generation records disagree about their content.
    #[error("conflicting records: {0}")]
    Conflict(String),

    /// A record the cross-check requires is absent.
    #[error("missing record: {0}")]
    MissingRecord(String),

    /// A logical address is not covered by any good chunk.
    #[error("logical address {logical} is not mapped by any chunk")]
    MapIncomplete { logical: u64 },

    #[error("aborted by user")]
    UserAbort,

    /// Stripe order cannot be derived from the data present on disk.
    #[error("unrepairable chunk: {0}")]
    Unrepairable(String),
}

pub type Result<T> = std::result::Result<T, RecoverError>;
