//! Errors crossing the loader's boundary.
//!
//! Three dispositions exist (the fourth, programming errors, panics):
//! incompatible on-disk state carries the upgrade directive in its message,
//! truncated or missing files are plain failures, and atom-value parse
//! failures never reach this enum at all (the value becomes the nil).

use std::io;
use std::path::PathBuf;

use bbpread_core::AtomError;

use crate::bat::BatId;

/// The one instruction that fixes every incompatible-database condition.
pub const UPGRADE_DIRECTIVE: &str =
    "run the full MonetDB server on this database first to upgrade it";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `BBP.dir` is not where it should be; not a farm, or never committed.
    #[error(
        "no BBP catalog at {path}: {source}; this does not look like a \
         MonetDB database farm"
    )]
    MissingCatalog { path: PathBuf, source: io::Error },

    /// The catalog's format generation is not the one this loader reads.
    #[error(
        "incompatible BBP version 0{found:o}, this loader reads 0{expected:o}; \
         if the database was written by an older MonetDB release, \
         run the full MonetDB server on it first to upgrade it"
    )]
    UnsupportedVersion { found: u32, expected: u32 },

    /// The catalog header or an entry describes a database this build
    /// cannot interpret (pointer size, property bits, heap bounds, ...).
    #[error("incompatible database: {reason}; run the full MonetDB server \
             on this database first to upgrade it")]
    Incompatible { reason: String },

    /// A malformed catalog line; line 1 is the version line.
    #[error("BBP.dir line {line}: {reason}")]
    Entry { line: usize, reason: String },

    /// A data file is shorter than its heap descriptor requires.
    #[error("{path}: truncated: needed {needed} bytes, found {found}")]
    Truncated {
        path: PathBuf,
        needed: u64,
        found: u64,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A persisted filename stem escapes the farm directory.
    #[error("bad heap filename {stem:?}")]
    BadFilename { stem: String },

    /// The string heap's duplicate-elimination prefix disagrees with its
    /// strings; a read-only loader cannot rebuild it in place.
    #[error(
        "string heap of {name}: hash prefix does not match its strings; \
         run the full MonetDB server on this database first to upgrade it"
    )]
    DirtyStringHash { name: String },

    /// A string heap holds bytes that are not valid UTF-8.
    #[error("string heap of {name}: invalid UTF-8 at offset {offset}")]
    BadHeapString { name: String, offset: u64 },

    /// No live column behind this id.
    #[error("no such column: {0}")]
    NoSuchBat(BatId),

    /// Element access past the column's count.
    #[error("position {pos} out of range for column {bid} with {count} elements")]
    OutOfRange { bid: BatId, pos: u64, count: u64 },

    #[error(transparent)]
    Atom(#[from] AtomError),
}

pub type Result<T> = std::result::Result<T, Error>;
