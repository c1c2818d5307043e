//! Scalar-type layer for the bbpread column-store loader.
//!
//! This crate holds everything about *values* that the farm loader in
//! `bbpread` needs but that does not touch the filesystem: the atom
//! (scalar type) registry with its persisted ordering, the temporal atoms
//! (date, daytime, timestamp), the string text rules (escape grammar,
//! strict UTF-8 validation, the string hash), and the memory accounting
//! counters shared by heap buffers and mappings.
//!
//! ## Cargo Features
//!
//! - **hge**: Enables the 128-bit integer atom. Catalogs that reference
//!   `hge` on a build without this feature are rejected with a clear error.

// The on-disk format is native-endian; the databases this loader targets
// are written on little-endian hosts.
#[cfg(not(target_endian = "little"))]
compile_error!("This crate only supports little endian systems");

pub mod atom;
pub mod mem;
pub mod temporal;
pub mod text;
pub mod value;

pub use atom::{AtomError, AtomOps, AtomRegistry, AtomTag, OID_NIL, Oid, elmshift};
pub use mem::MemStats;
pub use temporal::{Date, Daytime, Timestamp};
pub use value::Value;
