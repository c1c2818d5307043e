//! A read-only loader for a MonetDB database farm's persistent column
//! store.
//!
//! Given a farm directory previously produced by a full server, this crate
//! parses the committed `BBP.dir` catalog, reconstructs the buffer pool of
//! column (BAT) descriptors, and materializes each column's heaps on first
//! use, either by `read(2)` into owned memory or by memory-mapping,
//! depending on size. It is the foundation for query engines that read
//! committed column data without linking the full server.
//!
//! Nothing here ever writes: files are opened read-only, mappings are
//! shared or copy-on-write, and databases that would need an on-disk
//! upgrade are rejected with a directive to run the full MonetDB server
//! first.
//!
//! # Example
//!
//! ```no_run
//! use bbpread::Bbp;
//!
//! let mut bbp = Bbp::open("/data/myfarm")?;
//! let bid = bbp.find_by_name("city");
//! let col = bbp.descriptor(bid)?;
//! for pos in 0..col.count() {
//!     println!("{}", col.format_at(pos)?);
//! }
//! bbp.unfix(bid);
//! # Ok::<(), bbpread::Error>(())
//! ```
//!
//! The handle owns everything it loads; dropping it releases every buffer
//! and mapping.

pub mod bat;
pub mod catalog;
pub mod error;
pub mod farm;
pub mod heap;
pub mod pool;
pub mod strheap;

pub use bat::{Bat, BatId, BbpStatus, Persistence, Restriction};
pub use catalog::{Header, version};
pub use error::{Error, Result};
pub use farm::FarmDir;
pub use heap::{Heap, LoaderConfig, StorageMode};
pub use pool::{BBP_INIT, BBP_LIMIT, BBP_N_INIT, Bbp, Column};

// The scalar-type layer, re-exported for consumers of the handle API.
pub use bbpread_core as core;
pub use bbpread_core::{AtomRegistry, AtomTag, Date, Daytime, MemStats, OID_NIL, Oid, Timestamp, Value};
