//! The `BBP.dir` catalog parser.
//!
//! The catalog is ASCII, one header of three lines followed by one line
//! per column. Several format generations exist; the line reader is
//! parameterized on the generation and accepts the structural variations
//! (inserted/deleted counts, head-column descriptors, the talign heap
//! field), but `open()` only admits the newest generation: every older one
//! requires an on-disk upgrade this read-only loader cannot perform.

use std::io::{BufRead, BufReader};

use bbpread_core::atom::MAX_INT_BYTES;
use bbpread_core::{AtomRegistry, AtomTag, Oid, elmshift};

use crate::bat::{Restriction, props};
use crate::error::{Error, Result};
use crate::farm::FarmDir;
use crate::heap::StorageMode;

/// Known catalog format generations, octal as persisted.
///
/// Everything below [`version::CURRENT`] needs at least one on-disk
/// rewrite (the float-nil representation change is required by all of
/// them), so only the newest generation loads.
pub mod version {
    /// Old-style inet comparison; on-disk fixup required.
    pub const INET_COMPARE: u32 = 0o61024;
    /// Pre-128-bit integer upgrade.
    pub const INT64: u32 = 0o61025;
    /// Old WKB geometry format.
    pub const OLDWKB: u32 = 0o61026;
    /// The no(rev)sorted witness positions cannot be trusted.
    pub const SORTEDPOS: u32 = 0o61027;
    /// Lines still carry inserted/deleted counts.
    pub const INSERTED: u32 = 0o61030;
    /// Lines still carry a head-column descriptor.
    pub const HEADED: u32 = 0o61031;
    /// The nokey witnesses cannot be trusted.
    pub const NOKEY: u32 = 0o61032;
    /// String heaps may hold duplicate empty strings.
    pub const BADEMPTY: u32 = 0o61033;
    /// Heap descriptors still carry the talign field.
    pub const TALIGN: u32 = 0o61034;
    /// Floats still store nil as a value, not as NaN.
    pub const NIL_NAN: u32 = 0o61035;
    /// The generation this loader reads.
    pub const CURRENT: u32 = 0o61036;
}

/// The parsed three-line catalog header.
#[derive(Debug, Clone)]
pub struct Header {
    /// Format generation, as persisted (octal).
    pub version: u32,
    pub ptr_size: u32,
    pub oid_size: u32,
    pub int_size: u32,
    /// The farm's oid generator seed.
    pub oid_seed: Oid,
    /// Lower bound for the slot table, when present.
    pub bbp_size: Option<usize>,
}

/// One column line, decoded but not yet installed in the pool.
#[derive(Debug)]
pub(crate) struct Entry {
    pub bid: i64,
    pub disk_status: u32,
    pub logical: String,
    pub physical: String,
    pub restricted: Restriction,
    pub count: u64,
    pub capacity: u64,
    pub hseqbase: Oid,
    pub tail: ColDesc,
    pub vheap: Option<VheapDesc>,
    pub options: Option<String>,
}

/// The embedded (tail) heap descriptor of a line.
#[derive(Debug)]
pub(crate) struct ColDesc {
    pub ttype: AtomTag,
    pub width: u16,
    pub varsized: bool,
    pub hashash: bool,
    pub sorted: bool,
    pub revsorted: bool,
    pub key: bool,
    pub dense: bool,
    pub nonil: bool,
    pub nil: bool,
    pub nokey: [u64; 2],
    pub nosorted: u64,
    pub norevsorted: u64,
    pub seqbase: Oid,
    pub free: u64,
    pub size: u64,
    pub storage: StorageMode,
}

#[derive(Debug)]
pub(crate) struct VheapDesc {
    pub free: u64,
    pub size: u64,
    pub storage: StorageMode,
}

/// Whitespace-separated field cursor over one line.
struct Fields<'a> {
    rest: &'a str,
    line: usize,
}

impl<'a> Fields<'a> {
    fn new(text: &'a str, line: usize) -> Self {
        Fields { rest: text, line }
    }

    fn error(&self, reason: String) -> Error {
        Error::Entry {
            line: self.line,
            reason,
        }
    }

    fn next(&mut self, what: &'static str) -> Result<&'a str> {
        self.rest = self.rest.trim_start();
        if self.rest.is_empty() {
            return Err(self.error(format!("missing {what}")));
        }
        let end = self
            .rest
            .find(char::is_whitespace)
            .unwrap_or(self.rest.len());
        let (tok, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(tok)
    }

    fn u64(&mut self, what: &'static str) -> Result<u64> {
        let tok = self.next(what)?;
        tok.parse()
            .map_err(|_| self.error(format!("bad {what} {tok:?}")))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64> {
        let tok = self.next(what)?;
        tok.parse()
            .map_err(|_| self.error(format!("bad {what} {tok:?}")))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        let tok = self.next(what)?;
        tok.parse()
            .map_err(|_| self.error(format!("bad {what} {tok:?}")))
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        let tok = self.next(what)?;
        tok.parse()
            .map_err(|_| self.error(format!("bad {what} {tok:?}")))
    }

    /// Whatever is left of the line, trimmed; `None` when empty.
    fn remainder(&mut self) -> Option<&'a str> {
        let rest = self.rest.trim();
        self.rest = "";
        if rest.is_empty() { None } else { Some(rest) }
    }
}

/// Parse and gate the three header lines.
pub(crate) fn parse_header(lines: [&str; 3]) -> Result<Header> {
    const VERSION_PREFIX: &str = "BBP.dir, GDKversion ";
    let bad = |line: usize, reason: String| Error::Entry { line, reason };

    let version_text = lines[0].strip_prefix(VERSION_PREFIX).ok_or_else(|| {
        bad(1, format!("expected {VERSION_PREFIX:?}, got {:?}", lines[0]))
    })?;
    let version = u32::from_str_radix(version_text.trim(), 8)
        .map_err(|_| bad(1, format!("bad GDKversion {version_text:?}")))?;
    if version != version::CURRENT {
        return Err(Error::UnsupportedVersion {
            found: version,
            expected: version::CURRENT,
        });
    }

    let mut f = Fields::new(lines[1], 2);
    let ptr_size = f.u32("pointer size")?;
    let oid_size = f.u32("oid size")?;
    let int_size = f.u32("int size")?;
    if ptr_size != size_of::<*const u8>() as u32 {
        return Err(Error::Incompatible {
            reason: format!(
                "database created with {ptr_size}-byte pointers, \
                 this build uses {}-byte pointers",
                size_of::<*const u8>()
            ),
        });
    }
    if oid_size != size_of::<Oid>() as u32 {
        return Err(Error::Incompatible {
            reason: format!(
                "database created with {oid_size}-byte oids, \
                 this build uses {}-byte oids",
                size_of::<Oid>()
            ),
        });
    }
    if int_size > MAX_INT_BYTES {
        let reason = if int_size == 16 {
            "the database uses 128-bit integers (hge), \
             which this build was compiled without"
                .to_string()
        } else {
            format!("database created with {int_size}-byte integers")
        };
        return Err(Error::Incompatible { reason });
    }

    let mut f = Fields::new(lines[2], 3);
    let oid_seed = f.u64("oid seed")?;
    let mut bbp_size = None;
    if let Ok(tok) = f.next("BBPsize") {
        if let Some(n) = tok.strip_prefix("BBPsize=") {
            bbp_size = Some(
                n.parse()
                    .map_err(|_| bad(3, format!("bad BBPsize {n:?}")))?,
            );
        }
    }

    Ok(Header {
        version,
        ptr_size,
        oid_size,
        int_size,
        oid_seed,
        bbp_size,
    })
}

/// Parse one column line of generation `version`.
pub(crate) fn parse_entry(
    text: &str,
    line: usize,
    version: u32,
    atoms: &mut AtomRegistry,
) -> Result<Entry> {
    let mut f = Fields::new(text, line);

    let bid = f.i64("bat id")?;
    if bid <= 0 {
        return Err(f.error(format!("bad bat id {bid}")));
    }
    let disk_status = f.u32("status")?;
    let logical = f.next("logical name")?.to_string();
    let physical = f.next("physical name")?.to_string();

    let properties = f.u32("BAT properties")?;
    if properties & !0x06 != 0 {
        return Err(Error::Incompatible {
            reason: format!("column {bid} has unknown BAT properties {properties:#x}"),
        });
    }
    let restricted = Restriction::from_disk((properties & 0x06) >> 1).ok_or_else(|| {
        Error::Incompatible {
            reason: format!("column {bid} has a bad access restriction"),
        }
    })?;

    let count = f.u64("count")?;
    let capacity = f.u64("capacity")?;
    if version <= version::INSERTED {
        // Pre-INSERTED lines record the write-ahead window; obsolete.
        f.u64("inserted")?;
        f.u64("deleted")?;
    }
    let hseqbase = f.u64("base oid")?;

    if version <= version::HEADED {
        // The head column died with the HEADED generation; parse its
        // descriptor (and variable heap, if any) and drop it.
        let head = parse_coldesc(&mut f, version, atoms)?;
        if head.varsized {
            parse_vheap(&mut f)?;
        }
    }

    let tail = parse_coldesc(&mut f, version, atoms)?;
    let vheap = if tail.varsized {
        Some(parse_vheap(&mut f)?)
    } else {
        None
    };
    let options = f.remainder().map(str::to_string);

    if count > capacity {
        return Err(Error::Incompatible {
            reason: format!("column {bid} has count {count} beyond capacity {capacity}"),
        });
    }
    if count.saturating_mul(u64::from(tail.width)) > tail.free {
        return Err(Error::Incompatible {
            reason: format!(
                "column {bid} stores {count} elements of width {} in {} bytes",
                tail.width, tail.free
            ),
        });
    }

    Ok(Entry {
        bid,
        disk_status,
        logical,
        physical,
        restricted,
        count,
        capacity,
        hseqbase,
        tail,
        vheap,
        options,
    })
}

/// Parse an embedded heap descriptor: 12 fields, 13 before the talign
/// generation.
fn parse_coldesc(
    f: &mut Fields<'_>,
    version: u32,
    atoms: &mut AtomRegistry,
) -> Result<ColDesc> {
    let type_name = f.next("type")?.to_string();
    let width = f.u16("width")?;
    let var = f.u16("varsized flag")?;
    if var & !3 != 0 {
        return Err(Error::Incompatible {
            reason: format!("unknown varsized flags {var:#x}"),
        });
    }
    let varsized = var & 1 != 0;
    let hashash = var & 2 != 0;

    let properties = f.u16("column properties")?;
    if properties & !props::MASK != 0 {
        return Err(Error::Incompatible {
            reason: format!("unknown column properties {properties:#06x}"),
        });
    }

    let nokey0 = f.u64("nokey[0]")?;
    let nokey1 = f.u64("nokey[1]")?;
    let nosorted = f.u64("nosorted")?;
    let norevsorted = f.u64("norevsorted")?;
    let seqbase = f.u64("seqbase")?;
    if version <= version::TALIGN {
        f.u64("talign")?;
    }
    let free = f.u64("heap free")?;
    let size = f.u64("heap size")?;
    let storage = StorageMode::from_disk(f.u16("storage mode")?).ok_or_else(|| {
        Error::Incompatible {
            reason: "unknown heap storage mode".to_string(),
        }
    })?;

    if free > size {
        return Err(Error::Incompatible {
            reason: format!("heap free {free} beyond size {size}"),
        });
    }

    let ttype = atoms.index_of(&type_name)?;
    if let Some(ops) = atoms.ops(ttype) {
        if ops.varsized() != varsized {
            return Err(Error::Incompatible {
                reason: format!(
                    "type {type_name} is {} but the catalog says otherwise",
                    if ops.varsized() { "varsized" } else { "fixed-width" }
                ),
            });
        }
        // Fixed-width atoms must match their native width; varsized tails
        // may narrow their offsets to 1, 2 or 4 bytes.
        let native = ops.size() as u16;
        let width_ok = if varsized {
            matches!(width, 1 | 2 | 4 | 8)
        } else {
            width == native
        };
        if !width_ok {
            return Err(Error::Incompatible {
                reason: format!("type {type_name} stored with width {width}"),
            });
        }
    }
    let shift = elmshift(width as usize);
    if !(width == 0 && shift == 0) && (1u32 << shift) != u32::from(width) {
        return Err(Error::Incompatible {
            reason: format!("width {width} is not a power of two"),
        });
    }

    Ok(ColDesc {
        ttype,
        width,
        varsized,
        hashash,
        sorted: properties & props::SORTED != 0,
        revsorted: properties & props::REVSORTED != 0,
        key: properties & props::KEY != 0,
        dense: properties & props::DENSE != 0,
        nonil: properties & props::NONIL != 0,
        nil: properties & props::NIL != 0,
        nokey: [nokey0, nokey1],
        nosorted,
        norevsorted,
        seqbase,
        free,
        size,
        storage,
    })
}

fn parse_vheap(f: &mut Fields<'_>) -> Result<VheapDesc> {
    let free = f.u64("vheap free")?;
    let size = f.u64("vheap size")?;
    let storage = StorageMode::from_disk(f.u16("vheap storage mode")?).ok_or_else(|| {
        Error::Incompatible {
            reason: "unknown vheap storage mode".to_string(),
        }
    })?;
    if free > size {
        return Err(Error::Incompatible {
            reason: format!("vheap free {free} beyond size {size}"),
        });
    }
    Ok(VheapDesc {
        free,
        size,
        storage,
    })
}

/// Read `<farm>/bat/BACKUP/BBP.dir`: header plus one entry per line.
pub(crate) fn read_catalog(
    farm: &FarmDir,
    atoms: &mut AtomRegistry,
) -> Result<(Header, Vec<Entry>)> {
    let path = farm.catalog_path();
    let file = std::fs::File::open(&path).map_err(|source| Error::MissingCatalog {
        path: path.clone(),
        source,
    })?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let mut header_lines: Vec<String> = Vec::with_capacity(3);
    for lineno in 1..=3 {
        match lines.next() {
            Some(Ok(l)) => header_lines.push(l.trim_end_matches('\r').to_string()),
            Some(Err(source)) => {
                return Err(Error::Io {
                    path: path.clone(),
                    source,
                });
            }
            None => {
                return Err(Error::Entry {
                    line: lineno,
                    reason: "catalog header is truncated".to_string(),
                });
            }
        }
    }
    let header = parse_header([
        header_lines[0].as_str(),
        header_lines[1].as_str(),
        header_lines[2].as_str(),
    ])?;

    let mut entries = Vec::new();
    for (i, line) in lines.enumerate() {
        let lineno = i + 4;
        let line = line.map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        entries.push(parse_entry(line, lineno, header.version, atoms)?);
    }
    log::debug!(
        target: "bbpread::catalog",
        "{}: GDKversion 0{:o}, {} column entries",
        path.display(),
        header.version,
        entries.len()
    );
    Ok((header, entries))
}
