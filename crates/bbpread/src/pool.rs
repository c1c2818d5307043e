//! The buffer pool: a slotted container of column records indexed by
//! BAT id, with lazy heap materialization, reference counts and view
//! resolution.
//!
//! The pool is single-threaded by contract. Observing a LOADING slot from
//! within a load means the caller recursed into itself, which is a
//! programming error and panics.

use std::cell::Cell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use bbpread_core::{AtomRegistry, AtomTag, MemStats, OID_NIL, Oid, Value, elmshift};

use crate::bat::{Bat, BatId, BbpStatus, Persistence};
use crate::catalog::{self, Entry, Header};
use crate::error::{Error, Result};
use crate::farm::{FarmDir, TAIL_EXT, VHEAP_EXT};
use crate::heap::{Heap, HeapData, LoaderConfig};
use crate::strheap;

/// Slots per lazily-allocated chunk.
pub const BBP_INIT: usize = 2048;
/// Maximum number of chunks.
pub const BBP_N_INIT: usize = 8192;
/// Highest representable BAT id plus one.
pub const BBP_LIMIT: usize = BBP_INIT * BBP_N_INIT;

/// One buffer-pool slot; shared by a column and its mirror.
struct Slot {
    desc: Option<Bat>,
    logical: Option<String>,
    physical: String,
    options: Option<String>,
    disk_status: u32,
    status: Cell<BbpStatus>,
    /// In-memory (fix) references.
    refs: Cell<u32>,
    /// Logical references.
    lrefs: Cell<u32>,
    /// Columns viewing this slot's heaps.
    shares: Cell<u32>,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            desc: None,
            logical: None,
            physical: String::new(),
            options: None,
            disk_status: 0,
            status: Cell::new(BbpStatus::empty()),
            refs: Cell::new(0),
            lrefs: Cell::new(0),
            shares: Cell::new(0),
        }
    }
}

/// Handle over one farm's committed column store.
///
/// Dropping the handle releases every owned buffer and mapping; the
/// memory counters of [`Bbp::mem_stats`] return to zero.
pub struct Bbp {
    farm: FarmDir,
    cfg: LoaderConfig,
    atoms: AtomRegistry,
    mem: Rc<MemStats>,
    header: Header,
    chunks: Vec<Option<Box<[Slot]>>>,
    /// Allocated slot capacity.
    limit: usize,
    /// High-water BAT id plus one.
    size: usize,
}

impl fmt::Debug for Bbp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bbp")
            .field("farm", &self.farm)
            .field("header", &self.header)
            .field("limit", &self.limit)
            .field("size", &self.size)
            .finish()
    }
}

impl Bbp {
    /// Open a farm with default thresholds.
    pub fn open(farm_dir: impl AsRef<Path>) -> Result<Bbp> {
        Self::open_with(farm_dir, LoaderConfig::default())
    }

    /// Open a farm: locate `bat/BACKUP/BBP.dir`, validate the header, and
    /// build one descriptor per column. No heap is touched yet.
    pub fn open_with(farm_dir: impl AsRef<Path>, cfg: LoaderConfig) -> Result<Bbp> {
        let farm = FarmDir::new(farm_dir.as_ref());
        let mut atoms = AtomRegistry::new();
        let (header, entries) = catalog::read_catalog(&farm, &mut atoms)?;

        let mut chunks = Vec::new();
        chunks.resize_with(BBP_N_INIT, || None);
        let mut bbp = Bbp {
            farm,
            cfg,
            atoms,
            mem: MemStats::new(),
            header,
            chunks,
            limit: 0,
            size: 1,
        };
        bbp.extend(1)?;
        if let Some(n) = bbp.header.bbp_size {
            if n > 1 {
                bbp.extend(n.min(BBP_LIMIT) - 1)?;
            }
        }
        for entry in entries {
            bbp.insert_entry(entry)?;
        }
        log::debug!(
            target: "bbpread::bbp",
            "{}: {} slots allocated, size {}",
            bbp.farm.root().display(),
            bbp.limit,
            bbp.size
        );
        Ok(bbp)
    }

    pub fn farm(&self) -> &FarmDir {
        &self.farm
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn atoms(&self) -> &AtomRegistry {
        &self.atoms
    }

    pub fn mem_stats(&self) -> &MemStats {
        &self.mem
    }

    /// High-water BAT id plus one.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocated slot capacity.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Grow the slot table chunk by chunk until `limit > bid`.
    fn extend(&mut self, bid: usize) -> Result<()> {
        while self.limit <= bid {
            let chunk = self.limit / BBP_INIT;
            if chunk >= BBP_N_INIT {
                return Err(Error::Incompatible {
                    reason: format!("BAT id {bid} beyond the pool limit {BBP_LIMIT}"),
                });
            }
            let slots: Vec<Slot> = (0..BBP_INIT).map(|_| Slot::empty()).collect();
            self.chunks[chunk] = Some(slots.into_boxed_slice());
            self.limit += BBP_INIT;
        }
        Ok(())
    }

    fn slot(&self, idx: usize) -> Option<&Slot> {
        if idx == 0 || idx >= self.limit {
            return None;
        }
        self.chunks[idx / BBP_INIT]
            .as_ref()
            .map(|c| &c[idx % BBP_INIT])
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Slot> {
        if idx == 0 || idx >= self.limit {
            return None;
        }
        self.chunks[idx / BBP_INIT]
            .as_mut()
            .map(|c| &mut c[idx % BBP_INIT])
    }

    fn insert_entry(&mut self, entry: Entry) -> Result<()> {
        let idx = entry.bid as usize;
        if entry.bid <= 0 || idx >= BBP_LIMIT {
            return Err(Error::Incompatible {
                reason: format!("BAT id {} out of range", entry.bid),
            });
        }
        self.extend(idx)?;
        let own = BatId(entry.bid as i32);

        let slot = self.slot_mut(idx).expect("slot just extended");
        if slot.desc.is_some() {
            return Err(Error::Incompatible {
                reason: format!("duplicate BAT id {own}"),
            });
        }

        let tail = entry.tail;
        let mut theap = Heap::new(
            entry.physical.clone(),
            tail.free,
            tail.size,
            tail.storage,
            own,
        );
        theap.newstorage = tail.storage;
        let tvheap = entry.vheap.map(|vh| {
            let mut heap = Heap::new(
                entry.physical.clone(),
                vh.free,
                vh.size,
                vh.storage,
                own,
            );
            heap.hashash = tail.hashash;
            // A read-only loader cannot trust a stale prefix; always verify.
            heap.cleanhash = true;
            Box::new(heap)
        });

        let bat = Bat {
            id: own,
            ttype: tail.ttype,
            width: tail.width,
            shift: elmshift(tail.width as usize),
            varsized: tail.varsized,
            count: entry.count,
            capacity: entry.capacity,
            hseqbase: entry.hseqbase,
            tseqbase: tail.seqbase,
            sorted: tail.sorted,
            revsorted: tail.revsorted,
            key: tail.key,
            dense: tail.dense,
            nonil: tail.nonil,
            nil: tail.nil,
            nokey: tail.nokey,
            nosorted: tail.nosorted,
            norevsorted: tail.norevsorted,
            restricted: entry.restricted,
            persistence: Persistence::Persistent,
            theap,
            tvheap,
        };

        slot.desc = Some(bat);
        slot.logical = Some(entry.logical);
        slot.physical = entry.physical;
        slot.options = entry.options;
        slot.disk_status = entry.disk_status;
        slot.status.set(BbpStatus::EXISTING);
        // Persistent columns start with exactly one logical reference.
        slot.lrefs.set(1);
        if idx + 1 > self.size {
            self.size = idx + 1;
        }
        Ok(())
    }

    /// A BAT id is valid iff its slot is live, named, and the name does
    /// not begin with `.`.
    pub fn valid(&self, bid: BatId) -> bool {
        if bid.is_nil() {
            return false;
        }
        let idx = bid.slot_index();
        if idx >= self.size {
            return false;
        }
        match self.slot(idx) {
            Some(slot) => {
                slot.desc.is_some()
                    && !slot.status.get().contains(BbpStatus::DELETED)
                    && matches!(&slot.logical, Some(name) if !name.starts_with('.'))
            }
            None => false,
        }
    }

    /// Find a column by logical name; [`BatId::NIL`] when absent.
    pub fn find_by_name(&self, name: &str) -> BatId {
        for idx in 1..self.size {
            if let Some(slot) = self.slot(idx) {
                if slot.logical.as_deref() == Some(name) {
                    let bid = BatId(idx as i32);
                    if self.valid(bid) {
                        return bid;
                    }
                }
            }
        }
        BatId::NIL
    }

    /// All valid ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = BatId> + '_ {
        (1..self.size)
            .map(|i| BatId(i as i32))
            .filter(|bid| self.valid(*bid))
    }

    /// Pin a column in memory, materializing its heaps (and its view
    /// parents) on the first reference. Returns the new count.
    pub fn fix(&mut self, bid: BatId) -> Result<u32> {
        if !self.valid(bid) {
            return Err(Error::NoSuchBat(bid));
        }
        let idx = bid.slot_index();
        self.load_slot(idx)?;
        let slot = self.slot(idx).expect("valid slot");
        let refs = slot.refs.get() + 1;
        slot.refs.set(refs);
        Ok(refs)
    }

    /// Drop a memory reference. Reaching zero does not unload; everything
    /// stays until the handle is dropped.
    pub fn unfix(&self, bid: BatId) -> u32 {
        let slot = self.slot(bid.slot_index()).expect("unfix of unknown bat");
        let refs = slot.refs.get();
        assert!(refs > 0, "unbalanced unfix of bat {bid}");
        slot.refs.set(refs - 1);
        refs - 1
    }

    /// Add a logical reference without triggering any load.
    pub fn retain(&self, bid: BatId) -> u32 {
        let slot = self.slot(bid.slot_index()).expect("retain of unknown bat");
        let lrefs = slot.lrefs.get() + 1;
        slot.lrefs.set(lrefs);
        lrefs
    }

    /// Drop a logical reference.
    pub fn release(&self, bid: BatId) -> u32 {
        let slot = self.slot(bid.slot_index()).expect("release of unknown bat");
        let lrefs = slot.lrefs.get();
        assert!(lrefs > 0, "unbalanced release of bat {bid}");
        slot.lrefs.set(lrefs - 1);
        lrefs - 1
    }

    /// Current memory reference count.
    pub fn refs(&self, bid: BatId) -> u32 {
        self.slot(bid.slot_index()).map_or(0, |s| s.refs.get())
    }

    /// Current logical reference count.
    pub fn lrefs(&self, bid: BatId) -> u32 {
        self.slot(bid.slot_index()).map_or(0, |s| s.lrefs.get())
    }

    /// The logical name of a column.
    pub fn name_of(&self, bid: BatId) -> Option<&str> {
        self.slot(bid.slot_index())?.logical.as_deref()
    }

    /// The options string stored with a column, verbatim.
    pub fn options_of(&self, bid: BatId) -> Option<&str> {
        self.slot(bid.slot_index())?.options.as_deref()
    }

    /// The physical filename stem of a column.
    pub fn physical_of(&self, bid: BatId) -> Option<&str> {
        self.slot(bid.slot_index()).map(|s| s.physical.as_str())
    }

    /// The status field as persisted in the catalog, unmodified.
    pub fn disk_status_of(&self, bid: BatId) -> Option<u32> {
        self.slot(bid.slot_index()).map(|s| s.disk_status)
    }

    /// How many views window into this column's heaps.
    pub fn shares(&self, bid: BatId) -> u32 {
        self.slot(bid.slot_index()).map_or(0, |s| s.shares.get())
    }

    /// The live descriptor of a loaded column; `None` until loaded.
    pub fn cache(&self, bid: BatId) -> Option<&Bat> {
        let slot = self.slot(bid.slot_index())?;
        if slot.status.get().contains(BbpStatus::LOADED) {
            slot.desc.as_ref()
        } else {
            None
        }
    }

    /// Metadata-only access: no heap is materialized for atoms without
    /// fix semantics. Columns of BAT-valued atoms fall back to a full
    /// load, since their elements carry references.
    pub fn quickdesc(&mut self, bid: BatId) -> Result<&Bat> {
        if !self.valid(bid) {
            return Err(Error::NoSuchBat(bid));
        }
        let idx = bid.slot_index();
        let needs_fix = {
            let bat = self.slot(idx).expect("valid slot").desc.as_ref().unwrap();
            self.atoms.ops(bat.ttype).is_some_and(|a| a.needs_fix())
        };
        if needs_fix {
            self.load_slot(idx)?;
        }
        Ok(self.slot(idx).unwrap().desc.as_ref().unwrap())
    }

    /// Fix a column and return an accessor over it. Negative ids yield
    /// the mirror view. Pair with [`Bbp::unfix`].
    pub fn descriptor(&mut self, bid: BatId) -> Result<Column<'_>> {
        let mirrored = bid.is_mirror();
        let phys = BatId(bid.0.abs());
        self.fix(phys)?;
        Ok(Column {
            bbp: self,
            bid: phys,
            mirrored,
        })
    }

    /// The swapped view of `bid`: `mirror(b) == descriptor(-b)`.
    pub fn mirror(&mut self, bid: BatId) -> Result<Column<'_>> {
        self.descriptor(bid.mirrored())
    }

    /// An accessor over an already-loaded column, without touching the
    /// reference counts. Unlike [`Bbp::descriptor`] this borrows the pool
    /// shared, so several columns can be read side by side.
    pub fn column(&self, bid: BatId) -> Result<Column<'_>> {
        let mirrored = bid.is_mirror();
        let phys = BatId(bid.0.abs());
        if self.cache(phys).is_none() {
            return Err(Error::NoSuchBat(bid));
        }
        Ok(Column {
            bbp: self,
            bid: phys,
            mirrored,
        })
    }

    /// Register a transient view: a window of `count` elements into
    /// `parent`'s tail, starting `offset` bytes into its heap. The view
    /// shares the parent's variable heap, if any.
    pub fn share_view(&mut self, parent: BatId, offset: u64, count: u64) -> Result<BatId> {
        if !self.valid(parent) {
            return Err(Error::NoSuchBat(parent));
        }
        let pidx = parent.slot_index();
        let (free, meta) = {
            let pbat = self.slot(pidx).unwrap().desc.as_ref().unwrap();
            let free = count
                .checked_mul(u64::from(pbat.width))
                .unwrap_or(u64::MAX);
            let end = offset.checked_add(free).unwrap_or(u64::MAX);
            if end > pbat.theap.free {
                return Err(Error::Incompatible {
                    reason: format!(
                        "view window [{offset}, {end}) beyond parent {parent}'s heap"
                    ),
                });
            }
            (
                free,
                (
                    pbat.ttype,
                    pbat.width,
                    pbat.shift,
                    pbat.varsized,
                    pbat.sorted,
                    pbat.revsorted,
                    pbat.nonil,
                    pbat.nil,
                    pbat.restricted,
                    pbat.theap.filename.clone(),
                    pbat.tvheap.as_ref().map(|vh| (vh.free, vh.hashash)),
                ),
            )
        };
        let (ttype, width, shift, varsized, sorted, revsorted, nonil, nil, restricted, stem, vmeta) =
            meta;

        let idx = self.size;
        if idx >= BBP_LIMIT {
            return Err(Error::Incompatible {
                reason: "buffer pool is full".to_string(),
            });
        }
        self.extend(idx)?;
        let own = BatId(idx as i32);

        let theap = Heap::new_view(stem.clone(), free, parent, offset);
        let tvheap = vmeta.map(|(vfree, hashash)| {
            let mut vh = Heap::new_view(stem.clone(), vfree, parent, 0);
            vh.hashash = hashash;
            Box::new(vh)
        });

        let bat = Bat {
            id: own,
            ttype,
            width,
            shift,
            varsized,
            count,
            capacity: count,
            hseqbase: 0,
            tseqbase: OID_NIL,
            sorted,
            revsorted,
            key: false,
            dense: false,
            nonil,
            nil,
            nokey: [0, 0],
            nosorted: 0,
            norevsorted: 0,
            restricted,
            persistence: Persistence::Transient,
            theap,
            tvheap,
        };

        let slot = self.slot_mut(idx).expect("slot just extended");
        slot.desc = Some(bat);
        slot.logical = Some(format!("tmp_{idx}"));
        slot.physical = stem;
        slot.status.set(BbpStatus::EXISTING | BbpStatus::TMP);
        // Transient columns start with zero logical references.
        slot.lrefs.set(0);
        self.size = idx + 1;

        let pslot = self.slot(pidx).unwrap();
        pslot.shares.set(pslot.shares.get() + 1);
        log::debug!(
            target: "bbpread::bbp",
            "registered view {own} over {parent} at offset {offset}"
        );
        Ok(own)
    }

    /// Materialize a column's heaps, loading view parents first.
    fn load_slot(&mut self, idx: usize) -> Result<()> {
        let status = self.slot(idx).expect("live slot").status.get();
        if status.contains(BbpStatus::LOADED) {
            return Ok(());
        }
        assert!(
            !status.contains(BbpStatus::LOADING),
            "recursive load of bat {idx} on a single-threaded pool"
        );
        self.slot(idx)
            .unwrap()
            .status
            .set(status | BbpStatus::LOADING);

        let result = self.load_slot_inner(idx);

        let slot = self.slot(idx).unwrap();
        let mut status = slot.status.get();
        status.remove(BbpStatus::LOADING);
        if result.is_ok() {
            status.insert(BbpStatus::LOADED);
        }
        slot.status.set(status);
        result
    }

    fn load_slot_inner(&mut self, idx: usize) -> Result<()> {
        // Parents first. Fixing them keeps the storage pinned while the
        // view is reachable.
        let (own, tail_parent, vheap_parent) = {
            let bat = self.slot(idx).unwrap().desc.as_ref().unwrap();
            (
                bat.id,
                Some(bat.theap.parent).filter(|p| *p != bat.id),
                bat.tvheap
                    .as_ref()
                    .map(|vh| vh.parent)
                    .filter(|p| *p != bat.id),
            )
        };
        for parent in [tail_parent, vheap_parent].into_iter().flatten() {
            self.fix(parent)?;
        }

        let farm = self.farm.clone();
        let mem = Rc::clone(&self.mem);
        let name = self
            .slot(idx)
            .unwrap()
            .logical
            .clone()
            .unwrap_or_else(|| format!("bat {idx}"));
        let storage_tag = {
            let bat = self.slot(idx).unwrap().desc.as_ref().unwrap();
            self.atoms.storage_of(bat.ttype)
        };
        let threshold = {
            let bat = self.slot(idx).unwrap().desc.as_ref().unwrap();
            match bat.persistence {
                Persistence::Persistent => self.cfg.mmap_minsize_persistent,
                Persistence::Transient => self.cfg.mmap_minsize_transient,
            }
        };

        let bat = self
            .slot_mut(idx)
            .unwrap()
            .desc
            .as_mut()
            .expect("descriptor present");
        if bat.theap.parent == own {
            bat.theap.load(&farm, TAIL_EXT, threshold, &mem)?;
        }
        if let Some(vheap) = bat.tvheap.as_mut() {
            if vheap.parent == own {
                vheap.load(&farm, VHEAP_EXT, threshold, &mem)?;
                if vheap.cleanhash && storage_tag == Some(AtomTag::STR) {
                    let bytes = vheap.bytes().expect("vheap just loaded");
                    strheap::verify_prefix(bytes, vheap.hashash, &name)?;
                    vheap.cleanhash = false;
                }
            }
        }
        log::debug!(target: "bbpread::bat", "loaded bat {idx} ({name})");
        Ok(())
    }

    /// The live bytes `[0, free)` of a column's heap, following view
    /// windows into the parent's buffer.
    fn resolve_heap<'a>(&'a self, bat: &'a Bat, primary: bool) -> Result<&'a [u8]> {
        let heap = if primary {
            &bat.theap
        } else {
            bat.tvheap.as_deref().ok_or_else(|| Error::Incompatible {
                reason: format!("column {} has no variable heap", bat.id),
            })?
        };
        match heap.data() {
            HeapData::View { offset } => {
                let parent = self
                    .cache(heap.parent)
                    .expect("view parent is loaded before its child");
                let parent_bytes = self.resolve_heap(parent, primary)?;
                let start = *offset as usize;
                let end = start + heap.free as usize;
                if end > parent_bytes.len() {
                    return Err(Error::Incompatible {
                        reason: format!(
                            "view window [{start}, {end}) beyond parent {}'s heap",
                            heap.parent
                        ),
                    });
                }
                Ok(&parent_bytes[start..end])
            }
            _ => Ok(heap.bytes().expect("heap is loaded")),
        }
    }
}

impl Drop for Bbp {
    fn drop(&mut self) {
        // Heaps release themselves; this is just the goodbye diagnostic.
        log::debug!(
            target: "bbpread::bbp",
            "{}: closing, {}b allocated / {}b mapped at peak",
            self.farm.root().display(),
            self.mem.peak_allocated(),
            self.mem.peak_mapped()
        );
    }
}

/// Read access to one fixed column (or its mirror).
///
/// Borrowed from the pool; element reads follow view windows into the
/// parent's buffer. Dropping the accessor does not unfix the column;
/// call [`Bbp::unfix`] when done.
pub struct Column<'a> {
    bbp: &'a Bbp,
    bid: BatId,
    mirrored: bool,
}

impl fmt::Debug for Column<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("bid", &self.bid)
            .field("mirrored", &self.mirrored)
            .finish()
    }
}

impl<'a> Column<'a> {
    fn bat(&self) -> &'a Bat {
        self.bbp.cache(self.bid).expect("column is loaded")
    }

    /// The id this accessor answers for (negative for mirrors).
    pub fn id(&self) -> BatId {
        if self.mirrored {
            self.bid.mirrored()
        } else {
            self.bid
        }
    }

    pub fn name(&self) -> Option<&'a str> {
        self.bbp.name_of(self.bid)
    }

    pub fn options(&self) -> Option<&'a str> {
        self.bbp.options_of(self.bid)
    }

    pub fn count(&self) -> u64 {
        self.bat().count
    }

    pub fn capacity(&self) -> u64 {
        self.bat().capacity
    }

    /// Element type; the mirror side is a dense oid sequence.
    pub fn atom_type(&self) -> AtomTag {
        if self.mirrored {
            AtomTag::VOID
        } else {
            self.bat().ttype
        }
    }

    pub fn width(&self) -> u16 {
        if self.mirrored { 0 } else { self.bat().width }
    }

    pub fn shift(&self) -> u8 {
        if self.mirrored { 0 } else { self.bat().shift }
    }

    pub fn sorted(&self) -> bool {
        if self.mirrored { true } else { self.bat().sorted }
    }

    pub fn revsorted(&self) -> bool {
        if self.mirrored {
            self.bat().count <= 1
        } else {
            self.bat().revsorted
        }
    }

    pub fn key(&self) -> bool {
        if self.mirrored { true } else { self.bat().key }
    }

    pub fn dense(&self) -> bool {
        if self.mirrored { true } else { self.bat().dense }
    }

    pub fn nonil(&self) -> bool {
        if self.mirrored { true } else { self.bat().nonil }
    }

    pub fn seqbase(&self) -> Oid {
        if self.mirrored {
            self.bat().hseqbase
        } else {
            self.bat().tseqbase
        }
    }

    pub fn varsized(&self) -> bool {
        !self.mirrored && self.bat().varsized
    }

    pub fn is_view(&self) -> bool {
        self.bat().is_view()
    }

    pub fn descriptor(&self) -> &'a Bat {
        self.bat()
    }

    fn check_pos(&self, pos: u64) -> Result<()> {
        let count = self.bat().count;
        if pos >= count {
            return Err(Error::OutOfRange {
                bid: self.id(),
                pos,
                count,
            });
        }
        Ok(())
    }

    /// BUNtoid: the oid at `pos` for dense/void sides.
    pub fn oid_at(&self, pos: u64) -> Result<Oid> {
        self.check_pos(pos)?;
        let bat = self.bat();
        Ok(if self.mirrored {
            bat.head_oid_at(pos)
        } else {
            bat.tail_oid_at(pos)
        })
    }

    /// The tail bytes `[0, free)`, views resolved.
    pub fn tail_bytes(&self) -> Result<&'a [u8]> {
        self.bbp.resolve_heap(self.bat(), true)
    }

    /// The variable-heap bytes `[0, free)`, views resolved.
    pub fn vheap_bytes(&self) -> Result<&'a [u8]> {
        self.bbp.resolve_heap(self.bat(), false)
    }

    /// The string at `pos` of a varsized column; `None` for nil.
    pub fn string_at(&self, pos: u64) -> Result<Option<&'a str>> {
        self.check_pos(pos)?;
        let bat = self.bat();
        let tail = self.tail_bytes()?;
        let off = read_var_offset(tail, pos, bat.width, bat.shift);
        let vheap = self.vheap_bytes()?;
        let name = self.name().unwrap_or("?");
        strheap::string_at(vheap, off, name)
    }

    /// Decode the element at `pos`.
    pub fn element_at(&self, pos: u64) -> Result<Value> {
        self.check_pos(pos)?;
        let bat = self.bat();
        if self.mirrored || bat.ttype == AtomTag::VOID {
            return Ok(Value::Oid(self.oid_at(pos)?));
        }
        if bat.varsized {
            return Ok(Value::Str(self.string_at(pos)?.map(str::to_string)));
        }
        let tail = self.tail_bytes()?;
        let start = (pos << bat.shift) as usize;
        let raw = &tail[start..start + bat.width as usize];
        match self.bbp.atoms.ops(bat.ttype) {
            Some(ops) => Ok(ops.decode(raw)),
            // Unknown atoms stay opaque.
            None => Ok(Value::Raw(raw.to_vec())),
        }
    }

    /// Format the element at `pos` the way its atom prints.
    pub fn format_at(&self, pos: u64) -> Result<String> {
        Ok(self.element_at(pos)?.to_string())
    }
}

/// Read a variable-width offset entry from the tail.
fn read_var_offset(tail: &[u8], pos: u64, width: u16, shift: u8) -> u64 {
    let start = (pos << shift) as usize;
    match width {
        1 => u64::from(tail[start]),
        2 => u64::from(bytemuck::pod_read_unaligned::<u16>(&tail[start..start + 2])),
        4 => u64::from(bytemuck::pod_read_unaligned::<u32>(&tail[start..start + 4])),
        _ => bytemuck::pod_read_unaligned::<u64>(&tail[start..start + 8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_geometry() {
        assert_eq!(BBP_LIMIT, 16_777_216);
    }

    #[test]
    fn var_offsets_widths() {
        let tail = [0x10, 0x08, 0x20, 0x08];
        assert_eq!(read_var_offset(&tail, 1, 1, 0), 0x08);
        assert_eq!(read_var_offset(&tail, 1, 2, 1), 0x0820);
        let tail = 0x1234_5678u32.to_le_bytes();
        assert_eq!(read_var_offset(&tail, 0, 4, 2), 0x1234_5678);
    }
}
