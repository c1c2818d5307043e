//! End-to-end reads over synthetic farm directories.

use std::fs;
use std::path::PathBuf;

use pretty_assertions::assert_eq;

use bbpread::strheap::{self, HASH_BYTES, HASH_MASK};
use bbpread::{AtomTag, BatId, Bbp, Error, LoaderConfig, StorageMode, Value, version};

const OID_NIL_TEXT: &str = "18446744073709551615";

/// Builds a farm directory: `bat/BACKUP/BBP.dir` plus data files.
struct FarmBuilder {
    dir: tempfile::TempDir,
    version: u32,
    bbp_size: Option<usize>,
    lines: Vec<String>,
}

impl FarmBuilder {
    fn new() -> FarmBuilder {
        FarmBuilder {
            dir: tempfile::tempdir().unwrap(),
            version: version::CURRENT,
            bbp_size: None,
            lines: Vec::new(),
        }
    }

    fn with_version(mut self, version: u32) -> FarmBuilder {
        self.version = version;
        self
    }

    fn line(mut self, line: impl Into<String>) -> FarmBuilder {
        self.lines.push(line.into());
        self
    }

    fn data(self, rel: &str, bytes: &[u8]) -> FarmBuilder {
        let path = self.dir.path().join("bat").join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
        self
    }

    fn build(self) -> (tempfile::TempDir, PathBuf) {
        let backup = self.dir.path().join("bat").join("BACKUP");
        fs::create_dir_all(&backup).unwrap();
        let mut text = format!("BBP.dir, GDKversion {:06o}\n8 8 8\n", self.version);
        match self.bbp_size {
            Some(n) => text.push_str(&format!("0 BBPsize={n}\n")),
            None => text.push_str("0\n"),
        }
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        fs::write(backup.join("BBP.dir"), text).unwrap();
        let root = self.dir.path().to_path_buf();
        (self.dir, root)
    }
}

fn int_line(bid: i32, name: &str, stem: &str, count: usize, props: u16) -> String {
    let free = count * 4;
    format!(
        "{bid} 2 {name} {stem} 0 {count} {count} 0 \
         int 4 0 {props} 0 0 0 0 {OID_NIL_TEXT} {free} {free} 0"
    )
}

fn int_tail(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// A string heap holding "foo", "bar" and a third value referencing the
/// first, with a freshly computed duplicate-elimination prefix.
fn foo_bar_foo_heap() -> (Vec<u8>, Vec<u8>, [u64; 3]) {
    let mut vheap = vec![0u8; HASH_BYTES];
    vheap.extend_from_slice(b"foo\0");
    vheap.resize(2056, 0);
    vheap.extend_from_slice(b"bar\0");
    vheap.resize(2064, 0);
    let prefix = strheap::recompute_prefix(&vheap, false, "city").unwrap();
    vheap[..HASH_BYTES].copy_from_slice(&prefix);

    let offsets = [2048u64, 2056, 2048];
    let tail: Vec<u8> = offsets
        .iter()
        .flat_map(|o| (*o as u16).to_le_bytes())
        .collect();
    (vheap, tail, offsets)
}

#[test]
fn empty_catalog_opens_with_size_one() {
    let (_keep, root) = FarmBuilder::new().build();
    let bbp = Bbp::open(&root).unwrap();
    assert_eq!(bbp.size(), 1);
    assert_eq!(bbp.find_by_name("anything"), BatId::NIL);
    assert_eq!(bbp.ids().count(), 0);
    assert!(!bbp.valid(BatId::NIL));
}

#[test]
fn missing_catalog_is_a_clean_failure() {
    let dir = tempfile::tempdir().unwrap();
    let err = Bbp::open(dir.path()).unwrap_err();
    assert!(matches!(err, Error::MissingCatalog { .. }));
    assert!(err.to_string().contains("MonetDB"));
}

#[test]
fn dense_void_column_stores_nothing() {
    // sorted | key | dense | nonil = 0x0701
    let (_keep, root) = FarmBuilder::new()
        .line("1 2 seq 01/101 0 3 3 0 void 0 0 1793 0 0 0 0 1000 0 0 0")
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("seq");
    assert_eq!(bid, BatId(1));

    let col = bbp.descriptor(bid).unwrap();
    assert_eq!(col.atom_type(), AtomTag::VOID);
    assert_eq!(col.count(), 3);
    assert!(col.dense());
    assert_eq!(col.seqbase(), 1000);
    assert_eq!(col.oid_at(0).unwrap(), 1000);
    assert_eq!(col.oid_at(2).unwrap(), 1002);
    assert_eq!(col.element_at(1).unwrap(), Value::Oid(1001));
    // No storage behind a dense void column.
    assert_eq!(col.tail_bytes().unwrap(), &[] as &[u8]);
    assert!(col.oid_at(3).is_err());
    bbp.unfix(bid);
}

#[test]
fn int_column_round_trips_with_trailing_nil() {
    let (_keep, root) = FarmBuilder::new()
        .line(int_line(2, "nums", "01/102", 4, 0x0800))
        .data("01/102.tail", &int_tail(&[1, 2, 3, i32::MIN]))
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("nums");
    let col = bbp.descriptor(bid).unwrap();
    assert_eq!(col.count(), 4);
    assert_eq!(col.element_at(0).unwrap(), Value::Int(1));
    assert_eq!(col.element_at(2).unwrap(), Value::Int(3));
    let last = col.element_at(3).unwrap();
    assert_eq!(last, Value::Int(i32::MIN));
    assert!(last.is_nil());
    assert_eq!(col.format_at(3).unwrap(), "nil");
    bbp.unfix(bid);
}

#[test]
fn string_column_with_duplicate_elimination() {
    let (vheap, tail, offsets) = foo_bar_foo_heap();
    let (_keep, root) = FarmBuilder::new()
        .line(format!(
            "3 2 city 01/103 0 3 3 0 \
             str 2 1 0 0 0 0 0 {OID_NIL_TEXT} 6 6 0 2064 2064 0"
        ))
        .data("01/103.tail", &tail)
        .data("01/103.theap", &vheap)
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("city");
    let col = bbp.descriptor(bid).unwrap();

    assert_eq!(col.string_at(0).unwrap(), Some("foo"));
    assert_eq!(col.string_at(1).unwrap(), Some("bar"));
    assert_eq!(col.string_at(2).unwrap(), Some("foo"));
    assert_eq!(col.element_at(2).unwrap(), Value::Str(Some("foo".into())));

    // The bucket for "foo" points at its single stored copy.
    let heap_bytes = col.vheap_bytes().unwrap();
    let bucket = (bbpread::core::text::str_hash(b"foo") & HASH_MASK) as usize;
    let slot = u16::from_le_bytes([heap_bytes[bucket * 2], heap_bytes[bucket * 2 + 1]]);
    assert_eq!(u64::from(slot), offsets[0]);

    // Recomputing the prefix over the unmodified heap is idempotent.
    let fresh = strheap::recompute_prefix(heap_bytes, false, "city").unwrap();
    assert_eq!(&heap_bytes[..HASH_BYTES], &fresh[..]);
    bbp.unfix(bid);
}

#[test]
fn dirty_string_hash_fails_the_load() {
    let (mut vheap, tail, _) = foo_bar_foo_heap();
    // Corrupt one prefix bucket; the loader cannot write a fix back.
    vheap[0] ^= 0x55;
    vheap[1] ^= 0xAA;
    let (_keep, root) = FarmBuilder::new()
        .line(format!(
            "3 2 city 01/103 0 3 3 0 \
             str 2 1 0 0 0 0 0 {OID_NIL_TEXT} 6 6 0 2064 2064 0"
        ))
        .data("01/103.tail", &tail)
        .data("01/103.theap", &vheap)
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("city");
    let err = bbp.descriptor(bid).unwrap_err();
    assert!(matches!(err, Error::DirtyStringHash { .. }));
    assert!(err.to_string().contains("run the full MonetDB server"));
}

#[test]
fn view_rebase_loads_the_parent_first() {
    let (_keep, root) = FarmBuilder::new()
        .line(int_line(2, "nums", "01/102", 4, 0))
        .data("01/102.tail", &int_tail(&[10, 20, 30, 40]))
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let parent = bbp.find_by_name("nums");

    // Window of 2 elements starting 8 bytes (2 ints) into the parent.
    let view = bbp.share_view(parent, 8, 2).unwrap();
    assert!(bbp.cache(parent).is_none(), "parent must not be loaded yet");
    assert_eq!(bbp.refs(parent), 0);

    bbp.fix(view).unwrap();
    let col = bbp.column(view).unwrap();
    assert!(col.is_view());
    assert_eq!(col.element_at(0).unwrap(), Value::Int(30));
    assert_eq!(col.element_at(1).unwrap(), Value::Int(40));

    // The child's bytes are the parent's buffer, 8 bytes in; loading the
    // view fixed the parent.
    assert_eq!(bbp.refs(parent), 1);
    let parent_col = bbp.column(parent).unwrap();
    let child_bytes = col.tail_bytes().unwrap();
    let parent_bytes = parent_col.tail_bytes().unwrap();
    assert!(std::ptr::eq(child_bytes.as_ptr(), parent_bytes[8..].as_ptr()));

    bbp.unfix(parent);
    bbp.unfix(view);

    // Transient views start with zero logical references; the parent
    // knows it is being windowed.
    assert_eq!(bbp.lrefs(view), 0);
    assert_eq!(bbp.lrefs(parent), 1);
    assert_eq!(bbp.shares(parent), 1);
}

#[test]
fn older_generation_is_rejected_with_the_directive() {
    for old in [version::TALIGN, version::INSERTED, version::NIL_NAN] {
        let (_keep, root) = FarmBuilder::new().with_version(old).build();
        let err = Bbp::open(&root).unwrap_err();
        assert!(
            matches!(err, Error::UnsupportedVersion { found, .. } if found == old),
            "version 0{old:o}"
        );
        let msg = err.to_string();
        assert!(msg.contains("MonetDB"), "no directive in {msg:?}");
        assert!(msg.contains("run the full MonetDB server"));
    }
}

#[test]
fn mismatched_pointer_size_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backup = dir.path().join("bat").join("BACKUP");
    fs::create_dir_all(&backup).unwrap();
    fs::write(
        backup.join("BBP.dir"),
        format!("BBP.dir, GDKversion {:06o}\n4 8 8\n0\n", version::CURRENT),
    )
    .unwrap();
    let err = Bbp::open(dir.path()).unwrap_err();
    assert!(matches!(err, Error::Incompatible { .. }));
    assert!(err.to_string().contains("pointer"));
}

#[test]
fn crlf_catalogs_are_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let backup = dir.path().join("bat").join("BACKUP");
    fs::create_dir_all(&backup).unwrap();
    fs::write(
        backup.join("BBP.dir"),
        format!(
            "BBP.dir, GDKversion {:06o}\r\n8 8 8\r\n0 BBPsize=16\r\n\
             1 2 seq 01/101 0 3 3 0 void 0 0 512 0 0 0 0 1000 0 0 0\r\n",
            version::CURRENT
        ),
    )
    .unwrap();
    let bbp = Bbp::open(dir.path()).unwrap();
    assert_eq!(bbp.size(), 2);
    assert_eq!(bbp.find_by_name("seq"), BatId(1));
}

#[test]
fn names_starting_with_a_dot_are_invisible() {
    let (_keep, root) = FarmBuilder::new()
        .line("1 2 .tmp_1 01/101 0 0 0 0 void 0 0 0 0 0 0 0 1000 0 0 0")
        .build();
    let bbp = Bbp::open(&root).unwrap();
    assert!(!bbp.valid(BatId(1)));
    assert_eq!(bbp.find_by_name(".tmp_1"), BatId::NIL);
    assert_eq!(bbp.ids().count(), 0);
}

#[test]
fn fix_unfix_parity_restores_the_count() {
    let (_keep, root) = FarmBuilder::new()
        .line(int_line(2, "nums", "01/102", 2, 0))
        .data("01/102.tail", &int_tail(&[5, 6]))
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("nums");
    assert_eq!(bbp.refs(bid), 0);
    for expected in 1..=3u32 {
        assert_eq!(bbp.fix(bid).unwrap(), expected);
    }
    for expected in (0..=2u32).rev() {
        assert_eq!(bbp.unfix(bid), expected);
    }
    assert_eq!(bbp.refs(bid), 0);

    // Logical references move independently and trigger no load.
    assert_eq!(bbp.lrefs(bid), 1);
    assert_eq!(bbp.retain(bid), 2);
    assert_eq!(bbp.release(bid), 1);
}

#[test]
fn mirror_is_a_dense_oid_view_of_the_head() {
    let (_keep, root) = FarmBuilder::new()
        .line(int_line(2, "nums", "01/102", 3, 0))
        .data("01/102.tail", &int_tail(&[7, 8, 9]))
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("nums");

    let mirror = bbp.mirror(bid).unwrap();
    assert_eq!(mirror.id(), BatId(-2));
    assert_eq!(mirror.count(), 3);
    assert_eq!(mirror.atom_type(), AtomTag::VOID);
    assert!(mirror.dense() && mirror.sorted() && mirror.key());
    assert_eq!(mirror.element_at(2).unwrap(), Value::Oid(2));
    bbp.unfix(bid);

    // descriptor(-bid) is the same view.
    let again = bbp.descriptor(BatId(-2)).unwrap();
    assert_eq!(again.element_at(0).unwrap(), Value::Oid(0));
    bbp.unfix(bid);
}

#[test]
fn quickdesc_does_not_materialize_heaps() {
    let (_keep, root) = FarmBuilder::new()
        .line(int_line(2, "nums", "01/102", 2, 0))
        .data("01/102.tail", &int_tail(&[1, 2]))
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("nums");

    let bat = bbp.quickdesc(bid).unwrap();
    assert_eq!(bat.count, 2);
    assert_eq!(bat.width, 4);
    assert!(bbp.cache(bid).is_none(), "quickdesc must not load");

    bbp.fix(bid).unwrap();
    assert!(bbp.cache(bid).is_some());
    bbp.unfix(bid);
}

#[test]
fn mmap_threshold_is_a_loader_decision() {
    let (_keep, root) = FarmBuilder::new()
        .line(int_line(2, "nums", "01/102", 4, 0))
        .data("01/102.tail", &int_tail(&[1, 2, 3, 4]))
        .build();
    // Force the mmap path for even the smallest heap.
    let cfg = LoaderConfig::default().with_mmap_minsize_persistent(1);
    let mut bbp = Bbp::open_with(&root, cfg).unwrap();
    let bid = bbp.find_by_name("nums");
    let col = bbp.descriptor(bid).unwrap();
    assert_eq!(col.descriptor().theap.newstorage, StorageMode::Mmap);
    assert_eq!(col.element_at(3).unwrap(), Value::Int(4));
    assert!(bbp.mem_stats().mapped() > 0);
    bbp.unfix(bid);
}

#[test]
fn missing_data_file_fails_on_first_fix_only() {
    let (_keep, root) = FarmBuilder::new()
        .line(int_line(2, "nums", "01/102", 2, 0))
        .build();
    // The catalog parses fine without the data file...
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("nums");
    assert!(bbp.quickdesc(bid).is_ok());
    // ...the failure surfaces when the heap is requested.
    assert!(matches!(bbp.descriptor(bid), Err(Error::Io { .. })));
    assert_eq!(bbp.refs(bid), 0, "a failed fix leaves no reference behind");
}

#[test]
fn loaded_columns_satisfy_the_heap_invariants() {
    let (vheap, tail, _) = foo_bar_foo_heap();
    let (_keep, root) = FarmBuilder::new()
        .line("1 2 seq 01/101 0 3 3 0 void 0 0 1793 0 0 0 0 1000 0 0 0")
        .line(int_line(2, "nums", "01/102", 4, 0x0400))
        .line(format!(
            "3 2 city 01/103 0 3 3 0 \
             str 2 1 0 0 0 0 0 {OID_NIL_TEXT} 6 6 0 2064 2064 0"
        ))
        .data("01/102.tail", &int_tail(&[1, 2, 3, 4]))
        .data("01/103.tail", &tail)
        .data("01/103.theap", &vheap)
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let ids: Vec<BatId> = bbp.ids().collect();
    assert_eq!(ids.len(), 3);
    for bid in ids {
        let col = bbp.descriptor(bid).unwrap();
        let bat = col.descriptor();
        assert!(bat.theap.free <= bat.theap.size, "free <= size for {bid}");
        if let Some(vh) = &bat.tvheap {
            assert!(vh.free <= vh.size);
        }
        if bat.width > 0 {
            assert_eq!(1u32 << bat.shift, u32::from(bat.width), "shift of {bid}");
        } else {
            assert_eq!(bat.shift, 0);
        }
        bbp.unfix(bid);
    }
}

#[test]
fn options_strings_are_kept_verbatim() {
    let (_keep, root) = FarmBuilder::new()
        .line(format!(
            "{} batmap=1 some other words",
            int_line(2, "nums", "01/102", 0, 0)
        ))
        .build();
    let bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("nums");
    assert_eq!(bbp.options_of(bid), Some("batmap=1 some other words"));
    assert_eq!(bbp.physical_of(bid), Some("01/102"));
    assert_eq!(bbp.disk_status_of(bid), Some(2));
}

#[test]
fn bbpsize_lower_bounds_the_slot_table() {
    let mut builder = FarmBuilder::new();
    builder.bbp_size = Some(5000);
    let (_keep, root) = builder.build();
    let bbp = Bbp::open(&root).unwrap();
    assert!(bbp.limit() >= 5000);
    assert_eq!(bbp.size(), 1);
}

#[test]
fn duplicate_bat_ids_are_rejected() {
    let (_keep, root) = FarmBuilder::new()
        .line(int_line(2, "a", "01/102", 0, 0))
        .line(int_line(2, "b", "01/103", 0, 0))
        .build();
    assert!(matches!(
        Bbp::open(&root),
        Err(Error::Incompatible { .. })
    ));
}

#[test]
fn wrd_columns_load_as_lng() {
    let bytes: Vec<u8> = [1i64, i64::MIN]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let (_keep, root) = FarmBuilder::new()
        .line(format!(
            "2 2 words 01/104 0 2 2 0 \
             wrd 8 0 0 0 0 0 0 {OID_NIL_TEXT} 16 16 0"
        ))
        .data("01/104.tail", &bytes)
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("words");
    let col = bbp.descriptor(bid).unwrap();
    assert_eq!(col.atom_type(), AtomTag::LNG);
    assert_eq!(col.element_at(0).unwrap(), Value::Lng(1));
    assert!(col.element_at(1).unwrap().is_nil());
    bbp.unfix(bid);
}

#[test]
fn unknown_atoms_stay_opaque_placeholders() {
    let (_keep, root) = FarmBuilder::new()
        .line(format!(
            "2 2 addrs 01/105 0 1 1 0 \
             inet 8 0 0 0 0 0 0 {OID_NIL_TEXT} 8 8 0"
        ))
        .data("01/105.tail", &[1, 2, 3, 4, 5, 6, 7, 8])
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("addrs");
    bbp.fix(bid).unwrap();
    let col = bbp.column(bid).unwrap();
    assert!(col.atom_type().is_unknown());
    assert_eq!(bbp.atoms().name_of(col.atom_type()), Some("inet"));
    assert_eq!(
        col.element_at(0).unwrap(),
        Value::Raw(vec![1, 2, 3, 4, 5, 6, 7, 8])
    );
    bbp.unfix(bid);
}

#[cfg(feature = "hge")]
#[test]
fn hge_columns_decode_when_supported() {
    let bytes: Vec<u8> = [1i128, i128::MIN]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let (_keep, root) = FarmBuilder::new()
        .line(format!(
            "2 2 big 01/106 0 2 2 0 \
             hge 16 0 0 0 0 0 0 {OID_NIL_TEXT} 32 32 0"
        ))
        .data("01/106.tail", &bytes)
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let bid = bbp.find_by_name("big");
    let col = bbp.descriptor(bid).unwrap();
    assert_eq!(col.element_at(0).unwrap(), Value::Hge(1));
    assert!(col.element_at(1).unwrap().is_nil());
    bbp.unfix(bid);
}

#[test]
fn shared_vheap_views_read_the_parent_strings() {
    let (vheap, tail, _) = foo_bar_foo_heap();
    let (_keep, root) = FarmBuilder::new()
        .line(format!(
            "3 2 city 01/103 0 3 3 0 \
             str 2 1 0 0 0 0 0 {OID_NIL_TEXT} 6 6 0 2064 2064 0"
        ))
        .data("01/103.tail", &tail)
        .data("01/103.theap", &vheap)
        .build();
    let mut bbp = Bbp::open(&root).unwrap();
    let parent = bbp.find_by_name("city");
    // A window over the last two entries, sharing the parent's vheap.
    let view = bbp.share_view(parent, 2, 2).unwrap();
    let col = bbp.descriptor(view).unwrap();
    assert_eq!(col.string_at(0).unwrap(), Some("bar"));
    assert_eq!(col.string_at(1).unwrap(), Some("foo"));
    bbp.unfix(view);
    bbp.unfix(parent);
}

#[test]
fn element_type_dispatch_covers_the_builtins() {
    // One column per fixed-width atom family, exercising decode.
    let dbl_bytes: Vec<u8> = [1.5f64, f64::NAN]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let date_bytes: Vec<u8> = {
        use bbpread::Date;
        let d = Date::parse("2015-03-14").unwrap();
        [d.0, i32::MIN].iter().flat_map(|v| v.to_le_bytes()).collect()
    };
    let (_keep, root) = FarmBuilder::new()
        .line(format!(
            "1 2 vals 01/110 0 2 2 0 \
             dbl 8 0 0 0 0 0 0 {OID_NIL_TEXT} 16 16 0"
        ))
        .line(format!(
            "2 2 days 01/111 0 2 2 0 \
             date 4 0 0 0 0 0 0 {OID_NIL_TEXT} 8 8 0"
        ))
        .data("01/110.tail", &dbl_bytes)
        .data("01/111.tail", &date_bytes)
        .build();
    let mut bbp = Bbp::open(&root).unwrap();

    let vals = bbp.find_by_name("vals");
    let col = bbp.descriptor(vals).unwrap();
    assert_eq!(col.element_at(0).unwrap(), Value::Dbl(1.5));
    assert!(col.element_at(1).unwrap().is_nil());
    bbp.unfix(vals);

    let days = bbp.find_by_name("days");
    let col = bbp.descriptor(days).unwrap();
    assert_eq!(col.format_at(0).unwrap(), "2015-03-14");
    assert_eq!(col.format_at(1).unwrap(), "nil");
    bbp.unfix(days);
}
