//! The atom (scalar type) registry.
//!
//! Atoms are identified by a small integer tag. The built-in table below is
//! in the exact order the on-disk catalog was written against, so the
//! indices are stable. Type names encountered in a catalog that are not
//! built in land in a side table of *unknown* atoms addressed by negative
//! tags; in this read-only loader they stay unresolved placeholders that
//! carry just their name.
//!
//! Per-element behavior is dispatched through [`AtomOps`] objects, with a
//! single generic implementation covering every fixed-width atom.

use core::marker::PhantomData;

use crate::temporal::{Date, Daytime, Timestamp};
use crate::text;
use crate::value::Value;

/// An object identifier: unsigned, pointer-sized.
pub type Oid = u64;

/// The designated nil oid, all bits set.
pub const OID_NIL: Oid = Oid::MAX;

cfg_if::cfg_if! {
    if #[cfg(feature = "hge")] {
        /// Widest integer the build supports, in bytes.
        pub const MAX_INT_BYTES: u32 = 16;
    } else {
        /// Widest integer the build supports, in bytes.
        pub const MAX_INT_BYTES: u32 = 8;
    }
}

/// A type tag. Non-negative tags index the built-in table; negative tags
/// index the unknown-atom side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomTag(i32);

impl AtomTag {
    pub const VOID: AtomTag = AtomTag(0);
    pub const BIT: AtomTag = AtomTag(1);
    pub const BTE: AtomTag = AtomTag(2);
    pub const SHT: AtomTag = AtomTag(3);
    pub const BAT: AtomTag = AtomTag(4);
    pub const INT: AtomTag = AtomTag(5);
    pub const OID: AtomTag = AtomTag(6);
    pub const PTR: AtomTag = AtomTag(7);
    pub const FLT: AtomTag = AtomTag(8);
    pub const DBL: AtomTag = AtomTag(9);
    pub const LNG: AtomTag = AtomTag(10);
    #[cfg(feature = "hge")]
    pub const HGE: AtomTag = AtomTag(11);
    #[cfg(feature = "hge")]
    pub const STR: AtomTag = AtomTag(12);
    #[cfg(not(feature = "hge"))]
    pub const STR: AtomTag = AtomTag(11);
    #[cfg(feature = "hge")]
    pub const DATE: AtomTag = AtomTag(13);
    #[cfg(not(feature = "hge"))]
    pub const DATE: AtomTag = AtomTag(12);
    #[cfg(feature = "hge")]
    pub const DAYTIME: AtomTag = AtomTag(14);
    #[cfg(not(feature = "hge"))]
    pub const DAYTIME: AtomTag = AtomTag(13);
    #[cfg(feature = "hge")]
    pub const TIMESTAMP: AtomTag = AtomTag(15);
    #[cfg(not(feature = "hge"))]
    pub const TIMESTAMP: AtomTag = AtomTag(14);

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_unknown(self) -> bool {
        self.0 < 0
    }

    fn builtin_index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }

    fn unknown_index(self) -> Option<usize> {
        if self.0 < 0 {
            Some((-(self.0 + 1)) as usize)
        } else {
            None
        }
    }
}

/// `floor(log2(width))`, the left shift converting an element index to a
/// byte offset. Only meaningful for power-of-two widths; tolerant of zero.
pub fn elmshift(width: usize) -> u8 {
    if width == 0 {
        0
    } else {
        (usize::BITS - 1 - width.leading_zeros()) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomError {
    /// The catalog names `hge` but this build has no 128-bit integers.
    HgeUnsupported,
}

impl core::fmt::Display for AtomError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AtomError::HgeUnsupported => f.write_str(
                "the database uses the 128-bit integer type 'hge', \
                 which this build was compiled without",
            ),
        }
    }
}

impl core::error::Error for AtomError {}

/// Per-atom behavior, dispatched by tag.
pub trait AtomOps {
    fn name(&self) -> &'static str;
    /// Fixed element size in bytes; 0 for variable-width atoms and `void`.
    fn size(&self) -> usize;
    fn varsized(&self) -> bool;
    fn linear(&self) -> bool;
    /// The atom whose binary layout this atom shares.
    fn storage(&self) -> AtomTag;
    /// True when elements hold references that must be fixed on load.
    fn needs_fix(&self) -> bool {
        false
    }
    fn nil(&self) -> Value;
    fn is_nil_raw(&self, raw: &[u8]) -> bool;
    /// Decode one element from its raw bytes. For `str` the raw bytes are
    /// the string itself (without the terminating NUL), not the offset.
    fn decode(&self, raw: &[u8]) -> Value;
    /// Parse a literal; `None` means the caller substitutes the nil.
    fn parse(&self, input: &str) -> Option<Value>;
    fn format(&self, raw: &[u8]) -> String {
        self.decode(raw).to_string()
    }
}

/// Native representation behind a fixed-width atom.
trait Native: 'static {
    type Repr: bytemuck::AnyBitPattern + Copy;
    const NAME: &'static str;
    const TAG: AtomTag;
    const STORAGE: AtomTag;
    const NIL: Self::Repr;
    const LINEAR: bool = true;
    fn is_nil(v: Self::Repr) -> bool;
    fn parse(input: &str) -> Option<Self::Repr>;
    fn value(v: Self::Repr) -> Value;
}

struct FixedAtom<N: Native>(PhantomData<N>);

impl<N: Native> FixedAtom<N> {
    fn boxed() -> Box<dyn AtomOps> {
        Box::new(FixedAtom::<N>(PhantomData))
    }
}

fn read_repr<N: Native>(raw: &[u8]) -> N::Repr {
    bytemuck::pod_read_unaligned(&raw[..size_of::<N::Repr>()])
}

impl<N: Native> AtomOps for FixedAtom<N> {
    fn name(&self) -> &'static str {
        N::NAME
    }

    fn size(&self) -> usize {
        size_of::<N::Repr>()
    }

    fn varsized(&self) -> bool {
        false
    }

    fn linear(&self) -> bool {
        N::LINEAR
    }

    fn storage(&self) -> AtomTag {
        N::STORAGE
    }

    fn needs_fix(&self) -> bool {
        N::TAG == AtomTag::BAT
    }

    fn nil(&self) -> Value {
        N::value(N::NIL)
    }

    fn is_nil_raw(&self, raw: &[u8]) -> bool {
        N::is_nil(read_repr::<N>(raw))
    }

    fn decode(&self, raw: &[u8]) -> Value {
        N::value(read_repr::<N>(raw))
    }

    fn parse(&self, input: &str) -> Option<Value> {
        let input = input.trim();
        if input == "nil" {
            return Some(N::value(N::NIL));
        }
        N::parse(input).map(N::value)
    }
}

macro_rules! integer_native {
    ($marker:ident, $repr:ty, $name:literal, $tag:expr, $value:path) => {
        struct $marker;
        impl Native for $marker {
            type Repr = $repr;
            const NAME: &'static str = $name;
            const TAG: AtomTag = $tag;
            const STORAGE: AtomTag = $tag;
            const NIL: $repr = <$repr>::MIN;
            fn is_nil(v: $repr) -> bool {
                v == Self::NIL
            }
            fn parse(input: &str) -> Option<$repr> {
                input.parse().ok()
            }
            fn value(v: $repr) -> Value {
                $value(v)
            }
        }
    };
}

integer_native!(BteNative, i8, "bte", AtomTag::BTE, Value::Bte);
integer_native!(ShtNative, i16, "sht", AtomTag::SHT, Value::Sht);
integer_native!(IntNative, i32, "int", AtomTag::INT, Value::Int);
integer_native!(LngNative, i64, "lng", AtomTag::LNG, Value::Lng);
#[cfg(feature = "hge")]
integer_native!(HgeNative, i128, "hge", AtomTag::HGE, Value::Hge);

struct BitNative;
impl Native for BitNative {
    type Repr = i8;
    const NAME: &'static str = "bit";
    const TAG: AtomTag = AtomTag::BIT;
    const STORAGE: AtomTag = AtomTag::BTE;
    const NIL: i8 = i8::MIN;
    fn is_nil(v: i8) -> bool {
        v == Self::NIL
    }
    fn parse(input: &str) -> Option<i8> {
        match input {
            "true" | "TRUE" | "t" | "1" => Some(1),
            "false" | "FALSE" | "f" | "0" => Some(0),
            _ => None,
        }
    }
    fn value(v: i8) -> Value {
        Value::Bit(v)
    }
}

struct BatNative;
impl Native for BatNative {
    type Repr = i32;
    const NAME: &'static str = "BAT";
    const TAG: AtomTag = AtomTag::BAT;
    const STORAGE: AtomTag = AtomTag::INT;
    const NIL: i32 = 0;
    fn is_nil(v: i32) -> bool {
        v == 0
    }
    fn parse(input: &str) -> Option<i32> {
        input.parse().ok()
    }
    fn value(v: i32) -> Value {
        Value::Bat(v)
    }
}

struct OidNative;
impl Native for OidNative {
    type Repr = Oid;
    const NAME: &'static str = "oid";
    const TAG: AtomTag = AtomTag::OID;
    const STORAGE: AtomTag = AtomTag::OID;
    const NIL: Oid = OID_NIL;
    fn is_nil(v: Oid) -> bool {
        v == OID_NIL
    }
    fn parse(input: &str) -> Option<Oid> {
        input.strip_suffix("@0").unwrap_or(input).parse().ok()
    }
    fn value(v: Oid) -> Value {
        Value::Oid(v)
    }
}

struct PtrNative;
impl Native for PtrNative {
    type Repr = u64;
    const NAME: &'static str = "ptr";
    const TAG: AtomTag = AtomTag::PTR;
    const STORAGE: AtomTag = AtomTag::PTR;
    const NIL: u64 = 0;
    const LINEAR: bool = false;
    fn is_nil(v: u64) -> bool {
        v == 0
    }
    fn parse(input: &str) -> Option<u64> {
        match input.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => input.parse().ok(),
        }
    }
    fn value(v: u64) -> Value {
        Value::Ptr(v)
    }
}

struct FltNative;
impl Native for FltNative {
    type Repr = f32;
    const NAME: &'static str = "flt";
    const TAG: AtomTag = AtomTag::FLT;
    const STORAGE: AtomTag = AtomTag::FLT;
    const NIL: f32 = f32::NAN;
    fn is_nil(v: f32) -> bool {
        v.is_nan()
    }
    fn parse(input: &str) -> Option<f32> {
        input.parse().ok().filter(|v: &f32| !v.is_nan())
    }
    fn value(v: f32) -> Value {
        Value::Flt(v)
    }
}

struct DblNative;
impl Native for DblNative {
    type Repr = f64;
    const NAME: &'static str = "dbl";
    const TAG: AtomTag = AtomTag::DBL;
    const STORAGE: AtomTag = AtomTag::DBL;
    const NIL: f64 = f64::NAN;
    fn is_nil(v: f64) -> bool {
        v.is_nan()
    }
    fn parse(input: &str) -> Option<f64> {
        input.parse().ok().filter(|v: &f64| !v.is_nan())
    }
    fn value(v: f64) -> Value {
        Value::Dbl(v)
    }
}

struct DateNative;
impl Native for DateNative {
    type Repr = Date;
    const NAME: &'static str = "date";
    const TAG: AtomTag = AtomTag::DATE;
    const STORAGE: AtomTag = AtomTag::INT;
    const NIL: Date = Date::NIL;
    fn is_nil(v: Date) -> bool {
        v.is_nil()
    }
    fn parse(input: &str) -> Option<Date> {
        Date::parse(input)
    }
    fn value(v: Date) -> Value {
        Value::Date(v)
    }
}

struct DaytimeNative;
impl Native for DaytimeNative {
    type Repr = Daytime;
    const NAME: &'static str = "daytime";
    const TAG: AtomTag = AtomTag::DAYTIME;
    const STORAGE: AtomTag = AtomTag::INT;
    const NIL: Daytime = Daytime::NIL;
    fn is_nil(v: Daytime) -> bool {
        v.is_nil()
    }
    fn parse(input: &str) -> Option<Daytime> {
        Daytime::parse(input)
    }
    fn value(v: Daytime) -> Value {
        Value::Daytime(v)
    }
}

struct TimestampNative;
impl Native for TimestampNative {
    type Repr = Timestamp;
    const NAME: &'static str = "timestamp";
    const TAG: AtomTag = AtomTag::TIMESTAMP;
    const STORAGE: AtomTag = AtomTag::LNG;
    const NIL: Timestamp = Timestamp::NIL;
    fn is_nil(v: Timestamp) -> bool {
        v.is_nil()
    }
    fn parse(input: &str) -> Option<Timestamp> {
        Timestamp::parse(input)
    }
    fn value(v: Timestamp) -> Value {
        Value::Timestamp(v)
    }
}

/// `void`: no storage at all; elements are synthesized from the sequence
/// base by the buffer pool.
struct VoidAtom;

impl AtomOps for VoidAtom {
    fn name(&self) -> &'static str {
        "void"
    }

    fn size(&self) -> usize {
        0
    }

    fn varsized(&self) -> bool {
        false
    }

    fn linear(&self) -> bool {
        true
    }

    fn storage(&self) -> AtomTag {
        AtomTag::VOID
    }

    fn nil(&self) -> Value {
        Value::Oid(OID_NIL)
    }

    fn is_nil_raw(&self, _raw: &[u8]) -> bool {
        true
    }

    fn decode(&self, _raw: &[u8]) -> Value {
        Value::Oid(OID_NIL)
    }

    fn parse(&self, input: &str) -> Option<Value> {
        let input = input.trim();
        if input == "nil" {
            return Some(Value::Oid(OID_NIL));
        }
        input
            .strip_suffix("@0")
            .unwrap_or(input)
            .parse()
            .ok()
            .map(Value::Oid)
    }
}

struct StrAtom;

impl AtomOps for StrAtom {
    fn name(&self) -> &'static str {
        "str"
    }

    fn size(&self) -> usize {
        0
    }

    fn varsized(&self) -> bool {
        true
    }

    fn linear(&self) -> bool {
        true
    }

    fn storage(&self) -> AtomTag {
        AtomTag::STR
    }

    fn nil(&self) -> Value {
        Value::Str(None)
    }

    fn is_nil_raw(&self, raw: &[u8]) -> bool {
        text::is_nil_str(raw)
    }

    fn decode(&self, raw: &[u8]) -> Value {
        if text::is_nil_str(raw) {
            Value::Str(None)
        } else {
            Value::Str(Some(String::from_utf8_lossy(raw).into_owned()))
        }
    }

    fn parse(&self, input: &str) -> Option<Value> {
        text::parse_str(input).ok().map(Value::Str)
    }
}

/// The atom table of one loader instance.
pub struct AtomRegistry {
    builtin: Vec<Box<dyn AtomOps>>,
    unknown: Vec<String>,
}

impl Default for AtomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomRegistry {
    pub fn new() -> Self {
        let mut builtin: Vec<Box<dyn AtomOps>> = vec![
            Box::new(VoidAtom),
            FixedAtom::<BitNative>::boxed(),
            FixedAtom::<BteNative>::boxed(),
            FixedAtom::<ShtNative>::boxed(),
            FixedAtom::<BatNative>::boxed(),
            FixedAtom::<IntNative>::boxed(),
            FixedAtom::<OidNative>::boxed(),
            FixedAtom::<PtrNative>::boxed(),
            FixedAtom::<FltNative>::boxed(),
            FixedAtom::<DblNative>::boxed(),
            FixedAtom::<LngNative>::boxed(),
        ];
        #[cfg(feature = "hge")]
        builtin.push(FixedAtom::<HgeNative>::boxed());
        builtin.push(Box::new(StrAtom));
        builtin.push(FixedAtom::<DateNative>::boxed());
        builtin.push(FixedAtom::<DaytimeNative>::boxed());
        builtin.push(FixedAtom::<TimestampNative>::boxed());
        AtomRegistry {
            builtin,
            unknown: Vec::new(),
        }
    }

    /// Resolve a name without inserting; understands the `wrd` alias for
    /// the machine-word integer (this loader only runs on 64-bit hosts).
    pub fn lookup(&self, name: &str) -> Option<AtomTag> {
        if name == "wrd" {
            return Some(AtomTag::LNG);
        }
        if let Some(i) = self.builtin.iter().position(|a| a.name() == name) {
            return Some(AtomTag(i as i32));
        }
        self.unknown
            .iter()
            .position(|n| n == name)
            .map(|i| AtomTag(-(i as i32) - 1))
    }

    /// Resolve a name, appending it to the unknown table when absent.
    pub fn index_of(&mut self, name: &str) -> Result<AtomTag, AtomError> {
        if let Some(tag) = self.lookup(name) {
            return Ok(tag);
        }
        #[cfg(not(feature = "hge"))]
        if name == "hge" {
            return Err(AtomError::HgeUnsupported);
        }
        log::debug!(target: "bbpread::atom", "registering unknown atom {name:?}");
        self.unknown.push(name.to_string());
        Ok(AtomTag(-(self.unknown.len() as i32)))
    }

    pub fn name_of(&self, tag: AtomTag) -> Option<&str> {
        if let Some(i) = tag.unknown_index() {
            return self.unknown.get(i).map(String::as_str);
        }
        self.ops(tag).map(|a| a.name())
    }

    pub fn ops(&self, tag: AtomTag) -> Option<&dyn AtomOps> {
        tag.builtin_index()
            .and_then(|i| self.builtin.get(i))
            .map(Box::as_ref)
    }

    pub fn size_of(&self, tag: AtomTag) -> Option<usize> {
        self.ops(tag).map(|a| a.size())
    }

    pub fn storage_of(&self, tag: AtomTag) -> Option<AtomTag> {
        self.ops(tag).map(|a| a.storage())
    }

    pub fn varsized(&self, tag: AtomTag) -> bool {
        self.ops(tag).is_some_and(|a| a.varsized())
    }

    pub fn nil_of(&self, tag: AtomTag) -> Option<Value> {
        self.ops(tag).map(|a| a.nil())
    }
}
