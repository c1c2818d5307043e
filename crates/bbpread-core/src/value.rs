//! A decoded element of any atom type.

use crate::atom::{OID_NIL, Oid};
use crate::temporal::{Date, Daytime, Timestamp};
use crate::text;

/// One column element, decoded to the host representation.
///
/// Nil is typed: every variant carries its atom's designated nil value and
/// [`Value::is_nil`] recognizes it. Equality on float variants follows IEEE
/// semantics, so compare nils through `is_nil`, not `==`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bit(i8),
    Bte(i8),
    Sht(i16),
    Int(i32),
    Lng(i64),
    #[cfg(feature = "hge")]
    Hge(i128),
    Oid(Oid),
    Ptr(u64),
    Bat(i32),
    Flt(f32),
    Dbl(f64),
    Str(Option<String>),
    Date(Date),
    Daytime(Daytime),
    Timestamp(Timestamp),
    /// An element of an atom this build does not know; raw bytes.
    Raw(Vec<u8>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        match self {
            Value::Bit(v) | Value::Bte(v) => *v == i8::MIN,
            Value::Sht(v) => *v == i16::MIN,
            Value::Int(v) => *v == i32::MIN,
            Value::Lng(v) => *v == i64::MIN,
            #[cfg(feature = "hge")]
            Value::Hge(v) => *v == i128::MIN,
            Value::Oid(v) => *v == OID_NIL,
            Value::Ptr(v) => *v == 0,
            Value::Bat(v) => *v == 0,
            Value::Flt(v) => v.is_nan(),
            Value::Dbl(v) => v.is_nan(),
            Value::Str(v) => v.is_none(),
            Value::Date(v) => v.is_nil(),
            Value::Daytime(v) => v.is_nil(),
            Value::Timestamp(v) => v.is_nil(),
            Value::Raw(_) => false,
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }
        match self {
            Value::Bit(v) => f.write_str(if *v != 0 { "true" } else { "false" }),
            Value::Bte(v) => write!(f, "{v}"),
            Value::Sht(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Lng(v) => write!(f, "{v}"),
            #[cfg(feature = "hge")]
            Value::Hge(v) => write!(f, "{v}"),
            Value::Oid(v) => write!(f, "{v}@0"),
            Value::Ptr(v) => write!(f, "0x{v:x}"),
            Value::Bat(v) => write!(f, "{v}"),
            Value::Flt(v) => write!(f, "{v}"),
            Value::Dbl(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(&text::format_str(v.as_deref())),
            Value::Date(v) => write!(f, "{v}"),
            Value::Daytime(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::Raw(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}
