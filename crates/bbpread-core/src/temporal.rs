//! The temporal atoms: `date`, `daytime` and `timestamp`.
//!
//! A date is a 32-bit signed day count in the proleptic Gregorian calendar,
//! counted from 1 January of year -1. Year 0 does not exist: the day after
//! 31 December of year -1 is 1 January of year 1. A daytime is milliseconds
//! since midnight. A timestamp combines the two, interpreted in GMT, and
//! its nil shares the bit pattern of the `lng` nil.

/// Years representable without overflowing the 32-bit day count.
pub const YEAR_MIN: i32 = -5_867_411;
pub const YEAR_MAX: i32 = 5_867_411;

/// Milliseconds in a day.
pub const DAY_MSECS: i32 = 24 * 60 * 60 * 1000;

/// Cumulative days before each month in a non-leap year.
const CUMDAYS: [i32; 13] = [
    0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 365,
];

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const SEPARATORS: [u8; 3] = [b'-', b'/', b'\\'];

pub fn is_leap(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// Days in `month` of `year`.
pub fn month_days(year: i32, month: u32) -> i32 {
    debug_assert!((1..=12).contains(&month));
    let m = month as usize;
    CUMDAYS[m] - CUMDAYS[m - 1] + i32::from(month == 2 && is_leap(year))
}

/// Leap years in the closed year range `[a, b]`. Callers never pass a range
/// containing the nonexistent year 0.
fn leaps_between(a: i32, b: i32) -> i64 {
    if a > b {
        return 0;
    }
    fn multiples(k: i64, a: i64, b: i64) -> i64 {
        b.div_euclid(k) - (a - 1).div_euclid(k)
    }
    let (a, b) = (i64::from(a), i64::from(b));
    multiples(4, a, b) - multiples(100, a, b) + multiples(400, a, b)
}

/// Day count of 1 January of `year` (`year != 0`).
fn days_before_year(year: i32) -> i64 {
    debug_assert!(year != 0);
    if year == -1 {
        0
    } else if year > 0 {
        // Year -1 itself, then the full years 1..year-1.
        365 + i64::from(year - 1) * 365 + leaps_between(1, year - 1)
    } else {
        // The years year..=-2 lie wholly before the epoch.
        let n = i64::from(-1 - year);
        -(n * 365 + leaps_between(year, -2))
    }
}

fn prev_year(year: i32) -> i32 {
    if year == 1 { -1 } else { year - 1 }
}

fn next_year(year: i32) -> i32 {
    if year == -1 { 1 } else { year + 1 }
}

/// A day count from 1 January of year -1.
#[repr(transparent)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    bytemuck::Zeroable,
    bytemuck::Pod,
)]
pub struct Date(pub i32);

impl Date {
    pub const NIL: Date = Date(i32::MIN);

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    /// Build a date from calendar components. Year 0, out-of-range years
    /// and invalid day-of-month combinations yield `None`.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Date> {
        if year == 0 || !(YEAR_MIN..=YEAR_MAX).contains(&year) {
            return None;
        }
        if !(1..=12).contains(&month) || day < 1 || day as i32 > month_days(year, month) {
            return None;
        }
        let leap_adj = i64::from(month > 2 && is_leap(year));
        let days = days_before_year(year)
            + i64::from(CUMDAYS[(month - 1) as usize])
            + leap_adj
            + i64::from(day)
            - 1;
        i32::try_from(days).ok().map(Date)
    }

    /// Calendar components of a non-nil date.
    pub fn ymd(self) -> (i32, u32, u32) {
        debug_assert!(!self.is_nil());
        let n = i64::from(self.0);
        // First guess from the mean Gregorian year length, then correct;
        // the guess is off by at most a couple of years.
        let mut year = estimate_year(n);
        while n < days_before_year(year) {
            year = prev_year(year);
        }
        loop {
            let next = next_year(year);
            if n >= days_before_year(next) {
                year = next;
            } else {
                break;
            }
        }
        let doy = (n - days_before_year(year)) as i32;
        let leap = is_leap(year);
        let mut month = 1usize;
        while month < 12 {
            let end = CUMDAYS[month] + i32::from(leap && month >= 2);
            if doy < end {
                break;
            }
            month += 1;
        }
        let start = CUMDAYS[month - 1] + i32::from(leap && month > 2);
        (year, month as u32, (doy - start + 1) as u32)
    }

    pub fn year(self) -> i32 {
        self.ymd().0
    }

    pub fn month(self) -> u32 {
        self.ymd().1
    }

    pub fn day(self) -> u32 {
        self.ymd().2
    }

    pub fn checked_add_days(self, days: i32) -> Option<Date> {
        if self.is_nil() {
            return None;
        }
        self.0.checked_add(days).map(Date)
    }

    /// Parse a date literal: `YYYY-MM-DD` with `-`, `/` or `\` separators,
    /// a one/two digit or three-letter month, a month-first textual form,
    /// or `nil`.
    pub fn parse(input: &str) -> Option<Date> {
        let input = input.trim();
        if input == "nil" {
            return Some(Date::NIL);
        }
        let (date, used) = parse_date_prefix(input)?;
        if used == input.len() { Some(date) } else { None }
    }
}

impl core::fmt::Display for Date {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }
        let (y, m, d) = self.ymd();
        if y < 0 {
            write!(f, "-{:04}-{:02}-{:02}", -y, m, d)
        } else {
            write!(f, "{y:04}-{m:02}-{d:02}")
        }
    }
}

fn estimate_year(n: i64) -> i32 {
    // Whole years elapsed since the epoch year, by the 400-year cycle.
    let index = (n * 400).div_euclid(146_097);
    if index >= 0 {
        if index == 0 { -1 } else { index as i32 }
    } else {
        (index - 1) as i32
    }
}

/// Milliseconds since midnight, in `[0, DAY_MSECS)`.
#[repr(transparent)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    bytemuck::Zeroable,
    bytemuck::Pod,
)]
pub struct Daytime(pub i32);

impl Daytime {
    pub const NIL: Daytime = Daytime(i32::MIN);
    pub const MIDNIGHT: Daytime = Daytime(0);

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    pub fn from_hms_ms(hour: u32, minute: u32, second: u32, ms: u32) -> Option<Daytime> {
        if hour > 23 || minute > 59 || second > 59 || ms > 999 {
            return None;
        }
        Some(Daytime(
            (((hour * 60 + minute) * 60 + second) * 1000 + ms) as i32,
        ))
    }

    pub fn hour(self) -> u32 {
        (self.0 / 3_600_000) as u32
    }

    pub fn minute(self) -> u32 {
        (self.0 / 60_000 % 60) as u32
    }

    pub fn second(self) -> u32 {
        (self.0 / 1000 % 60) as u32
    }

    pub fn millisecond(self) -> u32 {
        (self.0 % 1000) as u32
    }

    /// Parse `HH:MM[:SS[.fff]]` (the fraction separator may be `.` or `:`)
    /// or `nil`.
    pub fn parse(input: &str) -> Option<Daytime> {
        let input = input.trim();
        if input == "nil" {
            return Some(Daytime::NIL);
        }
        let (t, used) = parse_daytime_prefix(input)?;
        if used == input.len() { Some(t) } else { None }
    }
}

impl core::fmt::Display for Daytime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }
        write!(
            f,
            "{:02}:{:02}:{:02}.{:03}",
            self.hour(),
            self.minute(),
            self.second(),
            self.millisecond()
        )
    }
}

/// A GMT instant: a date plus milliseconds within that day.
///
/// Field order matters: on the little-endian hosts this crate supports, the
/// struct is bit-identical to the `lng` it is stored as, and the nil below
/// is the `lng` nil.
#[repr(C)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    bytemuck::Zeroable,
    bytemuck::Pod,
)]
pub struct Timestamp {
    pub msecs: Daytime,
    pub days: Date,
}

impl Timestamp {
    pub const NIL: Timestamp = Timestamp {
        msecs: Daytime(0),
        days: Date(i32::MIN),
    };

    pub fn new(days: Date, msecs: Daytime) -> Timestamp {
        if days.is_nil() || msecs.is_nil() {
            return Self::NIL;
        }
        Timestamp { msecs, days }
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    pub fn as_lng(self) -> i64 {
        (i64::from(self.days.0) << 32) | i64::from(self.msecs.0 as u32)
    }

    /// Parse `<date>[T| |@<daytime>][ ][GMT|UTC][±HH[:]MM]` or `nil`.
    /// A zone offset shifts the result to GMT.
    pub fn parse(input: &str) -> Option<Timestamp> {
        let input = input.trim();
        if input == "nil" {
            return Some(Timestamp::NIL);
        }
        let (date, used) = parse_date_prefix(input)?;
        let mut rest = &input[used..];
        let mut time = Daytime::MIDNIGHT;
        if let Some(sep) = rest.bytes().next() {
            if !matches!(sep, b'T' | b' ' | b'@') {
                return None;
            }
            rest = rest[1..].trim_start();
            let (t, used) = parse_daytime_prefix(rest)?;
            time = t;
            rest = &rest[used..];
        }
        rest = rest.trim_start();
        let mut offset_minutes = 0i32;
        if !rest.is_empty() {
            let (off, used) = parse_zone_prefix(rest)?;
            offset_minutes = off;
            if used != rest.len() {
                return None;
            }
        }
        let mut ms = time.0 - offset_minutes * 60_000;
        let mut days = date;
        while ms < 0 {
            ms += DAY_MSECS;
            days = days.checked_add_days(-1)?;
        }
        while ms >= DAY_MSECS {
            ms -= DAY_MSECS;
            days = days.checked_add_days(1)?;
        }
        Some(Timestamp::new(days, Daytime(ms)))
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }
        write!(f, "{} {}", self.days, self.msecs)
    }
}

fn scan_uint(bytes: &[u8], max_digits: usize) -> Option<(i64, usize)> {
    let mut v: i64 = 0;
    let mut used = 0;
    while used < max_digits {
        match bytes.get(used) {
            Some(d @ b'0'..=b'9') => {
                v = v.checked_mul(10)?.checked_add(i64::from(d - b'0'))?;
                used += 1;
            }
            _ => break,
        }
    }
    if used == 0 { None } else { Some((v, used)) }
}

fn scan_alpha(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .take_while(|b| b.is_ascii_alphabetic())
        .count()
}

/// Resolve a month name prefix of at least three letters.
fn month_from_name(name: &str) -> Option<u32> {
    if name.len() < 3 {
        return None;
    }
    let lower = name.to_ascii_lowercase();
    MONTH_NAMES
        .iter()
        .position(|m| m.starts_with(&lower))
        .map(|i| (i + 1) as u32)
}

/// Parse a date from the front of `input`, returning the consumed length.
fn parse_date_prefix(input: &str) -> Option<(Date, usize)> {
    let bytes = input.as_bytes();
    let mut i = 0;

    // Month-first textual form: `mar-14-2015`.
    let alpha = scan_alpha(bytes);
    if alpha > 0 {
        let month = month_from_name(&input[..alpha])?;
        i = alpha;
        if !SEPARATORS.contains(bytes.get(i)?) {
            return None;
        }
        i += 1;
        let (day, n) = scan_uint(&bytes[i..], 2)?;
        i += n;
        if !SEPARATORS.contains(bytes.get(i)?) {
            return None;
        }
        i += 1;
        let (year, n) = scan_signed_year(&bytes[i..])?;
        i += n;
        return Date::from_ymd(year, month, day as u32).map(|d| (d, i));
    }

    // Year-first: `YYYY-MM-DD` or `YYYY-mon-DD`.
    let (year, n) = scan_signed_year(bytes)?;
    i += n;
    if !SEPARATORS.contains(bytes.get(i)?) {
        return None;
    }
    i += 1;
    let month = {
        let alpha = scan_alpha(&bytes[i..]);
        if alpha > 0 {
            let m = month_from_name(&input[i..i + alpha])?;
            i += alpha;
            m
        } else {
            let (m, n) = scan_uint(&bytes[i..], 2)?;
            i += n;
            m as u32
        }
    };
    if !SEPARATORS.contains(bytes.get(i)?) {
        return None;
    }
    i += 1;
    let (day, n) = scan_uint(&bytes[i..], 2)?;
    i += n;
    Date::from_ymd(year, month, day as u32).map(|d| (d, i))
}

fn scan_signed_year(bytes: &[u8]) -> Option<(i32, usize)> {
    let (neg, skip) = match bytes.first() {
        Some(b'-') => (true, 1),
        _ => (false, 0),
    };
    let (v, n) = scan_uint(&bytes[skip..], 7)?;
    let year = if neg { -(v as i32) } else { v as i32 };
    Some((year, skip + n))
}

/// Parse a daytime from the front of `input`, returning the consumed length.
fn parse_daytime_prefix(input: &str) -> Option<(Daytime, usize)> {
    let bytes = input.as_bytes();
    let mut i = 0;
    let (hour, n) = scan_uint(bytes, 2)?;
    i += n;
    if bytes.get(i) != Some(&b':') {
        return None;
    }
    i += 1;
    let (minute, n) = scan_uint(&bytes[i..], 2)?;
    i += n;
    let mut second = 0i64;
    let mut ms = 0u32;
    if bytes.get(i) == Some(&b':') {
        i += 1;
        let (s, n) = scan_uint(&bytes[i..], 2)?;
        second = s;
        i += n;
        if let Some(&sep @ (b'.' | b':')) = bytes.get(i) {
            // `:` doubles as the fraction separator in some emitters, but
            // only when digits actually follow.
            if let Some((frac, n)) = scan_uint(&bytes[i + 1..], 9) {
                let _ = sep;
                i += 1 + n;
                let mut v = frac;
                let mut digits = n;
                while digits > 3 {
                    v /= 10;
                    digits -= 1;
                }
                while digits < 3 {
                    v *= 10;
                    digits += 1;
                }
                ms = v as u32;
            } else if sep == b'.' {
                return None;
            }
        }
    }
    Daytime::from_hms_ms(hour as u32, minute as u32, second as u32, ms).map(|t| (t, i))
}

/// Parse a `GMT`/`UTC` marker and/or a `±HH[:]MM` offset in minutes.
fn parse_zone_prefix(input: &str) -> Option<(i32, usize)> {
    let bytes = input.as_bytes();
    let mut i = 0;
    let named = input.starts_with("GMT") || input.starts_with("UTC");
    if named {
        i += 3;
    }
    let sign = match bytes.get(i) {
        Some(b'+') => 1,
        Some(b'-') => -1,
        None if named => return Some((0, i)),
        _ => return None,
    };
    i += 1;
    let (hours, n) = scan_uint(&bytes[i..], 2)?;
    i += n;
    if bytes.get(i) == Some(&b':') {
        i += 1;
    }
    let (minutes, n) = scan_uint(&bytes[i..], 2)?;
    i += n;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some((sign * (hours * 60 + minutes) as i32, i))
}
