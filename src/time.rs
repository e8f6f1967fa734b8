//! Packed DOS date and time.
//!
//! Directory entries store timestamps as two 16-bit words:
//!
//! - date: `(year - 1980) << 9 | month << 5 | day`
//! - time: `hour << 11 | minute << 5 | second / 2`
//!
//! Seconds therefore have 2-second granularity; the creation timestamp
//! additionally carries a tenths-of-a-second byte (0..=199, units of 10 ms)
//! which holds the odd second. Odd seconds round down on store and the
//! stored value is never re-rounded on read.
//!
//! Stored dates of 0x0000 or 0xFFFF, and any field outside its valid range,
//! decode to the epoch, 1980-01-01T00:00:00 in the volume's local time.

use alloc::sync::Arc;

/// First representable year; also the sentinel for invalid stored dates.
pub const EPOCH_YEAR: u16 = 1980;
/// Last representable year, `1980 + 127`.
pub const MAX_YEAR: u16 = 2107;

/// A civil timestamp with 1-second resolution, in the volume's local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp {
        year: EPOCH_YEAR,
        month: 1,
        day: 1,
        hour: 0,
        minute: 0,
        second: 0,
    };

    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    /// The date part with the time cleared, as stored in access-date fields.
    pub fn date_only(self) -> Self {
        Self {
            hour: 0,
            minute: 0,
            second: 0,
            ..self
        }
    }

    fn in_range(&self) -> bool {
        (EPOCH_YEAR..=MAX_YEAR).contains(&self.year)
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour < 24
            && self.minute < 60
            && self.second < 60
    }
}

fn try_decode_date(raw: u16) -> Option<Timestamp> {
    if raw == 0x0000 || raw == 0xFFFF {
        return None;
    }
    let ts = Timestamp {
        year: EPOCH_YEAR + (raw >> 9),
        month: ((raw >> 5) & 0x0F) as u8,
        day: (raw & 0x1F) as u8,
        hour: 0,
        minute: 0,
        second: 0,
    };
    ts.in_range().then_some(ts)
}

/// Decode a packed date word. Invalid values yield the epoch date.
pub fn decode_date(raw: u16) -> Timestamp {
    try_decode_date(raw).unwrap_or(Timestamp::EPOCH)
}

/// Decode packed date and time words, plus a creation-tenths byte.
///
/// `tenths` contributes the odd second: stored seconds count in units of 2,
/// and 100..=199 tenths add one second back. An invalid date makes the whole
/// value the epoch; an invalid time keeps the date with the time cleared.
pub fn decode_date_time(date: u16, time: u16, tenths: u8) -> Timestamp {
    let Some(d) = try_decode_date(date) else {
        return Timestamp::EPOCH;
    };
    let extra = if tenths <= 199 { tenths / 100 } else { 0 };
    let ts = Timestamp {
        hour: (time >> 11) as u8,
        minute: ((time >> 5) & 0x3F) as u8,
        second: ((time & 0x1F) as u8) * 2 + extra,
        ..d
    };
    if ts.in_range() {
        ts
    } else {
        d
    }
}

/// Encode the date part. Years before the epoch clamp to the epoch; years
/// past 2107 clamp to 2107-12-31.
pub fn encode_date(ts: Timestamp) -> u16 {
    let ts = clamp(ts);
    (ts.year - EPOCH_YEAR) << 9 | (ts.month as u16) << 5 | ts.day as u16
}

/// Encode the time part. The odd second is dropped here and carried by the
/// tenths byte when the field has one.
pub fn encode_time(ts: Timestamp) -> u16 {
    let ts = clamp(ts);
    (ts.hour as u16) << 11 | (ts.minute as u16) << 5 | (ts.second as u16) / 2
}

/// The creation-tenths byte for a timestamp: the odd second, in 10 ms units.
pub fn encode_tenths(ts: Timestamp) -> u8 {
    (clamp(ts).second % 2) * 100
}

fn clamp(ts: Timestamp) -> Timestamp {
    if ts.year < EPOCH_YEAR {
        return Timestamp::EPOCH;
    }
    if ts.year > MAX_YEAR {
        return Timestamp::new(MAX_YEAR, 12, 31, 23, 59, 59);
    }
    ts
}

/// Source of "now" in the volume's local-time convention.
///
/// The volume owns the UTC-offset policy; implementations return local civil
/// time directly. Freestanding targets without a clock can mount with
/// [`FixedClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// A clock pinned to one instant.
pub struct FixedClock(pub Timestamp);

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}

/// The default clock for mounts that do not supply one.
pub fn epoch_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(Timestamp::EPOCH))
}
