//! Host-side value model.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

pub type Oid = u32;

/// Days between 1970-01-01 and the host epoch 2000-01-01.
pub const HOST_EPOCH_DAYS: i64 = 10_957;
/// Milliseconds between 1970-01-01 and 2000-01-01.
pub const HOST_EPOCH_MILLIS: i64 = HOST_EPOCH_DAYS * 86_400_000;

#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(Oid),
    Float4(f32),
    Float8(f64),
    /// Decimal text, e.g. `"12.50"`.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    /// json and jsonb documents as text.
    Json(String),
    /// Days since 2000-01-01.
    Date(i32),
    /// Microseconds since 2000-01-01 00:00:00 UTC.
    Timestamp(i64),
    Array(ArrayDatum),
    Row(RowDatum),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Datum::Text(value.into())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayDatum {
    pub element_type: Oid,
    pub dims: Vec<usize>,
    pub lower_bounds: Vec<i32>,
    /// Row-major elements; null slots hold `Datum::Null`.
    pub values: Vec<Datum>,
    pub nulls: Vec<bool>,
}

impl ArrayDatum {
    /// One-dimensional array; `Datum::Null` entries are recorded in the null bitmap.
    pub fn from_values(element_type: Oid, values: Vec<Datum>) -> Self {
        let nulls = values.iter().map(Datum::is_null).collect();
        let dims = if values.is_empty() {
            Vec::new()
        } else {
            vec![values.len()]
        };
        let lower_bounds = dims.iter().map(|_| 1).collect();
        Self {
            element_type,
            dims,
            lower_bounds,
            values,
            nulls,
        }
    }

    pub fn empty(element_type: Oid) -> Self {
        Self::from_values(element_type, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        if *self.nulls.get(idx)? {
            return None;
        }
        self.values.get(idx)
    }
}

/// Composite value; `values` follow the attribute order of the row type, dropped slots included.
#[derive(Clone, Debug, PartialEq)]
pub struct RowDatum {
    pub type_id: Oid,
    pub values: Vec<Datum>,
}

pub fn date_to_unix_millis(days: i32) -> f64 {
    (days as i64 + HOST_EPOCH_DAYS) as f64 * 86_400_000.0
}

pub fn timestamp_to_unix_millis(micros: i64) -> f64 {
    micros.div_euclid(1000) as f64 + HOST_EPOCH_MILLIS as f64 + micros.rem_euclid(1000) as f64 / 1000.0
}

pub fn unix_millis_to_date(millis: f64) -> Option<i32> {
    if !millis.is_finite() {
        return None;
    }
    let days = (millis / 86_400_000.0).floor() as i64 - HOST_EPOCH_DAYS;
    i32::try_from(days).ok()
}

pub fn unix_millis_to_timestamp(millis: f64) -> Option<i64> {
    if !millis.is_finite() {
        return None;
    }
    let micros = ((millis - HOST_EPOCH_MILLIS as f64) * 1000.0).round();
    if micros.abs() > i64::MAX as f64 {
        return None;
    }
    Some(micros as i64)
}

fn host_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// `None` when the day count falls outside the calendar chrono can represent.
pub fn format_date(days: i32) -> Option<String> {
    let date = host_epoch()
        .date()
        .checked_add_signed(Duration::days(days as i64))?;
    Some(date.format("%Y-%m-%d").to_string())
}

pub fn format_timestamp(micros: i64) -> Option<String> {
    let stamp = host_epoch().checked_add_signed(Duration::microseconds(micros))?;
    Some(stamp.format("%Y-%m-%dT%H:%M:%S%.fZ").to_string())
}

pub fn parse_date(text: &str) -> Option<i32> {
    let trimmed = text.trim();
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp_naive(trimmed).map(|stamp| stamp.date()))?;
    let days = (date - host_epoch().date()).num_days();
    i32::try_from(days).ok()
}

pub fn parse_timestamp(text: &str) -> Option<i64> {
    let stamp = parse_timestamp_naive(text.trim())?;
    (stamp - host_epoch()).num_microseconds()
}

fn parse_timestamp_naive(text: &str) -> Option<NaiveDateTime> {
    if let Ok(stamp) = DateTime::parse_from_rfc3339(text) {
        return Some(stamp.with_timezone(&Utc).naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(text, format) {
            return Some(stamp);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_epoch_rebases_to_unix_millis() {
        assert_eq!(date_to_unix_millis(0), 946_684_800_000.0);
        assert_eq!(unix_millis_to_date(946_684_800_000.0), Some(0));
        assert_eq!(unix_millis_to_date(946_684_799_999.0), Some(-1));
        assert_eq!(timestamp_to_unix_millis(1_500), 946_684_800_001.5);
        assert_eq!(unix_millis_to_timestamp(946_684_800_001.5), Some(1_500));
    }

    #[test]
    fn text_forms_parse_and_format() {
        let days = parse_date("2024-02-29").expect("parse date");
        assert_eq!(format_date(days).as_deref(), Some("2024-02-29"));
        let micros = parse_timestamp("2000-01-02 00:00:01.25").expect("parse timestamp");
        assert_eq!(micros, 86_401_250_000);
        assert_eq!(format_timestamp(micros).as_deref(), Some("2000-01-02T00:00:01.250Z"));
        assert_eq!(parse_timestamp("2000-01-01T01:00:00+01:00"), Some(0));
        assert!(parse_date("yesterday").is_none());
    }

    #[test]
    fn out_of_calendar_values_do_not_format() {
        assert_eq!(format_date(i32::MAX), None);
        assert_eq!(format_timestamp(i64::MAX), None);
        let far = unix_millis_to_timestamp(8.5e15).expect("fits in micros");
        assert_eq!(format_timestamp(far), None);
    }

    #[test]
    fn array_null_bitmap_tracks_null_elements() {
        let array = ArrayDatum::from_values(25, vec![Datum::text("a"), Datum::Null]);
        assert_eq!(array.dims, vec![2]);
        assert_eq!(array.nulls, vec![false, true]);
        assert_eq!(array.get(0), Some(&Datum::text("a")));
        assert_eq!(array.get(1), None);
        assert!(ArrayDatum::empty(25).dims.is_empty());
    }
}
