//! Date-time validity range
//!
//! Prices and other time-bounded data carry an optional validity window.
//! A window may be unbounded on either side; both bounds are inclusive.
//!
//! ## Usage
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use entidb_core::DateTimeRange;
//!
//! let range = DateTimeRange::between(
//!     Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap(),
//!     Utc.with_ymd_and_hms(2012, 12, 31, 23, 59, 59).unwrap(),
//! );
//! assert!(range.is_valid_at(Utc.with_ymd_and_hms(2011, 6, 1, 0, 0, 0).unwrap()));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive date-time range with optional bounds
///
/// ## Invariants
///
/// - `from <= to` whenever both bounds are present
/// - A missing bound means "unbounded" on that side
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateTimeRange {
    /// Lower bound (inclusive), unbounded when absent
    from: Option<DateTime<Utc>>,
    /// Upper bound (inclusive), unbounded when absent
    to: Option<DateTime<Utc>>,
}

impl DateTimeRange {
    /// Create a range bounded on both sides
    ///
    /// Bounds are swapped if passed in reverse order.
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        if from <= to {
            DateTimeRange {
                from: Some(from),
                to: Some(to),
            }
        } else {
            DateTimeRange {
                from: Some(to),
                to: Some(from),
            }
        }
    }

    /// Create a range valid from the given moment onwards
    pub fn since(from: DateTime<Utc>) -> Self {
        DateTimeRange {
            from: Some(from),
            to: None,
        }
    }

    /// Create a range valid up to the given moment
    pub fn until(to: DateTime<Utc>) -> Self {
        DateTimeRange {
            from: None,
            to: Some(to),
        }
    }

    /// Lower bound, if any
    #[inline]
    pub fn from(&self) -> Option<DateTime<Utc>> {
        self.from
    }

    /// Upper bound, if any
    #[inline]
    pub fn to(&self) -> Option<DateTime<Utc>> {
        self.to
    }

    /// Check whether the range contains the given moment
    pub fn is_valid_at(&self, moment: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| from <= moment) && self.to.map_or(true, |to| moment <= to)
    }

    /// Check whether the range has no upper bound
    #[inline]
    pub fn is_open_ended(&self) -> bool {
        self.to.is_none()
    }

    /// Check whether two ranges share at least one moment
    pub fn overlaps(&self, other: &DateTimeRange) -> bool {
        let starts_before_other_ends = match (self.from, other.to) {
            (Some(from), Some(to)) => from <= to,
            _ => true,
        };
        let ends_after_other_starts = match (self.to, other.from) {
            (Some(to), Some(from)) => from <= to,
            _ => true,
        };
        starts_before_other_ends && ends_after_other_starts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn moment(year: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_between_contains_inner_moment() {
        let range = DateTimeRange::between(moment(2010), moment(2012));
        assert!(range.is_valid_at(moment(2011)));
        assert!(!range.is_valid_at(moment(2013)));
        assert!(!range.is_valid_at(moment(2009)));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let range = DateTimeRange::between(moment(2010), moment(2012));
        assert!(range.is_valid_at(moment(2010)));
        assert!(range.is_valid_at(moment(2012)));
    }

    #[test]
    fn test_between_swaps_reversed_bounds() {
        let range = DateTimeRange::between(moment(2012), moment(2010));
        assert_eq!(range.from(), Some(moment(2010)));
        assert_eq!(range.to(), Some(moment(2012)));
    }

    #[test]
    fn test_since_is_open_ended() {
        let range = DateTimeRange::since(moment(2010));
        assert!(range.is_open_ended());
        assert!(range.is_valid_at(moment(2050)));
        assert!(!range.is_valid_at(moment(2009)));
    }

    #[test]
    fn test_until_is_not_open_ended() {
        let range = DateTimeRange::until(moment(2012));
        assert!(!range.is_open_ended());
        assert!(range.is_valid_at(moment(1990)));
        assert!(!range.is_valid_at(moment(2013)));
    }

    #[test]
    fn test_overlaps_shared_span() {
        let a = DateTimeRange::between(moment(2010), moment(2012));
        let b = DateTimeRange::between(moment(2011), moment(2015));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn test_overlaps_disjoint_spans() {
        let a = DateTimeRange::between(moment(2010), moment(2012));
        let b = DateTimeRange::between(moment(2013), moment(2015));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn test_overlaps_unbounded_sides() {
        let open = DateTimeRange::since(moment(2014));
        let closed = DateTimeRange::between(moment(2010), moment(2012));
        assert!(!open.overlaps(&closed));

        let open = DateTimeRange::since(moment(2011));
        assert!(open.overlaps(&closed));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let range = DateTimeRange::between(moment(2010), moment(2012));
        let json = serde_json::to_string(&range).unwrap();
        let restored: DateTimeRange = serde_json::from_str(&json).unwrap();
        assert_eq!(range, restored);
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    proptest! {
        #[test]
        fn prop_overlap_is_symmetric(a in 0i64..100_000, b in 0i64..100_000, c in 0i64..100_000, d in 0i64..100_000) {
            let first = DateTimeRange::between(at(a), at(b));
            let second = DateTimeRange::between(at(c), at(d));
            prop_assert_eq!(first.overlaps(&second), second.overlaps(&first));
        }

        #[test]
        fn prop_validity_matches_bounds(a in 0i64..100_000, b in 0i64..100_000, probe in 0i64..100_000) {
            let range = DateTimeRange::between(at(a), at(b));
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert_eq!(range.is_valid_at(at(probe)), low <= probe && probe <= high);
        }

        #[test]
        fn prop_range_overlaps_itself(a in 0i64..100_000, b in 0i64..100_000) {
            let range = DateTimeRange::between(at(a), at(b));
            prop_assert!(range.overlaps(&range));
        }
    }
}
