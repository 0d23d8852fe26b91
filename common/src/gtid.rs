//! GTID set arithmetic used to choose a member recovery method.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A set of global transaction identifiers, as found in `gtid_executed`.
///
/// Intervals are kept sorted and merged per source UUID, so two sets holding
/// the same transactions compare equal regardless of their textual form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    intervals: BTreeMap<String, Vec<(u64, u64)>>,
}

/// Error returned when a GTID set string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid GTID set '{input}': {reason}")]
pub struct GtidParseError {
    pub input: String,
    pub reason: String,
}

impl GtidSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `uuid:1-5:7,uuid2:1-3`. Whitespace and newlines are ignored.
    pub fn parse(s: &str) -> Result<Self, GtidParseError> {
        let err = |reason: &str| GtidParseError {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let mut set = Self::new();
        if compact.is_empty() {
            return Ok(set);
        }

        for member in compact.split(',') {
            let mut parts = member.split(':');
            let uuid = parts
                .next()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| err("missing source uuid"))?
                .to_ascii_lowercase();

            let mut any = false;
            for range in parts {
                any = true;
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (
                        a.parse::<u64>().map_err(|_| err("bad interval start"))?,
                        b.parse::<u64>().map_err(|_| err("bad interval end"))?,
                    ),
                    None => {
                        let n = range.parse::<u64>().map_err(|_| err("bad transaction id"))?;
                        (n, n)
                    }
                };
                if start == 0 || end < start {
                    return Err(err("interval out of order"));
                }
                set.insert_interval(&uuid, start, end);
            }

            if !any {
                return Err(err("source uuid without intervals"));
            }
        }

        Ok(set)
    }

    /// Whether the set holds no transactions.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total number of transactions in the set.
    pub fn count(&self) -> u64 {
        self.intervals
            .values()
            .flat_map(|ranges| ranges.iter())
            .map(|(a, b)| b - a + 1)
            .sum()
    }

    /// Add a closed interval of transaction numbers for a source.
    pub fn insert_interval(&mut self, uuid: &str, start: u64, end: u64) {
        let ranges = self.intervals.entry(uuid.to_ascii_lowercase()).or_default();
        ranges.push((start, end));
        ranges.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for &(a, b) in ranges.iter() {
            match merged.last_mut() {
                Some(last) if a <= last.1.saturating_add(1) => last.1 = last.1.max(b),
                _ => merged.push((a, b)),
            }
        }
        *ranges = merged;
    }

    /// Whether every transaction in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.intervals.iter().all(|(uuid, ranges)| {
            let Some(theirs) = other.intervals.get(uuid) else {
                return false;
            };
            ranges
                .iter()
                .all(|&(a, b)| theirs.iter().any(|&(c, d)| c <= a && b <= d))
        })
    }

    /// Union of two sets.
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for (uuid, ranges) in &other.intervals {
            for &(a, b) in ranges {
                result.insert_interval(uuid, a, b);
            }
        }
        result
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, ranges) in &self.intervals {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", uuid)?;
            for &(a, b) in ranges {
                if a == b {
                    write!(f, ":{}", a)?;
                } else {
                    write!(f, ":{}-{}", a, b)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = GtidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

    #[test]
    fn test_parse_and_display() {
        let set = GtidSet::parse(&format!("{A}:1-5:7, {B}:1-3")).unwrap();
        assert_eq!(set.to_string(), format!("{A}:1-5:7,{B}:1-3"));
        assert_eq!(set.count(), 9);
    }

    #[test]
    fn test_adjacent_intervals_merge() {
        let set = GtidSet::parse(&format!("{A}:1-3:4-6:8")).unwrap();
        assert_eq!(set.to_string(), format!("{A}:1-6:8"));
    }

    #[test]
    fn test_empty_set() {
        let set = GtidSet::parse("  \n").unwrap();
        assert!(set.is_empty());
        assert!(set.is_subset_of(&GtidSet::parse(&format!("{A}:1")).unwrap()));
    }

    #[test]
    fn test_subset() {
        let group = GtidSet::parse(&format!("{A}:1-100,{B}:1-10")).unwrap();
        let behind = GtidSet::parse(&format!("{A}:1-40")).unwrap();
        let errant = GtidSet::parse(&format!("{A}:1-40,{B}:11")).unwrap();

        assert!(behind.is_subset_of(&group));
        assert!(!errant.is_subset_of(&group));
        assert!(!group.is_subset_of(&behind));
    }

    #[test]
    fn test_union() {
        let a = GtidSet::parse(&format!("{A}:1-5")).unwrap();
        let b = GtidSet::parse(&format!("{A}:6-9,{B}:1")).unwrap();
        assert_eq!(a.union(&b).to_string(), format!("{A}:1-9,{B}:1"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(GtidSet::parse(&format!("{A}")).is_err());
        assert!(GtidSet::parse(&format!("{A}:5-1")).is_err());
        assert!(GtidSet::parse(&format!("{A}:0")).is_err());
        assert!(GtidSet::parse(":1-2").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_set() -> impl Strategy<Value = GtidSet> {
            prop::collection::vec((0usize..2, 1u64..50, 0u64..10), 0..6).prop_map(|ranges| {
                let mut set = GtidSet::new();
                for (src, start, len) in ranges {
                    set.insert_interval([A, B][src], start, start + len);
                }
                set
            })
        }

        proptest! {
            #[test]
            fn union_contains_both_operands(a in arb_set(), b in arb_set()) {
                let u = a.union(&b);
                prop_assert!(a.is_subset_of(&u));
                prop_assert!(b.is_subset_of(&u));
            }

            #[test]
            fn display_reparses_to_same_set(a in arb_set()) {
                prop_assert_eq!(GtidSet::parse(&a.to_string()).unwrap(), a);
            }
        }
    }
}
