//! Canonical interval sets over sector numbers
//!
//! An [`IntervalSet`] is a collection of disjoint, non-adjacent closed
//! sector ranges, kept canonical on every mutation: inserting coalesces
//! with touching neighbors, removing splits the intervals it cuts
//! through. The stress driver keeps two of these, LIVE and FREE, which
//! always partition the device's sector space.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed inclusive sector range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    /// Closed range `[start, end]`; `start <= end` is required.
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "interval start {start} > end {end}");
        Self { start, end }
    }

    /// Range of `count` sectors starting at `sector`.
    pub fn span(sector: u64, count: u64) -> Self {
        assert!(count > 0, "empty interval");
        Self::new(sector, sector + count - 1)
    }

    /// Number of sectors in the range (never zero; the range is closed).
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Ordered set of disjoint, non-adjacent closed intervals,
/// keyed by interval start.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntervalSet {
    // start -> inclusive end
    map: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `iv`, coalescing with any overlapping or adjacent intervals.
    pub fn insert(&mut self, iv: Interval) {
        let mut start = iv.start;
        let mut end = iv.end;

        // Predecessor that overlaps or touches the new start.
        if let Some((&s, &e)) = self.map.range(..=start).next_back() {
            if e.saturating_add(1) >= start {
                start = s;
                end = end.max(e);
                self.map.remove(&s);
            }
        }
        // Successors that begin inside or adjacent to the merged range.
        let absorbed: Vec<u64> = self
            .map
            .range(start..)
            .take_while(|(&s, _)| s <= end.saturating_add(1))
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.map.remove(&s) {
                end = end.max(e);
            }
        }
        self.map.insert(start, end);
    }

    /// Remove every sector of `iv`, splitting intervals it cuts through.
    pub fn remove(&mut self, iv: Interval) {
        let overlapping: Vec<(u64, u64)> = {
            let mut found = Vec::new();
            // All intervals starting at or before iv.end can overlap;
            // walk backwards and stop at the first that ends before
            // iv.start.
            for (&s, &e) in self.map.range(..=iv.end).rev() {
                if e < iv.start {
                    break;
                }
                found.push((s, e));
            }
            found
        };
        for (s, e) in overlapping {
            self.map.remove(&s);
            if s < iv.start {
                self.map.insert(s, iv.start - 1);
            }
            if e > iv.end {
                self.map.insert(iv.end + 1, e);
            }
        }
    }

    /// Whether every sector of `iv` is in the set.
    pub fn covers(&self, iv: Interval) -> bool {
        match self.map.range(..=iv.start).next_back() {
            Some((_, &e)) => e >= iv.end,
            None => false,
        }
    }

    pub fn contains(&self, sector: u64) -> bool {
        self.covers(Interval::new(sector, sector))
    }

    /// Maximal intervals in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Interval> + '_ {
        self.map
            .iter()
            .map(|(&start, &end)| Interval { start, end })
    }

    /// Total number of sectors in the set.
    pub fn total_sectors(&self) -> u64 {
        self.map.iter().map(|(&s, &e)| e - s + 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Snapshot for serialization.
    pub fn to_intervals(&self) -> Vec<Interval> {
        self.iter().collect()
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(f, "{{")?;
        for iv in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{iv}")?;
            first = false;
        }
        write!(f, "}}")
    }
}
