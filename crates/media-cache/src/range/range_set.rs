//! Canonical sets of downloaded byte intervals.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Interval covering `length` bytes from `offset`, saturating at `u64::MAX`.
    pub fn from_offset(offset: u64, length: u64) -> Self {
        Self::new(offset, offset.saturating_add(length))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Sorted set of non-overlapping, non-adjacent byte intervals.
///
/// Every mutation leaves the set canonical: intervals are sorted by start,
/// none is empty, and no two intervals overlap or touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `range`, merging it with any interval it overlaps or touches.
    pub fn merge(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        self.ranges.push(range);
        self.canonicalize();
    }

    /// Consuming variant of [`RangeSet::merge`].
    pub fn merged(mut self, range: ByteRange) -> Self {
        self.merge(range);
        self
    }

    fn canonicalize(&mut self) {
        self.ranges.retain(|r| !r.is_empty());
        self.ranges.sort_unstable_by_key(|r| (r.start, r.end));

        let mut merged: Vec<ByteRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                // Adjacent intervals describe contiguous bytes and merge too.
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    /// Index of the interval containing `offset`, if any.
    fn find(&self, offset: u64) -> Option<&ByteRange> {
        let idx = self.ranges.partition_point(|r| r.start <= offset);
        idx.checked_sub(1)
            .map(|i| &self.ranges[i])
            .filter(|r| r.contains(offset))
    }

    /// True iff every byte in `[offset, offset + length)` is present.
    pub fn covers(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        let end = offset.saturating_add(length);
        self.find(offset).is_some_and(|r| r.end >= end)
    }

    /// True iff a stored interval starting at byte 0 reaches `length`.
    pub fn covers_initial(&self, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        self.ranges
            .first()
            .is_some_and(|r| r.start == 0 && r.end >= length)
    }

    /// Lowest offset `>= offset` that is not covered.
    pub fn first_gap_from(&self, offset: u64) -> u64 {
        self.find(offset).map_or(offset, |r| r.end)
    }

    /// Start of the first interval beginning strictly after `offset`.
    pub fn next_covered_after(&self, offset: u64) -> Option<u64> {
        let idx = self.ranges.partition_point(|r| r.start <= offset);
        self.ranges.get(idx).map(|r| r.start)
    }

    pub fn total_covered(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }
}

impl FromIterator<ByteRange> for RangeSet {
    fn from_iter<T: IntoIterator<Item = ByteRange>>(iter: T) -> Self {
        let mut set = RangeSet {
            ranges: iter.into_iter().collect(),
        };
        set.canonicalize();
        set
    }
}

// Persisted as a list of `[start, end]` pairs. Loading canonicalizes again so a
// stale or hand-edited record cannot break the invariant.
impl Serialize for RangeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(u64, u64)> = self.ranges.iter().map(|r| (r.start, r.end)).collect();
        pairs.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RangeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(u64, u64)>::deserialize(deserializer)?;
        Ok(pairs
            .into_iter()
            .map(|(start, end)| ByteRange::new(start, end))
            .collect())
    }
}
