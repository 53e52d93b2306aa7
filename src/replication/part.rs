//! Part identity: names, block ranges, containment.
//!
//! A part is an immutable sorted row range on disk. The control plane never
//! looks inside one; it only needs the attributes encoded in the name plus the
//! size and checksums the store reports.
//!
//! # Name Format
//!
//! `<partition>_<left>_<right>_<level>`, e.g. `20210101_0_1_1`:
//!
//! - `partition`: the date-derived partition id (opaque string, no `_`)
//! - `left`, `right`: the inclusive block-number range the part covers
//! - `level`: how many merge generations produced it (0 = freshly inserted)
//!
//! Names order parts of one partition by range, and a merge of
//! `[a_l..a_r]` and `[b_l..b_r]` produces `[a_l..b_r]` at
//! `max(level) + 1`.

use std::fmt;

/// Identity and size of one data part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// Partition id (derived from the date column; opaque here).
    pub partition: String,
    /// First block number covered, inclusive.
    pub left: u64,
    /// Last block number covered, inclusive.
    pub right: u64,
    /// Merge depth.
    pub level: u32,
    /// Size in granules; multiplied by the index granularity it approximates
    /// the byte size the merge selector budgets against.
    pub size: u64,
}

impl PartInfo {
    /// Canonical name of this part.
    pub fn name(&self) -> String {
        format!("{}_{}_{}_{}", self.partition, self.left, self.right, self.level)
    }

    /// Parse a part name. Returns `None` if the name is not well-formed.
    ///
    /// The parsed `size` is zero: size is a store attribute, not part of the
    /// name.
    pub fn parse(name: &str) -> Option<PartInfo> {
        let mut it = name.rsplitn(4, '_');
        let level = it.next()?.parse().ok()?;
        let right = it.next()?.parse().ok()?;
        let left = it.next()?.parse().ok()?;
        let partition = it.next()?;
        if partition.is_empty() {
            return None;
        }
        Some(PartInfo {
            partition: partition.to_string(),
            left,
            right,
            level,
            size: 0,
        })
    }

    /// Whether this part's range contains `other`'s range.
    ///
    /// Containment is only defined within a partition; parts of different
    /// partitions never contain each other.
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.partition == other.partition && self.left <= other.left && other.right <= self.right
    }

    /// Name of the part produced by merging `parts` (which must be non-empty,
    /// same-partition, and ordered by range).
    pub fn merged_name(parts: &[PartInfo]) -> Option<String> {
        let first = parts.first()?;
        let last = parts.last()?;
        let level = parts.iter().map(|p| p.level).max()? + 1;
        Some(format!("{}_{}_{}_{}", first.partition, first.left, last.right, level))
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
