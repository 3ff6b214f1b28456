//! Sets of user/group IDs as sorted, disjoint half-open intervals.
//!
//! The automatic user-namespace allocator works on these sets: the host-side
//! pool is the configured subordinate ranges minus the ranges already handed
//! to containers, and `find_available` + `zip` turn that pool into concrete
//! UID/GID mappings.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};

/// One contiguous run of IDs mapped between a container and the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    #[serde(rename = "container_id")]
    pub container_id: u32,
    #[serde(rename = "host_id")]
    pub host_id: u32,
    pub size: u32,
}

/// A half-open interval `[start, end)`. Always non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: u32,
    pub end: u32,
}

impl Interval {
    fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start)
    }

    fn intersects(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A set of IDs held as sorted, disjoint, coalesced intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ranges: Vec<Interval>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from `(start, end)` pairs; overlapping input is unioned.
    pub fn from_ranges<I: IntoIterator<Item = (u32, u32)>>(ranges: I) -> Self {
        let mut set = Self::new();
        for (start, end) in ranges {
            if start < end {
                set.insert(Interval { start, end });
            }
        }
        set
    }

    /// The host-side IDs covered by a mapping list.
    pub fn host_ids(maps: &[IdMap]) -> Self {
        Self::from_ranges(
            maps.iter()
                .map(|m| (m.host_id, m.host_id.saturating_add(m.size))),
        )
    }

    /// The container-side IDs covered by a mapping list.
    pub fn container_ids(maps: &[IdMap]) -> Self {
        Self::from_ranges(
            maps.iter()
                .map(|m| (m.container_id, m.container_id.saturating_add(m.size))),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of IDs in the set.
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(Interval::len).sum()
    }

    pub fn ranges(&self) -> &[Interval] {
        &self.ranges
    }

    /// Insert one interval, merging with neighbours to keep the invariant.
    fn insert(&mut self, iv: Interval) {
        let mut merged = iv;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for r in &self.ranges {
            if r.end < merged.start || (r.end == merged.start && !placed) {
                // entirely before, or adjacent on the left
                if r.end == merged.start {
                    merged.start = r.start;
                } else {
                    out.push(*r);
                }
            } else if merged.end < r.start {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(*r);
            } else {
                // overlapping or adjacent on the right
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// The set of IDs in either `self` or `other`.
    pub fn union(&self, other: &IdSet) -> IdSet {
        let mut out = self.clone();
        for r in &other.ranges {
            out.insert(*r);
        }
        out
    }

    /// The set of IDs in `self` but not in `other`.
    pub fn subtract(&self, other: &IdSet) -> IdSet {
        let mut out = Vec::new();
        for r in &self.ranges {
            let mut cur = *r;
            for s in &other.ranges {
                if s.end <= cur.start {
                    continue;
                }
                if s.start >= cur.end {
                    break;
                }
                if s.start > cur.start {
                    out.push(Interval {
                        start: cur.start,
                        end: s.start,
                    });
                }
                if s.end >= cur.end {
                    cur.start = cur.end; // fully consumed
                    break;
                }
                cur.start = s.end;
            }
            if cur.start < cur.end {
                out.push(cur);
            }
        }
        IdSet { ranges: out }
    }

    /// Greedily take the `n` lowest IDs in the set.
    ///
    /// Fails with [`StoreError::NoAvailableIds`] when the set holds fewer
    /// than `n` IDs.
    pub fn find_available(&self, n: u32) -> Result<IdSet> {
        let mut needed = u64::from(n);
        let mut out = Vec::new();
        for r in &self.ranges {
            if needed == 0 {
                break;
            }
            let take = needed.min(r.len());
            out.push(Interval {
                start: r.start,
                end: r.start + take as u32,
            });
            needed -= take;
        }
        if needed > 0 {
            return Err(StoreError::NoAvailableIds);
        }
        Ok(IdSet { ranges: out })
    }

    /// Pair off this (host-side) set against a container-side set of the
    /// same size, producing minimal mapping triples, smallest IDs first.
    pub fn zip(&self, container: &IdSet) -> Vec<IdMap> {
        let mut out = Vec::new();
        let mut host = self.ranges.iter().copied();
        let mut cont = container.ranges.iter().copied();
        let (mut h, mut c) = (host.next(), cont.next());
        while let (Some(hr), Some(cr)) = (h, c) {
            let size = hr.len().min(cr.len()) as u32;
            out.push(IdMap {
                container_id: cr.start,
                host_id: hr.start,
                size,
            });
            h = if hr.len() == u64::from(size) {
                host.next()
            } else {
                Some(Interval {
                    start: hr.start + size,
                    end: hr.end,
                })
            };
            c = if cr.len() == u64::from(size) {
                cont.next()
            } else {
                Some(Interval {
                    start: cr.start + size,
                    end: cr.end,
                })
            };
        }
        out
    }
}

/// Reject mapping lists in which ranges overlap on either side.
pub fn has_overlapping_ranges(uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Result<()> {
    for maps in [uid_maps, gid_maps] {
        for side in [false, true] {
            let mut seen: Vec<Interval> = Vec::new();
            for m in maps {
                let start = if side { m.host_id } else { m.container_id };
                let iv = Interval {
                    start,
                    end: start.saturating_add(m.size),
                };
                if seen.iter().any(|s| s.intersects(&iv)) {
                    return Err(StoreError::InvalidMappings(format!(
                        "{} ID range {}-{} overlaps another range",
                        if side { "host" } else { "container" },
                        iv.start,
                        iv.end
                    )));
                }
                seen.push(iv);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u32, u32)]) -> IdSet {
        IdSet::from_ranges(ranges.iter().copied())
    }

    #[test]
    fn test_insert_coalesces() {
        let s = set(&[(10, 20), (20, 30), (5, 8)]);
        assert_eq!(s.ranges(), &[
            Interval { start: 5, end: 8 },
            Interval { start: 10, end: 30 },
        ]);
        assert_eq!(s.size(), 23);
    }

    #[test]
    fn test_union_overlapping() {
        let a = set(&[(0, 10), (20, 30)]);
        let b = set(&[(5, 25)]);
        assert_eq!(a.union(&b), set(&[(0, 30)]));
    }

    #[test]
    fn test_subtract_splits_ranges() {
        let a = set(&[(0, 100)]);
        let b = set(&[(10, 20), (30, 40)]);
        assert_eq!(a.subtract(&b), set(&[(0, 10), (20, 30), (40, 100)]));
        assert_eq!(a.subtract(&a), IdSet::new());
        assert_eq!(set(&[(5, 15)]).subtract(&set(&[(0, 100)])), IdSet::new());
    }

    #[test]
    fn test_find_available_takes_lowest() {
        let s = set(&[(100, 105), (200, 300)]);
        let got = s.find_available(10).unwrap();
        assert_eq!(got, set(&[(100, 105), (200, 205)]));
        assert!(matches!(
            s.find_available(1000),
            Err(StoreError::NoAvailableIds)
        ));
    }

    #[test]
    fn test_zip_pairs_minimal_runs() {
        let host = set(&[(100000, 100500), (200000, 200500)]);
        let container = set(&[(0, 1000)]);
        assert_eq!(host.zip(&container), vec![
            IdMap { container_id: 0, host_id: 100000, size: 500 },
            IdMap { container_id: 500, host_id: 200000, size: 500 },
        ]);
    }

    #[test]
    fn test_overlap_validation() {
        let ok = vec![
            IdMap { container_id: 0, host_id: 100000, size: 1000 },
            IdMap { container_id: 1000, host_id: 200000, size: 1000 },
        ];
        assert!(has_overlapping_ranges(&ok, &ok).is_ok());

        let bad = vec![
            IdMap { container_id: 0, host_id: 100000, size: 1000 },
            IdMap { container_id: 500, host_id: 300000, size: 1000 },
        ];
        assert!(matches!(
            has_overlapping_ranges(&bad, &[]),
            Err(StoreError::InvalidMappings(_))
        ));
    }
}
