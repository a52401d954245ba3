use super::{address, policy::PolicyId, Error};
use rangemap::RangeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start: address,
    pub end: address,
    pub policy: PolicyId,
}

/// Maps address ranges to the policy serving them.
#[derive(Debug, Default)]
pub struct SegmentTable {
    ranges: RangeMap<address, SegmentId>,
    segments: Vec<Segment>,
}

impl SegmentTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the range `[start, end)`.
    ///
    /// Segments must not overlap.
    pub fn create(&mut self, start: address, end: address, policy: PolicyId) -> Result<SegmentId, Error> {
        let range = start..end;
        if range.is_empty() || self.ranges.overlaps(&range) {
            return Err(Error::SegmentOverlap { start, end });
        }
        let id = SegmentId(self.segments.len());
        self.segments.push(Segment { start, end, policy });
        self.ranges.insert(range, id);
        log::debug!(
            "segment {:?} [{:#x}, {:#x}) served by {:?}",
            id,
            start,
            end,
            policy
        );
        Ok(id)
    }

    /// Policy serving the segment containing `addr`, if any.
    #[must_use]
    pub fn lookup(&self, addr: address) -> Option<PolicyId> {
        self.ranges
            .get(&addr)
            .map(|id| self.segments[id.0].policy)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::SegmentTable;
    use crate::{policy::PolicyId, Error};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    #[test]
    fn lookup_by_range() -> eyre::Result<()> {
        let mut table = SegmentTable::new();
        table.create(0x1000, 0x2000, PolicyId(1))?;
        // adjacent segments stay distinct
        table.create(0x2000, 0x3000, PolicyId(2))?;
        diff::assert_eq!(table.lookup(0xfff), None);
        diff::assert_eq!(table.lookup(0x1000), Some(PolicyId(1)));
        diff::assert_eq!(table.lookup(0x1fff), Some(PolicyId(1)));
        diff::assert_eq!(table.lookup(0x2000), Some(PolicyId(2)));
        diff::assert_eq!(table.lookup(0x2fff), Some(PolicyId(2)));
        diff::assert_eq!(table.lookup(0x3000), None);
        diff::assert_eq!(table.len(), 2);
        Ok(())
    }

    #[test]
    fn overlapping_segments_are_rejected() -> eyre::Result<()> {
        let mut table = SegmentTable::new();
        table.create(0x1000, 0x2000, PolicyId(1))?;
        diff::assert_eq!(
            table.create(0x1800, 0x2800, PolicyId(2)),
            Err(Error::SegmentOverlap {
                start: 0x1800,
                end: 0x2800
            })
        );
        diff::assert_eq!(table.len(), 1);
        Ok(())
    }
}
