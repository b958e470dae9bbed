//! Address-space walking and region statistics.
//!
//! [`walk`] enumerates every region between the address-space bounds and feeds each one
//! to [`Snapshot::classify`]. The resulting snapshot partitions the scanned pages three
//! ways (free/reserved/committed, backing type, protection class) and keeps a histogram
//! of free span sizes by power of two.
//!
//! The walk is a sequential sample. Other threads may change the address space while it
//! runs; callers that need a consistent picture must suspend them first.

use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::{AddressBounds, AddressSpace, RegionInfo, RegionKind, RegionState, PAGE_SHIFT};
use crate::protection::PAGE_GUARD;

/// Number of free-span size classes, 4 KiB through 2 GiB.
pub const HISTOGRAM_BUCKETS: usize = 20;

/// Number of protection classes.
pub const PROTECTION_CLASSES: usize = 8;

/// Protection bits that take part in classification. `PAGE_EXECUTE_WRITECOPY` (bit 7) is
/// deliberately outside the mask, so its class always stays at zero.
const CLASSIFIED_PROTECTION_MASK: u32 = 0x7F;

/// Protection class of committed pages, indexed by the lowest set protection bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtectionClass {
    NoAccessData = 0,
    ReadOnlyData = 1,
    ReadWriteData = 2,
    WriteCopyData = 3,
    NoAccessCode = 4,
    ReadOnlyCode = 5,
    ReadWriteCode = 6,
    WriteCopyCode = 7,
}

impl ProtectionClass {
    pub const ALL: [ProtectionClass; PROTECTION_CLASSES] = [
        Self::NoAccessData,
        Self::ReadOnlyData,
        Self::ReadWriteData,
        Self::WriteCopyData,
        Self::NoAccessCode,
        Self::ReadOnlyCode,
        Self::ReadWriteCode,
        Self::WriteCopyCode,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Row label used by the report.
    pub fn label(self) -> &'static str {
        match self {
            Self::NoAccessData => "NoAccess (data)",
            Self::ReadOnlyData => "ReadOnly (data)",
            Self::ReadWriteData => "ReadWrite (data)",
            Self::WriteCopyData => "WriteCopy (data)",
            Self::NoAccessCode => "NoAccess (code)",
            Self::ReadOnlyCode => "ReadOnly (code)",
            Self::ReadWriteCode => "ReadWrite (code)",
            Self::WriteCopyCode => "WriteCopy (code)",
        }
    }
}

/// Aggregate statistics of one walk. All counts are in pages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub free_pages: u64,
    pub reserved_pages: u64,
    pub committed_pages: u64,
    /// Committed pages by [`ProtectionClass`].
    pub pages_by_protection: [u64; PROTECTION_CLASSES],
    /// Committed pages with `PAGE_GUARD`, counted on top of their protection class.
    pub guard_pages: u64,
    /// Reserved and committed pages by [`RegionKind::index`].
    pub pages_by_kind: [u64; 3],
    /// Free regions per size class; bucket `i` holds spans whose dominant bit is `12 + i`.
    pub free_span_histogram: [u64; HISTOGRAM_BUCKETS],
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one region to the running totals.
    pub fn classify(&mut self, region: &RegionInfo) {
        let pages = region.pages();

        if region.state == RegionState::Free {
            self.free_pages += pages;
            self.free_span_histogram[bucket_index(region.size)] += 1;
            return;
        }

        self.pages_by_kind[region.kind.index()] += pages;

        if region.state == RegionState::Reserved {
            self.reserved_pages += pages;
            return;
        }

        self.committed_pages += pages;

        if region.protect & PAGE_GUARD != 0 {
            self.guard_pages += pages;
        }

        let access = region.protect & CLASSIFIED_PROTECTION_MASK;
        if access != 0 {
            self.pages_by_protection[access.trailing_zeros() as usize] += pages;
        }
    }

    /// Pages in one protection class.
    pub fn protection_pages(&self, class: ProtectionClass) -> u64 {
        self.pages_by_protection[class.index()]
    }

    /// Pages with one backing type.
    pub fn kind_pages(&self, kind: RegionKind) -> u64 {
        self.pages_by_kind[kind.index()]
    }

    pub fn mapped_pages(&self) -> u64 {
        self.kind_pages(RegionKind::Mapped)
    }

    pub fn image_pages(&self) -> u64 {
        self.kind_pages(RegionKind::Image)
    }

    pub fn private_pages(&self) -> u64 {
        self.kind_pages(RegionKind::Private)
    }

    /// Every page seen by the walk.
    pub fn total_pages(&self) -> u64 {
        self.free_pages + self.reserved_pages + self.committed_pages
    }

    /// Number of blocks of bucket `bucket`'s size that fit into all free spans of that
    /// size class or larger, if the larger spans were subdivided.
    pub fn cascading_count(&self, bucket: usize) -> u64 {
        self.free_span_histogram
            .iter()
            .enumerate()
            .skip(bucket)
            .map(|(j, &count)| count << (j - bucket))
            .sum()
    }
}

/// Histogram bucket of a free span of `size` bytes: the dominant bit minus the page shift.
///
/// Spans too large for the table (only possible with 64-bit address spaces) land in
/// the last bucket.
pub fn bucket_index(size: usize) -> usize {
    let bit = size.checked_ilog2().unwrap_or(0);
    (bit.saturating_sub(PAGE_SHIFT) as usize).min(HISTOGRAM_BUCKETS - 1)
}

/// Size in bytes of histogram bucket `bucket`.
pub fn bucket_size(bucket: usize) -> u64 {
    1u64 << (PAGE_SHIFT as usize + bucket)
}

/// Most spans of bucket `bucket`'s size that a space of `total_bytes` could hold.
pub fn max_spans(bucket: usize, total_bytes: u64) -> u64 {
    total_bytes >> (PAGE_SHIFT as usize + bucket)
}

/// Walk the whole queryable range of `memory`.
pub fn walk<M: AddressSpace + ?Sized>(memory: &M) -> Result<Snapshot> {
    walk_range(memory, memory.bounds())
}

/// Walk `bounds`, classifying every region from `bounds.lowest` up to `bounds.highest`.
///
/// A failed region query aborts the walk and no snapshot is produced.
pub fn walk_range<M: AddressSpace + ?Sized>(memory: &M, bounds: AddressBounds) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    let mut cursor = bounds.lowest;
    let mut regions = 0usize;

    // The lowest address must answer before anything is counted.
    let mut region = memory.query(cursor)?;

    loop {
        let end = match region.end() {
            Some(end) if end > cursor => Some(end),
            Some(_) => return Err(Error::RegionQuery { addr: cursor, code: 0 }),
            None => None,
        };

        snapshot.classify(&region);
        regions += 1;

        match end {
            Some(end) if end < bounds.highest => cursor = end,
            _ => break,
        }

        region = memory.query(cursor)?;
    }

    debug!(
        regions,
        free = snapshot.free_pages,
        reserved = snapshot.reserved_pages,
        committed = snapshot.committed_pages,
        "address space walk complete"
    );

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::*;

    fn region(size: usize, state: RegionState, kind: RegionKind, protect: u32) -> RegionInfo {
        RegionInfo {
            base: 0x10000,
            size,
            state,
            kind,
            protect,
        }
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0x1000), 0);
        assert_eq!(bucket_index(0x2000), 1);
        // Non-power-of-two sizes fold into their dominant bit.
        assert_eq!(bucket_index(0x3000), 1);
        assert_eq!(bucket_index(1024 * 0x1000), 10);
        assert_eq!(bucket_index(0x8000_0000), 19);
    }

    #[test]
    fn test_oversized_span_uses_last_bucket() {
        let mut snapshot = Snapshot::new();
        snapshot.classify(&region(usize::MAX & !0xFFF, RegionState::Free, RegionKind::Private, 0));
        assert_eq!(snapshot.free_span_histogram[HISTOGRAM_BUCKETS - 1], 1);
    }

    #[test]
    fn test_classify_free() {
        let mut snapshot = Snapshot::new();
        snapshot.classify(&region(0x1000, RegionState::Free, RegionKind::Private, 0));
        snapshot.classify(&region(1024 * 0x1000, RegionState::Free, RegionKind::Private, 0));

        assert_eq!(snapshot.free_pages, 1025);
        assert_eq!(snapshot.free_span_histogram[0], 1);
        assert_eq!(snapshot.free_span_histogram[10], 1);
        assert_eq!(snapshot.pages_by_kind, [0; 3]);
    }

    #[test]
    fn test_classify_backing_types_are_exclusive() {
        let mut snapshot = Snapshot::new();
        snapshot.classify(&region(0x2000, RegionState::Reserved, RegionKind::Mapped, 0));
        snapshot.classify(&region(0x3000, RegionState::Committed, RegionKind::Image, PAGE_EXECUTE_READ));
        snapshot.classify(&region(0x4000, RegionState::Committed, RegionKind::Private, PAGE_READWRITE));

        assert_eq!(snapshot.mapped_pages(), 2);
        assert_eq!(snapshot.image_pages(), 3);
        assert_eq!(snapshot.private_pages(), 4);
        assert_eq!(snapshot.reserved_pages, 2);
        assert_eq!(snapshot.committed_pages, 7);
        assert_eq!(
            snapshot.mapped_pages() + snapshot.image_pages() + snapshot.private_pages(),
            snapshot.reserved_pages + snapshot.committed_pages
        );
    }

    #[test]
    fn test_classify_protection_classes() {
        let mut snapshot = Snapshot::new();
        let cases = [
            (PAGE_NOACCESS, ProtectionClass::NoAccessData),
            (PAGE_READONLY, ProtectionClass::ReadOnlyData),
            (PAGE_READWRITE, ProtectionClass::ReadWriteData),
            (PAGE_WRITECOPY, ProtectionClass::WriteCopyData),
            (PAGE_EXECUTE, ProtectionClass::NoAccessCode),
            (PAGE_EXECUTE_READ, ProtectionClass::ReadOnlyCode),
            (PAGE_EXECUTE_READWRITE, ProtectionClass::ReadWriteCode),
        ];

        for (protect, class) in cases {
            let mut single = Snapshot::new();
            single.classify(&region(0x1000, RegionState::Committed, RegionKind::Private, protect));
            assert_eq!(single.protection_pages(class), 1, "{}", describe(protect));
            snapshot.classify(&region(0x1000, RegionState::Committed, RegionKind::Private, protect));
        }

        assert_eq!(snapshot.pages_by_protection.iter().sum::<u64>(), 7);
    }

    #[test]
    fn test_execute_writecopy_is_not_classified() {
        let mut snapshot = Snapshot::new();
        snapshot.classify(&region(0x1000, RegionState::Committed, RegionKind::Image, PAGE_EXECUTE_WRITECOPY));
        assert_eq!(snapshot.committed_pages, 1);
        assert_eq!(snapshot.pages_by_protection, [0; PROTECTION_CLASSES]);
    }

    #[test]
    fn test_guard_counts_on_top_of_protection() {
        let mut snapshot = Snapshot::new();
        snapshot.classify(&region(0x2000, RegionState::Committed, RegionKind::Private, PAGE_READWRITE | PAGE_GUARD));
        assert_eq!(snapshot.guard_pages, 2);
        assert_eq!(snapshot.protection_pages(ProtectionClass::ReadWriteData), 2);
    }

    #[test]
    fn test_reserved_pages_skip_protection() {
        let mut snapshot = Snapshot::new();
        snapshot.classify(&region(0x1000, RegionState::Reserved, RegionKind::Private, PAGE_READWRITE | PAGE_GUARD));
        assert_eq!(snapshot.guard_pages, 0);
        assert_eq!(snapshot.pages_by_protection, [0; PROTECTION_CLASSES]);
    }

    #[test]
    fn test_cascading_count() {
        let mut snapshot = Snapshot::new();
        snapshot.free_span_histogram[0] = 3;
        snapshot.free_span_histogram[2] = 1;
        snapshot.free_span_histogram[5] = 2;

        assert_eq!(snapshot.cascading_count(0), 3 + 4 + 64);
        assert_eq!(snapshot.cascading_count(2), 1 + 16);
        assert_eq!(snapshot.cascading_count(5), 2);
        assert_eq!(snapshot.cascading_count(6), 0);

        let weighted: u64 = snapshot
            .free_span_histogram
            .iter()
            .enumerate()
            .map(|(j, &c)| c << j)
            .sum();
        assert_eq!(snapshot.cascading_count(0), weighted);
    }

    #[test]
    fn test_max_spans() {
        assert_eq!(max_spans(0, 0x8000_0000), 0x80000);
        assert_eq!(max_spans(19, 0x8000_0000), 1);
        assert_eq!(bucket_size(10), 4 * 1024 * 1024);
    }
}
