//! Memory region manager and store fault handler (§4.6), grounded on
//! `original_source/libhurd-mm/map.c` for the overlap-tree shape and
//! re-entrant-bootstrap hazard, and on `rm-btree`'s region-overlap
//! comparator contract (§4.1, §8 Overlap-tree).

use rm_btree::{Comparator, Inserted, KeyMode, NodeId, Tree};
use rm_proto::Error;
use std::cmp::Ordering;

/// A half-open virtual-address range, `[start, end)` (§3 Map).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start < end);
        Range { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Orders by `start`, but treats any two overlapping ranges as equal
/// (§4.1), so `find` locates *an* overlapper rather than requiring an
/// exact match.
#[derive(Default, Clone, Copy)]
pub struct RangeOverlap;

impl Comparator<Range> for RangeOverlap {
    fn compare(&self, a: &Range, b: &Range) -> Ordering {
        if a.end <= b.start {
            Ordering::Less
        } else if b.end <= a.start {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Opaque identifier for a [`Store`] implementation registered with a
/// [`MemoryRegionManager`] (§3 Store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(pub u32);

/// A record `{ vm_range, store, store_offset }` (§3 Map).
#[derive(Debug, Clone, Copy)]
pub struct Map {
    pub vm_range: Range,
    pub store: StoreId,
    pub store_offset: u64,
}

/// A cached portion of a store's backing content (§3 Store `memory`
/// record): `{ container, container_offset, store_range }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRecord {
    pub container: u64,
    pub container_offset: u64,
    pub store_range: Range,
}

/// Access requested by a fault (read vs. write), used by [`Store::fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// An abstract backing object that services faults on behalf of a
/// virtual-memory range (§3 Store). A real implementation pulls from
/// swap, a file, or allocates zero-fill memory; this crate only
/// specifies when and how it is called.
pub trait Store {
    /// Populate this store's memory cache to cover `fault_addr`,
    /// returning once a subsequent [`Self::find_cached`] would succeed
    /// (§4.6).
    fn fault(
        &mut self,
        vm_region: Range,
        store_offset: u64,
        fault_addr: u64,
        access: Access,
    ) -> Result<(), Error>;

    /// An ordered lookup of cached `memory` records keyed by
    /// `store_offset` (§3 Store).
    fn find_cached(&self, store_offset: u64, len: u64) -> Option<MemoryRecord>;
}

/// Per-process range→map index, plus the bootstrap "spare" pool that
/// breaks the re-entrant-allocation hazard of inserting into the very
/// map the slab allocator itself grows through (§9 Design Notes "Slab
/// with re-entrant allocation", `libhurd-mm/map.c`).
pub struct MemoryRegionManager {
    maps: Tree<Range, Map, RangeOverlap>,
    spare: Vec<NodeId>,
}

impl Default for MemoryRegionManager {
    fn default() -> Self {
        MemoryRegionManager {
            maps: Tree::with_comparator(KeyMode::Unique, RangeOverlap),
            spare: Vec::new(),
        }
    }
}

impl MemoryRegionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preallocate `spare_maps` placeholder entries so the underlying
    /// tree's arena has already grown to accommodate them before the
    /// grow-on-demand path is exercised under fault pressure — the
    /// two-phase bootstrap the original's re-entrant slab needed
    /// (§9 Design Notes).
    pub fn bootstrap(&mut self, spare_maps: usize) {
        let placeholder = StoreId(u32::MAX);
        for i in 0..spare_maps {
            let start = u64::MAX - (i as u64 + 1);
            let range = Range::new(start, start + 1);
            if let Inserted::New(id) = self.maps.insert(
                range,
                Map { vm_range: range, store: placeholder, store_offset: 0 },
            ) {
                self.spare.push(id);
            }
        }
        for id in self.spare.drain(..) {
            self.maps.detach(id);
        }
    }

    /// Insert a new map, rejecting it if it overlaps an existing one
    /// (§3 Invariants: "for any two ranges in a process's map index,
    /// they do not overlap").
    pub fn insert_map(&mut self, vm_range: Range, store: StoreId, store_offset: u64) -> Result<(), Error> {
        if self.maps.find(&vm_range).is_some() {
            return Err(Error::Invalid);
        }
        self.maps.insert(vm_range, Map { vm_range, store, store_offset });
        Ok(())
    }

    fn find_id(&self, addr: u64) -> Option<NodeId> {
        self.maps.find(&Range::new(addr, addr + 1))
    }

    pub fn find_containing(&self, addr: u64) -> Option<&Map> {
        self.find_id(addr).map(|id| self.maps.value(id))
    }

    /// `vm_release(start, size)`: trims or splits overlapping maps in
    /// place (§4.6). A trim at the head shifts `store_offset` forward;
    /// a release strictly inside a map's range splits it into the
    /// surviving head and tail halves, each keeping its own adjusted
    /// `store_offset`.
    pub fn vm_release(&mut self, start: u64, size: u64) {
        let release = Range::new(start, start + size);
        loop {
            let Some(id) = self.maps.find(&release) else { break };
            let existing = *self.maps.value(id);
            let (_, map) = self.maps.detach(id);

            let before_overlap = map.vm_range.start < release.start;
            let after_overlap = map.vm_range.end > release.end;

            if before_overlap {
                let head = Range::new(map.vm_range.start, release.start);
                self.maps.insert(
                    head,
                    Map { vm_range: head, store: map.store, store_offset: map.store_offset },
                );
            }
            if after_overlap {
                let tail = Range::new(release.end, map.vm_range.end);
                let shift = release.end - map.vm_range.start;
                self.maps.insert(
                    tail,
                    Map { vm_range: tail, store: map.store, store_offset: map.store_offset + shift },
                );
            }
            debug_assert!(existing.vm_range.overlaps(&release));
        }
    }

    /// Drive the fault loop (§4.6): locate the covering map, compute
    /// `store_offset`, and repeatedly ask the store to fault the page
    /// in until it reports the range as cached.
    pub fn handle_fault(&self, store: &mut dyn Store, fault_addr: u64, access: Access) -> Result<MemoryRecord, Error> {
        let map = self.find_containing(fault_addr).copied().ok_or(Error::Invalid)?;
        let store_offset = map.store_offset + (fault_addr - map.vm_range.start);
        loop {
            if let Some(rec) = store.find_cached(store_offset, 1) {
                return Ok(rec);
            }
            store.fault(map.vm_range, store_offset, fault_addr, access)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_do_not_overlap_after_insert() {
        let mut mgr = MemoryRegionManager::new();
        mgr.insert_map(Range::new(0, 0x1000), StoreId(1), 0).unwrap();
        let err = mgr.insert_map(Range::new(0x800, 0x1800), StoreId(1), 0).unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn find_containing_locates_the_right_map() {
        let mut mgr = MemoryRegionManager::new();
        mgr.insert_map(Range::new(0, 0x1000), StoreId(1), 0).unwrap();
        mgr.insert_map(Range::new(0x1000, 0x2000), StoreId(2), 0).unwrap();
        assert_eq!(mgr.find_containing(0x1500).unwrap().store, StoreId(2));
        assert!(mgr.find_containing(0x3000).is_none());
    }

    #[test]
    fn vm_release_in_the_middle_splits_the_map() {
        let mut mgr = MemoryRegionManager::new();
        mgr.insert_map(Range::new(0, 0x3000), StoreId(1), 0x1000).unwrap();
        mgr.vm_release(0x1000, 0x1000);

        let head = mgr.find_containing(0x500).unwrap();
        assert_eq!(head.vm_range, Range::new(0, 0x1000));
        assert_eq!(head.store_offset, 0x1000);

        let tail = mgr.find_containing(0x2500).unwrap();
        assert_eq!(tail.vm_range, Range::new(0x2000, 0x3000));
        assert_eq!(tail.store_offset, 0x3000);

        assert!(mgr.find_containing(0x1500).is_none());
    }

    #[test]
    fn bootstrap_leaves_no_residual_entries() {
        let mut mgr = MemoryRegionManager::new();
        mgr.bootstrap(8);
        assert!(mgr.spare.is_empty());
        mgr.insert_map(Range::new(0, 0x1000), StoreId(1), 0).unwrap();
        assert_eq!(mgr.find_containing(0x10).unwrap().store, StoreId(1));
    }

    struct ZeroFillStore {
        cached: Option<MemoryRecord>,
    }
    impl Store for ZeroFillStore {
        fn fault(&mut self, vm_region: Range, store_offset: u64, _fault_addr: u64, _access: Access) -> Result<(), Error> {
            self.cached = Some(MemoryRecord {
                container: 0,
                container_offset: 0,
                store_range: Range::new(store_offset, store_offset + vm_region.len()),
            });
            Ok(())
        }
        fn find_cached(&self, store_offset: u64, _len: u64) -> Option<MemoryRecord> {
            self.cached.filter(|r| r.store_range.contains(store_offset))
        }
    }

    #[test]
    fn fault_loop_stops_once_store_reports_cached() {
        let mut mgr = MemoryRegionManager::new();
        mgr.insert_map(Range::new(0x1000, 0x2000), StoreId(1), 0).unwrap();
        let mut store = ZeroFillStore { cached: None };
        let rec = mgr.handle_fault(&mut store, 0x1500, Access::Read).unwrap();
        assert!(rec.store_range.contains(0x500));
    }
}
