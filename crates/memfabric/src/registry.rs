//! Region registry: interval map of live regions plus size-class free lists.
//!
//! Every region reserves the extent `[base, base + class)` where `class` is
//! its size rounded up to the allocation alignment. Live extents are kept in
//! an ordered map so an address resolves to its enclosing region with one
//! range query. Freed extents go to a per-class free list and are handed out
//! again, as fresh regions, before new space is carved.

use crate::address::{align_up, AddressSpace, NodeId, RegionAddress};
use crate::error::{FabricError, Result};
use crate::region::Region;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics for the region registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Regions currently mapped
    pub live_regions: usize,
    /// Extents sitting in free lists
    pub free_extents: usize,
    /// Bytes reserved by live regions
    pub live_bytes: u64,
    /// Allocations served
    pub allocations: u64,
    /// Allocations served from a free list
    pub reuses: u64,
    /// Deallocations performed
    pub deallocations: u64,
    /// Lookups performed
    pub lookups: u64,
}

#[derive(Default)]
struct RegistryCounters {
    allocations: AtomicU64,
    reuses: AtomicU64,
    deallocations: AtomicU64,
    lookups: AtomicU64,
}

struct Inner {
    memory_map: BTreeMap<RegionAddress, Arc<Region>>,
    free_map: HashMap<usize, Vec<RegionAddress>>,
    free_index: BTreeMap<RegionAddress, usize>,
    cursor: RegionAddress,
    app_index: HashMap<i64, RegionAddress>,
    live_bytes: u64,
}

/// Address-ordered registry of one node's regions.
pub struct RegionRegistry {
    space: AddressSpace,
    alignment: usize,
    local: NodeId,
    inner: RwLock<Inner>,
    counters: RegistryCounters,
}

impl RegionRegistry {
    /// Create an empty registry carving from `space`.
    pub fn new(space: AddressSpace, alignment: usize, local: NodeId) -> Self {
        Self {
            space,
            alignment: alignment.max(1),
            local,
            inner: RwLock::new(Inner {
                memory_map: BTreeMap::new(),
                free_map: HashMap::new(),
                free_index: BTreeMap::new(),
                cursor: space.start,
                app_index: HashMap::new(),
                live_bytes: 0,
            }),
            counters: RegistryCounters::default(),
        }
    }

    /// Node that owns locally allocated regions.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Size class of a `size`-byte region.
    pub fn size_class(&self, size: usize) -> usize {
        align_up(size.max(1), self.alignment)
    }

    /// Allocate `size` bytes anywhere in the space.
    pub fn allocate(&self, size: usize) -> Result<Arc<Region>> {
        self.allocate_inner(size, None)
    }

    /// Allocate `size` bytes carrying a durable application id.
    pub fn allocate_tagged(&self, size: usize, app_id: i64) -> Result<Arc<Region>> {
        self.allocate_inner(size, Some(app_id))
    }

    fn allocate_inner(&self, size: usize, app_id: Option<i64>) -> Result<Arc<Region>> {
        let class = self.size_class(size);
        let mut inner = self.inner.write();

        let reused = inner.free_map.get_mut(&class).and_then(Vec::pop);
        let base = match reused {
            Some(base) => {
                inner.free_index.remove(&base);
                self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                base
            }
            None => {
                let from = inner.cursor;
                let base = match Self::carve(&inner, self.space, from, class, self.alignment) {
                    Some(base) => base,
                    None => Self::carve(&inner, self.space, self.space.start, class, self.alignment)
                        .ok_or(FabricError::OutOfAddressSpace { size })?,
                };
                let next = base.offset(class);
                if next > inner.cursor {
                    inner.cursor = next;
                }
                base
            }
        };

        let region = Arc::new(Region::new_owned(base, size, self.local, app_id));
        Self::insert(&mut inner, Arc::clone(&region), class);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(addr = %base, size, reused = reused.is_some(), "allocated region");
        Ok(region)
    }

    /// First free extent of `class` bytes at or after `from`.
    fn carve(
        inner: &Inner,
        space: AddressSpace,
        from: RegionAddress,
        class: usize,
        alignment: usize,
    ) -> Option<RegionAddress> {
        let mut candidate = from.align_up(alignment);
        loop {
            if !space.contains(candidate, class) {
                return None;
            }
            let live = Self::blocker(&inner.memory_map, candidate, class, |r| {
                align_up(r.size().max(1), alignment)
            });
            let freed = Self::blocker(&inner.free_index, candidate, class, |c| *c);
            match live.max(freed) {
                Some(end) => candidate = end.align_up(alignment),
                None => return Some(candidate),
            }
        }
    }

    /// End of an extent in `map` overlapping `[start, start + len)`, if any.
    fn blocker<V>(
        map: &BTreeMap<RegionAddress, V>,
        start: RegionAddress,
        len: usize,
        extent_len: impl Fn(&V) -> usize,
    ) -> Option<RegionAddress> {
        let end = start.offset(len);
        let (base, value) = map.range(..end).next_back()?;
        let extent_end = base.offset(extent_len(value));
        (extent_end > start).then_some(extent_end)
    }

    /// Allocate `size` bytes at exactly `addr`.
    pub fn allocate_at(&self, addr: RegionAddress, size: usize) -> Result<Arc<Region>> {
        self.claim(addr, size, || Region::new_owned(addr, size, self.local, None))
    }

    /// Reserve a placeholder for a region arriving from `source`.
    pub fn reserve_incoming(
        &self,
        addr: RegionAddress,
        size: usize,
        source: NodeId,
        app_id: Option<i64>,
    ) -> Result<Arc<Region>> {
        self.claim(addr, size, || Region::incoming(addr, size, source, app_id))
    }

    fn claim(
        &self,
        addr: RegionAddress,
        size: usize,
        make: impl FnOnce() -> Region,
    ) -> Result<Arc<Region>> {
        if !addr.is_aligned(self.alignment) {
            return Err(FabricError::MisalignedAddress {
                addr,
                alignment: self.alignment,
            });
        }
        let class = self.size_class(size);
        if !self.space.contains(addr, class) {
            return Err(FabricError::OutOfAddressSpace { size });
        }

        let mut inner = self.inner.write();
        let reserved = |r: &Arc<Region>| self.size_class(r.size());
        if Self::blocker(&inner.memory_map, addr, class, reserved).is_some() {
            return Err(FabricError::AddressConflict { addr, size });
        }
        self.split_free(&mut inner, addr, class);

        let region = Arc::new(make());
        Self::insert(&mut inner, Arc::clone(&region), class);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(region)
    }

    /// Remove every free extent overlapping `[start, start + len)`, keeping
    /// the parts outside it on the free lists.
    fn split_free(&self, inner: &mut Inner, start: RegionAddress, len: usize) {
        let end = start.offset(len);
        let overlapping: Vec<(RegionAddress, usize)> = inner
            .free_index
            .range(..end)
            .rev()
            .take_while(|(base, class)| base.offset(**class) > start)
            .map(|(base, class)| (*base, *class))
            .collect();

        for (base, class) in overlapping {
            Self::remove_free(inner, base, class);
            if base < start {
                let head = start.distance_from(base).unwrap_or(0);
                Self::push_free(inner, base, head);
            }
            let extent_end = base.offset(class);
            if extent_end > end {
                let tail = extent_end.distance_from(end).unwrap_or(0);
                Self::push_free(inner, end, tail);
            }
        }
    }

    fn insert(inner: &mut Inner, region: Arc<Region>, class: usize) {
        if let Some(app_id) = region.app_id() {
            inner.app_index.insert(app_id, region.base());
        }
        inner.live_bytes += class as u64;
        inner.memory_map.insert(region.base(), region);
    }

    fn push_free(inner: &mut Inner, base: RegionAddress, class: usize) {
        inner.free_map.entry(class).or_default().push(base);
        inner.free_index.insert(base, class);
    }

    fn remove_free(inner: &mut Inner, base: RegionAddress, class: usize) {
        inner.free_index.remove(&base);
        if let Some(bucket) = inner.free_map.get_mut(&class) {
            bucket.retain(|b| *b != base);
            if bucket.is_empty() {
                inner.free_map.remove(&class);
            }
        }
    }

    /// Return `region`'s extent to its free list.
    ///
    /// A stale handle whose extent was since reused by another region is
    /// reported as `RegionNotFound`.
    pub fn deallocate(&self, region: &Region) -> Result<()> {
        let mapped = self
            .get(region.base())
            .is_some_and(|live| std::ptr::eq(Arc::as_ptr(&live), region));
        if !mapped {
            return Err(FabricError::RegionNotFound(region.base()));
        }
        self.remove(region.base()).map(|_| ())
    }

    /// Unmap the region based at `base`, returning it.
    pub fn remove(&self, base: RegionAddress) -> Result<Arc<Region>> {
        let mut inner = self.inner.write();
        let region = inner
            .memory_map
            .get(&base)
            .cloned()
            .ok_or(FabricError::RegionNotFound(base))?;

        let count = region.outstanding_pulls();
        if count > 0 {
            return Err(FabricError::PullsOutstanding { addr: base, count });
        }

        inner.memory_map.remove(&base);
        if let Some(app_id) = region.app_id() {
            if inner.app_index.get(&app_id) == Some(&base) {
                inner.app_index.remove(&app_id);
            }
        }
        let class = self.size_class(region.size());
        inner.live_bytes -= class as u64;
        Self::push_free(&mut inner, base, class);
        self.counters.deallocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(addr = %base, class, "region returned to free list");
        Ok(region)
    }

    /// Region whose extent contains `addr`.
    pub fn lookup(&self, addr: RegionAddress) -> Option<Arc<Region>> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        Self::find(&self.inner.read(), addr)
    }

    /// Lookup for the fault path, tolerant of a read lock already held by
    /// the faulting thread.
    pub fn lookup_recursive(&self, addr: RegionAddress) -> Option<Arc<Region>> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        Self::find(&self.inner.read_recursive(), addr)
    }

    fn find(inner: &Inner, addr: RegionAddress) -> Option<Arc<Region>> {
        inner
            .memory_map
            .range(..=addr)
            .next_back()
            .filter(|(_, region)| region.contains(addr))
            .map(|(_, region)| Arc::clone(region))
    }

    /// Region based exactly at `base`.
    pub fn get(&self, base: RegionAddress) -> Option<Arc<Region>> {
        self.inner.read().memory_map.get(&base).cloned()
    }

    /// Region carrying `app_id`.
    pub fn by_app_id(&self, app_id: i64) -> Option<Arc<Region>> {
        let inner = self.inner.read();
        let base = inner.app_index.get(&app_id)?;
        inner.memory_map.get(base).cloned()
    }

    /// All live regions in address order.
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.inner.read().memory_map.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().memory_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        RegistryStats {
            live_regions: inner.memory_map.len(),
            free_extents: inner.free_index.len(),
            live_bytes: inner.live_bytes,
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            deallocations: self.counters.deallocations.load(Ordering::Relaxed),
            lookups: self.counters.lookups.load(Ordering::Relaxed),
        }
    }
}
