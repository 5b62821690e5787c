//! Property-based tests for paging state and the region registry.
//!
//! These tests use proptest to check page-state monotonicity, page
//! geometry, and interval lookup against a brute-force model.

use memfabric::{
    AddressSpace, NodeId, PageState, PageTable, RegionAddress, RegionRegistry, RegionState,
    DEFAULT_ALIGNMENT,
};
use proptest::prelude::*;

const START: u64 = 1 << 44;

// ============================================================================
// Strategies
// ============================================================================

fn page_state() -> impl Strategy<Value = PageState> {
    prop_oneof![
        Just(PageState::Remote),
        Just(PageState::InFlight),
        Just(PageState::Local),
    ]
}

fn rank(state: PageState) -> u8 {
    match state {
        PageState::Remote => 0,
        PageState::InFlight => 1,
        PageState::Local => 2,
    }
}

/// Allocation script: sizes to allocate, and which of them to free again.
fn allocation_script() -> impl Strategy<Value = Vec<(usize, bool)>> {
    prop::collection::vec((1usize..20_000, any::<bool>()), 1..40)
}

// ============================================================================
// Page Table Properties
// ============================================================================

proptest! {
    /// Property: no sequence of set_state/compare_and_swap moves a page backwards
    #[test]
    fn prop_page_states_are_monotonic(
        region_size in 1usize..16_384,
        page_size in 1usize..4096,
        ops in prop::collection::vec((0usize..64, page_state(), page_state(), any::<bool>()), 1..200),
    ) {
        let table = PageTable::new(RegionAddress(START), region_size, page_size).unwrap();
        let pages = table.num_pages();
        prop_assert_eq!(pages, region_size.div_ceil(page_size));

        let mut model = vec![0u8; pages];
        for (index, expected, new, use_cas) in ops {
            let index = index % pages;
            if use_cas {
                table.compare_and_swap_of(index, expected, new);
            } else {
                table.set_state_of(index, new);
            }
            let now = rank(table.state_of(index));
            prop_assert!(now >= model[index], "page {} regressed", index);
            model[index] = now;
        }
        let local = model.iter().filter(|r| **r == 2).count();
        prop_assert_eq!(table.local_count(), local);
        prop_assert_eq!(table.is_fully_local(), local == pages);
    }

    /// Property: every byte maps to the page whose span contains it
    #[test]
    fn prop_page_spans_cover_region(
        region_size in 1usize..16_384,
        page_size in 1usize..4096,
        probe in 0usize..16_384,
    ) {
        let table = PageTable::new(RegionAddress(START), region_size, page_size).unwrap();
        let covered: usize = (0..table.num_pages())
            .map(|i| table.page_span(i).unwrap().len)
            .sum();
        prop_assert_eq!(covered, region_size);

        let addr = RegionAddress(START).offset(probe);
        match table.page_for(addr) {
            Some(index) => {
                prop_assert!(probe < region_size);
                let span = table.page_span(index).unwrap();
                prop_assert!(span.address <= addr && addr < span.address.offset(span.len));
            }
            None => prop_assert!(probe >= region_size),
        }
    }
}

// ============================================================================
// Registry Properties
// ============================================================================

proptest! {
    /// Property: lookup agrees with a linear scan over live regions, gaps included
    #[test]
    fn prop_lookup_matches_model(
        script in allocation_script(),
        probes in prop::collection::vec(0usize..(1 << 22), 1..50),
    ) {
        let registry = RegionRegistry::new(
            AddressSpace::new(RegionAddress(START), 1 << 22),
            DEFAULT_ALIGNMENT,
            NodeId(0),
        );

        let mut live = Vec::new();
        for (size, free) in script {
            let Ok(region) = registry.allocate(size) else { continue };
            if free {
                registry.deallocate(&region).unwrap();
            } else {
                live.push(region);
            }
        }

        // Live extents never overlap.
        let mut sorted: Vec<_> = live.iter().map(|r| (r.base(), r.end())).collect();
        sorted.sort();
        for pair in sorted.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }

        for probe in probes {
            let addr = RegionAddress(START).offset(probe);
            let expected = live.iter().find(|r| r.contains(addr)).map(|r| r.base());
            let found = registry.lookup(addr).map(|r| r.base());
            prop_assert_eq!(found, expected);
        }
        prop_assert_eq!(registry.len(), live.len());
    }

    /// Property: a freed extent is reused by the next allocation of its size class
    #[test]
    fn prop_free_list_reuse(size in 1usize..20_000) {
        let registry = RegionRegistry::new(
            AddressSpace::new(RegionAddress(START), 1 << 20),
            DEFAULT_ALIGNMENT,
            NodeId(0),
        );
        let first = registry.allocate(size).unwrap();
        let base = first.base();
        registry.deallocate(&first).unwrap();

        let second = registry.allocate(size).unwrap();
        prop_assert_eq!(second.base(), base);
        prop_assert_eq!(second.state(), RegionState::Owned);
        // The stale handle cannot free the new region.
        prop_assert!(registry.deallocate(&first).is_err());
        prop_assert!(registry.lookup(base).is_some());
    }
}
