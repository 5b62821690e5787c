//! Page-granularity residency tracking.
//!
//! A [`PageTable`] partitions one region into fixed-size pages and records,
//! per page, whether its bytes are still on the peer, being pulled, or
//! present locally. States are ordered `Remote < InFlight < Local` and every
//! write goes through an atomic max or compare-and-swap, so a page's state
//! never moves backwards.

use crate::address::RegionAddress;
use crate::error::{FabricError, Result};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Residency state of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageState {
    /// Bytes live on the peer only
    Remote = 0,
    /// A pull has been issued and has not completed
    InFlight = 1,
    /// Bytes are present locally (terminal)
    Local = 2,
}

impl PageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PageState::Remote,
            1 => PageState::InFlight,
            _ => PageState::Local,
        }
    }
}

/// Byte range covered by one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// Page index within the region
    pub index: usize,
    /// First byte of the page
    pub address: RegionAddress,
    /// Page length (the final page may be short)
    pub len: usize,
}

/// Per-region page residency table.
#[derive(Debug)]
pub struct PageTable {
    start: RegionAddress,
    region_size: usize,
    page_size: usize,
    states: Box<[AtomicU8]>,
    local_pages: AtomicUsize,
}

impl PageTable {
    /// Create a table with every page `Remote`.
    pub fn new(start: RegionAddress, region_size: usize, page_size: usize) -> Result<Self> {
        Self::with_state(start, region_size, page_size, PageState::Remote)
    }

    /// Create a table with every page in `state`.
    pub fn with_state(
        start: RegionAddress,
        region_size: usize,
        page_size: usize,
        state: PageState,
    ) -> Result<Self> {
        if page_size == 0 {
            return Err(FabricError::InvalidPageSize(page_size));
        }
        let num_pages = region_size.div_ceil(page_size);
        let states = (0..num_pages)
            .map(|_| AtomicU8::new(state as u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let local = if state == PageState::Local {
            num_pages
        } else {
            0
        };

        Ok(Self {
            start,
            region_size,
            page_size,
            states,
            local_pages: AtomicUsize::new(local),
        })
    }

    /// First address covered by the table.
    pub fn start(&self) -> RegionAddress {
        self.start
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages.
    pub fn num_pages(&self) -> usize {
        self.states.len()
    }

    /// Index of the page containing `address`.
    pub fn page_for(&self, address: RegionAddress) -> Option<usize> {
        let offset = address.distance_from(self.start)?;
        if offset >= self.region_size {
            return None;
        }
        Some(offset / self.page_size)
    }

    /// Byte range of page `index`.
    pub fn page_span(&self, index: usize) -> Option<PageSpan> {
        if index >= self.num_pages() {
            return None;
        }
        let offset = index * self.page_size;
        Some(PageSpan {
            index,
            address: self.start.offset(offset),
            len: self.page_size.min(self.region_size - offset),
        })
    }

    /// Span of the page containing `address`.
    pub fn span_for(&self, address: RegionAddress) -> Option<PageSpan> {
        self.page_for(address).and_then(|index| self.page_span(index))
    }

    /// Current state of the page containing `address`.
    pub fn get_state(&self, address: RegionAddress) -> Option<PageState> {
        self.page_for(address).map(|index| self.state_of(index))
    }

    /// Current state of page `index`.
    pub fn state_of(&self, index: usize) -> PageState {
        PageState::from_u8(self.states[index].load(Ordering::Acquire))
    }

    /// Advance the page containing `address` to `state`.
    ///
    /// A request to move backwards leaves the page untouched. Returns the
    /// previous state.
    pub fn set_state(&self, address: RegionAddress, state: PageState) -> Option<PageState> {
        self.page_for(address)
            .map(|index| self.set_state_of(index, state))
    }

    /// Advance page `index` to `state`, returning the previous state.
    pub fn set_state_of(&self, index: usize, state: PageState) -> PageState {
        let previous = PageState::from_u8(self.states[index].fetch_max(state as u8, Ordering::AcqRel));
        if state == PageState::Local && previous != PageState::Local {
            self.local_pages.fetch_add(1, Ordering::AcqRel);
        }
        previous
    }

    /// Atomically move the page containing `address` from `expected` to `new`.
    pub fn compare_and_swap(&self, address: RegionAddress, expected: PageState, new: PageState) -> bool {
        match self.page_for(address) {
            Some(index) => self.compare_and_swap_of(index, expected, new),
            None => false,
        }
    }

    /// Atomically move page `index` from `expected` to `new`.
    pub fn compare_and_swap_of(&self, index: usize, expected: PageState, new: PageState) -> bool {
        if new < expected {
            return false;
        }
        let swapped = self.states[index]
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped && new == PageState::Local && expected != PageState::Local {
            self.local_pages.fetch_add(1, Ordering::AcqRel);
        }
        swapped
    }

    /// Return an `InFlight` page to `Remote` after its pull failed.
    ///
    /// This is the only backwards edge; it never touches a `Local` page.
    pub(crate) fn abandon_pull(&self, index: usize) -> bool {
        self.states[index]
            .compare_exchange(
                PageState::InFlight as u8,
                PageState::Remote as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Number of `Local` pages.
    pub fn local_count(&self) -> usize {
        self.local_pages.load(Ordering::Acquire)
    }

    /// Whether every page is `Local`.
    pub fn is_fully_local(&self) -> bool {
        self.local_count() == self.num_pages()
    }

    /// Snapshot of every page state, in index order.
    pub fn states(&self) -> Vec<PageState> {
        (0..self.num_pages()).map(|i| self.state_of(i)).collect()
    }

    /// Indexes of pages overlapping `[address, address + len)`.
    pub fn pages_in(&self, address: RegionAddress, len: usize) -> std::ops::Range<usize> {
        if len == 0 {
            return 0..0;
        }
        let first = match address.distance_from(self.start) {
            Some(offset) => offset / self.page_size,
            None => 0,
        };
        let last_byte = address
            .offset(len - 1)
            .distance_from(self.start)
            .unwrap_or(0)
            .min(self.region_size.saturating_sub(1));
        let last = last_byte / self.page_size;
        first.min(self.num_pages())..(last + 1).min(self.num_pages())
    }
}
