//! Cluster-wide addressing.
//!
//! Every participating node maps the same shared address space, so a
//! [`RegionAddress`] means the same bytes on every machine and can be used
//! directly as the remote address of a one-sided operation. All nodes must
//! allocate from this externally coordinated space; translation to host
//! pointers happens only inside [`crate::arena::Arena`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Default allocation alignment (and size-class granularity).
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Start of the agreed shared range: 16 TiB into the address space.
pub const DEFAULT_SPACE_START: u64 = 1 << 44;

/// Default size of the locally mapped shared range.
pub const DEFAULT_SPACE_LEN: usize = 1 << 30;

/// Address inside the shared address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionAddress(pub u64);

impl RegionAddress {
    /// Get the raw u64 value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Address `bytes` past this one.
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Distance from `base` to this address, if this address is not below it.
    pub fn distance_from(self, base: RegionAddress) -> Option<usize> {
        self.0.checked_sub(base.0).map(|d| d as usize)
    }

    /// Whether the address is a multiple of `alignment`.
    pub fn is_aligned(self, alignment: usize) -> bool {
        alignment == 0 || self.0 % alignment as u64 == 0
    }

    /// Round up to the next multiple of `alignment`.
    pub fn align_up(self, alignment: usize) -> Self {
        Self(align_up(self.0 as usize, alignment) as u64)
    }
}

impl fmt::Display for RegionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Dense node identifier handed out by the coordination layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Largest usable id; `u16::MAX` is reserved as "no node" in packed snapshots.
    pub const MAX: NodeId = NodeId(u16::MAX - 1);

    /// Get the raw value.
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// The shared, externally coordinated address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    /// First address of the range
    pub start: RegionAddress,
    /// Length of the range in bytes
    pub len: usize,
}

impl AddressSpace {
    /// Create an address space.
    pub const fn new(start: RegionAddress, len: usize) -> Self {
        Self { start, len }
    }

    /// One past the last address.
    pub fn end(&self) -> RegionAddress {
        self.start.offset(self.len)
    }

    /// Whether `[addr, addr + size)` lies inside the space.
    pub fn contains(&self, addr: RegionAddress, size: usize) -> bool {
        addr >= self.start && addr.0.saturating_add(size as u64) <= self.end().0
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new(RegionAddress(DEFAULT_SPACE_START), DEFAULT_SPACE_LEN)
    }
}

/// Round `value` up to `alignment`, or `None` if the result overflows.
/// A zero alignment leaves the value unchanged.
pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    if alignment == 0 {
        return Some(value);
    }
    value.div_ceil(alignment).checked_mul(alignment)
}

/// Round `value` up to `alignment`, saturating at `usize::MAX`. A saturated
/// size never fits an [`AddressSpace`].
pub fn align_up(value: usize, alignment: usize) -> usize {
    checked_align_up(value, alignment).unwrap_or(usize::MAX)
}

/// Host page size, queried once.
pub fn host_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            DEFAULT_ALIGNMENT
        }
    })
}
