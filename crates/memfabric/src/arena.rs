//! Local mapping of the shared address space.
//!
//! An [`Arena`] reserves one anonymous mapping covering the whole
//! [`AddressSpace`]. Region addresses are translated to host pointers by
//! offsetting from the mapping base; nothing outside this module performs
//! that arithmetic.

use crate::address::{host_page_size, AddressSpace, RegionAddress};
use crate::error::{FabricError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::io;

/// Page protection applied by [`Arena::protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults
    None,
    /// Normal read/write access
    ReadWrite,
}

impl Protection {
    fn as_prot(self) -> libc::c_int {
        match self {
            Protection::None => libc::PROT_NONE,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Host mapping backing one node's view of the shared space.
pub struct Arena {
    space: AddressSpace,
    base: usize,
    _map: MmapMut,
}

impl Arena {
    /// Reserve a mapping for `space`.
    pub fn reserve(space: AddressSpace) -> Result<Self> {
        if space.len == 0 {
            return Err(FabricError::Config("address space length is zero".into()));
        }
        let mut map = MmapOptions::new().len(space.len).map_anon()?;
        let base = map.as_mut_ptr() as usize;
        tracing::debug!(start = %space.start, len = space.len, "reserved shared arena");
        Ok(Self {
            space,
            base,
            _map: map,
        })
    }

    /// The shared space this arena maps.
    pub fn space(&self) -> AddressSpace {
        self.space
    }

    /// Host address range `[start, end)` of the mapping.
    pub fn host_range(&self) -> (usize, usize) {
        (self.base, self.base + self.space.len)
    }

    /// Translate a host address back into the shared space.
    pub fn address_of(&self, host: usize) -> Option<RegionAddress> {
        let (start, end) = self.host_range();
        if host >= start && host < end {
            Some(self.space.start.offset(host - start))
        } else {
            None
        }
    }

    /// Host pointer for `[addr, addr + len)`.
    pub fn host_ptr(&self, addr: RegionAddress, len: usize) -> Result<*mut u8> {
        if !self.space.contains(addr, len) {
            return Err(FabricError::OutOfAddressSpace { size: len });
        }
        let offset = addr.distance_from(self.space.start).unwrap_or(0);
        Ok((self.base + offset) as *mut u8)
    }

    /// Change the protection of a host-page-aligned extent.
    pub fn protect(&self, addr: RegionAddress, len: usize, protection: Protection) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let ptr = self.host_ptr(addr, len)?;
        let page = host_page_size();
        if (ptr as usize) % page != 0 || len % page != 0 {
            return Err(FabricError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("protect({addr}, {len}) is not aligned to the {page}-byte host page"),
            )));
        }
        // SAFETY: the extent lies inside our own live mapping.
        let rc = unsafe { libc::mprotect(ptr.cast(), len, protection.as_prot()) };
        if rc != 0 {
            return Err(FabricError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Copy bytes out of the arena.
    ///
    /// # Safety
    ///
    /// The extent must be accessible (not protected) and no other thread may
    /// be writing it concurrently.
    pub unsafe fn copy_out(&self, addr: RegionAddress, dst: &mut [u8]) -> Result<()> {
        let src = self.host_ptr(addr, dst.len())?;
        std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    /// Copy bytes into the arena.
    ///
    /// # Safety
    ///
    /// Same contract as [`Arena::copy_out`].
    pub unsafe fn copy_in(&self, addr: RegionAddress, src: &[u8]) -> Result<()> {
        let dst = self.host_ptr(addr, src.len())?;
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        Ok(())
    }

    /// Copy `len` bytes from `src` in another arena to `dst` in this one.
    ///
    /// # Safety
    ///
    /// Both extents must be accessible; the destination extent must not be
    /// read or written by anyone else during the copy.
    pub unsafe fn copy_from(
        &self,
        dst: RegionAddress,
        src_arena: &Arena,
        src: RegionAddress,
        len: usize,
    ) -> Result<()> {
        let to = self.host_ptr(dst, len)?;
        let from = src_arena.host_ptr(src, len)?;
        std::ptr::copy_nonoverlapping(from as *const u8, to, len);
        Ok(())
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("space", &self.space)
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_space() -> AddressSpace {
        AddressSpace::new(RegionAddress(1 << 44), 1 << 20)
    }

    #[test]
    fn test_translation_round_trip() {
        let arena = Arena::reserve(small_space()).unwrap();
        let addr = RegionAddress((1 << 44) + 8192);
        let ptr = arena.host_ptr(addr, 16).unwrap();
        assert_eq!(arena.address_of(ptr as usize), Some(addr));
        assert!(arena.address_of(0).is_none());
        assert!(arena.host_ptr(RegionAddress(0), 16).is_err());
    }

    #[test]
    fn test_copy_in_out() {
        let arena = Arena::reserve(small_space()).unwrap();
        let addr = RegionAddress((1 << 44) + 100);
        unsafe {
            arena.copy_in(addr, b"fabric").unwrap();
            let mut buf = [0u8; 6];
            arena.copy_out(addr, &mut buf).unwrap();
            assert_eq!(&buf, b"fabric");
        }
    }

    #[test]
    fn test_copy_between_arenas() {
        let a = Arena::reserve(small_space()).unwrap();
        let b = Arena::reserve(small_space()).unwrap();
        let addr = RegionAddress((1 << 44) + 4096);
        unsafe {
            a.copy_in(addr, &[7u8; 32]).unwrap();
            b.copy_from(addr, &a, addr, 32).unwrap();
            let mut buf = [0u8; 32];
            b.copy_out(addr, &mut buf).unwrap();
            assert_eq!(buf, [7u8; 32]);
        }
    }

    #[test]
    fn test_protect_requires_alignment() {
        let arena = Arena::reserve(small_space()).unwrap();
        let page = host_page_size();
        let addr = RegionAddress(1 << 44);
        assert!(arena.protect(addr.offset(1), page, Protection::None).is_err());
        arena.protect(addr, page, Protection::None).unwrap();
        arena.protect(addr, page, Protection::ReadWrite).unwrap();
        unsafe {
            arena.copy_in(addr, &[1, 2, 3]).unwrap();
        }
    }
}
