//! Owned shareable memory.

use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::traits::XenHal;
use crate::HalError;

pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Zeroed, page-aligned, physically contiguous memory released on drop.
///
/// Grants to these frames must be revoked before the region is dropped.
pub struct DmaRegion<H: XenHal> {
    hal: Arc<H>,
    frame: u64,
    ptr: NonNull<u8>,
    pages: usize,
}

// SAFETY: the region is plain memory owned by this value; XenHal is Send + Sync.
unsafe impl<H: XenHal> Send for DmaRegion<H> {}
// SAFETY: shared access only hands out shared slices.
unsafe impl<H: XenHal> Sync for DmaRegion<H> {}

impl<H: XenHal> DmaRegion<H> {
    pub fn alloc(hal: &Arc<H>, pages: usize) -> Result<Self, HalError> {
        let pages = pages.max(1);
        let (frame, ptr) = hal.dma_alloc(pages).ok_or(HalError::OutOfMemory)?;
        log::trace!("[DMA] {} pages at frame {:#x}", pages, frame);
        Ok(Self {
            hal: hal.clone(),
            frame,
            ptr,
            pages,
        })
    }

    /// Machine frame of page `page` within the region.
    pub fn frame(&self, page: usize) -> u64 {
        debug_assert!(page < self.pages);
        self.frame + page as u64
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and &mut self is exclusive on our side
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }

    /// Address of page `page`.
    pub fn page_ptr(&self, page: usize) -> NonNull<u8> {
        debug_assert!(page < self.pages);
        // SAFETY: page < pages keeps the offset inside the allocation
        unsafe { self.ptr.add(page * PAGE_SIZE) }
    }
}

impl<H: XenHal> Drop for DmaRegion<H> {
    fn drop(&mut self) {
        // SAFETY: frame/ptr/pages come from one dma_alloc; owners revoke grants first
        unsafe { self.hal.dma_dealloc(self.frame, self.ptr, self.pages) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHal;

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(4097), 2);
        assert_eq!(pages_for(1024 * 768 * 4), 768);
    }

    #[test]
    fn test_region_is_zeroed_and_freed() {
        let hal = MockHal::new();
        {
            let mut region = DmaRegion::alloc(&hal, 3).unwrap();
            assert_eq!(region.len(), 3 * PAGE_SIZE);
            assert!(region.as_slice().iter().all(|&b| b == 0));
            region.as_mut_slice()[PAGE_SIZE] = 0xAB;
            assert_eq!(region.frame(1), region.frame(0) + 1);
            assert_eq!(hal.frame_ptr(region.frame(1)), Some(region.page_ptr(1).as_ptr()));
            assert_eq!(hal.live_regions(), 1);
        }
        assert_eq!(hal.live_regions(), 0);
    }

    #[test]
    fn test_alloc_failure_is_reported() {
        let hal = MockHal::new();
        hal.fail_allocations_after(0);
        assert_eq!(DmaRegion::alloc(&hal, 1).err(), Some(HalError::OutOfMemory));
    }
}
