//! Pages granted to a back end for as long as they live.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use xf_hal::{DmaRegion, DomainId, HalError, XenHal};

use crate::grant::{GrantRef, GrantTable};

/// A DMA region with one writable grant per page.
///
/// Dropping revokes every grant before the memory is released.
pub struct SharedPages<H: XenHal> {
    region: DmaRegion<H>,
    grants: Arc<GrantTable>,
    refs: Vec<GrantRef>,
}

impl<H: XenHal> SharedPages<H> {
    pub fn new(
        hal: &Arc<H>,
        grants: &Arc<GrantTable>,
        backend: DomainId,
        pages: usize,
    ) -> Result<Self, HalError> {
        let region = DmaRegion::alloc(hal, pages)?;
        let refs = (0..region.pages())
            .map(|page| grants.grant_access(backend, region.frame(page), false))
            .collect();
        Ok(Self {
            region,
            grants: grants.clone(),
            refs,
        })
    }

    pub fn gref(&self, page: usize) -> GrantRef {
        self.refs[page]
    }

    pub fn refs(&self) -> &[GrantRef] {
        &self.refs
    }

    pub fn pages(&self) -> usize {
        self.region.pages()
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.region.as_ptr()
    }

    pub fn page_ptr(&self, page: usize) -> NonNull<u8> {
        self.region.page_ptr(page)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }
}

impl<H: XenHal> Drop for SharedPages<H> {
    fn drop(&mut self) {
        for &gref in self.refs.iter().rev() {
            self.grants.end_access(gref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xf_hal::mock::MockHal;

    #[test]
    fn test_each_page_granted_to_backend() {
        let hal = MockHal::new();
        let grants = Arc::new(GrantTable::setup(&*hal, 1).unwrap());
        let pages = SharedPages::new(&hal, &grants, 3, 4).unwrap();

        assert_eq!(pages.refs().len(), 4);
        for (i, &r) in pages.refs().iter().enumerate() {
            assert_eq!(grants.domid_of(r), 3);
            assert_eq!(hal.frame_ptr(grants.frame_of(r)), Some(pages.page_ptr(i).as_ptr()));
        }

        drop(pages);
        assert_eq!(grants.available(), grants.capacity());
        assert_eq!(hal.live_regions(), 0);
    }
}
