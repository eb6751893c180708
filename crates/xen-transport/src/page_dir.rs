//! Grant-reference directory for multi-page buffers.
//!
//! Each directory page is `{ next: u32, gref[MAX_PD] }`: `next` is the grant
//! reference of the following directory page (0 on the last one) and the
//! array lists the buffer's page grants in order.

use alloc::sync::Arc;
use core::mem::size_of;

use xf_hal::{pages_for, DomainId, HalError, XenHal, PAGE_SIZE};

use crate::grant::{GrantRef, GrantTable};
use crate::shared::SharedPages;

const NEXT_OFFSET: usize = 0;
const GREF_OFFSET: usize = size_of::<u32>();

/// Grant references one directory page can index.
pub const MAX_PD: usize = (PAGE_SIZE - GREF_OFFSET) / size_of::<u32>();

/// Directory pages needed for a buffer of `pages` pages.
pub const fn directory_pages(pages: usize) -> usize {
    if pages == 0 {
        1
    } else {
        pages.div_ceil(MAX_PD)
    }
}

/// A shared buffer plus the directory that tells the back end where it is.
pub struct PageDirectory<H: XenHal> {
    buffer: SharedPages<H>,
    dir: SharedPages<H>,
}

impl<H: XenHal> PageDirectory<H> {
    /// Allocate and grant a zeroed buffer of `bytes` bytes and its directory.
    ///
    /// On failure everything allocated so far is revoked and freed.
    pub fn build(
        hal: &Arc<H>,
        grants: &Arc<GrantTable>,
        backend: DomainId,
        bytes: usize,
    ) -> Result<Self, HalError> {
        let pages = pages_for(bytes);
        let buffer = SharedPages::new(hal, grants, backend, pages)?;
        let mut dir = SharedPages::new(hal, grants, backend, directory_pages(pages))?;

        let dir_refs: alloc::vec::Vec<GrantRef> = dir.refs().to_vec();
        let dir_bytes = dir.as_mut_slice();
        for (j, chunk) in buffer.refs().chunks(MAX_PD).enumerate() {
            let page = &mut dir_bytes[j * PAGE_SIZE..(j + 1) * PAGE_SIZE];
            let next = dir_refs.get(j + 1).map_or(0, |r| r.raw());
            page[NEXT_OFFSET..NEXT_OFFSET + 4].copy_from_slice(&next.to_le_bytes());
            for (k, gref) in chunk.iter().enumerate() {
                let at = GREF_OFFSET + k * 4;
                page[at..at + 4].copy_from_slice(&gref.raw().to_le_bytes());
            }
        }

        log::debug!(
            "[GNTTAB] directory: {} buffer pages, {} directory pages, head {}",
            pages,
            dir.pages(),
            dir.gref(0)
        );
        Ok(Self { buffer, dir })
    }

    /// Grant reference of the first directory page.
    pub fn head(&self) -> GrantRef {
        self.dir.gref(0)
    }

    pub fn directory_pages(&self) -> usize {
        self.dir.pages()
    }

    pub fn buffer_refs(&self) -> &[GrantRef] {
        self.buffer.refs()
    }

    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// Raw directory page `j`.
    pub fn directory_page(&self, j: usize) -> &[u8] {
        &self.dir.as_slice()[j * PAGE_SIZE..(j + 1) * PAGE_SIZE]
    }
}

/// Decode a directory page into (next, grefs).
pub fn parse_directory_page(page: &[u8]) -> (u32, impl Iterator<Item = u32> + '_) {
    let word = |at: usize| u32::from_le_bytes([page[at], page[at + 1], page[at + 2], page[at + 3]]);
    let next = word(NEXT_OFFSET);
    let grefs = (0..MAX_PD).map(move |k| word(GREF_OFFSET + k * 4));
    (next, grefs)
}
