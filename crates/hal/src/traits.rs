//! Hypervisor-facing platform interface.
//!
//! Drivers never call the hypervisor or the host kernel directly; everything
//! goes through an `Arc<H: XenHal>` handed in at probe time.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::HalError;

/// Xen domain identifier.
pub type DomainId = u16;

/// Event channel port number.
pub type Port = u32;

/// Event channel handler.
///
/// Called from interrupt context: implementations must not block.
pub trait EventChannelHandler: Send + Sync {
    fn handle(&self, port: Port);
}

/// Platform services required by the frontends.
///
/// # Safety
///
/// Implementors must guarantee that:
/// - `dma_alloc` returns zeroed, page-aligned memory of `pages * PAGE_SIZE`
///   bytes whose machine frames are contiguous starting at the returned frame
/// - the memory stays mapped until the matching `dma_dealloc`
/// - `setup_grant_table` maps `nr_frames` pages of the grant table and keeps
///   them mapped for the lifetime of the implementor
/// - handlers passed to `bind_port` are invoked for every notification on
///   that port until `unbind_port` returns
pub unsafe trait XenHal: Send + Sync + 'static {
    /// Allocate zeroed shareable pages. Returns (first machine frame, virtual address).
    fn dma_alloc(&self, pages: usize) -> Option<(u64, NonNull<u8>)>;

    /// Release pages returned by `dma_alloc`.
    ///
    /// # Safety
    ///
    /// `frame`, `vaddr` and `pages` must come from one `dma_alloc` call and no
    /// grant to those frames may still be active.
    unsafe fn dma_dealloc(&self, frame: u64, vaddr: NonNull<u8>, pages: usize);

    /// Map the grant table frames. Returns the address of entry 0.
    fn setup_grant_table(&self, nr_frames: usize) -> Option<NonNull<u8>>;

    /// Allocate an unbound event channel the remote domain may bind to.
    fn alloc_unbound_port(&self, remote: DomainId) -> Result<Port, HalError>;

    fn close_port(&self, port: Port);

    /// Signal the remote end of `port`.
    fn notify(&self, port: Port);

    fn bind_port(&self, port: Port, handler: Arc<dyn EventChannelHandler>) -> Result<(), HalError>;

    fn unbind_port(&self, port: Port);

    /// Start a background task.
    fn spawn(&self, name: &'static str, task: Box<dyn FnOnce() + Send + 'static>) -> Result<(), HalError>;

    /// Block the calling task for at least `ms` milliseconds.
    fn sleep_ms(&self, ms: u64);

    /// Block until the next interrupt or scheduler tick.
    fn idle(&self);

    /// Monotonic time in milliseconds.
    fn now_ms(&self) -> u64;

    /// Give the backend domain a chance to run.
    fn yield_to_hypervisor(&self) {
        self.idle();
    }
}
