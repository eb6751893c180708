//! Host-side `XenHal` for tests.
//!
//! Frames are synthetic numbers mapped to heap pages; event channels are a
//! port table with handler dispatch. A remote hook stands in for the backend
//! domain and is invoked on every `notify`.

extern crate std;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::boxed::Box;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use std::vec::Vec;

use core::ptr::NonNull;

use crate::dma::PAGE_SIZE;
use crate::traits::{DomainId, EventChannelHandler, Port, XenHal};
use crate::HalError;

type RemoteHook = Arc<dyn Fn(Port) + Send + Sync>;

#[derive(Default)]
struct MockState {
    next_frame: u64,
    regions: BTreeMap<u64, (usize, usize)>,
    allocations_left: Option<usize>,
    refuse_spawn: bool,
    grant_table: Option<(usize, usize)>,
    next_port: Port,
    handlers: HashMap<Port, Arc<dyn EventChannelHandler>>,
    open_ports: Vec<Port>,
    notifications: HashMap<Port, usize>,
    remote: Option<RemoteHook>,
}

pub struct MockHal {
    state: Mutex<MockState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    start: Instant,
}

fn layout(pages: usize) -> Option<Layout> {
    Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).ok()
}

impl MockHal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_frame: 0x1000,
                next_port: 1,
                ..MockState::default()
            }),
            tasks: Mutex::new(Vec::new()),
            start: Instant::now(),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the stand-in for the remote domain.
    pub fn set_remote(&self, hook: impl Fn(Port) + Send + Sync + 'static) {
        self.state().remote = Some(Arc::new(hook));
    }

    /// Deliver an event on `port` as the remote side would.
    pub fn raise(&self, port: Port) {
        let handler = self.state().handlers.get(&port).cloned();
        if let Some(handler) = handler {
            handler.handle(port);
        }
    }

    /// Virtual address backing machine frame `frame`.
    pub fn frame_ptr(&self, frame: u64) -> Option<*mut u8> {
        let state = self.state();
        let (&first, &(addr, pages)) = state.regions.range(..=frame).next_back()?;
        let page = (frame - first) as usize;
        (page < pages).then_some((addr + page * PAGE_SIZE) as *mut u8)
    }

    /// Let `n` more DMA allocations succeed, then fail.
    pub fn fail_allocations_after(&self, n: usize) {
        self.state().allocations_left = Some(n);
    }

    /// Make every later `spawn` fail with `HalError::Spawn`.
    pub fn fail_spawns(&self) {
        self.state().refuse_spawn = true;
    }

    pub fn live_regions(&self) -> usize {
        self.state().regions.len()
    }

    pub fn notifications(&self, port: Port) -> usize {
        self.state().notifications.get(&port).copied().unwrap_or(0)
    }

    pub fn is_bound(&self, port: Port) -> bool {
        self.state().handlers.contains_key(&port)
    }

    pub fn is_open(&self, port: Port) -> bool {
        self.state().open_ports.contains(&port)
    }

    /// Wait for every spawned task to return.
    pub fn join_tasks(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.join();
        }
    }
}

// SAFETY: allocations are zeroed, page aligned and stay live until dma_dealloc;
// consecutive synthetic frames map to consecutive pages of one allocation.
unsafe impl XenHal for MockHal {
    fn dma_alloc(&self, pages: usize) -> Option<(u64, NonNull<u8>)> {
        let mut state = self.state();
        if let Some(left) = state.allocations_left.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }
        // SAFETY: layout has non-zero size
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout(pages)?) })?;
        let frame = state.next_frame;
        // Leave a hole so adjacent regions never look contiguous.
        state.next_frame += pages as u64 + 1;
        state.regions.insert(frame, (ptr.as_ptr() as usize, pages));
        Some((frame, ptr))
    }

    unsafe fn dma_dealloc(&self, frame: u64, vaddr: NonNull<u8>, pages: usize) {
        let removed = self.state().regions.remove(&frame);
        assert_eq!(removed, Some((vaddr.as_ptr() as usize, pages)), "bad dma_dealloc");
        if let Some(layout) = layout(pages) {
            dealloc(vaddr.as_ptr(), layout);
        }
    }

    fn setup_grant_table(&self, nr_frames: usize) -> Option<NonNull<u8>> {
        let mut state = self.state();
        if let Some((addr, _)) = state.grant_table {
            return NonNull::new(addr as *mut u8);
        }
        // SAFETY: layout has non-zero size
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout(nr_frames)?) })?;
        state.grant_table = Some((ptr.as_ptr() as usize, nr_frames));
        Some(ptr)
    }

    fn alloc_unbound_port(&self, _remote: DomainId) -> Result<Port, HalError> {
        let mut state = self.state();
        let port = state.next_port;
        state.next_port += 1;
        state.open_ports.push(port);
        Ok(port)
    }

    fn close_port(&self, port: Port) {
        self.state().open_ports.retain(|&p| p != port);
    }

    fn notify(&self, port: Port) {
        let remote = {
            let mut state = self.state();
            *state.notifications.entry(port).or_default() += 1;
            state.remote.clone()
        };
        if let Some(remote) = remote {
            remote(port);
        }
    }

    fn bind_port(&self, port: Port, handler: Arc<dyn EventChannelHandler>) -> Result<(), HalError> {
        let mut state = self.state();
        if !state.open_ports.contains(&port) {
            return Err(HalError::NoPort);
        }
        state.handlers.insert(port, handler);
        Ok(())
    }

    fn unbind_port(&self, port: Port) {
        self.state().handlers.remove(&port);
    }

    fn spawn(&self, name: &'static str, task: Box<dyn FnOnce() + Send + 'static>) -> Result<(), HalError> {
        if self.state().refuse_spawn {
            return Err(HalError::Spawn);
        }
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(task)
            .map_err(|_| HalError::Spawn)?;
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn idle(&self) {
        std::thread::sleep(Duration::from_micros(200));
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Drop for MockHal {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, (addr, pages)) in core::mem::take(&mut state.regions) {
            if let Some(layout) = layout(pages) {
                // SAFETY: leaked region allocated in dma_alloc with this layout
                unsafe { dealloc(addr as *mut u8, layout) };
            }
        }
        if let Some((addr, pages)) = state.grant_table.take() {
            if let Some(layout) = layout(pages) {
                // SAFETY: allocated in setup_grant_table with this layout
                unsafe { dealloc(addr as *mut u8, layout) };
            }
        }
    }
}
