//! Frame buffers: external (producer), staging and device (shared with the
//! backend through a grant directory).
//!
//! The producer draws into the external buffer and calls [`FrameBuffers::update`],
//! which snapshots it into staging and marks the frame dirty. The flip task
//! later moves staging into the device buffer with [`FrameBuffers::publish`].
//! Both steps run under the same IRQ-safe lock, so bursts of updates between
//! two flips collapse into one.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use xen_transport::{GrantRef, GrantTable, PageDirectory};
use xf_hal::{DomainId, HalError, IrqSafeLock, XenHal};

use crate::config::Geometry;
use crate::protocol::PixelFormat;

/// Copy `rows` rows of `src` (stride `src_stride`) into `dst` (stride
/// `dst_stride`). Each row copies `min(src_stride, dst_stride)` bytes; equal
/// strides are copied in one piece.
pub fn copy_rows(src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize, rows: usize) {
    if src_stride == dst_stride {
        let len = src_stride * rows;
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    let width = src_stride.min(dst_stride);
    for (d, s) in dst
        .chunks_mut(dst_stride)
        .zip(src.chunks(src_stride))
        .take(rows)
    {
        d[..width].copy_from_slice(&s[..width]);
    }
}

fn zeroed_vec(len: usize) -> Result<Vec<u8>, HalError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| HalError::OutOfMemory)?;
    v.resize(len, 0);
    Ok(v)
}

struct Surfaces<H: XenHal> {
    staging: Vec<u8>,
    device: PageDirectory<H>,
}

pub struct FrameBuffers<H: XenHal> {
    geometry: Geometry,
    format: PixelFormat,
    external: IrqSafeLock<Vec<u8>>,
    surfaces: IrqSafeLock<Surfaces<H>>,
    dirty: AtomicBool,
}

impl<H: XenHal> FrameBuffers<H> {
    /// Allocate all three buffers and grant the device buffer to `backend`.
    pub fn new(
        hal: &Arc<H>,
        grants: &Arc<GrantTable>,
        backend: DomainId,
        geometry: Geometry,
        format: PixelFormat,
    ) -> Result<Self, HalError> {
        let external = zeroed_vec(geometry.fsize())?;
        let staging = zeroed_vec(geometry.fsize())?;
        let device = PageDirectory::build(hal, grants, backend, geometry.bsize())?;
        log::debug!(
            "[VDISPL] buffers: {}x{}x{} stride {}/{} device {} bytes",
            geometry.width,
            geometry.height,
            geometry.bpp,
            geometry.fstride,
            geometry.bstride,
            geometry.bsize()
        );
        Ok(Self {
            geometry,
            format,
            external: IrqSafeLock::new(external),
            surfaces: IrqSafeLock::new(Surfaces { staging, device }),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// First page of the device buffer's grant directory.
    pub fn directory(&self) -> GrantRef {
        self.surfaces.lock().device.head()
    }

    /// Give the producer its buffer (`fstride * height` bytes).
    pub fn with_external<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.external.lock())
    }

    /// Draw into the external buffer with `embedded-graphics`.
    pub fn draw<R>(&self, f: impl FnOnce(&mut Canvas<'_>) -> R) -> R {
        let (geometry, format) = (self.geometry, self.format);
        self.with_external(|buf| f(&mut Canvas { buf, geometry, format }))
    }

    /// Snapshot the external buffer into staging and schedule a flip.
    pub fn update(&self) {
        let external = self.external.lock();
        self.surfaces.lock().staging.copy_from_slice(&external);
        drop(external);
        self.mark_dirty();
    }

    /// Clear staging and schedule a flip.
    pub fn blank(&self) {
        self.surfaces.lock().staging.fill(0);
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        let _ = self
            .dirty
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Copy staging into the device buffer.
    pub fn publish(&self) {
        let g = self.geometry;
        let mut surfaces = self.surfaces.lock();
        let Surfaces { staging, device } = &mut *surfaces;
        copy_rows(staging, g.fstride, device.buffer_mut(), g.bstride, g.height as usize);
    }

    /// Read the device buffer under the buffer lock.
    pub fn with_device<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.surfaces.lock().device.buffer())
    }
}

/// `DrawTarget` over the external buffer, encoding in the negotiated format.
pub struct Canvas<'a> {
    buf: &'a mut [u8],
    geometry: Geometry,
    format: PixelFormat,
}

impl DrawTarget for Canvas<'_> {
    type Color = Rgb888;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = (self.geometry.width as i32, self.geometry.height as i32);
        let bpp = self.format.bytes_per_pixel();
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.x < width && point.y >= 0 && point.y < height {
                let offset = point.y as usize * self.geometry.fstride + point.x as usize * bpp;
                if let Some(px) = self.buf.get_mut(offset..offset + bpp) {
                    self.format.encode(color, px);
                }
            }
        }
        Ok(())
    }
}

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        Size::new(self.geometry.width, self.geometry.height)
    }
}
