//! Xen paravirtual display frontend (`vdispl`).
//!
//! A [`VirtualDisplay`] owns one connector of a `device/vdispl/<n>` node:
//! a grant-shared device buffer, the control ring used for buffer and
//! framebuffer operations, the event ring carrying flip completions, and the
//! background task that flips dirty frames.
//!
//! ```text
//! producer ──update()──▶ staging ──flip task──▶ device buffer ──PG_FLIP──▶ backend
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod flip;
pub mod framebuffer;
pub mod protocol;

#[cfg(test)]
mod mock;

pub use config::{DisplayConfig, Geometry, Resolution};
pub use device::{probe_all, shutdown_all, DisplayRegistry, DisplayState, DisplayTelemetry, VirtualDisplay};
pub use flip::{FlipController, FlipTelemetry};
pub use framebuffer::{copy_rows, Canvas, FrameBuffers};
pub use protocol::{fourcc_code, Command, Operation, PixelFormat};

use xen_transport::{RingError, XenbusError};
use xf_error::define_driver_error;
use xf_hal::HalError;

define_driver_error! {
    /// Display frontend errors.
    pub enum DisplayError(0x10) {
        /// Store key missing or handshake write failed
        Xenbus(XenbusError) = 0x01 => "Store access failed",
        /// Buffer, page or port allocation failed
        Hal(HalError) = 0x02 => "Platform operation failed",
        /// Control ring failure
        Ring(RingError) = 0x03 => "Control ring failure",
        /// Resolution is not "<width>x<height>" with width >= 16
        BadResolution = 0x04 => "Invalid resolution",
        /// Device is not connected
        NotConnected = 0x05 => "Display not connected",
    }
}
