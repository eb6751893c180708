//! Xen paravirtual keyboard and pointer frontend (`vkbd`).
//!
//! Events from the backend are drained by a background task. Pointer motion,
//! positions and button keys go to a [`PointerSink`](input_device::PointerSink);
//! every other key becomes a scancode in a bounded queue with one reader.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod device;
pub mod dispatcher;
pub mod protocol;
pub mod scancode;

pub use device::{probe_all, shutdown_all, InputConfig, InputRegistry, InputState, InputTelemetry, VirtualInput};
pub use dispatcher::{key_scancode, DispatchTelemetry, InputDispatcher};
pub use protocol::{InputRecord, KbdEvent, KbdLayout};
pub use scancode::{ScancodeQueue, ScancodeReader, SCANCODE_QUEUE_LEN};

use xen_transport::XenbusError;
use xf_error::define_driver_error;
use xf_hal::HalError;

define_driver_error! {
    /// Input frontend errors.
    pub enum InputError(0x11) {
        /// Store key missing or handshake write failed
        Xenbus(XenbusError) = 0x01 => "Store access failed",
        /// Page, port or task allocation failed
        Hal(HalError) = 0x02 => "Platform operation failed",
        /// Scancode stream already open
        InUse = 0x03 => "Scancode reader already open",
        /// Device is not connected
        NotConnected = 0x04 => "Input device not connected",
    }
}
