//! Shared-memory transport for Xen paravirtual frontends.
//!
//! - [`grant`]: grant table entries and the reference allocator
//! - [`ring`]: the `sring` control ring (front and back ends)
//! - [`call`]: synchronous request/response calls on a control ring
//! - [`event`]: backend-produced event rings and their consumer
//! - [`page_dir`]: grant directories for multi-page buffers
//! - [`xenbus`]: store paths and the connection state handshake

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod call;
pub mod event;
pub mod grant;
pub mod page_dir;
pub mod ring;
pub mod shared;
pub mod xenbus;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use call::{CallState, CallStats, ControlChannel, ControlRequest, ControlResponse};
pub use event::{EventConsumer, EventLayout, EventRing};
pub use grant::{GrantFlags, GrantRef, GrantTable, DEFAULT_GRANT_FRAMES};
pub use page_dir::{PageDirectory, MAX_PD};
pub use ring::FrontRing;
pub use shared::SharedPages;
pub use xenbus::{enumerate, DeviceKey, Frontend, XenStore, XenbusState};

use xf_error::define_driver_error;
use xf_hal::HalError;

define_driver_error! {
    /// Grant table errors.
    pub enum GrantError(0x02) {
        /// Hypervisor refused to map the table
        SetupFailed = 0x01 => "Grant table setup failed",
    }
}

define_driver_error! {
    /// Shared ring errors.
    pub enum RingError(0x03) {
        /// No free request slot
        Full = 0x01 => "Ring full",
        /// Shared area cannot hold even one slot
        TooSmall = 0x02 => "Ring page too small",
        /// Page or port allocation failed
        Hal(HalError) = 0x03 => "Ring setup failed",
    }
}

define_driver_error! {
    /// Configuration store errors.
    pub enum XenbusError(0x04) {
        /// Key not present
        Missing = 0x01 => "Store key missing",
        /// Value does not parse
        Malformed = 0x02 => "Store value malformed",
        /// Store rejected the access
        Io = 0x03 => "Store access failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::format;

    #[test]
    fn test_error_codes() {
        assert_eq!(GrantError::SetupFailed.code(), 0x0201);
        assert_eq!(RingError::Hal(HalError::NoPort).code(), 0x0303);
        assert_eq!(XenbusError::Malformed.code(), 0x0402);
        assert_eq!(
            format!("{}", RingError::Hal(HalError::OutOfMemory)),
            "E0303: Ring setup failed (E0101: Out of DMA memory)"
        );
    }
}
