//! Pointer events as seen by whoever consumes them (cursor, window system).
//!
//! Input frontends translate their wire records into [`PointerEvent`]s and
//! hand them to a [`PointerSink`]. Button state is carried in every event as a
//! [`Buttons`] mask.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use bitflags::bitflags;

bitflags! {
    /// Pointer button mask. Wheel bits are pulses: set for the one event
    /// that carries the wheel motion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u32 {
        const LEFT = 1 << 0;
        const MIDDLE = 1 << 1;
        const RIGHT = 1 << 2;
        const WHEEL_UP = 1 << 3;
        const WHEEL_DOWN = 1 << 4;

        const WHEEL = Self::WHEEL_UP.bits() | Self::WHEEL_DOWN.bits();
    }
}

impl Buttons {
    /// Wheel bits for a vertical wheel delta: positive scrolls up.
    pub fn from_wheel(dz: i32) -> Self {
        match dz.signum() {
            1 => Self::WHEEL_UP,
            -1 => Self::WHEEL_DOWN,
            _ => Self::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    /// Movement relative to the last position.
    Relative {
        dx: i32,
        dy: i32,
        buttons: Buttons,
        msec: u64,
    },
    /// Position in device coordinates.
    Absolute {
        x: i32,
        y: i32,
        buttons: Buttons,
        msec: u64,
    },
}

impl PointerEvent {
    pub fn buttons(&self) -> Buttons {
        match *self {
            Self::Relative { buttons, .. } | Self::Absolute { buttons, .. } => buttons,
        }
    }

    pub fn msec(&self) -> u64 {
        match *self {
            Self::Relative { msec, .. } | Self::Absolute { msec, .. } => msec,
        }
    }
}

/// Receives pointer events from an input driver.
///
/// Called from the driver's drain task, once per record, in arrival order.
pub trait PointerSink: Send {
    fn track(&mut self, event: PointerEvent);
}

impl<F: FnMut(PointerEvent) + Send> PointerSink for F {
    fn track(&mut self, event: PointerEvent) {
        self(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_button_bits() {
        assert_eq!(Buttons::LEFT.bits(), 1);
        assert_eq!(Buttons::MIDDLE.bits(), 2);
        assert_eq!(Buttons::RIGHT.bits(), 4);
        assert_eq!(Buttons::WHEEL_UP.bits(), 8);
        assert_eq!(Buttons::WHEEL_DOWN.bits(), 16);
        assert_eq!(Buttons::WHEEL.bits(), 24);
    }

    #[test]
    fn test_from_wheel() {
        assert_eq!(Buttons::from_wheel(0), Buttons::empty());
        assert_eq!(Buttons::from_wheel(3), Buttons::WHEEL_UP);
        assert_eq!(Buttons::from_wheel(-1), Buttons::WHEEL_DOWN);
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |ev: PointerEvent| seen.push(ev);
            sink.track(PointerEvent::Absolute {
                x: 10,
                y: 20,
                buttons: Buttons::LEFT,
                msec: 5,
            });
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].buttons(), Buttons::LEFT);
        assert_eq!(seen[0].msec(), 5);
    }
}
