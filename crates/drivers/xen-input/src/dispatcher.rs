//! Translation of kbdif events into pointer events and scancodes.

use alloc::sync::Arc;

use input_device::{Buttons, PointerEvent, PointerSink};

use crate::protocol::{InputRecord, KbdEvent, BTN_LEFT, BTN_MIDDLE, BTN_RIGHT};
use crate::scancode::ScancodeQueue;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTelemetry {
    pub pointer_events: u64,
    pub scancodes: u64,
    pub unknown_events: u64,
}

fn pointer_button(keycode: u32) -> Option<Buttons> {
    match keycode {
        BTN_LEFT => Some(Buttons::LEFT),
        BTN_RIGHT => Some(Buttons::RIGHT),
        BTN_MIDDLE => Some(Buttons::MIDDLE),
        _ => None,
    }
}

/// Keyboard scancode for `keycode`: low 7 bits, high bit set on release.
pub fn key_scancode(keycode: u32, pressed: bool) -> u8 {
    let code = (keycode & 0x7f) as u8;
    if pressed {
        code
    } else {
        code | 0x80
    }
}

/// Per-device dispatch state. Button state persists across events.
pub struct InputDispatcher<P: PointerSink> {
    sink: P,
    buttons: Buttons,
    scancodes: Arc<ScancodeQueue>,
    telemetry: DispatchTelemetry,
}

impl<P: PointerSink> InputDispatcher<P> {
    pub fn new(sink: P, scancodes: Arc<ScancodeQueue>) -> Self {
        Self {
            sink,
            buttons: Buttons::empty(),
            scancodes,
            telemetry: DispatchTelemetry::default(),
        }
    }

    pub fn buttons(&self) -> Buttons {
        self.buttons
    }

    pub fn telemetry(&self) -> DispatchTelemetry {
        self.telemetry
    }

    fn track(&mut self, event: PointerEvent) {
        self.telemetry.pointer_events += 1;
        self.sink.track(event);
    }

    pub fn dispatch(&mut self, event: &KbdEvent, msec: u64) {
        match event.record() {
            InputRecord::Motion { rel_x, rel_y, rel_z } => {
                // Wheel motion becomes a one-event button 4/5 click.
                self.buttons.remove(Buttons::WHEEL);
                self.buttons |= Buttons::from_wheel(rel_z);
                self.track(PointerEvent::Relative {
                    dx: rel_x,
                    dy: rel_y,
                    buttons: self.buttons,
                    msec,
                });
            }
            InputRecord::Position { abs_x, abs_y, .. } => {
                self.track(PointerEvent::Absolute {
                    x: abs_x,
                    y: abs_y,
                    buttons: self.buttons,
                    msec,
                });
            }
            InputRecord::Key { pressed, keycode } => match pointer_button(keycode) {
                Some(button) => {
                    self.buttons.set(button, pressed);
                    self.track(PointerEvent::Relative {
                        dx: 0,
                        dy: 0,
                        buttons: self.buttons,
                        msec,
                    });
                }
                None => {
                    self.telemetry.scancodes += 1;
                    if self.scancodes.push(key_scancode(keycode, pressed)) {
                        log::trace!("[VKBD] scancode queue full, dropped oldest");
                    }
                }
            },
            InputRecord::Unknown(kind) => {
                self.telemetry.unknown_events += 1;
                log::warn!("[VKBD] unknown event type {}", kind);
            }
        }
    }
}
