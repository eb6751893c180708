//! kbdif event page.
//!
//! Only the backend-to-frontend ring is used. Events are 40-byte records
//! whose first byte is the type.

use bytemuck::{Pod, Zeroable};
use xen_transport::EventLayout;

pub const TYPE_MOTION: u8 = 1;
pub const TYPE_KEY: u8 = 3;
pub const TYPE_POS: u8 = 4;

/// Key codes the backend uses for pointer buttons.
pub const BTN_LEFT: u32 = 0x110;
pub const BTN_RIGHT: u32 = 0x111;
pub const BTN_MIDDLE: u32 = 0x112;

const EVENT_SIZE: usize = 40;

/// `union xenkbd_in_event`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct KbdEvent {
    raw: [u8; EVENT_SIZE],
}

/// A decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRecord {
    Motion { rel_x: i32, rel_y: i32, rel_z: i32 },
    Key { pressed: bool, keycode: u32 },
    Position { abs_x: i32, abs_y: i32, rel_z: i32 },
    Unknown(u8),
}

impl KbdEvent {
    fn word(&self, at: usize) -> [u8; 4] {
        [self.raw[at], self.raw[at + 1], self.raw[at + 2], self.raw[at + 3]]
    }

    fn int(&self, at: usize) -> i32 {
        i32::from_le_bytes(self.word(at))
    }

    fn put(&mut self, at: usize, value: [u8; 4]) {
        self.raw[at..at + 4].copy_from_slice(&value);
    }

    pub fn kind(&self) -> u8 {
        self.raw[0]
    }

    pub fn record(&self) -> InputRecord {
        match self.kind() {
            TYPE_MOTION => InputRecord::Motion {
                rel_x: self.int(4),
                rel_y: self.int(8),
                rel_z: self.int(12),
            },
            TYPE_KEY => InputRecord::Key {
                pressed: self.raw[1] != 0,
                keycode: u32::from_le_bytes(self.word(4)),
            },
            TYPE_POS => InputRecord::Position {
                abs_x: self.int(4),
                abs_y: self.int(8),
                rel_z: self.int(12),
            },
            other => InputRecord::Unknown(other),
        }
    }

    pub fn encode(record: InputRecord) -> Self {
        let mut ev = Self::zeroed();
        match record {
            InputRecord::Motion { rel_x, rel_y, rel_z } => {
                ev.raw[0] = TYPE_MOTION;
                ev.put(4, rel_x.to_le_bytes());
                ev.put(8, rel_y.to_le_bytes());
                ev.put(12, rel_z.to_le_bytes());
            }
            InputRecord::Key { pressed, keycode } => {
                ev.raw[0] = TYPE_KEY;
                ev.raw[1] = u8::from(pressed);
                ev.put(4, keycode.to_le_bytes());
            }
            InputRecord::Position { abs_x, abs_y, rel_z } => {
                ev.raw[0] = TYPE_POS;
                ev.put(4, abs_x.to_le_bytes());
                ev.put(8, abs_y.to_le_bytes());
                ev.put(12, rel_z.to_le_bytes());
            }
            InputRecord::Unknown(kind) => ev.raw[0] = kind,
        }
        ev
    }
}

/// Input ring: `in_cons`@0, `in_prod`@4, 2048 bytes of events from offset 1024.
pub struct KbdLayout;

impl EventLayout for KbdLayout {
    const CONS_OFFSET: usize = 0;
    const PROD_OFFSET: usize = 4;
    const RING_OFFSET: usize = 1024;
    const RING_LEN: u32 = (2048 / EVENT_SIZE) as u32;

    type Event = KbdEvent;
}
