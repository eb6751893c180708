//! displif wire format.
//!
//! Requests, responses and events are all 64-byte records. Request payloads
//! start at byte 8 and are laid out by the `#[repr(C)]` structs below.

pub mod formats;

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use xen_transport::{ControlRequest, ControlResponse, EventLayout};

pub use formats::{fourcc_code, PixelFormat};

const PAYLOAD_LEN: usize = 56;

/// Control ring operations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    DbufCreate = 0x10,
    DbufDestroy = 0x11,
    FbAttach = 0x12,
    FbDetach = 0x13,
    SetConfig = 0x14,
    PgFlip = 0x15,
}

impl Operation {
    pub fn from_raw(op: u8) -> Option<Self> {
        Some(match op {
            0x10 => Self::DbufCreate,
            0x11 => Self::DbufDestroy,
            0x12 => Self::FbAttach,
            0x13 => Self::FbDetach,
            0x14 => Self::SetConfig,
            0x15 => Self::PgFlip,
            _ => return None,
        })
    }
}

/// Event type: a page flip completed.
pub const EVT_PG_FLIP: u8 = 0x00;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DbufCreate {
    pub dbuf_cookie: u64,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub buffer_sz: u32,
    pub flags: u32,
    /// First page of the buffer's grant directory.
    pub gref_directory: u32,
    pub data_ofs: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FbAttach {
    pub dbuf_cookie: u64,
    pub fb_cookie: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SetConfig {
    pub fb_cookie: u64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub reserved: u32,
}

/// Payload of the operations that only name a buffer or framebuffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Cookie {
    pub cookie: u64,
}

/// A control request before it is given an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    DbufCreate(DbufCreate),
    DbufDestroy { dbuf_cookie: u64 },
    FbAttach(FbAttach),
    FbDetach { fb_cookie: u64 },
    SetConfig(SetConfig),
    PgFlip { fb_cookie: u64 },
}

impl Command {
    pub fn operation(&self) -> Operation {
        match self {
            Self::DbufCreate(_) => Operation::DbufCreate,
            Self::DbufDestroy { .. } => Operation::DbufDestroy,
            Self::FbAttach(_) => Operation::FbAttach,
            Self::FbDetach { .. } => Operation::FbDetach,
            Self::SetConfig(_) => Operation::SetConfig,
            Self::PgFlip { .. } => Operation::PgFlip,
        }
    }

    pub fn to_request(&self) -> DisplRequest {
        let mut req = DisplRequest::zeroed();
        req.operation = self.operation() as u8;
        match self {
            Self::DbufCreate(p) => req.set_payload(p),
            Self::FbAttach(p) => req.set_payload(p),
            Self::SetConfig(p) => req.set_payload(p),
            Self::DbufDestroy { dbuf_cookie: cookie }
            | Self::FbDetach { fb_cookie: cookie }
            | Self::PgFlip { fb_cookie: cookie } => req.set_payload(&Cookie { cookie: *cookie }),
        }
        req
    }
}

/// `struct xendispl_req`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DisplRequest {
    pub id: u16,
    pub operation: u8,
    reserved: [u8; 5],
    payload: [u8; PAYLOAD_LEN],
}

impl DisplRequest {
    fn set_payload<T: Pod>(&mut self, payload: &T) {
        let bytes = bytemuck::bytes_of(payload);
        self.payload[..bytes.len()].copy_from_slice(bytes);
    }

    /// Decode the payload as `T`.
    pub fn payload<T: Pod>(&self) -> T {
        bytemuck::pod_read_unaligned(&self.payload[..size_of::<T>()])
    }
}

impl ControlRequest for DisplRequest {
    fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn operation(&self) -> u8 {
        self.operation
    }
}

/// `struct xendispl_resp`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DisplResponse {
    pub id: u16,
    pub operation: u8,
    reserved: u8,
    pub status: i32,
    reserved2: [u8; PAYLOAD_LEN],
}

impl DisplResponse {
    /// Answer to `req` with `status`.
    pub fn reply(req: &DisplRequest, status: i32) -> Self {
        Self {
            id: req.id,
            operation: req.operation,
            status,
            ..Self::zeroed()
        }
    }
}

impl ControlResponse for DisplResponse {
    fn id(&self) -> u16 {
        self.id
    }

    fn operation(&self) -> u8 {
        self.operation
    }

    fn status(&self) -> i32 {
        self.status
    }
}

/// `struct xendispl_evt`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DisplEvent {
    pub id: u16,
    pub kind: u8,
    reserved: [u8; 5],
    payload: [u8; PAYLOAD_LEN],
}

impl DisplEvent {
    pub fn page_flip(id: u16, fb_cookie: u64) -> Self {
        let mut ev = Self {
            id,
            kind: EVT_PG_FLIP,
            ..Self::zeroed()
        };
        ev.payload[..8].copy_from_slice(&fb_cookie.to_le_bytes());
        ev
    }

    /// Framebuffer named by a page-flip event.
    pub fn fb_cookie(&self) -> u64 {
        bytemuck::pod_read_unaligned::<Cookie>(&self.payload[..8]).cookie
    }
}

/// Event page: `in_cons`, `in_prod`, then 63 events after a 64-byte header.
pub struct DisplLayout;

impl EventLayout for DisplLayout {
    const CONS_OFFSET: usize = 0;
    const PROD_OFFSET: usize = 4;
    const RING_OFFSET: usize = 64;
    const RING_LEN: u32 = 63;

    type Event = DisplEvent;
}

const _: () = assert!(size_of::<DisplRequest>() == 64);
const _: () = assert!(size_of::<DisplResponse>() == 64);
const _: () = assert!(size_of::<DisplEvent>() == 64);
