//! Driver configuration and buffer geometry.

use core::str::FromStr;

use crate::DisplayError;

/// Cookie naming the display buffer on the backend.
pub const DEFAULT_DBUF_COOKIE: u64 = 0xFEED_AFAF_FEED_BEEF;
/// Cookie naming the framebuffer on the backend.
pub const DEFAULT_FB_COOKIE: u64 = 0xFEED_BEEF_FEED_AFAF;

/// Configuration for a display frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Connector node under the frontend (`device/vdispl/<n>/<connector>`).
    pub connector: u32,
    /// Requested pixel format code; `None` selects `RG16`.
    pub fourcc: Option<u32>,
    /// Device row stride in bytes. Values below the natural stride are raised to it.
    pub stride: Option<u32>,
    /// Interval between dirty checks of the flip task.
    pub flip_period_ms: u64,
    /// Delay between polls of the backend state during the handshake.
    pub handshake_retry_ms: u64,
    pub dbuf_cookie: u64,
    pub fb_cookie: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            connector: 0,
            fourcc: None,
            stride: None,
            flip_period_ms: 10,
            handshake_retry_ms: 50,
            dbuf_cookie: DEFAULT_DBUF_COOKIE,
            fb_cookie: DEFAULT_FB_COOKIE,
        }
    }
}

/// Connector resolution as published by the toolstack: `"<width>x<height>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = DisplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s.split_once('x').ok_or(DisplayError::BadResolution)?;
        let width: u32 = w.trim().parse().map_err(|_| DisplayError::BadResolution)?;
        let height: u32 = h.trim().parse().map_err(|_| DisplayError::BadResolution)?;
        if width < 16 || height == 0 {
            return Err(DisplayError::BadResolution);
        }
        Ok(Self { width, height })
    }
}

impl core::fmt::Display for Resolution {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Sizes of the staging and device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    /// Row stride of the external and staging buffers.
    pub fstride: usize,
    /// Row stride of the device buffer.
    pub bstride: usize,
}

impl Geometry {
    pub fn new(resolution: Resolution, bpp: u32, stride: Option<u32>) -> Self {
        let fstride = resolution.width as usize * (bpp as usize).div_ceil(8);
        let bstride = stride.map_or(fstride, |s| (s as usize).max(fstride));
        Self {
            width: resolution.width,
            height: resolution.height,
            bpp,
            fstride,
            bstride,
        }
    }

    /// Bytes in the external and staging buffers.
    pub fn fsize(&self) -> usize {
        self.fstride * self.height as usize
    }

    /// Bytes in the device buffer.
    pub fn bsize(&self) -> usize {
        self.bstride * self.height as usize
    }

    /// Device buffer size as carried by DBUF_CREATE. Geometries whose buffer
    /// does not fit the 32-bit field are rejected.
    pub fn buffer_sz(&self) -> Result<u32, DisplayError> {
        self.bstride
            .checked_mul(self.height as usize)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(DisplayError::BadResolution)
    }
}
