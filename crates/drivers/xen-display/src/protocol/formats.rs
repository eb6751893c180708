//! Pixel formats accepted by the display backend.
//!
//! Formats are identified by DRM four-character codes: four ASCII bytes
//! packed little-endian, space padded.

use embedded_graphics::pixelcolor::{Rgb888, RgbColor};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// `RG16`: 5:6:5 red, green, blue.
    Rgb565 = 0x3631_4752,
    /// `BG24`: red, green, blue bytes from low to high address.
    Bgr888 = 0x3432_4742,
    /// `RA24`
    Rgba8888 = 0x3432_4152,
    /// `AR24`
    Argb8888 = 0x3432_5241,
    /// `XR24`
    Xrgb8888 = 0x3432_5258,
    /// `AB24`
    Abgr8888 = 0x3432_4241,
    /// `XB24`
    Xbgr8888 = 0x3432_4258,
}

/// Pack a format name (`"XR24"`) into its code. Longer names are cut at four
/// bytes, shorter ones padded with spaces.
pub fn fourcc_code(name: &str) -> u32 {
    let mut code = [b' '; 4];
    for (dst, src) in code.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    u32::from_le_bytes(code)
}

impl PixelFormat {
    pub const ALL: [Self; 7] = [
        Self::Rgb565,
        Self::Bgr888,
        Self::Rgba8888,
        Self::Argb8888,
        Self::Xrgb8888,
        Self::Abgr8888,
        Self::Xbgr8888,
    ];

    pub const fn fourcc(self) -> u32 {
        self as u32
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == code)
    }

    /// Format for a configured code. Unknown codes fall back to `Rgb565`.
    pub fn select(code: Option<u32>) -> Self {
        match code {
            None => Self::Rgb565,
            Some(code) => Self::from_fourcc(code).unwrap_or_else(|| {
                log::warn!(
                    "[VDISPL] unsupported pixel format {:#010x}, using {}",
                    code,
                    Self::Rgb565.name()
                );
                Self::Rgb565
            }),
        }
    }

    pub const fn bpp(self) -> u32 {
        match self {
            Self::Rgb565 => 16,
            Self::Bgr888 => 24,
            Self::Rgba8888 | Self::Argb8888 | Self::Xrgb8888 | Self::Abgr8888 | Self::Xbgr8888 => 32,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        (self.bpp() as usize).div_ceil(8)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rgb565 => "RG16",
            Self::Bgr888 => "BG24",
            Self::Rgba8888 => "RA24",
            Self::Argb8888 => "AR24",
            Self::Xrgb8888 => "XR24",
            Self::Abgr8888 => "AB24",
            Self::Xbgr8888 => "XB24",
        }
    }

    /// Store `color` in the first `bytes_per_pixel()` bytes of `out`.
    pub fn encode(self, color: Rgb888, out: &mut [u8]) {
        let (r, g, b) = (u32::from(color.r()), u32::from(color.g()), u32::from(color.b()));
        let value = match self {
            Self::Rgb565 => ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3),
            Self::Bgr888 => (b << 16) | (g << 8) | r,
            Self::Rgba8888 => (r << 24) | (g << 16) | (b << 8) | 0xff,
            Self::Argb8888 | Self::Xrgb8888 => 0xff00_0000 | (r << 16) | (g << 8) | b,
            Self::Abgr8888 | Self::Xbgr8888 => 0xff00_0000 | (b << 16) | (g << 8) | r,
        };
        let n = self.bytes_per_pixel();
        out[..n].copy_from_slice(&value.to_le_bytes()[..n]);
    }
}
