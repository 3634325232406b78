//! Stateless per-pixel conversions between surface formats and RGBA with
//! premultiplied alpha.

use crate::protocol::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    A8,
    Rgb16_555,
    Rgb16_565,
    /// xRGB in a 32-bit little-endian word, bytes `B G R x` in memory.
    Rgb24,
    /// ARGB in a 32-bit little-endian word, color channels premultiplied.
    Rgba32Premultiplied,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::A8 => 1,
            PixelFormat::Rgb16_555 | PixelFormat::Rgb16_565 => 2,
            PixelFormat::Rgb24 | PixelFormat::Rgba32Premultiplied => 4,
        }
    }

    pub fn from_surface_format(format: u32) -> Option<Self> {
        match format {
            SPICE_SURFACE_FMT_1_A | SPICE_SURFACE_FMT_8_A => Some(PixelFormat::A8),
            SPICE_SURFACE_FMT_16_555 => Some(PixelFormat::Rgb16_555),
            SPICE_SURFACE_FMT_16_565 => Some(PixelFormat::Rgb16_565),
            SPICE_SURFACE_FMT_32_XRGB => Some(PixelFormat::Rgb24),
            SPICE_SURFACE_FMT_32_ARGB => Some(PixelFormat::Rgba32Premultiplied),
            _ => None,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::A8 | PixelFormat::Rgba32Premultiplied)
    }
}

#[inline]
fn expand5(v: u16) -> u8 {
    let v = (v & 0x1f) as u8;
    (v << 3) | (v >> 2)
}

#[inline]
fn expand6(v: u16) -> u8 {
    let v = (v & 0x3f) as u8;
    (v << 2) | (v >> 4)
}

/// Convert one native pixel to `[r, g, b, a]`, premultiplied.
#[inline]
pub fn to_rgba(format: PixelFormat, px: &[u8]) -> [u8; 4] {
    match format {
        PixelFormat::A8 => [0, 0, 0, px[0]],
        PixelFormat::Rgb16_555 => {
            let v = u16::from_le_bytes([px[0], px[1]]);
            [expand5(v >> 10), expand5(v >> 5), expand5(v), 0xff]
        }
        PixelFormat::Rgb16_565 => {
            let v = u16::from_le_bytes([px[0], px[1]]);
            [expand5(v >> 11), expand6(v >> 5), expand5(v), 0xff]
        }
        PixelFormat::Rgb24 => [px[2], px[1], px[0], 0xff],
        PixelFormat::Rgba32Premultiplied => [px[2], px[1], px[0], px[3]],
    }
}

/// Write an RGBA premultiplied pixel in `format`. Formats without alpha
/// drop it, formats with less precision truncate.
#[inline]
pub fn from_rgba(format: PixelFormat, rgba: [u8; 4], out: &mut [u8]) {
    let [r, g, b, a] = rgba;
    match format {
        PixelFormat::A8 => out[0] = a,
        PixelFormat::Rgb16_555 => {
            let v = ((r as u16 >> 3) << 10) | ((g as u16 >> 3) << 5) | (b as u16 >> 3);
            out[..2].copy_from_slice(&v.to_le_bytes());
        }
        PixelFormat::Rgb16_565 => {
            let v = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
            out[..2].copy_from_slice(&v.to_le_bytes());
        }
        PixelFormat::Rgb24 => out[..4].copy_from_slice(&[b, g, r, 0xff]),
        PixelFormat::Rgba32Premultiplied => out[..4].copy_from_slice(&[b, g, r, a]),
    }
}

/// Convert a packed row of native pixels into RGBA.
pub fn convert_row(format: PixelFormat, src: &[u8], dst: &mut [u8]) {
    let bpp = format.bytes_per_pixel();
    for (px, out) in src.chunks_exact(bpp).zip(dst.chunks_exact_mut(4)) {
        out.copy_from_slice(&to_rgba(format, px));
    }
}

/// Native encoding of a brush or key color for a surface of `format`.
/// 32-bit formats take the color as ARGB, 16-bit formats as the packed
/// 16-bit value, A8 as the low byte.
pub fn color_to_native(format: PixelFormat, color: u32) -> [u8; 4] {
    let bytes = color.to_le_bytes();
    match format {
        PixelFormat::A8 => [bytes[0], 0, 0, 0],
        PixelFormat::Rgb16_555 | PixelFormat::Rgb16_565 => [bytes[0], bytes[1], 0, 0],
        PixelFormat::Rgb24 => [bytes[0], bytes[1], bytes[2], 0xff],
        PixelFormat::Rgba32Premultiplied => bytes,
    }
}

/// Straight alpha from premultiplied, for export formats that expect it.
pub fn unpremultiply(rgba: [u8; 4]) -> [u8; 4] {
    let [r, g, b, a] = rgba;
    match a {
        0 => [0, 0, 0, 0],
        0xff => rgba,
        a => {
            let scale = |c: u8| ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8;
            [scale(r), scale(g), scale(b), a]
        }
    }
}

/// Premultiply a straight-alpha color.
pub fn premultiply(rgba: [u8; 4]) -> [u8; 4] {
    let [r, g, b, a] = rgba;
    let mul = |c: u8| ((c as u32 * a as u32 + 127) / 255) as u8;
    [mul(r), mul(g), mul(b), a]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rgb24_forces_opaque_alpha() {
        assert_eq!(to_rgba(PixelFormat::Rgb24, &[0x00, 0xff, 0x00, 0x00]), [0x00, 0xff, 0x00, 0xff]);
    }

    #[test]
    fn test_565_extremes() {
        assert_eq!(to_rgba(PixelFormat::Rgb16_565, &0xffffu16.to_le_bytes()), [0xff; 4]);
        assert_eq!(to_rgba(PixelFormat::Rgb16_565, &0xf800u16.to_le_bytes()), [0xff, 0, 0, 0xff]);
    }

    #[test]
    fn test_color_to_native_rgb24() {
        let native = color_to_native(PixelFormat::Rgb24, 0x00ff00);
        assert_eq!(to_rgba(PixelFormat::Rgb24, &native), [0x00, 0xff, 0x00, 0xff]);
    }

    #[test]
    fn test_unpremultiply_half_alpha() {
        assert_eq!(unpremultiply([0x40, 0x00, 0x80, 0x80]), [0x80, 0x00, 0xff, 0x80]);
        assert_eq!(unpremultiply([9, 9, 9, 0]), [0, 0, 0, 0]);
    }

    proptest! {
        #[test]
        fn prop_rgb24_round_trip(b in any::<u8>(), g in any::<u8>(), r in any::<u8>(), x in any::<u8>()) {
            let rgba = to_rgba(PixelFormat::Rgb24, &[b, g, r, x]);
            let mut out = [0u8; 4];
            from_rgba(PixelFormat::Rgb24, rgba, &mut out);
            prop_assert_eq!(&out[..3], &[b, g, r][..]);
        }

        #[test]
        fn prop_16bit_round_trip(v in any::<u16>()) {
            let v555 = v & 0x7fff;
            let rgba = to_rgba(PixelFormat::Rgb16_555, &v555.to_le_bytes());
            let mut out = [0u8; 2];
            from_rgba(PixelFormat::Rgb16_555, rgba, &mut out);
            prop_assert_eq!(u16::from_le_bytes(out), v555);

            let rgba = to_rgba(PixelFormat::Rgb16_565, &v.to_le_bytes());
            from_rgba(PixelFormat::Rgb16_565, rgba, &mut out);
            prop_assert_eq!(u16::from_le_bytes(out), v);
        }

        #[test]
        fn prop_projection_is_idempotent(r in any::<u8>(), g in any::<u8>(), b in any::<u8>()) {
            let mut once = [0u8; 2];
            from_rgba(PixelFormat::Rgb16_565, [r, g, b, 0xff], &mut once);
            let mut twice = [0u8; 2];
            from_rgba(PixelFormat::Rgb16_565, to_rgba(PixelFormat::Rgb16_565, &once), &mut twice);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_alpha_never_below_color(px in any::<[u8; 4]>()) {
            for format in [PixelFormat::Rgb24, PixelFormat::Rgb16_555, PixelFormat::Rgb16_565, PixelFormat::A8] {
                let [r, g, b, a] = to_rgba(format, &px);
                prop_assert!(r <= a && g <= a && b <= a);
            }
        }
    }
}
