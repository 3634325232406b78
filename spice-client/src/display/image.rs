//! Image payloads carried by draw commands, and the decoder plumbing for
//! compressed images and video streams.

use super::cache::{MemoryBudget, Palette, PaletteCache};
use super::pixel::PixelFormat;
use super::surface::Bitmap;
use crate::error::{Result, SpiceError};
use crate::protocol::*;
use crate::wire_format::WireReader;
use std::sync::Arc;
use tracing::warn;

/// Header shared by every image payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub id: u64,
    pub image_type: u8,
    pub flags: u8,
    pub width: u32,
    pub height: u32,
}

impl ImageDescriptor {
    pub const SIZE: usize = 18;

    pub fn read(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            id: reader.u64()?,
            image_type: reader.u8()?,
            flags: reader.u8()?,
            width: reader.u32()?,
            height: reader.u32()?,
        })
    }

    pub fn cache_me(&self) -> bool {
        self.flags & (SPICE_IMAGE_FLAGS_CACHE_ME | SPICE_IMAGE_FLAGS_CACHE_REPLACE_ME) != 0
    }
}

/// Decodes one compressed image type into a bitmap.
pub trait ImageDecoder: Send {
    /// `payload` holds the bytes that follow the descriptor up to the end of
    /// the message.
    fn decode(&mut self, descriptor: &ImageDescriptor, payload: &[u8]) -> Result<Bitmap>;
}

/// Decodes frames of one video codec.
pub trait StreamDecoder: Send {
    fn decode_frame(&mut self, data: &[u8]) -> Result<Bitmap>;
}

/// Supplies decoders to display channels. Each display channel asks once
/// per image type or stream and owns what it gets.
pub trait CodecProvider: Send + Sync {
    fn image_decoder(&self, image_type: u8) -> Option<Box<dyn ImageDecoder>>;

    fn stream_decoder(&self, codec: u8) -> Option<Box<dyn StreamDecoder>>;

    /// Video codecs advertised to the server.
    fn video_codecs(&self) -> Vec<u8>;
}

/// JPEG images and MJPEG streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCodecs;

impl CodecProvider for BuiltinCodecs {
    fn image_decoder(&self, image_type: u8) -> Option<Box<dyn ImageDecoder>> {
        match image_type {
            SPICE_IMAGE_TYPE_JPEG => Some(Box::new(JpegImageDecoder)),
            _ => None,
        }
    }

    fn stream_decoder(&self, codec: u8) -> Option<Box<dyn StreamDecoder>> {
        match codec {
            SPICE_VIDEO_CODEC_TYPE_MJPEG => Some(Box::new(MjpegStreamDecoder)),
            _ => None,
        }
    }

    fn video_codecs(&self) -> Vec<u8> {
        vec![SPICE_VIDEO_CODEC_TYPE_MJPEG]
    }
}

#[derive(Debug, Default)]
pub struct JpegImageDecoder;

impl ImageDecoder for JpegImageDecoder {
    fn decode(&mut self, descriptor: &ImageDescriptor, payload: &[u8]) -> Result<Bitmap> {
        let mut reader = WireReader::new(payload);
        let size = reader.u32()? as usize;
        let bitmap = decode_jpeg(reader.bytes(size)?)?;
        if bitmap.width != descriptor.width || bitmap.height != descriptor.height {
            warn!(
                "JPEG is {}x{}, descriptor says {}x{}",
                bitmap.width, bitmap.height, descriptor.width, descriptor.height
            );
        }
        Ok(bitmap)
    }
}

#[derive(Debug, Default)]
pub struct MjpegStreamDecoder;

impl StreamDecoder for MjpegStreamDecoder {
    fn decode_frame(&mut self, data: &[u8]) -> Result<Bitmap> {
        decode_jpeg(data)
    }
}

/// Decode a baseline or progressive JPEG into an RGB24 bitmap.
pub fn decode_jpeg(data: &[u8]) -> Result<Bitmap> {
    let mut decoder = jpeg_decoder::Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| SpiceError::Protocol(format!("JPEG decode failed: {e}")))?;
    let info = decoder
        .info()
        .ok_or_else(|| SpiceError::Protocol("JPEG without frame header".into()))?;

    let mut out = Bitmap::try_new(info.width as u32, info.height as u32, PixelFormat::Rgb24)?;
    let dst = out.data.chunks_exact_mut(4);
    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => {
            for (src, dst) in pixels.chunks_exact(3).zip(dst) {
                dst.copy_from_slice(&[src[2], src[1], src[0], 0xff]);
            }
        }
        jpeg_decoder::PixelFormat::L8 => {
            for (l, dst) in pixels.iter().zip(dst) {
                dst.copy_from_slice(&[*l, *l, *l, 0xff]);
            }
        }
        jpeg_decoder::PixelFormat::L16 => {
            for (l, dst) in pixels.chunks_exact(2).zip(dst) {
                dst.copy_from_slice(&[l[0], l[0], l[0], 0xff]);
            }
        }
        jpeg_decoder::PixelFormat::CMYK32 => {
            for (src, dst) in pixels.chunks_exact(4).zip(dst) {
                let k = 255 - src[3] as u32;
                let ch = |c: u8| ((255 - c as u32) * k / 255) as u8;
                dst.copy_from_slice(&[ch(src[2]), ch(src[1]), ch(src[0]), 0xff]);
            }
        }
    }
    Ok(out)
}

pub fn read_palette(reader: &mut WireReader<'_>) -> Result<Palette> {
    let unique = reader.u64()?;
    let count = reader.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(reader.u32()?);
    }
    Ok(Palette { unique, entries })
}

/// Decode an inline `BITMAP` image. `reader` is positioned just after the
/// descriptor; `body` is the whole message body, which palette pointers are
/// relative to.
pub fn decode_bitmap(
    reader: &mut WireReader<'_>,
    body: &WireReader<'_>,
    palettes: &mut PaletteCache,
    budget: &mut MemoryBudget,
) -> Result<Bitmap> {
    let format = reader.u8()?;
    let flags = reader.u8()?;
    let width = reader.u32()?;
    let height = reader.u32()?;
    let stride = reader.u32()? as usize;

    let palette = if flags & SPICE_BITMAP_FLAGS_PAL_FROM_CACHE != 0 {
        let id = reader.u64()?;
        Some(
            palettes
                .get(id)
                .ok_or_else(|| SpiceError::Protocol(format!("palette {id} is not cached")))?,
        )
    } else {
        match reader.u32()? {
            0 => None,
            offset => {
                let palette = Arc::new(read_palette(&mut body.at(offset)?)?);
                if flags & SPICE_BITMAP_FLAGS_PAL_CACHE_ME != 0 {
                    palettes.insert(palette.clone(), budget)?;
                }
                Some(palette)
            }
        }
    };

    let decoded_bytes = width as u64 * height as u64 * 4;
    if decoded_bytes > budget.cap() {
        return Err(SpiceError::ResourceExhausted(format!(
            "{width}x{height} bitmap exceeds the display budget"
        )));
    }
    let data = reader.bytes(stride.checked_mul(height as usize).ok_or_else(|| {
        SpiceError::Protocol(format!("bitmap stride {stride} overflows"))
    })?)?;

    let mut bitmap = convert_bitmap(format, width, height, stride, data, palette.as_deref())?;
    if flags & SPICE_BITMAP_FLAGS_TOP_DOWN == 0 {
        bitmap.flip_vertical();
    }
    Ok(bitmap)
}

fn palette_color(palette: &Palette, index: usize) -> [u8; 4] {
    let c = palette.entries.get(index).copied().unwrap_or(0);
    [c as u8, (c >> 8) as u8, (c >> 16) as u8, 0xff]
}

fn convert_bitmap(
    format: u8,
    width: u32,
    height: u32,
    stride: usize,
    data: &[u8],
    palette: Option<&Palette>,
) -> Result<Bitmap> {
    let (out_format, min_row) = match format {
        SPICE_BITMAP_FMT_1BIT_LE | SPICE_BITMAP_FMT_1BIT_BE => (
            if palette.is_some() { PixelFormat::Rgb24 } else { PixelFormat::A8 },
            (width as usize).div_ceil(8),
        ),
        SPICE_BITMAP_FMT_4BIT_LE | SPICE_BITMAP_FMT_4BIT_BE => {
            (PixelFormat::Rgb24, (width as usize).div_ceil(2))
        }
        SPICE_BITMAP_FMT_8BIT => (PixelFormat::Rgb24, width as usize),
        SPICE_BITMAP_FMT_16BIT => (PixelFormat::Rgb16_555, width as usize * 2),
        SPICE_BITMAP_FMT_24BIT => (PixelFormat::Rgb24, width as usize * 3),
        SPICE_BITMAP_FMT_32BIT => (PixelFormat::Rgb24, width as usize * 4),
        SPICE_BITMAP_FMT_RGBA => (PixelFormat::Rgba32Premultiplied, width as usize * 4),
        SPICE_BITMAP_FMT_8BIT_A => (PixelFormat::A8, width as usize),
        other => return Err(SpiceError::Protocol(format!("unknown bitmap format {other}"))),
    };
    if stride < min_row {
        return Err(SpiceError::Protocol(format!(
            "bitmap stride {stride} shorter than row of {min_row} bytes"
        )));
    }

    let needs_palette = matches!(
        format,
        SPICE_BITMAP_FMT_4BIT_LE | SPICE_BITMAP_FMT_4BIT_BE | SPICE_BITMAP_FMT_8BIT
    );
    if needs_palette && palette.is_none() {
        return Err(SpiceError::Protocol(format!("palettized bitmap format {format} without palette")));
    }

    let mut out = Bitmap::try_new(width, height, out_format)?;
    let out_stride = out.stride();
    for y in 0..height as usize {
        let src = &data[y * stride..y * stride + min_row];
        let dst = &mut out.data[y * out_stride..(y + 1) * out_stride];
        match format {
            SPICE_BITMAP_FMT_1BIT_LE | SPICE_BITMAP_FMT_1BIT_BE => {
                for x in 0..width as usize {
                    let byte = src[x / 8];
                    let bit = if format == SPICE_BITMAP_FMT_1BIT_LE {
                        (byte >> (x % 8)) & 1
                    } else {
                        (byte >> (7 - x % 8)) & 1
                    };
                    match palette {
                        Some(p) => dst[x * 4..x * 4 + 4].copy_from_slice(&palette_color(p, bit as usize)),
                        None => dst[x] = if bit != 0 { 0xff } else { 0 },
                    }
                }
            }
            SPICE_BITMAP_FMT_4BIT_LE | SPICE_BITMAP_FMT_4BIT_BE => {
                let p = palette.ok_or_else(|| SpiceError::Protocol("missing palette".into()))?;
                for x in 0..width as usize {
                    let byte = src[x / 2];
                    let high_first = format == SPICE_BITMAP_FMT_4BIT_BE;
                    let index = if (x % 2 == 0) == high_first { byte >> 4 } else { byte & 0x0f };
                    dst[x * 4..x * 4 + 4].copy_from_slice(&palette_color(p, index as usize));
                }
            }
            SPICE_BITMAP_FMT_8BIT => {
                let p = palette.ok_or_else(|| SpiceError::Protocol("missing palette".into()))?;
                for (x, index) in src.iter().enumerate() {
                    dst[x * 4..x * 4 + 4].copy_from_slice(&palette_color(p, *index as usize));
                }
            }
            SPICE_BITMAP_FMT_24BIT => {
                for (px, out) in src.chunks_exact(3).zip(dst.chunks_exact_mut(4)) {
                    out.copy_from_slice(&[px[0], px[1], px[2], 0xff]);
                }
            }
            _ => dst.copy_from_slice(src),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_format::WriteWire;

    fn bitmap_payload(format: u8, flags: u8, width: u32, height: u32, stride: u32, pixels: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u8(format);
        out.write_u8(flags);
        out.write_u32_le(width);
        out.write_u32_le(height);
        out.write_u32_le(stride);
        out.write_u32_le(0);
        out.write_bytes(pixels);
        out
    }

    #[test]
    fn test_24bit_bottom_up_is_flipped() {
        // Two rows, bottom row first on the wire
        let pixels = [0x00, 0x00, 0xff, 0xff, 0x00, 0x00];
        let body = bitmap_payload(SPICE_BITMAP_FMT_24BIT, 0, 1, 2, 3, &pixels);
        let whole = WireReader::new(&body);
        let mut reader = whole.clone();
        let mut palettes = PaletteCache::default();
        let mut budget = MemoryBudget::new(1 << 20);

        let bitmap = decode_bitmap(&mut reader, &whole, &mut palettes, &mut budget).unwrap();
        assert_eq!(bitmap.format, PixelFormat::Rgb24);
        assert_eq!(bitmap.rgba_at(0, 0), [0x00, 0x00, 0xff, 0xff]);
        assert_eq!(bitmap.rgba_at(0, 1), [0xff, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn test_8bit_palette_cached_then_reused() {
        let mut body = Vec::new();
        body.write_u8(SPICE_BITMAP_FMT_8BIT);
        body.write_u8(SPICE_BITMAP_FLAGS_TOP_DOWN | SPICE_BITMAP_FLAGS_PAL_CACHE_ME);
        body.write_u32_le(2);
        body.write_u32_le(1);
        body.write_u32_le(2);
        body.write_u32_le(24); // palette offset
        body.write_bytes(&[1, 0]);
        body.resize(24, 0);
        body.write_u64_le(77);
        body.write_u16_le(2);
        body.write_u32_le(0x000000);
        body.write_u32_le(0x123456);

        let whole = WireReader::new(&body);
        let mut reader = whole.clone();
        let mut palettes = PaletteCache::default();
        let mut budget = MemoryBudget::new(1 << 20);
        let bitmap = decode_bitmap(&mut reader, &whole, &mut palettes, &mut budget).unwrap();
        assert_eq!(bitmap.rgba_at(0, 0), [0x12, 0x34, 0x56, 0xff]);
        assert_eq!(bitmap.rgba_at(1, 0), [0, 0, 0, 0xff]);
        assert_eq!(palettes.get(77).map(|p| p.entries.len()), Some(2));
    }

    #[test]
    fn test_palette_from_unknown_cache_entry_fails() {
        let mut body = Vec::new();
        body.write_u8(SPICE_BITMAP_FMT_8BIT);
        body.write_u8(SPICE_BITMAP_FLAGS_PAL_FROM_CACHE);
        body.write_u32_le(1);
        body.write_u32_le(1);
        body.write_u32_le(1);
        body.write_u64_le(5);
        body.write_u8(0);
        let whole = WireReader::new(&body);
        let mut reader = whole.clone();
        let err = decode_bitmap(
            &mut reader,
            &whole,
            &mut PaletteCache::default(),
            &mut MemoryBudget::new(1 << 20),
        )
        .unwrap_err();
        assert!(matches!(err, SpiceError::Protocol(_)));
    }

    #[test]
    fn test_1bit_without_palette_is_mask() {
        let body = bitmap_payload(SPICE_BITMAP_FMT_1BIT_BE, SPICE_BITMAP_FLAGS_TOP_DOWN, 3, 1, 1, &[0b1010_0000]);
        let whole = WireReader::new(&body);
        let mut reader = whole.clone();
        let bitmap = decode_bitmap(
            &mut reader,
            &whole,
            &mut PaletteCache::default(),
            &mut MemoryBudget::new(1 << 20),
        )
        .unwrap();
        assert_eq!(bitmap.format, PixelFormat::A8);
        assert_eq!(bitmap.data, vec![0xff, 0x00, 0xff]);
    }

    #[test]
    fn test_truncated_bitmap_is_protocol_error() {
        let body = bitmap_payload(SPICE_BITMAP_FMT_32BIT, 0, 4, 4, 16, &[0; 8]);
        let whole = WireReader::new(&body);
        let mut reader = whole.clone();
        let err = decode_bitmap(
            &mut reader,
            &whole,
            &mut PaletteCache::default(),
            &mut MemoryBudget::new(1 << 20),
        )
        .unwrap_err();
        assert!(matches!(err, SpiceError::Protocol(_)));
    }

    #[test]
    fn test_garbage_jpeg_is_rejected() {
        assert!(decode_jpeg(&[0x00, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_builtin_codecs() {
        let codecs = BuiltinCodecs;
        assert!(codecs.image_decoder(SPICE_IMAGE_TYPE_JPEG).is_some());
        assert!(codecs.image_decoder(SPICE_IMAGE_TYPE_QUIC).is_none());
        assert!(codecs.stream_decoder(SPICE_VIDEO_CODEC_TYPE_MJPEG).is_some());
        assert!(codecs.stream_decoder(SPICE_VIDEO_CODEC_TYPE_H264).is_none());
        assert_eq!(codecs.video_codecs(), vec![SPICE_VIDEO_CODEC_TYPE_MJPEG]);
    }
}
