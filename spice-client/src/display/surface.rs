use super::pixel::{self, PixelFormat};
use super::Rect;
use crate::error::{Result, SpiceError};
use crate::protocol::*;
use crate::video::Frame;
use std::sync::Arc;

/// A decoded image or surface backing store: packed rows, top-down, in
/// `format`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
        }
    }

    /// Allocate without aborting the process on failure.
    pub fn try_new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let len = (width as u64)
            .checked_mul(height as u64)
            .and_then(|n| n.checked_mul(format.bytes_per_pixel() as u64))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| SpiceError::ResourceExhausted(format!("{width}x{height} bitmap overflows")))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| SpiceError::ResourceExhausted(format!("{width}x{height} bitmap: {e}")))?;
        data.resize(len, 0);
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(SpiceError::Protocol(format!(
                "{width}x{height} bitmap needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride() + x as usize * self.format.bytes_per_pixel()
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let off = self.offset(x, y);
        &self.data[off..off + self.format.bytes_per_pixel()]
    }

    #[inline]
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> &mut [u8] {
        let off = self.offset(x, y);
        let bpp = self.format.bytes_per_pixel();
        &mut self.data[off..off + bpp]
    }

    pub fn rgba_at(&self, x: u32, y: u32) -> [u8; 4] {
        pixel::to_rgba(self.format, self.pixel(x, y))
    }

    /// Same image in `format`.
    pub fn converted(&self, format: PixelFormat) -> Bitmap {
        if format == self.format {
            return self.clone();
        }
        let mut out = Bitmap::new(self.width, self.height, format);
        let bpp = format.bytes_per_pixel();
        for (src, dst) in self
            .data
            .chunks_exact(self.format.bytes_per_pixel())
            .zip(out.data.chunks_exact_mut(bpp))
        {
            pixel::from_rgba(format, pixel::to_rgba(self.format, src), dst);
        }
        out
    }

    /// Reverse the row order in place.
    pub fn flip_vertical(&mut self) {
        let stride = self.stride();
        let rows = self.height as usize;
        for y in 0..rows / 2 {
            let (top, bottom) = self.data.split_at_mut((rows - 1 - y) * stride);
            top[y * stride..(y + 1) * stride].swap_with_slice(&mut bottom[..stride]);
        }
    }
}

/// Per-pixel draw mask. A pixel is drawn where the mask is set, or where it
/// is clear when `invert` is true.
#[derive(Debug, Clone)]
pub struct Mask {
    pub bitmap: Arc<Bitmap>,
    pub pos: (i32, i32),
    pub invert: bool,
}

impl Mask {
    fn allows(&self, dx: i64, dy: i64) -> bool {
        let mx = dx + self.pos.0 as i64;
        let my = dy + self.pos.1 as i64;
        let set = (0..self.bitmap.width as i64).contains(&mx)
            && (0..self.bitmap.height as i64).contains(&my)
            && self.bitmap.pixel(mx as u32, my as u32).iter().any(|b| *b != 0);
        set != self.invert
    }
}

/// Combine one byte under a raster operation descriptor.
#[inline]
fn combine(rop: u16, src: u8, dst: u8) -> u8 {
    let s = if rop & (SPICE_ROPD_INVERS_SRC | SPICE_ROPD_INVERS_BRUSH) != 0 {
        !src
    } else {
        src
    };
    let d = if rop & SPICE_ROPD_INVERS_DEST != 0 { !dst } else { dst };
    let r = if rop & SPICE_ROPD_OP_OR != 0 {
        s | d
    } else if rop & SPICE_ROPD_OP_AND != 0 {
        s & d
    } else if rop & SPICE_ROPD_OP_XOR != 0 {
        s ^ d
    } else if rop & SPICE_ROPD_OP_BLACKNESS != 0 {
        0
    } else if rop & SPICE_ROPD_OP_WHITENESS != 0 {
        0xff
    } else if rop & SPICE_ROPD_OP_INVERS != 0 {
        !d
    } else {
        s
    };
    if rop & SPICE_ROPD_INVERS_RES != 0 {
        !r
    } else {
        r
    }
}

const ROP_MODIFIERS: u16 =
    SPICE_ROPD_INVERS_SRC | SPICE_ROPD_INVERS_BRUSH | SPICE_ROPD_INVERS_DEST | SPICE_ROPD_INVERS_RES;

#[inline]
fn apply_rop(rop: u16, src: &[u8], dst: &mut [u8]) {
    let plain_put = rop & ROP_MODIFIERS == 0
        && rop & (SPICE_ROPD_OP_OR | SPICE_ROPD_OP_AND | SPICE_ROPD_OP_XOR) == 0
        && rop & (SPICE_ROPD_OP_BLACKNESS | SPICE_ROPD_OP_WHITENESS | SPICE_ROPD_OP_INVERS) == 0;
    if plain_put {
        dst.copy_from_slice(src);
        return;
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d = combine(rop, *s, *d);
    }
}

/// Offset of `x` from `start`; wire coordinates may sit anywhere in i32.
#[inline]
fn rel_offset(x: i32, start: i32) -> i64 {
    x as i64 - start as i64
}

/// Map a destination coordinate to the source, nearest neighbour. `None`
/// when the source coordinate falls outside i32.
#[inline]
fn scale_coord(d: i32, dst_start: i32, dst_len: u32, src_start: i32, src_len: u32) -> Option<i32> {
    let delta = rel_offset(d, dst_start);
    let scaled = if dst_len == src_len || dst_len == 0 {
        delta
    } else {
        delta * src_len as i64 / dst_len as i64
    };
    i32::try_from(src_start as i64 + scaled).ok()
}

/// A server surface. Pixels are kept in the surface's own format; primary
/// surfaces additionally keep an RGBA mirror that frames are cut from.
#[derive(Debug)]
pub struct Surface {
    pub id: u32,
    pub primary: bool,
    canvas: Bitmap,
    mirror: Vec<u8>,
    dirty: Rect,
    frame_seq: u64,
}

impl Surface {
    pub fn new(id: u32, width: u32, height: u32, format: PixelFormat, primary: bool) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(SpiceError::Protocol(format!(
                "surface {id} has zero dimension {width}x{height}"
            )));
        }
        Ok(Self {
            id,
            primary,
            canvas: Bitmap::try_new(width, height, format)?,
            mirror: Vec::new(),
            dirty: Rect::default(),
            frame_seq: 0,
        })
    }

    /// Bytes charged against the display budget.
    pub fn required_bytes(width: u32, height: u32, format: PixelFormat) -> u64 {
        width as u64 * height as u64 * format.bytes_per_pixel() as u64
    }

    pub fn width(&self) -> u32 {
        self.canvas.width
    }

    pub fn height(&self) -> u32 {
        self.canvas.height
    }

    pub fn format(&self) -> PixelFormat {
        self.canvas.format
    }

    pub fn byte_size(&self) -> u64 {
        self.canvas.byte_size()
    }

    pub fn bounds(&self) -> Rect {
        self.canvas.bounds()
    }

    pub fn canvas(&self) -> &Bitmap {
        &self.canvas
    }

    pub fn frame_seq(&self) -> u64 {
        self.frame_seq
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn mark_dirty(&mut self, rect: Rect) {
        let rect = rect.intersect(&self.bounds());
        self.dirty = self.dirty.union(&rect);
    }

    fn for_each_pixel(&mut self, region: Rect, mut f: impl FnMut(i32, i32, &mut [u8])) {
        let region = region.intersect(&self.bounds());
        if region.is_empty() {
            return;
        }
        for y in region.top..region.bottom {
            for x in region.left..region.right {
                f(x, y, self.canvas.pixel_mut(x as u32, y as u32));
            }
        }
        self.mark_dirty(region);
    }

    /// Fill `region` with a native color.
    pub fn fill(&mut self, dst_box: Rect, region: Rect, color: [u8; 4], rop: u16, mask: Option<&Mask>) {
        let bpp = self.format().bytes_per_pixel();
        let color = &color[..bpp];
        self.for_each_pixel(region, |x, y, px| {
            if mask.map_or(true, |m| m.allows(rel_offset(x, dst_box.left), rel_offset(y, dst_box.top))) {
                apply_rop(rop, color, px);
            }
        });
    }

    /// Tile `pattern` over `region`, anchored at `origin`.
    pub fn fill_pattern(
        &mut self,
        dst_box: Rect,
        region: Rect,
        pattern: &Bitmap,
        origin: (i64, i64),
        rop: u16,
        mask: Option<&Mask>,
    ) {
        if pattern.width == 0 || pattern.height == 0 {
            return;
        }
        let pattern = pattern.converted(self.format());
        self.for_each_pixel(region, |x, y, px| {
            if mask.map_or(true, |m| m.allows(rel_offset(x, dst_box.left), rel_offset(y, dst_box.top))) {
                let px_x = (x as i64 - origin.0).rem_euclid(pattern.width as i64) as u32;
                let px_y = (y as i64 - origin.1).rem_euclid(pattern.height as i64) as u32;
                apply_rop(rop, pattern.pixel(px_x, px_y), px);
            }
        });
    }

    /// Copy `src_area` of `src` into `dst_box`, scaled to fit, writing only
    /// inside `region`.
    pub fn blit(
        &mut self,
        dst_box: Rect,
        region: Rect,
        src: &Bitmap,
        src_area: Rect,
        rop: u16,
        mask: Option<&Mask>,
    ) {
        let format = self.format();
        let same_format = src.format == format;
        let mut converted = [0u8; 4];
        let (dw, dh) = (dst_box.width(), dst_box.height());
        let (sw, sh) = (src_area.width(), src_area.height());
        let src_bounds = src.bounds();

        self.for_each_pixel(region.intersect(&dst_box), |x, y, px| {
            if !mask.map_or(true, |m| m.allows(rel_offset(x, dst_box.left), rel_offset(y, dst_box.top))) {
                return;
            }
            let (Some(sx), Some(sy)) = (
                scale_coord(x, dst_box.left, dw, src_area.left, sw),
                scale_coord(y, dst_box.top, dh, src_area.top, sh),
            ) else {
                return;
            };
            if !src_bounds.contains(sx, sy) {
                return;
            }
            let sp = src.pixel(sx as u32, sy as u32);
            if same_format {
                apply_rop(rop, sp, px);
            } else {
                pixel::from_rgba(format, pixel::to_rgba(src.format, sp), &mut converted);
                apply_rop(rop, &converted[..px.len()], px);
            }
        });
    }

    /// Like [`Surface::blit`] but skips source pixels whose RGB equals
    /// `transparent` (xRGB).
    pub fn blit_transparent(&mut self, dst_box: Rect, region: Rect, src: &Bitmap, src_area: Rect, transparent: u32) {
        let format = self.format();
        let key = transparent & 0x00ff_ffff;
        let (dw, dh) = (dst_box.width(), dst_box.height());
        let (sw, sh) = (src_area.width(), src_area.height());
        let src_bounds = src.bounds();

        self.for_each_pixel(region.intersect(&dst_box), |x, y, px| {
            let (Some(sx), Some(sy)) = (
                scale_coord(x, dst_box.left, dw, src_area.left, sw),
                scale_coord(y, dst_box.top, dh, src_area.top, sh),
            ) else {
                return;
            };
            if !src_bounds.contains(sx, sy) {
                return;
            }
            let [r, g, b, a] = src.rgba_at(sx as u32, sy as u32);
            let rgb = (r as u32) << 16 | (g as u32) << 8 | b as u32;
            if rgb != key {
                pixel::from_rgba(format, [r, g, b, a], px);
            }
        });
    }

    /// Porter-Duff "over" with a global alpha.
    pub fn alpha_blend(
        &mut self,
        dst_box: Rect,
        region: Rect,
        src: &Bitmap,
        src_area: Rect,
        alpha: u8,
        src_has_alpha: bool,
    ) {
        let format = self.format();
        let (dw, dh) = (dst_box.width(), dst_box.height());
        let (sw, sh) = (src_area.width(), src_area.height());
        let src_bounds = src.bounds();
        let global = alpha as u32;

        self.for_each_pixel(region.intersect(&dst_box), |x, y, px| {
            let (Some(sx), Some(sy)) = (
                scale_coord(x, dst_box.left, dw, src_area.left, sw),
                scale_coord(y, dst_box.top, dh, src_area.top, sh),
            ) else {
                return;
            };
            if !src_bounds.contains(sx, sy) {
                return;
            }
            let mut s = src.rgba_at(sx as u32, sy as u32);
            if !src_has_alpha {
                s[3] = 0xff;
            }
            let s = s.map(|c| ((c as u32 * global + 127) / 255) as u8);
            let d = pixel::to_rgba(format, px);
            let inv = 255 - s[3] as u32;
            let mut out = [0u8; 4];
            for i in 0..4 {
                out[i] = (s[i] as u32 + (d[i] as u32 * inv + 127) / 255).min(255) as u8;
            }
            pixel::from_rgba(format, out, px);
        });
    }

    /// Move the pixels at `src_pos` to `dst`, within this surface. Overlap
    /// is handled.
    pub fn copy_bits(&mut self, dst: Rect, region: Rect, src_pos: (i32, i32)) -> Result<()> {
        let (Some(dx), Some(dy)) = (dst.left.checked_sub(src_pos.0), dst.top.checked_sub(src_pos.1)) else {
            return Err(SpiceError::Protocol(format!(
                "copy bits from {:?} to ({}, {}) overflows",
                src_pos, dst.left, dst.top
            )));
        };
        let bounds = self.bounds();
        // Destination pixels whose source lies inside the surface
        let target = region
            .intersect(&dst)
            .intersect(&bounds)
            .intersect(&bounds.translate(dx, dy));
        if target.is_empty() {
            return Ok(());
        }

        let bpp = self.format().bytes_per_pixel();
        let row_len = target.width() as usize * bpp;
        let stride = self.canvas.stride();
        let mut scratch = Vec::with_capacity(row_len * target.height() as usize);
        for y in target.top..target.bottom {
            let start = rel_offset(y, dy) as usize * stride + rel_offset(target.left, dx) as usize * bpp;
            scratch.extend_from_slice(&self.canvas.data[start..start + row_len]);
        }
        for (i, y) in (target.top..target.bottom).enumerate() {
            let start = y as usize * stride + target.left as usize * bpp;
            self.canvas.data[start..start + row_len].copy_from_slice(&scratch[i * row_len..(i + 1) * row_len]);
        }
        self.mark_dirty(target);
        Ok(())
    }

    /// Convert the dirty region into the RGBA mirror and cut a frame.
    /// Returns `None` when nothing changed since the last frame.
    pub fn take_frame(&mut self) -> Result<Option<Frame>> {
        if self.dirty.is_empty() {
            return Ok(None);
        }

        let width = self.width() as usize;
        let full_len = width * self.height() as usize * 4;
        let dirty = if self.mirror.len() != full_len {
            self.mirror = Vec::new();
            self.mirror
                .try_reserve_exact(full_len)
                .map_err(|e| SpiceError::ResourceExhausted(format!("frame mirror: {e}")))?;
            self.mirror.resize(full_len, 0);
            self.bounds()
        } else {
            self.dirty
        };

        let format = self.format();
        let bpp = format.bytes_per_pixel();
        let src_stride = self.canvas.stride();
        for y in dirty.top..dirty.bottom {
            let y = y as usize;
            let (l, r) = (dirty.left as usize, dirty.right as usize);
            let src = &self.canvas.data[y * src_stride + l * bpp..y * src_stride + r * bpp];
            let dst = &mut self.mirror[(y * width + l) * 4..(y * width + r) * 4];
            pixel::convert_row(format, src, dst);
        }

        self.dirty = Rect::default();
        self.frame_seq += 1;

        Ok(Some(Frame {
            surface_id: self.id,
            width: self.width(),
            height: self.height(),
            dirty,
            seq: self.frame_seq,
            pixels: self.mirror.clone(),
        }))
    }
}
