use crate::display::pixel::unpremultiply;
use crate::display::Rect;
use crate::error::{Result, SpiceError};
use std::sync::Arc;

/// Identifies one presented update of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameEvent {
    pub surface_id: u32,
    pub dirty: Rect,
    /// Strictly increasing per surface, starting at 1.
    pub seq: u64,
}

/// A presented surface: tightly packed RGBA, premultiplied alpha, stride
/// `width * 4`, origin top-left. The buffer belongs to the receiver.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub surface_id: u32,
    pub width: u32,
    pub height: u32,
    /// Region that changed since the previous frame of this surface.
    pub dirty: Rect,
    pub seq: u64,
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("surface_id", &self.surface_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("dirty", &self.dirty)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl Frame {
    pub fn event(&self) -> FrameEvent {
        FrameEvent {
            surface_id: self.surface_id,
            dirty: self.dirty,
            seq: self.seq,
        }
    }

    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let off = y as usize * self.stride() + x as usize * 4;
        let px = self.pixels.get(off..off + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// PNG snapshot with straight alpha.
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let mut straight = Vec::with_capacity(self.pixels.len());
        for px in self.pixels.chunks_exact(4) {
            straight.extend_from_slice(&unpremultiply([px[0], px[1], px[2], px[3]]));
        }

        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, self.width, self.height);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder
                .write_header()
                .map_err(|e| SpiceError::Protocol(format!("PNG header: {e}")))?;
            writer
                .write_image_data(&straight)
                .map_err(|e| SpiceError::Protocol(format!("PNG data: {e}")))?;
        }
        Ok(out)
    }
}

/// What the frame callback receives.
#[derive(Debug, Clone)]
pub enum FrameDelivery {
    Frame(Frame),
    /// The session ended with this error; no further frames follow.
    Failed(Arc<SpiceError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_bounds() {
        let frame = Frame {
            surface_id: 0,
            width: 2,
            height: 1,
            dirty: Rect::from_size(2, 1),
            seq: 1,
            pixels: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        assert_eq!(frame.pixel(1, 0), Some([5, 6, 7, 8]));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.event().seq, 1);
    }

    #[test]
    fn test_png_signature() {
        let frame = Frame {
            surface_id: 0,
            width: 1,
            height: 1,
            dirty: Rect::from_size(1, 1),
            seq: 1,
            pixels: vec![0x40, 0x00, 0x00, 0x80],
        };
        let png = frame.encode_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
