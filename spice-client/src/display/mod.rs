//! Surface model for the display channel: pixel formats, surfaces, the
//! pixmap and palette caches, image decoding and video streams.

pub mod cache;
pub mod image;
pub mod pixel;
pub mod stream;
pub mod surface;

pub use cache::{MemoryBudget, Palette, PaletteCache, PixmapCache};
pub use image::{BuiltinCodecs, CodecProvider, ImageDecoder, ImageDescriptor, StreamDecoder};
pub use pixel::PixelFormat;
pub use surface::{Bitmap, Surface};

use crate::protocol::SpiceRect;
use serde::{Deserialize, Serialize};

/// Half-open rectangle, `left..right` by `top..bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> u32 {
        (self.right as i64 - self.left as i64).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom as i64 - self.top as i64).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        }
    }

    /// Bounding box of both rectangles. Empty inputs are ignored.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Shift by `(dx, dy)`, clamping at the i32 range.
    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(
            self.left.saturating_add(dx),
            self.top.saturating_add(dy),
            self.right.saturating_add(dx),
            self.bottom.saturating_add(dy),
        )
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

impl From<SpiceRect> for Rect {
    fn from(r: SpiceRect) -> Self {
        Rect::new(r.left, r.top, r.right, r.bottom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect_and_union() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 20, 20);
        assert_eq!(a.intersect(&b), Rect::new(5, 5, 10, 10));
        assert_eq!(a.union(&b), Rect::new(0, 0, 20, 20));
        assert!(a.intersect(&Rect::new(10, 10, 12, 12)).is_empty());
    }

    #[test]
    fn test_extreme_coordinates() {
        let wide = Rect::new(i32::MIN, i32::MIN, i32::MAX, 0);
        assert_eq!(wide.width(), u32::MAX);
        assert_eq!(wide.height(), 1 << 31);
        assert_eq!(Rect::new(5, 0, i32::MIN, 1).width(), 0);
        assert_eq!(
            Rect::new(0, 0, 10, 10).translate(i32::MAX, i32::MIN),
            Rect::new(i32::MAX, i32::MIN, i32::MAX, i32::MIN + 10)
        );
    }

    #[test]
    fn test_union_skips_empty() {
        let a = Rect::new(3, 4, 5, 6);
        assert_eq!(Rect::default().union(&a), a);
        assert_eq!(a.union(&Rect::default()), a);
    }

    #[test]
    fn test_wire_rect_order() {
        let wire = SpiceRect {
            top: 1,
            left: 2,
            bottom: 3,
            right: 4,
        };
        assert_eq!(Rect::from(wire), Rect::new(2, 1, 4, 3));
    }
}
