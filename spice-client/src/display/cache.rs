use super::surface::Bitmap;
use crate::error::{Result, SpiceError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Byte budget shared by the surfaces and caches of one display channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    cap: u64,
    used: u64,
}

impl MemoryBudget {
    pub fn new(cap: u64) -> Self {
        Self { cap, used: 0 }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn charge(&mut self, bytes: u64, what: &str) -> Result<()> {
        let total = self.used.saturating_add(bytes);
        if total > self.cap {
            return Err(SpiceError::ResourceExhausted(format!(
                "{what} needs {bytes} bytes, {} of {} in use",
                self.used, self.cap
            )));
        }
        self.used = total;
        Ok(())
    }

    pub fn release(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }
}

/// Server-managed image cache. Entries leave only through explicit
/// invalidation.
#[derive(Debug, Default)]
pub struct PixmapCache {
    entries: HashMap<u64, Arc<Bitmap>>,
}

impl PixmapCache {
    pub fn insert(&mut self, id: u64, bitmap: Arc<Bitmap>, budget: &mut MemoryBudget) -> Result<()> {
        let size = bitmap.byte_size();
        let previous = self.entries.get(&id).map(|b| b.byte_size()).unwrap_or(0);
        budget.release(previous);
        if let Err(e) = budget.charge(size, "pixmap cache") {
            budget.charge(previous, "pixmap cache")?;
            return Err(e);
        }
        self.entries.insert(id, bitmap);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<Arc<Bitmap>> {
        self.entries.get(&id).cloned()
    }

    /// Returns `false` for ids that were never cached.
    pub fn remove(&mut self, id: u64, budget: &mut MemoryBudget) -> bool {
        match self.entries.remove(&id) {
            Some(bitmap) => {
                budget.release(bitmap.byte_size());
                true
            }
            None => {
                debug!(id, "ignoring invalidation of unknown pixmap");
                false
            }
        }
    }

    pub fn clear(&mut self, budget: &mut MemoryBudget) {
        for (_, bitmap) in self.entries.drain() {
            budget.release(bitmap.byte_size());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    pub unique: u64,
    /// xRGB entries.
    pub entries: Vec<u32>,
}

impl Palette {
    pub fn byte_size(&self) -> u64 {
        (self.entries.len() * 4) as u64
    }
}

#[derive(Debug, Default)]
pub struct PaletteCache {
    entries: HashMap<u64, Arc<Palette>>,
}

impl PaletteCache {
    pub fn insert(&mut self, palette: Arc<Palette>, budget: &mut MemoryBudget) -> Result<()> {
        if let Some(old) = self.entries.get(&palette.unique) {
            budget.release(old.byte_size());
        }
        budget.charge(palette.byte_size(), "palette cache")?;
        self.entries.insert(palette.unique, palette);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<Arc<Palette>> {
        self.entries.get(&id).cloned()
    }

    pub fn remove(&mut self, id: u64, budget: &mut MemoryBudget) -> bool {
        match self.entries.remove(&id) {
            Some(palette) => {
                budget.release(palette.byte_size());
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self, budget: &mut MemoryBudget) {
        for (_, palette) in self.entries.drain() {
            budget.release(palette.byte_size());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::PixelFormat;
    use crate::error::ErrorKind;

    fn bitmap(width: u32, height: u32) -> Arc<Bitmap> {
        Arc::new(Bitmap::new(width, height, PixelFormat::Rgb24))
    }

    #[test]
    fn test_budget_refuses_overflow() {
        let mut budget = MemoryBudget::new(100);
        budget.charge(60, "a").unwrap();
        let err = budget.charge(41, "b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(budget.used(), 60);
        budget.release(60);
        budget.charge(100, "c").unwrap();
    }

    #[test]
    fn test_pixmap_cache_accounting() {
        let mut budget = MemoryBudget::new(1024);
        let mut cache = PixmapCache::default();
        cache.insert(7, bitmap(8, 8), &mut budget).unwrap();
        assert_eq!(budget.used(), 256);

        // Replacing an entry releases the old size first
        cache.insert(7, bitmap(4, 4), &mut budget).unwrap();
        assert_eq!(budget.used(), 64);

        assert!(cache.remove(7, &mut budget));
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_unknown_invalidation_is_ignored() {
        let mut budget = MemoryBudget::new(1024);
        let mut cache = PixmapCache::default();
        assert!(!cache.remove(42, &mut budget));
        let mut palettes = PaletteCache::default();
        assert!(!palettes.remove(42, &mut budget));
    }

    #[test]
    fn test_pixmap_over_cap_keeps_previous_entry() {
        let mut budget = MemoryBudget::new(300);
        let mut cache = PixmapCache::default();
        cache.insert(1, bitmap(8, 8), &mut budget).unwrap();
        assert!(cache.insert(1, bitmap(16, 16), &mut budget).is_err());
        assert_eq!(budget.used(), 256);
        assert_eq!(cache.get(1).map(|b| b.width), Some(8));
    }
}
