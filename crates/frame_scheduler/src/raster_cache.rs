use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterCacheKey(pub u64);

#[derive(Debug, Clone, Copy)]
struct RasterCacheEntry {
    used_this_frame: bool,
    access_count: u32,
}

/// Cached rasterizations keyed by layer. Entries not touched during a frame are evicted when
/// the frame ends.
#[derive(Debug, Default)]
pub struct RasterCache {
    entries: HashMap<RasterCacheKey, RasterCacheEntry>,
}

impl RasterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as needed by the current frame. Returns how many frames in a row have
    /// asked for it, including this one.
    pub fn prepare(&mut self, key: RasterCacheKey) -> u32 {
        let entry = self.entries.entry(key).or_insert(RasterCacheEntry {
            used_this_frame: false,
            access_count: 0,
        });
        if !entry.used_this_frame {
            entry.used_this_frame = true;
            entry.access_count = entry.access_count.saturating_add(1);
        }
        entry.access_count
    }

    pub fn contains(&self, key: RasterCacheKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn sweep_after_frame(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.used_this_frame);
        for entry in self.entries.values_mut() {
            entry.used_this_frame = false;
        }
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
