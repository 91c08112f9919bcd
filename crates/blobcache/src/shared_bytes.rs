use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use memmap2::{MmapMut, MmapOptions};

use crate::error::Result;

/// Owns the single backing file, pre-sized to `num_regions * region_size`
/// bytes, and hands out a region-local [`RegionChannel`] per physical
/// slot. Not portable and not recovered across restarts: the
/// file is truncated to zero length and re-grown fresh on every open.
#[derive(Debug)]
pub struct SharedBytes {
    mmap: MmapMut,
    region_size: u64,
    num_regions: usize,
}

impl SharedBytes {
    /// Creates (or truncates) the backing file at `path` and memory-maps
    /// exactly `num_regions * region_size` bytes.
    pub fn create(path: &Path, num_regions: usize, region_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let len = num_regions as u64 * region_size;
        file.set_len(len)?;

        let mmap = Self::map(&file)?;

        Ok(Self {
            mmap,
            region_size,
            num_regions,
        })
    }

    fn map(file: &File) -> Result<MmapMut> {
        if file.metadata()?.len() == 0 {
            // `memmap2` refuses to map a zero-length file; a disabled
            // cache (`num_regions == 0`) never calls `channel`, so an
            // empty placeholder mapping is never touched.
            return Ok(unsafe { MmapOptions::new().len(1).map_anon()?.make_mut()? });
        }
        Ok(unsafe { MmapOptions::new().map_mut(file)? })
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    /// Random-access channel for one physical slot.
    ///
    /// # Panics
    /// Panics if `slot >= num_regions()`. Slot reuse after eviction is
    /// safe because readers must hold a ref on the owning
    /// `CacheFileRegion` for the lifetime of the channel.
    pub fn channel(&self, slot: usize) -> RegionChannel<'_> {
        assert!(slot < self.num_regions, "slot {slot} out of bounds");
        RegionChannel {
            shared: self,
            slot,
        }
    }
}

/// Region-local random-access view over one physical slot of the backing
/// file. `pos` below is always relative to the start of the slot.
#[derive(Debug, Clone, Copy)]
pub struct RegionChannel<'a> {
    shared: &'a SharedBytes,
    slot: usize,
}

impl RegionChannel<'_> {
    fn slot_start(&self) -> u64 {
        self.slot as u64 * self.shared.region_size
    }

    /// Writes `data` at region-local offset `pos`.
    ///
    /// # Panics
    /// Panics if `pos + data.len()` exceeds the region size, or on
    /// overflow. Safe to call concurrently with other writes/reads at
    /// disjoint offsets within the same slot; the caller (the sparse
    /// file tracker's gap claiming) is responsible for serializing
    /// overlapping writes.
    pub fn write_at(&self, pos: u64, data: &[u8]) {
        let end = pos
            .checked_add(data.len() as u64)
            .expect("pos + data.len() overflow");
        assert!(
            end <= self.shared.region_size,
            "write beyond region bounds: end={end}, region_size={}",
            self.shared.region_size
        );

        let abs_start = (self.slot_start() + pos) as usize;
        // SAFETY: bounds checked above against this slot's reserved
        // range, which no other slot's channel ever overlaps.
        unsafe {
            let ptr = self.shared.mmap.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(abs_start), data.len());
        }
    }

    /// Reads `len` bytes at region-local offset `pos`.
    ///
    /// # Panics
    /// Panics if `pos + len` exceeds the region size, or on overflow.
    pub fn read_at(&self, pos: u64, len: u64) -> &[u8] {
        let end = pos.checked_add(len).expect("pos + len overflow");
        assert!(
            end <= self.shared.region_size,
            "read beyond region bounds: end={end}, region_size={}",
            self.shared.region_size
        );
        let abs_start = (self.slot_start() + pos) as usize;
        let abs_end = abs_start + len as usize;
        &self.shared.mmap[abs_start..abs_end]
    }
}
