use std::fmt;

/// Identifies one physical region: the blob it belongs to plus its index
/// within that blob. Generic over the caller's blob identifier type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionKey<K> {
    pub file_key: K,
    pub region_idx: u64,
}

impl<K> RegionKey<K> {
    pub fn new(file_key: K, region_idx: u64) -> Self {
        Self { file_key, region_idx }
    }
}

impl<K: fmt::Debug> fmt::Debug for RegionKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.file_key, self.region_idx)
    }
}
