use std::time::Duration;

use crate::error::{Error, Result};

/// Which role(s) a node plays. `shared_cache.size` is only recognized on a
/// node that plays at least one of these; every other setting is
/// accepted regardless of role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeRoleSet {
    pub frozen: bool,
    pub search: bool,
    pub indexing: bool,
    /// Number of distinct data paths configured for this node. Frozen
    /// nodes support exactly one.
    pub data_paths: usize,
}

impl NodeRoleSet {
    pub const NONE: Self = Self {
        frozen: false,
        search: false,
        indexing: false,
        data_paths: 1,
    };

    pub const fn frozen() -> Self {
        Self {
            frozen: true,
            search: false,
            indexing: false,
            data_paths: 1,
        }
    }

    fn allows_shared_cache(self) -> bool {
        self.frozen || self.search || self.indexing
    }

    fn missing_roles(self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.frozen {
            missing.push("frozen");
        }
        if !self.search {
            missing.push("search");
        }
        if !self.indexing {
            missing.push("indexing");
        }
        missing
    }
}

/// `shared_cache.size`: either an absolute byte count or a fraction of the
/// total disk.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SizeSetting {
    Absolute(u64),
    Relative(f64),
}

impl Default for SizeSetting {
    fn default() -> Self {
        SizeSetting::Absolute(0)
    }
}

/// Raw `shared_cache.*` settings as a node operator would write them.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheConfig {
    pub size: SizeSetting,
    /// `shared_cache.size.max_headroom`. Only meaningful when `size` is
    /// [`SizeSetting::Relative`]; rejected otherwise.
    pub max_headroom: Option<u64>,
    pub region_size: u64,
    pub range_size: u64,
    pub recovery_range_size: u64,
    pub min_time_delta: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: SizeSetting::Absolute(0),
            max_headroom: None,
            region_size: 16 * 1024 * 1024,
            range_size: 128 * 1024,
            recovery_range_size: 128 * 1024,
            min_time_delta: Duration::from_secs(60),
        }
    }
}

/// Settings after validation against the node's roles and disk size; zero
/// disables the cache (`num_regions == 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCacheConfig {
    pub shared_cache_size: u64,
    pub region_size: u64,
    pub num_regions: usize,
    pub range_size: u64,
    pub recovery_range_size: u64,
    pub min_time_delta_millis: u64,
}

impl ResolvedCacheConfig {
    pub fn is_disabled(&self) -> bool {
        self.num_regions == 0
    }
}

impl CacheConfig {
    /// Validates and resolves the configuration against the node's roles
    /// and total disk size before anything touches the filesystem.
    /// Configuration errors are fatal at construction: nothing here talks
    /// to disk.
    pub fn resolve(&self, total_disk_bytes: u64, roles: NodeRoleSet) -> Result<ResolvedCacheConfig> {
        if self.region_size == 0 {
            return Err(Error::NonPositiveRegionSize);
        }
        if self.range_size == 0 || self.recovery_range_size == 0 {
            return Err(Error::NonPositiveRangeSize);
        }
        if matches!(self.size, SizeSetting::Absolute(_)) && self.max_headroom.is_some() {
            return Err(Error::HeadroomWithAbsoluteSize);
        }
        if roles.frozen && roles.data_paths > 1 {
            return Err(Error::MultipleDataPathsOnFrozenNode {
                count: roles.data_paths,
            });
        }

        let shared_cache_size = match self.size {
            SizeSetting::Absolute(bytes) => {
                if bytes > 0 && !roles.allows_shared_cache() {
                    return Err(Error::SizeOnWrongRole {
                        roles: roles.missing_roles(),
                    });
                }
                bytes
            }
            SizeSetting::Relative(fraction) => {
                if !roles.allows_shared_cache() {
                    return Err(Error::SizeOnWrongRole {
                        roles: roles.missing_roles(),
                    });
                }
                let raw = (total_disk_bytes as f64 * fraction) as u64;
                match self.max_headroom {
                    Some(headroom) => raw.min(total_disk_bytes.saturating_sub(headroom)),
                    None => raw,
                }
            }
        };

        if shared_cache_size == 0 {
            return Ok(ResolvedCacheConfig {
                shared_cache_size: 0,
                region_size: self.region_size,
                num_regions: 0,
                range_size: self.range_size,
                recovery_range_size: self.recovery_range_size,
                min_time_delta_millis: self.min_time_delta.as_millis() as u64,
            });
        }

        if shared_cache_size < self.region_size {
            return Err(Error::SizeSmallerThanRegion {
                size: shared_cache_size,
                region_size: self.region_size,
            });
        }

        let num_regions = (shared_cache_size / self.region_size) as usize;
        let shared_cache_size = num_regions as u64 * self.region_size;

        Ok(ResolvedCacheConfig {
            shared_cache_size,
            region_size: self.region_size,
            num_regions,
            range_size: self.range_size,
            recovery_range_size: self.recovery_range_size,
            min_time_delta_millis: self.min_time_delta.as_millis() as u64,
        })
    }
}
