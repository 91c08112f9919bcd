use std::{io, result};

use thiserror::Error;

pub type Result<T, E = Error> = result::Result<T, E>;

/// Error types for `blobcache` operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    // Configuration errors (fatal at construction).
    #[error("shared_cache.region_size must be > 0")]
    NonPositiveRegionSize,

    #[error("shared_cache.range_size must be > 0")]
    NonPositiveRangeSize,

    #[error("shared_cache.size is set but node roles {roles:?} do not include frozen/search/indexing")]
    SizeOnWrongRole { roles: Vec<&'static str> },

    #[error("shared_cache.size.max_headroom is only meaningful with a relative shared_cache.size")]
    HeadroomWithAbsoluteSize,

    #[error("shared_cache.size ({size}) is not large enough to hold a single region ({region_size})")]
    SizeSmallerThanRegion { size: u64, region_size: u64 },

    #[error("frozen nodes support exactly one data path, found {count}")]
    MultipleDataPathsOnFrozenNode { count: usize },

    // Runtime errors.
    #[error("operation attempted after cache shutdown")]
    AlreadyClosed,

    #[error("region index {region_idx} is out of bounds for blob length {blob_len} and region size {region_size}")]
    InvalidRegionIndex {
        region_idx: u64,
        blob_len: u64,
        region_size: u64,
    },

    #[error("range [{start}, {end}) is out of bounds for region length {region_len}")]
    RangeOutOfBounds { start: u64, end: u64, region_len: u64 },

    #[error("no evictable region available to satisfy allocation")]
    NoEvictableRegion,

    #[error("populate of range [{start}, {end}) failed: {source}")]
    PopulateFailed {
        start: u64,
        end: u64,
        #[source]
        source: Box<Error>,
    },

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl Clone for Error {
    /// Listeners coalesced onto the same gap all need a copy of one failure;
    /// `io::Error` is not `Clone`, so it is restated as its message.
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::InvariantViolation(format!("io error: {e}")),
            Error::NonPositiveRegionSize => Error::NonPositiveRegionSize,
            Error::NonPositiveRangeSize => Error::NonPositiveRangeSize,
            Error::SizeOnWrongRole { roles } => Error::SizeOnWrongRole {
                roles: roles.clone(),
            },
            Error::HeadroomWithAbsoluteSize => Error::HeadroomWithAbsoluteSize,
            Error::SizeSmallerThanRegion { size, region_size } => Error::SizeSmallerThanRegion {
                size: *size,
                region_size: *region_size,
            },
            Error::MultipleDataPathsOnFrozenNode { count } => {
                Error::MultipleDataPathsOnFrozenNode { count: *count }
            }
            Error::AlreadyClosed => Error::AlreadyClosed,
            Error::InvalidRegionIndex {
                region_idx,
                blob_len,
                region_size,
            } => Error::InvalidRegionIndex {
                region_idx: *region_idx,
                blob_len: *blob_len,
                region_size: *region_size,
            },
            Error::RangeOutOfBounds { start, end, region_len } => Error::RangeOutOfBounds {
                start: *start,
                end: *end,
                region_len: *region_len,
            },
            Error::NoEvictableRegion => Error::NoEvictableRegion,
            Error::PopulateFailed { start, end, source } => Error::PopulateFailed {
                start: *start,
                end: *end,
                source: source.clone(),
            },
            Error::InvariantViolation(s) => Error::InvariantViolation(s.clone()),
        }
    }
}
