//! Automatic user-namespace allocation.
//!
//! Containers requesting an automatic namespace get non-overlapping host ID
//! ranges carved out of the configured subordinate ranges, skipping whatever
//! existing containers already hold. The arithmetic lives in
//! [`crate::idset`]; this module applies it and enforces the size bounds.

use crate::config::IdRange;
use crate::errors::{Result, StoreError};
use crate::idset::{IdMap, IdSet};

/// Smallest automatic namespace handed out when no size is requested.
pub const AUTO_USERNS_MIN_SIZE: u32 = 1024;
/// Largest automatic namespace a caller may request.
pub const AUTO_USERNS_MAX_SIZE: u32 = 65536;

/// Caller knobs for automatic namespace allocation.
#[derive(Debug, Clone, Default)]
pub struct AutoUserNsOptions {
    /// Namespace size; 0 means the configured minimum.
    pub size: u32,
    /// Extra mappings appended verbatim after the allocated ones. Their
    /// container IDs are excluded from the allocated range.
    pub additional_uid_mappings: Vec<IdMap>,
    pub additional_gid_mappings: Vec<IdMap>,
}

/// Resolve and validate the requested namespace size.
pub fn auto_userns_size(requested: u32, min: Option<u32>, max: Option<u32>) -> Result<u32> {
    let min = min.unwrap_or(AUTO_USERNS_MIN_SIZE);
    let max = max.unwrap_or(AUTO_USERNS_MAX_SIZE);
    let size = if requested == 0 {
        min
    } else {
        requested.max(min)
    };
    if size > max {
        return Err(StoreError::InvalidMappings(format!(
            "requested user namespace size {size} exceeds the maximum {max}"
        )));
    }
    Ok(size)
}

/// The pool of host IDs a configuration offers for one side.
pub fn subordinate_pool(ranges: &[IdRange]) -> IdSet {
    IdSet::from_ranges(
        ranges
            .iter()
            .map(|r| (r.start, r.start.saturating_add(r.length))),
    )
}

/// Allocate host mappings for a namespace of `size` IDs.
///
/// The container side is `[0, size)` minus the container IDs claimed by
/// `additional` mappings; the host side is `available` minus `used`, lowest
/// IDs first. `additional` mappings are appended verbatim.
pub fn allocate_mappings(
    size: u32,
    available: &IdSet,
    used: &IdSet,
    additional: &[IdMap],
) -> Result<Vec<IdMap>> {
    let target = IdSet::from_ranges([(0, size)])
        .subtract(&IdSet::container_ids(additional));
    let needed = target.size();
    if needed > u64::from(u32::MAX) {
        return Err(StoreError::NoAvailableIds);
    }
    let free = available.subtract(used);
    let host = free.find_available(needed as u32)?;
    let mut mappings = host.zip(&target);
    mappings.extend_from_slice(additional);
    Ok(mappings)
}
