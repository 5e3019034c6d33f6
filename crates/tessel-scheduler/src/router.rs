//! Deterministic routing of task targets to segments and segment-offset groups.
//!
//! `segment_count` hash buckets bound task fan-out; `segment_offset_count`
//! contiguous groups of those buckets bound coordination: each group is
//! guarded by exactly one lease per time slice.

use std::ops::Range;

use sha2::{Digest, Sha256};

/// Hash bucket of `target`, always within `0..segment_count`.
///
/// Uses the first eight bytes of SHA-256 so every node, platform and release
/// routes a given target identically. A `segment_count` of zero maps
/// everything to segment 0.
pub fn segment(target: &str, segment_count: u32) -> u32 {
    if segment_count == 0 {
        return 0;
    }
    let digest = Sha256::digest(target.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(segment_count)) as u32
}

/// First segment of the group that `segment` belongs to.
pub fn segment_offset(segment: u32, segment_count: u32, segment_offset_count: u32) -> u32 {
    let per_group = segments_per_offset(segment_count, segment_offset_count);
    (segment / per_group) * per_group
}

/// All segments guarded by the lease at `offset`.
pub fn segments_in_group(offset: u32, segment_count: u32, segment_offset_count: u32) -> Range<u32> {
    let per_group = segments_per_offset(segment_count, segment_offset_count);
    offset..offset.saturating_add(per_group).min(segment_count)
}

/// Check the segment arithmetic of a task type.
pub fn validate(segment_count: u32, segment_offset_count: u32) -> Result<(), String> {
    if segment_count == 0 {
        return Err("segment count must be greater than zero".to_string());
    }
    if segment_offset_count == 0 {
        return Err("segment offset count must be greater than zero".to_string());
    }
    if segment_count % segment_offset_count != 0 {
        return Err(format!(
            "segment offset count {segment_offset_count} does not evenly divide segment count {segment_count}"
        ));
    }
    Ok(())
}

fn segments_per_offset(segment_count: u32, segment_offset_count: u32) -> u32 {
    (segment_count / segment_offset_count.max(1)).max(1)
}
