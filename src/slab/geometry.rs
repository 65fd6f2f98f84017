//! Slab geometry.
//!
//! Chooses object alignment, metadata placement, slab order and coloring
//! for a cache, and the default front-end tunables for its object size.

use super::debug::{DEBUG, RED_ZONE_SIZE};
use super::slab_node::{descriptor_size, HEADER_SIZE, SLAB_LIMIT};
use super::SlabFlags;
use crate::{AllocError, AllocResult, BYTES_PER_WORD};

/// Global limits that shape every geometry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GeometryLimits {
    pub page_size: usize,
    pub max_order: usize,
    pub break_order: usize,
    pub cache_line: usize,
}

impl GeometryLimits {
    pub fn max_object_size(&self) -> usize {
        self.page_size << self.max_order
    }
}

/// Layout of the slabs of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabGeometry {
    /// Usable bytes per object as requested, rounded to a word
    pub object_size: usize,
    /// Distance between consecutive object slots
    pub buffer_size: usize,
    /// Alignment of every object handed out
    pub align: usize,
    /// Offset of the usable bytes inside a slot (non-zero with red zones)
    pub obj_offset: usize,
    /// Each slab spans `2^order` pages
    pub order: usize,
    pub objects_per_slab: usize,
    /// Descriptor bytes; aligned when the descriptor lives on-slab
    pub mgmt_size: usize,
    /// Whether the descriptor lives in a separate metadata object
    pub off_slab: bool,
    /// Slab bytes not covered by objects or on-slab metadata
    pub left_over: usize,
    /// Coloring unit
    pub colour_off: usize,
    /// Number of distinct coloring offsets, at least 1
    pub colour_count: usize,
    /// Whether each slot carries guard words
    pub red_zone: bool,
}

fn on_slab_mgmt(objects: usize, align: usize) -> usize {
    crate::align_up(descriptor_size(objects), align)
}

/// Objects of `buffer_size` fitting a slab of `2^order` pages, and the bytes
/// left over.
fn estimate(
    order: usize,
    buffer_size: usize,
    align: usize,
    off_slab: bool,
    page_size: usize,
) -> (usize, usize) {
    let slab_bytes = page_size << order;
    let (num, mgmt) = if off_slab {
        ((slab_bytes / buffer_size).min(SLAB_LIMIT as usize), 0)
    } else if slab_bytes <= HEADER_SIZE {
        (0, 0)
    } else {
        let mut num = (slab_bytes - HEADER_SIZE) / (buffer_size + core::mem::size_of::<u32>());
        if num > 0 && on_slab_mgmt(num, align) + num * buffer_size > slab_bytes {
            num -= 1;
        }
        let num = num.min(SLAB_LIMIT as usize);
        (num, on_slab_mgmt(num, align))
    };
    (num, slab_bytes.saturating_sub(num * buffer_size + mgmt))
}

/// Smallest acceptable order as `(order, objects, left_over)`.
fn calculate_order(
    buffer_size: usize,
    align: usize,
    off_slab: bool,
    reclaim: bool,
    limits: &GeometryLimits,
) -> Option<(usize, usize, usize)> {
    let mut chosen = None;
    for order in 0..=limits.max_order {
        let (num, left_over) = estimate(order, buffer_size, align, off_slab, limits.page_size);
        if num == 0 {
            continue;
        }
        if off_slab {
            // Keep the descriptor no larger than one object
            let limit = buffer_size.saturating_sub(HEADER_SIZE) / core::mem::size_of::<u32>();
            if num > limit {
                break;
            }
        }
        chosen = Some((order, num, left_over));

        if reclaim || order >= limits.break_order {
            break;
        }
        // Acceptable internal fragmentation
        if left_over * 8 <= limits.page_size << order {
            break;
        }
    }
    chosen
}

impl SlabGeometry {
    /// Compute the geometry for objects of `size` bytes.
    ///
    /// `metadata_fits(bytes)` reports whether an on-slab metadata cache can
    /// hold an off-slab descriptor of that size; when none can, the
    /// descriptor stays on-slab.
    pub(crate) fn compute(
        size: usize,
        align: usize,
        flags: SlabFlags,
        limits: &GeometryLimits,
        metadata_fits: impl Fn(usize) -> bool,
    ) -> AllocResult<Self> {
        if size < BYTES_PER_WORD || size > limits.max_object_size() {
            return Err(AllocError::InvalidParam);
        }
        if align != 0 && (!align.is_power_of_two() || align > limits.page_size) {
            return Err(AllocError::InvalidParam);
        }

        let object_size = crate::align_up(size, BYTES_PER_WORD);

        let mut ralign = if flags.contains(SlabFlags::HWCACHE_ALIGN) {
            let mut ralign = limits.cache_line;
            while object_size <= ralign / 2 {
                ralign /= 2;
            }
            ralign
        } else {
            BYTES_PER_WORD
        };
        ralign = ralign.max(align).max(BYTES_PER_WORD);

        let red_zone = DEBUG && flags.contains(SlabFlags::RED_ZONE) && ralign <= RED_ZONE_SIZE;
        let (obj_offset, slot) = if red_zone {
            (RED_ZONE_SIZE, object_size + 2 * RED_ZONE_SIZE)
        } else {
            (0, object_size)
        };
        let buffer_size = crate::align_up(slot, ralign);

        let reclaim = flags.contains(SlabFlags::RECLAIM_ACCOUNT);
        let wants_off_slab =
            buffer_size >= limits.page_size >> 3 || flags.contains(SlabFlags::OFF_SLAB);

        let mut layout = None;
        if wants_off_slab {
            if let Some((order, num, left_over)) =
                calculate_order(buffer_size, ralign, true, reclaim, limits)
            {
                let on_slab_size = on_slab_mgmt(num, ralign);
                if left_over >= on_slab_size {
                    // The descriptor fits in the waste: keep it on-slab
                    layout = Some((order, num, left_over - on_slab_size, on_slab_size, false));
                } else if metadata_fits(descriptor_size(num)) {
                    layout = Some((order, num, left_over, descriptor_size(num), true));
                }
            }
        }
        let (order, objects_per_slab, left_over, mgmt_size, off_slab) = match layout {
            Some(layout) => layout,
            None => {
                let (order, num, left_over) =
                    calculate_order(buffer_size, ralign, false, reclaim, limits)
                        .ok_or(AllocError::NoGeometry)?;
                (order, num, left_over, on_slab_mgmt(num, ralign), false)
            }
        };

        let colour_off = limits.cache_line.max(ralign);
        let colour_count = (left_over / colour_off).max(1);

        Ok(Self {
            object_size,
            buffer_size,
            align: ralign,
            obj_offset,
            order,
            objects_per_slab,
            mgmt_size,
            off_slab,
            left_over,
            colour_off,
            colour_count,
            red_zone,
        })
    }

    pub const fn pages_per_slab(&self) -> usize {
        1 << self.order
    }
}

/// Front-end and shared-array sizing of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tunables {
    pub limit: usize,
    pub batch: usize,
    /// Shared array holds `shared * batch` entries; 0 disables it
    pub shared: usize,
}

impl Tunables {
    /// Defaults by slot size: small objects get deep front-ends.
    pub fn for_size(buffer_size: usize, page_size: usize, active_cpus: usize) -> Self {
        let limit = if buffer_size > 128 * 1024 {
            1
        } else if buffer_size > page_size {
            8
        } else if buffer_size > 1024 {
            24
        } else if buffer_size > 256 {
            54
        } else {
            120
        };
        let shared = if buffer_size <= page_size && active_cpus > 1 {
            8
        } else {
            0
        };
        Self {
            limit,
            batch: (limit + 1) / 2,
            shared,
        }
    }

    pub fn validate(&self) -> AllocResult {
        if self.limit == 0 || self.batch == 0 || self.batch > self.limit {
            return Err(AllocError::InvalidParam);
        }
        Ok(())
    }

    /// Capacity of an alien staging array.
    pub fn alien_limit(&self) -> usize {
        if self.limit > 1 {
            12
        } else {
            self.limit
        }
    }
}
