//! Debug-build object checks.
//!
//! Red zones are guard words placed before and after each object; poison
//! is a byte pattern written over free objects. Both are active only in
//! builds with `debug_assertions`, and only for caches created with
//! [`SlabFlags::RED_ZONE`](super::SlabFlags::RED_ZONE) or
//! [`SlabFlags::POISON`](super::SlabFlags::POISON).

use core::fmt;

#[cfg(feature = "log")]
use log::error;

/// Whether integrity checks are compiled in.
pub(crate) const DEBUG: bool = cfg!(debug_assertions);

pub(crate) const POISON_FREE: u8 = 0x6b;
pub(crate) const POISON_END: u8 = 0xa5;
pub(crate) const RED_INACTIVE: u64 = 0x09F9_1102_9D74_E35B;
pub(crate) const RED_ACTIVE: u64 = 0xD841_56C5_6356_88C0;
pub(crate) const RED_ZONE_SIZE: usize = core::mem::size_of::<u64>();

/// Kind of damage found by an integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// Object freed while already free
    DoubleFree,
    /// Guard word around an object was overwritten
    RedZone,
    /// Free object was written after it was freed
    Poison,
    /// Free list length or linkage does not match the in-use count
    FreeList,
    /// Pointer is not the start of an object slot
    Misaligned,
    /// Pointer belongs to no slab, or to another cache
    ForeignObject,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CorruptionKind::DoubleFree => "double free",
            CorruptionKind::RedZone => "red zone overwritten",
            CorruptionKind::Poison => "use after free",
            CorruptionKind::FreeList => "slab free list corrupted",
            CorruptionKind::Misaligned => "pointer is not an object boundary",
            CorruptionKind::ForeignObject => "object does not belong to this cache",
        };
        f.write_str(msg)
    }
}

/// Where a corruption was found.
pub(crate) struct CorruptionSite<'a> {
    pub cache: &'a str,
    pub objp: usize,
    pub slab_base: usize,
    pub in_use: usize,
    pub dump_len: usize,
}

/// Log everything known about the damaged object and stop: the slab state
/// can no longer be trusted.
#[cold]
#[inline(never)]
pub(crate) fn report_corruption(kind: CorruptionKind, site: CorruptionSite<'_>) -> ! {
    error!(
        "slab corruption in cache '{}': {} at {:#x} (slab {:#x}, {} in use)",
        site.cache, kind, site.objp, site.slab_base, site.in_use
    );
    if site.objp != 0 && site.dump_len != 0 {
        dump_object(site.objp, site.dump_len.min(64));
    }
    panic!("slab corruption in cache '{}': {}", site.cache, kind);
}

#[allow(unused_variables)]
fn dump_object(objp: usize, len: usize) {
    let bytes = unsafe { core::slice::from_raw_parts(objp as *const u8, len) };
    for (i, line) in bytes.chunks(16).enumerate() {
        error!("{:#x}: {:02x?}", objp + i * 16, line);
    }
}

/// Fill a free object with the poison pattern.
pub(crate) fn poison(objp: usize, len: usize) {
    if len == 0 {
        return;
    }
    let bytes = unsafe { core::slice::from_raw_parts_mut(objp as *mut u8, len) };
    bytes.fill(POISON_FREE);
    bytes[len - 1] = POISON_END;
}

/// Whether the poison pattern written by [`poison`] is intact.
pub(crate) fn poison_intact(objp: usize, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    let bytes = unsafe { core::slice::from_raw_parts(objp as *const u8, len) };
    bytes[..len - 1].iter().all(|&b| b == POISON_FREE) && bytes[len - 1] == POISON_END
}

pub(crate) fn read_red_zone(addr: usize) -> u64 {
    unsafe { core::ptr::read_unaligned(addr as *const u64) }
}

pub(crate) fn write_red_zone(addr: usize, value: u64) {
    unsafe { core::ptr::write_unaligned(addr as *mut u64, value) }
}
