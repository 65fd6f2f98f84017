//! Reverse map from page to owning cache and slab.
//!
//! A three-level radix table indexed by page frame number over a 48-bit
//! address space. Interior nodes are installed with compare-and-swap and
//! never freed before the map itself, so lookups take no lock.
//!
//! Only canonical addresses are keyed: bits 48 and up must copy bit 47.
//! Masking then keeps the low and high halves apart.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::{AllocError, AllocResult};

const ADDRESS_BITS: usize = 48;
const LEAF_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;

/// Owner of one page. Both words are zero for an unmapped page.
struct PageOwner {
    cache: AtomicUsize,
    slab: AtomicUsize,
}

struct Leaf {
    pages: [PageOwner; LEAF_LEN],
}

struct Mid {
    leaves: [AtomicPtr<Leaf>; MID_LEN],
}

pub(crate) struct PageMap<const PAGE_SIZE: usize> {
    root: Box<[AtomicPtr<Mid>]>,
}

/// Allocate a zeroed node. All-zero bytes are a valid value for every
/// atomic, so the node is ready to use.
fn alloc_node<T>() -> Option<*mut T> {
    let node = unsafe { alloc::alloc::alloc_zeroed(Layout::new::<T>()) } as *mut T;
    (!node.is_null()).then_some(node)
}

fn free_node<T>(node: *mut T) {
    unsafe { alloc::alloc::dealloc(node as *mut u8, Layout::new::<T>()) }
}

/// Load `slot`, installing a fresh node if it is empty.
fn get_or_install<T>(slot: &AtomicPtr<T>) -> AllocResult<&T> {
    let mut node = slot.load(Ordering::Acquire);
    if node.is_null() {
        let fresh = alloc_node::<T>().ok_or(AllocError::NoMemory)?;
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => node = fresh,
            Err(winner) => {
                free_node(fresh);
                node = winner;
            }
        }
    }
    Ok(unsafe { &*node })
}

impl<const PAGE_SIZE: usize> PageMap<PAGE_SIZE> {
    const PAGE_SHIFT: usize = PAGE_SIZE.trailing_zeros() as usize;
    const ROOT_BITS: usize = ADDRESS_BITS - Self::PAGE_SHIFT - MID_BITS - LEAF_BITS;

    pub fn new() -> Self {
        Self {
            root: (0..1usize << Self::ROOT_BITS)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    fn is_canonical(addr: usize) -> bool {
        let upper = addr >> (ADDRESS_BITS - 1);
        upper == 0 || upper == usize::MAX >> (ADDRESS_BITS - 1)
    }

    fn split(addr: usize) -> Option<(usize, usize, usize)> {
        if !Self::is_canonical(addr) {
            return None;
        }
        let pfn = (addr & ((1usize << ADDRESS_BITS) - 1)) >> Self::PAGE_SHIFT;
        Some((
            pfn >> (MID_BITS + LEAF_BITS),
            (pfn >> LEAF_BITS) & (MID_LEN - 1),
            pfn & (LEAF_LEN - 1),
        ))
    }

    fn entry(&self, addr: usize) -> Option<&PageOwner> {
        let (r, m, l) = Self::split(addr)?;
        let mid = self.root[r].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }
        let leaf = unsafe { &*mid }.leaves[m].load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        Some(&unsafe { &*leaf }.pages[l])
    }

    fn entry_or_install(&self, addr: usize) -> AllocResult<&PageOwner> {
        let (r, m, l) = Self::split(addr).ok_or(AllocError::InvalidParam)?;
        let mid = get_or_install(&self.root[r])?;
        let leaf = get_or_install(&mid.leaves[m])?;
        Ok(&leaf.pages[l])
    }

    /// Map `pages` pages starting at `base` to `(cache, slab)`.
    pub fn insert(&self, base: usize, pages: usize, cache: usize, slab: usize) -> AllocResult {
        for i in 0..pages {
            match self.entry_or_install(base + i * PAGE_SIZE) {
                Ok(owner) => {
                    owner.slab.store(slab, Ordering::Relaxed);
                    owner.cache.store(cache, Ordering::Release);
                }
                Err(e) => {
                    self.remove(base, i);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Unmap `pages` pages starting at `base`.
    pub fn remove(&self, base: usize, pages: usize) {
        for i in 0..pages {
            if let Some(owner) = self.entry(base + i * PAGE_SIZE) {
                owner.cache.store(0, Ordering::Release);
                owner.slab.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Owner `(cache, slab)` of the page containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<(usize, usize)> {
        let owner = self.entry(addr)?;
        let cache = owner.cache.load(Ordering::Acquire);
        if cache == 0 {
            return None;
        }
        Some((cache, owner.slab.load(Ordering::Relaxed)))
    }
}

impl<const PAGE_SIZE: usize> Drop for PageMap<PAGE_SIZE> {
    fn drop(&mut self) {
        for slot in self.root.iter() {
            let mid = slot.load(Ordering::Acquire);
            if mid.is_null() {
                continue;
            }
            for leaf in unsafe { &*mid }.leaves.iter() {
                let leaf = leaf.load(Ordering::Acquire);
                if !leaf.is_null() {
                    free_node(leaf);
                }
            }
            free_node(mid);
        }
    }
}
