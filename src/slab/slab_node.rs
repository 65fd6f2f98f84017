//! Slab descriptor implementation.
//!
//! A slab descriptor is a [`SlabHeader`] followed by one `u32` free-list cell
//! (bufctl) per object. It lives either at the colored start of the slab
//! pages (on-slab) or in an object of a generic metadata cache (off-slab).
//! Each free object's cell holds the index of the next free object; the last
//! free object holds [`BUFCTL_END`].

use super::debug::{CorruptionKind, DEBUG};

/// Terminates the free list.
pub const BUFCTL_END: u32 = u32::MAX;
/// Marks the cell of an allocated object in debug builds.
pub const BUFCTL_ACTIVE: u32 = u32::MAX - 1;
/// Objects per slab must stay below the reserved cell values.
pub const SLAB_LIMIT: u32 = u32::MAX - 3;

const SLAB_HEADER_MAGIC: u32 = 0x534c_4142;

#[repr(C)]
pub(crate) struct SlabHeader {
    magic: u32,
    node: u32,
    object_count: u32,
    in_use: u32,
    free: u32,
    colour_off: u32,
    /// Address of the first object slot
    s_mem: usize,
    /// First page of the slab
    base: usize,
    prev: usize,
    next: usize,
}

/// Bytes of descriptor needed for a slab of `objects` objects, before
/// alignment.
pub(crate) const fn descriptor_size(objects: usize) -> usize {
    core::mem::size_of::<SlabHeader>() + objects * core::mem::size_of::<u32>()
}

/// Size of the descriptor header alone.
pub(crate) const HEADER_SIZE: usize = core::mem::size_of::<SlabHeader>();

/// Handle to a slab descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabNode {
    /// Address of the descriptor
    pub addr: usize,
    /// Stride between object slots
    pub buffer_size: usize,
}

impl SlabNode {
    pub const fn new(addr: usize, buffer_size: usize) -> Self {
        Self { addr, buffer_size }
    }

    fn header(&self) -> &SlabHeader {
        unsafe { &*(self.addr as *const SlabHeader) }
    }

    fn header_mut(&mut self) -> &mut SlabHeader {
        unsafe { &mut *(self.addr as *mut SlabHeader) }
    }

    fn bufctl(&self) -> &[u32] {
        let count = self.header().object_count as usize;
        unsafe { core::slice::from_raw_parts((self.addr + HEADER_SIZE) as *const u32, count) }
    }

    fn bufctl_mut(&mut self) -> &mut [u32] {
        let count = self.header().object_count as usize;
        unsafe { core::slice::from_raw_parts_mut((self.addr + HEADER_SIZE) as *mut u32, count) }
    }

    /// Write a fresh descriptor with every object free.
    ///
    /// The descriptor memory must be writable for
    /// `descriptor_size(object_count)` bytes.
    pub fn init(
        &mut self,
        base: usize,
        colour_off: usize,
        s_mem: usize,
        node: usize,
        object_count: usize,
    ) {
        *self.header_mut() = SlabHeader {
            magic: SLAB_HEADER_MAGIC,
            node: node as u32,
            object_count: object_count as u32,
            in_use: 0,
            free: 0,
            colour_off: colour_off as u32,
            s_mem,
            base,
            prev: 0,
            next: 0,
        };
        for (i, cell) in self.bufctl_mut().iter_mut().enumerate() {
            *cell = i as u32 + 1;
        }
        if let Some(last) = self.bufctl_mut().last_mut() {
            *last = BUFCTL_END;
        }
    }

    pub fn is_valid(&self) -> bool {
        self.header().magic == SLAB_HEADER_MAGIC
    }

    pub fn node(&self) -> usize {
        self.header().node as usize
    }

    pub fn base(&self) -> usize {
        self.header().base
    }

    pub fn s_mem(&self) -> usize {
        self.header().s_mem
    }

    pub fn colour_off(&self) -> usize {
        self.header().colour_off as usize
    }

    pub fn in_use(&self) -> usize {
        self.header().in_use as usize
    }

    pub fn object_count(&self) -> usize {
        self.header().object_count as usize
    }

    pub fn is_full(&self) -> bool {
        self.header().in_use == self.header().object_count
    }

    pub fn is_empty(&self) -> bool {
        self.header().in_use == 0
    }

    pub fn object_addr(&self, index: usize) -> usize {
        self.s_mem() + index * self.buffer_size
    }

    /// Index of the slot starting at `objp`, or `None` when `objp` is not a
    /// slot boundary inside this slab.
    pub fn index_of(&self, objp: usize) -> Option<usize> {
        let offset = objp.checked_sub(self.s_mem())?;
        if offset % self.buffer_size != 0 {
            return None;
        }
        let index = offset / self.buffer_size;
        (index < self.object_count()).then_some(index)
    }

    /// Take the first free object. The slab must not be full.
    pub fn alloc_object(&mut self) -> usize {
        let index = self.header().free as usize;
        let next = self.bufctl()[index];
        if DEBUG {
            self.bufctl_mut()[index] = BUFCTL_ACTIVE;
        }
        let header = self.header_mut();
        header.free = next;
        header.in_use += 1;
        self.object_addr(index)
    }

    /// Link `objp` back at the head of the free list.
    pub fn free_object(&mut self, objp: usize) -> Result<(), CorruptionKind> {
        let index = if DEBUG {
            let index = self.index_of(objp).ok_or(CorruptionKind::Misaligned)?;
            if self.bufctl()[index] != BUFCTL_ACTIVE {
                return Err(CorruptionKind::DoubleFree);
            }
            index
        } else {
            (objp - self.s_mem()) / self.buffer_size
        };
        let free = self.header().free;
        self.bufctl_mut()[index] = free;
        let header = self.header_mut();
        header.free = index as u32;
        header.in_use -= 1;
        Ok(())
    }

    /// Walk the free list and verify its length matches `object_count - in_use`.
    pub fn check_free_list(&self) -> Result<(), CorruptionKind> {
        let expected = self.object_count() - self.in_use();
        let bufctl = self.bufctl();
        let mut cursor = self.header().free;
        let mut seen = 0;
        while cursor != BUFCTL_END {
            if cursor as usize >= bufctl.len() || seen >= expected {
                return Err(CorruptionKind::FreeList);
            }
            seen += 1;
            cursor = bufctl[cursor as usize];
        }
        if seen == expected {
            Ok(())
        } else {
            Err(CorruptionKind::FreeList)
        }
    }

    pub fn prev(&self) -> Option<usize> {
        let prev = self.header().prev;
        (prev != 0).then_some(prev)
    }

    pub fn next(&self) -> Option<usize> {
        let next = self.header().next;
        (next != 0).then_some(next)
    }

    pub fn set_prev(&mut self, prev: Option<usize>) {
        self.header_mut().prev = prev.unwrap_or(0);
    }

    pub fn set_next(&mut self, next: Option<usize>) {
        self.header_mut().next = next.unwrap_or(0);
    }
}
