//! Intrusive doubly linked list of slab descriptors.
//!
//! Links live inside the descriptors themselves, so moving a slab between
//! the full, partial and empty lists never allocates.

use super::slab_node::SlabNode;

pub(crate) struct SlabIntrusiveList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl SlabIntrusiveList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<usize> {
        self.head
    }

    #[cfg(test)]
    pub fn back(&self) -> Option<usize> {
        self.tail
    }

    pub fn push_front(&mut self, slab: usize) {
        let mut node = link(slab);
        node.set_prev(None);
        node.set_next(self.head);

        if let Some(head) = self.head {
            link(head).set_prev(Some(slab));
        } else {
            self.tail = Some(slab);
        }

        self.head = Some(slab);
        self.len += 1;
    }

    pub fn push_back(&mut self, slab: usize) {
        let mut node = link(slab);
        node.set_prev(self.tail);
        node.set_next(None);

        if let Some(tail) = self.tail {
            link(tail).set_next(Some(slab));
        } else {
            self.head = Some(slab);
        }

        self.tail = Some(slab);
        self.len += 1;
    }

    pub fn pop_back(&mut self) -> Option<usize> {
        let tail = self.tail?;
        self.remove(tail);
        Some(tail)
    }

    pub fn remove(&mut self, slab: usize) {
        let mut node = link(slab);
        let prev = node.prev();
        let next = node.next();

        if let Some(prev) = prev {
            link(prev).set_next(next);
        } else {
            self.head = next;
        }

        if let Some(next) = next {
            link(next).set_prev(prev);
        } else {
            self.tail = prev;
        }

        node.set_prev(None);
        node.set_next(None);
        self.len -= 1;
    }

    pub fn iter(&self) -> SlabListIter {
        SlabListIter { cursor: self.head }
    }
}

pub(crate) struct SlabListIter {
    cursor: Option<usize>,
}

impl Iterator for SlabListIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.cursor?;
        self.cursor = link(current).next();
        Some(current)
    }
}

/// View of a descriptor used only for its list links.
fn link(addr: usize) -> SlabNode {
    SlabNode::new(addr, 0)
}
