//! Buddy page allocator module
//!
//! One [`BuddyZone`] manages the memory of one NUMA node with
//! power-of-two split and merge.

pub mod buddy_zone;

pub use buddy_zone::{BuddyZone, MAX_BUDDY_ORDER};
