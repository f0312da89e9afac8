//! Process-wide ICMP identifier allocation.

use std::sync::atomic::{AtomicU32, Ordering};

/// Source of identifiers that tag concurrent ICMP exchanges.
pub trait IdentifierSource: Send + Sync {
    fn next_id(&self) -> u16;
}

/// Lock-free wrapping counter over `[0, max]`.
#[derive(Debug)]
pub struct IcmpIdAllocator {
    next: AtomicU32,
    max: u16,
}

impl IcmpIdAllocator {
    /// Allocator over the full 16-bit identifier space.
    pub fn new() -> Self {
        Self::with_max(u16::MAX)
    }

    pub fn with_max(max: u16) -> Self {
        Self {
            next: AtomicU32::new(0),
            max,
        }
    }
}

impl Default for IcmpIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierSource for IcmpIdAllocator {
    fn next_id(&self) -> u16 {
        let max = u32::from(self.max);
        let prev = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(if cur >= max { 0 } else { cur + 1 })
            })
            .unwrap_or_else(|cur| cur);
        prev as u16
    }
}
