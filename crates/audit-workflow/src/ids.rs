//! Identifier Allocation
//!
//! Allocators are injected into the engine so every caller (or test) owns its
//! own id sequence. Nothing here is process-global.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of identifiers for new audits, steps and cloned templates
pub trait IdAllocator: Send + Sync {
    fn next_id(&self) -> Uuid;
}

/// Time-ordered random ids for production use
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidAllocator;

impl IdAllocator for UuidAllocator {
    fn next_id(&self) -> Uuid {
        Uuid::now_v7()
    }
}

/// Deterministic, caller-scoped sequence.
///
/// Ids are `namespace` in the high 64 bits and a counter in the low 64 bits,
/// so two scopes with different namespaces never collide. Also used for
/// placeholder rows while a remote create has not yet become visible.
#[derive(Debug)]
pub struct ScopedIds {
    namespace: u64,
    counter: AtomicU64,
}

impl ScopedIds {
    pub fn new(namespace: u64) -> Self {
        Self {
            namespace,
            counter: AtomicU64::new(0),
        }
    }

    /// How many ids have been handed out
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// True if `id` was minted by a scope with this namespace
    pub fn owns(&self, id: Uuid) -> bool {
        (id.as_u128() >> 64) as u64 == self.namespace
    }
}

impl IdAllocator for ScopedIds {
    fn next_id(&self) -> Uuid {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Uuid::from_u128(((self.namespace as u128) << 64) | n as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_ids_are_sequential_and_isolated() {
        let a = ScopedIds::new(1);
        let b = ScopedIds::new(2);

        let a1 = a.next_id();
        let a2 = a.next_id();
        let b1 = b.next_id();

        assert_ne!(a1, a2);
        assert_ne!(a1, b1);
        assert!(a2 > a1);
        assert_eq!(a.issued(), 2);
        assert_eq!(b.issued(), 1);
        assert!(a.owns(a2));
        assert!(!a.owns(b1));
    }

    #[test]
    fn test_uuid_allocator_is_unique() {
        let alloc = UuidAllocator;
        assert_ne!(alloc.next_id(), alloc.next_id());
    }
}
