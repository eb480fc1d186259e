//! Message identifier allocation.
//!
//! Identifiers are 16-bit non-zero values used for QoS 1/2 PUBLISH,
//! SUBSCRIBE and UNSUBSCRIBE. A new identifier must not collide with any
//! message still waiting in the outbound registry; a re-sent packet keeps
//! the identifier it was first sent with.

/// Highest message identifier.
pub const MAX_MSG_ID: u16 = 65535;

/// Hands out message identifiers in increasing order, wrapping at
/// [`MAX_MSG_ID`] back to 1.
///
/// The allocator does not own the set of identifiers in use; the caller
/// passes a predicate over its outbound registry so the two can never
/// disagree.
#[derive(Debug, Default)]
pub struct PacketIdAllocator {
    /// Last identifier handed out (0 before the first allocation).
    last_id: u16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next identifier for which `in_use` is false.
    ///
    /// Returns `None` after a full lap without finding a free identifier.
    /// The counter only moves on success.
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        let mut candidate = self.last_id;
        for _ in 0..MAX_MSG_ID {
            candidate = next_id(candidate);
            if !in_use(candidate) {
                self.last_id = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Last identifier handed out.
    pub fn last(&self) -> u16 {
        self.last_id
    }

    /// Continue numbering after `id` (used when in-flight state is restored).
    pub fn resume_after(&mut self, id: u16) {
        self.last_id = id;
    }

    /// Start over from 1 (used on clean session).
    pub fn reset(&mut self) {
        self.last_id = 0;
    }
}

/// Advance an identifier, skipping 0.
fn next_id(id: u16) -> u16 {
    if id == MAX_MSG_ID {
        1
    } else {
        id + 1
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut alloc = PacketIdAllocator::new();
        assert_eq!(alloc.allocate(|_| false), Some(1));
        assert_eq!(alloc.allocate(|_| false), Some(2));
        assert_eq!(alloc.allocate(|_| false), Some(3));
    }

    #[test]
    fn test_skips_zero() {
        let mut alloc = PacketIdAllocator::new();
        alloc.resume_after(65534);
        assert_eq!(alloc.allocate(|_| false), Some(65535));
        assert_eq!(alloc.allocate(|_| false), Some(1));
    }

    #[test]
    fn test_skips_in_use() {
        let mut alloc = PacketIdAllocator::new();
        let used: HashSet<u16> = [1, 2, 4].into_iter().collect();
        assert_eq!(alloc.allocate(|id| used.contains(&id)), Some(3));
        assert_eq!(alloc.allocate(|id| used.contains(&id)), Some(5));
    }

    #[test]
    fn test_exhausted() {
        let mut alloc = PacketIdAllocator::new();
        alloc.resume_after(100);
        assert_eq!(alloc.allocate(|_| true), None);
        // Counter unchanged after failure
        assert_eq!(alloc.last(), 100);
        assert_eq!(alloc.allocate(|id| id != 7), Some(7));
    }

    #[test]
    fn test_unique_while_outstanding() {
        let mut alloc = PacketIdAllocator::new();
        let mut outstanding = HashSet::new();

        // Three laps around the id space, releasing every other id so the
        // allocator keeps running into ids that are still held.
        for round in 0..(3 * MAX_MSG_ID as u32) {
            let id = alloc
                .allocate(|id| outstanding.contains(&id))
                .expect("ids available");
            assert!(outstanding.insert(id), "id {} handed out twice", id);
            if round % 2 == 0 {
                outstanding.remove(&id);
            }
            if outstanding.len() > 30_000 {
                let drop: Vec<u16> = outstanding.iter().copied().take(10_000).collect();
                for id in drop {
                    outstanding.remove(&id);
                }
            }
        }
    }

    #[test]
    fn test_reset() {
        let mut alloc = PacketIdAllocator::new();
        alloc.allocate(|_| false);
        alloc.allocate(|_| false);
        alloc.reset();
        assert_eq!(alloc.allocate(|_| false), Some(1));
    }
}
