//! Dedupe cache for answered request ids.
//!
//! Reprocessing a block range after a missed cursor advance redelivers the
//! same `TimeRequestSent` logs; membership here is what absorbs those
//! duplicates. A capacity cap and an insertion-time TTL together bound the
//! memory footprint under long runtimes or adversarial event volume.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Set of 32-byte ids with insertion-time TTL and a hard capacity cap.
pub struct BoundedHashCache {
    entries: HashMap<[u8; 32], Instant>,
    capacity: usize,
    ttl: Duration,
}

impl BoundedHashCache {
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Membership check; an expired entry counts as absent.
    pub fn contains(&self, id: &[u8; 32]) -> bool {
        match self.entries.get(id) {
            Some(inserted) => inserted.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Record an id. Expired entries are dropped first; if the cap still
    /// binds, the oldest entries by insertion time make room.
    pub fn insert(&mut self, id: [u8; 32]) {
        let now = Instant::now();
        self.entries
            .retain(|_, inserted| now.duration_since(*inserted) < self.ttl);

        while self.entries.len() >= self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, inserted)| **inserted)
                .map(|(id, _)| *id)
            else {
                break;
            };
            self.entries.remove(&oldest);
        }

        self.entries.insert(id, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn remembers_inserted_ids() {
        let mut cache = BoundedHashCache::new(10, 3600);
        assert!(!cache.contains(&[1u8; 32]));
        cache.insert([1u8; 32]);
        assert!(cache.contains(&[1u8; 32]));
    }

    #[test]
    fn oldest_id_leaves_first_at_capacity() {
        let mut cache = BoundedHashCache::new(3, 3600);
        for tag in 1..=3u8 {
            cache.insert([tag; 32]);
        }

        cache.insert([4u8; 32]);
        assert!(!cache.contains(&[1u8; 32]), "oldest should be evicted");
        for tag in 2..=4u8 {
            assert!(cache.contains(&[tag; 32]));
        }
    }

    #[test]
    fn expired_ids_read_as_absent() {
        let mut cache = BoundedHashCache::new(100, 1);
        cache.insert([42u8; 32]);
        assert!(cache.contains(&[42u8; 32]));
        sleep(Duration::from_secs(2));
        assert!(!cache.contains(&[42u8; 32]));
    }

    #[test]
    fn reinserting_refreshes_an_entry() {
        let mut cache = BoundedHashCache::new(2, 3600);
        cache.insert([1u8; 32]);
        cache.insert([2u8; 32]);
        // refresh makes [1] the newer entry, so [2] is evicted next
        cache.insert([1u8; 32]);
        cache.insert([3u8; 32]);
        assert!(cache.contains(&[1u8; 32]));
        assert!(!cache.contains(&[2u8; 32]));
        assert!(cache.contains(&[3u8; 32]));
    }
}
