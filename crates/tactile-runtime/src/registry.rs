//! Device Registry - id allocation and discovery bookkeeping
//!
//! Producers (OS hooks, polling threads) allocate ids and announce devices;
//! the consumer pops pending announcements during the discovery step of an
//! update. Announcements made before the consumer is ready stay pending
//! until they are delivered.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tactile_core::{DeviceDescription, DeviceId, TactileError, TactileResult};

/// What an announcement did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Announcement {
    /// Recorded and queued for delivery to the consumer
    Queued,
    /// The id is already live; the announcement was ignored
    Duplicate,
    /// The id was removed earlier; the announcement was ignored
    Removed,
}

#[derive(Default)]
struct RegistryInner {
    /// Live devices in discovery order
    live: Vec<(DeviceId, DeviceDescription)>,
    /// Live devices not yet delivered to the consumer, in discovery order
    pending: VecDeque<DeviceId>,
    removed: HashSet<DeviceId>,
}

impl RegistryInner {
    fn position(&self, id: DeviceId) -> Option<usize> {
        self.live.iter().position(|(live, _)| *live == id)
    }
}

/// Allocates device ids and tracks live devices
pub struct DeviceRegistry {
    /// Next id to hand out
    cursor: AtomicU32,
    inner: Mutex<RegistryInner>,
    announced: AtomicU64,
    removed_count: AtomicU64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::starting_at(DeviceId::FIRST.0)
    }

    /// Registry whose next allocation is `first`
    pub fn starting_at(first: u32) -> Self {
        DeviceRegistry {
            cursor: AtomicU32::new(first.max(DeviceId::FIRST.0)),
            inner: Mutex::new(RegistryInner::default()),
            announced: AtomicU64::new(0),
            removed_count: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh device id.
    ///
    /// Ids are handed out in increasing order and never reused, so a live
    /// id is never returned twice. Fails with `Exhausted` once the id space
    /// is used up.
    pub fn allocate_id(&self) -> TactileResult<DeviceId> {
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            if current == u32::MAX {
                warn!("device id space exhausted");
                return Err(TactileError::Exhausted);
            }
            match self.cursor.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(DeviceId::new(current)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a discovered device and queue it for delivery
    pub fn announce(
        &self,
        id: DeviceId,
        description: DeviceDescription,
    ) -> TactileResult<Announcement> {
        if !id.is_valid() {
            return Err(TactileError::InvalidDeviceId);
        }

        let mut inner = self.inner.lock();
        if inner.removed.contains(&id) {
            drop(inner);
            warn!(device = id.0, "announcement for removed device ignored");
            return Ok(Announcement::Removed);
        }
        if inner.position(id).is_some() {
            drop(inner);
            warn!(device = id.0, "duplicate announcement for live device ignored");
            return Ok(Announcement::Duplicate);
        }

        // Externally chosen ids must never be allocated later
        self.cursor
            .fetch_max(id.0.saturating_add(1), Ordering::AcqRel);

        inner.live.push((id, description));
        inner.pending.push_back(id);
        let pending = inner.pending.len();
        drop(inner);

        self.announced.fetch_add(1, Ordering::Relaxed);
        info!(device = id.0, pending, "device discovered");
        Ok(Announcement::Queued)
    }

    /// Pop the oldest undelivered announcement
    pub fn pop_pending(&self) -> Option<(DeviceId, DeviceDescription)> {
        let mut inner = self.inner.lock();
        while let Some(id) = inner.pending.pop_front() {
            if let Some(index) = inner.position(id) {
                return Some(inner.live[index].clone());
            }
        }
        None
    }

    /// Remove a live device, dropping its description and any undelivered
    /// announcement. The id stays retired.
    pub fn remove(&self, id: DeviceId) -> Option<DeviceDescription> {
        let mut inner = self.inner.lock();
        let index = inner.position(id)?;
        let (_, description) = inner.live.remove(index);
        inner.pending.retain(|pending| *pending != id);
        inner.removed.insert(id);
        drop(inner);

        self.removed_count.fetch_add(1, Ordering::Relaxed);
        info!(device = id.0, "device removed");
        Some(description)
    }

    /// Retire an id that was allocated but never announced
    pub fn retire(&self, id: DeviceId) -> bool {
        if !self.is_allocated(id) {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.position(id).is_some() {
            return false;
        }
        let inserted = inner.removed.insert(id);
        if inserted {
            debug!(device = id.0, "unannounced device id retired");
        }
        inserted
    }

    /// Live devices in discovery order
    pub fn devices(&self) -> Vec<(DeviceId, DeviceDescription)> {
        self.inner.lock().live.clone()
    }

    pub fn description(&self, id: DeviceId) -> Option<DeviceDescription> {
        let inner = self.inner.lock();
        inner.position(id).map(|index| inner.live[index].1.clone())
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.inner.lock().position(id).is_some()
    }

    /// True if `id` was handed out or announced at some point
    pub fn is_allocated(&self, id: DeviceId) -> bool {
        id.is_valid() && id.0 < self.cursor.load(Ordering::Acquire)
    }

    pub fn is_removed(&self, id: DeviceId) -> bool {
        self.inner.lock().removed.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Announcements not yet delivered to the consumer
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn announced_count(&self) -> u64 {
        self.announced.load(Ordering::Relaxed)
    }

    pub fn removed_count(&self) -> u64 {
        self.removed_count.load(Ordering::Relaxed)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeviceRegistry")
            .field("next_id", &self.cursor.load(Ordering::Relaxed))
            .field("live", &inner.live.len())
            .field("pending", &inner.pending.len())
            .field("removed", &inner.removed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn describe(name: &str) -> DeviceDescription {
        DeviceDescription::from(format!(r#"{{"product":"{}"}}"#, name))
    }

    #[test]
    fn test_allocation_skips_sentinel_and_is_monotonic() {
        let registry = DeviceRegistry::starting_at(0);
        let first = registry.allocate_id().unwrap();
        let second = registry.allocate_id().unwrap();

        assert!(first.is_valid());
        assert_eq!(first, DeviceId::FIRST);
        assert!(second > first);
    }

    #[test]
    fn test_exhaustion() {
        let registry = DeviceRegistry::starting_at(u32::MAX - 1);
        assert_eq!(registry.allocate_id().unwrap(), DeviceId::new(u32::MAX - 1));
        assert!(matches!(registry.allocate_id(), Err(TactileError::Exhausted)));
        assert!(matches!(registry.allocate_id(), Err(TactileError::Exhausted)));
    }

    #[test]
    fn test_external_id_bumps_cursor() {
        let registry = DeviceRegistry::new();
        registry.announce(DeviceId::new(40), describe("pad")).unwrap();

        let next = registry.allocate_id().unwrap();
        assert_eq!(next, DeviceId::new(41));
    }

    #[test]
    fn test_pending_delivered_in_order_exactly_once() {
        let registry = DeviceRegistry::new();
        let a = registry.allocate_id().unwrap();
        let b = registry.allocate_id().unwrap();
        registry.announce(b, describe("b")).unwrap();
        registry.announce(a, describe("a")).unwrap();

        assert_eq!(registry.pending_count(), 2);
        let pending: Vec<_> = std::iter::from_fn(|| registry.pop_pending())
            .map(|(id, _)| id)
            .collect();
        assert_eq!(pending, vec![b, a]);
        assert!(registry.pop_pending().is_none());

        // Delivered devices stay queryable
        assert_eq!(registry.devices().len(), 2);
        assert_eq!(registry.description(a), Some(describe("a")));
    }

    #[test]
    fn test_duplicate_and_invalid_announcements() {
        let registry = DeviceRegistry::new();
        let id = registry.allocate_id().unwrap();

        assert_eq!(registry.announce(id, describe("x")).unwrap(), Announcement::Queued);
        assert_eq!(registry.announce(id, describe("y")).unwrap(), Announcement::Duplicate);
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.description(id), Some(describe("x")));

        assert!(matches!(
            registry.announce(DeviceId::INVALID, describe("z")),
            Err(TactileError::InvalidDeviceId)
        ));
    }

    #[test]
    fn test_remove_drops_pending_and_retires_id() {
        let registry = DeviceRegistry::new();
        let id = registry.allocate_id().unwrap();
        registry.announce(id, describe("gone")).unwrap();

        assert_eq!(registry.remove(id), Some(describe("gone")));
        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.contains(id));
        assert!(registry.is_removed(id));
        assert!(registry.remove(id).is_none());

        // Announcing a removed id is a logged no-op
        assert_eq!(registry.announce(id, describe("again")).unwrap(), Announcement::Removed);
        assert!(registry.devices().is_empty());

        // Re-discovery happens under a fresh id
        assert_ne!(registry.allocate_id().unwrap(), id);
        assert_eq!(registry.removed_count(), 1);
    }

    #[test]
    fn test_retire_unannounced_id() {
        let registry = DeviceRegistry::new();
        let id = registry.allocate_id().unwrap();

        assert!(registry.is_allocated(id));
        assert!(!registry.is_allocated(DeviceId::new(999)));
        assert!(!registry.is_allocated(DeviceId::INVALID));

        assert!(registry.retire(id));
        assert!(!registry.retire(id));
        assert_eq!(registry.announce(id, describe("late")).unwrap(), Announcement::Removed);
        assert!(!registry.retire(DeviceId::new(999)));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let registry = Arc::new(DeviceRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| registry.allocate_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id.is_valid());
                assert!(seen.insert(id), "id {} allocated twice", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
