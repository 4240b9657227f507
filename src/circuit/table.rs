//! Per-connection circuit table
//!
//! Maps circuit ids to the queue handles of their reactor tasks. The mutex
//! guards only the map operations; circuit state itself lives in the reactor
//! and is never touched under this lock.

use crate::circuit::CircuitHandle;
use crate::error::{RelayError, Result};
use crate::protocol::cell::{CircId, LinkVersion};
use rand::RngCore;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

/// Bounded number of random draws before allocation gives up.
const MAX_ALLOC_ATTEMPTS: usize = 16;

/// Which side of the link picks the id. The initiator of a connection sets
/// the id's most significant bit; the responder clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitRole {
    Initiator,
    Responder,
}

pub struct CircuitTable {
    /// Width of ids on this link: 16 bits under version <= 3, else 32.
    id_bits: u8,
    inner: Mutex<HashMap<CircId, CircuitHandle>>,
}

impl CircuitTable {
    pub fn new(version: LinkVersion) -> Self {
        Self {
            id_bits: if version <= 3 { 16 } else { 32 },
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn msb(&self) -> CircId {
        1 << (self.id_bits - 1)
    }

    fn width_mask(&self) -> CircId {
        if self.id_bits == 16 {
            0xffff
        } else {
            0xffff_ffff
        }
    }

    /// Whether `id` carries the most significant bit the peer's role requires.
    pub fn msb_matches(&self, id: CircId, role: CircuitRole) -> bool {
        match role {
            CircuitRole::Initiator => id & self.msb() != 0,
            CircuitRole::Responder => id & self.msb() == 0,
        }
    }

    /// Allocate a fresh id with the role's MSB and insert `handle` under it.
    pub fn allocate(&self, role: CircuitRole, handle: CircuitHandle) -> Result<CircId> {
        let mut rng = rand::rngs::OsRng;
        self.allocate_with(role, handle, || rng.next_u32())
    }

    /// Allocation with a caller-supplied id source. Nothing is inserted until
    /// a draw succeeds; colliding and zero draws are simply retried.
    pub fn allocate_with(
        &self,
        role: CircuitRole,
        handle: CircuitHandle,
        mut draw: impl FnMut() -> u32,
    ) -> Result<CircId> {
        let mut inner = self.inner.lock().expect("circuit table poisoned");
        for _ in 0..MAX_ALLOC_ATTEMPTS {
            let raw = draw() & self.width_mask();
            let id = match role {
                CircuitRole::Initiator => raw | self.msb(),
                CircuitRole::Responder => raw & !self.msb(),
            };
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = inner.entry(id) {
                entry.insert(handle);
                return Ok(id);
            }
        }
        Err(RelayError::CircuitIdExhausted)
    }

    /// Insert a peer-chosen id. Fails when the id is already taken.
    pub fn insert(&self, id: CircId, handle: CircuitHandle) -> Result<()> {
        let mut inner = self.inner.lock().expect("circuit table poisoned");
        match inner.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
            Entry::Occupied(_) => Err(RelayError::Internal(format!(
                "circuit id {} already in use",
                id
            ))),
        }
    }

    pub fn lookup(&self, id: CircId) -> Option<CircuitHandle> {
        self.inner
            .lock()
            .expect("circuit table poisoned")
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: CircId) -> Option<CircuitHandle> {
        self.inner
            .lock()
            .expect("circuit table poisoned")
            .remove(&id)
    }

    /// Empty the table, returning every handle (connection teardown).
    pub fn drain(&self) -> Vec<(CircId, CircuitHandle)> {
        self.inner
            .lock()
            .expect("circuit table poisoned")
            .drain()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("circuit table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitMsg, LinkSide};
    use tokio::sync::mpsc;

    fn handle() -> (CircuitHandle, mpsc::Receiver<CircuitMsg>) {
        let (tx, rx) = mpsc::channel(4);
        (
            CircuitHandle {
                tx,
                side: LinkSide::Client,
            },
            rx,
        )
    }

    #[test]
    fn test_allocation_sets_msb_by_role() {
        for version in [3u16, 4] {
            let table = CircuitTable::new(version);
            for _ in 0..50 {
                let (h, _rx) = handle();
                let id = table.allocate(CircuitRole::Initiator, h).unwrap();
                assert!(table.msb_matches(id, CircuitRole::Initiator));
                assert_ne!(id, 0);

                let (h, _rx) = handle();
                let id = table.allocate(CircuitRole::Responder, h).unwrap();
                assert!(table.msb_matches(id, CircuitRole::Responder));
                assert_ne!(id, 0);
            }
        }
    }

    #[test]
    fn test_collision_draws_again_without_visible_change() {
        let table = CircuitTable::new(4);
        let (h, _rx) = handle();
        let first = table
            .allocate_with(CircuitRole::Responder, h, || 0x1234)
            .unwrap();
        assert_eq!(first, 0x1234);
        assert_eq!(table.len(), 1);

        // First draw collides; the allocator must draw again and succeed with
        // no state change in between.
        let mut draws = vec![0x5678u32, 0x1234].into_iter();
        let (h, _rx) = handle();
        let second = table
            .allocate_with(CircuitRole::Responder, h, || draws.next().unwrap())
            .unwrap();
        assert_eq!(second, 0x5678);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_allocation_exhaustion_is_bounded() {
        let table = CircuitTable::new(4);
        let (h, _rx) = handle();
        table
            .allocate_with(CircuitRole::Responder, h, || 0x42)
            .unwrap();

        // Every draw collides; allocation must give up, not spin.
        let (h, _rx) = handle();
        let err = table
            .allocate_with(CircuitRole::Responder, h, || 0x42)
            .unwrap_err();
        assert!(matches!(err, RelayError::CircuitIdExhausted));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_short_ids_fit_their_width() {
        let table = CircuitTable::new(3);
        let (h, _rx) = handle();
        let id = table
            .allocate_with(CircuitRole::Initiator, h, || 0xdead_beef)
            .unwrap();
        assert!(id <= 0xffff);
        assert!(id & 0x8000 != 0);
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let table = CircuitTable::new(4);
        let (h, _rx) = handle();
        table.insert(7, h).unwrap();
        let (h, _rx) = handle();
        assert!(table.insert(7, h).is_err());

        assert!(table.lookup(7).is_some());
        assert!(table.remove(7).is_some());
        assert!(table.lookup(7).is_none());
        assert!(table.remove(7).is_none());
    }
}
