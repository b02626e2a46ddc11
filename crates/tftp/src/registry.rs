//! Active-connection registry
//!
//! A fixed-size table of the client endpoints currently being serviced.
//! The listener consults it to drop duplicate request datagrams while a
//! session for that peer is still running; each session frees its slot on
//! exit. All operations take the single lock for their whole duration.

use std::net::SocketAddr;
use std::sync::Mutex;

/// Table capacity, identical to the per-server session cap.
pub const MAX_CONNECTIONS: usize = 16;

/// Shared table of in-flight `(address, port)` client endpoints.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: Mutex<[Option<SocketAddr>; MAX_CONNECTIONS]>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linear scan for `peer`; returns its slot index if present.
    pub fn search(&self, peer: SocketAddr) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        slots.iter().position(|slot| *slot == Some(peer))
    }

    /// Claim the first empty slot for `peer`. Returns `None` when the
    /// table is full.
    pub fn insert(&self, peer: SocketAddr) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots.iter().position(Option::is_none)?;
        slots[index] = Some(peer);
        Some(index)
    }

    /// Clear one slot.
    pub fn remove(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        slots[index % MAX_CONNECTIONS] = None;
    }

    /// Clear the whole table.
    pub fn invalidate_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.fill(None);
    }

    /// Number of occupied slots.
    pub fn active_count(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.iter().filter(|slot| slot.is_some()).count()
    }
}
