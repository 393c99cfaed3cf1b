use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use lru_time_cache::LruCache;

/// The busy-machines registry (component G): machines tentatively assigned
/// during a dispatch, guarding against double-dispatch.
///
/// Reservations expire after a TTL so a crash between reserving and
/// releasing cannot leak a machine forever.
pub struct BusyMachines {
    reservations: Mutex<LruCache<String, ()>>,
}

impl BusyMachines {
    pub fn new(ttl: Duration) -> Self {
        Self {
            reservations: Mutex::new(LruCache::with_expiry_duration(ttl)),
        }
    }

    /// Reserve a machine. Returns false when it is already held.
    pub fn reserve(&self, machine_id: &str) -> bool {
        let mut reservations = self.reservations.lock().unwrap();
        if reservations.contains_key(machine_id) {
            return false;
        }
        reservations.insert(machine_id.to_string(), ());
        true
    }

    pub fn release(&self, machine_id: &str) {
        self.reservations.lock().unwrap().remove(machine_id);
    }

    pub fn is_reserved(&self, machine_id: &str) -> bool {
        self.reservations.lock().unwrap().contains_key(machine_id)
    }

    /// IDs currently held (expired reservations excluded).
    pub fn reserved(&self) -> HashSet<String> {
        let mut reservations = self.reservations.lock().unwrap();
        reservations.iter().map(|(id, _)| id.clone()).collect()
    }
}

impl Default for BusyMachines {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
