//! Per-client vehicle storage
//!
//! Each connected client owns a small list of vehicles (cars plus, optionally,
//! the unicycle avatar). The list is guarded by its own lock so structural
//! changes never contend with the high-frequency position updates kept in
//! [`crate::positions::PositionCache`].
//!
//! Vehicle counts per player are small by construction, so every lookup is a
//! linear scan over a `Vec`.

use log::debug;
use parking_lot::{Mutex, MutexGuard};
use shared::VehicleId;

/// A single vehicle owned by a client
///
/// The payload is opaque to the server: it is whatever description the
/// owning client sent when spawning or last editing the vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleData {
    id: VehicleId,
    data: String,
}

impl VehicleData {
    pub fn new(id: VehicleId, data: String) -> Self {
        Self { id, data }
    }

    pub fn id(&self) -> VehicleId {
        self.id
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn set_data(&mut self, data: String) {
        self.data = data;
    }
}

/// Lock-protected list of a client's vehicles
///
/// Every public method takes the lock for exactly the duration of the call
/// and never calls back into another locking method while holding it.
#[derive(Debug, Default)]
pub struct VehicleStore {
    vehicles: Mutex<Vec<VehicleData>>,
}

impl VehicleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a vehicle without checking for duplicates
    ///
    /// Callers obtain `id` from [`VehicleStore::open_id`] or use
    /// [`VehicleStore::spawn`] to allocate and insert in one step.
    pub fn add(&self, id: VehicleId, data: String) {
        self.vehicles.lock().push(VehicleData::new(id, data));
    }

    /// Allocates the lowest free id and inserts the vehicle under one lock
    pub fn spawn(&self, data: String) -> VehicleId {
        let mut vehicles = self.vehicles.lock();
        let id = lowest_open_id(&vehicles);
        vehicles.push(VehicleData::new(id, data));
        id
    }

    /// Removes the first vehicle with `id`
    ///
    /// Returns whether something was removed. A miss is a normal outcome of
    /// racing disconnect cleanup and is only logged.
    pub fn delete(&self, id: VehicleId) -> bool {
        let mut vehicles = self.vehicles.lock();
        match vehicles.iter().position(|v| v.id == id) {
            Some(index) => {
                vehicles.remove(index);
                true
            }
            None => {
                debug!("tried to erase vehicle {} that doesn't exist (not an error)", id);
                false
            }
        }
    }

    pub fn clear(&self) {
        self.vehicles.lock().clear();
    }

    /// Smallest non-negative id not currently in use
    pub fn open_id(&self) -> VehicleId {
        lowest_open_id(&self.vehicles.lock())
    }

    pub fn data(&self, id: VehicleId) -> Option<String> {
        self.vehicles
            .lock()
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.data.clone())
    }

    /// Replaces the payload of vehicle `id`, returning false if it is absent
    pub fn set_data(&self, id: VehicleId, data: String) -> bool {
        let mut vehicles = self.vehicles.lock();
        match vehicles.iter_mut().find(|v| v.id == id) {
            Some(vehicle) => {
                vehicle.set_data(data);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: VehicleId) -> bool {
        self.vehicles.lock().iter().any(|v| v.id == id)
    }

    /// Number of stored vehicles, not counting `avatar` if it is present
    pub fn count_excluding(&self, avatar: Option<VehicleId>) -> usize {
        let vehicles = self.vehicles.lock();
        match avatar {
            Some(avatar) if vehicles.iter().any(|v| v.id == avatar) => vehicles.len() - 1,
            _ => vehicles.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.vehicles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.lock().is_empty()
    }

    /// Exclusive view over the whole list
    ///
    /// The lock is held until the returned guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, Vec<VehicleData>> {
        self.vehicles.lock()
    }
}

// Restarts the scan from the top after every collision so that the result is
// the minimum unused id regardless of insertion order.
fn lowest_open_id(vehicles: &[VehicleData]) -> VehicleId {
    let mut candidate: VehicleId = 0;
    loop {
        let mut collided = false;
        for vehicle in vehicles {
            if vehicle.id == candidate {
                candidate += 1;
                collided = true;
            }
        }
        if !collided {
            return candidate;
        }
    }
}
