//! Last-known raw position per vehicle, kept apart from the vehicle list so
//! per-tick position writes don't wait on spawns and deletes.

use log::debug;
use parking_lot::Mutex;
use shared::VehicleId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PositionCache {
    positions: Mutex<HashMap<VehicleId, String>>,
}

impl PositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins
    pub fn set(&self, id: VehicleId, data: String) {
        self.positions.lock().insert(id, data);
    }

    pub fn get(&self, id: VehicleId) -> Option<String> {
        let position = self.positions.lock().get(&id).cloned();
        if position.is_none() {
            debug!("Failed to get vehicle position for {}: not present", id);
        }
        position
    }

    pub fn remove(&self, id: VehicleId) -> Option<String> {
        self.positions.lock().remove(&id)
    }

    pub fn clear(&self) {
        self.positions.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.positions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.lock().is_empty()
    }
}
