//! Server-side state for one connected participant
//!
//! A [`Client`] bundles:
//! - identity (numeric id, display name, non-owning link to its [`Server`])
//! - the vehicle list and the position cache, each under its own lock
//! - the outbound packet queue drained by the writer thread
//! - the transport handle and the last-ping timestamp
//!
//! Clients are shared as `Arc<Client>` by the threads serving the connection
//! while the server registry only keeps a `Weak`, so dropping the last
//! connection-side handle destroys the client no matter who else is iterating
//! the registry.
//!
//! None of the three data locks is ever held while another is taken. If that
//! changes, acquire them in the order vehicles → positions → outbound.

use crate::liveness::LivenessTracker;
use crate::outbound::OutboundQueue;
use crate::positions::PositionCache;
use crate::server::Server;
use crate::transport::{Transport, TransportHandle};
use crate::vehicles::{VehicleData, VehicleStore};
use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock};
use shared::{ClientId, VehicleId};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug)]
pub struct Client {
    id: ClientId,
    name: RwLock<String>,
    server: Weak<Server>,
    unicycle_id: Mutex<Option<VehicleId>>,
    vehicles: VehicleStore,
    positions: PositionCache,
    outbound: OutboundQueue,
    transport: TransportHandle,
    liveness: LivenessTracker,
}

impl Client {
    /// Creates a client for an accepted connection
    ///
    /// `server` is not kept alive by the client.
    pub fn new(id: ClientId, server: Weak<Server>, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            name: RwLock::new(String::new()),
            server,
            unicycle_id: Mutex::new(None),
            vehicles: VehicleStore::new(),
            positions: PositionCache::new(),
            outbound: OutboundQueue::new(),
            transport: TransportHandle::new(transport),
            liveness: LivenessTracker::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// The owning server, if it still exists
    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.upgrade()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    pub fn unicycle_id(&self) -> Option<VehicleId> {
        *self.unicycle_id.lock()
    }

    pub fn set_unicycle_id(&self, id: Option<VehicleId>) {
        *self.unicycle_id.lock() = id;
    }

    // Vehicles

    /// Inserts a vehicle under a caller-chosen id
    ///
    /// Duplicates are not rejected. Ids taken from [`Client::open_car_id`] can
    /// collide if two threads spawn for the same client at once; use
    /// [`Client::spawn_car`] unless spawning is already serialized.
    pub fn add_new_car(&self, id: VehicleId, data: impl Into<String>) {
        self.vehicles.add(id, data.into());
    }

    /// Allocates the lowest open id and inserts the vehicle atomically
    pub fn spawn_car(&self, data: impl Into<String>) -> VehicleId {
        self.vehicles.spawn(data.into())
    }

    pub fn delete_car(&self, id: VehicleId) {
        if self.vehicles.delete(id) {
            let mut unicycle = self.unicycle_id.lock();
            if *unicycle == Some(id) {
                *unicycle = None;
            }
        }
    }

    /// Empties the vehicle list; cached positions are left alone
    pub fn clear_cars(&self) {
        self.vehicles.clear();
        *self.unicycle_id.lock() = None;
    }

    pub fn open_car_id(&self) -> VehicleId {
        self.vehicles.open_id()
    }

    /// Payload of vehicle `id`, or `None` if the client has no such vehicle
    pub fn car_data(&self, id: VehicleId) -> Option<String> {
        let data = self.vehicles.data(id);
        if data.is_none() {
            self.purge_car(id);
        }
        data
    }

    /// Updates the payload of vehicle `id` in place
    ///
    /// Returns false and purges leftovers for `id` if the vehicle is gone.
    pub fn set_car_data(&self, id: VehicleId, data: impl Into<String>) -> bool {
        if self.vehicles.set_data(id, data.into()) {
            return true;
        }
        self.purge_car(id);
        false
    }

    /// Number of player-visible cars; the unicycle avatar is not counted
    pub fn car_count(&self) -> usize {
        let unicycle = self.unicycle_id();
        self.vehicles.count_excluding(unicycle)
    }

    /// Exclusive access to the full vehicle list until the guard is dropped
    ///
    /// Don't call other vehicle methods on this client while holding it.
    pub fn all_cars(&self) -> MutexGuard<'_, Vec<VehicleData>> {
        self.vehicles.lock()
    }

    pub fn has_car(&self, id: VehicleId) -> bool {
        self.vehicles.contains(id)
    }

    /// Deletes vehicle `id` together with its cached position
    ///
    /// Also runs after a `car_data`/`set_car_data` miss, once the vehicle
    /// lock has been released, to drop a position left behind for an id the
    /// client no longer owns.
    pub fn purge_car(&self, id: VehicleId) {
        self.delete_car(id);
        if self.positions.remove(id).is_some() {
            debug!("Dropped position of vehicle {} for client {}", id, self.id);
        }
    }

    // Positions

    pub fn set_car_position(&self, id: VehicleId, data: impl Into<String>) {
        self.positions.set(id, data.into());
    }

    pub fn car_position_raw(&self, id: VehicleId) -> Option<String> {
        self.positions.get(id)
    }

    pub fn clear_positions(&self) {
        self.positions.clear();
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    // Outbound queue

    pub fn enqueue_packet(&self, packet: Vec<u8>) {
        self.outbound.push(packet);
    }

    /// Drains the outbound queue, waiting up to `timeout` if it is empty
    pub fn take_packets(&self, timeout: Duration) -> Vec<Vec<u8>> {
        self.outbound.drain(timeout)
    }

    pub fn pending_packets(&self) -> usize {
        self.outbound.len()
    }

    // Transport

    pub fn send_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.transport.send(bytes)
    }

    /// Closes the connection; safe to call repeatedly and from any thread
    pub fn disconnect(&self, reason: &str) {
        debug!("Disconnecting client {} for reason: {}", self.id, reason);
        self.transport.close();
        self.outbound.wake();
    }

    pub fn is_disconnected(&self) -> bool {
        !self.transport.is_open()
    }

    // Liveness

    pub fn update_ping_time(&self) {
        self.liveness.touch();
    }

    pub fn seconds_since_last_ping(&self) -> u64 {
        self.liveness.seconds_since()
    }

    #[cfg(test)]
    pub(crate) fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        debug!("client destroyed: {} ('{}')", self.id, self.name.get_mut());
    }
}
