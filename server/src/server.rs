//! Server-wide client registry
//!
//! The registry maps client ids to `Weak<Client>` handles. Ownership of each
//! client stays with the threads serving its connection; once they let go the
//! entry simply fails to upgrade and is skipped (and later pruned).
//!
//! Traversal works on a snapshot taken under the registry's read lock, so the
//! callback runs without the lock held and may itself register or remove
//! clients.

use crate::client::Client;
use crate::config::ServerConfig;
use crate::transport::Transport;
use log::{debug, info, warn};
use parking_lot::{RwLock, RwLockReadGuard};
use shared::{encode_frame, ClientId, Packet, VehicleId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

pub type ClientMap = BTreeMap<ClientId, Weak<Client>>;

#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    clients: RwLock<ClientMap>,
    next_client_id: AtomicU32,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            clients: RwLock::new(BTreeMap::new()),
            next_client_id: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Creates a client for a new connection and records it in the registry
    ///
    /// The registry only keeps a weak handle; the returned `Arc` is the
    /// caller's to hold for as long as the connection is served. Returns
    /// `None` when the server is full.
    pub fn register(self: &Arc<Self>, transport: Box<dyn Transport>) -> Option<Arc<Client>> {
        let client = {
            let mut clients = self.clients.write();
            clients.retain(|_, weak| weak.strong_count() > 0);
            if clients.len() >= self.config.max_clients {
                return None;
            }

            let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            let client = Arc::new(Client::new(id, Arc::downgrade(self), transport));
            clients.insert(id, Arc::downgrade(&client));
            client
        };

        let id = client.id();
        match client.peer_addr() {
            Some(addr) => info!("Client {} connected from {}", id, addr),
            None => info!("Client {} connected", id),
        }
        Some(client)
    }

    /// Drops the registry entry for `id`; the client itself lives on while
    /// anyone still holds it
    pub fn remove_client(&self, id: ClientId) -> bool {
        let removed = self.clients.write().remove(&id).is_some();
        if removed {
            info!("Client {} removed from registry", id);
        }
        removed
    }

    /// Removes entries whose client has already been destroyed
    pub fn prune_expired(&self) -> usize {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|_, weak| weak.strong_count() > 0);
        before - clients.len()
    }

    /// Read access to the raw registry
    ///
    /// Don't call back into methods that take the registry lock while
    /// holding this.
    pub fn registry(&self) -> RwLockReadGuard<'_, ClientMap> {
        self.clients.read()
    }

    /// Number of registered clients that are still alive
    pub fn client_count(&self) -> usize {
        self.registry()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Weak handles to every registered client, in id order
    pub fn client_snapshot(&self) -> Vec<Weak<Client>> {
        self.registry().values().cloned().collect()
    }

    /// Calls `f` for each registered client until it returns `false`
    ///
    /// Handles may already be expired; callers must upgrade before use.
    pub fn for_each_client<F>(&self, mut f: F)
    where
        F: FnMut(&Weak<Client>) -> bool,
    {
        for weak in self.client_snapshot() {
            if !f(&weak) {
                break;
            }
        }
    }

    /// Finds a live client by id
    pub fn get_client(&self, id: ClientId) -> Option<Weak<Client>> {
        let mut found = None;
        self.for_each_client(|weak| {
            match weak.upgrade() {
                Some(client) => {
                    if client.id() == id {
                        found = Some(weak.clone());
                        return false;
                    }
                }
                None => debug!("Found an expired client while looking for id {}", id),
            }
            true
        });
        found
    }

    /// Queues `frame` for every live client except `sender`
    ///
    /// Returns the number of clients the frame was queued for.
    pub fn broadcast_except(&self, sender: Option<ClientId>, frame: &[u8]) -> usize {
        let mut queued = 0;
        self.for_each_client(|weak| {
            if let Some(client) = weak.upgrade() {
                if Some(client.id()) != sender && !client.is_disconnected() {
                    client.enqueue_packet(frame.to_vec());
                    queued += 1;
                }
            }
            true
        });
        queued
    }

    /// Sends every known vehicle position to all other clients
    ///
    /// The vehicle list and the position cache are read one after the other,
    /// never both locked at once. Returns the number of frames queued.
    pub fn broadcast_positions(&self) -> usize {
        let mut queued = 0;
        for weak in self.client_snapshot() {
            let Some(client) = weak.upgrade() else {
                continue;
            };

            let vehicle_ids: Vec<VehicleId> = client.all_cars().iter().map(|v| v.id()).collect();
            for vehicle_id in vehicle_ids {
                let Some(data) = client.car_position_raw(vehicle_id) else {
                    continue;
                };
                let packet = Packet::PositionUpdate {
                    client_id: client.id(),
                    vehicle_id,
                    data,
                };
                match encode_frame(&packet) {
                    Ok(frame) => queued += self.broadcast_except(Some(client.id()), &frame),
                    Err(e) => warn!("Failed to encode position of {}:{}: {}", client.id(), vehicle_id, e),
                }
            }
        }
        queued
    }

    /// Disconnects every client that hasn't pinged within the configured timeout
    pub fn check_timeouts(&self) -> Vec<ClientId> {
        let timeout = self.config.ping_timeout_secs;
        let mut timed_out = Vec::new();
        self.for_each_client(|weak| {
            if let Some(client) = weak.upgrade() {
                if !client.is_disconnected() && client.seconds_since_last_ping() > timeout {
                    info!("Client {} timed out ({}s since last ping)", client.id(), client.seconds_since_last_ping());
                    client.disconnect("Timeout (no ping received)");
                    timed_out.push(client.id());
                }
            }
            true
        });
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::MockTransport;
    use shared::read_frame;
    use std::io::Cursor;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn test_server(max_clients: usize) -> Arc<Server> {
        Server::new(ServerConfig {
            max_clients,
            ping_timeout_secs: 10,
            ..Default::default()
        })
    }

    fn connect(server: &Arc<Server>) -> Arc<Client> {
        server.register(Box::new(MockTransport::open())).unwrap()
    }

    fn decode(frame: &[u8]) -> Packet {
        read_frame(&mut Cursor::new(frame)).unwrap().unwrap()
    }

    #[test]
    fn test_register_assigns_ids() {
        let server = test_server(4);
        let a = connect(&server);
        let b = connect(&server);

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(server.client_count(), 2);
        assert!(Arc::ptr_eq(&a.server().unwrap(), &server));
    }

    /// Records whether the registry was readable when the connect line was logged
    struct LockCheckingTransport {
        server: Weak<Server>,
        registry_free: Arc<AtomicBool>,
    }

    impl Transport for LockCheckingTransport {
        fn is_open(&self) -> bool {
            true
        }

        fn shutdown(&self, _how: std::net::Shutdown) -> std::io::Result<()> {
            Ok(())
        }

        fn close(&self) -> std::io::Result<()> {
            Ok(())
        }

        fn send(&self, _bytes: &[u8]) -> std::io::Result<()> {
            Ok(())
        }

        fn peer_addr(&self) -> Option<std::net::SocketAddr> {
            if let Some(server) = self.server.upgrade() {
                let free = server.clients.try_read().is_some();
                self.registry_free.store(free, Ordering::SeqCst);
            }
            None
        }
    }

    #[test]
    fn test_register_logs_after_releasing_registry() {
        let server = test_server(4);
        let registry_free = Arc::new(AtomicBool::new(false));
        let transport = LockCheckingTransport {
            server: Arc::downgrade(&server),
            registry_free: Arc::clone(&registry_free),
        };

        let _client = server.register(Box::new(transport)).unwrap();

        assert!(registry_free.load(Ordering::SeqCst));
    }

    #[test]
    fn test_registry_does_not_keep_clients_alive() {
        let server = test_server(4);
        let a = connect(&server);
        let weak = Arc::downgrade(&a);

        drop(a);

        assert!(weak.upgrade().is_none());
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.prune_expired(), 1);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_client_does_not_keep_server_alive() {
        let server = test_server(4);
        let a = connect(&server);

        drop(server);

        assert!(a.server().is_none());
    }

    #[test]
    fn test_max_clients() {
        let server = test_server(1);
        let a = connect(&server);
        assert!(server.register(Box::new(MockTransport::open())).is_none());

        // Slot frees up once the first client is gone
        drop(a);
        assert!(server.register(Box::new(MockTransport::open())).is_some());
    }

    #[test]
    fn test_get_client_skips_expired() {
        let server = test_server(8);
        let a = connect(&server);
        let b = connect(&server);
        let c = connect(&server);
        let c_id = c.id();
        drop(b);

        let found = server.get_client(c_id).and_then(|w| w.upgrade()).unwrap();
        assert!(Arc::ptr_eq(&found, &c));
        assert!(server.get_client(a.id()).is_some());
    }

    #[test]
    fn test_get_client_missing() {
        let server = test_server(8);
        let a = connect(&server);
        assert!(server.get_client(a.id() + 100).is_none());

        let a_id = a.id();
        drop(a);
        assert!(server.get_client(a_id).is_none());
    }

    #[test]
    fn test_for_each_client_stops_early() {
        let server = test_server(8);
        let _clients: Vec<_> = (0..5).map(|_| connect(&server)).collect();

        let mut visited = 0;
        server.for_each_client(|_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_for_each_client_may_modify_registry() {
        let server = test_server(8);
        let a = connect(&server);
        let b = connect(&server);

        let mut seen = Vec::new();
        server.for_each_client(|weak| {
            if let Some(client) = weak.upgrade() {
                seen.push(client.id());
                server.remove_client(client.id());
            }
            true
        });

        assert_eq!(seen, vec![a.id(), b.id()]);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_remove_client() {
        let server = test_server(4);
        let a = connect(&server);

        assert!(server.remove_client(a.id()));
        assert!(!server.remove_client(a.id()));
        assert!(server.get_client(a.id()).is_none());
        // Still usable by whoever holds it
        a.spawn_car("still here");
        assert_eq!(a.car_count(), 1);
    }

    #[test]
    fn test_broadcast_except_skips_sender_and_disconnected() {
        let server = test_server(8);
        let a = connect(&server);
        let b = connect(&server);
        let c = connect(&server);
        c.disconnect("gone");

        let queued = server.broadcast_except(Some(a.id()), b"frame");

        assert_eq!(queued, 1);
        assert_eq!(a.pending_packets(), 0);
        assert_eq!(b.take_packets(Duration::ZERO), vec![b"frame".to_vec()]);
        assert_eq!(c.pending_packets(), 0);
    }

    #[test]
    fn test_broadcast_positions() {
        let server = test_server(8);
        let a = connect(&server);
        let b = connect(&server);

        let car = a.spawn_car("car");
        a.spawn_car("parked");
        a.set_car_position(car, "p1");
        // Position without a vehicle is not broadcast
        a.set_car_position(9, "stray");

        assert_eq!(server.broadcast_positions(), 1);
        assert_eq!(a.pending_packets(), 0);

        let frames = b.take_packets(Duration::ZERO);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            decode(&frames[0]),
            Packet::PositionUpdate {
                client_id: a.id(),
                vehicle_id: car,
                data: "p1".to_string(),
            }
        );
    }

    #[test]
    fn test_check_timeouts() {
        let server = test_server(8);
        let stale = connect(&server);
        let fresh = connect(&server);
        stale.liveness().backdate(Duration::from_secs(11));

        let timed_out = server.check_timeouts();

        assert_eq!(timed_out, vec![stale.id()]);
        assert!(stale.is_disconnected());
        assert!(!fresh.is_disconnected());

        // Already disconnected clients are not reported twice
        assert!(server.check_timeouts().is_empty());
    }
}
