//! Server network layer: TCP accept loop and the threads serving each client

use crate::client::Client;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::server::Server;
use crate::transport::TcpTransport;
use log::{debug, error, info, warn};
use shared::{encode_frame, read_frame, write_frame, ClientId, Packet, VehicleId, PROTOCOL_VERSION};
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// How long a writer waits on an empty queue before rechecking its client
const WRITER_POLL: Duration = Duration::from_millis(100);

/// Interval of the housekeeping (timeout) thread
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Listens for connections and owns the background threads of one [`Server`]
pub struct NetworkServer {
    listener: TcpListener,
    server: Arc<Server>,
}

impl NetworkServer {
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.socket_addr_string();
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!("Server listening on {}", addr);

        Ok(Self {
            listener,
            server: Server::new(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Starts the housekeeping and broadcast threads, then accepts
    /// connections until the listener fails
    pub fn run(self) -> Result<(), ServerError> {
        spawn_timeout_checker(Arc::downgrade(&self.server))?;
        spawn_broadcaster(Arc::downgrade(&self.server))?;

        info!("Server started successfully");

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => handle_connection(&self.server, stream),
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        Ok(())
    }
}

/// Spawns the thread that disconnects clients which stopped pinging
///
/// Runs until the server is dropped.
fn spawn_timeout_checker(server: Weak<Server>) -> io::Result<()> {
    thread::Builder::new()
        .name("housekeeping".to_string())
        .spawn(move || loop {
            thread::sleep(HOUSEKEEPING_INTERVAL);
            let Some(server) = server.upgrade() else {
                break;
            };

            let timed_out = server.check_timeouts();
            if !timed_out.is_empty() {
                info!("Disconnected {} timed-out client(s): {:?}", timed_out.len(), timed_out);
            }
            let pruned = server.prune_expired();
            if pruned > 0 {
                debug!("Pruned {} expired registry entries", pruned);
            }
        })?;
    Ok(())
}

/// Spawns the thread that relays vehicle positions at the configured tick rate
fn spawn_broadcaster(server: Weak<Server>) -> io::Result<()> {
    let tick = match server.upgrade() {
        Some(server) => server.config().tick_interval(),
        None => return Ok(()),
    };

    thread::Builder::new()
        .name("broadcast".to_string())
        .spawn(move || {
            let mut tick_count: u64 = 0;
            loop {
                thread::sleep(tick);
                let Some(server) = server.upgrade() else {
                    break;
                };

                let queued = server.broadcast_positions();
                tick_count += 1;
                if tick_count % 100 == 0 {
                    debug!(
                        "Tick {}: {} clients, {} position frames queued",
                        tick_count,
                        server.client_count(),
                        queued
                    );
                }
            }
        })?;
    Ok(())
}

/// Registers a freshly accepted connection and starts its reader and writer
fn handle_connection(server: &Arc<Server>, mut stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {:?}: {}", peer, e);
    }

    let transport = match stream.try_clone().and_then(TcpTransport::new) {
        Ok(transport) => transport,
        Err(e) => {
            warn!("Failed to set up transport for {:?}: {}", peer, e);
            return;
        }
    };

    let Some(client) = server.register(Box::new(transport)) else {
        info!("Rejecting {:?}: server full", peer);
        let kicked = Packet::Kicked {
            reason: "Server full".to_string(),
        };
        if let Err(e) = write_frame(&mut stream, &kicked) {
            debug!("Failed to notify {:?} of rejection: {}", peer, e);
        }
        return;
    };

    let id = client.id();
    if let Err(e) = spawn_writer(id, Arc::downgrade(&client)) {
        error!("Failed to spawn writer for client {}: {}", id, e);
        client.disconnect("Failed to start writer");
        server.remove_client(id);
        return;
    }

    let server = Arc::clone(server);
    let spawned = thread::Builder::new()
        .name(format!("client-{}-reader", id))
        .spawn(move || run_reader(server, client, stream));
    if let Err(e) = spawned {
        error!("Failed to spawn reader for client {}: {}", id, e);
    }
}

/// Drains the client's outbound queue onto its transport
///
/// Holds only a weak handle between rounds so it never outlives the
/// connection that owns the client.
fn spawn_writer(id: ClientId, client: Weak<Client>) -> io::Result<()> {
    thread::Builder::new().name(format!("client-{}-writer", id)).spawn(move || loop {
        let Some(client) = client.upgrade() else {
            break;
        };
        if client.is_disconnected() {
            break;
        }

        for packet in client.take_packets(WRITER_POLL) {
            if let Err(e) = client.send_raw(&packet) {
                debug!("Write to client {} failed: {}", client.id(), e);
                client.disconnect("Write failed");
                break;
            }
        }
    })?;
    Ok(())
}

/// Reads frames until the connection ends, then tears the client down
fn run_reader(server: Arc<Server>, client: Arc<Client>, stream: TcpStream) {
    let id = client.id();
    let mut reader = BufReader::new(stream);

    loop {
        match read_frame(&mut reader) {
            Ok(Some(packet)) => handle_packet(&server, id, packet),
            Ok(None) => {
                info!("Client {} closed the connection", id);
                break;
            }
            Err(e) => {
                if client.is_disconnected() {
                    debug!("Client {} reader stopped after disconnect: {}", id, e);
                } else {
                    warn!("Client {} read error: {}", id, e);
                }
                break;
            }
        }
    }

    cleanup_client(&server, &client);
}

/// Processes one packet from client `id`
///
/// The client is looked up through the registry on every packet, so a packet
/// racing with teardown of its sender is dropped quietly.
pub fn handle_packet(server: &Server, id: ClientId, packet: Packet) {
    let Some(client) = server.get_client(id).and_then(|weak| weak.upgrade()) else {
        debug!("Dropping packet from unknown client {}", id);
        return;
    };

    match packet {
        Packet::Hello { name, version } => {
            if version != PROTOCOL_VERSION {
                warn!("Client {} uses protocol {} (expected {})", id, version, PROTOCOL_VERSION);
                kick(&client, "Protocol version mismatch");
                return;
            }

            info!("Client {} identified as '{}'", id, name);
            client.set_name(name);
            client.update_ping_time();
            send_to(&client, &Packet::Welcome { client_id: id });
            send_existing_vehicles(server, &client);
        }

        Packet::Ping => {
            client.update_ping_time();
            send_to(&client, &Packet::Pong);
        }

        Packet::SpawnVehicle { data, unicycle } => {
            if unicycle {
                if let Some(old) = client.unicycle_id() {
                    client.purge_car(old);
                    broadcast(server, None, &Packet::VehicleDeleted { client_id: id, vehicle_id: old });
                }
            } else if client.car_count() >= server.config().max_cars {
                info!("Client {} hit the car limit ({})", id, server.config().max_cars);
                send_to(&client, &Packet::SpawnDenied {
                    reason: format!("Car limit of {} reached", server.config().max_cars),
                });
                return;
            }

            let vehicle_id = client.spawn_car(data.clone());
            if unicycle {
                client.set_unicycle_id(Some(vehicle_id));
            }
            debug!("Client {} spawned vehicle {}", id, vehicle_id);
            broadcast(server, None, &Packet::VehicleSpawned { client_id: id, vehicle_id, data });
        }

        Packet::EditVehicle { vehicle_id, data } => {
            if client.set_car_data(vehicle_id, data.clone()) {
                broadcast(server, Some(id), &Packet::VehicleEdited { client_id: id, vehicle_id, data });
            } else {
                debug!("Client {} edited unknown vehicle {}", id, vehicle_id);
            }
        }

        Packet::DeleteVehicle { vehicle_id } => {
            if client.has_car(vehicle_id) {
                client.purge_car(vehicle_id);
                broadcast(server, None, &Packet::VehicleDeleted { client_id: id, vehicle_id });
            } else {
                debug!("Client {} deleted unknown vehicle {}", id, vehicle_id);
            }
        }

        Packet::Position { vehicle_id, data } => {
            if !client.has_car(vehicle_id) {
                debug!("Client {} sent position for unknown vehicle {}", id, vehicle_id);
                return;
            }
            client.set_car_position(vehicle_id, data);
        }

        Packet::Disconnect => {
            info!("Client {} requested disconnect", id);
            client.disconnect("Client requested disconnect");
        }

        other => {
            warn!("Unexpected packet type from client {}: {:?}", id, other);
        }
    }
}

/// Disconnects, tells everyone else the client's vehicles are gone and drops
/// the registry entry
fn cleanup_client(server: &Server, client: &Client) {
    let id = client.id();
    client.disconnect("Connection closed");

    let vehicle_ids: Vec<VehicleId> = client.all_cars().iter().map(|v| v.id()).collect();
    for vehicle_id in vehicle_ids {
        broadcast(server, Some(id), &Packet::VehicleDeleted { client_id: id, vehicle_id });
    }
    client.clear_cars();
    client.clear_positions();
    server.remove_client(id);

    info!("Client {} ('{}') disconnected", id, client.name());
}

/// Sends a `Kicked` frame directly, then disconnects
///
/// The writer stops draining the queue once a client is disconnected, so the
/// notice can't go through it.
fn kick(client: &Client, reason: &str) {
    let packet = Packet::Kicked {
        reason: reason.to_string(),
    };
    match frame(&packet) {
        Ok(frame) => {
            if let Err(e) = client.send_raw(&frame) {
                debug!("Failed to notify client {} of kick: {}", client.id(), e);
            }
        }
        Err(e) => error!("Client {}: {}", client.id(), e),
    }
    client.disconnect(reason);
}

fn frame(packet: &Packet) -> Result<Vec<u8>, ServerError> {
    Ok(encode_frame(packet)?)
}

fn send_existing_vehicles(server: &Server, newcomer: &Client) {
    server.for_each_client(|weak| {
        if let Some(other) = weak.upgrade() {
            if other.id() != newcomer.id() {
                let vehicles: Vec<(VehicleId, String)> = other
                    .all_cars()
                    .iter()
                    .map(|v| (v.id(), v.data().to_string()))
                    .collect();
                for (vehicle_id, data) in vehicles {
                    send_to(newcomer, &Packet::VehicleSpawned {
                        client_id: other.id(),
                        vehicle_id,
                        data,
                    });
                }
            }
        }
        true
    });
}

fn send_to(client: &Client, packet: &Packet) {
    match frame(packet) {
        Ok(frame) => client.enqueue_packet(frame),
        Err(e) => error!("Client {}: {}", client.id(), e),
    }
}

fn broadcast(server: &Server, exclude: Option<ClientId>, packet: &Packet) {
    match frame(packet) {
        Ok(frame) => {
            server.broadcast_except(exclude, &frame);
        }
        Err(e) => error!("Broadcast dropped: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::MockTransport;
    use std::io::Cursor;

    fn test_server() -> Arc<Server> {
        Server::new(ServerConfig {
            max_cars: 2,
            ..Default::default()
        })
    }

    fn connect(server: &Arc<Server>) -> Arc<Client> {
        server.register(Box::new(MockTransport::open())).unwrap()
    }

    fn drain(client: &Client) -> Vec<Packet> {
        client
            .take_packets(Duration::ZERO)
            .iter()
            .map(|frame| read_frame(&mut Cursor::new(frame)).unwrap().unwrap())
            .collect()
    }

    #[test]
    fn test_hello_welcomes_and_names() {
        let server = test_server();
        let a = connect(&server);

        handle_packet(&server, a.id(), Packet::Hello { name: "alice".to_string(), version: PROTOCOL_VERSION });

        assert_eq!(a.name(), "alice");
        assert_eq!(drain(&a), vec![Packet::Welcome { client_id: a.id() }]);
    }

    #[test]
    fn test_hello_sends_existing_vehicles() {
        let server = test_server();
        let a = connect(&server);
        let b = connect(&server);
        let car = a.spawn_car("a-car");

        handle_packet(&server, b.id(), Packet::Hello { name: "bob".to_string(), version: PROTOCOL_VERSION });

        assert_eq!(
            drain(&b),
            vec![
                Packet::Welcome { client_id: b.id() },
                Packet::VehicleSpawned { client_id: a.id(), vehicle_id: car, data: "a-car".to_string() },
            ]
        );
    }

    #[test]
    fn test_hello_wrong_version_kicks() {
        let server = test_server();
        let mock = Arc::new(MockTransport::open());
        let a = server.register(Box::new(Arc::clone(&mock))).unwrap();

        handle_packet(&server, a.id(), Packet::Hello { name: "old".to_string(), version: PROTOCOL_VERSION + 1 });

        assert!(a.is_disconnected());
        assert!(drain(&a).is_empty());
        let sent = mock.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            read_frame(&mut Cursor::new(&sent[0])).unwrap(),
            Some(Packet::Kicked { .. })
        ));
    }

    #[test]
    fn test_ping_updates_liveness() {
        let server = test_server();
        let a = connect(&server);
        a.liveness().backdate(Duration::from_secs(8));

        handle_packet(&server, a.id(), Packet::Ping);

        assert_eq!(a.seconds_since_last_ping(), 0);
        assert_eq!(drain(&a), vec![Packet::Pong]);
    }

    #[test]
    fn test_spawn_broadcasts_to_everyone() {
        let server = test_server();
        let a = connect(&server);
        let b = connect(&server);

        handle_packet(&server, a.id(), Packet::SpawnVehicle { data: "car".to_string(), unicycle: false });

        let expected = Packet::VehicleSpawned { client_id: a.id(), vehicle_id: 0, data: "car".to_string() };
        assert_eq!(drain(&a), vec![expected.clone()]);
        assert_eq!(drain(&b), vec![expected]);
        assert_eq!(a.car_data(0), Some("car".to_string()));
    }

    #[test]
    fn test_oversized_packet_is_encode_error() {
        let packet = Packet::VehicleEdited {
            client_id: 1,
            vehicle_id: 0,
            data: "x".repeat(shared::MAX_FRAME_SIZE + 1),
        };
        assert!(matches!(frame(&packet), Err(ServerError::Encode(_))));
    }

    #[test]
    fn test_car_limit_ignores_unicycle() {
        let server = test_server();
        let a = connect(&server);

        handle_packet(&server, a.id(), Packet::SpawnVehicle { data: "uni".to_string(), unicycle: true });
        handle_packet(&server, a.id(), Packet::SpawnVehicle { data: "car1".to_string(), unicycle: false });
        handle_packet(&server, a.id(), Packet::SpawnVehicle { data: "car2".to_string(), unicycle: false });
        drain(&a);

        assert_eq!(a.car_count(), 2);
        assert_eq!(a.unicycle_id(), Some(0));

        handle_packet(&server, a.id(), Packet::SpawnVehicle { data: "car3".to_string(), unicycle: false });
        assert!(matches!(drain(&a).as_slice(), [Packet::SpawnDenied { .. }]));
        assert_eq!(a.all_cars().len(), 3);
    }

    #[test]
    fn test_second_unicycle_replaces_first() {
        let server = test_server();
        let a = connect(&server);

        handle_packet(&server, a.id(), Packet::SpawnVehicle { data: "uni".to_string(), unicycle: true });
        handle_packet(&server, a.id(), Packet::SpawnVehicle { data: "car".to_string(), unicycle: false });
        handle_packet(&server, a.id(), Packet::SpawnVehicle { data: "uni2".to_string(), unicycle: true });

        assert_eq!(a.all_cars().len(), 2);
        assert_eq!(a.unicycle_id(), Some(0));
        assert_eq!(a.car_data(0), Some("uni2".to_string()));
        assert_eq!(a.car_count(), 1);
    }

    #[test]
    fn test_edit_relays_to_others_only() {
        let server = test_server();
        let a = connect(&server);
        let b = connect(&server);
        let car = a.spawn_car("v1");

        handle_packet(&server, a.id(), Packet::EditVehicle { vehicle_id: car, data: "v2".to_string() });
        handle_packet(&server, a.id(), Packet::EditVehicle { vehicle_id: 42, data: "ghost".to_string() });

        assert!(drain(&a).is_empty());
        assert_eq!(
            drain(&b),
            vec![Packet::VehicleEdited { client_id: a.id(), vehicle_id: car, data: "v2".to_string() }]
        );
        assert_eq!(a.car_data(car), Some("v2".to_string()));
    }

    #[test]
    fn test_delete_vehicle() {
        let server = test_server();
        let a = connect(&server);
        let b = connect(&server);
        let car = a.spawn_car("v1");
        a.set_car_position(car, "p");

        handle_packet(&server, a.id(), Packet::DeleteVehicle { vehicle_id: car });
        handle_packet(&server, a.id(), Packet::DeleteVehicle { vehicle_id: car });

        assert_eq!(a.car_count(), 0);
        assert_eq!(a.car_position_raw(car), None);
        assert_eq!(drain(&b), vec![Packet::VehicleDeleted { client_id: a.id(), vehicle_id: car }]);
    }

    #[test]
    fn test_position_stored() {
        let server = test_server();
        let a = connect(&server);
        let car = a.spawn_car("car");

        handle_packet(&server, a.id(), Packet::Position { vehicle_id: car, data: "p1".to_string() });

        assert_eq!(a.car_position_raw(car), Some("p1".to_string()));
    }

    #[test]
    fn test_position_for_unowned_vehicle_dropped() {
        let server = test_server();
        let a = connect(&server);

        for vehicle_id in 0..1000 {
            handle_packet(&server, a.id(), Packet::Position { vehicle_id, data: "x".repeat(1024) });
        }

        assert_eq!(a.car_count(), 0);
        assert_eq!(a.car_position_raw(0), None);
        assert_eq!(a.car_position_raw(999), None);
        assert_eq!(a.position_count(), 0);
    }

    #[test]
    fn test_packet_for_unknown_client_is_dropped() {
        let server = test_server();
        let a = connect(&server);
        let id = a.id();
        drop(a);

        handle_packet(&server, id, Packet::SpawnVehicle { data: "car".to_string(), unicycle: false });
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_cleanup_notifies_and_unregisters() {
        let server = test_server();
        let a = connect(&server);
        let b = connect(&server);
        a.spawn_car("one");
        a.spawn_car("two");

        a.set_car_position(0, "p");

        cleanup_client(&server, &a);

        assert!(a.is_disconnected());
        assert_eq!(a.car_count(), 0);
        assert_eq!(a.car_position_raw(0), None);
        assert!(server.get_client(a.id()).is_none());
        assert_eq!(
            drain(&b),
            vec![
                Packet::VehicleDeleted { client_id: a.id(), vehicle_id: 0 },
                Packet::VehicleDeleted { client_id: a.id(), vehicle_id: 1 },
            ]
        );
    }
}
