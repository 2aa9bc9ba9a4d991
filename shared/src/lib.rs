use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

pub type ClientId = u32;
pub type VehicleId = u32;

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 30814;
pub const DEFAULT_TICK_RATE: u32 = 20;
pub const DEFAULT_MAX_CARS: usize = 1;
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 10;

/// Upper bound on a single encoded frame body, in bytes.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Packet {
    Hello {
        name: String,
        version: u32,
    },
    Ping,
    SpawnVehicle {
        data: String,
        unicycle: bool,
    },
    EditVehicle {
        vehicle_id: VehicleId,
        data: String,
    },
    DeleteVehicle {
        vehicle_id: VehicleId,
    },
    Position {
        vehicle_id: VehicleId,
        data: String,
    },
    Disconnect,

    Welcome {
        client_id: ClientId,
    },
    Pong,
    VehicleSpawned {
        client_id: ClientId,
        vehicle_id: VehicleId,
        data: String,
    },
    VehicleEdited {
        client_id: ClientId,
        vehicle_id: VehicleId,
        data: String,
    },
    VehicleDeleted {
        client_id: ClientId,
        vehicle_id: VehicleId,
    },
    PositionUpdate {
        client_id: ClientId,
        vehicle_id: VehicleId,
        data: String,
    },
    SpawnDenied {
        reason: String,
    },
    Kicked {
        reason: String,
    },
}

/// Serializes a packet into a length-prefixed frame (u32 little-endian length, then body).
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode::serialize(packet)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Box::new(bincode::ErrorKind::SizeLimit));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads one frame from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
/// Oversized or undecodable frames are reported as `InvalidData`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Packet>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_SIZE),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_frame<W: Write>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let frame = encode_frame(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame)
}
