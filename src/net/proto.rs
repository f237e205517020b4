use uuid::Uuid;

use crate::world::{chunk::VirtualChunk, ChunkPos, TileType};

pub const PROTOCOL_VERSION: i64 = 1;

pub mod tag {
    pub const CLIENT_REQUEST: u16 = 0x00;
    pub const SERVER_INFO: u16 = 0x01;
    pub const BASIC_AUTH: u16 = 0x02;
    pub const PLAYER_INFO: u16 = 0x03;
    pub const DISCONNECT: u16 = 0x04;
    pub const PING: u16 = 0x05;
    pub const CHUNK: u16 = 0x06;
    pub const CHUNK_UNLOAD: u16 = 0x07;
    pub const CHUNK_UPDATE: u16 = 0x08;
    pub const PLAYER_POSITION: u16 = 0x09;
    pub const ADD_VELOCITY: u16 = 0x0a;
    pub const CHAT: u16 = 0x0b;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // Handshake
    ClientRequest {
        protocol_version: i64,
    },
    ServerInfo {
        offline: bool,
        public_key: [u8; 32],
    },
    BasicAuth {
        public_key: Vec<u8>,
    },
    PlayerInfo {
        uuid: Uuid,
        name: String,
    },
    Disconnect {
        reason: String,
    },
    Ping,

    // World
    Chunk {
        chunk: VirtualChunk,
    },
    ChunkUnload {
        pos: ChunkPos,
    },
    ChunkUpdate {
        chunk: ChunkPos,
        x: u8,
        y: u8,
        tile: TileType,
    },

    // Player
    PlayerPosition {
        x: f64,
        y: f64,
    },
    AddVelocity {
        x: f64,
        y: f64,
    },
    Chat {
        message: String,
        timestamp: f64,
    },
}

impl Packet {
    pub fn tag(&self) -> u16 {
        match self {
            Packet::ClientRequest { .. } => tag::CLIENT_REQUEST,
            Packet::ServerInfo { .. } => tag::SERVER_INFO,
            Packet::BasicAuth { .. } => tag::BASIC_AUTH,
            Packet::PlayerInfo { .. } => tag::PLAYER_INFO,
            Packet::Disconnect { .. } => tag::DISCONNECT,
            Packet::Ping => tag::PING,
            Packet::Chunk { .. } => tag::CHUNK,
            Packet::ChunkUnload { .. } => tag::CHUNK_UNLOAD,
            Packet::ChunkUpdate { .. } => tag::CHUNK_UPDATE,
            Packet::PlayerPosition { .. } => tag::PLAYER_POSITION,
            Packet::AddVelocity { .. } => tag::ADD_VELOCITY,
            Packet::Chat { .. } => tag::CHAT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::ClientRequest { .. } => "client-request",
            Packet::ServerInfo { .. } => "server-info",
            Packet::BasicAuth { .. } => "basic-auth",
            Packet::PlayerInfo { .. } => "player-info",
            Packet::Disconnect { .. } => "disconnect",
            Packet::Ping => "ping",
            Packet::Chunk { .. } => "chunk",
            Packet::ChunkUnload { .. } => "chunk-unload",
            Packet::ChunkUpdate { .. } => "chunk-update",
            Packet::PlayerPosition { .. } => "player-position",
            Packet::AddVelocity { .. } => "add-velocity",
            Packet::Chat { .. } => "chat",
        }
    }

    pub fn disconnect(reason: impl Into<String>) -> Packet {
        Packet::Disconnect {
            reason: reason.into(),
        }
    }
}
