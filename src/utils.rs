use std::time::{SystemTime, UNIX_EPOCH};

use crate::net::Packet;

/// Seconds since the Unix epoch, with sub-second precision.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

pub fn chat_packet(message: String) -> Packet {
    Packet::Chat {
        message,
        timestamp: unix_timestamp(),
    }
}
