//! Types and logic shared by the front, quorum, and store services:
//! the datagram envelope, the reliable-delivery channel layered on it,
//! the coordination request/response protocol, the world model, and the
//! cluster configuration.

pub mod channel;
pub mod config;
pub mod coord;
pub mod protocol;
pub mod world;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds, used for keepalive timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
