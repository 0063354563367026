//! Hash utilities

use crate::types::RoomId;
use sha1::{Digest, Sha1};

/// Compute SHA-1 hash
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive the rendezvous identifier for a room name
pub fn room_id(name: &str) -> RoomId {
    RoomId(sha1(name.as_bytes()))
}
