//! Common type definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rendezvous identifier shared by every instance of the application.
///
/// Peers announce themselves under this value in the discovery overlay so
/// they can find each other without prior coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub [u8; 20]);

impl RoomId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
