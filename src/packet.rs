//! Wire packet shape and validation
//!
//! | Offset | Length | Field |
//! |--------|--------|-------|
//! | 0      | 1024   | header: 256 little-endian `u32` code points |
//! | 1024   | 8 × N  | proof chunks, each a little-endian `u64` nonce |

use crate::codec;
use crate::crypto::ProofOfWork;
use crate::error::{GrapevineError, Result};
use num_bigint::BigUint;
use tokio::task;

/// Size of the fixed-width text header
pub const HEADER_LEN: usize = 1024;

/// Size of one proof chunk
pub const CHUNK_LEN: usize = 8;

/// Header plus a single chunk
pub const MIN_PACKET_LEN: usize = HEADER_LEN + CHUNK_LEN;

/// Largest datagram read from the socket: 65535 minus UDP and IPv4 headers
pub const MAX_PACKET_SIZE: usize = (1 << 16) - 1 - 8 - 20;

/// Whether a datagram of `len` bytes is a header followed by whole chunks
pub fn has_valid_shape(len: usize) -> bool {
    len >= MIN_PACKET_LEN && (len - MIN_PACKET_LEN) % CHUNK_LEN == 0
}

/// A datagram that passed the shape check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    /// Wrap a datagram, or `None` if its shape is wrong
    pub fn from_datagram(bytes: Vec<u8>) -> Option<Self> {
        has_valid_shape(bytes.len()).then_some(Self { bytes })
    }

    pub fn header(&self) -> &[u8] {
        &self.bytes[..HEADER_LEN]
    }

    pub fn proofs(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    pub fn chunk_count(&self) -> usize {
        self.proofs().len() / CHUNK_LEN
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A packet that carried enough work to be stored
#[derive(Debug, Clone)]
pub struct ValidatedPacket {
    pub buffer: Vec<u8>,
    pub text: String,
    pub work: BigUint,
}

/// Checks inbound packets against the acceptance threshold
#[derive(Debug, Clone)]
pub struct PacketValidator {
    pow: ProofOfWork,
    min_work: BigUint,
}

impl PacketValidator {
    pub fn new(pow: ProofOfWork, min_work: BigUint) -> Self {
        Self { pow, min_work }
    }

    pub fn min_work(&self) -> &BigUint {
        &self.min_work
    }

    /// Accumulate the packet's chained work; `None` if it falls short
    pub fn validate_blocking(&self, packet: Packet) -> Result<Option<ValidatedPacket>> {
        let work = self.pow.accumulate(packet.header(), packet.proofs())?;
        if work < self.min_work {
            return Ok(None);
        }

        let text = codec::display_text(packet.header())?;
        Ok(Some(ValidatedPacket {
            buffer: packet.into_bytes(),
            text,
            work,
        }))
    }

    /// Run [`Self::validate_blocking`] on the blocking thread pool
    pub async fn validate(&self, packet: Packet) -> Result<Option<ValidatedPacket>> {
        let validator = self.clone();
        task::spawn_blocking(move || validator.validate_blocking(packet))
            .await
            .map_err(|e| GrapevineError::generic(format!("Packet validation task failed: {e}")))?
    }
}
