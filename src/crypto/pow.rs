//! Chained proof of work
//!
//! Every 8-byte proof chunk commits to the message header plus all chunks
//! appended before it:
//!
//! ```text
//! hash_i = scrypt(password = header ++ chunk_0 ++ .. ++ chunk_{i-1}, salt = chunk_i)
//! work   = sum(work_value(hash_i))
//! ```
//!
//! A message can therefore be strengthened later by searching one more chunk
//! against the latest full buffer, but chunks cannot be computed
//! independently or reordered.

use crate::error::{CryptoError, GrapevineError, Result};
use crate::packet::{CHUNK_LEN, HEADER_LEN};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tokio::task;
use tokio_util::sync::CancellationToken;

/// Length of the scrypt output fed to [`work_value`]
pub const HASH_LEN: usize = 32;

/// Convert a hash into its work value.
///
/// Bits are scanned least-significant first, byte by byte. A hash whose
/// first scanned bit is set is worth nothing; otherwise a run of `k` zero
/// bits is worth `2^(k-1)`. An all-zero 256-bit hash is worth `2^255`.
pub fn work_value(hash: &[u8]) -> BigUint {
    let mut zeros = 0usize;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.trailing_zeros() as usize;
            break;
        }
    }

    if zeros == 0 {
        BigUint::default()
    } else {
        BigUint::from(1u8) << (zeros - 1)
    }
}

/// scrypt cost parameters used for every chunk hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWorkConfig {
    /// log2 of the CPU/memory cost `N`
    pub log_n: u8,
    /// Block size
    pub r: u32,
    /// Parallelization
    pub p: u32,
}

impl ProofOfWorkConfig {
    /// Cheap parameters for tests and local experiments.
    ///
    /// Work computed with these parameters is not accepted by nodes running
    /// the defaults.
    pub fn light() -> Self {
        Self {
            log_n: 4,
            r: 1,
            p: 1,
        }
    }
}

impl Default for ProofOfWorkConfig {
    fn default() -> Self {
        // N = 32768
        Self {
            log_n: 15,
            r: 8,
            p: 1,
        }
    }
}

/// Chained proof-of-work construction and verification
#[derive(Debug, Clone)]
pub struct ProofOfWork {
    config: ProofOfWorkConfig,
    cancel: CancellationToken,
}

impl ProofOfWork {
    /// Create a new Proof of Work instance with default configuration
    pub fn new() -> Self {
        Self::with_config(ProofOfWorkConfig::default())
    }

    /// Create a new Proof of Work instance with custom configuration
    pub fn with_config(config: ProofOfWorkConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort nonce searches once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &ProofOfWorkConfig {
        &self.config
    }

    fn params(&self) -> Result<scrypt::Params> {
        scrypt::Params::new(self.config.log_n, self.config.r, self.config.p, HASH_LEN).map_err(
            |e| {
                GrapevineError::Crypto(CryptoError::InvalidParams {
                    reason: e.to_string(),
                })
            },
        )
    }

    fn hash_with(params: &scrypt::Params, prefix: &[u8], chunk: &[u8]) -> Result<[u8; HASH_LEN]> {
        let mut output = [0u8; HASH_LEN];
        scrypt::scrypt(prefix, chunk, params, &mut output).map_err(|e| {
            GrapevineError::Crypto(CryptoError::InvalidParams {
                reason: e.to_string(),
            })
        })?;
        Ok(output)
    }

    /// Hash one chunk against everything that precedes it
    pub fn chunk_hash(&self, prefix: &[u8], chunk: &[u8]) -> Result<[u8; HASH_LEN]> {
        Self::hash_with(&self.params()?, prefix, chunk)
    }

    /// Search for the first nonce, counting up from zero, whose chunk hash
    /// against `buffer` is worth at least `min_work`.
    ///
    /// Blocks the calling thread; there is no upper bound on the search
    /// other than cancellation.
    pub fn solve_blocking(&self, buffer: &[u8], min_work: &BigUint) -> Result<[u8; CHUNK_LEN]> {
        let params = self.params()?;
        let mut nonce: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(CryptoError::ProofOfWorkCancelled.into());
            }

            let candidate = nonce.to_le_bytes();
            let hash = Self::hash_with(&params, buffer, &candidate)?;
            if work_value(&hash) >= *min_work {
                return Ok(candidate);
            }

            nonce = nonce
                .checked_add(1)
                .ok_or(CryptoError::ProofOfWorkFailed)?;
        }
    }

    /// Run [`Self::solve_blocking`] on the blocking thread pool
    pub async fn solve(&self, buffer: Vec<u8>, min_work: BigUint) -> Result<[u8; CHUNK_LEN]> {
        let pow = self.clone();
        task::spawn_blocking(move || pow.solve_blocking(&buffer, &min_work))
            .await
            .map_err(|e| GrapevineError::generic(format!("Proof of work task failed: {e}")))?
    }

    /// Append one more chunk worth at least `min_work` to `buffer`
    pub async fn extend(&self, buffer: Vec<u8>, min_work: BigUint) -> Result<Vec<u8>> {
        let nonce = self.solve(buffer.clone(), min_work).await?;
        let mut extended = buffer;
        extended.extend_from_slice(&nonce);
        Ok(extended)
    }

    /// Sum the work of every chunk in `proofs`, each hashed against the
    /// header plus the chunks before it.
    ///
    /// Stops with [`CryptoError::ProofOfWorkCancelled`] once cancelled, so a
    /// packet with thousands of chunks cannot hold up shutdown.
    pub fn accumulate(&self, header: &[u8], proofs: &[u8]) -> Result<BigUint> {
        if proofs.len() % CHUNK_LEN != 0 {
            return Err(CryptoError::MalformedProof {
                len: proofs.len(),
                chunk_len: CHUNK_LEN,
            }
            .into());
        }

        let params = self.params()?;
        let mut prefix = Vec::with_capacity(header.len() + proofs.len());
        prefix.extend_from_slice(header);

        let mut total = BigUint::default();
        for chunk in proofs.chunks_exact(CHUNK_LEN) {
            if self.cancel.is_cancelled() {
                return Err(CryptoError::ProofOfWorkCancelled.into());
            }
            let hash = Self::hash_with(&params, &prefix, chunk)?;
            total += work_value(&hash);
            prefix.extend_from_slice(chunk);
        }
        Ok(total)
    }

    /// Total work carried by a full packet (header followed by chunks)
    pub fn verify(&self, packet: &[u8]) -> Result<BigUint> {
        if packet.len() < HEADER_LEN {
            return Err(CryptoError::MalformedProof {
                len: packet.len(),
                chunk_len: CHUNK_LEN,
            }
            .into());
        }
        let (header, proofs) = packet.split_at(HEADER_LEN);
        self.accumulate(header, proofs)
    }
}

impl Default for ProofOfWork {
    fn default() -> Self {
        Self::new()
    }
}
