//! Cryptographic primitives: room hashing and chained proof of work

pub mod hash;
pub mod pow;

// Re-export commonly used types
pub use hash::{room_id, sha1};
pub use pow::{work_value, ProofOfWork, ProofOfWorkConfig, HASH_LEN};
