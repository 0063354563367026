//! Error types for the Grapevine node

use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for Grapevine operations
pub type Result<T> = std::result::Result<T, GrapevineError>;

/// Main error type for Grapevine operations
#[derive(Error, Debug)]
pub enum GrapevineError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Message store errors
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// Message codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A command was missing or had a malformed argument
    #[error("{0}")]
    Usage(String),

    /// The first token of a command line is not a known command
    #[error("unknown command {0}")]
    UnknownCommand(String),

    /// Discovery collaborator errors
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// NAT traversal collaborator errors
    #[error("NAT error: {0}")]
    Nat(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors with message
    #[error("{0}")]
    Generic(String),
}

/// Network-specific error types
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to bind the message socket
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Cryptographic error types
#[derive(Error, Debug)]
pub enum CryptoError {
    /// scrypt rejected the configured cost parameters
    #[error("Invalid scrypt parameters: {reason}")]
    InvalidParams { reason: String },

    /// Proof-of-work search exhausted the nonce space
    #[error("Proof of work search exhausted the nonce space")]
    ProofOfWorkFailed,

    /// Proof-of-work search was cancelled before a nonce was found
    #[error("Proof of work search cancelled")]
    ProofOfWorkCancelled,

    /// Proof region is not a whole number of chunks
    #[error("Proof region length {len} is not a multiple of {chunk_len}")]
    MalformedProof { len: usize, chunk_len: usize },
}

/// Message store error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// No live message carries this id
    #[error("message {id} not found")]
    MessageNotFound { id: u64 },
}

/// Message codec error types
#[derive(Error, Debug)]
pub enum CodecError {
    /// Text does not fit into the fixed-width header
    #[error("message is {len} characters long, at most {max} fit in a packet")]
    TextTooLong { len: usize, max: usize },

    /// Header buffer has the wrong size
    #[error("header must be {expected} bytes, got {actual}")]
    InvalidHeaderLength { expected: usize, actual: usize },
}

impl GrapevineError {
    /// Create a usage error
    pub fn usage<T: Into<String>>(msg: T) -> Self {
        GrapevineError::Usage(msg.into())
    }

    /// Create a discovery error
    pub fn discovery<T: Into<String>>(msg: T) -> Self {
        GrapevineError::Discovery(msg.into())
    }

    /// Create a NAT traversal error
    pub fn nat<T: Into<String>>(msg: T) -> Self {
        GrapevineError::Nat(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        GrapevineError::Config(msg.into())
    }

    /// Create a generic error
    pub fn generic<T: Into<String>>(msg: T) -> Self {
        GrapevineError::Generic(msg.into())
    }

    /// Whether this error was caused by user input rather than the node
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            GrapevineError::Usage(_)
                | GrapevineError::UnknownCommand(_)
                | GrapevineError::Storage(StorageError::MessageNotFound { .. })
                | GrapevineError::Codec(CodecError::TextTooLong { .. })
        )
    }
}
