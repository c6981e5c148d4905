use crate::nonce::NonceError;
use thiserror::Error;

/// Errors surfaced by descriptor expansion, key derivation, and the
/// two-round signing protocol.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// A wallet-policy template or key-information string is invalid:
    /// unknown placeholder, missing key index, unbalanced musig group,
    /// or a required wildcard that is absent.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// Extended-key parsing or BIP-32 path derivation failed.
    #[error("key derivation: {0}")]
    KeyDerivation(String),

    /// A protocol round was driven out of order (round 2 before every
    /// round-1 nonce is present, or aggregation before round 2). Always
    /// a caller bug, never worked around silently.
    #[error("protocol ordering: {0}")]
    ProtocolOrdering(String),

    /// A partial signature failed the single-signer verification
    /// equation. Carries enough identity to retry just this item.
    #[error("partial signature from participant {participant} failed for input {input_index}")]
    PartialSignature {
        /// Index of the affected transaction input.
        input_index: usize,
        /// Compressed public key of the offending participant, hex.
        participant: String,
    },

    /// A value was outside its valid scalar/point range, or a final
    /// aggregate signature failed verification.
    #[error("crypto verification failure: {0}")]
    CryptoVerification(String),

    /// The user rejected the operation, or its cancellation token
    /// fired. Aborts this cosigner's contribution; state already
    /// collected for other items is retained for a retry.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Nonce generation error (zero scalar after retries, bad point
    /// encoding). Zero scalars are retried internally and only escape
    /// if entropy is persistently broken.
    #[error("nonce error: {0}")]
    Nonce(#[from] NonceError),
}

pub type Result<T> = std::result::Result<T, Error>;
