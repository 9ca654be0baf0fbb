//! Shared error taxonomy for the Crypto/Index/Orchestration core.
//!
//! Every library-level operation returns `Result<T, CoreError>`. The two
//! binaries (`query_server`, `decryption_oracle`) translate `CoreError` into
//! their own `ApiError` at the HTTP boundary (see each bin's `error` module),
//! which is where status codes and the `{"error": message}` envelope live.
//! Keeping the mapping at the boundary means the library itself never needs
//! to know about HTTP.

/// Error kinds shared across Crypto Core, Index Core, and the token
/// authority. Mirrors the error taxonomy in the design: `Unauthorized`,
/// `InvalidInput`, `NotFound`, `StoreUnavailable`, `CryptoFailure`,
/// `PersistenceFailure`, `Fatal`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Missing, invalid, or expired token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Missing fields, wrong types, empty operand lists.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Bloom miss or empty result set.
    #[error("not found: {0}")]
    NotFound(String),

    /// Token store unreachable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Ciphertext parse failure, decryption failure, mismatched key material.
    /// The message must never carry plaintext, ciphertext internals beyond
    /// the opaque integer, or key material.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// Bloom file corrupted; caller should reinitialize and re-persist.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Unrecoverable boot-time failure (e.g. keygen). Process should abort.
    #[error("fatal: {0}")]
    Fatal(String),
}
