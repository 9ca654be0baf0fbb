//! securequery: the cryptographic and indexing core behind a split-trust
//! query service over a healthcare dataset (Crypto Core, Index Core,
//! Credential & Query Orchestration). HTTP routing lives in the
//! `query_server` and `decryption_oracle` binaries; this library never
//! depends on Axum.
//!
//! ## Modules
//!
//! - [`error`] — the shared `CoreError` taxonomy.
//! - [`paillier`] — Paillier keygen, encrypt/decrypt, homomorphic ops.
//! - [`bloom`] — 3-D Bloom filter and its multi-level variant.
//! - [`kvs`] — the expiring key-value store abstraction behind tokens.
//! - [`tokens`] — the two-tier access/query token authority.
//! - [`dataset`] — dataset row model, CSV loading, and the read-mostly
//!   in-memory table.
//! - [`query`] — query orchestration composing Index Core and Crypto Core.
//! - [`oracle`] — the decryption oracle's operations and client trait.

#![forbid(unsafe_code)]

/// Shared error taxonomy for the core.
pub mod error;
/// Paillier additively-homomorphic cryptosystem.
pub mod paillier;
/// 3-D Bloom filter and multi-level Bloom filter.
pub mod bloom;
/// Expiring key-value store abstraction.
pub mod kvs;
/// Two-tier access/query token authority.
pub mod tokens;
/// Dataset row model and loading.
pub mod dataset;
/// Query orchestration: exact match, range, nearest-neighbor, homomorphic sum.
pub mod query;
/// Decryption oracle operations and client trait.
pub mod oracle;
