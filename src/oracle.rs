//! Decryption Oracle (§4.6) — the only component permitted to construct or
//! hold a [`PrivateKey`](crate::paillier::PrivateKey).
//!
//! [`OracleClient`] is the trait boundary Query Orchestration depends on, so
//! the query server can be wired to either a [`RemoteOracleClient`] (the
//! split-trust deployment, talking HTTP to the `decryption_oracle` binary
//! the way the teacher's `tinyzkp_api` calls out to its own dependent
//! services) or a [`LocalOracle`] (a single-trust deployment, or the
//! decryption oracle binary's own handlers calling straight into the same
//! logic they'd otherwise expose over HTTP).
//!
//! The per-request state machine in §4.6 (`received → validated → computed
//! → decrypted → responded`) is realized here as [`RequestState`]; handlers
//! thread a value of this type through each stage and every error path
//! returns before reaching `Responded`, so no intermediate plaintext is ever
//! attached to an error.

use async_trait::async_trait;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::paillier::{self, EncryptedNumber, PrivateKey, PublicKey};

/// Tracks where a single oracle request is in its lifecycle (§4.6). Only
/// used for structured logging; it carries no data that would leak
/// intermediate plaintext if logged at an error site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validated,
    Computed,
    Decrypted,
    Responded,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::Validated => "validated",
            RequestState::Computed => "computed",
            RequestState::Decrypted => "decrypted",
            RequestState::Responded => "responded",
        }
    }
}

/// A homomorphic operation requested of `compose_then_decrypt` (§4.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ComposeOperation {
    Add {
        operands: Vec<EncryptedNumber>,
    },
    MulScalar {
        operands: Vec<EncryptedNumber>,
        scalar: i64,
    },
}

/// Oracle behavior independent of transport: used directly by a single-trust
/// query server, or mounted behind HTTP handlers in the `decryption_oracle`
/// binary.
#[async_trait]
pub trait OracleClient: Send + Sync {
    async fn decrypt_many(
        &self,
        ciphertexts: &[EncryptedNumber],
        scaling_factor: u64,
    ) -> Result<Vec<i128>, CoreError>;

    async fn decrypt_sum(
        &self,
        ciphertext: &EncryptedNumber,
        scaling_factor: u64,
    ) -> Result<i128, CoreError>;

    async fn compose_then_decrypt(
        &self,
        public_key: &PublicKey,
        operation: ComposeOperation,
        scaling_factor: u64,
    ) -> Result<i128, CoreError>;
}

/// Holds the private key directly (§9: "the only component permitted to
/// hold the private key"). Constructing one of these outside the
/// `decryption_oracle` binary — or a deliberately single-trust deployment —
/// defeats the split-trust design; nothing in this module prevents misuse
/// beyond that being the caller's responsibility, as §9 frames it.
pub struct LocalOracle {
    private_key: PrivateKey,
}

impl LocalOracle {
    pub fn new(private_key: PrivateKey) -> Self {
        Self { private_key }
    }
}

#[async_trait]
impl OracleClient for LocalOracle {
    async fn decrypt_many(
        &self,
        ciphertexts: &[EncryptedNumber],
        scaling_factor: u64,
    ) -> Result<Vec<i128>, CoreError> {
        if ciphertexts.is_empty() {
            return Err(CoreError::InvalidInput(
                "decrypt_many requires a non-empty list".into(),
            ));
        }
        let mut out = Vec::with_capacity(ciphertexts.len());
        for (i, c) in ciphertexts.iter().enumerate() {
            let value = paillier::safe_decrypt(&self.private_key, c, scaling_factor).map_err(|e| {
                CoreError::CryptoFailure(format!("decrypt_many: ciphertext at position {i}: {e}"))
            })?;
            out.push(value);
        }
        Ok(out)
    }

    async fn decrypt_sum(
        &self,
        ciphertext: &EncryptedNumber,
        scaling_factor: u64,
    ) -> Result<i128, CoreError> {
        paillier::safe_decrypt(&self.private_key, ciphertext, scaling_factor)
    }

    async fn compose_then_decrypt(
        &self,
        public_key: &PublicKey,
        operation: ComposeOperation,
        scaling_factor: u64,
    ) -> Result<i128, CoreError> {
        let composed = match operation {
            ComposeOperation::Add { operands } => paillier::homomorphic_add(public_key, &operands)?,
            ComposeOperation::MulScalar { operands, scalar } => {
                if operands.len() != 1 {
                    return Err(CoreError::InvalidInput(
                        "mul_scalar requires exactly one operand".into(),
                    ));
                }
                paillier::homomorphic_scalar_mul(public_key, &operands[0], &BigInt::from(scalar))?
            }
        };
        paillier::safe_decrypt(&self.private_key, &composed, scaling_factor)
    }
}

/// Talks to a `decryption_oracle` process over HTTP (§6 HTTP surface),
/// grounded on the teacher's `reqwest`-based clients for its own dependent
/// services in `tinyzkp_api.rs`.
#[derive(Clone)]
pub struct RemoteOracleClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct DecryptManyRequest<'a> {
    ciphertexts: &'a [EncryptedNumber],
    scaling_factor: u64,
}

#[derive(Deserialize)]
struct DecryptManyResponse {
    decrypted: Vec<i128>,
}

#[derive(Serialize)]
struct DecryptSumRequest<'a> {
    encrypted_sum: &'a EncryptedNumber,
    scaling_factor: u64,
}

#[derive(Deserialize)]
struct DecryptSumResponse {
    decrypted_sum: i128,
}

#[derive(Serialize)]
struct ComposeRequest {
    #[serde(flatten)]
    operation: ComposeOperation,
    scaling_factor: u64,
}

#[derive(Deserialize)]
struct ComposeResponse {
    decrypted_result: i128,
}

impl RemoteOracleClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Build from `SECUREQUERY_ORACLE_URL`.
    pub fn from_env() -> Result<Self, CoreError> {
        let url = std::env::var("SECUREQUERY_ORACLE_URL")
            .map_err(|_| CoreError::StoreUnavailable("SECUREQUERY_ORACLE_URL not set".into()))?;
        Ok(Self::new(url))
    }

    async fn post<Req: Serialize, Res: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Res, CoreError> {
        let res = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::CryptoFailure(format!("oracle request to {path}: {e}")))?;
        if !res.status().is_success() {
            return Err(CoreError::CryptoFailure(format!(
                "oracle returned {} for {path}",
                res.status()
            )));
        }
        res.json::<Res>()
            .await
            .map_err(|e| CoreError::CryptoFailure(format!("oracle response from {path}: {e}")))
    }
}

#[async_trait]
impl OracleClient for RemoteOracleClient {
    async fn decrypt_many(
        &self,
        ciphertexts: &[EncryptedNumber],
        scaling_factor: u64,
    ) -> Result<Vec<i128>, CoreError> {
        let req = DecryptManyRequest {
            ciphertexts,
            scaling_factor,
        };
        let res: DecryptManyResponse = self.post("/decrypt", &req).await?;
        Ok(res.decrypted)
    }

    async fn decrypt_sum(
        &self,
        ciphertext: &EncryptedNumber,
        scaling_factor: u64,
    ) -> Result<i128, CoreError> {
        let req = DecryptSumRequest {
            encrypted_sum: ciphertext,
            scaling_factor,
        };
        let res: DecryptSumResponse = self.post("/decrypt_sum", &req).await?;
        Ok(res.decrypted_sum)
    }

    async fn compose_then_decrypt(
        &self,
        _public_key: &PublicKey,
        operation: ComposeOperation,
        scaling_factor: u64,
    ) -> Result<i128, CoreError> {
        let req = ComposeRequest {
            operation,
            scaling_factor,
        };
        let res: ComposeResponse = self.post("/homomorphic_operations", &req).await?;
        Ok(res.decrypted_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paillier::{encode_scaled, keygen};

    const TEST_BITS: usize = 256;
    const SCALE: u64 = 1000;

    #[tokio::test]
    async fn local_oracle_decrypt_many_rejects_empty() {
        let (_, private_key) = keygen(TEST_BITS).unwrap();
        let oracle = LocalOracle::new(private_key);
        let err = oracle.decrypt_many(&[], SCALE).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    /// Mirrors Scenario S2: homomorphic sum via compose_then_decrypt.
    #[tokio::test]
    async fn compose_then_decrypt_add_matches_plaintext_sum() {
        let (public_key, private_key) = keygen(TEST_BITS).unwrap();
        let oracle = LocalOracle::new(private_key);
        let values = [1000i128, 2000, 3000];
        let operands = values
            .iter()
            .map(|&v| public_key.encrypt(&encode_scaled(v, SCALE).unwrap()).unwrap())
            .collect();
        let result = oracle
            .compose_then_decrypt(&public_key, ComposeOperation::Add { operands }, SCALE)
            .await
            .unwrap();
        assert_eq!(result, 6000);
    }

    #[tokio::test]
    async fn compose_then_decrypt_mul_scalar_matches_plaintext_product() {
        let (public_key, private_key) = keygen(TEST_BITS).unwrap();
        let oracle = LocalOracle::new(private_key);
        let c = public_key.encrypt(&encode_scaled(1500, SCALE).unwrap()).unwrap();
        let result = oracle
            .compose_then_decrypt(
                &public_key,
                ComposeOperation::MulScalar {
                    operands: vec![c],
                    scalar: 4,
                },
                SCALE,
            )
            .await
            .unwrap();
        assert_eq!(result, 6000);
    }

    #[tokio::test]
    async fn compose_then_decrypt_mul_scalar_rejects_wrong_operand_count() {
        let (public_key, private_key) = keygen(TEST_BITS).unwrap();
        let oracle = LocalOracle::new(private_key);
        let c = public_key.encrypt(&encode_scaled(1500, SCALE).unwrap()).unwrap();
        let err = oracle
            .compose_then_decrypt(
                &public_key,
                ComposeOperation::MulScalar {
                    operands: vec![c.clone(), c],
                    scalar: 4,
                },
                SCALE,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
