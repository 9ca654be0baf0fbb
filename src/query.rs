//! Query Orchestration (§4.5) — composes Index Core lookups with Crypto
//! Core homomorphic operations and delegates decryption to the
//! [`OracleClient`](crate::oracle::OracleClient).
//!
//! This is the module the `query_server` binary's HTTP handlers call
//! straight into; it holds no transport-specific state of its own, the way
//! the teacher's `api.rs` keeps its orchestration logic separate from the
//! Axum routing in `tinyzkp_api.rs`.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::bloom::MultiLevelBloomFilter;
use crate::dataset::{Dataset, ProjectedRow, Row};
use crate::error::CoreError;
use crate::oracle::OracleClient;
use crate::paillier::{self, EncryptedNumber, PublicKey};

/// The only encrypted column this dataset carries (§3: "the ciphertext
/// column"). Range queries and the bloom endpoint pre-check are scoped to
/// it by name.
pub const ENCRYPTED_FIELD: &str = "billing_amount";

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Input for the supplemented `add_data` endpoint (§13).
#[derive(Debug, Deserialize)]
pub struct NewRow {
    pub name: String,
    pub age: Option<u32>,
    pub gender: String,
    pub blood_type: String,
    pub medical_condition: String,
    pub insurance_provider: String,
    pub doctor: String,
    pub hospital: String,
    pub billing_amount: f64,
    pub latitude: f64,
    pub longitude: f64,
}

/// A point with a computed distance, carrying its original dataset index so
/// ties break by first-in-dataset order (Scenario S4).
struct Ranked {
    index: usize,
    distance_sq: f64,
    row: ProjectedRow,
}

/// Everything a query needs: the shared Bloom index, the dataset, the
/// oracle client, and the Paillier public key / scaling factor the dataset
/// was encrypted under.
pub struct QueryOrchestrator {
    bloom: RwLock<MultiLevelBloomFilter>,
    bloom_path: Option<PathBuf>,
    dataset: Dataset,
    oracle: Arc<dyn OracleClient>,
    public_key: PublicKey,
    scaling_factor: u64,
}

/// Index every field/value pair of `row` into `bloom`, including the
/// encrypted column's plaintext value (at load time only — this is why the
/// range-query endpoint index entries below exist for the Bloom pre-check
/// described in §4.5, even though the column itself is stored encrypted).
fn index_row(bloom: &mut MultiLevelBloomFilter, row: &Row) {
    for field in [
        "name",
        "gender",
        "blood_type",
        "medical_condition",
        "insurance_provider",
        "doctor",
        "hospital",
    ] {
        if let Some(value) = row.field(field) {
            bloom.add(field, &normalize(&value));
        }
    }
    bloom.add(ENCRYPTED_FIELD, &billing_amount_key(row.billing_amount));
}

fn billing_amount_key(amount: f64) -> String {
    format!("{amount:.2}")
}

impl QueryOrchestrator {
    pub fn new(
        bloom: MultiLevelBloomFilter,
        bloom_path: Option<PathBuf>,
        dataset: Dataset,
        oracle: Arc<dyn OracleClient>,
        public_key: PublicKey,
        scaling_factor: u64,
    ) -> Self {
        Self {
            bloom: RwLock::new(bloom),
            bloom_path,
            dataset,
            oracle,
            public_key,
            scaling_factor,
        }
    }

    /// Build an orchestrator from a freshly loaded dataset, indexing every
    /// row's fields into a new Bloom filter and encrypting the billing
    /// column under `public_key` (load-time ceremony; §3 Ownership — the
    /// dataset is read-only after this point except via `add_data`).
    ///
    /// `bloom_params` supplies `(levels, dimensions, num_hashes)` used only
    /// when `bloom_path` is absent or its file is missing/corrupt (§12
    /// `SECUREQUERY_BLOOM_DIMS`/`_HASHES`/`_LEVELS`); an already-persisted
    /// filter keeps its own parameters.
    pub fn bootstrap(
        mut rows: Vec<Row>,
        bloom_path: Option<PathBuf>,
        bloom_params: (usize, (usize, usize, usize), usize),
        dataset_append_path: Option<PathBuf>,
        oracle: Arc<dyn OracleClient>,
        public_key: PublicKey,
        scaling_factor: u64,
    ) -> Result<Self, CoreError> {
        let (levels, dimensions, num_hashes) = bloom_params;
        let mut bloom = match &bloom_path {
            Some(path) => MultiLevelBloomFilter::load_or_reinit_with_params(path, levels, dimensions, num_hashes),
            None => MultiLevelBloomFilter::new(levels, dimensions, num_hashes)?,
        };

        for row in &mut rows {
            let encoded = paillier::encode_scaled(row.billing_amount.round() as i128, scaling_factor)?;
            row.billing_amount_encrypted = Some(public_key.encrypt(&encoded)?);
            index_row(&mut bloom, row);
        }
        if let Some(path) = &bloom_path {
            bloom.save(path)?;
        }

        let dataset = Dataset::new(rows, dataset_append_path);
        Ok(Self::new(
            bloom,
            bloom_path,
            dataset,
            oracle,
            public_key,
            scaling_factor,
        ))
    }

    /// Exact match (§4.5): Bloom pre-check, then a linear scan comparing
    /// normalized field values.
    pub fn exact_match(&self, field: &str, value: &str) -> Result<Vec<ProjectedRow>, CoreError> {
        let normalized = normalize(value);
        let present = self
            .bloom
            .read()
            .map_err(|_| CoreError::StoreUnavailable("bloom filter lock poisoned".into()))?
            .lookup(field, &normalized);
        if !present {
            return Err(CoreError::NotFound(format!(
                "no entries for {field}={value}"
            )));
        }
        let rows = self.dataset.snapshot()?;
        Ok(rows
            .iter()
            .filter(|row| row.field(field).map(|v| normalize(&v)) == Some(normalized.clone()))
            .map(Row::projected)
            .collect())
    }

    /// Range query (§4.5): Bloom pre-check on the endpoints (preserved
    /// heuristic, §9), then decrypt the entire encrypted column via the
    /// oracle and mask by `[min, max]`.
    pub async fn range_query(
        &self,
        field: &str,
        min_value: f64,
        max_value: f64,
    ) -> Result<Vec<ProjectedRow>, CoreError> {
        if field != ENCRYPTED_FIELD {
            return Err(CoreError::InvalidInput(format!(
                "range queries are only supported on {ENCRYPTED_FIELD}"
            )));
        }
        let min_present = self
            .bloom
            .read()
            .map_err(|_| CoreError::StoreUnavailable("bloom filter lock poisoned".into()))?
            .lookup(field, &billing_amount_key(min_value));
        let max_present = self
            .bloom
            .read()
            .map_err(|_| CoreError::StoreUnavailable("bloom filter lock poisoned".into()))?
            .lookup(field, &billing_amount_key(max_value));
        if !min_present && !max_present {
            return Err(CoreError::NotFound(
                "neither range endpoint appears in the index".into(),
            ));
        }

        let rows = self.dataset.snapshot()?;
        let ciphertexts: Vec<EncryptedNumber> = rows
            .iter()
            .map(|row| {
                row.billing_amount_encrypted.clone().ok_or_else(|| {
                    CoreError::CryptoFailure("row is missing its encrypted billing amount".into())
                })
            })
            .collect::<Result<_, _>>()?;
        let decrypted = self
            .oracle
            .decrypt_many(&ciphertexts, self.scaling_factor)
            .await?;

        Ok(rows
            .iter()
            .zip(decrypted)
            .filter(|(_, value)| {
                let v = *value as f64;
                v >= min_value && v <= max_value
            })
            .map(|(row, _)| row.projected())
            .collect())
    }

    /// Nearest-neighbor (§4.5): squared Euclidean distance to `(lat, lon)`,
    /// `k` smallest, ties by first-in-dataset order (Scenario S4).
    pub fn knn_query(&self, latitude: f64, longitude: f64, k: usize) -> Result<Vec<ProjectedRow>, CoreError> {
        if k == 0 {
            return Err(CoreError::InvalidInput("k must be >= 1".into()));
        }
        let rows = self.dataset.snapshot()?;
        let mut ranked: Vec<Ranked> = rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let dlat = row.latitude - latitude;
                let dlon = row.longitude - longitude;
                Ranked {
                    index,
                    distance_sq: dlat * dlat + dlon * dlon,
                    row: row.projected(),
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.distance_sq
                .partial_cmp(&b.distance_sq)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });
        Ok(ranked.into_iter().take(k).map(|r| r.row).collect())
    }

    /// Homomorphic sum (§4.5): fold the encrypted column, forward the
    /// reduced ciphertext to the oracle (Scenario S2).
    pub async fn homomorphic_sum(&self) -> Result<i128, CoreError> {
        let rows = self.dataset.snapshot()?;
        if rows.is_empty() {
            return Err(CoreError::NotFound("dataset is empty".into()));
        }
        let ciphertexts: Vec<EncryptedNumber> = rows
            .iter()
            .map(|row| {
                row.billing_amount_encrypted.clone().ok_or_else(|| {
                    CoreError::CryptoFailure("row is missing its encrypted billing amount".into())
                })
            })
            .collect::<Result<_, _>>()?;
        let summed = paillier::homomorphic_add(&self.public_key, &ciphertexts)?;
        self.oracle.decrypt_sum(&summed, self.scaling_factor).await
    }

    /// Supplemented feature (§13): append a new row, encrypting its billing
    /// amount and re-indexing it into the Bloom filter. Serializes with
    /// readers via the dataset's `RwLock` and the bloom filter's own lock,
    /// and re-persists the Bloom file atomically (§5 Concurrency).
    pub fn add_data(&self, input: NewRow) -> Result<(), CoreError> {
        let encoded = paillier::encode_scaled(input.billing_amount.round() as i128, self.scaling_factor)?;
        let encrypted = self.public_key.encrypt(&encoded)?;
        let row = Row {
            name: input.name,
            age: input.age,
            gender: input.gender,
            blood_type: input.blood_type,
            medical_condition: input.medical_condition,
            insurance_provider: input.insurance_provider,
            doctor: input.doctor,
            hospital: input.hospital,
            billing_amount: input.billing_amount,
            billing_amount_encrypted: Some(encrypted),
            latitude: input.latitude,
            longitude: input.longitude,
        };

        {
            let mut bloom = self
                .bloom
                .write()
                .map_err(|_| CoreError::StoreUnavailable("bloom filter lock poisoned".into()))?;
            index_row(&mut bloom, &row);
            if let Some(path) = &self.bloom_path {
                bloom.save(path)?;
            }
        }
        self.dataset.add_row(row)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// A uniform response envelope for the query endpoints (§6 HTTP surface:
/// `200 {results}`).
#[derive(Serialize)]
pub struct QueryResults {
    pub results: Vec<ProjectedRow>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::LocalOracle;
    use crate::paillier::keygen;

    const TEST_BITS: usize = 256;
    const SCALE: u64 = 1;

    fn sample_row(name: &str, condition: &str, amount: f64, lat: f64, lon: f64) -> Row {
        Row {
            name: name.to_string(),
            age: Some(30),
            gender: "female".into(),
            blood_type: "O+".into(),
            medical_condition: condition.to_string(),
            insurance_provider: "acme".into(),
            doctor: "dr who".into(),
            hospital: "general".into(),
            billing_amount: amount,
            billing_amount_encrypted: None,
            latitude: lat,
            longitude: lon,
        }
    }

    fn orchestrator(rows: Vec<Row>) -> (QueryOrchestrator, PublicKey) {
        let (public_key, private_key) = keygen(TEST_BITS).unwrap();
        let oracle: Arc<dyn OracleClient> = Arc::new(LocalOracle::new(private_key));
        let orch = QueryOrchestrator::bootstrap(
            rows,
            None,
            (
                crate::bloom::DEFAULT_LEVELS,
                crate::bloom::DEFAULT_DIMENSIONS,
                crate::bloom::DEFAULT_NUM_HASHES,
            ),
            None,
            oracle,
            public_key.clone(),
            SCALE,
        )
        .unwrap();
        (orch, public_key)
    }

    /// Scenario S1.
    #[test]
    fn exact_match_returns_matching_rows_and_404s_on_unknown() {
        let rows = vec![
            sample_row("John Doe", "diabetes", 1000.0, 0.0, 0.0),
            sample_row("Jane Roe", "flu", 500.0, 1.0, 1.0),
        ];
        let (orch, _) = orchestrator(rows);

        let found = orch.exact_match("name", "john doe").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "John Doe");

        let err = orch.exact_match("name", "nobody here").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    /// Scenario S2: homomorphic sum over [1000, 2000, 3000].
    #[tokio::test]
    async fn homomorphic_sum_matches_plaintext_total() {
        let rows = vec![
            sample_row("a", "c", 1000.0, 0.0, 0.0),
            sample_row("b", "c", 2000.0, 0.0, 0.0),
            sample_row("c", "c", 3000.0, 0.0, 0.0),
        ];
        let (orch, _) = orchestrator(rows);
        let total = orch.homomorphic_sum().await.unwrap();
        assert_eq!(total, 6000);
    }

    /// Scenario S3.
    #[tokio::test]
    async fn range_query_returns_rows_within_bounds() {
        let rows = vec![
            sample_row("a", "c", 1000.0, 0.0, 0.0),
            sample_row("b", "c", 2000.0, 0.0, 0.0),
            sample_row("c", "c", 3000.0, 0.0, 0.0),
        ];
        let (orch, _) = orchestrator(rows);
        let results = orch
            .range_query(ENCRYPTED_FIELD, 1500.0, 2500.0)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "b");
    }

    #[tokio::test]
    async fn range_query_rejects_wrong_field() {
        let (orch, _) = orchestrator(vec![sample_row("a", "c", 1000.0, 0.0, 0.0)]);
        let err = orch.range_query("name", 0.0, 1.0).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    /// Scenario S4.
    #[test]
    fn knn_returns_k_closest_in_distance_order() {
        let rows = vec![
            sample_row("far", "c", 0.0, 10.0, 10.0),
            sample_row("near", "c", 0.0, 0.1, 0.1),
            sample_row("mid", "c", 0.0, 1.0, 1.0),
            sample_row("origin", "c", 0.0, 0.0, 0.0),
            sample_row("farther", "c", 0.0, 20.0, 20.0),
        ];
        let (orch, _) = orchestrator(rows);
        let results = orch.knn_query(0.0, 0.0, 3).unwrap();
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["origin", "near", "mid"]);
    }

    #[test]
    fn add_data_makes_row_visible_to_exact_match() {
        let (orch, _) = orchestrator(vec![sample_row("a", "flu", 500.0, 0.0, 0.0)]);
        orch.add_data(NewRow {
            name: "New Patient".into(),
            age: Some(22),
            gender: "male".into(),
            blood_type: "A+".into(),
            medical_condition: "asthma".into(),
            insurance_provider: "acme".into(),
            doctor: "dr who".into(),
            hospital: "general".into(),
            billing_amount: 750.0,
            latitude: 5.0,
            longitude: 5.0,
        })
        .unwrap();

        let found = orch.exact_match("medical_condition", "asthma").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "New Patient");
    }
}
