//! Dataset loading and storage — external collaborator (§1 Non-goals, §3
//! Dataset row, §6 Persisted state).
//!
//! The core treats the dataset as an injected, mostly-immutable table and
//! relies only on three projections (§3): field/value pairs for the Bloom
//! filter, plaintext coordinates for nearest-neighbor, and the encrypted
//! billing column. CSV loading itself is thin glue, grounded on the
//! teacher's `api::adapters::CsvRows` pattern of reading a CSV witness file
//! with the `csv` crate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::CoreError;
use crate::paillier::EncryptedNumber;

/// A single healthcare record. Public fields are the ones projected back to
/// clients by query endpoints (§4.5); `billing_amount_encrypted` is the
/// sensitive column, populated once at load time and never re-derived from
/// plaintext after that point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Row {
    pub name: String,
    pub age: Option<u32>,
    pub gender: String,
    pub blood_type: String,
    pub medical_condition: String,
    pub insurance_provider: String,
    pub doctor: String,
    pub hospital: String,
    pub billing_amount: f64,
    #[serde(skip)]
    pub billing_amount_encrypted: Option<EncryptedNumber>,
    pub latitude: f64,
    pub longitude: f64,
}

impl Row {
    /// Look up a field by name for exact-match / Bloom indexing purposes.
    /// Unknown fields project to `None` rather than panicking.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "name" => Some(self.name.clone()),
            "gender" => Some(self.gender.clone()),
            "blood_type" => Some(self.blood_type.clone()),
            "medical_condition" => Some(self.medical_condition.clone()),
            "insurance_provider" => Some(self.insurance_provider.clone()),
            "doctor" => Some(self.doctor.clone()),
            "hospital" => Some(self.hospital.clone()),
            _ => None,
        }
    }

    /// The public projection returned to clients (§4.5: selected fields).
    pub fn projected(&self) -> ProjectedRow {
        ProjectedRow {
            name: self.name.clone(),
            medical_condition: self.medical_condition.clone(),
            insurance_provider: self.insurance_provider.clone(),
            gender: self.gender.clone(),
        }
    }
}

/// The subset of fields returned by query endpoints.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProjectedRow {
    pub name: String,
    pub medical_condition: String,
    pub insurance_provider: String,
    pub gender: String,
}

/// A CSV record shape used only for deserialization; `billing_amount` is
/// read in the clear here and immediately re-encrypted by the caller — the
/// in-memory [`Row`] is the only place the plaintext amount is retained,
/// matching the original design's single load-then-encrypt pass.
#[derive(Debug, Deserialize)]
struct RawRow {
    name: String,
    age: Option<u32>,
    gender: String,
    blood_type: String,
    medical_condition: String,
    insurance_provider: String,
    doctor: String,
    hospital: String,
    billing_amount: f64,
    latitude: f64,
    longitude: f64,
}

/// Load rows from a CSV file at `path` (external collaborator, §1).
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Row>, CoreError> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| CoreError::InvalidInput(format!("open dataset {}: {e}", path.display())))?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<RawRow>() {
        let raw = record.map_err(|e| CoreError::InvalidInput(format!("parse dataset row: {e}")))?;
        rows.push(Row {
            name: raw.name,
            age: raw.age,
            gender: raw.gender,
            blood_type: raw.blood_type,
            medical_condition: raw.medical_condition,
            insurance_provider: raw.insurance_provider,
            doctor: raw.doctor,
            hospital: raw.hospital,
            billing_amount: raw.billing_amount,
            billing_amount_encrypted: None,
            latitude: raw.latitude,
            longitude: raw.longitude,
        });
    }
    Ok(rows)
}

/// Append one row's fields to a CSV file (§6 Persisted state: optional
/// dataset append log).
fn append_csv(path: &Path, row: &Row) -> Result<(), CoreError> {
    let file_exists = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::PersistenceFailure(format!("open dataset append log: {e}")))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);
    writer
        .serialize(RawRow {
            name: row.name.clone(),
            age: row.age,
            gender: row.gender.clone(),
            blood_type: row.blood_type.clone(),
            medical_condition: row.medical_condition.clone(),
            insurance_provider: row.insurance_provider.clone(),
            doctor: row.doctor.clone(),
            hospital: row.hospital.clone(),
            billing_amount: row.billing_amount,
            latitude: row.latitude,
            longitude: row.longitude,
        })
        .map_err(|e| CoreError::PersistenceFailure(format!("append dataset row: {e}")))?;
    writer
        .flush()
        .map_err(|e| CoreError::PersistenceFailure(format!("flush dataset append log: {e}")))?;
    Ok(())
}

/// The read-mostly dataset (§3 Ownership, §5 Concurrency): loaded once at
/// startup, safe for concurrent reads; any `add_data` mutation path
/// serializes with readers behind the `RwLock` and atomically appends to
/// the persisted CSV.
pub struct Dataset {
    rows: RwLock<Vec<Row>>,
    append_log_path: Option<PathBuf>,
}

impl Dataset {
    pub fn new(rows: Vec<Row>, append_log_path: Option<PathBuf>) -> Self {
        Self {
            rows: RwLock::new(rows),
            append_log_path,
        }
    }

    /// A consistent snapshot of the dataset for a single query (cheap clone
    /// of `Row`'s owned fields under a shared read lock).
    pub fn snapshot(&self) -> Result<Vec<Row>, CoreError> {
        Ok(self
            .rows
            .read()
            .map_err(|_| CoreError::StoreUnavailable("dataset lock poisoned".into()))?
            .clone())
    }

    /// Append a new row, serializing with any in-flight readers and
    /// atomically appending to the CSV log if configured.
    pub fn add_row(&self, row: Row) -> Result<(), CoreError> {
        if let Some(path) = &self.append_log_path {
            append_csv(path, &row)?;
        }
        let mut rows = self
            .rows
            .write()
            .map_err(|_| CoreError::StoreUnavailable("dataset lock poisoned".into()))?;
        rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(name: &str) -> Row {
        Row {
            name: name.to_string(),
            age: Some(40),
            gender: "female".into(),
            blood_type: "O+".into(),
            medical_condition: "diabetes".into(),
            insurance_provider: "acme".into(),
            doctor: "dr who".into(),
            hospital: "general".into(),
            billing_amount: 2500.0,
            billing_amount_encrypted: None,
            latitude: 40.0,
            longitude: -73.0,
        }
    }

    #[test]
    fn field_projects_known_fields_only() {
        let row = sample_row("John Doe");
        assert_eq!(row.field("name"), Some("John Doe".to_string()));
        assert_eq!(row.field("not_a_field"), None);
    }

    #[test]
    fn add_row_is_visible_in_next_snapshot() {
        let dataset = Dataset::new(vec![sample_row("a")], None);
        dataset.add_row(sample_row("b")).unwrap();
        let snapshot = dataset.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].name, "b");
    }

    #[test]
    fn appended_row_round_trips_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");

        let dataset = Dataset::new(vec![sample_row("a")], Some(path.clone()));
        dataset.add_row(sample_row("b")).unwrap();

        let reloaded = load_csv(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].name, "b");
        assert_eq!(reloaded[0].billing_amount, 2500.0);
    }
}
