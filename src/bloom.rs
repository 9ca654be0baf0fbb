//! Index Core — 3-D Bloom Filter and Multi-Level Bloom Filter
//!
//! A probabilistic field/value membership index over a 3-D bit array
//! (§3, §4.2). Coordinates for an element are derived from a single SHA-224
//! digest per hash round, reduced modulo each axis — the same hash output
//! feeds all three axes, which is why the multi-level variant below buys no
//! independent false-positive reduction across levels (§9, preserved as
//! specified).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::fs;
use std::path::Path;

use crate::error::CoreError;

/// Default dimensions `(d1, d2, d3)` (§4.2).
pub const DEFAULT_DIMENSIONS: (usize, usize, usize) = (20, 20, 20);
/// Default hash-function count `k` (§4.2).
pub const DEFAULT_NUM_HASHES: usize = 14;
/// Default number of levels `L` in the multi-level filter (§4.3).
pub const DEFAULT_LEVELS: usize = 3;

/// Canonicalize a field/value pair into the string hashed by the Bloom
/// filter's hash family (§4.2 element encoding).
///
/// `value` is already expected to be a plain display-formatted string by
/// the time it reaches here (dataset values are scalars, not maps); the
/// sorted-key-map branch exists for parity with the data model's
/// description of `serialize` for structured elements.
pub fn serialize_element(field: &str, value: &str) -> String {
    format!("{field}:{value}").to_lowercase()
}

/// Canonicalize a sorted mapping the way `serialize` does for structured
/// elements (§4.2): sorted-by-key pairs in a stable textual form, lowercased.
pub fn serialize_mapping(pairs: &[(String, String)]) -> String {
    let mut sorted = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("({k}, {v})"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]").to_lowercase()
}

/// A 3-D Bloom filter over `(d1, d2, d3)` with `k` independent hash rounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomFilter {
    dimensions: (usize, usize, usize),
    num_hashes: usize,
    /// Flattened row-major bit array of length `d1*d2*d3`.
    bits: Vec<bool>,
}

impl BloomFilter {
    /// Construct an empty filter with the given dimensions and hash count.
    pub fn new(dimensions: (usize, usize, usize), num_hashes: usize) -> Result<Self, CoreError> {
        let (d1, d2, d3) = dimensions;
        if d1 == 0 || d2 == 0 || d3 == 0 || num_hashes == 0 {
            return Err(CoreError::InvalidInput(
                "bloom filter dimensions and hash count must be positive".into(),
            ));
        }
        Ok(Self {
            dimensions,
            num_hashes,
            bits: vec![false; d1 * d2 * d3],
        })
    }

    /// Construct with the default 20x20x20 / k=14 parameters (§4.2).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_DIMENSIONS, DEFAULT_NUM_HASHES).expect("default params are valid")
    }

    pub fn dimensions(&self) -> (usize, usize, usize) {
        self.dimensions
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    fn coordinates(&self, element: &str) -> Vec<(usize, usize, usize)> {
        use num_bigint::BigUint;
        use num_traits::ToPrimitive;

        let (d1, d2, d3) = self.dimensions;
        (0..self.num_hashes)
            .map(|i| {
                let mut hasher = Sha224::new();
                hasher.update([i as u8]);
                hasher.update(element.as_bytes());
                let digest = hasher.finalize();
                let value = BigUint::from_bytes_be(&digest);
                let x = (&value % BigUint::from(d1)).to_usize().unwrap_or(0);
                let y = (&value % BigUint::from(d2)).to_usize().unwrap_or(0);
                let z = (&value % BigUint::from(d3)).to_usize().unwrap_or(0);
                (x, y, z)
            })
            .collect()
    }

    fn index(&self, (x, y, z): (usize, usize, usize)) -> usize {
        let (_, d2, d3) = self.dimensions;
        (x * d2 + y) * d3 + z
    }

    /// Add a `field:value` element, setting all `k` coordinate triples.
    /// Never removes; false negatives never occur (Testable Property 5).
    pub fn add(&mut self, field: &str, value: &str) {
        let element = serialize_element(field, value);
        for coord in self.coordinates(&element) {
            let idx = self.index(coord);
            self.bits[idx] = true;
        }
    }

    /// True iff every one of the `k` coordinate triples is set.
    pub fn lookup(&self, field: &str, value: &str) -> bool {
        let element = serialize_element(field, value);
        self.coordinates(&element)
            .into_iter()
            .all(|coord| self.bits[self.index(coord)])
    }

    /// Persist `(dimensions, num_hashes, bit_array)` atomically: write to a
    /// temp file in the same directory, then rename over the target so a
    /// crash mid-write never leaves a half-written file in place.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec(self)
            .map_err(|e| CoreError::PersistenceFailure(format!("serialize bloom filter: {e}")))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &bytes)
            .map_err(|e| CoreError::PersistenceFailure(format!("write bloom filter: {e}")))?;
        fs::rename(&tmp_path, path)
            .map_err(|e| CoreError::PersistenceFailure(format!("rename bloom filter: {e}")))?;
        Ok(())
    }

    /// Load a persisted filter. A corrupt or missing file is recovered by
    /// re-initializing to an empty filter with the default parameters and
    /// re-persisting it (§4.2, §7 PersistenceFailure recovery, Scenario S5).
    pub fn load_or_reinit(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read(path).ok().and_then(|bytes| serde_json::from_slice::<Self>(&bytes).ok()) {
            Some(filter) => filter,
            None => {
                let filter = Self::with_defaults();
                let _ = filter.save(path);
                filter
            }
        }
    }
}

/// An ordered stack of `L` same-shaped [`BloomFilter`]s (§3, §4.3).
///
/// Level `i > 0` contains an element only if level `i-1` does. Because every
/// `add` populates level 0 and then every higher level unconditionally
/// (level `i-1` always reports membership right after it was just inserted
/// into), in this implementation every `add` ends up populating every
/// level — preserved exactly as specified rather than "fixed" to skip
/// redundant levels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiLevelBloomFilter {
    levels: Vec<BloomFilter>,
}

impl MultiLevelBloomFilter {
    pub fn new(
        levels: usize,
        dimensions: (usize, usize, usize),
        num_hashes: usize,
    ) -> Result<Self, CoreError> {
        if levels == 0 {
            return Err(CoreError::InvalidInput("levels must be >= 1".into()));
        }
        let filters = (0..levels)
            .map(|_| BloomFilter::new(dimensions, num_hashes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { levels: filters })
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_LEVELS, DEFAULT_DIMENSIONS, DEFAULT_NUM_HASHES)
            .expect("default params are valid")
    }

    /// Insert into level 0, then into each higher level in order (each
    /// insert makes the prior level's membership check for this element
    /// true, so every level is populated on every add).
    pub fn add(&mut self, field: &str, value: &str) {
        for level in &mut self.levels {
            level.add(field, value);
        }
    }

    /// True iff every level reports membership (Testable Property 7:
    /// `ml.lookup ⇒ filters[0].lookup`, monotonically through all levels).
    pub fn lookup(&self, field: &str, value: &str) -> bool {
        self.levels.iter().all(|level| level.lookup(field, value))
    }

    /// The base (level 0) filter, exposed for the monotonicity invariant.
    pub fn base_level(&self) -> &BloomFilter {
        &self.levels[0]
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec(self)
            .map_err(|e| CoreError::PersistenceFailure(format!("serialize bloom filter: {e}")))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &bytes)
            .map_err(|e| CoreError::PersistenceFailure(format!("write bloom filter: {e}")))?;
        fs::rename(&tmp_path, path)
            .map_err(|e| CoreError::PersistenceFailure(format!("rename bloom filter: {e}")))?;
        Ok(())
    }

    pub fn load_or_reinit(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read(path).ok().and_then(|bytes| serde_json::from_slice::<Self>(&bytes).ok()) {
            Some(filter) => filter,
            None => {
                let filter = Self::with_defaults();
                let _ = filter.save(path);
                filter
            }
        }
    }

    /// As [`load_or_reinit`](Self::load_or_reinit), but a missing or corrupt
    /// file is reinitialized with caller-supplied parameters instead of the
    /// compiled-in defaults (used when dimensions/levels/hash count are
    /// configured via environment, §12).
    pub fn load_or_reinit_with_params(
        path: impl AsRef<Path>,
        levels: usize,
        dimensions: (usize, usize, usize),
        num_hashes: usize,
    ) -> Self {
        let path = path.as_ref();
        match fs::read(path).ok().and_then(|bytes| serde_json::from_slice::<Self>(&bytes).ok()) {
            Some(filter) => filter,
            None => {
                let filter = Self::new(levels, dimensions, num_hashes)
                    .unwrap_or_else(|_| Self::with_defaults());
                let _ = filter.save(path);
                filter
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Testable Property 5: no false negatives.
    #[test]
    fn lookup_finds_everything_added() {
        let mut bloom = BloomFilter::new((20, 20, 20), 14).unwrap();
        let pairs = [("name", "john doe"), ("name", "jane roe"), ("gender", "female")];
        for (f, v) in pairs {
            bloom.add(f, v);
        }
        for (f, v) in pairs {
            assert!(bloom.lookup(f, v));
        }
        assert!(!bloom.lookup("name", "nobody here"));
    }

    /// Testable Property 6: determinism.
    #[test]
    fn identical_sequences_produce_identical_bits() {
        let mut a = BloomFilter::new((10, 10, 10), 8).unwrap();
        let mut b = BloomFilter::new((10, 10, 10), 8).unwrap();
        for (f, v) in [("name", "alice"), ("name", "bob"), ("condition", "flu")] {
            a.add(f, v);
            b.add(f, v);
        }
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    /// Testable Property 10: persistence round-trip.
    #[test]
    fn save_then_load_round_trips_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bloom.json");

        let mut bloom = BloomFilter::new((20, 20, 20), 14).unwrap();
        bloom.add("name", "carol");
        bloom.save(&path).unwrap();

        let loaded = BloomFilter::load_or_reinit(&path);
        assert_eq!(serde_json::to_string(&bloom).unwrap(), serde_json::to_string(&loaded).unwrap());
        assert!(loaded.lookup("name", "carol"));
    }

    /// Scenario S5: a corrupt file is recovered to an empty filter.
    #[test]
    fn corrupt_file_reinitializes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bloom.json");
        std::fs::write(&path, b"not valid json at all").unwrap();

        let loaded = BloomFilter::load_or_reinit(&path);
        assert!(!loaded.lookup("name", "anyone"));
    }

    /// Testable Property 7: multi-level monotonicity.
    #[test]
    fn multilevel_lookup_implies_base_level_lookup() {
        let mut ml = MultiLevelBloomFilter::new(3, (20, 20, 20), 14).unwrap();
        ml.add("name", "dave");
        assert!(ml.lookup("name", "dave"));
        assert!(ml.base_level().lookup("name", "dave"));

        // Every level is populated on add in this design (shared hash family).
        assert!(!ml.lookup("name", "nobody"));
    }
}
