//! Paillier Additively Homomorphic Cryptosystem
//!
//! A from-scratch (no external Paillier crate) implementation of the classic
//! Paillier scheme, specialized with the standard `g = n + 1` simplification
//! (the same shortcut the `phe` Python library this service was ported from
//! uses), which collapses encryption to `(1 + m·n) · r^n mod n²`.
//!
//! ## Security note
//!
//! Key generation and modular exponentiation here go through `num-bigint`'s
//! generic big-integer arithmetic, which is **not** constant-time. That is
//! acceptable for this service's threat model (split-trust against a query
//! server that never holds the private key, not a timing-adversary on the
//! same host as the oracle) but would need a constant-time backend before
//! use in an environment with a co-located timing adversary.
//!
//! ## Fixed-point scaling
//!
//! Plaintext `x` is encoded as `⌊x / S⌋` by the caller *before* calling
//! [`PublicKey::encrypt`] (§4.1: "the caller is expected to have applied
//! fixed-point scaling"). [`encode_scaled`] performs that division.
//! [`safe_decrypt`] multiplies back by `S` after modular-wraparound
//! correction.
//!
//! ## Exponent alignment
//!
//! `EncryptedNumber` carries an `exponent`, mirroring `python-paillier`'s
//! `EncodedNumber`: decreasing a ciphertext's exponent (making it finer) is a
//! homomorphic scalar multiplication by `EXPONENT_BASE^(old - new)` and needs
//! no knowledge of the plaintext; increasing it would require the plaintext
//! and is therefore not offered. [`homomorphic_add`] aligns every operand
//! down to the minimum exponent in the operand set before summing, per the
//! data model invariant.

use num_bigint::{BigInt, BigUint, RandBigInt, Sign};
use num_integer::Integer;
use num_traits::{One, Signed, ToPrimitive, Zero};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default Paillier modulus length in bits (§4.1).
pub const DEFAULT_KEY_BITS: usize = 1024;

/// Base used for exponent re-encoding, mirroring `python-paillier`.
const EXPONENT_BASE: u32 = 2;

/// Rounds of Miller-Rabin testing for prime candidates. 40 rounds gives a
/// false-positive probability of at most 4^-40, far below any realistic
/// concern for randomly generated candidates of this bit length.
const MILLER_RABIN_ROUNDS: usize = 40;

/// Paillier public key: modulus `n`, `n²`, and generator `g = n + 1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicKey {
    pub n: BigUint,
    pub n_sq: BigUint,
    pub g: BigUint,
}

/// Paillier private key. Must never leave the Decryption Oracle's process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrivateKey {
    pub n: BigUint,
    pub n_sq: BigUint,
    pub lambda: BigUint,
    pub mu: BigUint,
}

/// A ciphertext carrying its fixed-point exponent (§3: EncryptedNumber).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedNumber {
    pub ciphertext: BigUint,
    pub exponent: i64,
}

/// Generate a Paillier keypair of the given modulus length.
///
/// Failure here is fatal per §7: the process should abort rather than run
/// with a degraded or partially-generated key.
pub fn keygen(bits: usize) -> Result<(PublicKey, PrivateKey), CoreError> {
    if bits < 256 || bits % 2 != 0 {
        return Err(CoreError::Fatal(format!(
            "paillier keygen: bits must be even and >= 256 (got {bits})"
        )));
    }
    let half = bits / 2;
    let mut rng = rand::thread_rng();

    let (p, q) = loop {
        let p = random_prime(half, &mut rng);
        let q = random_prime(half, &mut rng);
        if p != q {
            break (p, q);
        }
    };

    let n = &p * &q;
    let n_sq = &n * &n;
    let g = &n + BigUint::one();

    let p_minus_1 = &p - BigUint::one();
    let q_minus_1 = &q - BigUint::one();
    let lambda = p_minus_1.lcm(&q_minus_1);

    // With g = n+1, L(g^lambda mod n^2) == lambda, so mu = lambda^-1 mod n.
    let mu = mod_inverse(&lambda, &n)
        .ok_or_else(|| CoreError::Fatal("paillier keygen: lambda has no inverse mod n".into()))?;

    Ok((
        PublicKey {
            n: n.clone(),
            n_sq: n_sq.clone(),
            g,
        },
        PrivateKey { n, n_sq, lambda, mu },
    ))
}

impl PublicKey {
    /// Encrypt a plaintext already reduced mod `n` at exponent 0.
    pub fn encrypt(&self, plaintext: &BigUint) -> Result<EncryptedNumber, CoreError> {
        self.encrypt_with_exponent(plaintext, 0)
    }

    /// Encrypt a plaintext at an explicit exponent (for pre-scaled callers).
    pub fn encrypt_with_exponent(
        &self,
        plaintext: &BigUint,
        exponent: i64,
    ) -> Result<EncryptedNumber, CoreError> {
        if plaintext >= &self.n {
            return Err(CoreError::InvalidInput(
                "plaintext must be < n; apply scaling before encrypting".into(),
            ));
        }
        let mut rng = rand::thread_rng();
        let r = loop {
            let candidate = rng.gen_biguint_range(&BigUint::one(), &self.n);
            if candidate.gcd(&self.n).is_one() {
                break candidate;
            }
        };
        // g = n+1, so g^m mod n^2 == 1 + m*n mod n^2 (binomial expansion truncates).
        let gm = (BigUint::one() + plaintext * &self.n) % &self.n_sq;
        let rn = r.modpow(&self.n, &self.n_sq);
        let ciphertext = (gm * rn) % &self.n_sq;
        Ok(EncryptedNumber {
            ciphertext,
            exponent,
        })
    }
}

impl PrivateKey {
    /// Decrypt to the raw plaintext in `[0, n)`, with no sign or scale
    /// correction applied (§4.1 `decrypt`).
    pub fn decrypt_raw(&self, c: &EncryptedNumber) -> Result<BigUint, CoreError> {
        if c.ciphertext >= self.n_sq {
            return Err(CoreError::CryptoFailure(
                "ciphertext out of range for this key".into(),
            ));
        }
        let x = c.ciphertext.modpow(&self.lambda, &self.n_sq);
        let l = l_function(&x, &self.n)?;
        Ok((l * &self.mu) % &self.n)
    }
}

fn l_function(x: &BigUint, n: &BigUint) -> Result<BigUint, CoreError> {
    if x < &BigUint::one() {
        return Err(CoreError::CryptoFailure(
            "L function evaluated outside its domain".into(),
        ));
    }
    Ok((x - BigUint::one()) / n)
}

/// Decrypt with modular-wraparound correction and inverse scaling (§4.1
/// `safe_decrypt`, Testable Properties 1 and 4).
///
/// `scaling_factor` is `S`; the raw plaintext is reinterpreted as signed
/// around `n/2`, clamped to `>= 0`, then multiplied by `S`.
pub fn safe_decrypt(
    private_key: &PrivateKey,
    c: &EncryptedNumber,
    scaling_factor: u64,
) -> Result<i128, CoreError> {
    let m = private_key.decrypt_raw(c)?;
    let half_n = &private_key.n / 2u32;

    // decrypt_raw always returns m in [0, n), so the "m < 0" branch the
    // original design describes can never fire here; it is folded into the
    // clamp below.
    let corrected: BigInt = if m > half_n {
        BigInt::from(m) - BigInt::from(private_key.n.clone())
    } else {
        BigInt::from(m)
    };
    let clamped = if corrected.is_negative() {
        BigInt::zero()
    } else {
        corrected
    };
    let scaled = clamped * BigInt::from(scaling_factor);
    scaled
        .to_i128()
        .ok_or_else(|| CoreError::CryptoFailure("decrypted value overflowed i128".into()))
}

/// Homomorphic addition (ciphertext multiplication mod `n²`).
///
/// Requires at least one operand. Operands are re-encoded down to the
/// minimum exponent present before summing (§3 invariant).
pub fn homomorphic_add(
    public_key: &PublicKey,
    operands: &[EncryptedNumber],
) -> Result<EncryptedNumber, CoreError> {
    if operands.is_empty() {
        return Err(CoreError::InvalidInput(
            "homomorphic_add requires at least one operand".into(),
        ));
    }
    let target_exponent = operands.iter().map(|c| c.exponent).min().unwrap();

    let mut acc = BigUint::one();
    for c in operands {
        if c.ciphertext >= public_key.n_sq {
            return Err(CoreError::CryptoFailure(
                "ciphertext out of range for this key".into(),
            ));
        }
        let aligned = decrease_exponent_to(public_key, c, target_exponent)?;
        acc = (acc * aligned.ciphertext) % &public_key.n_sq;
    }
    Ok(EncryptedNumber {
        ciphertext: acc,
        exponent: target_exponent,
    })
}

/// Re-encode `c` to `target_exponent`, which must be `<= c.exponent`.
fn decrease_exponent_to(
    public_key: &PublicKey,
    c: &EncryptedNumber,
    target_exponent: i64,
) -> Result<EncryptedNumber, CoreError> {
    if c.exponent == target_exponent {
        return Ok(c.clone());
    }
    if target_exponent > c.exponent {
        return Err(CoreError::InvalidInput(
            "cannot raise an EncryptedNumber's exponent without its plaintext".into(),
        ));
    }
    let diff = (c.exponent - target_exponent) as u32;
    let factor = BigInt::from(EXPONENT_BASE).pow(diff);
    let scaled = homomorphic_scalar_mul(public_key, c, &factor)?;
    Ok(EncryptedNumber {
        ciphertext: scaled.ciphertext,
        exponent: target_exponent,
    })
}

/// Homomorphic scalar multiplication (ciphertext exponentiation mod `n²`).
///
/// Accepts any integer scalar, including negative ones (encoded via modular
/// inverse of the positive-scalar ciphertext).
pub fn homomorphic_scalar_mul(
    public_key: &PublicKey,
    c: &EncryptedNumber,
    scalar: &BigInt,
) -> Result<EncryptedNumber, CoreError> {
    if c.ciphertext >= public_key.n_sq {
        return Err(CoreError::CryptoFailure(
            "ciphertext out of range for this key".into(),
        ));
    }
    if scalar.is_negative() {
        let positive = (-scalar)
            .to_biguint()
            .ok_or_else(|| CoreError::InvalidInput("scalar out of range".into()))?;
        let powered = c.ciphertext.modpow(&positive, &public_key.n_sq);
        let inverted = mod_inverse(&powered, &public_key.n_sq).ok_or_else(|| {
            CoreError::CryptoFailure("ciphertext not invertible mod n^2".into())
        })?;
        Ok(EncryptedNumber {
            ciphertext: inverted,
            exponent: c.exponent,
        })
    } else {
        let positive = scalar
            .to_biguint()
            .ok_or_else(|| CoreError::InvalidInput("scalar out of range".into()))?;
        let ciphertext = c.ciphertext.modpow(&positive, &public_key.n_sq);
        Ok(EncryptedNumber {
            ciphertext,
            exponent: c.exponent,
        })
    }
}

/// Homomorphic scalar multiplication by a rational `numerator/denominator`,
/// realized as multiplication by `numerator · denominator⁻¹ mod n` in the
/// Paillier message space.
pub fn homomorphic_scalar_mul_rational(
    public_key: &PublicKey,
    c: &EncryptedNumber,
    numerator: &BigInt,
    denominator: &BigInt,
) -> Result<EncryptedNumber, CoreError> {
    if denominator.is_zero() {
        return Err(CoreError::InvalidInput("denominator must be nonzero".into()));
    }
    let n_i = BigInt::from(public_key.n.clone());
    let denom_inv = mod_inverse_signed(denominator, &n_i)
        .ok_or_else(|| CoreError::InvalidInput("denominator not invertible mod n".into()))?;
    let effective = (numerator * denom_inv).mod_floor(&n_i);
    homomorphic_scalar_mul(public_key, c, &effective)
}

/// Encode a non-negative plaintext integer by the fixed-point scaling
/// factor `S` (§3 Scaling factor): `x ← ⌊x / S⌋`.
pub fn encode_scaled(x: i128, scaling_factor: u64) -> Result<BigUint, CoreError> {
    if x < 0 {
        return Err(CoreError::InvalidInput(
            "this dataset's encrypted column is non-negative".into(),
        ));
    }
    if scaling_factor == 0 {
        return Err(CoreError::InvalidInput("scaling factor must be >= 1".into()));
    }
    Ok(BigUint::from((x as u128) / (scaling_factor as u128)))
}

// ============================================================================
// Big-integer number theory helpers
// ============================================================================

fn random_prime(bits: usize, rng: &mut impl Rng) -> BigUint {
    loop {
        let mut candidate = rng.gen_biguint(bits as u64);
        candidate |= BigUint::one() << (bits - 1);
        candidate |= BigUint::one();
        if is_probably_prime(&candidate, MILLER_RABIN_ROUNDS) {
            return candidate;
        }
    }
}

fn is_probably_prime(n: &BigUint, rounds: usize) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    if *n == two {
        return true;
    }
    if (n % &two).is_zero() {
        return false;
    }

    let n_minus_one = n - BigUint::one();
    let mut d = n_minus_one.clone();
    let mut s: u32 = 0;
    while (&d % &two).is_zero() {
        d /= &two;
        s += 1;
    }

    let mut rng = rand::thread_rng();
    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &(n - &two));
        let mut x = a.modpow(&d, n);
        if x == BigUint::one() || x == n_minus_one {
            continue;
        }
        for _ in 0..s.saturating_sub(1) {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn extended_gcd(a: &BigInt, b: &BigInt) -> (BigInt, BigInt, BigInt) {
    if b.is_zero() {
        return (a.clone(), BigInt::one(), BigInt::zero());
    }
    let (g, x1, y1) = extended_gcd(b, &(a % b));
    let x = y1.clone();
    let y = x1 - (a / b) * y1;
    (g, x, y)
}

fn mod_inverse(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    mod_inverse_signed(&BigInt::from(a.clone()), &BigInt::from(modulus.clone()))
        .map(|v| v.to_biguint().expect("mod_inverse result is non-negative"))
}

fn mod_inverse_signed(a: &BigInt, modulus: &BigInt) -> Option<BigInt> {
    let (g, x, _) = extended_gcd(a, modulus);
    if g != BigInt::one() && g != BigInt::from(-1) {
        return None;
    }
    let result = (x.mod_floor(modulus) + modulus) % modulus;
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: usize = 256;
    const SCALE: u64 = 1000;

    fn test_keys() -> (PublicKey, PrivateKey) {
        keygen(TEST_BITS).expect("keygen")
    }

    /// Testable Property 1: crypto round-trip.
    #[test]
    fn round_trip_recovers_scaled_value() {
        let (public_key, private_key) = test_keys();
        for x in [0i128, 1000, 47_500, 999_999] {
            let encoded = encode_scaled(x, SCALE).unwrap();
            let c = public_key.encrypt(&encoded).unwrap();
            let recovered = safe_decrypt(&private_key, &c, SCALE).unwrap();
            assert_eq!(recovered as u128, (x as u128 / SCALE as u128) * SCALE as u128);
        }
    }

    /// Testable Property 2: homomorphic additivity.
    #[test]
    fn homomorphic_sum_matches_plaintext_sum() {
        let (public_key, private_key) = test_keys();
        let values = [1000i128, 2000, 3000];
        let ciphertexts: Vec<_> = values
            .iter()
            .map(|&v| public_key.encrypt(&encode_scaled(v, SCALE).unwrap()).unwrap())
            .collect();
        let summed = homomorphic_add(&public_key, &ciphertexts).unwrap();
        let decrypted = safe_decrypt(&private_key, &summed, SCALE).unwrap();
        assert_eq!(decrypted as i128, values.iter().sum::<i128>());
    }

    /// Testable Property 3: scalar multiplicativity.
    #[test]
    fn scalar_multiplication_matches_plaintext_product() {
        let (public_key, private_key) = test_keys();
        let x = 1500i128;
        let encoded = encode_scaled(x, SCALE).unwrap();
        let c = public_key.encrypt(&encoded).unwrap();
        let scaled = homomorphic_scalar_mul(&public_key, &c, &BigInt::from(4)).unwrap();
        let decrypted = safe_decrypt(&private_key, &scaled, SCALE).unwrap();
        assert_eq!(decrypted as i128, (x / SCALE as i128) * SCALE as i128 * 4);
    }

    /// Testable Property 4: wraparound correction clamps to >= 0.
    #[test]
    fn wraparound_correction_clamps_to_zero() {
        let (public_key, private_key) = test_keys();
        // Force a near-modulus ciphertext by multiplying encodings of n/2-ish values.
        let near_half = &public_key.n / 2u32 - BigUint::from(10u32);
        let c1 = public_key.encrypt(&near_half).unwrap();
        let c2 = public_key.encrypt(&BigUint::from(1000u32)).unwrap();
        let summed = homomorphic_add(&public_key, &[c1, c2]).unwrap();
        let decrypted = safe_decrypt(&private_key, &summed, 1).unwrap();
        assert_eq!(decrypted, 0);
    }

    #[test]
    fn homomorphic_add_rejects_empty_operands() {
        let (public_key, _) = test_keys();
        let err = homomorphic_add(&public_key, &[]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn encode_scaled_rejects_negative_input() {
        assert!(encode_scaled(-5, SCALE).is_err());
    }
}
