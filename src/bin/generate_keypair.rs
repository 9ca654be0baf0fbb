//! generate_keypair: one-time ceremony producing the Paillier keypair
//! (§4.1 `keygen`) consumed by `query_server` (public key only) and
//! `decryption_oracle` (private key). Grounded on the teacher's
//! `generate_production_srs` ceremony binary: a single-party, in-memory
//! generation with no intermediate state written to disk before the keys
//! themselves are ready.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use securequery::paillier::{self, DEFAULT_KEY_BITS};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let bits: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_KEY_BITS);

    let public_key_path = std::env::var("SECUREQUERY_PUBLIC_KEY_PATH")
        .unwrap_or_else(|_| "public_key.json".into());
    let private_key_path = std::env::var("SECUREQUERY_PRIVATE_KEY_PATH")
        .unwrap_or_else(|_| "private_key.json".into());

    println!("securequery keypair generator");
    println!("  modulus length: {bits} bits");
    println!("  public key  -> {public_key_path}");
    println!("  private key -> {private_key_path}");
    println!();
    println!("the private key file must only ever be readable by the decryption_oracle process.");
    println!();

    println!("generating prime candidates (this can take a while at 1024+ bits)...");
    let (public_key, private_key) = paillier::keygen(bits)?;
    println!("keypair generated.");

    let public_bytes = serde_json::to_vec_pretty(&public_key)?;
    let private_bytes = serde_json::to_vec_pretty(&private_key)?;

    write_new_file(Path::new(&public_key_path), &public_bytes)?;
    write_new_file(Path::new(&private_key_path), &private_bytes)?;

    let public_digest = blake3::hash(&public_bytes);
    println!("wrote {} bytes to {public_key_path} (digest {})", public_bytes.len(), public_digest.to_hex());
    println!("wrote {} bytes to {private_key_path}", private_bytes.len());

    Ok(())
}

/// Refuse to silently overwrite an existing keypair; a ceremony should be
/// re-run deliberately, not accidentally clobbered by a stray invocation.
fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists; remove it first if you intend to regenerate", path.display()),
        ));
    }
    let mut file = File::create(path)?;
    file.write_all(bytes)
}
