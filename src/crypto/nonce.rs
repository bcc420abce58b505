use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;

/// Random bytes per license nonce.
pub const NONCE_BYTES: usize = 32;

/// Generates a fresh single-use license nonce, hex-encoded (64 characters).
pub fn generate() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compares a presented nonce with the stored one in constant time.
pub fn matches(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}
