//! Salted secret hashing for account credentials and room passwords.
//!
//! Hashes are encoded as `a2id$m=<KiB>,t=<passes>,p=<lanes>$<salt hex>$<digest hex>`
//! so the cost and salt travel with the digest in a single text column.
//! Hashing is memory-hard and slow on purpose; async callers should run it
//! on the blocking pool.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::constants::{
    CREDENTIAL_ITERATIONS, CREDENTIAL_LANES, CREDENTIAL_MEMORY_KIB, CREDENTIAL_SALT_SIZE,
};
use crate::error::{ChatError, ChatResult};

const SCHEME: &str = "a2id";
const DIGEST_LEN: usize = 32;

/// Refuse stored costs above 1 GiB rather than allocate them.
const MAX_MEMORY_KIB: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cost {
    memory_kib: u32,
    iterations: u32,
    lanes: u32,
}

impl Cost {
    const CURRENT: Cost = Cost {
        memory_kib: CREDENTIAL_MEMORY_KIB,
        iterations: CREDENTIAL_ITERATIONS,
        lanes: CREDENTIAL_LANES,
    };

    fn encode(&self) -> String {
        format!("m={},t={},p={}", self.memory_kib, self.iterations, self.lanes)
    }

    fn decode(encoded: &str) -> Option<Self> {
        let mut cost = Cost {
            memory_kib: 0,
            iterations: 0,
            lanes: 0,
        };
        for field in encoded.split(',') {
            let (key, value) = field.split_once('=')?;
            let value: u32 = value.parse().ok()?;
            match key {
                "m" => cost.memory_kib = value,
                "t" => cost.iterations = value,
                "p" => cost.lanes = value,
                _ => return None,
            }
        }
        let sane = cost.iterations > 0 && cost.lanes > 0 && cost.memory_kib <= MAX_MEMORY_KIB;
        sane.then_some(cost)
    }
}

pub fn generate_salt() -> [u8; CREDENTIAL_SALT_SIZE] {
    let mut salt = [0u8; CREDENTIAL_SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// Argon2id over a salt bound to `context` with BLAKE3, so one secret used
// for two purposes never yields the same digest.
fn derive(context: &str, cost: Cost, salt: &[u8], secret: &[u8]) -> ChatResult<[u8; DIGEST_LEN]> {
    let bound_salt = blake3::derive_key(context, salt);
    let params = Params::new(cost.memory_kib, cost.iterations, cost.lanes, Some(DIGEST_LEN))
        .map_err(|e| ChatError::Internal(format!("argon2 parameters: {e}")))?;

    let mut digest = [0u8; DIGEST_LEN];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(secret, &bound_salt, &mut digest)
        .map_err(|e| ChatError::Internal(format!("argon2: {e}")))?;
    Ok(digest)
}

/// Hash `secret` under a fresh random salt.
pub fn hash_secret(context: &str, secret: &str) -> ChatResult<String> {
    let salt = generate_salt();
    let cost = Cost::CURRENT;
    let digest = derive(context, cost, &salt, secret.as_bytes())?;
    Ok(format!(
        "{SCHEME}${}${}${}",
        cost.encode(),
        hex::encode(salt),
        hex::encode(digest)
    ))
}

/// Constant-time check of `secret` against an encoded hash. Malformed
/// hashes and unknown schemes never verify.
pub fn verify_secret(context: &str, secret: &str, encoded: &str) -> bool {
    let mut parts = encoded.split('$');
    let (Some(SCHEME), Some(cost), Some(salt_hex), Some(digest_hex), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    let Some(cost) = Cost::decode(cost) else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };

    match derive(context, cost, &salt, secret.as_bytes()) {
        Ok(actual) => expected.len() == actual.len() && actual.ct_eq(&expected).unwrap_u8() == 1,
        Err(_) => false,
    }
}
