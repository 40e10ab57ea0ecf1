//! Key derivation: composite key + KDF parameters -> transformed key
//!
//! Derivation is deliberately slow (seconds for strong settings) and blocks the
//! calling thread. Callers on an async runtime should go through
//! [`Database::open_async`](crate::Database), which moves it onto a blocking
//! worker. Both variants poll a [`CancelToken`] so an unlock can be abandoned.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::header::{Argon2Variant, KdfParams};
use aes::Aes256;
use argon2::{Algorithm, Argon2, Params, Version};
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use zeroize::Zeroizing;

/// AES-KDF rounds between cancellation checks
const AES_ROUNDS_PER_CHECK: u64 = 4096;

const ARGON2_MIN_SALT_LEN: usize = 8;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bounds on KDF cost accepted from a database header.
///
/// A header is attacker-controlled input; without these a crafted file could ask
/// for terabytes of Argon2 memory or years of AES rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfLimits {
    /// Maximum Argon2 memory in bytes
    pub max_memory_bytes: u64,
    /// Maximum Argon2 iterations (time cost)
    pub max_iterations: u64,
    /// Maximum Argon2 lanes
    pub max_parallelism: u32,
    /// Maximum AES-KDF rounds
    pub max_aes_rounds: u64,
}

impl Default for KdfLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 1024 * 1024 * 1024,
            max_iterations: 100,
            max_parallelism: 64,
            max_aes_rounds: 1_000_000_000,
        }
    }
}

/// Check parameters against `limits` and the algorithm's own constraints
/// without allocating anything
pub fn validate(params: &KdfParams, limits: &KdfLimits) -> Result<()> {
    match params {
        KdfParams::Aes { rounds, seed } => {
            if seed.len() != 32 {
                return Err(Error::KdfParameterError(format!(
                    "AES-KDF seed must be 32 bytes, got {}",
                    seed.len()
                )));
            }
            if *rounds > limits.max_aes_rounds {
                return Err(Error::KdfParameterError(format!(
                    "AES-KDF rounds {} exceed limit {}",
                    rounds, limits.max_aes_rounds
                )));
            }
        }
        KdfParams::Argon2 {
            salt,
            memory_bytes,
            iterations,
            parallelism,
            version,
            ..
        } => {
            if *memory_bytes > limits.max_memory_bytes {
                return Err(Error::KdfParameterError(format!(
                    "Argon2 memory {} MiB exceeds limit {} MiB",
                    memory_bytes / (1024 * 1024),
                    limits.max_memory_bytes / (1024 * 1024)
                )));
            }
            if *iterations == 0 || *iterations > limits.max_iterations {
                return Err(Error::KdfParameterError(format!(
                    "Argon2 iterations {} outside 1..={}",
                    iterations, limits.max_iterations
                )));
            }
            if *parallelism == 0 || *parallelism > limits.max_parallelism {
                return Err(Error::KdfParameterError(format!(
                    "Argon2 parallelism {} outside 1..={}",
                    parallelism, limits.max_parallelism
                )));
            }
            if salt.len() < ARGON2_MIN_SALT_LEN {
                return Err(Error::KdfParameterError(format!(
                    "Argon2 salt must be at least {} bytes",
                    ARGON2_MIN_SALT_LEN
                )));
            }
            argon2_version(*version)?;
            argon2_params(*memory_bytes, *iterations, *parallelism)?;
        }
    }
    Ok(())
}

/// Derive the 32-byte transformed key from the composite key.
///
/// Fails with [`Error::KdfParameterError`] before doing any work if the
/// parameters are invalid or over `limits`, and with [`Error::Cancelled`] if
/// `cancel` fires before the derivation completes.
pub fn derive_key(
    composite_key: &[u8; 32],
    params: &KdfParams,
    limits: &KdfLimits,
    cancel: &CancelToken,
) -> Result<Zeroizing<[u8; 32]>> {
    validate(params, limits)?;

    let start = std::time::Instant::now();
    let key = match params {
        KdfParams::Aes { rounds, seed } => transform_aes(composite_key, seed, *rounds, cancel)?,
        KdfParams::Argon2 {
            variant,
            salt,
            memory_bytes,
            iterations,
            parallelism,
            version,
        } => {
            tracing::debug!(
                "Argon2 request: variant={:?}, memory={}KiB, iterations={}, parallelism={}, version={:#x}",
                variant,
                memory_bytes / 1024,
                iterations,
                parallelism,
                version
            );
            transform_argon2(
                composite_key,
                *variant,
                salt,
                argon2_params(*memory_bytes, *iterations, *parallelism)?,
                argon2_version(*version)?,
                cancel,
            )?
        }
    };
    tracing::debug!("Key derivation completed in {:?}", start.elapsed());

    Ok(key)
}

fn argon2_version(version: u32) -> Result<Version> {
    match version {
        0x10 => Ok(Version::V0x10),
        0x13 => Ok(Version::V0x13),
        other => Err(Error::KdfParameterError(format!(
            "Unknown Argon2 version {:#x}",
            other
        ))),
    }
}

fn argon2_params(memory_bytes: u64, iterations: u64, parallelism: u32) -> Result<Params> {
    let memory_kib = u32::try_from(memory_bytes / 1024)
        .map_err(|_| Error::KdfParameterError("Argon2 memory too large".into()))?;
    let iterations = u32::try_from(iterations)
        .map_err(|_| Error::KdfParameterError("Argon2 iterations too large".into()))?;

    Params::new(memory_kib, iterations, parallelism, Some(32))
        .map_err(|e| Error::KdfParameterError(format!("Invalid Argon2 parameters: {}", e)))
}

fn transform_aes(
    composite_key: &[u8; 32],
    seed: &[u8],
    rounds: u64,
    cancel: &CancelToken,
) -> Result<Zeroizing<[u8; 32]>> {
    let cipher = Aes256::new_from_slice(seed)
        .map_err(|_| Error::KdfParameterError("AES-KDF seed must be 32 bytes".into()))?;

    let mut key = Zeroizing::new(*composite_key);
    let mut remaining = rounds;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let batch = remaining.min(AES_ROUNDS_PER_CHECK);
        let (left, right) = key.split_at_mut(16);
        for _ in 0..batch {
            cipher.encrypt_block(GenericArray::from_mut_slice(left));
            cipher.encrypt_block(GenericArray::from_mut_slice(right));
        }
        remaining -= batch;
    }

    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&Sha256::digest(key.as_slice()));
    Ok(out)
}

fn transform_argon2(
    composite_key: &[u8; 32],
    variant: Argon2Variant,
    salt: &[u8],
    params: Params,
    version: Version,
    cancel: &CancelToken,
) -> Result<Zeroizing<[u8; 32]>> {
    let algorithm = match variant {
        Argon2Variant::Argon2d => Algorithm::Argon2d,
        Argon2Variant::Argon2id => Algorithm::Argon2id,
    };

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // The argon2 crate has no interruption hook, so the hash runs on a
    // detached worker and is abandoned on cancel.
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(composite_key);
    let salt = salt.to_vec();
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("argon2".into())
        .spawn(move || {
            let mut out = Zeroizing::new([0u8; 32]);
            let result = Argon2::new(algorithm, version, params)
                .hash_password_into(key.as_slice(), &salt, out.as_mut_slice())
                .map(|()| out);
            let _ = tx.send(result);
        })?;

    loop {
        match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(result) => {
                return result.map_err(|e| {
                    Error::KdfParameterError(format!("Argon2 computation failed: {}", e))
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    tracing::debug!("Abandoning Argon2 worker after cancellation");
                    return Err(Error::Cancelled);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::KdfParameterError(
                    "Argon2 worker exited without a result".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argon2(memory_bytes: u64, iterations: u64, parallelism: u32) -> KdfParams {
        KdfParams::Argon2 {
            variant: Argon2Variant::Argon2id,
            salt: vec![0x5A; 32],
            memory_bytes,
            iterations,
            parallelism,
            version: 0x13,
        }
    }

    #[test]
    fn test_aes_kdf_matches_blockwise_reference() {
        let composite = [0x42u8; 32];
        let seed = [0x17u8; 32];
        let rounds = 5000;

        let cipher = Aes256::new_from_slice(&seed).unwrap();
        let mut blocks = [
            *GenericArray::from_slice(&composite[..16]),
            *GenericArray::from_slice(&composite[16..]),
        ];
        for _ in 0..rounds {
            cipher.encrypt_blocks(&mut blocks);
        }
        let expected = Sha256::digest([blocks[0].as_slice(), blocks[1].as_slice()].concat());

        let params = KdfParams::Aes {
            rounds,
            seed: seed.to_vec(),
        };
        let key = derive_key(&composite, &params, &KdfLimits::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(key.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_aes_kdf_zero_rounds_is_plain_hash() {
        let composite = [9u8; 32];
        let params = KdfParams::Aes {
            rounds: 0,
            seed: vec![0; 32],
        };
        let key = derive_key(&composite, &params, &KdfLimits::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(key.as_slice(), Sha256::digest(composite).as_slice());
    }

    #[test]
    fn test_argon2_is_deterministic_and_variant_sensitive() {
        let composite = [1u8; 32];
        let params = argon2(64 * 1024, 1, 1);
        let limits = KdfLimits::default();
        let cancel = CancelToken::new();

        let a = derive_key(&composite, &params, &limits, &cancel).unwrap();
        let b = derive_key(&composite, &params, &limits, &cancel).unwrap();
        assert_eq!(*a, *b);

        let argon2d = KdfParams::Argon2 {
            variant: Argon2Variant::Argon2d,
            salt: vec![0x5A; 32],
            memory_bytes: 64 * 1024,
            iterations: 1,
            parallelism: 1,
            version: 0x13,
        };
        let c = derive_key(&composite, &argon2d, &limits, &cancel).unwrap();
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_memory_over_limit_fails_without_allocating() {
        // 1 TiB would abort the test process if it were ever allocated
        let params = argon2(1 << 40, 2, 1);
        let err = derive_key(&[0; 32], &params, &KdfLimits::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::KdfParameterError(_)));
    }

    #[test]
    fn test_limits_are_configurable() {
        let limits = KdfLimits {
            max_memory_bytes: 32 * 1024,
            ..KdfLimits::default()
        };
        assert!(validate(&argon2(64 * 1024, 1, 1), &limits).is_err());
        assert!(validate(&argon2(32 * 1024, 1, 1), &limits).is_ok());

        let limits = KdfLimits {
            max_aes_rounds: 10,
            ..KdfLimits::default()
        };
        let aes = KdfParams::Aes {
            rounds: 11,
            seed: vec![0; 32],
        };
        assert!(matches!(
            validate(&aes, &limits),
            Err(Error::KdfParameterError(_))
        ));
    }

    #[test]
    fn test_invalid_argon2_parameters() {
        let limits = KdfLimits::default();
        assert!(validate(&argon2(64 * 1024, 0, 1), &limits).is_err());
        assert!(validate(&argon2(64 * 1024, 1, 0), &limits).is_err());
        // below 8 KiB per lane
        assert!(validate(&argon2(8 * 1024, 1, 4), &limits).is_err());

        let bad_version = KdfParams::Argon2 {
            variant: Argon2Variant::Argon2d,
            salt: vec![0; 32],
            memory_bytes: 64 * 1024,
            iterations: 1,
            parallelism: 1,
            version: 0x11,
        };
        assert!(validate(&bad_version, &limits).is_err());

        let short_salt = KdfParams::Argon2 {
            variant: Argon2Variant::Argon2d,
            salt: vec![0; 4],
            memory_bytes: 64 * 1024,
            iterations: 1,
            parallelism: 1,
            version: 0x13,
        };
        assert!(validate(&short_salt, &limits).is_err());
    }

    #[test]
    fn test_bad_aes_seed() {
        let params = KdfParams::Aes {
            rounds: 1,
            seed: vec![0; 16],
        };
        assert!(matches!(
            validate(&params, &KdfLimits::default()),
            Err(Error::KdfParameterError(_))
        ));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let aes = KdfParams::Aes {
            rounds: 100_000,
            seed: vec![0; 32],
        };
        assert!(matches!(
            derive_key(&[0; 32], &aes, &KdfLimits::default(), &cancel),
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            derive_key(&[0; 32], &argon2(64 * 1024, 1, 1), &KdfLimits::default(), &cancel),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_cancel_interrupts_long_aes_kdf() {
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = std::thread::spawn(move || {
            let params = KdfParams::Aes {
                rounds: 1_000_000_000,
                seed: vec![0; 32],
            };
            derive_key(&[0; 32], &params, &KdfLimits::default(), &remote)
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancel_interrupts_long_argon2() {
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let started = std::time::Instant::now();
        let handle = std::thread::spawn(move || {
            derive_key(
                &[0; 32],
                &argon2(64 * 1024 * 1024, 100, 1),
                &KdfLimits::default(),
                &remote,
            )
        });

        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
