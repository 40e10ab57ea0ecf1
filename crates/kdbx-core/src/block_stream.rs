//! Block framing of the encrypted (4.x) and decrypted (3.x) payload

use crate::error::{Error, Result};
use crate::header::ByteReader;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Block index used for the header HMAC
pub(crate) const HEADER_BLOCK_INDEX: u64 = u64::MAX;

/// SHA-512(master seed || transformed key || 0x01)
pub(crate) fn hmac_base_key(master_seed: &[u8], transformed_key: &[u8; 32]) -> Zeroizing<Vec<u8>> {
    let mut hasher = Sha512::new();
    hasher.update(master_seed);
    hasher.update(transformed_key);
    hasher.update([0x01]);
    Zeroizing::new(hasher.finalize().to_vec())
}

fn block_key(block_index: u64, base_key: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut hasher = Sha512::new();
    hasher.update(block_index.to_le_bytes());
    hasher.update(base_key);
    Zeroizing::new(hasher.finalize().to_vec())
}

fn block_mac(block_index: u64, base_key: &[u8]) -> Result<HmacSha256> {
    let key = block_key(block_index, base_key);
    HmacSha256::new_from_slice(&key)
        .map_err(|_| Error::IntegrityError("HMAC initialization failed".into()))
}

/// Verify the header HMAC stored right after the header hash
pub(crate) fn verify_header_hmac(header: &[u8], expected: &[u8], base_key: &[u8]) -> Result<()> {
    let mut mac = block_mac(HEADER_BLOCK_INDEX, base_key)?;
    mac.update(header);
    mac.verify_slice(expected).map_err(|_| {
        Error::IntegrityError("Header HMAC mismatch (wrong key or corrupted file)".into())
    })
}

/// Read a 4.x HMAC block stream, verifying every block in order.
///
/// Layout per block: `hmac: [u8; 32], size: u32, data: [u8; size]`. The MAC
/// covers `index_le_u64 || size_le_u32 || data`. The zero-length terminator is
/// authenticated like any other block, so a stream cut at a block boundary is
/// detected.
pub(crate) fn read_hmac_block_stream(data: &[u8], base_key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut reader = ByteReader::new(data);
    let mut result = Zeroizing::new(Vec::new());
    let mut block_index: u64 = 0;

    loop {
        let stored_hmac = reader.take(32, "HMAC block")?;
        let block_size = reader.read_u32("HMAC block size")?;
        let block_data = reader.take(block_size as usize, "HMAC block data")?;

        let mut mac = block_mac(block_index, base_key)?;
        mac.update(&block_index.to_le_bytes());
        mac.update(&block_size.to_le_bytes());
        mac.update(block_data);
        mac.verify_slice(stored_hmac).map_err(|_| {
            Error::IntegrityError(format!("HMAC mismatch in block {}", block_index))
        })?;

        if block_size == 0 {
            break;
        }
        result.extend_from_slice(block_data);
        block_index += 1;
    }

    if reader.remaining() > 0 {
        tracing::debug!("Ignoring {} bytes after HMAC block stream", reader.remaining());
    }
    tracing::debug!("Verified {} HMAC blocks ({} bytes)", block_index, result.len());
    Ok(result)
}

/// Read a 3.x hashed block stream.
///
/// Layout per block: `id: u32, sha256: [u8; 32], size: u32, data: [u8; size]`.
/// Block ids count up from zero; the terminator has size 0 and an all-zero hash.
pub(crate) fn read_hashed_block_stream(data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut reader = ByteReader::new(data);
    let mut result = Zeroizing::new(Vec::new());
    let mut expected_id: u32 = 0;

    loop {
        let block_id = reader.read_u32("hashed block id")?;
        let stored_hash = reader.take(32, "hashed block hash")?;
        let block_size = reader.read_u32("hashed block size")?;

        if block_id != expected_id {
            return Err(Error::IntegrityError(format!(
                "Hashed block {} out of order (expected {})",
                block_id, expected_id
            )));
        }

        if block_size == 0 {
            if stored_hash.iter().any(|b| *b != 0) {
                return Err(Error::IntegrityError(
                    "Final hashed block carries a non-zero hash".into(),
                ));
            }
            break;
        }

        let block_data = reader.take(block_size as usize, "hashed block data")?;
        if Sha256::digest(block_data).as_slice() != stored_hash {
            return Err(Error::IntegrityError(format!(
                "Hash mismatch in block {}",
                block_id
            )));
        }
        result.extend_from_slice(block_data);
        expected_id = expected_id.wrapping_add(1);
    }

    tracing::debug!("Verified {} hashed blocks ({} bytes)", expected_id, result.len());
    Ok(result)
}
