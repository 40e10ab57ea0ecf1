//! Decryption and integrity pipeline: raw file bytes + key -> verified XML
//!
//! 4.x: header hash, KDF, header HMAC, HMAC block stream, outer cipher, gzip,
//! inner header. 3.x: KDF, outer cipher, stream start bytes, hashed block
//! stream, gzip. Nothing is decompressed or parsed before it is authenticated.

use crate::block_stream::{
    hmac_base_key, read_hashed_block_stream, read_hmac_block_stream, verify_header_hmac,
};
use crate::cancel::CancelToken;
use crate::cipher::decrypt_payload;
use crate::error::{Error, Result};
use crate::header::{parse_header, ByteReader, Compression, DatabaseHeader, InnerStreamCipher};
use crate::kdf::{derive_key, KdfLimits};
use crate::key::CompositeKey;
use crate::secret::SecretBytes;
use byteorder::{ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Read;
use zeroize::Zeroizing;

// Inner header field types
const INNER_HEADER_END: u8 = 0;
const INNER_HEADER_STREAM_ID: u8 = 1;
const INNER_HEADER_STREAM_KEY: u8 = 2;
const INNER_HEADER_BINARY: u8 = 3;

/// Verified, decrypted payload ready for the XML decoder
pub(crate) struct DecryptedPayload {
    pub xml: Zeroizing<Vec<u8>>,
    pub inner_stream: InnerStreamCipher,
    pub inner_stream_key: SecretBytes,
    /// SHA-256 of the outer header bytes; 3.x stores it in `Meta/HeaderHash`
    pub header_hash: [u8; 32],
}

struct InnerHeader {
    stream: InnerStreamCipher,
    stream_key: SecretBytes,
    xml_start: usize,
}

/// Run the full pipeline on a complete database file
pub(crate) fn decrypt_database(
    data: &[u8],
    key: &CompositeKey,
    limits: &KdfLimits,
    cancel: &CancelToken,
) -> Result<(DatabaseHeader, DecryptedPayload)> {
    let (header, header_end) = parse_header(data)?;
    let header_bytes = &data[..header_end];
    let header_hash: [u8; 32] = Sha256::digest(header_bytes).into();

    let mut reader = ByteReader::at(data, header_end);
    let stored_hmac = if header.version.is_kdbx4() {
        let stored_hash = reader.take(32, "header hash")?;
        if stored_hash != header_hash.as_slice() {
            return Err(Error::IntegrityError("Header hash mismatch".into()));
        }
        Some(reader.take(32, "header HMAC")?)
    } else {
        None
    };

    let composite = key.composite()?;
    let transformed = derive_key(&composite, &header.kdf, limits, cancel)?;

    let mut hasher = Sha256::new();
    hasher.update(&header.master_seed);
    hasher.update(transformed.as_slice());
    let mut master_key = Zeroizing::new([0u8; 32]);
    master_key.copy_from_slice(&hasher.finalize());

    let payload = match stored_hmac {
        Some(stored_hmac) => {
            let base_key = hmac_base_key(&header.master_seed, &transformed);
            verify_header_hmac(header_bytes, stored_hmac, &base_key)?;
            let body = &data[reader.position()..];
            decrypt_kdbx4(&header, body, &base_key, &master_key, header_hash)?
        }
        None => decrypt_kdbx3(&header, &data[header_end..], &master_key, header_hash)?,
    };

    tracing::debug!(
        "Decrypted KDBX {} payload: {} XML bytes, inner stream {:?}",
        header.version,
        payload.xml.len(),
        payload.inner_stream
    );
    Ok((header, payload))
}

fn decrypt_kdbx4(
    header: &DatabaseHeader,
    body: &[u8],
    base_key: &[u8],
    master_key: &[u8; 32],
    header_hash: [u8; 32],
) -> Result<DecryptedPayload> {
    let encrypted = read_hmac_block_stream(body, base_key)?;
    let decrypted = decrypt_payload(header.cipher, master_key, &header.encryption_iv, &encrypted)?;
    let plain = decompress(header.compression, decrypted)?;

    let inner = parse_inner_header(&plain)?;
    Ok(DecryptedPayload {
        xml: Zeroizing::new(plain[inner.xml_start..].to_vec()),
        inner_stream: inner.stream,
        inner_stream_key: inner.stream_key,
        header_hash,
    })
}

fn decrypt_kdbx3(
    header: &DatabaseHeader,
    body: &[u8],
    master_key: &[u8; 32],
    header_hash: [u8; 32],
) -> Result<DecryptedPayload> {
    let legacy = header
        .legacy
        .as_ref()
        .ok_or_else(|| Error::FormatError("KDBX 3 header without stream fields".into()))?;

    // No MAC precedes the ciphertext here, so a padding failure is the usual
    // symptom of a wrong key.
    let decrypted = decrypt_payload(header.cipher, master_key, &header.encryption_iv, body)
        .map_err(|e| match e {
            Error::DecryptionError => {
                Error::IntegrityError("Payload did not decrypt (wrong key or corrupted file)".into())
            }
            other => other,
        })?;

    let start_len = legacy.stream_start_bytes.len();
    if decrypted.len() < start_len || decrypted[..start_len] != legacy.stream_start_bytes[..] {
        return Err(Error::IntegrityError(
            "Stream start bytes mismatch (wrong key or corrupted file)".into(),
        ));
    }

    let blocks = read_hashed_block_stream(&decrypted[start_len..])?;
    let xml = decompress(header.compression, blocks)?;

    Ok(DecryptedPayload {
        xml,
        inner_stream: legacy.inner_stream,
        inner_stream_key: legacy.protected_stream_key.clone(),
        header_hash,
    })
}

fn decompress(compression: Compression, data: Zeroizing<Vec<u8>>) -> Result<Zeroizing<Vec<u8>>> {
    match compression {
        Compression::None => Ok(data),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(data.as_slice());
            let mut result = Zeroizing::new(Vec::new());
            decoder.read_to_end(&mut result).map_err(|e| {
                tracing::debug!("Gzip decompression failed: {}", e);
                Error::DecryptionError
            })?;
            Ok(result)
        }
    }
}

// (field_id: u8, field_len: u32, value)* up to an end marker, followed by the XML
fn parse_inner_header(data: &[u8]) -> Result<InnerHeader> {
    let mut reader = ByteReader::new(data);
    let mut stream = None;
    let mut stream_key = None;
    let mut binaries = 0usize;

    loop {
        let field_id = reader.read_u8("inner header field id")?;
        let field_len = reader.read_u32("inner header field length")? as usize;
        let field = reader.take(field_len, "inner header field")?;

        match field_id {
            INNER_HEADER_END => break,
            INNER_HEADER_STREAM_ID => {
                if field.len() != 4 {
                    return Err(Error::FormatError("Inner stream ID must be 4 bytes".into()));
                }
                stream = Some(InnerStreamCipher::from_id(LittleEndian::read_u32(field))?);
            }
            INNER_HEADER_STREAM_KEY => stream_key = Some(SecretBytes::new(field)),
            INNER_HEADER_BINARY => binaries += 1,
            other => tracing::debug!("Skipping unknown inner header field {}", other),
        }
    }

    tracing::debug!("Inner header parsed, {} binary attachments skipped", binaries);
    Ok(InnerHeader {
        stream: stream.ok_or_else(|| Error::FormatError("Missing inner stream ID".into()))?,
        stream_key: stream_key
            .ok_or_else(|| Error::FormatError("Missing inner stream key".into()))?,
        xml_start: reader.position(),
    })
}
