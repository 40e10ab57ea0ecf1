//! KDBX outer header parsing
//!
//! The container starts with two 4-byte signatures and a 4-byte version,
//! followed by type-length-value header fields up to an end marker:
//!
//! ```text
//! sig1: u32 = 0x9AA2D903, sig2: u32 = 0xB54BFB67, minor: u16, major: u16
//! (field_id: u8, field_len: u16 (3.x) | u32 (4.x), value: [u8; field_len])*
//! ```

use crate::error::{Error, Result};
use crate::secret::SecretBytes;
use crate::variant_dictionary::VariantDictionary;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use uuid::Uuid;

pub(crate) const SIGNATURE_1: u32 = 0x9AA2_D903;
pub(crate) const SIGNATURE_2: u32 = 0xB54B_FB67;
const SIGNATURE_2_KEEPASS1: u32 = 0xB54B_FB65;
const SIGNATURE_2_PRE_RELEASE: u32 = 0xB54B_FB66;

// Outer header field types
pub(crate) const HEADER_END: u8 = 0;
pub(crate) const HEADER_COMMENT: u8 = 1;
pub(crate) const HEADER_CIPHER_ID: u8 = 2;
pub(crate) const HEADER_COMPRESSION_FLAGS: u8 = 3;
pub(crate) const HEADER_MASTER_SEED: u8 = 4;
pub(crate) const HEADER_TRANSFORM_SEED: u8 = 5;
pub(crate) const HEADER_TRANSFORM_ROUNDS: u8 = 6;
pub(crate) const HEADER_ENCRYPTION_IV: u8 = 7;
pub(crate) const HEADER_PROTECTED_STREAM_KEY: u8 = 8;
pub(crate) const HEADER_STREAM_START_BYTES: u8 = 9;
pub(crate) const HEADER_INNER_RANDOM_STREAM_ID: u8 = 10;
pub(crate) const HEADER_KDF_PARAMETERS: u8 = 11;
pub(crate) const HEADER_PUBLIC_CUSTOM_DATA: u8 = 12;

pub(crate) const CIPHER_AES256: Uuid = Uuid::from_u128(0x31c1f2e6_bf71_4350_be58_05216afc5aff);
pub(crate) const CIPHER_CHACHA20: Uuid = Uuid::from_u128(0xd6038a2b_8b6f_4cb5_a524_339a31dbb59a);
const CIPHER_TWOFISH: Uuid = Uuid::from_u128(0xad68f29f_576f_4bb9_a36a_d47af965346c);

pub(crate) const KDF_AES_KDBX3: Uuid = Uuid::from_u128(0xc9d9f39a_628a_4460_bf74_0d08c18a4fea);
pub(crate) const KDF_AES_KDBX4: Uuid = Uuid::from_u128(0x7c02bb82_79a7_4ac0_927d_114a00648238);
pub(crate) const KDF_ARGON2D: Uuid = Uuid::from_u128(0xef636ddf_8c29_444b_91f7_a9a403e30a0c);
pub(crate) const KDF_ARGON2ID: Uuid = Uuid::from_u128(0x9e298b19_56db_4773_b23d_fc3ec6f0a1e6);

/// Required size of the 3.x protected stream key and stream start bytes
const LEGACY_FIELD_LEN: usize = 32;

/// Bounds-checked little-endian cursor over a byte slice
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::truncated(what))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn read_u16(&mut self, what: &str) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2, what)?))
    }

    pub fn read_u32(&mut self, what: &str) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4, what)?))
    }
}

/// File format version (major.minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseVersion {
    pub major: u16,
    pub minor: u16,
}

impl DatabaseVersion {
    pub fn is_kdbx4(&self) -> bool {
        self.major >= 4
    }
}

impl fmt::Display for DatabaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Cipher used for the encrypted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterCipher {
    Aes256,
    ChaCha20,
}

impl OuterCipher {
    fn from_uuid_bytes(bytes: &[u8]) -> Result<Self> {
        let uuid = Uuid::from_slice(bytes)
            .map_err(|_| Error::FormatError("Cipher ID is not a UUID".into()))?;
        match uuid {
            u if u == CIPHER_AES256 => Ok(OuterCipher::Aes256),
            u if u == CIPHER_CHACHA20 => Ok(OuterCipher::ChaCha20),
            u if u == CIPHER_TWOFISH => Err(Error::FormatError("Twofish cipher is not supported".into())),
            other => Err(Error::FormatError(format!("Unknown cipher {}", other))),
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            OuterCipher::Aes256 => 16,
            OuterCipher::ChaCha20 => 12,
        }
    }
}

/// Payload compression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    fn from_flags(raw: &[u8]) -> Result<Self> {
        if raw.len() != 4 {
            return Err(Error::FormatError("Compression flags must be 4 bytes".into()));
        }
        match LittleEndian::read_u32(raw) {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(Error::FormatError(format!("Unknown compression {}", other))),
        }
    }
}

/// Stream cipher obfuscating protected values inside the XML document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerStreamCipher {
    None,
    Salsa20,
    ChaCha20,
}

impl InnerStreamCipher {
    pub(crate) fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(InnerStreamCipher::None),
            2 => Ok(InnerStreamCipher::Salsa20),
            3 => Ok(InnerStreamCipher::ChaCha20),
            1 => Err(Error::FormatError("ArcFour inner stream is not supported".into())),
            other => Err(Error::FormatError(format!("Unknown inner stream {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Variant {
    Argon2d,
    Argon2id,
}

/// Key derivation function and its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfParams {
    /// AES-KDF: `rounds` AES-256 encryptions of the composite key keyed by `seed`
    Aes { rounds: u64, seed: Vec<u8> },
    /// Argon2d / Argon2id
    Argon2 {
        variant: Argon2Variant,
        salt: Vec<u8>,
        /// Memory cost in bytes
        memory_bytes: u64,
        iterations: u64,
        parallelism: u32,
        version: u32,
    },
}

impl KdfParams {
    fn from_variant_dictionary(vd: &VariantDictionary) -> Result<Self> {
        let uuid = vd
            .get_bytes("$UUID")
            .and_then(|b| Uuid::from_slice(b).ok())
            .ok_or_else(|| Error::FormatError("Missing KDF UUID".into()))?;

        let missing = |key: &str| Error::KdfParameterError(format!("Missing KDF parameter '{}'", key));

        match uuid {
            u if u == KDF_AES_KDBX3 || u == KDF_AES_KDBX4 => Ok(KdfParams::Aes {
                rounds: vd.get_u64("R").ok_or_else(|| missing("R"))?,
                seed: vd.get_bytes("S").ok_or_else(|| missing("S"))?.to_vec(),
            }),
            u if u == KDF_ARGON2D || u == KDF_ARGON2ID => {
                if vd.contains("K") || vd.contains("A") {
                    return Err(Error::KdfParameterError(
                        "Argon2 secret key and associated data are not supported".into(),
                    ));
                }
                Ok(KdfParams::Argon2 {
                    variant: if uuid == KDF_ARGON2D {
                        Argon2Variant::Argon2d
                    } else {
                        Argon2Variant::Argon2id
                    },
                    salt: vd.get_bytes("S").ok_or_else(|| missing("S"))?.to_vec(),
                    memory_bytes: vd.get_u64("M").ok_or_else(|| missing("M"))?,
                    iterations: vd.get_u64("I").ok_or_else(|| missing("I"))?,
                    parallelism: vd.get_u32("P").ok_or_else(|| missing("P"))?,
                    version: vd.get_u32("V").unwrap_or(0x13),
                })
            }
            other => Err(Error::KdfParameterError(format!("Unsupported KDF {}", other))),
        }
    }
}

/// Header fields that only exist in KDBX 3.x; 4.x moved them into the inner header
#[derive(Debug, Clone)]
pub struct LegacyHeaderFields {
    pub protected_stream_key: SecretBytes,
    pub stream_start_bytes: Vec<u8>,
    pub inner_stream: InnerStreamCipher,
}

/// Parsed outer header
#[derive(Debug, Clone)]
pub struct DatabaseHeader {
    pub version: DatabaseVersion,
    pub cipher: OuterCipher,
    pub compression: Compression,
    pub master_seed: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfParams,
    /// Present for 2.x and 3.x files only
    pub legacy: Option<LegacyHeaderFields>,
}

fn check_legacy_len(field: &[u8], what: &str) -> Result<()> {
    if field.len() != LEGACY_FIELD_LEN {
        return Err(Error::FormatError(format!(
            "{} must be {} bytes, got {}",
            what,
            LEGACY_FIELD_LEN,
            field.len()
        )));
    }
    Ok(())
}

fn parse_version(reader: &mut ByteReader<'_>) -> Result<DatabaseVersion> {
    let sig1 = reader.read_u32("file signature")?;
    let sig2 = reader.read_u32("file signature")?;

    if sig1 != SIGNATURE_1 {
        return Err(Error::FormatError("Invalid KDBX signature".into()));
    }
    match sig2 {
        SIGNATURE_2 => {}
        SIGNATURE_2_KEEPASS1 => {
            return Err(Error::UnsupportedVersion("KeePass 1.x (KDB) databases".into()))
        }
        SIGNATURE_2_PRE_RELEASE => {
            return Err(Error::UnsupportedVersion("KeePass 2.x pre-release databases".into()))
        }
        _ => return Err(Error::FormatError("Invalid KDBX signature".into())),
    }

    let minor = reader.read_u16("file version")?;
    let major = reader.read_u16("file version")?;
    let version = DatabaseVersion { major, minor };

    // 2.x files share the 3.x layout
    if !(2..=4).contains(&major) {
        return Err(Error::UnsupportedVersion(format!("KDBX {}", version)));
    }
    Ok(version)
}

/// Parse the outer header.
///
/// Returns the header and the offset of the first byte after it (the end marker
/// included), which is where the hash/HMAC (4.x) or the encrypted payload (3.x)
/// begins.
pub(crate) fn parse_header(data: &[u8]) -> Result<(DatabaseHeader, usize)> {
    let mut reader = ByteReader::new(data);
    let version = parse_version(&mut reader)?;

    let mut cipher = None;
    let mut compression = None;
    let mut master_seed = None;
    let mut encryption_iv = None;
    let mut kdf = None;
    let mut transform_seed = None;
    let mut transform_rounds = None;
    let mut protected_stream_key = None;
    let mut stream_start_bytes = None;
    let mut inner_stream = None;

    loop {
        let field_id = reader.read_u8("header field id")?;
        let field_len = if version.is_kdbx4() {
            reader.read_u32("header field length")? as usize
        } else {
            reader.read_u16("header field length")? as usize
        };
        let field = reader.take(field_len, "header field")?;

        match field_id {
            HEADER_END => break,
            HEADER_COMMENT | HEADER_PUBLIC_CUSTOM_DATA => {}
            HEADER_CIPHER_ID => cipher = Some(OuterCipher::from_uuid_bytes(field)?),
            HEADER_COMPRESSION_FLAGS => compression = Some(Compression::from_flags(field)?),
            HEADER_MASTER_SEED => master_seed = Some(field.to_vec()),
            HEADER_ENCRYPTION_IV => encryption_iv = Some(field.to_vec()),
            HEADER_KDF_PARAMETERS if version.is_kdbx4() => {
                let vd = VariantDictionary::parse(field)?;
                kdf = Some(KdfParams::from_variant_dictionary(&vd)?);
            }
            HEADER_TRANSFORM_SEED if !version.is_kdbx4() => transform_seed = Some(field.to_vec()),
            HEADER_TRANSFORM_ROUNDS if !version.is_kdbx4() => {
                if field.len() != 8 {
                    return Err(Error::FormatError("Transform rounds must be 8 bytes".into()));
                }
                transform_rounds = Some(LittleEndian::read_u64(field));
            }
            HEADER_PROTECTED_STREAM_KEY if !version.is_kdbx4() => {
                check_legacy_len(field, "Protected stream key")?;
                protected_stream_key = Some(SecretBytes::new(field))
            }
            HEADER_STREAM_START_BYTES if !version.is_kdbx4() => {
                check_legacy_len(field, "Stream start bytes")?;
                stream_start_bytes = Some(field.to_vec())
            }
            HEADER_INNER_RANDOM_STREAM_ID if !version.is_kdbx4() => {
                if field.len() != 4 {
                    return Err(Error::FormatError("Inner stream ID must be 4 bytes".into()));
                }
                inner_stream = Some(InnerStreamCipher::from_id(LittleEndian::read_u32(field))?);
            }
            other => {
                tracing::debug!("Skipping unknown header field {} ({} bytes)", other, field_len);
            }
        }
    }

    fn required<T>(value: Option<T>, name: &str) -> Result<T> {
        value.ok_or_else(|| Error::FormatError(format!("Missing header field: {}", name)))
    }

    let cipher = required(cipher, "cipher ID")?;
    let compression = required(compression, "compression flags")?;
    let master_seed = required(master_seed, "master seed")?;
    let encryption_iv = required(encryption_iv, "encryption IV")?;

    if master_seed.len() != 32 {
        return Err(Error::FormatError(format!(
            "Master seed must be 32 bytes, got {}",
            master_seed.len()
        )));
    }
    if encryption_iv.len() != cipher.iv_len() {
        return Err(Error::FormatError(format!(
            "Encryption IV must be {} bytes for {:?}, got {}",
            cipher.iv_len(),
            cipher,
            encryption_iv.len()
        )));
    }

    let (kdf, legacy) = if version.is_kdbx4() {
        (required(kdf, "KDF parameters")?, None)
    } else {
        let kdf = KdfParams::Aes {
            rounds: required(transform_rounds, "transform rounds")?,
            seed: required(transform_seed, "transform seed")?,
        };
        let legacy = LegacyHeaderFields {
            protected_stream_key: required(protected_stream_key, "protected stream key")?,
            stream_start_bytes: required(stream_start_bytes, "stream start bytes")?,
            inner_stream: required(inner_stream, "inner random stream ID")?,
        };
        (kdf, Some(legacy))
    };

    let header_end = reader.position();
    tracing::debug!(
        "Parsed KDBX {} header: cipher={:?}, compression={:?}, {} header bytes",
        version,
        cipher,
        compression,
        header_end
    );

    Ok((
        DatabaseHeader {
            version,
            cipher,
            compression,
            master_seed,
            encryption_iv,
            kdf,
            legacy,
        },
        header_end,
    ))
}
