//! Outer payload ciphers and the inner protected-value stream ciphers

use crate::error::{Error, Result};
use crate::header::{InnerStreamCipher, OuterCipher};
use aes::Aes256;
use base64::Engine;
use chacha20::ChaCha20;
use cipher::block_padding::Pkcs7;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

type Aes256Cbc = cbc::Decryptor<Aes256>;

/// Fixed nonce KeePass uses for the Salsa20 inner stream
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Decrypt the outer payload with the master key.
///
/// Bad CBC padding is reported as [`Error::DecryptionError`]; callers on the 3.x
/// path, where no MAC has been checked yet, remap it.
pub(crate) fn decrypt_payload(
    cipher: OuterCipher,
    master_key: &[u8; 32],
    iv: &[u8],
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    match cipher {
        OuterCipher::Aes256 => {
            if data.is_empty() || data.len() % 16 != 0 {
                return Err(Error::DecryptionError);
            }
            let decryptor =
                Aes256Cbc::new_from_slices(master_key, iv).map_err(|_| Error::DecryptionError)?;
            let mut buffer = Zeroizing::new(data.to_vec());
            let len = decryptor
                .decrypt_padded_mut::<Pkcs7>(&mut buffer)
                .map_err(|_| Error::DecryptionError)?
                .len();
            buffer.truncate(len);
            Ok(buffer)
        }
        OuterCipher::ChaCha20 => {
            let mut stream =
                ChaCha20::new_from_slices(master_key, iv).map_err(|_| Error::DecryptionError)?;
            let mut buffer = Zeroizing::new(data.to_vec());
            stream.apply_keystream(&mut buffer);
            Ok(buffer)
        }
    }
}

/// Keystream used to unmask protected values in the XML document.
///
/// One instance is shared across the whole document; every protected value
/// consumes exactly as many keystream bytes as it is long, in document order.
pub enum ProtectedStream {
    None,
    Salsa20(Box<Salsa20>),
    ChaCha20(Box<ChaCha20>),
}

impl ProtectedStream {
    pub fn new(kind: InnerStreamCipher, stream_key: &[u8]) -> Result<Self> {
        match kind {
            InnerStreamCipher::None => Ok(ProtectedStream::None),
            InnerStreamCipher::Salsa20 => {
                let key = Zeroizing::new(Sha256::digest(stream_key).to_vec());
                let cipher = Salsa20::new(
                    GenericArray::from_slice(&key),
                    GenericArray::from_slice(&SALSA20_NONCE),
                );
                Ok(ProtectedStream::Salsa20(Box::new(cipher)))
            }
            InnerStreamCipher::ChaCha20 => {
                let hash = Zeroizing::new(Sha512::digest(stream_key).to_vec());
                let cipher = ChaCha20::new(
                    GenericArray::from_slice(&hash[0..32]),
                    GenericArray::from_slice(&hash[32..44]),
                );
                Ok(ProtectedStream::ChaCha20(Box::new(cipher)))
            }
        }
    }

    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        match self {
            ProtectedStream::None => {}
            ProtectedStream::Salsa20(cipher) => cipher.apply_keystream(data),
            ProtectedStream::ChaCha20(cipher) => cipher.apply_keystream(data),
        }
    }

    /// Decode a base64 protected value and unmask it
    pub fn decrypt(&mut self, base64_value: &str) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(base64_value.trim())
                .map_err(|e| {
                    Error::MalformedTree(format!("Protected value is not base64: {}", e))
                })?,
        );
        self.apply_keystream(&mut data);
        Ok(data)
    }
}

impl std::fmt::Debug for ProtectedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtectedStream::None => "None",
            ProtectedStream::Salsa20(_) => "Salsa20",
            ProtectedStream::ChaCha20(_) => "ChaCha20",
        };
        write!(f, "ProtectedStream({})", name)
    }
}
