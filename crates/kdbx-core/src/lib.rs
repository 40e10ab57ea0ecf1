//! kdbx-core - Reader for KeePass KDBX 3.x and 4.x database files
//!
//! Opening a database runs a strictly sequential pipeline: outer header, key
//! derivation, integrity checks and decryption, then XML decoding into a
//! read-only [`Database`]. Any failure is terminal and yields exactly one
//! [`Error`]; key material and decrypted buffers are zeroed on every path.
//!
//! ```no_run
//! use kdbx_core::{CompositeKey, Database};
//!
//! let data = std::fs::read("passwords.kdbx")?;
//! let key = CompositeKey::new().with_password("master password");
//! let db = Database::open(&data, &key)?;
//! if let Some(password) = db.get_password(Some("Internet"), "Mail", "me") {
//!     println!("{}", password);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod block_stream;
mod cancel;
mod cipher;
mod database;
mod decrypt;
mod entry;
mod error;
mod group;
mod header;
mod kdf;
mod key;
mod secret;
mod variant_dictionary;
mod xml;

pub use cancel::CancelToken;
pub use database::{Database, DatabaseBuilder, DatabaseMetadata, GroupTreeNode, Meta};
pub use entry::{Entry, EntryBuilder, Times, Value, NOTES, PASSWORD, TITLE, URL, USERNAME};
pub use error::{Error, Result};
pub use group::Group;
pub use header::{
    Argon2Variant, Compression, DatabaseHeader, DatabaseVersion, InnerStreamCipher, KdfParams,
    LegacyHeaderFields, OuterCipher,
};
pub use kdf::KdfLimits;
pub use key::CompositeKey;
pub use secret::{SecretBytes, SecureString};
pub use xml::MAX_GROUP_DEPTH;

// Re-export types that users might need
pub use uuid::Uuid;

/// Parse only the outer header, without a key.
///
/// Useful to inspect a file's version, cipher and KDF cost before unlocking it.
pub fn read_header(data: &[u8]) -> Result<DatabaseHeader> {
    header::parse_header(data).map(|(header, _)| header)
}
