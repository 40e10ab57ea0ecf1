//! Error types for kdbx-core

use thiserror::Error;

/// Result type alias for kdbx-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening a KeePass database.
///
/// Every variant is terminal for the file being parsed: no partially decoded
/// database is ever returned alongside one of these.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad signature or a structurally invalid container
    #[error("Invalid database format: {0}")]
    FormatError(String),

    /// Recognized KeePass file, but a version this crate cannot read
    #[error("Unsupported database version: {0}")]
    UnsupportedVersion(String),

    /// A field claims more bytes than the input holds
    #[error("Truncated input: {0}")]
    TruncatedInput(String),

    /// A hash or HMAC did not match. Also covers wrong credentials, which
    /// surface as a header HMAC mismatch (4.x) or a stream start mismatch (3.x).
    #[error("Integrity check failed: {0}")]
    IntegrityError(String),

    /// The payload authenticated but could not be decrypted or unpacked
    #[error("Decryption failed: incorrect credentials or corrupted data")]
    DecryptionError,

    /// KDF parameters are unknown, invalid, or exceed the configured limits
    #[error("Invalid key derivation parameters: {0}")]
    KdfParameterError(String),

    /// The decrypted XML document is malformed or missing required elements
    #[error("Malformed database tree: {0}")]
    MalformedTree(String),

    /// The key file could not be read or interpreted
    #[error("Invalid key file: {0}")]
    KeyFileError(String),

    /// Key derivation was cancelled before it finished
    #[error("Key derivation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl Error {
    pub(crate) fn truncated(what: &str) -> Self {
        Error::TruncatedInput(format!("{} extends past end of input", what))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<xml::reader::Error> for Error {
    fn from(err: xml::reader::Error) -> Self {
        Error::MalformedTree(err.to_string())
    }
}
