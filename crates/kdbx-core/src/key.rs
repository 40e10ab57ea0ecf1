//! Composite key: the credentials a database is unlocked with

use crate::error::{Error, Result};
use crate::secret::SecretBytes;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::io::Read;
use xml::reader::{EventReader, XmlEvent};
use zeroize::Zeroizing;

/// Ordered collection of key sources.
///
/// Each source is reduced to a 32-byte element when added; the composite key is
/// SHA-256 over the concatenated elements, in the order they were added
/// (password, then key file, then challenge-response, as KeePass does).
#[derive(Debug, Default, Clone)]
pub struct CompositeKey {
    elements: Vec<SecretBytes>,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a master password
    pub fn with_password(mut self, password: &str) -> Self {
        self.elements
            .push(SecretBytes::new(Sha256::digest(password.as_bytes()).as_slice()));
        self
    }

    /// Add a key file read from `source`
    pub fn with_keyfile<R: Read>(mut self, source: &mut R) -> Result<Self> {
        let mut contents = Zeroizing::new(Vec::new());
        source
            .read_to_end(&mut contents)
            .map_err(|e| Error::KeyFileError(e.to_string()))?;
        self.elements.push(keyfile_element(&contents)?);
        Ok(self)
    }

    /// Add the response of a hardware token to the database's challenge
    pub fn with_challenge_response(mut self, response: &[u8]) -> Self {
        self.elements
            .push(SecretBytes::new(Sha256::digest(response).as_slice()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// SHA-256 over all key elements; this is the input to the KDF
    pub(crate) fn composite(&self) -> Result<Zeroizing<[u8; 32]>> {
        if self.elements.is_empty() {
            return Err(Error::KeyFileError("No key sources provided".into()));
        }
        let mut hasher = Sha256::new();
        for element in &self.elements {
            hasher.update(element.as_bytes());
        }
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&hasher.finalize());
        Ok(out)
    }
}

/// Reduce key file contents to a 32-byte key element.
///
/// Recognized, in order: KeePass XML key files (v1.0 base64 data, v2.0 hex data
/// with a hash check), raw 32-byte files, 64-character hex files. Anything else
/// is hashed whole.
fn keyfile_element(contents: &[u8]) -> Result<SecretBytes> {
    if let Some(key) = parse_xml_keyfile(contents)? {
        return Ok(key);
    }

    if contents.len() == 32 {
        return Ok(SecretBytes::new(contents));
    }

    if contents.len() == 64 {
        if let Ok(text) = std::str::from_utf8(contents) {
            if let Ok(decoded) = hex::decode(text) {
                return Ok(SecretBytes::new(decoded));
            }
        }
    }

    Ok(SecretBytes::new(Sha256::digest(contents).as_slice()))
}

/// Returns `Ok(None)` when the contents are not a KeePass XML key file at all
fn parse_xml_keyfile(contents: &[u8]) -> Result<Option<SecretBytes>> {
    let text = contents.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(contents);
    if text.iter().find(|b| !b.is_ascii_whitespace()) != Some(&b'<') {
        return Ok(None);
    }

    let mut reader = EventReader::new(text);
    let mut path: Vec<String> = Vec::new();
    let mut saw_root = false;
    let mut version: Option<String> = None;
    let mut data = Zeroizing::new(String::new());
    let mut data_hash: Option<String> = None;

    loop {
        let event = match reader.next() {
            Ok(event) => event,
            Err(_) if !saw_root => return Ok(None),
            Err(e) => return Err(Error::KeyFileError(format!("Malformed XML key file: {}", e))),
        };
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                if path.is_empty() {
                    if name.local_name != "KeyFile" {
                        return Ok(None);
                    }
                    saw_root = true;
                }
                if name.local_name == "Data" {
                    data_hash = attributes
                        .iter()
                        .find(|a| a.name.local_name == "Hash")
                        .map(|a| a.value.clone());
                }
                path.push(name.local_name);
            }
            XmlEvent::Characters(chunk) => {
                match path.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                    ["KeyFile", "Meta", "Version"] => version = Some(chunk.trim().to_string()),
                    ["KeyFile", "Key", "Data"] => data.push_str(&chunk),
                    _ => {}
                }
            }
            XmlEvent::EndElement { .. } => {
                path.pop();
            }
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }

    if !saw_root {
        return Ok(None);
    }
    if data.trim().is_empty() {
        return Err(Error::KeyFileError("XML key file has no <Data>".into()));
    }

    // KeePass writes "1.00" and "2.0"; only the major number matters
    let major = version.as_deref().map(|v| v.split('.').next().unwrap_or(v));
    match major {
        Some("2") => {
            let compact: Zeroizing<String> =
                Zeroizing::new(data.chars().filter(|c| !c.is_whitespace()).collect());
            let key = Zeroizing::new(
                hex::decode(compact.as_str())
                    .map_err(|_| Error::KeyFileError("Key data is not hex".into()))?,
            );
            if let Some(expected) = data_hash {
                let expected = hex::decode(expected.trim())
                    .map_err(|_| Error::KeyFileError("Key hash is not hex".into()))?;
                let actual = Sha256::digest(key.as_slice());
                if expected.len() > actual.len() || actual[..expected.len()] != expected[..] {
                    return Err(Error::KeyFileError("Key file hash mismatch".into()));
                }
            }
            Ok(Some(SecretBytes::new(key.as_slice())))
        }
        Some("1") | None => {
            let key = Zeroizing::new(
                base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|_| Error::KeyFileError("Key data is not base64".into()))?,
            );
            Ok(Some(SecretBytes::new(key.as_slice())))
        }
        Some(other) => Err(Error::KeyFileError(format!(
            "Unsupported key file version {}",
            other
        ))),
    }
}
