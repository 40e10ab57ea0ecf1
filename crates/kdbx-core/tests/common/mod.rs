//! Test-only KDBX writer used to produce containers for the reader.
//!
//! Built directly on the crypto crates so the reader is checked against an
//! independent encoding of the format.

#![allow(dead_code)]

use aes::Aes256;
use base64::Engine;
use chacha20::ChaCha20;
use cipher::block_padding::Pkcs7;
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher};
use flate2::write::GzEncoder;
use hmac::{Hmac, Mac};
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};
use std::io::Write;

pub const AES256_UUID: [u8; 16] = [
    0x31, 0xc1, 0xf2, 0xe6, 0xbf, 0x71, 0x43, 0x50, 0xbe, 0x58, 0x05, 0x21, 0x6a, 0xfc, 0x5a, 0xff,
];
pub const CHACHA20_UUID: [u8; 16] = [
    0xd6, 0x03, 0x8a, 0x2b, 0x8b, 0x6f, 0x4c, 0xb5, 0xa5, 0x24, 0x33, 0x9a, 0x31, 0xdb, 0xb5, 0x9a,
];
const AES_KDF_UUID: [u8; 16] = [
    0xc9, 0xd9, 0xf3, 0x9a, 0x62, 0x8a, 0x44, 0x60, 0xbf, 0x74, 0x0d, 0x08, 0xc1, 0x8a, 0x4f, 0xea,
];
const ARGON2D_UUID: [u8; 16] = [
    0xef, 0x63, 0x6d, 0xdf, 0x8c, 0x29, 0x44, 0x4b, 0x91, 0xf7, 0xa9, 0xa4, 0x03, 0xe3, 0x0a, 0x0c,
];
const ARGON2ID_UUID: [u8; 16] = [
    0x9e, 0x29, 0x8b, 0x19, 0x56, 0xdb, 0x47, 0x73, 0xb2, 0x3d, 0xfc, 0x3e, 0xc6, 0xf0, 0xa1, 0xe6,
];

const MASTER_SEED: [u8; 32] = [0x11; 32];
const KDF_SEED: [u8; 32] = [0x22; 32];
const STREAM_START: [u8; 32] = [0x33; 32];
const INNER_STREAM_KEY: [u8; 64] = [0x44; 64];
/// 3.x headers carry a fixed 32-byte protected stream key
const LEGACY_STREAM_KEY: [u8; 32] = [0x45; 32];
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kdf {
    Aes { rounds: u64 },
    Argon2d { memory: u64, iterations: u64, parallelism: u32 },
    Argon2id { memory: u64, iterations: u64, parallelism: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cipher {
    Aes256,
    ChaCha20,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inner {
    Salsa20,
    ChaCha20,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub major: u16,
    pub cipher: Cipher,
    pub gzip: bool,
    pub kdf: Kdf,
    pub inner: Inner,
    /// Payload bytes per HMAC (4.x) or hashed (3.x) block
    pub block_size: usize,
    /// 3.x only: write a HeaderHash that does not match the header
    pub wrong_header_hash: bool,
}

impl Options {
    pub fn kdbx4() -> Self {
        Self {
            major: 4,
            cipher: Cipher::Aes256,
            gzip: true,
            kdf: Kdf::Aes { rounds: 100 },
            inner: Inner::ChaCha20,
            block_size: 64,
            wrong_header_hash: false,
        }
    }

    pub fn kdbx3() -> Self {
        Self {
            major: 3,
            inner: Inner::Salsa20,
            ..Self::kdbx4()
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestEntry {
    pub uuid: [u8; 16],
    /// (key, value, protected)
    pub fields: Vec<(String, String, bool)>,
    pub history: Vec<TestEntry>,
}

impl TestEntry {
    pub fn new(id: u8, title: &str, user: &str, password: &str) -> Self {
        Self {
            uuid: [id; 16],
            fields: vec![
                ("Title".into(), title.into(), false),
                ("UserName".into(), user.into(), false),
                ("Password".into(), password.into(), true),
            ],
            history: Vec::new(),
        }
    }

    pub fn field(mut self, key: &str, value: &str, protected: bool) -> Self {
        self.fields.push((key.into(), value.into(), protected));
        self
    }
}

#[derive(Debug, Clone)]
pub struct TestGroup {
    pub uuid: [u8; 16],
    pub name: String,
    pub entries: Vec<TestEntry>,
    pub groups: Vec<TestGroup>,
}

impl TestGroup {
    pub fn new(id: u8, name: &str) -> Self {
        Self {
            uuid: [id; 16],
            name: name.into(),
            entries: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn entry(mut self, entry: TestEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn group(mut self, group: TestGroup) -> Self {
        self.groups.push(group);
        self
    }
}

/// The example tree: a root entry, an "Internet" group and a nested group
pub fn sample_tree() -> TestGroup {
    TestGroup::new(1, "Root")
        .entry(TestEntry::new(10, "RootEntry", "RootUser", "root_password"))
        .group(
            TestGroup::new(2, "Internet")
                .entry(
                    TestEntry::new(11, "InternetEntry", "InternetUser", "internet_password")
                        .field("URL", "https://example.com", false)
                        .field("Notes", "  line one\nline two  ", false)
                        .field("PIN", "1234", true),
                )
                .group(TestGroup::new(3, "Shopping").entry(TestEntry::new(
                    12,
                    "Shop",
                    "buyer",
                    "sh0p & <save>",
                ))),
        )
}

enum Keystream {
    Salsa20(Salsa20),
    ChaCha20(ChaCha20),
}

impl Keystream {
    fn new(kind: Inner, stream_key: &[u8]) -> Self {
        match kind {
            Inner::Salsa20 => {
                let key = Sha256::digest(stream_key);
                Keystream::Salsa20(Salsa20::new(
                    &key,
                    GenericArray::from_slice(&SALSA20_NONCE),
                ))
            }
            Inner::ChaCha20 => {
                let hash = Sha512::digest(stream_key);
                Keystream::ChaCha20(ChaCha20::new(
                    GenericArray::from_slice(&hash[..32]),
                    GenericArray::from_slice(&hash[32..44]),
                ))
            }
        }
    }

    fn mask(&mut self, value: &str) -> String {
        let mut bytes = value.as_bytes().to_vec();
        match self {
            Keystream::Salsa20(cipher) => cipher.apply_keystream(&mut bytes),
            Keystream::ChaCha20(cipher) => cipher.apply_keystream(&mut bytes),
        }
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn write_entry(out: &mut String, entry: &TestEntry, stream: &mut Keystream) {
    out.push_str(&format!("<Entry><UUID>{}</UUID>", b64(&entry.uuid)));
    for (key, value, protected) in &entry.fields {
        if *protected {
            out.push_str(&format!(
                "<String><Key>{}</Key><Value Protected=\"True\">{}</Value></String>",
                escape(key),
                stream.mask(value)
            ));
        } else {
            out.push_str(&format!(
                "<String><Key>{}</Key><Value>{}</Value></String>",
                escape(key),
                escape(value)
            ));
        }
    }
    if !entry.history.is_empty() {
        out.push_str("<History>");
        for old in &entry.history {
            write_entry(out, old, stream);
        }
        out.push_str("</History>");
    }
    out.push_str("</Entry>");
}

fn write_group(out: &mut String, group: &TestGroup, stream: &mut Keystream) {
    out.push_str(&format!(
        "<Group><UUID>{}</UUID><Name>{}</Name>",
        b64(&group.uuid),
        escape(&group.name)
    ));
    for entry in &group.entries {
        write_entry(out, entry, stream);
    }
    for child in &group.groups {
        write_group(out, child, stream);
    }
    out.push_str("</Group>");
}

pub fn write_xml(
    root: &TestGroup,
    inner: Inner,
    stream_key: &[u8],
    header_hash: Option<&[u8]>,
) -> String {
    let mut stream = Keystream::new(inner, stream_key);
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n<KeePassFile><Meta>\
         <Generator>kdbx-core tests</Generator><DatabaseName>Test Database</DatabaseName>",
    );
    if let Some(hash) = header_hash {
        out.push_str(&format!("<HeaderHash>{}</HeaderHash>", b64(hash)));
    }
    out.push_str("</Meta><Root>");
    write_group(&mut out, root, &mut stream);
    out.push_str("<DeletedObjects/></Root></KeePassFile>");
    out
}

fn field4(out: &mut Vec<u8>, id: u8, value: &[u8]) {
    out.push(id);
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value);
}

fn field3(out: &mut Vec<u8>, id: u8, value: &[u8]) {
    out.push(id);
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
}

fn variant_dictionary(items: &[(&str, u8, Vec<u8>)]) -> Vec<u8> {
    let mut out = 0x0100u16.to_le_bytes().to_vec();
    for (key, ty, value) in items {
        out.push(*ty);
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }
    out.push(0);
    out
}

fn kdf_parameters(kdf: Kdf) -> Vec<u8> {
    match kdf {
        Kdf::Aes { rounds } => variant_dictionary(&[
            ("$UUID", 0x42, AES_KDF_UUID.to_vec()),
            ("R", 0x05, rounds.to_le_bytes().to_vec()),
            ("S", 0x42, KDF_SEED.to_vec()),
        ]),
        Kdf::Argon2d {
            memory,
            iterations,
            parallelism,
        }
        | Kdf::Argon2id {
            memory,
            iterations,
            parallelism,
        } => {
            let uuid = if matches!(kdf, Kdf::Argon2d { .. }) {
                ARGON2D_UUID
            } else {
                ARGON2ID_UUID
            };
            variant_dictionary(&[
                ("$UUID", 0x42, uuid.to_vec()),
                ("S", 0x42, KDF_SEED.to_vec()),
                ("M", 0x05, memory.to_le_bytes().to_vec()),
                ("I", 0x05, iterations.to_le_bytes().to_vec()),
                ("P", 0x04, parallelism.to_le_bytes().to_vec()),
                ("V", 0x04, 0x13u32.to_le_bytes().to_vec()),
            ])
        }
    }
}

fn signature(major: u16, minor: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0x9AA2_D903u32.to_le_bytes());
    out.extend_from_slice(&0xB54B_FB67u32.to_le_bytes());
    out.extend_from_slice(&minor.to_le_bytes());
    out.extend_from_slice(&major.to_le_bytes());
    out
}

fn iv(cipher: Cipher) -> Vec<u8> {
    match cipher {
        Cipher::Aes256 => vec![0x55; 16],
        Cipher::ChaCha20 => vec![0x55; 12],
    }
}

fn cipher_uuid(cipher: Cipher) -> [u8; 16] {
    match cipher {
        Cipher::Aes256 => AES256_UUID,
        Cipher::ChaCha20 => CHACHA20_UUID,
    }
}

/// Outer header of a 4.x file, up to and including the end marker
pub fn kdbx4_header(options: &Options) -> Vec<u8> {
    let mut out = signature(4, 1);
    field4(&mut out, 2, &cipher_uuid(options.cipher));
    field4(&mut out, 3, &u32::from(options.gzip).to_le_bytes());
    field4(&mut out, 4, &MASTER_SEED);
    field4(&mut out, 7, &iv(options.cipher));
    field4(&mut out, 11, &kdf_parameters(options.kdf));
    field4(&mut out, 0, b"\r\n\r\n");
    out
}

fn kdbx3_header(options: &Options) -> Vec<u8> {
    let rounds = match options.kdf {
        Kdf::Aes { rounds } => rounds,
        other => panic!("KDBX 3 supports AES-KDF only, got {:?}", other),
    };
    let inner_id: u32 = match options.inner {
        Inner::Salsa20 => 2,
        Inner::ChaCha20 => 3,
    };
    let mut out = signature(options.major, 1);
    field3(&mut out, 2, &cipher_uuid(options.cipher));
    field3(&mut out, 3, &u32::from(options.gzip).to_le_bytes());
    field3(&mut out, 4, &MASTER_SEED);
    field3(&mut out, 5, &KDF_SEED);
    field3(&mut out, 6, &rounds.to_le_bytes());
    field3(&mut out, 7, &iv(options.cipher));
    field3(&mut out, 8, &LEGACY_STREAM_KEY);
    field3(&mut out, 9, &STREAM_START);
    field3(&mut out, 10, &inner_id.to_le_bytes());
    field3(&mut out, 0, b"\r\n\r\n");
    out
}

/// SHA-256 over the hashed password followed by an optional 32-byte key file
fn composite_key(password: &str, keyfile: Option<&[u8; 32]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(Sha256::digest(password.as_bytes()));
    if let Some(keyfile) = keyfile {
        hasher.update(keyfile);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn transformed_key(composite: &[u8; 32], kdf: Kdf) -> [u8; 32] {
    let mut out = [0u8; 32];
    match kdf {
        Kdf::Aes { rounds } => {
            let aes = <Aes256 as KeyInit>::new_from_slice(&KDF_SEED).unwrap();
            let mut blocks = [
                *GenericArray::from_slice(&composite[..16]),
                *GenericArray::from_slice(&composite[16..]),
            ];
            for _ in 0..rounds {
                aes.encrypt_blocks(&mut blocks);
            }
            let mut hasher = Sha256::new();
            hasher.update(blocks[0]);
            hasher.update(blocks[1]);
            out.copy_from_slice(&hasher.finalize());
        }
        Kdf::Argon2d {
            memory,
            iterations,
            parallelism,
        }
        | Kdf::Argon2id {
            memory,
            iterations,
            parallelism,
        } => {
            let algorithm = if matches!(kdf, Kdf::Argon2d { .. }) {
                argon2::Algorithm::Argon2d
            } else {
                argon2::Algorithm::Argon2id
            };
            let params = argon2::Params::new(
                (memory / 1024) as u32,
                iterations as u32,
                parallelism,
                Some(32),
            )
            .unwrap();
            argon2::Argon2::new(algorithm, argon2::Version::V0x13, params)
                .hash_password_into(composite, &KDF_SEED, &mut out)
                .unwrap();
        }
    }
    out
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn encrypt(cipher: Cipher, key: &[u8], data: &[u8]) -> Vec<u8> {
    match cipher {
        Cipher::Aes256 => cbc::Encryptor::<Aes256>::new_from_slices(key, &iv(cipher))
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        Cipher::ChaCha20 => {
            let mut out = data.to_vec();
            ChaCha20::new_from_slices(key, &iv(cipher))
                .unwrap()
                .apply_keystream(&mut out);
            out
        }
    }
}

fn hmac_block(base_key: &[u8], index: u64, data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(index.to_le_bytes());
    hasher.update(base_key);
    let block_key = hasher.finalize();
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&block_key).unwrap();
    if index != u64::MAX {
        mac.update(&index.to_le_bytes());
        mac.update(&(data.len() as u32).to_le_bytes());
    }
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Serialize `root` into a complete database file protected by `password`
pub fn write_database(root: &TestGroup, password: &str, options: &Options) -> Vec<u8> {
    write_with_composite(root, &composite_key(password, None), options)
}

/// Like [`write_database`], with a raw 32-byte key file as second key source
pub fn write_database_with_keyfile(
    root: &TestGroup,
    password: &str,
    keyfile: &[u8; 32],
    options: &Options,
) -> Vec<u8> {
    write_with_composite(root, &composite_key(password, Some(keyfile)), options)
}

fn write_with_composite(root: &TestGroup, composite: &[u8; 32], options: &Options) -> Vec<u8> {
    match options.major {
        4 => write_kdbx4(root, composite, options),
        2 | 3 => write_kdbx3(root, composite, options),
        other => panic!("cannot write KDBX {}", other),
    }
}

fn write_kdbx4(root: &TestGroup, composite: &[u8; 32], options: &Options) -> Vec<u8> {
    let header = kdbx4_header(options);
    let transformed = transformed_key(composite, options.kdf);

    let mut master = Sha256::new();
    master.update(MASTER_SEED);
    master.update(transformed);
    let master_key = master.finalize();

    let mut base = Sha512::new();
    base.update(MASTER_SEED);
    base.update(transformed);
    base.update([0x01]);
    let base_key = base.finalize();

    let inner_id: u32 = match options.inner {
        Inner::Salsa20 => 2,
        Inner::ChaCha20 => 3,
    };
    let mut plain = Vec::new();
    field4(&mut plain, 1, &inner_id.to_le_bytes());
    field4(&mut plain, 2, &INNER_STREAM_KEY);
    field4(&mut plain, 3, b"\x00attachment bytes");
    field4(&mut plain, 0, &[]);
    let xml = write_xml(root, options.inner, &INNER_STREAM_KEY, None);
    plain.extend_from_slice(xml.as_bytes());

    if options.gzip {
        plain = gzip(&plain);
    }
    let encrypted = encrypt(options.cipher, &master_key, &plain);

    let mut out = header.clone();
    out.extend_from_slice(&Sha256::digest(&header));
    out.extend_from_slice(&hmac_block(&base_key, u64::MAX, &header));

    let mut index = 0u64;
    for chunk in encrypted.chunks(options.block_size) {
        out.extend_from_slice(&hmac_block(&base_key, index, chunk));
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        index += 1;
    }
    out.extend_from_slice(&hmac_block(&base_key, index, &[]));
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

fn write_kdbx3(root: &TestGroup, composite: &[u8; 32], options: &Options) -> Vec<u8> {
    let header = kdbx3_header(options);
    let transformed = transformed_key(composite, options.kdf);

    let mut master = Sha256::new();
    master.update(MASTER_SEED);
    master.update(transformed);
    let master_key = master.finalize();

    let mut header_hash = Sha256::digest(&header).to_vec();
    if options.wrong_header_hash {
        header_hash[0] ^= 0xFF;
    }
    let mut xml =
        write_xml(root, options.inner, &LEGACY_STREAM_KEY, Some(&header_hash)).into_bytes();
    if options.gzip {
        xml = gzip(&xml);
    }

    let mut plain = STREAM_START.to_vec();
    let mut id = 0u32;
    for chunk in xml.chunks(options.block_size) {
        plain.extend_from_slice(&id.to_le_bytes());
        plain.extend_from_slice(&Sha256::digest(chunk));
        plain.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        plain.extend_from_slice(chunk);
        id += 1;
    }
    plain.extend_from_slice(&id.to_le_bytes());
    plain.extend_from_slice(&[0; 32]);
    plain.extend_from_slice(&0u32.to_le_bytes());

    let mut out = header;
    out.extend_from_slice(&encrypt(options.cipher, &master_key, &plain));
    out
}
