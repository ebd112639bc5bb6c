//! Streaming archive encryption.
//!
//! Format: a 7-byte random nonce prefix (the stream IV) followed by frames of
//! `u32 big-endian length || AES-256-GCM ciphertext`. Each frame holds at most
//! [`CHUNK_SIZE`] plaintext bytes. Frame `i` is sealed with the nonce
//! `prefix || i as u32 BE || last`, where `last` is 1 only for the final,
//! short frame. Reordered, truncated or extended streams fail to decrypt.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::DockyardError;
use crate::filesys::dir::Dir;

/// Plaintext bytes per frame
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Length of the per-stream nonce prefix
pub const NONCE_PREFIX_LEN: usize = 7;

const TAG_LEN: usize = 16;
const SALT_LEN: usize = 16;

/// A 256-bit archive key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey({})", self.fingerprint())
    }
}

impl EncryptionKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Random key
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// SHA-256 of `passphrase || salt`
    pub fn derive(passphrase: &str, salt: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        hasher.update(salt);
        Self {
            key: hasher.finalize().into(),
        }
    }

    /// Passphrase-derived key with a fresh random salt
    pub fn derive_with_random_salt(passphrase: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::derive(passphrase, &salt)
    }

    pub fn from_hex(hex: &str) -> Result<Self, DockyardError> {
        let bytes = hex::decode(hex.trim()).map_err(|e| {
            DockyardError::IntegrityCheckFailed(format!("invalid key encoding: {}", e))
        })?;
        let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            DockyardError::IntegrityCheckFailed(format!(
                "key must be 32 bytes, got {} bytes",
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Short identifier safe to log
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.key)[..8])
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Read until `buf` is full or the reader is exhausted
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reader yielding the encrypted form of its inner reader
pub struct EncryptingReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    output: Vec<u8>,
    position: usize,
    finished: bool,
}

impl<R: Read> EncryptingReader<R> {
    pub fn new(inner: R, key: &EncryptionKey) -> Self {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut prefix);
        Self {
            inner,
            cipher: key.cipher(),
            prefix,
            counter: 0,
            output: prefix.to_vec(),
            position: 0,
            finished: false,
        }
    }

    fn seal_next(&mut self) -> io::Result<()> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let len = read_full(&mut self.inner, &mut chunk)?;
        chunk.truncate(len);
        let last = len < CHUNK_SIZE;

        let nonce = frame_nonce(&self.prefix, self.counter, last);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), chunk.as_slice())
            .map_err(|_| invalid_data("encryption failed"))?;

        self.output.clear();
        self.output
            .extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        self.output.extend_from_slice(&sealed);
        self.position = 0;

        if last {
            self.finished = true;
        } else {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or_else(|| invalid_data("stream too long"))?;
        }
        Ok(())
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.position >= self.output.len() {
            if self.finished {
                return Ok(0);
            }
            self.seal_next()?;
        }
        let n = buf.len().min(self.output.len() - self.position);
        buf[..n].copy_from_slice(&self.output[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// Reader yielding the plaintext of an encrypted inner reader.
///
/// Authentication failures surface as `InvalidData` errors.
pub struct DecryptingReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    prefix: Option<[u8; NONCE_PREFIX_LEN]>,
    counter: u32,
    output: Vec<u8>,
    position: usize,
    finished: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(inner: R, key: &EncryptionKey) -> Self {
        Self {
            inner,
            cipher: key.cipher(),
            prefix: None,
            counter: 0,
            output: Vec::new(),
            position: 0,
            finished: false,
        }
    }

    fn open_next(&mut self) -> io::Result<()> {
        let prefix = match self.prefix {
            Some(prefix) => prefix,
            None => {
                let mut prefix = [0u8; NONCE_PREFIX_LEN];
                if read_full(&mut self.inner, &mut prefix)? != NONCE_PREFIX_LEN {
                    return Err(invalid_data("encrypted stream is missing its IV"));
                }
                self.prefix = Some(prefix);
                prefix
            }
        };

        let mut len_bytes = [0u8; 4];
        if read_full(&mut self.inner, &mut len_bytes)? != 4 {
            return Err(invalid_data("encrypted stream is truncated"));
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(invalid_data(format!("invalid frame length {}", len)));
        }

        let mut sealed = vec![0u8; len];
        if read_full(&mut self.inner, &mut sealed)? != len {
            return Err(invalid_data("encrypted stream is truncated"));
        }

        let last = len - TAG_LEN < CHUNK_SIZE;
        let nonce = frame_nonce(&prefix, self.counter, last);
        self.output = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| invalid_data("authentication failed: wrong key or corrupted data"))?;
        self.position = 0;

        if last {
            let mut probe = [0u8; 1];
            if read_full(&mut self.inner, &mut probe)? != 0 {
                return Err(invalid_data("trailing data after final frame"));
            }
            self.finished = true;
        } else {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or_else(|| invalid_data("stream too long"))?;
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.position >= self.output.len() {
            if self.finished {
                return Ok(0);
            }
            self.open_next()?;
        }
        let n = buf.len().min(self.output.len() - self.position);
        buf[..n].copy_from_slice(&self.output[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// Map a stream error to the error taxonomy
pub fn map_stream_error(err: io::Error) -> DockyardError {
    if err.kind() == io::ErrorKind::InvalidData {
        DockyardError::IntegrityCheckFailed(err.to_string())
    } else {
        DockyardError::IoError(err)
    }
}

/// Encrypt `src` into `dst`; blocking
pub fn encrypt_file(src: &Path, dst: &Path, key: &EncryptionKey) -> Result<u64, DockyardError> {
    let input = fs::File::open(src)?;
    let mut reader = EncryptingReader::new(io::BufReader::new(input), key);
    let mut output = io::BufWriter::new(fs::File::create(dst)?);
    let written = io::copy(&mut reader, &mut output).map_err(map_stream_error)?;
    output.flush()?;
    output.get_ref().sync_all()?;
    Ok(written)
}

/// Decrypt `src` into `dst`; blocking
pub fn decrypt_file(src: &Path, dst: &Path, key: &EncryptionKey) -> Result<u64, DockyardError> {
    let input = fs::File::open(src)?;
    let mut reader = DecryptingReader::new(io::BufReader::new(input), key);
    let mut output = io::BufWriter::new(fs::File::create(dst)?);
    let written = io::copy(&mut reader, &mut output).map_err(map_stream_error)?;
    output.flush()?;
    Ok(written)
}

/// One hex key file per backup, readable only by the owning user
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: Dir,
}

impl KeyStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    fn key_file_name(backup_id: &str) -> String {
        format!("{}.key", backup_id)
    }

    /// Persist a backup's key; an existing key is never replaced
    pub async fn store(&self, backup_id: &str, key: &EncryptionKey) -> Result<(), DockyardError> {
        self.dir
            .file(&Self::key_file_name(backup_id))
            .write_private(key.to_hex().as_bytes())
            .await?;
        debug!("Stored key {} for backup {}", key.fingerprint(), backup_id);
        Ok(())
    }

    pub async fn load(&self, backup_id: &str) -> Result<EncryptionKey, DockyardError> {
        let file = self.dir.file(&Self::key_file_name(backup_id));
        if !file.exists().await {
            return Err(DockyardError::NotFound(format!(
                "encryption key for backup {}",
                backup_id
            )));
        }
        EncryptionKey::from_hex(&file.read_string().await?)
    }

    pub async fn delete(&self, backup_id: &str) -> Result<(), DockyardError> {
        self.dir.file(&Self::key_file_name(backup_id)).delete().await
    }

    pub async fn exists(&self, backup_id: &str) -> bool {
        self.dir.file(&Self::key_file_name(backup_id)).exists().await
    }
}
