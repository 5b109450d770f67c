//! # Decryption Engine
//!
//! Encrypted images are protected in two layers:
//!
//! ```text
//!   recipient RSA key ──OAEP(SHA-256)──► 256-bit content key
//!   content key + nonce + AAD ──AES-256-GCM──► image archive (+ 16-byte tag)
//! ```
//!
//! The wrapped key, nonce, tag and associated data travel together as
//! [`SymmetricKeyMaterial`]. Unwrapping consumes the material and yields a
//! [`DecryptionKey`], whose key bytes are zeroized on drop and which
//! [`decrypt_file`] consumes, so a key is used for exactly one decryption.
//!
//! ## Streaming
//!
//! Images are far larger than memory budgets, so GCM is evaluated
//! incrementally: CTR keystream and GHASH are advanced over fixed 64 KiB
//! chunks and the tag is compared in constant time once the whole
//! ciphertext has been read. Plaintext is written as it is produced; if the
//! tag does not verify, the output file is removed before returning, so
//! unauthenticated plaintext never survives a failed call.

use crate::constants::{AEAD_KEY_LEN, AEAD_NONCE_LEN, AEAD_TAG_LEN, IO_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::storage::remove_path;
use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, generic_array::GenericArray};
use ghash::GHash;
use ghash::universal_hash::UniversalHash;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

// =============================================================================
// Key Material
// =============================================================================

/// Wrapped content key as stored by the registry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKeyMaterial {
    #[serde(with = "hex_bytes")]
    pub encrypted_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub tag: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub associated_data: Vec<u8>,
}

impl fmt::Debug for SymmetricKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKeyMaterial")
            .field("encrypted_key", &format_args!("<{} bytes>", self.encrypted_key.len()))
            .field("nonce", &hex::encode(&self.nonce))
            .field("tag", &hex::encode(&self.tag))
            .field("associated_data", &format_args!("<{} bytes>", self.associated_data.len()))
            .finish()
    }
}

impl SymmetricKeyMaterial {
    /// Unwraps the content key with a PEM private key.
    ///
    /// The wrapped key is dropped as soon as it has been unwrapped.
    pub fn unwrap_with(self, private_key_pem: &str) -> Result<DecryptionKey> {
        let Self {
            encrypted_key,
            nonce,
            tag,
            associated_data,
        } = self;
        let key = unwrap_key(private_key_pem, &encrypted_key)?;
        drop(encrypted_key);
        DecryptionKey::from_parts(&key, &nonce, &tag, associated_data)
    }
}

/// Plaintext content key with its GCM parameters.
pub struct DecryptionKey {
    key: Zeroizing<[u8; AEAD_KEY_LEN]>,
    nonce: [u8; AEAD_NONCE_LEN],
    tag: [u8; AEAD_TAG_LEN],
    associated_data: Vec<u8>,
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("key", &"<redacted>")
            .field("nonce", &hex::encode(self.nonce))
            .field("tag", &hex::encode(self.tag))
            .finish()
    }
}

/// On-disk form of a plaintext key (owner keys).
#[derive(Serialize, Deserialize)]
struct KeyFile {
    #[serde(with = "hex_bytes")]
    key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    tag: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    associated_data: Vec<u8>,
}

impl DecryptionKey {
    pub fn new(
        key: [u8; AEAD_KEY_LEN],
        nonce: [u8; AEAD_NONCE_LEN],
        tag: [u8; AEAD_TAG_LEN],
        associated_data: Vec<u8>,
    ) -> Self {
        Self {
            key: Zeroizing::new(key),
            nonce,
            tag,
            associated_data,
        }
    }

    /// Builds a key from slices, validating every length.
    pub fn from_parts(key: &[u8], nonce: &[u8], tag: &[u8], associated_data: Vec<u8>) -> Result<Self> {
        let mut key_bytes = Zeroizing::new([0u8; AEAD_KEY_LEN]);
        if key.len() != AEAD_KEY_LEN {
            return Err(bad_material("key", AEAD_KEY_LEN, key.len()));
        }
        key_bytes.copy_from_slice(key);
        let nonce: [u8; AEAD_NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| bad_material("nonce", AEAD_NONCE_LEN, nonce.len()))?;
        let tag: [u8; AEAD_TAG_LEN] = tag
            .try_into()
            .map_err(|_| bad_material("tag", AEAD_TAG_LEN, tag.len()))?;
        Ok(Self {
            key: key_bytes,
            nonce,
            tag,
            associated_data,
        })
    }

    /// Reads a key file written by [`DecryptionKey::write_to`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = Zeroizing::new(fs::read_to_string(path)?);
        let file: KeyFile = serde_json::from_str(&text)?;
        let key = Zeroizing::new(file.key);
        Self::from_parts(&key, &file.nonce, &file.tag, file.associated_data)
    }

    /// Writes the key as JSON, readable by the owner only.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = KeyFile {
            key: self.key.to_vec(),
            nonce: self.nonce.to_vec(),
            tag: self.tag.to_vec(),
            associated_data: self.associated_data.clone(),
        };
        let text = Zeroizing::new(serde_json::to_string(&file)?);
        drop(Zeroizing::new(file.key));

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)?.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn nonce(&self) -> &[u8; AEAD_NONCE_LEN] {
        &self.nonce
    }

    pub fn tag(&self) -> &[u8; AEAD_TAG_LEN] {
        &self.tag
    }
}

fn bad_material(field: &str, expected: usize, found: usize) -> Error {
    Error::Decryption {
        path: PathBuf::from("key material"),
        reason: format!("{} should be {} bytes, found {}", field, expected, found),
    }
}

// =============================================================================
// Key Wrapping
// =============================================================================

fn load_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::Decryption {
            path: PathBuf::from("private key"),
            reason: format!("unreadable PEM private key: {}", e),
        })
}

fn load_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::InvalidArgument(format!("unreadable PEM public key: {}", e)))
}

/// Recovers a content key wrapped with RSA-OAEP(SHA-256).
pub fn unwrap_key(private_key_pem: &str, encrypted_key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let private_key = load_private_key(private_key_pem)?;
    private_key
        .decrypt(Oaep::new::<Sha256>(), encrypted_key)
        .map(Zeroizing::new)
        .map_err(|e| Error::Decryption {
            path: PathBuf::from("wrapped container key"),
            reason: format!("key unwrap failed: {}", e),
        })
}

/// Wraps a content key for the holder of `public_key_pem`.
pub fn wrap_key(public_key_pem: &str, key: &[u8]) -> Result<Vec<u8>> {
    let public_key = load_public_key(public_key_pem)?;
    public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key)
        .map_err(|e| Error::Internal(format!("key wrap failed: {}", e)))
}

// =============================================================================
// Streaming AES-256-GCM
// =============================================================================

/// Incremental GCM state: CTR keystream plus GHASH over the ciphertext.
struct GcmStream {
    keystream: Aes256Ctr,
    ghash: GHash,
    tag_mask: [u8; AEAD_TAG_LEN],
    aad_len: u64,
    ct_len: u64,
}

impl GcmStream {
    fn new(key: &[u8; AEAD_KEY_LEN], nonce: &[u8; AEAD_NONCE_LEN], aad: &[u8]) -> Self {
        let aes = Aes256::new(GenericArray::from_slice(key));

        let mut hash_key = GenericArray::default();
        aes.encrypt_block(&mut hash_key);
        let mut ghash = GHash::new(&hash_key);
        ghash.update_padded(aad);

        // J0 = nonce || 0^31 || 1; data starts at inc32(J0).
        let mut counter = [0u8; 16];
        counter[..AEAD_NONCE_LEN].copy_from_slice(nonce);
        counter[15] = 1;
        let mut mask = GenericArray::clone_from_slice(&counter);
        aes.encrypt_block(&mut mask);
        let mut tag_mask = [0u8; AEAD_TAG_LEN];
        tag_mask.copy_from_slice(&mask);

        counter[15] = 2;
        let keystream = Aes256Ctr::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(&counter),
        );

        Self {
            keystream,
            ghash,
            tag_mask,
            aad_len: aad.len() as u64,
            ct_len: 0,
        }
    }

    /// Every chunk but the last must be a multiple of 16 bytes.
    fn decrypt_chunk(&mut self, chunk: &mut [u8]) {
        self.ghash.update_padded(chunk);
        self.ct_len += chunk.len() as u64;
        self.keystream.apply_keystream(chunk);
    }

    fn encrypt_chunk(&mut self, chunk: &mut [u8]) {
        self.keystream.apply_keystream(chunk);
        self.ghash.update_padded(chunk);
        self.ct_len += chunk.len() as u64;
    }

    fn finalize(mut self) -> [u8; AEAD_TAG_LEN] {
        let mut lengths = [0u8; 16];
        lengths[..8].copy_from_slice(&(self.aad_len * 8).to_be_bytes());
        lengths[8..].copy_from_slice(&(self.ct_len * 8).to_be_bytes());
        self.ghash.update(&[GenericArray::clone_from_slice(&lengths)]);

        let digest = self.ghash.finalize();
        let mut tag = [0u8; AEAD_TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = digest[i] ^ self.tag_mask[i];
        }
        tag
    }
}

/// Reads until `buf` is full or the input ends.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Decrypts `input` into `output`, consuming the key.
///
/// Any authentication or I/O failure removes `output` and returns
/// [`Error::Decryption`].
pub fn decrypt_file(key: DecryptionKey, input: &Path, output: &Path) -> Result<()> {
    debug!("Decrypting {} -> {}", input.display(), output.display());
    let result = decrypt_stream(&key, input, output);
    drop(key);

    if let Err(e) = result {
        if let Err(cleanup) = remove_path(output) {
            warn!("Failed to remove partial plaintext {}: {}", output.display(), cleanup);
        }
        return Err(match e {
            e @ Error::Decryption { .. } => e,
            other => Error::Decryption {
                path: input.to_path_buf(),
                reason: other.to_string(),
            },
        });
    }
    Ok(())
}

fn decrypt_stream(key: &DecryptionKey, input: &Path, output: &Path) -> Result<()> {
    let mut reader = fs::File::open(input)?;
    remove_path(output)?;
    let mut writer = fs::File::create(output)?;

    let mut gcm = GcmStream::new(&key.key, &key.nonce, &key.associated_data);
    let mut buf = Zeroizing::new(vec![0u8; IO_CHUNK_SIZE]);
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        gcm.decrypt_chunk(&mut buf[..n]);
        writer.write_all(&buf[..n])?;
        if n < buf.len() {
            break;
        }
    }
    writer.sync_all()?;

    let computed = gcm.finalize();
    if !bool::from(computed[..].ct_eq(&key.tag[..])) {
        return Err(Error::Decryption {
            path: input.to_path_buf(),
            reason: "authentication tag mismatch".to_string(),
        });
    }
    Ok(())
}

/// Encrypts `input` into `output` and returns the authentication tag.
pub fn encrypt_file(
    key: &[u8; AEAD_KEY_LEN],
    nonce: &[u8; AEAD_NONCE_LEN],
    associated_data: &[u8],
    input: &Path,
    output: &Path,
) -> Result<[u8; AEAD_TAG_LEN]> {
    let mut reader = fs::File::open(input)?;
    let mut writer = fs::File::create(output)?;

    let mut gcm = GcmStream::new(key, nonce, associated_data);
    let mut buf = Zeroizing::new(vec![0u8; IO_CHUNK_SIZE]);
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        gcm.encrypt_chunk(&mut buf[..n]);
        writer.write_all(&buf[..n])?;
        if n < buf.len() {
            break;
        }
    }
    writer.sync_all()?;
    Ok(gcm.finalize())
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim()).map_err(serde::de::Error::custom)
    }
}
