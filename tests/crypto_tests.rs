//! Tests for the decryption engine.
//!
//! Validates streaming AES-256-GCM against a reference implementation,
//! tamper detection, cleanup of partial plaintext and RSA key wrapping.

mod common;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use cubexec::crypto::{self, DecryptionKey, SymmetricKeyMaterial};
use cubexec::Error;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const KEY: [u8; 32] = [0x42; 32];
const NONCE: [u8; 12] = [0x24; 12];
const AAD: &[u8] = b"container 42";

fn encrypt_to(dir: &Path, plaintext: &[u8]) -> (std::path::PathBuf, [u8; 16]) {
    let plain = dir.join("plain");
    let cipher = dir.join("cipher");
    fs::write(&plain, plaintext).unwrap();
    let tag = crypto::encrypt_file(&KEY, &NONCE, AAD, &plain, &cipher).unwrap();
    (cipher, tag)
}

fn flip_byte(path: &Path, index: usize) {
    let mut data = fs::read(path).unwrap();
    data[index] ^= 0x01;
    fs::write(path, data).unwrap();
}

/// Spans several read chunks with a ragged tail.
fn large_plaintext() -> Vec<u8> {
    (0..200_003u32).map(|i| (i % 251) as u8).collect()
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_round_trip_multi_chunk() {
    let dir = TempDir::new().unwrap();
    let plaintext = large_plaintext();
    let (cipher, tag) = encrypt_to(dir.path(), &plaintext);
    let output = dir.path().join("decrypted");

    crypto::decrypt_file(DecryptionKey::new(KEY, NONCE, tag, AAD.to_vec()), &cipher, &output)
        .unwrap();

    assert_eq!(fs::read(&output).unwrap(), plaintext);
}

#[test]
fn test_round_trip_empty_file() {
    let dir = TempDir::new().unwrap();
    let (cipher, tag) = encrypt_to(dir.path(), b"");
    let output = dir.path().join("decrypted");

    crypto::decrypt_file(DecryptionKey::new(KEY, NONCE, tag, AAD.to_vec()), &cipher, &output)
        .unwrap();

    assert!(fs::read(&output).unwrap().is_empty());
}

// =============================================================================
// Reference Implementation Tests
// =============================================================================

#[test]
fn test_matches_reference_gcm() {
    let dir = TempDir::new().unwrap();
    let plaintext = large_plaintext();
    let (cipher, tag) = encrypt_to(dir.path(), &plaintext);

    let reference = Aes256Gcm::new_from_slice(&KEY)
        .unwrap()
        .encrypt(
            Nonce::from_slice(&NONCE),
            Payload {
                msg: &plaintext,
                aad: AAD,
            },
        )
        .unwrap();
    let (expected_cipher, expected_tag) = reference.split_at(plaintext.len());

    assert_eq!(fs::read(&cipher).unwrap(), expected_cipher, "ciphertext should match");
    assert_eq!(&tag[..], expected_tag, "tag should match");
}

#[test]
fn test_decrypts_reference_ciphertext() {
    let dir = TempDir::new().unwrap();
    let plaintext = b"docker save archive bytes".to_vec();
    let sealed = Aes256Gcm::new_from_slice(&KEY)
        .unwrap()
        .encrypt(
            Nonce::from_slice(&NONCE),
            Payload {
                msg: &plaintext,
                aad: AAD,
            },
        )
        .unwrap();
    let (body, tag) = sealed.split_at(plaintext.len());
    let cipher = dir.path().join("cipher");
    let output = dir.path().join("decrypted");
    fs::write(&cipher, body).unwrap();

    let key = DecryptionKey::from_parts(&KEY, &NONCE, tag, AAD.to_vec()).unwrap();
    crypto::decrypt_file(key, &cipher, &output).unwrap();

    assert_eq!(fs::read(&output).unwrap(), plaintext);
}

// =============================================================================
// Tamper Detection Tests
// =============================================================================

#[test]
fn test_flipped_ciphertext_rejected_and_output_removed() {
    let dir = TempDir::new().unwrap();
    let (cipher, tag) = encrypt_to(dir.path(), &large_plaintext());
    flip_byte(&cipher, 100_000);
    let output = dir.path().join("decrypted");

    let err = crypto::decrypt_file(DecryptionKey::new(KEY, NONCE, tag, AAD.to_vec()), &cipher, &output)
        .unwrap_err();

    assert!(matches!(err, Error::Decryption { .. }));
    assert!(!output.exists(), "partial plaintext should be removed");
}

#[test]
fn test_flipped_tag_rejected() {
    let dir = TempDir::new().unwrap();
    let (cipher, mut tag) = encrypt_to(dir.path(), b"payload");
    tag[15] ^= 0x80;
    let output = dir.path().join("decrypted");

    let err = crypto::decrypt_file(DecryptionKey::new(KEY, NONCE, tag, AAD.to_vec()), &cipher, &output)
        .unwrap_err();

    assert!(matches!(err, Error::Decryption { .. }));
    assert!(!output.exists());
}

#[test]
fn test_wrong_associated_data_rejected() {
    let dir = TempDir::new().unwrap();
    let (cipher, tag) = encrypt_to(dir.path(), b"payload");
    let output = dir.path().join("decrypted");

    let result = crypto::decrypt_file(
        DecryptionKey::new(KEY, NONCE, tag, b"container 43".to_vec()),
        &cipher,
        &output,
    );

    assert!(result.is_err());
    assert!(!output.exists());
}

#[test]
fn test_missing_input_reported_as_decryption_error() {
    let dir = TempDir::new().unwrap();
    let err = crypto::decrypt_file(
        DecryptionKey::new(KEY, NONCE, [0; 16], Vec::new()),
        &dir.path().join("missing"),
        &dir.path().join("out"),
    )
    .unwrap_err();

    assert!(matches!(err, Error::Decryption { .. }));
}

// =============================================================================
// Key Material Tests
// =============================================================================

#[test]
fn test_from_parts_validates_lengths() {
    assert!(DecryptionKey::from_parts(&[0; 16], &NONCE, &[0; 16], Vec::new()).is_err());
    assert!(DecryptionKey::from_parts(&KEY, &[0; 8], &[0; 16], Vec::new()).is_err());
    assert!(DecryptionKey::from_parts(&KEY, &NONCE, &[0; 12], Vec::new()).is_err());
}

#[test]
fn test_key_debug_is_redacted() {
    let key = DecryptionKey::new(KEY, NONCE, [0; 16], Vec::new());
    let debug = format!("{:?}", key);

    assert!(debug.contains("redacted"));
    assert!(!debug.contains(&hex::encode(KEY)), "key bytes should never be printed");
}

#[test]
fn test_key_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let (cipher, tag) = encrypt_to(dir.path(), b"owner payload");
    let path = dir.path().join("keys/ca/42.key");

    DecryptionKey::new(KEY, NONCE, tag, AAD.to_vec()).write_to(&path).unwrap();
    let key = DecryptionKey::from_file(&path).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0, "key file should be private to the owner");
    }

    let output = dir.path().join("decrypted");
    crypto::decrypt_file(key, &cipher, &output).unwrap();
    assert_eq!(fs::read(&output).unwrap(), b"owner payload");
}

// =============================================================================
// Key Wrapping Tests
// =============================================================================

#[test]
fn test_wrap_unwrap_round_trip() {
    let (private_pem, public_pem) = common::rsa_pair();

    let wrapped = crypto::wrap_key(&public_pem, &KEY).unwrap();
    let unwrapped = crypto::unwrap_key(&private_pem, &wrapped).unwrap();

    assert_ne!(wrapped.as_slice(), &KEY[..]);
    assert_eq!(unwrapped.as_slice(), &KEY[..]);
}

#[test]
fn test_unwrap_with_other_key_fails() {
    let (_, public_pem) = common::rsa_pair();
    let (other_private, _) = common::rsa_pair();

    let wrapped = crypto::wrap_key(&public_pem, &KEY).unwrap();
    let err = crypto::unwrap_key(&other_private, &wrapped).unwrap_err();

    assert!(matches!(err, Error::Decryption { .. }));
}

#[test]
fn test_material_unwraps_to_working_key() {
    let dir = TempDir::new().unwrap();
    let (private_pem, public_pem) = common::rsa_pair();
    let (cipher, tag) = encrypt_to(dir.path(), b"registry payload");

    let material = SymmetricKeyMaterial {
        encrypted_key: crypto::wrap_key(&public_pem, &KEY).unwrap(),
        nonce: NONCE.to_vec(),
        tag: tag.to_vec(),
        associated_data: AAD.to_vec(),
    };
    let key = material.unwrap_with(&private_pem).unwrap();

    let output = dir.path().join("decrypted");
    crypto::decrypt_file(key, &cipher, &output).unwrap();
    assert_eq!(fs::read(&output).unwrap(), b"registry payload");
}

#[test]
fn test_garbage_pem_rejected() {
    let err = crypto::unwrap_key("not a pem", &[0; 128]).unwrap_err();
    assert!(err.to_string().contains("PEM"));
}
