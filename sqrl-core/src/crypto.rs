//! Low-level cryptographic primitives: EnHash, EnScrypt, AEAD framing and the
//! Curve25519/Ed25519 building blocks the key hierarchy in [`crate::keys`] is
//! built from. Every function here is pure — no hidden state, no I/O.

use crate::error::{CredentialKind, Result, SqrlError};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key as AesKey, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

pub const KEY_SIZE: usize = 32;
pub const SIG_SIZE: usize = 64;
pub const AES_IV_SIZE: usize = 12;
pub const AES_TAG_SIZE: usize = 16;

/// 16-round SHA-256 XOR-fold. The reduction the rest of the key hierarchy
/// leans on to turn the root secret (IUK) into the master key (IMK).
pub fn en_hash(input: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut state = *input;
    let mut accumulator = [0u8; KEY_SIZE];
    for _ in 0..16 {
        state = Sha256::digest(state).into();
        for (acc, s) in accumulator.iter_mut().zip(state.iter()) {
            *acc ^= s;
        }
    }
    accumulator
}

fn scrypt_params(log2n: u8) -> scrypt::Params {
    // r=256, p=1 are fixed by the protocol; only the cost exponent varies.
    scrypt::Params::new(log2n, 256, 1, KEY_SIZE)
        .expect("log2n in valid scrypt parameter range")
}

fn scrypt_round(password: &[u8], salt: &[u8], log2n: u8) -> [u8; KEY_SIZE] {
    let params = scrypt_params(log2n);
    let mut out = [0u8; KEY_SIZE];
    scrypt::scrypt(password, salt, &params, &mut out).expect("32-byte output is always valid");
    out
}

/// Chained-scrypt memory-hard KDF: `iterations` rounds, each round's salt is
/// the previous round's output, accumulated by XOR.
pub fn en_scrypt(password: &[u8], salt: &[u8], iterations: u32, log2n: u8) -> [u8; KEY_SIZE] {
    let mut accumulator = [0u8; KEY_SIZE];
    let mut chained_salt = salt.to_vec();
    for _ in 0..iterations.max(1) {
        let round = scrypt_round(password, &chained_salt, log2n);
        for (acc, r) in accumulator.iter_mut().zip(round.iter()) {
            *acc ^= r;
        }
        chained_salt = round.to_vec();
    }
    accumulator
}

/// Same chain as [`en_scrypt`], but checked against `cancel` between rounds
/// so a caller on a worker thread can abort within roughly one scrypt round.
/// Returns `None` if cancelled before completion.
pub fn en_scrypt_cancellable(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    log2n: u8,
    cancel: &AtomicBool,
) -> Option<[u8; KEY_SIZE]> {
    let mut accumulator = [0u8; KEY_SIZE];
    let mut chained_salt = salt.to_vec();
    for _ in 0..iterations.max(1) {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        let round = scrypt_round(password, &chained_salt, log2n);
        for (acc, r) in accumulator.iter_mut().zip(round.iter()) {
            *acc ^= r;
        }
        chained_salt = round.to_vec();
    }
    Some(accumulator)
}

/// Runs the EnScrypt chain for roughly `millis` wall-clock milliseconds and
/// returns the iteration count reached. Calling [`en_scrypt`] again with that
/// count reproduces the same output — the two functions share one inner loop.
pub fn en_scrypt_millis(password: &[u8], salt: &[u8], millis: u32, log2n: u8) -> (u32, [u8; KEY_SIZE]) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(millis as u64);
    let mut accumulator = [0u8; KEY_SIZE];
    let mut chained_salt = salt.to_vec();
    let mut count: u32 = 0;
    loop {
        let round = scrypt_round(password, &chained_salt, log2n);
        for (acc, r) in accumulator.iter_mut().zip(round.iter()) {
            *acc ^= r;
        }
        chained_salt = round.to_vec();
        count += 1;
        if std::time::Instant::now() >= deadline {
            break;
        }
    }
    (count, accumulator)
}

/// Encrypts `plaintext` under AES-256-GCM with `aad` as additional
/// authenticated data. Returns ciphertext with the 16-byte tag appended.
pub fn aead_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; AES_IV_SIZE], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| SqrlError::InternalInvariant("aes-gcm encryption failed"))
}

/// Decrypts and verifies `ciphertext` (tag appended). A tag mismatch is
/// reported as `credential`'s corresponding error — see
/// [`SqrlError::from_tag_mismatch`] for why this must not leak which.
pub fn aead_decrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; AES_IV_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
    credential: CredentialKind,
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| SqrlError::from_tag_mismatch(credential))
}

/// Clamps a 32-byte scalar per RFC 7748 and wraps it as a Curve25519 static
/// secret — the representation IUK, RLK and friends are all transported in.
pub fn clamp_scalar(bytes: [u8; KEY_SIZE]) -> StaticSecret {
    StaticSecret::from(bytes)
}

pub fn curve_public(secret: &StaticSecret) -> [u8; KEY_SIZE] {
    XPublicKey::from(secret).to_bytes()
}

/// Curve25519 Diffie-Hellman: `secret`'s scalar times `public_point`.
pub fn curve_dh(secret: &StaticSecret, public_point: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let public = XPublicKey::from(*public_point);
    secret.diffie_hellman(&public).to_bytes()
}

/// Interprets 32 bytes as an Ed25519 seed and returns the signing key plus
/// its public key bytes.
pub fn ed25519_from_seed(seed: &[u8; KEY_SIZE]) -> (SigningKey, [u8; KEY_SIZE]) {
    let signing = SigningKey::from_bytes(seed);
    let public = signing.verifying_key().to_bytes();
    (signing, public)
}

pub fn sign(signing: &SigningKey, message: &[u8]) -> [u8; SIG_SIZE] {
    signing.sign(message).to_bytes()
}

pub fn verify(public: &[u8; KEY_SIZE], message: &[u8], signature: &[u8; SIG_SIZE]) -> bool {
    let Ok(verifying) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    verifying.verify_strict(message, &sig).is_ok()
}
