//! Key hierarchy: IMK/ILK from IUK, and the RLK/SUK/VUK/URSK relationship
//! that lets a server bind a new unlock key during rekey/recovery without
//! ever seeing the IUK itself. See `crate::crypto` for the primitives this
//! is built from.

use crate::crypto::{self, KEY_SIZE};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// `EnHash(iuk)` — the per-site derivation root.
pub fn identity_master_key(iuk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    crypto::en_hash(iuk)
}

/// Public counterpart to the IUK on Curve25519: `basepoint * clamp(iuk)`.
/// Stored in the Type 1 block's plaintext header so a server can bind a
/// fresh VUK to this identity when the user rekeys.
pub fn identity_lock_key(iuk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let secret = crypto::clamp_scalar(*iuk);
    crypto::curve_public(&secret)
}

/// A fresh ephemeral Curve25519 scalar, generated per authentication.
pub fn random_lock_key(entropy: [u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    entropy
}

/// `basepoint * rlk` — the value the server stores so it can later compute
/// the shared point with ILK to verify an unlock request.
pub fn server_unlock_key(rlk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let secret = crypto::clamp_scalar(*rlk);
    crypto::curve_public(&secret)
}

/// `Ed25519_public(DH(ilk, rlk))` interpreted as an Ed25519 seed — the
/// public key the server stores to verify a future unlock/rekey request.
pub fn verify_unlock_key(ilk: &[u8; KEY_SIZE], rlk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let rlk_secret = crypto::clamp_scalar(*rlk);
    let shared = crypto::curve_dh(&rlk_secret, ilk);
    let (_, public) = crypto::ed25519_from_seed(&shared);
    public
}

/// `Ed25519_seed(DH(suk, iuk))` — the private signing key the client uses
/// to prove it holds the IUK when submitting an unlock/rekey request.
/// Round-trips with [`verify_unlock_key`]: signing with this key and
/// verifying against `verify_unlock_key(ilk, rlk)` MUST succeed, since
/// `DH(suk, iuk) == DH(ilk, rlk)` — both sides compute `basepoint * rlk *
/// iuk` via different factorings of the same Diffie-Hellman product.
pub fn unlock_request_signing_key(suk: &[u8; KEY_SIZE], iuk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let iuk_secret = crypto::clamp_scalar(*iuk);
    crypto::curve_dh(&iuk_secret, suk)
}

/// Returns the Ed25519 signing key and public key for the unlock request,
/// ready to sign with.
pub fn unlock_request_keypair(
    suk: &[u8; KEY_SIZE],
    iuk: &[u8; KEY_SIZE],
) -> (ed25519_dalek::SigningKey, [u8; KEY_SIZE]) {
    let seed = unlock_request_signing_key(suk, iuk);
    crypto::ed25519_from_seed(&seed)
}

type HmacSha256 = Hmac<Sha256>;

/// Derives the deterministic, never-persisted per-site Ed25519 keypair for
/// domain `site`: `HMAC-SHA256(imk, site)` reduced to an Ed25519 seed.
pub fn site_keypair(imk: &[u8; KEY_SIZE], site: &[u8]) -> (ed25519_dalek::SigningKey, [u8; KEY_SIZE]) {
    let mut mac = HmacSha256::new_from_slice(imk).expect("HMAC accepts any key length");
    mac.update(site);
    let seed: [u8; KEY_SIZE] = mac.finalize().into_bytes().into();
    crypto::ed25519_from_seed(&seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_lock_round_trip_ursk_matches_vuk() {
        let iuk = [42u8; KEY_SIZE];
        let rlk = [7u8; KEY_SIZE];
        let ilk = identity_lock_key(&iuk);
        let suk = server_unlock_key(&rlk);
        let vuk = verify_unlock_key(&ilk, &rlk);
        let (ursk_signing, ursk_public) = unlock_request_keypair(&suk, &iuk);

        assert_eq!(ursk_public, vuk);

        let message = b"unlock request";
        let signature = crypto::sign(&ursk_signing, message);
        assert!(crypto::verify(&vuk, message, &signature));
    }

    #[test]
    fn identity_lock_round_trip_holds_for_many_iuks() {
        for seed in 0u8..8 {
            let iuk = [seed.wrapping_mul(17).wrapping_add(1); KEY_SIZE];
            let rlk = [seed.wrapping_mul(31).wrapping_add(3); KEY_SIZE];
            let ilk = identity_lock_key(&iuk);
            let suk = server_unlock_key(&rlk);
            let vuk = verify_unlock_key(&ilk, &rlk);
            let (_, ursk_public) = unlock_request_keypair(&suk, &iuk);
            assert_eq!(ursk_public, vuk, "mismatch for seed {seed}");
        }
    }

    #[test]
    fn site_keypair_is_deterministic_and_site_specific() {
        let imk = [9u8; KEY_SIZE];
        let (_, pub_a1) = site_keypair(&imk, b"example.com");
        let (_, pub_a2) = site_keypair(&imk, b"example.com");
        let (_, pub_b) = site_keypair(&imk, b"other.example");
        assert_eq!(pub_a1, pub_a2);
        assert_ne!(pub_a1, pub_b);
    }

    #[test]
    fn identity_master_key_matches_en_hash() {
        let iuk = [5u8; KEY_SIZE];
        assert_eq!(identity_master_key(&iuk), crypto::en_hash(&iuk));
    }
}
