//! The in-memory identity: decrypted key cache, hint-lock state, and the
//! policy around when an identity needs re-persisting. Wraps `crate::storage`
//! the way a session wraps a file: the `Container` is the durable truth, this
//! module is what a running client actually signs with.

use crate::crypto::{self, AES_IV_SIZE, KEY_SIZE};
use crate::encoding;
use crate::entropy::EntropyPool;
use crate::error::{Result, SqrlError};
use crate::keys;
use crate::storage::{self, Container, PreviousIdentitiesBlock, RescueBlock, UserAccessBlock};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroize;

/// Fast hint-lock KDF parameters. Deliberately far cheaper than the
/// password/rescue EnScrypt cost — hint-lock exists precisely so a user
/// re-entering the screen doesn't pay the full memory-hard derivation.
const HINT_KDF_ITERATIONS: u32 = 1;
const HINT_KDF_LOG2N: u8 = 9;

/// Which secret unlocked this `User`, and what it produced.
pub enum Credential {
    Password(String),
    RescueCode(String),
}

/// EnScrypt parameters for an in-progress unlock, handed to a caller that
/// wants to run the derivation itself (e.g. on a worker thread) rather than
/// block inside [`User::unlock_with_password`]/[`User::unlock_with_rescue_code`].
#[derive(Debug, Clone)]
pub struct KdfRequest {
    pub salt: [u8; KEY_SIZE],
    pub iterations: u32,
    pub log2n: u8,
}

/// Plaintext key material held only while the identity is unlocked.
/// Zeroized the moment it's no longer needed — on hint-lock, on rekey
/// (the stale copy), and on drop (hold/release reaching zero, or going out
/// of scope).
struct Secrets {
    iuk: Option<[u8; KEY_SIZE]>,
    imk: [u8; KEY_SIZE],
    /// Last `hint_length` characters of the password that unlocked this
    /// identity, cached so an idle-timeout `hint_lock()` doesn't need the
    /// embedder to re-supply it.
    cached_hint: Option<String>,
}

impl Drop for Secrets {
    fn drop(&mut self) {
        if let Some(ref mut iuk) = self.iuk {
            iuk.zeroize();
        }
        self.imk.zeroize();
        if let Some(ref mut hint) = self.cached_hint {
            hint.zeroize();
        }
    }
}

struct HintLock {
    iv: [u8; AES_IV_SIZE],
    ciphertext: Vec<u8>,
}

struct UserState {
    container: Container,
    ilk: [u8; KEY_SIZE],
    unique_id: String,
    secrets: Option<Secrets>,
    hint: Option<HintLock>,
    save_suggested: bool,
    tag: Option<String>,
}

/// A loaded (or freshly generated) SQRL identity. Cheap to clone — this is
/// a handle around shared, mutex-guarded state; the underlying identity is
/// dropped (and its plaintext key material zeroized) once the last clone
/// goes out of scope, which is what `release()` models.
#[derive(Clone)]
pub struct User(Arc<Mutex<UserState>>);

fn random_iv(pool: &EntropyPool) -> [u8; AES_IV_SIZE] {
    pool.bytes(AES_IV_SIZE).try_into().expect("AES_IV_SIZE bytes")
}

fn unique_id_from_ilk(ilk: &[u8; KEY_SIZE]) -> String {
    encoding::base64url_encode(&Sha256::digest(ilk))
}

/// Salt used to derive the password-unlock key. The ILK is public and
/// unique per identity, so it doubles as the EnScrypt salt without needing
/// a redundant field in the block header.
fn password_salt(ilk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    *ilk
}

/// Salt used to derive the rescue-unlock key — domain-separated from the
/// password salt via EnHash so the two KDF chains never collide even
/// though both ultimately key off the same ILK.
fn rescue_salt(ilk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    crypto::en_hash(ilk)
}

fn hint_salt(ilk: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut salt = crypto::en_hash(ilk);
    salt[0] ^= 0xa5; // separate from rescue_salt's use of plain en_hash(ilk)
    salt
}

impl User {
    /// Generates a brand-new identity: a fresh IUK from `pool`, a Type 1
    /// block protecting it under `password`, and a Type 2 block protecting
    /// it under a freshly minted rescue code. Returns the user and the
    /// rescue code formatted as three hyphen-separated groups of eight
    /// digits — the caller MUST show this to the user exactly once.
    pub fn generate(
        pool: &EntropyPool,
        password: &str,
        kdf_millis: u32,
        log2n: u8,
        hint_length: u8,
        timeout_minutes: u16,
    ) -> Result<(User, String)> {
        let iuk = pool.bytes32();
        let imk = keys::identity_master_key(&iuk);
        let ilk = keys::identity_lock_key(&iuk);

        let (iterations, key) = crypto::en_scrypt_millis(password.as_bytes(), &password_salt(&ilk), kdf_millis, log2n);
        let ua = UserAccessBlock::encrypt(&key, random_iv(pool), log2n, iterations, hint_length, timeout_minutes, ilk, &imk)?;

        let entropy: [u8; 64] = pool.bytes(64).try_into().expect("64 bytes");
        let rescue_digits = encoding::rescue_code_from_entropy(&entropy);
        let (r_iterations, r_key) =
            crypto::en_scrypt_millis(rescue_digits.as_bytes(), &rescue_salt(&ilk), kdf_millis, log2n);
        let rescue_block = RescueBlock::encrypt(&r_key, random_iv(pool), log2n, r_iterations, &iuk)?;

        let mut container = Container::default();
        container.set_user_access(ua);
        container.set_rescue(rescue_block);

        let state = UserState {
            container,
            ilk,
            unique_id: unique_id_from_ilk(&ilk),
            secrets: Some(Secrets {
                iuk: Some(iuk),
                imk,
                cached_hint: Some(last_chars(password, hint_length)),
            }),
            hint: None,
            save_suggested: true,
            tag: None,
        };
        Ok((User(Arc::new(Mutex::new(state))), encoding::format_rescue_code(&rescue_digits)))
    }

    /// Loads an identity container without unlocking it. The returned
    /// `User` has a stable `unique_id` (read from the Type 1 block's
    /// public ILK) but holds no plaintext key material until
    /// [`User::unlock_with_password`] or [`User::unlock_with_rescue_code`]
    /// succeeds.
    pub fn load(container: Container) -> Result<User> {
        let ilk = container.user_access().ok_or(SqrlError::Corrupt)?.ilk;
        let state = UserState {
            container,
            ilk,
            unique_id: unique_id_from_ilk(&ilk),
            secrets: None,
            hint: None,
            save_suggested: false,
            tag: None,
        };
        Ok(User(Arc::new(Mutex::new(state))))
    }

    /// Convenience combining [`User::load`] with an immediate unlock —
    /// what most `identity load` actions actually do.
    pub fn load_with(container: Container, credential: Credential) -> Result<User> {
        let user = Self::load(container)?;
        match credential {
            Credential::Password(pw) => user.unlock_with_password(&pw)?,
            Credential::RescueCode(code) => user.unlock_with_rescue_code(&code)?,
        }
        Ok(user)
    }

    pub fn unique_id(&self) -> String {
        self.0.lock().unique_id.clone()
    }

    pub fn has_plaintext_keys(&self) -> bool {
        self.0.lock().secrets.is_some()
    }

    pub fn has_iuk(&self) -> bool {
        self.0.lock().secrets.as_ref().is_some_and(|s| s.iuk.is_some())
    }

    pub fn is_hint_locked(&self) -> bool {
        self.0.lock().hint.is_some()
    }

    /// The embedder-visible options bitmask, persisted alongside the key
    /// material in the container's [`storage::OptionsBlock`]. Defaults to 0
    /// for an identity that has never had one set.
    pub fn options(&self) -> u32 {
        self.0.lock().container.options().options
    }

    pub fn set_options(&self, options: u32) {
        let mut state = self.0.lock();
        let mut block = state.container.options();
        block.options = options;
        state.container.set_options(block);
        state.save_suggested = true;
    }

    /// Reads one entry from the free-form options map (e.g. an embedder's
    /// cached server-friendly-name override), persisted the same way as
    /// [`User::options`].
    pub fn option_kv(&self, key: &str) -> Option<String> {
        self.0.lock().container.options().kv.get(key).cloned()
    }

    pub fn set_option_kv(&self, key: &str, value: &str) {
        let mut state = self.0.lock();
        let mut block = state.container.options();
        block.kv.insert(key.to_string(), value.to_string());
        state.container.set_options(block);
        state.save_suggested = true;
    }

    pub fn tag(&self) -> Option<String> {
        self.0.lock().tag.clone()
    }

    pub fn set_tag(&self, tag: Option<String>) {
        self.0.lock().tag = tag;
    }

    pub fn save_suggested(&self) -> bool {
        self.0.lock().save_suggested
    }

    pub fn clear_save_suggested(&self) {
        self.0.lock().save_suggested = false;
    }

    /// Byte serialization of the current S4 container, ready for the
    /// embedder to persist via whatever filesystem it has.
    pub fn save_to_bytes(&self) -> Vec<u8> {
        self.0.lock().container.to_bytes()
    }

    pub fn save_to_text(&self) -> String {
        self.0.lock().container.to_text()
    }

    /// The EnScrypt parameters needed to unlock the Type 1 block, without
    /// running the (memory-hard, potentially slow) derivation itself.
    /// Callers that want to run EnScrypt off their own thread pool derive
    /// the key from this and pass it to [`User::unlock_with_password_key`]
    /// instead of calling [`User::unlock_with_password`] directly.
    pub fn password_kdf_request(&self) -> Result<KdfRequest> {
        let state = self.0.lock();
        let ua = state.container.user_access().ok_or(SqrlError::Corrupt)?;
        Ok(KdfRequest {
            salt: password_salt(&ua.ilk),
            iterations: ua.iterations,
            log2n: ua.log2n,
        })
    }

    /// Decrypts the Type 1 block and caches the IMK. The ILK was already
    /// known (from the block's plaintext header); this additionally
    /// confirms the password by way of a successful AEAD tag.
    pub fn unlock_with_password(&self, password: &str) -> Result<()> {
        let request = self.password_kdf_request()?;
        let key = crypto::en_scrypt(password.as_bytes(), &request.salt, request.iterations, request.log2n);
        self.unlock_with_password_key(key, password)
    }

    /// Completes a password unlock given an already-derived EnScrypt key,
    /// e.g. one computed on a worker thread from [`User::password_kdf_request`].
    pub fn unlock_with_password_key(&self, key: [u8; KEY_SIZE], password: &str) -> Result<()> {
        let mut state = self.0.lock();
        let ua = state.container.user_access().ok_or(SqrlError::Corrupt)?.clone();
        let imk_bytes = ua.decrypt(&key)?;
        let imk: [u8; KEY_SIZE] = imk_bytes.try_into().map_err(|_| SqrlError::Corrupt)?;
        let cached_hint = Some(last_chars(password, ua.hint_length));
        let existing_iuk = state.secrets.as_ref().and_then(|s| s.iuk);
        state.secrets = Some(Secrets {
            iuk: existing_iuk,
            imk,
            cached_hint,
        });
        state.hint = None;
        Ok(())
    }

    pub fn rescue_kdf_request(&self) -> Result<KdfRequest> {
        let state = self.0.lock();
        let ilk = state.ilk;
        let rb = state.container.rescue().ok_or(SqrlError::Corrupt)?;
        Ok(KdfRequest {
            salt: rescue_salt(&ilk),
            iterations: rb.iterations,
            log2n: rb.log2n,
        })
    }

    /// Decrypts the Type 2 block and caches the IUK (and its derived IMK).
    /// Verifies the recovered IUK actually reproduces this identity's ILK
    /// before accepting it — a corrupt Type 2 block that happens to pass
    /// its own AEAD tag (impossible in practice, but cheap to assert) must
    /// not silently attach the wrong identity.
    pub fn unlock_with_rescue_code(&self, rescue_code: &str) -> Result<()> {
        let request = self.rescue_kdf_request()?;
        let digits: String = rescue_code.chars().filter(|c| c.is_ascii_digit()).collect();
        let key = crypto::en_scrypt(digits.as_bytes(), &request.salt, request.iterations, request.log2n);
        self.unlock_with_rescue_code_key(key)
    }

    /// Completes a rescue-code unlock given an already-derived EnScrypt key.
    pub fn unlock_with_rescue_code_key(&self, key: [u8; KEY_SIZE]) -> Result<()> {
        let mut state = self.0.lock();
        let ilk = state.ilk;
        let rb = state.container.rescue().ok_or(SqrlError::Corrupt)?.clone();
        let iuk_bytes = rb.decrypt(&key)?;
        let iuk: [u8; KEY_SIZE] = iuk_bytes.try_into().map_err(|_| SqrlError::Corrupt)?;
        if keys::identity_lock_key(&iuk) != ilk {
            return Err(SqrlError::Corrupt);
        }
        let imk = keys::identity_master_key(&iuk);
        let cached_hint = state.secrets.as_ref().and_then(|s| s.cached_hint.clone());
        state.secrets = Some(Secrets {
            iuk: Some(iuk),
            imk,
            cached_hint,
        });
        state.hint = None;
        Ok(())
    }

    /// Compresses the cached IMK under the fast hint KDF and drops the
    /// full-strength plaintext. Called by the Client when a user goes idle
    /// past the Type 1 block's `timeout_minutes`.
    pub fn hint_lock(&self, pool: &EntropyPool) -> Result<()> {
        let mut state = self.0.lock();
        let ilk = state.ilk;
        let secrets = match state.secrets.take() {
            Some(s) => s,
            None => return Ok(()),
        };
        let hint = secrets
            .cached_hint
            .clone()
            .ok_or(SqrlError::InternalInvariant("hint_lock requires a cached password hint"))?;
        let iv = random_iv(pool);
        let key = crypto::en_scrypt(hint.as_bytes(), &hint_salt(&ilk), HINT_KDF_ITERATIONS, HINT_KDF_LOG2N);
        let ciphertext = crypto::aead_encrypt(&key, &iv, b"hint-lock", &secrets.imk)?;
        state.hint = Some(HintLock { iv, ciphertext });
        // `secrets` drops here, zeroizing the full-strength IMK/IUK.
        Ok(())
    }

    /// Reverses [`User::hint_lock`] given the same password-suffix hint.
    pub fn hint_unlock(&self, hint: &str) -> Result<()> {
        let mut state = self.0.lock();
        let ilk = state.ilk;
        let lock = state.hint.take().ok_or(SqrlError::InternalInvariant("not hint-locked"))?;
        let key = crypto::en_scrypt(hint.as_bytes(), &hint_salt(&ilk), HINT_KDF_ITERATIONS, HINT_KDF_LOG2N);
        let imk_bytes = match crypto::aead_decrypt(&key, &lock.iv, b"hint-lock", &lock.ciphertext, crate::error::CredentialKind::Hint) {
            Ok(bytes) => bytes,
            Err(err) => {
                state.hint = Some(lock);
                return Err(err);
            }
        };
        let imk: [u8; KEY_SIZE] = imk_bytes.try_into().map_err(|_| SqrlError::Corrupt)?;
        state.secrets = Some(Secrets {
            iuk: None,
            imk,
            cached_hint: Some(hint.to_string()),
        });
        Ok(())
    }

    /// Rotates to a brand-new IUK. Requires the current IUK (unlock with
    /// the rescue code first if the identity was only password-unlocked).
    /// Chains the outgoing IUK into the Type 3 block, encrypted under the
    /// *new* IMK, and re-encrypts Type 1/Type 2 under freshly derived
    /// keys. Returns the new rescue code, which the caller MUST show the
    /// user exactly once — the old rescue code no longer works.
    pub fn rekey(
        &self,
        pool: &EntropyPool,
        password: &str,
        kdf_millis: u32,
        log2n: u8,
        hint_length: u8,
        timeout_minutes: u16,
    ) -> Result<String> {
        let mut state = self.0.lock();
        let old_iuk = state
            .secrets
            .as_ref()
            .and_then(|s| s.iuk)
            .ok_or(SqrlError::InternalInvariant("rekey requires the current IUK"))?;

        let new_iuk = pool.bytes32();
        let new_imk = keys::identity_master_key(&new_iuk);
        let new_ilk = keys::identity_lock_key(&new_iuk);

        let mut previous = state.container.previous_identities().cloned().unwrap_or_default();
        previous.push(&new_imk, random_iv(pool), &old_iuk)?;
        state.container.set_previous_identities(previous);

        let (iterations, key) = crypto::en_scrypt_millis(password.as_bytes(), &password_salt(&new_ilk), kdf_millis, log2n);
        let ua = UserAccessBlock::encrypt(&key, random_iv(pool), log2n, iterations, hint_length, timeout_minutes, new_ilk, &new_imk)?;
        state.container.set_user_access(ua);

        let entropy: [u8; 64] = pool.bytes(64).try_into().expect("64 bytes");
        let rescue_digits = encoding::rescue_code_from_entropy(&entropy);
        let (r_iterations, r_key) =
            crypto::en_scrypt_millis(rescue_digits.as_bytes(), &rescue_salt(&new_ilk), kdf_millis, log2n);
        let rescue_block = RescueBlock::encrypt(&r_key, random_iv(pool), log2n, r_iterations, &new_iuk)?;
        state.container.set_rescue(rescue_block);

        state.ilk = new_ilk;
        state.unique_id = unique_id_from_ilk(&new_ilk);
        let cached_hint = Some(last_chars(password, hint_length));
        state.secrets = Some(Secrets {
            iuk: Some(new_iuk),
            imk: new_imk,
            cached_hint,
        });
        state.hint = None;
        state.save_suggested = true;
        Ok(encoding::format_rescue_code(&rescue_digits))
    }

    /// Re-encrypts the Type 1 block under a new password without rotating
    /// the IUK/ILK. Requires the identity currently be password- or
    /// rescue-unlocked (the IMK must be in hand).
    pub fn change_password(&self, pool: &EntropyPool, new_password: &str, kdf_millis: u32, log2n: u8) -> Result<()> {
        let mut state = self.0.lock();
        let ilk = state.ilk;
        let (hint_length, timeout_minutes) = state
            .container
            .user_access()
            .map(|u| (u.hint_length, u.timeout_minutes))
            .ok_or(SqrlError::Corrupt)?;
        let imk = state
            .secrets
            .as_ref()
            .map(|s| s.imk)
            .ok_or(SqrlError::InternalInvariant("change_password requires the IMK"))?;

        let (iterations, key) = crypto::en_scrypt_millis(new_password.as_bytes(), &password_salt(&ilk), kdf_millis, log2n);
        let ua = UserAccessBlock::encrypt(&key, random_iv(pool), log2n, iterations, hint_length, timeout_minutes, ilk, &imk)?;
        state.container.set_user_access(ua);
        if let Some(secrets) = state.secrets.as_mut() {
            secrets.cached_hint = Some(last_chars(new_password, hint_length));
        }
        state.save_suggested = true;
        Ok(())
    }

    /// Increments the reference count by returning another handle to the
    /// same identity. Mirrors `hold()`/`release()` in the source library;
    /// in Rust the reference count IS `Arc`'s strong count.
    pub fn hold(&self) -> User {
        User(Arc::clone(&self.0))
    }

    /// Drops this handle. Once the last handle is dropped, the identity's
    /// plaintext key material is zeroized as part of `UserState`'s own
    /// `Drop` (via `Secrets`'s `Drop` impl) — there is nothing else to do
    /// here, which is the point: Rust's ownership model makes "forgot to
    /// release" unrepresentable.
    pub fn release(self) {
        drop(self);
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn container(&self) -> Container {
        self.0.lock().container.clone()
    }

    /// Derives the per-site Ed25519 keypair for `domain` from the cached
    /// IMK. Never persisted — recomputed from the IMK on every
    /// authentication, the way a running client actually signs with it.
    pub fn site_keypair(&self, domain: &str) -> Result<(ed25519_dalek::SigningKey, [u8; KEY_SIZE])> {
        let imk = self.imk()?;
        Ok(keys::site_keypair(&imk, domain.as_bytes()))
    }

    pub(crate) fn imk(&self) -> Result<[u8; KEY_SIZE]> {
        self.0
            .lock()
            .secrets
            .as_ref()
            .map(|s| s.imk)
            .ok_or(SqrlError::InternalInvariant("identity is locked"))
    }

    pub(crate) fn iuk(&self) -> Result<[u8; KEY_SIZE]> {
        self.0
            .lock()
            .secrets
            .as_ref()
            .and_then(|s| s.iuk)
            .ok_or(SqrlError::InternalInvariant("IUK not available; unlock with the rescue code"))
    }

    pub(crate) fn ilk(&self) -> [u8; KEY_SIZE] {
        self.0.lock().ilk
    }
}

fn last_chars(s: &str, n: u8) -> String {
    let n = n as usize;
    let chars: Vec<char> = s.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> EntropyPool {
        EntropyPool::new()
    }

    #[test]
    fn generate_then_unlock_password_round_trip() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "correct horse battery staple", 20, 9, 4, 15).unwrap();
        let bytes = user.save_to_bytes();

        let loaded = User::load(Container::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(loaded.unique_id(), user.unique_id());
        loaded.unlock_with_password("correct horse battery staple").unwrap();
        assert!(loaded.has_plaintext_keys());
    }

    #[test]
    fn unlock_via_split_kdf_request_matches_direct_unlock() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "hunter2", 20, 9, 4, 15).unwrap();
        let bytes = user.save_to_bytes();

        let loaded = User::load(Container::from_bytes(&bytes).unwrap()).unwrap();
        let request = loaded.password_kdf_request().unwrap();
        let key = crypto::en_scrypt(b"hunter2", &request.salt, request.iterations, request.log2n);
        loaded.unlock_with_password_key(key, "hunter2").unwrap();
        assert_eq!(loaded.imk().unwrap(), user.imk().unwrap());
    }

    #[test]
    fn generate_then_unlock_rescue_code_round_trip() {
        let pool = pool();
        let (user, rescue) = User::generate(&pool, "pw", 20, 9, 4, 15).unwrap();
        let bytes = user.save_to_bytes();

        let loaded = User::load(Container::from_bytes(&bytes).unwrap()).unwrap();
        loaded.unlock_with_rescue_code(&rescue).unwrap();
        assert!(loaded.has_iuk());
        assert_eq!(loaded.unique_id(), user.unique_id());
    }

    #[test]
    fn wrong_password_is_bad_password_and_does_not_mutate_container() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "pw", 20, 9, 4, 15).unwrap();
        let before = user.save_to_bytes();
        let err = user.unlock_with_password("wrong password").unwrap_err();
        assert!(matches!(err, SqrlError::BadPassword));
        assert_eq!(user.save_to_bytes(), before);
    }

    #[test]
    fn wrong_rescue_code_is_bad_rescue_code() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "pw", 20, 9, 4, 15).unwrap();
        let err = user.unlock_with_rescue_code("000000000000000000000000").unwrap_err();
        assert!(matches!(err, SqrlError::BadRescueCode | SqrlError::Corrupt));
    }

    #[test]
    fn hint_lock_then_unlock_recovers_imk() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "my-password", 20, 9, 4, 15).unwrap();
        let imk_before = user.imk().unwrap();

        user.hint_lock(&pool).unwrap();
        assert!(!user.has_plaintext_keys());
        assert!(user.is_hint_locked());

        user.hint_unlock("word").unwrap(); // last 4 chars of "my-password"
        assert!(user.has_plaintext_keys());
        assert_eq!(user.imk().unwrap(), imk_before);
    }

    #[test]
    fn hint_unlock_with_wrong_hint_fails_and_remains_locked() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "my-password", 20, 9, 4, 15).unwrap();
        user.hint_lock(&pool).unwrap();
        let err = user.hint_unlock("nope").unwrap_err();
        assert!(matches!(err, SqrlError::BadHint));
        assert!(user.is_hint_locked());
    }

    #[test]
    fn rekey_changes_unique_id_and_chains_previous_identity() {
        let pool = pool();
        let (user, rescue) = User::generate(&pool, "pw", 20, 9, 4, 15).unwrap();
        user.unlock_with_rescue_code(&rescue).unwrap();
        let old_unique_id = user.unique_id();

        let new_rescue = user.rekey(&pool, "new-pw", 20, 9, 4, 15).unwrap();
        assert_ne!(user.unique_id(), old_unique_id);
        assert_ne!(new_rescue, rescue);

        let bytes = user.save_to_bytes();
        let container = Container::from_bytes(&bytes).unwrap();
        assert_eq!(container.previous_identities().unwrap().entries.len(), 1);

        let reloaded = User::load(container).unwrap();
        reloaded.unlock_with_password("new-pw").unwrap();
        assert_eq!(reloaded.unique_id(), user.unique_id());
    }

    #[test]
    fn rekey_without_iuk_fails() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "pw", 20, 9, 4, 15).unwrap();
        user.hint_lock(&pool).unwrap();
        // IUK was zeroized by hint_lock and never re-derived from a
        // password-only unlock, so rekey must refuse.
        let fresh = User::load(Container::from_bytes(&user.save_to_bytes()).unwrap()).unwrap();
        fresh.unlock_with_password("pw").unwrap();
        let err = fresh.rekey(&pool, "pw2", 20, 9, 4, 15).unwrap_err();
        assert!(matches!(err, SqrlError::InternalInvariant(_)));
    }

    #[test]
    fn change_password_preserves_unique_id() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "old-pw", 20, 9, 4, 15).unwrap();
        let unique_id = user.unique_id();
        user.change_password(&pool, "new-pw", 20, 9).unwrap();
        assert_eq!(user.unique_id(), unique_id);

        let bytes = user.save_to_bytes();
        let reloaded = User::load(Container::from_bytes(&bytes).unwrap()).unwrap();
        assert!(reloaded.unlock_with_password("old-pw").is_err());
        reloaded.unlock_with_password("new-pw").unwrap();
        assert_eq!(reloaded.unique_id(), unique_id);
    }

    #[test]
    fn hold_and_release_share_state_and_zeroize_on_last_drop() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "pw", 20, 9, 4, 15).unwrap();
        let held = user.hold();
        assert_eq!(user.ref_count(), 2);
        held.release();
        assert_eq!(user.ref_count(), 1);
    }

    #[test]
    fn options_and_kv_persist_across_save_and_reload() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "pw", 20, 9, 4, 15).unwrap();
        user.set_options(0b11);
        user.set_option_kv("sfn_override", "Example Site");

        let bytes = user.save_to_bytes();
        let reloaded = User::load(Container::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(reloaded.options(), 0b11);
        assert_eq!(reloaded.option_kv("sfn_override").as_deref(), Some("Example Site"));
    }

    #[test]
    fn save_suggested_set_on_generate_and_clearable() {
        let pool = pool();
        let (user, _rescue) = User::generate(&pool, "pw", 20, 9, 4, 15).unwrap();
        assert!(user.save_suggested());
        user.clear_save_suggested();
        assert!(!user.save_suggested());
    }
}
