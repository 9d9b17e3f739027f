//! The S4 identity container: an ordered sequence of typed, length-prefixed
//! blocks, each individually AES-GCM-encrypted with its own plaintext header
//! as additional authenticated data. See `crate::user` for the decrypted
//! in-memory representation this format round-trips through.
//!
//! Block layout on the wire: `u16 length` (the whole block, including this
//! field and the type tag) `|| u16 type || body`. `body` for the three
//! canonical types starts with a fixed-offset plaintext header — used
//! verbatim as AEAD additional data — followed by the AES-GCM ciphertext
//! (tag appended). Blocks of unrecognized type are round-tripped verbatim.

use crate::crypto::{self, AES_IV_SIZE, KEY_SIZE};
use crate::error::{CredentialKind, Result, SqrlError};
use std::collections::BTreeMap;
use tracing::warn;

pub const BLOCK_TYPE_USER_ACCESS: u16 = 1;
pub const BLOCK_TYPE_RESCUE: u16 = 2;
pub const BLOCK_TYPE_PREVIOUS_IDENTITIES: u16 = 3;
pub const BLOCK_TYPE_OPTIONS: u16 = 4;

pub const MAX_PREVIOUS_IDENTITIES: usize = 4;

/// Embedder-visible, unencrypted identity options: the `options` bitmask
/// named in §3 plus a free-form string map for whatever an embedder wants to
/// keep attached to the identity without round-tripping through its own
/// storage. Modeled on the teacher's `guard-core::settings`/`VaultPayload`
/// pair — a `serde`-derived struct serialized as JSON, with a `Default`
/// loaded when the block is absent rather than treating its absence as
/// corruption.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OptionsBlock {
    #[serde(default)]
    pub options: u32,
    #[serde(default)]
    pub kv: BTreeMap<String, String>,
}

impl OptionsBlock {
    fn to_body(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("OptionsBlock always serializes")
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Type 1: password-protected IMK + ILK, plus the scrypt parameters and
/// hint-lock policy needed to reproduce the password KDF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccessBlock {
    pub log2n: u8,
    pub iterations: u32,
    pub hint_length: u8,
    pub timeout_minutes: u16,
    pub iv: [u8; AES_IV_SIZE],
    /// The Identity Lock Key, carried in the plaintext header (and thus the
    /// AEAD's additional data) since it is public by definition — a server
    /// needs it to bind a VUK without the user entering a password. The
    /// encrypted payload below still carries it too, so a successful
    /// decrypt attests that the plaintext copy wasn't tampered with
    /// independently of the header-is-AAD guarantee.
    pub ilk: [u8; KEY_SIZE],
    /// `AES-GCM(key = EnScrypt(password, ...), plaintext = IMK)`, tag
    /// appended. ILK does not need to live in the ciphertext too — it's
    /// already authenticated as part of the header/AAD above.
    pub ciphertext: Vec<u8>,
}

/// Type 2: the IUK, protected by the rescue code instead of the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueBlock {
    pub log2n: u8,
    pub iterations: u32,
    pub iv: [u8; AES_IV_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Type 3: up to four prior IUKs, newest first, each encrypted under the
/// *current* IMK (not the password or rescue code) so a rekey doesn't need
/// to re-prompt the user to retain recovery continuity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreviousIdentitiesBlock {
    pub entries: Vec<PreviousIdentityEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousIdentityEntry {
    pub iv: [u8; AES_IV_SIZE],
    pub ciphertext: Vec<u8>,
}

/// A block whose type this crate doesn't know how to interpret. Preserved
/// verbatim across parse/emit so an older client doesn't silently drop a
/// newer client's extension data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBlock {
    pub block_type: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    UserAccess(UserAccessBlock),
    Rescue(RescueBlock),
    PreviousIdentities(PreviousIdentitiesBlock),
    Options(OptionsBlock),
    Unknown(UnknownBlock),
}

fn header_aad(block_type: u16, header_tail: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(2 + header_tail.len());
    aad.extend_from_slice(&block_type.to_le_bytes());
    aad.extend_from_slice(header_tail);
    aad
}

impl UserAccessBlock {
    fn header_tail(&self) -> Vec<u8> {
        let mut h = Vec::with_capacity(1 + 4 + 1 + 2 + AES_IV_SIZE + KEY_SIZE);
        h.push(self.log2n);
        h.extend_from_slice(&self.iterations.to_le_bytes());
        h.push(self.hint_length);
        h.extend_from_slice(&self.timeout_minutes.to_le_bytes());
        h.extend_from_slice(&self.iv);
        h.extend_from_slice(&self.ilk);
        h
    }

    fn aad(&self) -> Vec<u8> {
        header_aad(BLOCK_TYPE_USER_ACCESS, &self.header_tail())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn encrypt(
        key: &[u8; KEY_SIZE],
        iv: [u8; AES_IV_SIZE],
        log2n: u8,
        iterations: u32,
        hint_length: u8,
        timeout_minutes: u16,
        ilk: [u8; KEY_SIZE],
        plaintext: &[u8],
    ) -> Result<Self> {
        let mut block = UserAccessBlock {
            log2n,
            iterations,
            hint_length,
            timeout_minutes,
            iv,
            ilk,
            ciphertext: Vec::new(),
        };
        block.ciphertext = crypto::aead_encrypt(key, &iv, &block.aad(), plaintext)?;
        Ok(block)
    }

    pub fn decrypt(&self, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        crypto::aead_decrypt(key, &self.iv, &self.aad(), &self.ciphertext, CredentialKind::Password)
    }

    fn to_body(&self) -> Vec<u8> {
        let mut body = self.header_tail();
        body.extend_from_slice(&self.ciphertext);
        body
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() < 1 + 4 + 1 + 2 + AES_IV_SIZE + KEY_SIZE {
            return Err(SqrlError::Corrupt);
        }
        let log2n = body[0];
        let iterations = u32::from_le_bytes(body[1..5].try_into().unwrap());
        let hint_length = body[5];
        let timeout_minutes = u16::from_le_bytes(body[6..8].try_into().unwrap());
        let iv: [u8; AES_IV_SIZE] = body[8..8 + AES_IV_SIZE].try_into().unwrap();
        let ilk_offset = 8 + AES_IV_SIZE;
        let ilk: [u8; KEY_SIZE] = body[ilk_offset..ilk_offset + KEY_SIZE].try_into().unwrap();
        let ciphertext = body[ilk_offset + KEY_SIZE..].to_vec();
        Ok(UserAccessBlock {
            log2n,
            iterations,
            hint_length,
            timeout_minutes,
            iv,
            ilk,
            ciphertext,
        })
    }
}

impl RescueBlock {
    fn header_tail(&self) -> Vec<u8> {
        let mut h = Vec::with_capacity(1 + 4 + AES_IV_SIZE);
        h.push(self.log2n);
        h.extend_from_slice(&self.iterations.to_le_bytes());
        h.extend_from_slice(&self.iv);
        h
    }

    fn aad(&self) -> Vec<u8> {
        header_aad(BLOCK_TYPE_RESCUE, &self.header_tail())
    }

    pub fn encrypt(
        key: &[u8; KEY_SIZE],
        iv: [u8; AES_IV_SIZE],
        log2n: u8,
        iterations: u32,
        plaintext: &[u8],
    ) -> Result<Self> {
        let mut block = RescueBlock {
            log2n,
            iterations,
            iv,
            ciphertext: Vec::new(),
        };
        block.ciphertext = crypto::aead_encrypt(key, &iv, &block.aad(), plaintext)?;
        Ok(block)
    }

    pub fn decrypt(&self, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        crypto::aead_decrypt(key, &self.iv, &self.aad(), &self.ciphertext, CredentialKind::RescueCode)
    }

    fn to_body(&self) -> Vec<u8> {
        let mut body = self.header_tail();
        body.extend_from_slice(&self.ciphertext);
        body
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() < 1 + 4 + AES_IV_SIZE {
            return Err(SqrlError::Corrupt);
        }
        let log2n = body[0];
        let iterations = u32::from_le_bytes(body[1..5].try_into().unwrap());
        let iv: [u8; AES_IV_SIZE] = body[5..5 + AES_IV_SIZE].try_into().unwrap();
        let ciphertext = body[5 + AES_IV_SIZE..].to_vec();
        Ok(RescueBlock {
            log2n,
            iterations,
            iv,
            ciphertext,
        })
    }
}

impl PreviousIdentitiesBlock {
    /// Pushes `iuk` (encrypted under the current `imk`) to the front of the
    /// chain, newest first, dropping the oldest entry past
    /// [`MAX_PREVIOUS_IDENTITIES`].
    pub fn push(&mut self, imk: &[u8; KEY_SIZE], iv: [u8; AES_IV_SIZE], iuk: &[u8; KEY_SIZE]) -> Result<()> {
        let aad = BLOCK_TYPE_PREVIOUS_IDENTITIES.to_le_bytes();
        let ciphertext = crypto::aead_encrypt(imk, &iv, &aad, iuk)?;
        self.entries.insert(0, PreviousIdentityEntry { iv, ciphertext });
        self.entries.truncate(MAX_PREVIOUS_IDENTITIES);
        Ok(())
    }

    pub fn decrypt_entry(&self, imk: &[u8; KEY_SIZE], index: usize) -> Result<[u8; KEY_SIZE]> {
        let entry = self.entries.get(index).ok_or(SqrlError::Corrupt)?;
        let aad = BLOCK_TYPE_PREVIOUS_IDENTITIES.to_le_bytes();
        let plaintext = crypto::aead_decrypt(imk, &entry.iv, &aad, &entry.ciphertext, CredentialKind::Password)?;
        plaintext.try_into().map_err(|_| SqrlError::Corrupt)
    }

    fn to_body(&self) -> Vec<u8> {
        let mut body = vec![self.entries.len() as u8];
        for entry in &self.entries {
            body.extend_from_slice(&entry.iv);
            body.extend_from_slice(&(entry.ciphertext.len() as u16).to_le_bytes());
            body.extend_from_slice(&entry.ciphertext);
        }
        body
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(SqrlError::Corrupt);
        }
        let count = body[0] as usize;
        let mut offset = 1;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if body.len() < offset + AES_IV_SIZE + 2 {
                return Err(SqrlError::Corrupt);
            }
            let iv: [u8; AES_IV_SIZE] = body[offset..offset + AES_IV_SIZE].try_into().unwrap();
            offset += AES_IV_SIZE;
            let len = u16::from_le_bytes(body[offset..offset + 2].try_into().unwrap()) as usize;
            offset += 2;
            if body.len() < offset + len {
                return Err(SqrlError::Corrupt);
            }
            let ciphertext = body[offset..offset + len].to_vec();
            offset += len;
            entries.push(PreviousIdentityEntry { iv, ciphertext });
        }
        Ok(PreviousIdentitiesBlock { entries })
    }
}

/// An S4 container: the ordered sequence of blocks making up one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub blocks: Vec<Block>,
}

impl Container {
    pub fn user_access(&self) -> Option<&UserAccessBlock> {
        self.blocks.iter().find_map(|b| match b {
            Block::UserAccess(u) => Some(u),
            _ => None,
        })
    }

    pub fn rescue(&self) -> Option<&RescueBlock> {
        self.blocks.iter().find_map(|b| match b {
            Block::Rescue(r) => Some(r),
            _ => None,
        })
    }

    pub fn previous_identities(&self) -> Option<&PreviousIdentitiesBlock> {
        self.blocks.iter().find_map(|b| match b {
            Block::PreviousIdentities(p) => Some(p),
            _ => None,
        })
    }

    /// The embedder-visible options block, or its `Default` if this
    /// identity has never had one set.
    pub fn options(&self) -> OptionsBlock {
        self.blocks
            .iter()
            .find_map(|b| match b {
                Block::Options(o) => Some(o.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn set_user_access(&mut self, block: UserAccessBlock) {
        self.replace_or_push(|b| matches!(b, Block::UserAccess(_)), Block::UserAccess(block));
    }

    pub fn set_rescue(&mut self, block: RescueBlock) {
        self.replace_or_push(|b| matches!(b, Block::Rescue(_)), Block::Rescue(block));
    }

    pub fn set_previous_identities(&mut self, block: PreviousIdentitiesBlock) {
        self.replace_or_push(
            |b| matches!(b, Block::PreviousIdentities(_)),
            Block::PreviousIdentities(block),
        );
    }

    pub fn set_options(&mut self, block: OptionsBlock) {
        self.replace_or_push(|b| matches!(b, Block::Options(_)), Block::Options(block));
    }

    fn replace_or_push(&mut self, pred: impl Fn(&Block) -> bool, block: Block) {
        if let Some(slot) = self.blocks.iter_mut().find(|b| pred(b)) {
            *slot = block;
        } else {
            self.blocks.push(block);
        }
    }

    /// Serializes in canonical order: type 1, type 2, type 3, then any
    /// unrecognized blocks in the order they were parsed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ordered: Vec<&Block> = Vec::with_capacity(self.blocks.len());
        for wanted in [
            BLOCK_TYPE_USER_ACCESS,
            BLOCK_TYPE_RESCUE,
            BLOCK_TYPE_PREVIOUS_IDENTITIES,
            BLOCK_TYPE_OPTIONS,
        ] {
            if let Some(b) = self.blocks.iter().find(|b| block_type_of(b) == wanted) {
                ordered.push(b);
            }
        }
        for b in &self.blocks {
            if matches!(b, Block::Unknown(_)) {
                ordered.push(b);
            }
        }

        let mut out = Vec::new();
        for block in ordered {
            let (block_type, body) = match block {
                Block::UserAccess(u) => (BLOCK_TYPE_USER_ACCESS, u.to_body()),
                Block::Rescue(r) => (BLOCK_TYPE_RESCUE, r.to_body()),
                Block::PreviousIdentities(p) => (BLOCK_TYPE_PREVIOUS_IDENTITIES, p.to_body()),
                Block::Options(o) => (BLOCK_TYPE_OPTIONS, o.to_body()),
                Block::Unknown(u) => (u.block_type, u.body.clone()),
            };
            let length = (4 + body.len()) as u16;
            out.extend_from_slice(&length.to_le_bytes());
            out.extend_from_slice(&block_type.to_le_bytes());
            out.extend_from_slice(&body);
        }
        out
    }

    /// Consumes blocks from `data` until exhausted. Unknown block types are
    /// kept as [`Block::Unknown`] rather than rejected — a forward-compat
    /// identity file from a newer client must still parse.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut blocks = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            if data.len() < offset + 4 {
                warn!(offset, total = data.len(), "container truncated before a block header");
                return Err(SqrlError::Corrupt);
            }
            let length = u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as usize;
            if length < 4 || data.len() < offset + length {
                warn!(offset, length, total = data.len(), "container block length runs past the end of the data");
                return Err(SqrlError::Corrupt);
            }
            let block_type = u16::from_le_bytes(data[offset + 2..offset + 4].try_into().unwrap());
            let body = &data[offset + 4..offset + length];
            let block = match block_type {
                BLOCK_TYPE_USER_ACCESS => Block::UserAccess(UserAccessBlock::from_body(body)?),
                BLOCK_TYPE_RESCUE => Block::Rescue(RescueBlock::from_body(body)?),
                BLOCK_TYPE_PREVIOUS_IDENTITIES => {
                    Block::PreviousIdentities(PreviousIdentitiesBlock::from_body(body)?)
                }
                BLOCK_TYPE_OPTIONS => Block::Options(OptionsBlock::from_body(body)?),
                other => Block::Unknown(UnknownBlock {
                    block_type: other,
                    body: body.to_vec(),
                }),
            };
            blocks.push(block);
            offset += length;
        }
        Ok(Container { blocks })
    }

    /// Textual S4 form: `sqrldata` followed by Base64URL of the binary
    /// block sequence — the format an identity file on disk holds.
    pub fn to_text(&self) -> String {
        format!("sqrldata{}", crate::encoding::base64url_encode(&self.to_bytes()))
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let body = text.strip_prefix("sqrldata").ok_or(SqrlError::Corrupt)?;
        Self::from_bytes(&crate::encoding::base64url_decode(body)?)
    }
}

fn block_type_of(block: &Block) -> u16 {
    match block {
        Block::UserAccess(_) => BLOCK_TYPE_USER_ACCESS,
        Block::Rescue(_) => BLOCK_TYPE_RESCUE,
        Block::PreviousIdentities(_) => BLOCK_TYPE_PREVIOUS_IDENTITIES,
        Block::Options(_) => BLOCK_TYPE_OPTIONS,
        Block::Unknown(u) => u.block_type,
    }
}
