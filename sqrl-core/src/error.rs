use thiserror::Error;

/// Errors surfaced by identity cryptography, encoding and S4 storage.
///
/// `BadPassword` and `Corrupt` are deliberately indistinguishable from a tag
/// mismatch alone — see [`SqrlError::from_tag_mismatch`].
#[derive(Debug, Error)]
pub enum SqrlError {
    #[error("incorrect password")]
    BadPassword,

    #[error("incorrect rescue code")]
    BadRescueCode,

    #[error("incorrect hint")]
    BadHint,

    #[error("identity data is corrupt")]
    Corrupt,

    #[error("unsupported identity format version {0}")]
    UnsupportedVersion(u16),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(&'static str),

    #[error("invalid encoding: {0}")]
    Encoding(&'static str),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, SqrlError>;

impl SqrlError {
    /// Maps an AEAD tag-mismatch failure onto the credential-specific error
    /// that led to it, which is the caller's job to pick — never infer
    /// "corrupt" vs "wrong credential" from the failure alone, since AES-GCM
    /// gives no side channel to distinguish the two.
    pub fn from_tag_mismatch(credential: CredentialKind) -> Self {
        match credential {
            CredentialKind::Password => SqrlError::BadPassword,
            CredentialKind::RescueCode => SqrlError::BadRescueCode,
            CredentialKind::Hint => SqrlError::BadHint,
        }
    }
}

/// Which credential an S4 block is protected by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Password,
    RescueCode,
    Hint,
}
