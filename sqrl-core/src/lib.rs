//! Identity cryptography, encodings and the S4 container format for SQRL
//! clients. This crate has no notion of a transaction, a server exchange or a
//! network transport — see `sqrl-client` for the dispatcher and action state
//! machine built on top of it.

pub mod crypto;
pub mod encoding;
pub mod entropy;
pub mod error;
pub mod keys;
pub mod storage;
pub mod user;

pub use error::{CredentialKind, Result, SqrlError};
pub use storage::Container;
pub use user::{Credential, KdfRequest, User};
