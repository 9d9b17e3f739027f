use thiserror::Error;

/// Errors surfaced by the transaction engine: the action state machine, the
/// callback dispatch loop and the worker pool that runs EnScrypt off the
/// dispatcher thread. Identity-level failures (bad password, corrupt
/// container, ...) are not wrapped — they pass through as `Identity` so a
/// caller matching on `SqrlError::BadPassword` doesn't have to unwrap twice.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Identity(#[from] sqrl_core::SqrlError),

    #[error("no user is currently selected")]
    NoUserSelected,

    #[error("unknown action id")]
    UnknownAction,

    #[error("action is not awaiting a response")]
    NotAwaitingResponse,

    #[error("action was cancelled")]
    Cancelled,

    #[error("server returned an unrecognized or malformed response")]
    ProtocolViolation(&'static str),

    #[error("server reported a command failure (TIF 0x{tif:04x})")]
    ServerRefused { tif: u16 },

    #[error("a client for this process already exists")]
    AlreadyInitialized,
}

pub type Result<T> = std::result::Result<T, ClientError>;
