//! The SQRL transaction engine: the `Client` dispatcher, its `Action` state
//! machine, the callback protocol embedders drive, and the worker pool that
//! keeps EnScrypt off the dispatcher thread. Built on `sqrl-core` for every
//! cryptographic and on-disk concern.

pub mod action;
pub mod callback;
pub mod client;
pub mod error;
pub mod site_action;
pub mod sqrl_url;
pub mod worker_pool;

pub use action::{ActionId, ActionKind, DoneStatus};
pub use callback::Callback;
pub use client::Client;
pub use error::{ClientError, Result};
