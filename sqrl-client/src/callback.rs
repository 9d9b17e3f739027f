//! The tagged notifications the dispatcher hands back to the embedding
//! application, and the FIFO queue they travel through. One variant per
//! callback kind in the reference implementation's `CallbackInfo` union —
//! here each variant carries its own typed payload instead of a raw pointer
//! and a switch on a tag byte.

use crate::action::ActionId;
use sqrl_core::CredentialKind;
use std::collections::VecDeque;

/// One outbound notification. See `Client::loop_once` for dispatch order.
#[derive(Debug, Clone)]
pub enum Callback {
    /// A User's identity state should be persisted by the embedder.
    SaveSuggested { user_unique_id: String },
    /// The embedder must choose or load a User before the Action can proceed.
    SelectUser { action: ActionId },
    /// The embedder must supply an alternate identity string for this site.
    SelectAlt { action: ActionId },
    /// The Action has reached a terminal state.
    ActionComplete { action: ActionId },
    /// The embedder must call `Client::authenticate` with this credential kind.
    AuthRequired { action: ActionId, credential: CredentialKind },
    /// The embedder must transport `payload` to `url` and deliver the reply
    /// via `Client::respond`.
    Send { action: ActionId, url: String, payload: Vec<u8> },
    /// The embedder must prompt the user with `message` and one of the two
    /// button labels, then answer via `Client::answer`.
    Ask { action: ActionId, message: String, first_button: String, second_button: String },
    /// Advisory progress, 0-100.
    Progress { action: ActionId, percent: u8 },
}

/// Owns the pending callback records until the dispatcher drains them. A
/// thin `VecDeque` wrapper exposing exactly one enqueue method — the
/// reference implementation had `callProgress` push onto the back of its
/// deque via a different method name than its siblings; there is only one
/// way to enqueue here, so that distinction cannot resurface.
#[derive(Debug, Default)]
pub struct CallbackQueue {
    queue: VecDeque<Callback>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, callback: Callback) {
        self.queue.push_back(callback);
    }

    pub fn pop(&mut self) -> Option<Callback> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let mut q = CallbackQueue::new();
        q.push(Callback::Progress { action: ActionId(1), percent: 10 });
        q.push(Callback::Progress { action: ActionId(1), percent: 50 });
        q.push(Callback::ActionComplete { action: ActionId(1) });

        let first = q.pop().unwrap();
        assert!(matches!(first, Callback::Progress { percent: 10, .. }));
        let second = q.pop().unwrap();
        assert!(matches!(second, Callback::Progress { percent: 50, .. }));
        let third = q.pop().unwrap();
        assert!(matches!(third, Callback::ActionComplete { .. }));
        assert!(q.is_empty());
    }
}
