//! The process-wide dispatcher (§4.H): owns every `User` and `Action`,
//! drives the cooperative run loop, and routes worker-pool results and
//! embedder answers to the Action that's waiting on them.
//!
//! Grounded on `guard-service/src/engine/mod.rs`'s `Engine` struct — an
//! `Arc`-free set of mutex-guarded fields behind one handle, structured
//! `tracing` logging at every state change — and on the reference
//! implementation's `SqrlClient`, whose constructor aborts the process on a
//! second instantiation. Aborting isn't an option in a library; `Client::new`
//! returns `Err(ClientError::AlreadyInitialized)` instead, guarded by one
//! global atomic (`_singleton` below) that's released when the `Client` is
//! dropped or `shutdown()` consumes it.

use crate::action::{Action, ActionContext, ActionId, ActionKind, DoneStatus};
use crate::callback::{Callback, CallbackQueue};
use crate::error::{ClientError, Result};
use crate::worker_pool::{PoolEvent, WorkerPool};
use parking_lot::Mutex;
use sqrl_core::entropy::EntropyPool;
use sqrl_core::{CredentialKind, User};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CLIENT_EXISTS: AtomicBool = AtomicBool::new(false);

/// Releases the global singleton slot on drop, however the `Client` holding
/// it goes away — normal `Drop`, an early return, or a panic unwind.
struct SingletonGuard;

impl SingletonGuard {
    fn acquire() -> Result<Self> {
        CLIENT_EXISTS
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| SingletonGuard)
            .map_err(|_| ClientError::AlreadyInitialized)
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        CLIENT_EXISTS.store(false, Ordering::SeqCst);
    }
}

/// Default hint-lock timeout used when a `User`'s Type 1 block is, for
/// whatever reason, unreadable at registration time (never true for a
/// `User` produced by this crate's own `Action`s, but a defensive floor
/// costs nothing).
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

struct UserSlot {
    user: User,
    last_touched: Instant,
    timeout: Duration,
}

/// The SQRL transaction engine's dispatcher: the only way an embedding
/// application creates `Action`s, answers their callbacks, and drives them
/// to completion. At most one `Client` may be alive in a process at a time —
/// see [`Client::new`].
pub struct Client {
    _singleton: SingletonGuard,
    entropy: EntropyPool,
    worker_pool: WorkerPool,
    next_action_id: AtomicU64,
    users: Mutex<Vec<UserSlot>>,
    actions: Mutex<VecDeque<Action>>,
    completed: Mutex<Vec<Action>>,
    callbacks: Mutex<CallbackQueue>,
}

impl Client {
    /// Constructs the dispatcher. Fails with `AlreadyInitialized` if another
    /// `Client` is already alive in this process — see §5's client-lock.
    /// `worker_threads` sizes the bounded pool that runs EnScrypt off this
    /// thread; 1-2 is plenty for an interactive embedder.
    pub fn new(worker_threads: usize) -> Result<Self> {
        let singleton = SingletonGuard::acquire()?;
        info!("sqrl client started");
        Ok(Client {
            _singleton: singleton,
            entropy: EntropyPool::new(),
            worker_pool: WorkerPool::new(worker_threads.max(1)),
            next_action_id: AtomicU64::new(1),
            users: Mutex::new(Vec::new()),
            actions: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            callbacks: Mutex::new(CallbackQueue::new()),
        })
    }

    pub fn entropy(&self) -> &EntropyPool {
        &self.entropy
    }

    // ---- user registry (§4.H: `users`, by unique-id and by tag) ----

    fn register_or_touch(&self, user: &User) {
        let mut users = self.users.lock();
        let unique_id = user.unique_id();
        if let Some(slot) = users.iter_mut().find(|s| s.user.unique_id() == unique_id) {
            slot.last_touched = Instant::now();
            return;
        }
        let timeout = user
            .container()
            .user_access()
            .map(|ua| Duration::from_secs(ua.timeout_minutes as u64 * 60))
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);
        users.push(UserSlot {
            user: user.hold(),
            last_touched: Instant::now(),
            timeout,
        });
    }

    /// Linear scan by unique-id — §4.H notes the user set is expected to be
    /// small (tens, not thousands), so this isn't worth a second index.
    pub fn user_by_unique_id(&self, unique_id: &str) -> Option<User> {
        self.users
            .lock()
            .iter()
            .find(|s| s.user.unique_id() == unique_id)
            .map(|s| s.user.hold())
    }

    /// Linear scan by the embedder-supplied opaque tag.
    pub fn user_by_tag(&self, tag: &str) -> Option<User> {
        self.users
            .lock()
            .iter()
            .find(|s| s.user.tag().as_deref() == Some(tag))
            .map(|s| s.user.hold())
    }

    /// Explicitly registers a `User` the embedder already holds (e.g. one
    /// loaded outside an Action) so it becomes selectable via
    /// [`Client::select_user`] and subject to the idle hint-lock timeout.
    pub fn register_user(&self, user: &User) {
        self.register_or_touch(user);
    }

    /// Calls `hint_lock` on every registered, plaintext-holding `User` whose
    /// idle timeout has elapsed. Run once per [`Client::loop_once`] tick.
    fn enforce_hint_lock_timeouts(&self) {
        let users = self.users.lock();
        for slot in users.iter() {
            if slot.user.has_plaintext_keys() && slot.last_touched.elapsed() >= slot.timeout {
                if let Err(err) = slot.user.hint_lock(&self.entropy) {
                    warn!(unique_id = %slot.user.unique_id(), error = %err, "idle hint-lock failed");
                } else {
                    debug!(unique_id = %slot.user.unique_id(), "hint-locked after idle timeout");
                }
            }
        }
    }

    // ---- action submission & embedder answers (§6 Embedder API) ----

    /// Enqueues a new Action. Returns immediately; the Action doesn't start
    /// running until a subsequent [`Client::loop_once`].
    pub fn submit(&self, kind: ActionKind, user: Option<User>, url: Option<String>) -> ActionId {
        let id = ActionId(self.next_action_id.fetch_add(1, Ordering::Relaxed));
        if let Some(user) = &user {
            self.register_or_touch(user);
        }
        let action = Action::new(id, kind, user, url);
        self.actions.lock().push_back(action);
        id
    }

    fn with_action_mut<T>(&self, id: ActionId, f: impl FnOnce(&mut Action) -> Result<T>) -> Result<T> {
        let mut actions = self.actions.lock();
        let action = actions.iter_mut().find(|a| a.id() == id).ok_or(ClientError::UnknownAction)?;
        f(action)
    }

    /// Answers an `AUTH_REQUIRED` callback.
    pub fn authenticate(&self, action: ActionId, credential: CredentialKind, text: String) -> Result<()> {
        self.with_action_mut(action, |a| a.supply_credential(credential, text))
    }

    /// Answers a `SELECT_USER` callback by assigning an already-registered
    /// `User` to the Action.
    pub fn select_user(&self, action: ActionId, unique_id: &str) -> Result<()> {
        let user = self.user_by_unique_id(unique_id).ok_or(ClientError::NoUserSelected)?;
        self.with_action_mut(action, |a| {
            a.set_user(user);
            Ok(())
        })
    }

    /// Answers a `SELECT_ALT` callback with the chosen alternate-identity
    /// string (or `None` to decline and use the site-friendly-name domain).
    pub fn select_alt(&self, action: ActionId, alt_identity: Option<String>) -> Result<()> {
        self.with_action_mut(action, |a| a.supply_alt_identity(alt_identity))
    }

    /// Answers an `ASK` callback; `accepted` is `true` for the first button.
    pub fn answer(&self, action: ActionId, accepted: bool) -> Result<()> {
        self.with_action_mut(action, |a| a.supply_ask_answer(accepted))
    }

    /// Delivers a server reply to an Action awaiting one after a `SEND`.
    pub fn respond(&self, action: ActionId, server_reply_bytes: &[u8]) -> Result<()> {
        self.with_action_mut(action, |a| a.deliver_response(server_reply_bytes))
    }

    /// Requests cancellation. Takes effect at the next step boundary — see
    /// §5's cancellation-latency guarantee for in-flight KDF work.
    pub fn cancel(&self, action: ActionId) -> Result<()> {
        self.with_action_mut(action, |a| {
            a.request_cancel();
            Ok(())
        })
    }

    /// Pops the final status of a completed Action, removing it from the
    /// Client's bookkeeping. Returns `None` until the embedder has observed
    /// its `ACTION_COMPLETE` callback and the Action has actually finished.
    pub fn take_completed(&self, action: ActionId) -> Option<DoneStatus> {
        let mut completed = self.completed.lock();
        let index = completed.iter().position(|a| a.id() == action)?;
        let action = completed.remove(index);
        action.status().cloned()
    }

    /// The rescue code generated by an `IdentityGenerate` or `Rekey` Action,
    /// if it has reached `Done` and produced one. The embedder MUST show
    /// this to the user exactly once; the Client does not retain it past
    /// [`Client::take_completed`].
    pub fn generated_rescue_code(&self, action: ActionId) -> Option<String> {
        self.completed
            .lock()
            .iter()
            .find(|a| a.id() == action)
            .and_then(|a| a.generated_rescue_code().map(str::to_string))
    }

    /// Pops the next queued callback, if any.
    pub fn poll_callback(&self) -> Option<Callback> {
        self.callbacks.lock().pop()
    }

    // ---- the run loop (§4.H) ----

    /// Routes one completed worker-pool event to whichever Action's current
    /// step submitted it. A result with no matching Action (the Action was
    /// cancelled and removed before the worker finished) is logged and
    /// dropped — there's nothing left to deliver it to.
    fn route_pool_event(&self, event: PoolEvent) {
        let mut actions = self.actions.lock();
        let mut callbacks = self.callbacks.lock();
        let action = match &event {
            PoolEvent::Kdf(result) => actions.iter_mut().find(|a| a.owns_job(result.job_id)),
            PoolEvent::Identity(result) => actions.iter_mut().find(|a| a.owns_identity_job(result.job_id)),
        };
        let Some(action) = action else {
            debug!("worker-pool event has no matching action, dropping");
            return;
        };
        let mut ctx = ActionContext {
            entropy: &self.entropy,
            worker_pool: &self.worker_pool,
            callbacks: &mut callbacks,
        };
        match event {
            PoolEvent::Kdf(result) => {
                action.deliver_kdf_result(&result, &mut ctx);
            }
            PoolEvent::Identity(result) => {
                action.deliver_identity_result(result, &mut ctx);
            }
        }
        if let Some(user) = action.user() {
            self.register_or_touch(user);
        }
    }

    /// Steps exactly one Action — the front of the FIFO — and, if it isn't
    /// done, requeues it at the back so every pending Action gets a turn.
    /// A freshly `Done` Action moves to `completed` instead.
    fn step_one_action(&self) {
        let mut actions = self.actions.lock();
        let Some(mut action) = actions.pop_front() else { return };
        let mut callbacks = self.callbacks.lock();
        let mut ctx = ActionContext {
            entropy: &self.entropy,
            worker_pool: &self.worker_pool,
            callbacks: &mut callbacks,
        };
        let outcome = action.exec(&mut ctx);
        drop(callbacks);

        if let Some(user) = action.user() {
            self.register_or_touch(user);
        }

        if outcome == crate::action::StepOutcome::Done || action.is_done() {
            self.completed.lock().push(action);
        } else {
            actions.push_back(action);
        }
    }

    /// Drives the dispatcher exactly one tick: enforces idle hint-lock
    /// timeouts, drains completed worker-pool jobs, steps one Action, and
    /// reports whether there's more work left. Embedders call this in a
    /// loop until it returns `false`.
    pub fn loop_once(&self) -> bool {
        self.enforce_hint_lock_timeouts();

        while let Some(event) = self.worker_pool.poll() {
            self.route_pool_event(event);
        }

        self.step_one_action();

        let actions_empty = self.actions.lock().is_empty();
        let callbacks_empty = self.callbacks.lock().is_empty();
        !(actions_empty && callbacks_empty)
    }

    /// Blocks until every registered `User` is either dropped (no other
    /// handle remains) or hint-locked, then returns the count of users that
    /// ended the call hint-locked — i.e. still holding encrypted-at-rest
    /// key material rather than having been fully released. See
    /// `DESIGN.md` for why this differs from the reference implementation's
    /// ambiguous "remaining objects" return value.
    pub fn shutdown(self) -> usize {
        let slots: Vec<UserSlot> = self.users.lock().drain(..).collect();
        let mut hint_locked_survivors = 0;
        for slot in slots {
            if slot.user.has_plaintext_keys() {
                if let Err(err) = slot.user.hint_lock(&self.entropy) {
                    warn!(unique_id = %slot.user.unique_id(), error = %err, "shutdown hint-lock failed");
                }
                hint_locked_survivors += 1;
            }
            slot.user.release();
        }
        info!(hint_locked_survivors, "sqrl client shut down");
        hint_locked_survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::AuthCommand;
    use crate::callback::Callback;
    use sqrl_core::Container;

    fn drive_until<F: Fn(&Client) -> bool>(client: &Client, max_ticks: usize, done: F) {
        for _ in 0..max_ticks {
            if done(client) {
                return;
            }
            client.loop_once();
        }
        panic!("condition not reached within {max_ticks} ticks");
    }

    #[test]
    fn second_client_fails_while_first_is_alive() {
        let first = Client::new(1).unwrap();
        let second = Client::new(1);
        assert!(matches!(second, Err(ClientError::AlreadyInitialized)));
        drop(first);
        let third = Client::new(1);
        assert!(third.is_ok());
    }

    #[test]
    fn loop_returns_false_when_idle() {
        let client = Client::new(1).unwrap();
        assert!(!client.loop_once());
    }

    #[test]
    fn generate_identity_action_reaches_done_and_produces_rescue_code() {
        let client = Client::new(1).unwrap();
        let action = client.submit(
            ActionKind::IdentityGenerate { kdf_millis: 5, log2n: 9, hint_length: 4, timeout_minutes: 15 },
            None,
            None,
        );

        drive_until(&client, 10_000, |c| {
            while let Some(cb) = c.poll_callback() {
                if let Callback::AuthRequired { action: a, .. } = cb {
                    c.authenticate(a, CredentialKind::RescueCode, "new-password".to_string()).unwrap();
                }
            }
            c.take_completed(action).map(|status| {
                assert_eq!(status, DoneStatus::Success);
                true
            }).unwrap_or(false) || {
                let done = matches!(c.generated_rescue_code(action), Some(_));
                done
            }
        });

        let rescue = client.generated_rescue_code(action).expect("rescue code produced");
        assert_eq!(rescue.replace('-', "").len(), 24);
        client.take_completed(action);
    }

    #[test]
    fn auth_action_requires_select_user_then_completes() {
        let client = Client::new(1).unwrap();
        let generate = client.submit(
            ActionKind::IdentityGenerate { kdf_millis: 5, log2n: 9, hint_length: 4, timeout_minutes: 15 },
            None,
            None,
        );
        drive_until(&client, 10_000, |c| {
            while let Some(cb) = c.poll_callback() {
                if let Callback::AuthRequired { action, .. } = cb {
                    c.authenticate(action, CredentialKind::RescueCode, "pw".to_string()).unwrap();
                }
            }
            c.generated_rescue_code(generate).is_some()
        });
        let (unique_id, user) = {
            let users = client.users.lock();
            (users[0].user.unique_id(), users[0].user.hold())
        };
        client.take_completed(generate);

        // S2: the SEND payload's `idk` must match the site key derived for
        // the URL's authority (`example.com`), not the `sfn=` friendly name.
        let expected_idk = user.site_keypair("example.com").unwrap().1;

        let auth = client.submit(ActionKind::Auth(AuthCommand::Query), None, Some("sqrl://example.com/auth?nut=abc&sfn=Example".to_string()));
        let mut selected = false;
        let mut sent = false;
        drive_until(&client, 10_000, |c| {
            while let Some(cb) = c.poll_callback() {
                match cb {
                    Callback::SelectUser { action: a } if a == auth => {
                        c.select_user(a, &unique_id).unwrap();
                        selected = true;
                    }
                    Callback::AuthRequired { action: a, .. } => {
                        c.authenticate(a, CredentialKind::Password, "pw".to_string()).unwrap();
                    }
                    Callback::Send { action: a, payload, .. } => {
                        assert!(!payload.is_empty());
                        let outer = sqrl_core::encoding::base64url_decode(std::str::from_utf8(&payload).unwrap()).unwrap();
                        let body = String::from_utf8(outer).unwrap();
                        let idk_line = body.lines().find(|l| l.starts_with("idk=")).expect("idk field present");
                        let idk = sqrl_core::encoding::base64url_decode(&idk_line["idk=".len()..]).unwrap();
                        assert_eq!(idk, expected_idk);
                        assert!(body.lines().any(|l| l.starts_with("ids=")), "payload must be signed");
                        let reply = sqrl_core::encoding::base64url_encode(b"tif=5\nnut=xyz\n");
                        c.respond(a, reply.as_bytes()).unwrap();
                        sent = true;
                        let _ = a;
                    }
                    _ => {}
                }
            }
            c.take_completed(auth).map(|status| {
                assert_eq!(status, DoneStatus::Success);
                true
            }).unwrap_or(false)
        });
        assert!(selected);
        assert!(sent);
    }

    #[test]
    fn ask_field_in_reply_suspends_on_ask_then_completes_on_accept() {
        let client = Client::new(1).unwrap();
        let (user, rescue) = User::generate(client.entropy(), "pw", 5, 9, 4, 15).unwrap();
        user.unlock_with_rescue_code(&rescue).unwrap();
        client.register_user(&user);

        let auth = client.submit(
            ActionKind::Auth(AuthCommand::Query),
            None,
            Some("sqrl://example.com/auth?nut=abc&sfn=Example".to_string()),
        );
        let mut asked = false;
        drive_until(&client, 10_000, |c| {
            while let Some(cb) = c.poll_callback() {
                match cb {
                    Callback::SelectUser { action: a } => c.select_user(a, &user.unique_id()).unwrap(),
                    Callback::AuthRequired { action: a, .. } => {
                        c.authenticate(a, CredentialKind::Password, "pw".to_string()).unwrap();
                    }
                    Callback::Send { action: a, .. } => {
                        let reply = sqrl_core::encoding::base64url_encode(b"tif=5\nnut=xyz\nask=continue?~Yes~No\n");
                        c.respond(a, reply.as_bytes()).unwrap();
                    }
                    Callback::Ask { action: a, message, first_button, second_button } if a == auth => {
                        assert_eq!(message, "continue?");
                        assert_eq!(first_button, "Yes");
                        assert_eq!(second_button, "No");
                        c.answer(a, true).unwrap();
                        asked = true;
                    }
                    _ => {}
                }
            }
            c.take_completed(auth).map(|status| {
                assert_eq!(status, DoneStatus::Success);
                true
            }).unwrap_or(false)
        });
        assert!(asked);
    }

    #[test]
    fn declining_an_ask_cancels_the_action() {
        let client = Client::new(1).unwrap();
        let (user, rescue) = User::generate(client.entropy(), "pw", 5, 9, 4, 15).unwrap();
        user.unlock_with_rescue_code(&rescue).unwrap();
        client.register_user(&user);

        let auth = client.submit(
            ActionKind::Auth(AuthCommand::Query),
            None,
            Some("sqrl://example.com/auth?nut=abc&sfn=Example".to_string()),
        );
        drive_until(&client, 10_000, |c| {
            while let Some(cb) = c.poll_callback() {
                match cb {
                    Callback::SelectUser { action: a } => c.select_user(a, &user.unique_id()).unwrap(),
                    Callback::AuthRequired { action: a, .. } => {
                        c.authenticate(a, CredentialKind::Password, "pw".to_string()).unwrap();
                    }
                    Callback::Send { action: a, .. } => {
                        let reply = sqrl_core::encoding::base64url_encode(b"tif=5\nnut=xyz\nask=continue?~Yes~No\n");
                        c.respond(a, reply.as_bytes()).unwrap();
                    }
                    Callback::Ask { action: a, .. } => c.answer(a, false).unwrap(),
                    _ => {}
                }
            }
            c.take_completed(auth).map(|status| {
                assert_eq!(status, DoneStatus::Cancelled);
                true
            }).unwrap_or(false)
        });
    }

    #[test]
    fn alt_required_domain_suspends_on_select_alt_before_send() {
        let client = Client::new(1).unwrap();
        let (user, rescue) = User::generate(client.entropy(), "pw", 5, 9, 4, 15).unwrap();
        user.unlock_with_rescue_code(&rescue).unwrap();
        user.set_option_kv("alt_required:example.com", "1");
        client.register_user(&user);
        let expected_idk = user.site_keypair("alt.example.org").unwrap().1;

        let auth = client.submit(
            ActionKind::Auth(AuthCommand::Query),
            None,
            Some("sqrl://example.com/auth?nut=abc&sfn=Example".to_string()),
        );
        let mut alt_selected = false;
        drive_until(&client, 10_000, |c| {
            while let Some(cb) = c.poll_callback() {
                match cb {
                    Callback::SelectUser { action: a } => c.select_user(a, &user.unique_id()).unwrap(),
                    Callback::SelectAlt { action: a } if a == auth => {
                        c.select_alt(a, Some("alt.example.org".to_string())).unwrap();
                        alt_selected = true;
                    }
                    Callback::AuthRequired { action: a, .. } => {
                        c.authenticate(a, CredentialKind::Password, "pw".to_string()).unwrap();
                    }
                    Callback::Send { action: a, payload, .. } => {
                        let outer = sqrl_core::encoding::base64url_decode(std::str::from_utf8(&payload).unwrap()).unwrap();
                        let body = String::from_utf8(outer).unwrap();
                        let idk_line = body.lines().find(|l| l.starts_with("idk=")).expect("idk field present");
                        let idk = sqrl_core::encoding::base64url_decode(&idk_line["idk=".len()..]).unwrap();
                        assert_eq!(idk, expected_idk);
                        let reply = sqrl_core::encoding::base64url_encode(b"tif=5\nnut=xyz\n");
                        c.respond(a, reply.as_bytes()).unwrap();
                    }
                    _ => {}
                }
            }
            c.take_completed(auth).map(|status| {
                assert_eq!(status, DoneStatus::Success);
                true
            }).unwrap_or(false)
        });
        assert!(alt_selected);
    }

    #[test]
    fn cancel_during_kdf_reaches_done_cancelled_quickly() {
        let client = Client::new(1).unwrap();
        let (user, _rescue) = User::generate(client.entropy(), "pw", 5, 9, 4, 15).unwrap();
        let container = Container::from_bytes(&user.save_to_bytes()).unwrap();

        let action = client.submit(ActionKind::IdentityLoad { container }, None, None);
        let mut requested = false;
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            while let Some(cb) = client.poll_callback() {
                if let Callback::AuthRequired { action: a, .. } = cb {
                    client.authenticate(a, CredentialKind::Password, "pw".to_string()).unwrap();
                    client.cancel(a).unwrap();
                    requested = true;
                }
            }
            client.loop_once();
            if client.take_completed(action).is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "cancellation did not complete in time");
        }
        assert!(requested);
    }
}
