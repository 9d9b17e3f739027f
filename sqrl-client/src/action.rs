//! The Action state machine (§4.G): one finite state machine per
//! transaction type, sharing the generic frame `NEW -> AUTHENTICATING ->
//! WORKING -> (SENDING <-> AWAITING_RESPONSE)* -> COMPLETING -> DONE`.
//! `exec()` performs exactly one step and returns — the cooperative
//! suspension contract means no step may block; a step that needs an
//! answer from the embedder or a worker thread enqueues the right
//! callback (or worker job) once and then reports `Suspended` on every
//! following tick until that answer arrives.
//!
//! Grounded on `guard-service/src/engine/mod.rs`'s `EngineMode` enum and
//! its mode-dependent event routing — the same shape of "what happens
//! next depends on which variant we're in", adapted from a three-mode
//! engine to an eight-transaction-type one.

use crate::callback::{Callback, CallbackQueue};
use crate::error::{ClientError, Result};
use crate::site_action::SiteAction;
use crate::sqrl_url::SqrlUrl;
use crate::worker_pool::{CancelHandle, IdentityOutcome, IdentityResult, JobId, WorkResult, WorkerPool};
use sqrl_core::entropy::EntropyPool;
use sqrl_core::{Container, CredentialKind, User};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCommand {
    Query,
    Ident,
    Disable,
    Enable,
    Remove,
}

impl AuthCommand {
    fn wire_name(self) -> &'static str {
        match self {
            AuthCommand::Query => "query",
            AuthCommand::Ident => "ident",
            AuthCommand::Disable => "disable",
            AuthCommand::Enable => "enable",
            AuthCommand::Remove => "remove",
        }
    }
}

#[derive(Debug)]
pub enum ActionKind {
    /// Unlocks a container the embedder has already read off disk.
    IdentityLoad { container: Container },
    /// Mints a brand-new identity. The resulting `User` and rescue code
    /// land on the completed Action — see [`Action::generated_rescue_code`].
    IdentityGenerate { kdf_millis: u32, log2n: u8, hint_length: u8, timeout_minutes: u16 },
    Auth(AuthCommand),
    Rekey { kdf_millis: u32, log2n: u8, hint_length: u8, timeout_minutes: u16 },
    ChangePassword { kdf_millis: u32, log2n: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneStatus {
    Success,
    Failed(String),
    Cancelled,
}

/// An answer the embedder supplied via `Client::authenticate`, buffered
/// until the Action's next step picks it up.
#[derive(Debug, Clone)]
pub(crate) struct CredentialAnswer {
    pub kind: CredentialKind,
    pub text: String,
}

/// What kind of worker-pool job a `Working` step is suspended on. `Kdf` is
/// the generic, cancellable, fixed-iteration verification against an
/// already-persisted container; `Identity` is an opaque identity-mutating
/// operation (generate/rekey/change-password) with no cancel handle — see
/// `worker_pool`'s module doc for why the two don't share one shape.
#[derive(Debug)]
enum PendingJob {
    Kdf(JobId, CancelHandle),
    Identity(JobId),
}

#[derive(Debug)]
enum Phase {
    New,
    /// Waiting on `Client::select_alt` before the site's derivation domain
    /// is settled. Only entered when the selected user has opted this
    /// domain into alternate-identity use (`alt_required:<domain>` option).
    AwaitingAlt,
    Authenticating { stage: usize, requested: bool },
    /// A job was handed to the worker pool; `job` is `None` for the rare
    /// steps cheap enough to run inline (hint unlock).
    Working { stage: usize, job: Option<PendingJob>, answer: CredentialAnswer },
    Sending { payload: Vec<u8>, url: String },
    AwaitingResponse { deadline: Instant },
    /// The last reply carried an `ask=` field; `requested` tracks whether
    /// the `Ask` callback has already been pushed this tick.
    AwaitingAsk { requested: bool },
    /// `Client::answer` resolved the pending ask; `exec()` picks this up
    /// on its next tick since the answer may arrive off the dispatcher's
    /// own tick boundary.
    AskAnswered(bool),
    Completing,
    Done(DoneStatus),
}

/// A typed long-running transaction. Owned exclusively by the `Client`
/// until it reaches `Done` and the embedder observes it via
/// `ACTION_COMPLETE`.
pub struct Action {
    id: ActionId,
    kind: ActionKind,
    user: Option<User>,
    url: Option<String>,
    site: SiteAction,
    phase: Phase,
    responses: HashMap<String, String>,
    attempt_counts: HashMap<usize, u8>,
    cancel_requested: bool,
    generated_rescue_code: Option<String>,
    send_timeout: Duration,
}

pub(crate) struct ActionContext<'a> {
    pub entropy: &'a EntropyPool,
    pub worker_pool: &'a WorkerPool,
    pub callbacks: &'a mut CallbackQueue,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The Action has more work ready right now; call `exec` again before
    /// moving to the next Action.
    Continue,
    /// The Action is waiting on an external answer or a worker result.
    Suspended,
    /// The Action reached `Done`.
    Done,
}

const MAX_CREDENTIAL_ATTEMPTS: u8 = 3;

/// Splits the server's `ask=` field into its message and up to two button
/// labels, tilde-separated per §6. A missing second button defaults to a
/// plain acknowledgement rather than failing the transaction over a
/// formatting nicety.
fn parse_ask(raw: &str) -> (String, String, String) {
    let mut parts = raw.splitn(3, '~');
    let message = parts.next().unwrap_or_default().to_string();
    let first_button = parts.next().unwrap_or("OK").to_string();
    let second_button = parts.next().unwrap_or("Cancel").to_string();
    (message, first_button, second_button)
}

impl Action {
    pub fn new(id: ActionId, kind: ActionKind, user: Option<User>, url: Option<String>) -> Self {
        Action {
            id,
            kind,
            user,
            url,
            site: SiteAction::new(),
            phase: Phase::New,
            responses: HashMap::new(),
            attempt_counts: HashMap::new(),
            cancel_requested: false,
            generated_rescue_code: None,
            send_timeout: Duration::from_secs(30),
        }
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// Answers a `SELECT_USER` callback. Only valid while the Action has no
    /// user yet — it is the embedder's job to pick one, not to replace one
    /// already in use.
    pub(crate) fn set_user(&mut self, user: User) {
        self.user = Some(user);
    }

    /// Whether the given worker-pool EnScrypt job belongs to this Action's
    /// current credential step, without consuming the result.
    pub(crate) fn owns_job(&self, job_id: JobId) -> bool {
        matches!(&self.phase, Phase::Working { job: Some(PendingJob::Kdf(id, _)), .. } if *id == job_id)
    }

    /// Whether the given worker-pool identity job belongs to this Action's
    /// current step, without consuming the result.
    pub(crate) fn owns_identity_job(&self, job_id: JobId) -> bool {
        matches!(&self.phase, Phase::Working { job: Some(PendingJob::Identity(id)), .. } if *id == job_id)
    }

    pub fn site(&self) -> &SiteAction {
        &self.site
    }

    pub fn site_mut(&mut self) -> &mut SiteAction {
        &mut self.site
    }

    pub fn status(&self) -> Option<&DoneStatus> {
        match &self.phase {
            Phase::Done(status) => Some(status),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done(_))
    }

    pub fn generated_rescue_code(&self) -> Option<&str> {
        self.generated_rescue_code.as_deref()
    }

    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    /// How many credential stages this transaction type needs, and the
    /// kind it expects to be answered with. `Auth`/`IdentityLoad` accept
    /// either Password or Hint/RescueCode — the embedder's answer kind is
    /// trusted at `authenticate()` time, not re-validated here.
    fn total_stages(&self) -> usize {
        match &self.kind {
            ActionKind::IdentityLoad { .. } => 1,
            ActionKind::IdentityGenerate { .. } => 1,
            ActionKind::Auth(_) => 1,
            ActionKind::Rekey { .. } => 2,
            ActionKind::ChangePassword { .. } => 2,
        }
    }

    fn suggested_credential_kind(&self, stage: usize) -> CredentialKind {
        match (&self.kind, stage) {
            (ActionKind::Rekey { .. }, 0) => CredentialKind::RescueCode,
            _ => CredentialKind::Password,
        }
    }

    /// Buffers an authenticate() answer for the step currently waiting on
    /// one. Only valid while `Authenticating` and only for the stage that
    /// requested it.
    pub(crate) fn supply_credential(&mut self, kind: CredentialKind, text: String) -> Result<()> {
        match &self.phase {
            Phase::Authenticating { stage, requested: true } => {
                let stage = *stage;
                self.phase = Phase::Working {
                    stage,
                    job: None,
                    answer: CredentialAnswer { kind, text },
                };
                Ok(())
            }
            _ => Err(ClientError::NotAwaitingResponse),
        }
    }

    /// Answers a `SelectAlt` callback. Only valid while suspended on one —
    /// picking up `step_new` again on the next tick to finish setting up
    /// the site's derivation domain.
    pub(crate) fn supply_alt_identity(&mut self, alt: Option<String>) -> Result<()> {
        if !matches!(self.phase, Phase::AwaitingAlt) {
            return Err(ClientError::NotAwaitingResponse);
        }
        self.site.set_alt_identity(alt);
        self.phase = Phase::New;
        Ok(())
    }

    /// Answers an `Ask` callback. `accepted` is `true` for the first
    /// button. Per §4.G, declining is a cancellation: the Action reaches
    /// DONE(CANCELLED) rather than resuming the in-flight transaction.
    pub(crate) fn supply_ask_answer(&mut self, accepted: bool) -> Result<()> {
        match &self.phase {
            Phase::AwaitingAsk { requested: true } => {
                self.site.take_pending_ask();
                self.phase = Phase::AskAnswered(accepted);
                Ok(())
            }
            _ => Err(ClientError::NotAwaitingResponse),
        }
    }

    /// Delivers a worker-pool result to whichever step is waiting for it.
    /// Returns `true` if this Action owned `result.job_id` (whether or not
    /// it was still waiting on it). Runs the rest of the credential step
    /// immediately rather than waiting for another `exec()` tick — the
    /// worker already did the expensive part, there is nothing left to
    /// suspend on.
    pub(crate) fn deliver_kdf_result(&mut self, result: &WorkResult, ctx: &mut ActionContext) -> bool {
        let Phase::Working { job: Some(PendingJob::Kdf(job_id, _)), .. } = &self.phase else {
            return false;
        };
        if *job_id != result.job_id {
            return false;
        }
        let Phase::Working { answer, stage, .. } = std::mem::replace(&mut self.phase, Phase::New) else {
            unreachable!()
        };
        match result.outcome {
            Some(key) => {
                self.apply_kdf_result(stage, answer, key, ctx);
            }
            None => {
                self.phase = Phase::Done(DoneStatus::Cancelled);
                self.emit_completion(ctx);
            }
        }
        true
    }

    /// Delivers a completed identity-mutating job (generate/rekey/change
    /// password) to whichever step is waiting for it. See
    /// [`Action::deliver_kdf_result`] for the matching EnScrypt-verification
    /// counterpart.
    pub(crate) fn deliver_identity_result(&mut self, result: IdentityResult, ctx: &mut ActionContext) -> bool {
        let Phase::Working { job: Some(PendingJob::Identity(job_id)), .. } = &self.phase else {
            return false;
        };
        if *job_id != result.job_id {
            return false;
        }
        let Phase::Working { stage, .. } = std::mem::replace(&mut self.phase, Phase::New) else {
            unreachable!()
        };
        self.apply_identity_result(stage, result.outcome, ctx);
        true
    }

    /// Delivers a server reply to an Action waiting in `AwaitingResponse`.
    pub(crate) fn deliver_response(&mut self, bytes: &[u8]) -> Result<()> {
        if !matches!(self.phase, Phase::AwaitingResponse { .. }) {
            return Err(ClientError::NotAwaitingResponse);
        }
        let decoded = sqrl_core::encoding::base64url_decode(std::str::from_utf8(bytes).unwrap_or_default())
            .map_err(|_| ClientError::ProtocolViolation("reply is not valid Base64URL"))?;
        let text = String::from_utf8(decoded).map_err(|_| ClientError::ProtocolViolation("reply is not UTF-8"))?;
        self.responses.clear();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                self.responses.insert(key.to_string(), value.to_string());
            }
        }
        match self.responses.get("ask").cloned() {
            Some(raw) => {
                let (message, first_button, second_button) = parse_ask(&raw);
                self.site.set_pending_ask(Some(crate::site_action::PendingAsk { message, first_button, second_button }));
                self.phase = Phase::AwaitingAsk { requested: false };
            }
            None => self.phase = Phase::Completing,
        }
        Ok(())
    }

    pub fn exec(&mut self, ctx: &mut ActionContext) -> StepOutcome {
        if self.cancel_requested && !matches!(self.phase, Phase::Done(_)) {
            if let Phase::Working { job: Some(PendingJob::Kdf(_, cancel)), .. } = &self.phase {
                cancel.cancel();
            }
            info!(action = self.id.0, "action cancelled");
            self.phase = Phase::Done(DoneStatus::Cancelled);
            self.emit_completion(ctx);
            return StepOutcome::Done;
        }

        match &self.phase {
            Phase::New => self.step_new(ctx),
            Phase::AwaitingAlt => StepOutcome::Suspended,
            Phase::Authenticating { .. } => self.step_authenticating(ctx),
            Phase::Working { job: None, .. } => self.step_working_ready(ctx),
            Phase::Working { job: Some(_), .. } => StepOutcome::Suspended,
            Phase::Sending { .. } => self.step_sending(ctx),
            Phase::AwaitingResponse { deadline } => {
                if Instant::now() >= *deadline {
                    warn!(action = self.id.0, "SEND callback timed out waiting for a response");
                    self.phase = Phase::Done(DoneStatus::Failed("timeout".to_string()));
                    self.emit_completion(ctx);
                    StepOutcome::Done
                } else {
                    StepOutcome::Suspended
                }
            }
            Phase::AwaitingAsk { requested: false } => {
                let ask = self.site.pending_ask().cloned().unwrap_or(crate::site_action::PendingAsk {
                    message: String::new(),
                    first_button: "OK".to_string(),
                    second_button: "Cancel".to_string(),
                });
                ctx.callbacks.push(Callback::Ask {
                    action: self.id,
                    message: ask.message,
                    first_button: ask.first_button,
                    second_button: ask.second_button,
                });
                self.phase = Phase::AwaitingAsk { requested: true };
                StepOutcome::Suspended
            }
            Phase::AwaitingAsk { requested: true } => StepOutcome::Suspended,
            Phase::AskAnswered(accepted) => {
                if *accepted {
                    self.phase = Phase::Completing;
                    StepOutcome::Continue
                } else {
                    info!(action = self.id.0, "ask declined, action cancelled");
                    self.phase = Phase::Done(DoneStatus::Cancelled);
                    self.emit_completion(ctx);
                    StepOutcome::Done
                }
            }
            Phase::Completing => {
                match self.check_tif() {
                    Ok(()) => self.phase = Phase::Done(DoneStatus::Success),
                    Err(err) => {
                        warn!(action = self.id.0, error = %err, "server refused the transaction");
                        self.phase = Phase::Done(DoneStatus::Failed(err.to_string()));
                    }
                }
                self.emit_completion(ctx);
                StepOutcome::Done
            }
            Phase::Done(_) => StepOutcome::Done,
        }
    }

    fn step_new(&mut self, ctx: &mut ActionContext) -> StepOutcome {
        let needs_existing_user = matches!(
            self.kind,
            ActionKind::Auth(_) | ActionKind::Rekey { .. } | ActionKind::ChangePassword { .. }
        );
        if needs_existing_user && self.user.is_none() {
            ctx.callbacks.push(Callback::SelectUser { action: self.id });
            return StepOutcome::Suspended;
        }
        if let ActionKind::IdentityLoad { container } = &self.kind {
            match User::load(container.clone()) {
                Ok(user) => self.user = Some(user),
                Err(err) => {
                    self.phase = Phase::Done(DoneStatus::Failed(err.to_string()));
                    self.emit_completion(ctx);
                    return StepOutcome::Done;
                }
            }
        }
        if matches!(self.kind, ActionKind::Auth(_)) {
            let Some(raw) = self.url.clone() else {
                return self.fail(ClientError::ProtocolViolation("auth action requires a target URL"), ctx);
            };
            let parsed = match SqrlUrl::parse(&raw) {
                Ok(p) => p,
                Err(err) => return self.fail(err, ctx),
            };
            self.site.set_domain(Some(parsed.domain.clone()));
            self.site.set_server_friendly_name(parsed.sfn);
            self.site.set_nut(parsed.nut);

            if self.site.alt_identity().is_none() {
                let alt_required = self
                    .user
                    .as_ref()
                    .and_then(|u| u.option_kv(&format!("alt_required:{}", parsed.domain)))
                    .as_deref()
                    == Some("1");
                if alt_required {
                    ctx.callbacks.push(Callback::SelectAlt { action: self.id });
                    self.phase = Phase::AwaitingAlt;
                    return StepOutcome::Suspended;
                }
            }
        }
        debug!(action = self.id.0, "action authenticating");
        self.phase = Phase::Authenticating { stage: 0, requested: false };
        StepOutcome::Continue
    }

    fn step_authenticating(&mut self, ctx: &mut ActionContext) -> StepOutcome {
        let (stage, requested) = match &self.phase {
            Phase::Authenticating { stage, requested } => (*stage, *requested),
            _ => unreachable!(),
        };
        if !requested {
            let credential = self.suggested_credential_kind(stage);
            ctx.callbacks.push(Callback::AuthRequired { action: self.id, credential });
            self.phase = Phase::Authenticating { stage, requested: true };
        }
        StepOutcome::Suspended
    }

    /// Runs once `supply_credential` has populated `Phase::Working` with
    /// an answer but no worker job yet — decides whether this stage needs
    /// a KDF (submitted to the worker pool) or can be completed inline.
    fn step_working_ready(&mut self, ctx: &mut ActionContext) -> StepOutcome {
        let (stage, answer) = match &self.phase {
            Phase::Working { stage, answer, .. } => (*stage, answer.clone()),
            _ => unreachable!(),
        };

        if answer.kind == CredentialKind::Hint {
            return self.apply_hint_unlock(&answer.text, ctx);
        }

        if let Some(job_id) = self.submit_identity_job_if_needed(stage, &answer, ctx) {
            ctx.callbacks.push(Callback::Progress { action: self.id, percent: 0 });
            self.phase = Phase::Working { stage, job: Some(PendingJob::Identity(job_id)), answer };
            return StepOutcome::Suspended;
        }

        let user = match self.user_for_stage(stage) {
            Some(u) => u,
            None => return self.fail(ClientError::NoUserSelected, ctx),
        };

        let kdf_request = match (answer.kind, stage) {
            (CredentialKind::RescueCode, _) => user.rescue_kdf_request(),
            _ => user.password_kdf_request(),
        };
        let request = match kdf_request {
            Ok(r) => r,
            Err(err) => return self.fail(err.into(), ctx),
        };

        let (job_id, cancel) =
            ctx.worker_pool
                .submit_en_scrypt(answer.text.clone().into_bytes(), request.salt.to_vec(), request.iterations, request.log2n);
        ctx.callbacks.push(Callback::Progress { action: self.id, percent: 0 });
        self.phase = Phase::Working { stage, job: Some(PendingJob::Kdf(job_id, cancel)), answer };
        StepOutcome::Suspended
    }

    /// Submits this stage as an opaque identity-mutating worker job instead
    /// of a generic EnScrypt verification, for the transaction kinds/stages
    /// that mint or rotate key material rather than just unlocking it:
    /// `IdentityGenerate` (the only stage) and the second stage of
    /// `Rekey`/`ChangePassword`. Returns `None` for every other stage, which
    /// falls through to the ordinary `KdfRequest`-driven path.
    fn submit_identity_job_if_needed(&self, stage: usize, answer: &CredentialAnswer, ctx: &mut ActionContext) -> Option<JobId> {
        match &self.kind {
            ActionKind::IdentityGenerate { kdf_millis, log2n, hint_length, timeout_minutes } => Some(
                ctx.worker_pool
                    .submit_identity_generate(ctx.entropy, answer.text.clone(), *kdf_millis, *log2n, *hint_length, *timeout_minutes),
            ),
            ActionKind::Rekey { kdf_millis, log2n, hint_length, timeout_minutes } if stage == 1 => {
                let user = self.user.as_ref().expect("selected in step_new").hold();
                Some(
                    ctx.worker_pool
                        .submit_identity_rekey(ctx.entropy, user, answer.text.clone(), *kdf_millis, *log2n, *hint_length, *timeout_minutes),
                )
            }
            ActionKind::ChangePassword { kdf_millis, log2n } if stage == 1 => {
                let user = self.user.as_ref().expect("selected in step_new").hold();
                Some(ctx.worker_pool.submit_identity_change_password(ctx.entropy, user, answer.text.clone(), *kdf_millis, *log2n))
            }
            _ => None,
        }
    }

    fn user_for_stage(&self, _stage: usize) -> Option<&User> {
        self.user.as_ref()
    }

    fn apply_hint_unlock(&mut self, hint: &str, ctx: &mut ActionContext) -> StepOutcome {
        let Some(user) = &self.user else { return self.fail(ClientError::NoUserSelected, ctx) };
        match user.hint_unlock(hint) {
            Ok(()) => self.advance_after_credential(0, ctx),
            Err(err) => self.retry_or_fail(0, err.into(), ctx),
        }
    }

    /// Applies a completed worker result: runs the rest of the identity
    /// operation for this stage, then either requests the next credential
    /// stage or moves on to building the outbound payload.
    /// Applies a completed EnScrypt verification: stage 0 of every
    /// transaction kind, and the only stage of `IdentityLoad`/`Auth`. Stage
    /// 1 of `Rekey`/`ChangePassword` and the whole of `IdentityGenerate`
    /// never reach here — they run as identity jobs instead, see
    /// [`Action::apply_identity_result`].
    fn apply_kdf_result(&mut self, stage: usize, answer: CredentialAnswer, key: [u8; 32], ctx: &mut ActionContext) -> StepOutcome {
        let result: sqrl_core::Result<()> = (|| {
            match &self.kind {
                ActionKind::IdentityLoad { .. } => {
                    let user = self.user.as_ref().expect("set in step_new");
                    match answer.kind {
                        CredentialKind::RescueCode => user.unlock_with_rescue_code_key(key)?,
                        _ => user.unlock_with_password_key(key, &answer.text)?,
                    }
                }
                ActionKind::Auth(_) => {
                    let user = self.user.as_ref().expect("selected in step_new");
                    user.unlock_with_password_key(key, &answer.text)?;
                }
                ActionKind::Rekey { .. } => {
                    debug_assert_eq!(stage, 0, "rekey's second stage runs as an identity job");
                    let user = self.user.as_ref().expect("selected in step_new");
                    user.unlock_with_rescue_code_key(key)?;
                }
                ActionKind::ChangePassword { .. } => {
                    debug_assert_eq!(stage, 0, "change-password's second stage runs as an identity job");
                    let user = self.user.as_ref().expect("selected in step_new");
                    user.unlock_with_password_key(key, &answer.text)?;
                }
                ActionKind::IdentityGenerate { .. } => {
                    unreachable!("identity generate runs entirely as an identity job")
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => self.advance_after_credential(stage, ctx),
            Err(err) => self.retry_or_fail(stage, err.into(), ctx),
        }
    }

    /// Applies a completed identity-mutating job (generate/rekey/change
    /// password). Unlike [`Action::apply_kdf_result`] these can't meaningfully
    /// retry against a stale `Secrets` snapshot — a failure here ends the
    /// Action rather than re-requesting the same credential.
    fn apply_identity_result(&mut self, stage: usize, outcome: IdentityOutcome, ctx: &mut ActionContext) -> StepOutcome {
        match outcome {
            IdentityOutcome::Generated { user, rescue_code } => {
                self.user = Some(user);
                self.generated_rescue_code = Some(rescue_code);
                self.advance_after_credential(stage, ctx)
            }
            IdentityOutcome::Rekeyed { rescue_code } => {
                self.generated_rescue_code = Some(rescue_code);
                self.advance_after_credential(stage, ctx)
            }
            IdentityOutcome::PasswordChanged => self.advance_after_credential(stage, ctx),
            IdentityOutcome::Failed(err) => self.fail(err.into(), ctx),
        }
    }

    fn advance_after_credential(&mut self, stage: usize, ctx: &mut ActionContext) -> StepOutcome {
        if let Some(user) = &self.user {
            if user.save_suggested() {
                ctx.callbacks.push(Callback::SaveSuggested { user_unique_id: user.unique_id() });
            }
        }
        let next_stage = stage + 1;
        if next_stage < self.total_stages() {
            self.phase = Phase::Authenticating { stage: next_stage, requested: false };
            return StepOutcome::Continue;
        }

        match &self.kind {
            ActionKind::Auth(command) => {
                let Some(url) = self.url.clone() else {
                    return self.fail(ClientError::ProtocolViolation("auth action requires a target URL"), ctx);
                };
                let payload = self.build_auth_payload(*command);
                ctx.callbacks.push(Callback::Send { action: self.id, url: url.clone(), payload: payload.clone() });
                self.phase = Phase::Sending { payload, url };
                StepOutcome::Suspended
            }
            _ => {
                self.phase = Phase::Completing;
                StepOutcome::Continue
            }
        }
    }

    /// Builds the outbound command block: `cmd=`/`idk=`/`nut=` lines signed
    /// by the per-site Ed25519 keypair derived from the cached IMK, the
    /// whole thing Base64URL-encoded as the POST body §6 describes.
    fn build_auth_payload(&self, command: AuthCommand) -> Vec<u8> {
        let imk = self.user.as_ref().and_then(|u| u.imk().ok());
        let domain = self.site.derivation_domain().unwrap_or("").as_bytes().to_vec();
        let nut = self.site.nut().unwrap_or("").to_string();
        let (signing, idk) = imk
            .map(|imk| sqrl_core::keys::site_keypair(&imk, &domain))
            .unwrap_or_else(|| sqrl_core::keys::site_keypair(&[0u8; 32], &domain));
        let mut body = format!(
            "cmd={}\nidk={}\nnut={}\n",
            command.wire_name(),
            sqrl_core::encoding::base64url_encode(&idk),
            nut,
        );
        let signature = sqrl_core::crypto::sign(&signing, body.as_bytes());
        body.push_str(&format!("ids={}\n", sqrl_core::encoding::base64url_encode(&signature)));
        sqrl_core::encoding::base64url_encode(body.as_bytes()).into_bytes()
    }

    /// The `tif=` bits that mean the server rejected the transaction rather
    /// than merely reporting informational state (current/previous ID
    /// match, IP match). Command-failed and client-failure both count.
    const TIF_COMMAND_FAILED: u16 = 0x40;
    const TIF_CLIENT_FAILURE: u16 = 0x80;

    /// Parses the `tif=` field captured off the last server reply and
    /// rejects the transaction if either failure bit is set. A missing or
    /// unparseable `tif=` is itself a protocol violation — every SQRL reply
    /// carries one.
    fn check_tif(&self) -> Result<()> {
        let raw = self
            .responses
            .get("tif")
            .ok_or(ClientError::ProtocolViolation("server reply is missing tif="))?;
        let tif = u16::from_str_radix(raw, 16).map_err(|_| ClientError::ProtocolViolation("tif= is not valid hex"))?;
        if tif & (Self::TIF_COMMAND_FAILED | Self::TIF_CLIENT_FAILURE) != 0 {
            return Err(ClientError::ServerRefused { tif });
        }
        Ok(())
    }

    fn step_sending(&mut self, _ctx: &mut ActionContext) -> StepOutcome {
        if let Phase::Sending { .. } = &self.phase {
            self.phase = Phase::AwaitingResponse { deadline: Instant::now() + self.send_timeout };
        }
        StepOutcome::Suspended
    }

    fn retry_or_fail(&mut self, stage: usize, err: ClientError, ctx: &mut ActionContext) -> StepOutcome {
        let attempts = self.attempt_counts.entry(stage).or_insert(0);
        *attempts += 1;
        if *attempts >= MAX_CREDENTIAL_ATTEMPTS {
            return self.fail(err, ctx);
        }
        warn!(action = self.id.0, attempt = *attempts, error = %err, "credential rejected, retrying");
        self.phase = Phase::Authenticating { stage, requested: false };
        StepOutcome::Continue
    }

    fn fail(&mut self, err: ClientError, ctx: &mut ActionContext) -> StepOutcome {
        warn!(action = self.id.0, error = %err, "action failed");
        self.phase = Phase::Done(DoneStatus::Failed(err.to_string()));
        self.emit_completion(ctx);
        StepOutcome::Done
    }

    fn emit_completion(&self, ctx: &mut ActionContext) {
        if let Some(user) = &self.user {
            if user.save_suggested() {
                ctx.callbacks.push(Callback::SaveSuggested { user_unique_id: user.unique_id() });
            }
        }
        ctx.callbacks.push(Callback::ActionComplete { action: self.id });
    }
}
