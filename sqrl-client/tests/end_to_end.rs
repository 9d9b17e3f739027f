//! End-to-end scenarios driven purely through the public embedder API
//! (`Client::submit`/`authenticate`/`select_user`/`respond`/`poll_callback`),
//! the way an embedding application actually uses this crate — as opposed to
//! `action.rs`/`client.rs`'s colocated unit tests, which reach into crate-
//! internal state. Kept in `tests/` the way `guard-service` keeps its
//! integration suites, per `guard-service/tests/`.

use sqrl_client::action::{ActionKind, AuthCommand};
use sqrl_client::callback::Callback;
use sqrl_client::{Client, DoneStatus};
use sqrl_core::entropy::EntropyPool;
use sqrl_core::{Container, CredentialKind, User};
use std::fs;

fn drive_until<F: FnMut(&Client) -> bool>(client: &Client, max_ticks: usize, mut done: F) {
    for _ in 0..max_ticks {
        if done(client) {
            return;
        }
        client.loop_once();
    }
    panic!("condition not reached within {max_ticks} ticks");
}

/// S3-style scenario, but through a real on-disk file rather than an
/// in-memory buffer: an identity generated outside the Client is written to
/// a tempfile, reloaded from those exact bytes, and driven through an
/// `IdentityLoad` Action — the reloaded identity's unique id must match.
#[test]
fn identity_load_action_recovers_identity_saved_to_a_real_file() {
    let pool = EntropyPool::new();
    let (user, rescue_code) = User::generate(&pool, "a fresh password", 10, 9, 4, 15).unwrap();
    let original_unique_id = user.unique_id();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("identity.sqrl");
    fs::write(&path, user.save_to_text()).expect("write identity file");
    let text = fs::read_to_string(&path).expect("read identity file back");
    let container = Container::from_text(&text).unwrap();

    let client = Client::new(1).unwrap();
    let load = client.submit(ActionKind::IdentityLoad { container }, None, None);

    drive_until(&client, 10_000, |c| {
        while let Some(cb) = c.poll_callback() {
            if let Callback::AuthRequired { action, .. } = cb {
                c.authenticate(action, CredentialKind::RescueCode, rescue_code.clone()).unwrap();
            }
        }
        c.take_completed(load).map(|status| {
            assert_eq!(status, DoneStatus::Success);
            true
        }).unwrap_or(false)
    });

    let reloaded = client.user_by_unique_id(&original_unique_id).expect("identity registered after load");
    assert_eq!(reloaded.unique_id(), original_unique_id);
    assert!(reloaded.has_iuk());
}

/// S5: two simultaneous Auth transactions for two distinct, already-loaded
/// Users. Per-Action callback ordering must be preserved and each Action's
/// SEND/ACTION_COMPLETE sequence must not interleave with the other's steps.
#[test]
fn two_concurrent_auth_actions_preserve_per_action_ordering() {
    let pool = EntropyPool::new();
    let client = Client::new(1).unwrap();

    let (alice, alice_rescue) = User::generate(&pool, "alice-pw", 5, 9, 4, 15).unwrap();
    let (bob, bob_rescue) = User::generate(&pool, "bob-pw", 5, 9, 4, 15).unwrap();
    alice.unlock_with_rescue_code(&alice_rescue).unwrap();
    bob.unlock_with_rescue_code(&bob_rescue).unwrap();
    client.register_user(&alice);
    client.register_user(&bob);

    let auth_a = client.submit(
        ActionKind::Auth(AuthCommand::Query),
        None,
        Some("sqrl://example.com/auth?nut=aaa&sfn=Example".to_string()),
    );
    let auth_b = client.submit(
        ActionKind::Auth(AuthCommand::Query),
        None,
        Some("sqrl://example.com/auth?nut=bbb&sfn=Example".to_string()),
    );

    let mut order_a = Vec::new();
    let mut order_b = Vec::new();
    let mut status_a = None;
    let mut status_b = None;

    drive_until(&client, 20_000, |c| {
        while let Some(cb) = c.poll_callback() {
            match cb {
                Callback::SelectUser { action } if action == auth_a => {
                    c.select_user(action, &alice.unique_id()).unwrap();
                }
                Callback::SelectUser { action } if action == auth_b => {
                    c.select_user(action, &bob.unique_id()).unwrap();
                }
                Callback::AuthRequired { action, .. } => {
                    let pw = if action == auth_a { "alice-pw" } else { "bob-pw" };
                    c.authenticate(action, CredentialKind::Password, pw.to_string()).unwrap();
                }
                Callback::Send { action, payload, .. } => {
                    assert!(!payload.is_empty());
                    let reply = sqrl_core::encoding::base64url_encode(b"tif=5\nnut=next\n");
                    c.respond(action, reply.as_bytes()).unwrap();
                    if action == auth_a {
                        order_a.push("send");
                    } else if action == auth_b {
                        order_b.push("send");
                    }
                }
                Callback::ActionComplete { action } => {
                    if action == auth_a {
                        order_a.push("complete");
                    } else if action == auth_b {
                        order_b.push("complete");
                    }
                }
                _ => {}
            }
        }
        // `take_completed` consumes the Action, so each id is taken at most
        // once and the result held here rather than re-queried.
        if status_a.is_none() {
            status_a = c.take_completed(auth_a);
        }
        if status_b.is_none() {
            status_b = c.take_completed(auth_b);
        }
        status_a.is_some() && status_b.is_some()
    });

    assert_eq!(status_a, Some(DoneStatus::Success));
    assert_eq!(status_b, Some(DoneStatus::Success));
    assert_eq!(order_a, vec!["send", "complete"]);
    assert_eq!(order_b, vec!["send", "complete"]);
}
