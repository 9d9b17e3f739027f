//! On-disk identity file round trip: generate an identity, write its textual
//! S4 form to a real file (not just an in-memory buffer), read it back, and
//! unlock it. Mirrors `guard-core`'s vault round-trip tests, which write a
//! vault to a `tempfile::tempdir()` path rather than trusting an in-memory
//! `Vec<u8>` to stand in for the embedder's actual filesystem layer.

use sqrl_core::entropy::EntropyPool;
use sqrl_core::{Container, User};
use std::fs;

#[test]
fn generated_identity_round_trips_through_a_real_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("identity.sqrl");

    let pool = EntropyPool::new();
    let (user, rescue_code) = User::generate(&pool, "correct horse battery staple", 10, 9, 4, 15).unwrap();
    fs::write(&path, user.save_to_text()).expect("write identity file");

    let text = fs::read_to_string(&path).expect("read identity file");
    assert!(text.starts_with("sqrldata"));

    let container = Container::from_text(&text).unwrap();
    let loaded = User::load(container).unwrap();
    assert_eq!(loaded.unique_id(), user.unique_id());

    loaded.unlock_with_rescue_code(&rescue_code).unwrap();
    assert!(loaded.has_iuk());
}

#[test]
fn wrong_password_against_a_file_backed_identity_does_not_corrupt_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("identity.sqrl");

    let pool = EntropyPool::new();
    let (user, _rescue_code) = User::generate(&pool, "the real password", 10, 9, 4, 15).unwrap();
    fs::write(&path, user.save_to_bytes()).expect("write identity file");

    let before = fs::read(&path).unwrap();
    let loaded = User::load(Container::from_bytes(&before).unwrap()).unwrap();
    assert!(loaded.unlock_with_password("wrong password").is_err());

    let after = fs::read(&path).unwrap();
    assert_eq!(before, after, "a failed unlock must never touch the on-disk bytes");
}
