//! Shared byte-array semantics: last write wins, every listener hears it.

use conclave_core::wire::event_mask;
use conclave_core::ProtocolError;

use crate::{start_server, url, wait_until, Recorder};

#[tokio::test]
async fn set_value_reaches_every_listener() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let (board, _) = chat.create_byte_array("board", b"empty").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let (bob_board, seen) = bob_session.create_byte_array("board", b"").await.unwrap();
    assert_eq!(&seen[..], b"empty");

    let alice_events = Recorder::shared();
    board
        .add_listener(event_mask::VALUE_CHANGED, alice_events.clone())
        .await
        .unwrap();
    let bob_events = Recorder::shared();
    bob_board
        .add_listener(event_mask::VALUE_CHANGED, bob_events.clone())
        .await
        .unwrap();

    board.set_value(b"hello").await.unwrap();

    // The writer hears its own change too.
    wait_until("alice's value event", || {
        alice_events.contains("value board alice hello")
    })
    .await.unwrap();
    wait_until("bob's value event", || {
        bob_events.contains("value board alice hello")
    })
    .await.unwrap();

    assert_eq!(&bob_board.fetch_value().await.unwrap()[..], b"hello");
}

#[tokio::test]
async fn last_write_wins() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let (board, _) = chat.create_byte_array("board", b"0").await.unwrap();

    board.set_value(b"1").await.unwrap();
    board.set_value(b"2").await.unwrap();
    assert_eq!(&board.fetch_value().await.unwrap()[..], b"2");
}

#[tokio::test]
async fn writes_require_membership() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.create_byte_array("board", b"x").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    // Bob is a session member but never joined the array.
    let (bob_board, _) = bob_session.create_byte_array("board", b"").await.unwrap();
    bob_board.leave().await.unwrap();
    assert_eq!(
        bob_board.set_value(b"sneak").await.unwrap_err(),
        ProtocolError::NoSuchClient
    );
}

#[tokio::test]
async fn destroy_removes_the_array() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let (board, _) = chat.create_byte_array("board", b"x").await.unwrap();

    board.destroy().await.unwrap();
    assert!(!chat.byte_array_exists("board").await.unwrap());
    assert_eq!(
        board.set_value(b"y").await.unwrap_err(),
        ProtocolError::NoSuchByteArray
    );
}
