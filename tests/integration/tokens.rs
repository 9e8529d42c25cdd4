//! Token mutual exclusion: grab, release, give, request.

use conclave_core::wire::{event_mask, TokenStatus};
use conclave_core::ProtocolError;

use crate::{start_server, url, wait_until, Recorder};

#[tokio::test]
async fn exclusive_grab_blocks_everyone_else() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let floor = chat.create_token("floor").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_floor = bob_session.create_token("floor").await.unwrap();

    assert_eq!(floor.grab(true).await.unwrap(), TokenStatus::Grabbed);
    assert_eq!(
        bob_floor.grab(true).await.unwrap_err(),
        ProtocolError::PermissionDenied
    );
    // Status queries need no hold.
    assert_eq!(bob_floor.test().await.unwrap(), TokenStatus::Grabbed);

    assert_eq!(floor.release().await.unwrap(), TokenStatus::NotInUse);
    assert_eq!(bob_floor.grab(true).await.unwrap(), TokenStatus::Grabbed);
}

#[tokio::test]
async fn shared_grabs_inhibit() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let floor = chat.create_token("floor").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_floor = bob_session.create_token("floor").await.unwrap();

    assert_eq!(floor.grab(false).await.unwrap(), TokenStatus::Inhibited);
    assert_eq!(bob_floor.grab(false).await.unwrap(), TokenStatus::Inhibited);
    assert_eq!(
        floor.holder_names().await.unwrap(),
        vec!["alice".to_string(), "bob".to_string()]
    );
    // An exclusive grab cannot break into a shared hold.
    assert_eq!(
        bob_floor.grab(true).await.unwrap_err(),
        ProtocolError::PermissionDenied
    );

    assert_eq!(floor.release().await.unwrap(), TokenStatus::Inhibited);
    assert_eq!(bob_floor.release().await.unwrap(), TokenStatus::NotInUse);
}

#[tokio::test]
async fn release_without_hold_fails() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let floor = chat.create_token("floor").await.unwrap();

    assert_eq!(
        floor.release().await.unwrap_err(),
        ProtocolError::ClientNotGrabbing
    );
}

#[tokio::test]
async fn give_completes_when_the_receiver_grabs() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let floor = chat.create_token("floor").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_floor = bob_session.create_token("floor").await.unwrap();

    let bob_events = Recorder::shared();
    bob_floor
        .add_listener(event_mask::GIVEN | event_mask::RELEASED, bob_events.clone())
        .await
        .unwrap();

    floor.grab(true).await.unwrap();
    assert_eq!(floor.give("bob").await.unwrap(), TokenStatus::Giving);
    wait_until("bob's give offer", || {
        bob_events.contains("given floor alice bob")
    })
    .await.unwrap();

    // Bob claims; the transfer lands and alice's hold ends.
    assert_eq!(bob_floor.grab(true).await.unwrap(), TokenStatus::Grabbed);
    wait_until("alice's release event", || {
        bob_events.contains("released floor alice")
    })
    .await.unwrap();
    assert_eq!(floor.holder_names().await.unwrap(), vec!["bob".to_string()]);
}

#[tokio::test]
async fn give_requires_sole_possession() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let floor = chat.create_token("floor").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_floor = bob_session.create_token("floor").await.unwrap();

    floor.grab(false).await.unwrap();
    bob_floor.grab(false).await.unwrap();
    assert_eq!(
        floor.give("bob").await.unwrap_err(),
        ProtocolError::PermissionDenied
    );
}

#[tokio::test]
async fn giving_to_a_non_member_fails() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let floor = chat.create_token("floor").await.unwrap();

    floor.grab(true).await.unwrap();
    assert_eq!(
        floor.give("nobody").await.unwrap_err(),
        ProtocolError::NoSuchClient
    );
}

#[tokio::test]
async fn request_reaches_the_holder() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let floor = chat.create_token("floor").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_floor = bob_session.create_token("floor").await.unwrap();

    // Alice holds, with a listener for requests.
    let alice_events = Recorder::shared();
    floor
        .add_listener(event_mask::REQUESTED, alice_events.clone())
        .await
        .unwrap();
    floor.grab(true).await.unwrap();

    assert_eq!(bob_floor.request().await.unwrap(), TokenStatus::Grabbed);
    wait_until("the request at the holder", || {
        alice_events.contains("requested floor bob")
    })
    .await.unwrap();
}
