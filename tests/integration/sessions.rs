//! Session lifecycle, membership, and resource bookkeeping.

use conclave_core::wire::event_mask;
use conclave_core::{ProtocolError, Status};

use crate::{start_server, url, wait_until, Recorder};

#[tokio::test]
async fn join_and_leave_fire_events() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();

    let events = Recorder::shared();
    chat.add_listener(event_mask::ALL, events.clone())
        .await
        .unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();
    wait_until("bob's join event", || events.contains("joined chat bob")).await.unwrap();

    assert_eq!(
        chat.client_names().await.unwrap(),
        vec!["alice".to_string(), "bob".to_string()]
    );

    bob_view.leave().await.unwrap();
    wait_until("bob's leave event", || events.contains("left chat bob")).await.unwrap();
    assert_eq!(chat.client_names().await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn joining_an_unknown_session_fails() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    assert_eq!(
        alice.lookup_session(&url("ghost")).await.err(),
        Some(ProtocolError::NotBound)
    );
}

#[tokio::test]
async fn double_join_is_name_in_use() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let imposter = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();

    let other = imposter.lookup_session(&url("chat")).await.unwrap();
    assert_eq!(other.join().await.unwrap_err(), ProtocolError::NameInUse);
}

#[tokio::test]
async fn resource_creation_is_idempotent_and_listed() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();

    let (_, value) = chat.create_byte_array("board", b"first").await.unwrap();
    assert_eq!(&value[..], b"first");
    // Re-creating returns the live value and ignores the new initial one.
    let (_, value) = chat.create_byte_array("board", b"ignored").await.unwrap();
    assert_eq!(&value[..], b"first");

    chat.create_channel("talk").await.unwrap();
    chat.create_token("floor").await.unwrap();

    assert!(chat.byte_array_exists("board").await.unwrap());
    assert!(chat.channel_exists("talk").await.unwrap());
    assert!(chat.token_exists("floor").await.unwrap());
    assert!(!chat.byte_array_exists("missing").await.unwrap());

    assert_eq!(chat.byte_array_names().await.unwrap(), vec!["board".to_string()]);
    assert_eq!(chat.channel_names().await.unwrap(), vec!["talk".to_string()]);
    assert_eq!(chat.token_names().await.unwrap(), vec!["floor".to_string()]);

    // Creation joined alice.
    assert!(chat.byte_array_joined("board", "alice").await.unwrap());
    assert!(!chat.byte_array_joined("board", "bob").await.unwrap());
}

#[tokio::test]
async fn resource_creation_requires_session_membership() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    alice.create_session(&url("chat")).await.unwrap();
    let chat = bob.lookup_session(&url("chat")).await.unwrap();
    // Bob never joined the session.
    assert_eq!(
        chat.create_channel("talk").await.err(),
        Some(ProtocolError::NoSuchClient)
    );
}

#[tokio::test]
async fn expel_reports_per_client_outcomes() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();

    let statuses = chat.expel(&["bob", "nobody"]).await.unwrap();
    assert_eq!(statuses, vec![Status::Ok, Status::NoSuchClient]);
    assert_eq!(chat.client_names().await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn close_detaches_without_destroying_the_session() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.create_byte_array("board", b"x").await.unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();

    let events = Recorder::shared();
    bob_view
        .add_listener(event_mask::LEFT, events.clone())
        .await
        .unwrap();

    chat.close().await.unwrap();
    wait_until("alice's departure", || events.contains("left chat alice"))
        .await
        .unwrap();

    // The session and its resources survive the detach.
    assert!(server.handler.state().session(chat.number()).is_ok());
    assert_eq!(bob_view.client_names().await.unwrap(), vec!["bob".to_string()]);
    assert!(bob_view.byte_array_exists("board").await.unwrap());

    // A detached client is free to come back.
    chat.join().await.unwrap();
    assert_eq!(
        bob_view.client_names().await.unwrap(),
        vec!["alice".to_string(), "bob".to_string()]
    );
}

#[tokio::test]
async fn destroy_tears_down_the_session_and_its_resources() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let (board, _) = chat.create_byte_array("board", b"x").await.unwrap();

    let events = Recorder::shared();
    board
        .add_listener(event_mask::DESTROYED, events.clone())
        .await
        .unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();

    chat.destroy().await.unwrap();
    wait_until("the byte-array destroy event", || {
        events.contains("destroyed board alice")
    })
    .await.unwrap();

    assert!(server.handler.state().session(chat.number()).is_err());
    assert_eq!(
        bob_view.client_names().await.unwrap_err(),
        ProtocolError::NoSuchSession
    );
}

#[tokio::test]
async fn invite_reaches_the_invitee() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();

    // Bob joins the session so the server can find his connection, and
    // listens for the invitation on the session resource.
    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();
    let events = Recorder::shared();
    bob_view
        .add_listener(event_mask::INVITED, events.clone())
        .await
        .unwrap();

    chat.invite("bob").await.unwrap();
    wait_until("bob's invitation", || events.contains("invited chat bob")).await.unwrap();
}
