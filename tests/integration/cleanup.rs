//! Connection-loss teardown: a dead connection leaves no trace.

use std::time::Duration;

use conclave_core::wire::event_mask;
use conclave_core::ProtocolError;

use crate::{start_server, url, wait_until, Recorder};

#[tokio::test]
async fn a_members_death_releases_its_holds() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.create_token("floor").await.unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();
    let floor = bob_view.create_token("floor").await.unwrap();
    floor.grab(true).await.unwrap();

    let events = Recorder::shared();
    // Alice watches the token and the session.
    let alice_floor = chat.create_token("floor").await.unwrap();
    alice_floor
        .add_listener(event_mask::RELEASED | event_mask::LEFT, events.clone())
        .await
        .unwrap();
    chat.add_listener(event_mask::LEFT, events.clone())
        .await
        .unwrap();

    bob.close();

    wait_until("the token release", || events.contains("released floor bob")).await.unwrap();
    wait_until("the token membership cleanup", || {
        events.contains("left floor bob")
    })
    .await.unwrap();
    wait_until("the session membership cleanup", || {
        events.contains("left chat bob")
    })
    .await.unwrap();

    // Exactly one release for one hold.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.count("released floor bob"), 1);
    assert_eq!(alice_floor.holder_names().await.unwrap(), Vec::<String>::new());
    assert_eq!(chat.client_names().await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn sessions_die_with_their_creator() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();
    let events = Recorder::shared();
    bob_view
        .add_listener(event_mask::ALL, events.clone())
        .await
        .unwrap();

    alice.close();

    wait_until("the session teardown", || {
        server.handler.state().session_count() == 0
    })
    .await.unwrap();
    // The destroy event carries no initiator; nobody asked for it.
    wait_until("bob's destroy event", || events.contains("destroyed chat ")).await.unwrap();
    assert!(!bob.registry().exists(&url("chat")).await.unwrap());
    assert_eq!(
        bob_view.client_names().await.unwrap_err(),
        ProtocolError::NoSuchSession
    );
}

#[tokio::test]
async fn a_consumers_death_stops_its_deliveries() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let talk = chat.create_channel("talk").await.unwrap();
    let heard = Recorder::shared();
    talk.add_consumer(true, heard.clone()).await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_talk = bob_session.create_channel("talk").await.unwrap();
    bob_talk.add_consumer(true, Recorder::shared()).await.unwrap();

    bob.close();
    // Wait until the server no longer counts bob as a consumer.
    wait_until("the consumer list to shrink", || {
        server
            .handler
            .state()
            .session(chat.number())
            .ok()
            .and_then(|s| s.channel("talk").ok())
            .map(|c| c.consumer_names() == vec!["alice".to_string()])
            .unwrap_or(false)
    })
    .await.unwrap();

    // Alice can still send; the dead consumer is simply gone.
    talk.send(b"anyone there").await.unwrap();
}

#[tokio::test]
async fn a_dead_receiver_cancels_a_pending_give() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let floor = chat.create_token("floor").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    bob_session.create_token("floor").await.unwrap();

    let events = Recorder::shared();
    floor
        .add_listener(event_mask::RELEASED, events.clone())
        .await
        .unwrap();

    floor.grab(true).await.unwrap();
    floor.give("bob").await.unwrap();

    bob.close();

    // The give is cancelled; alice still holds, and no release fires for
    // a transfer that never landed.
    wait_until("the give cancellation", || {
        // Poll through the server: bob must be gone from the member list.
        server
            .handler
            .state()
            .session(chat.number())
            .ok()
            .and_then(|s| s.token("floor").ok())
            .map(|t| !t.membership.contains("bob"))
            .unwrap_or(false)
    })
    .await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.count("released floor alice"), 0);
    assert_eq!(events.count("released floor bob"), 0);

    // Alice's hold survived the cancelled transfer.
    assert_eq!(
        floor.release().await.unwrap(),
        conclave_core::TokenStatus::NotInUse
    );
}
