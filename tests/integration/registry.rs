//! Registry binding, lookup, and liveness.

use conclave_core::wire::event_mask;
use conclave_core::ProtocolError;

use crate::{start_server, url, wait_until, Recorder};

#[tokio::test]
async fn create_session_binds_and_lookup_finds_it() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let session = alice.create_session(&url("chat")).await.unwrap();
    assert!(session.number() > 0);

    let registry = alice.registry();
    assert_eq!(registry.lookup(&url("chat")).await.unwrap(), session.number());
    assert!(registry.exists(&url("chat")).await.unwrap());
    assert_eq!(
        registry.list().await.unwrap(),
        vec!["conclave://localhost:4461/chat".to_string()]
    );
}

#[tokio::test]
async fn local_host_aliases_collide() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    alice.create_session(&url("chat")).await.unwrap();
    let alias = conclave_core::url::SessionUrl::parse("conclave://127.0.0.1:4461/chat").unwrap();
    assert_eq!(
        alice.create_session(&alias).await.err(),
        Some(ProtocolError::AlreadyBound)
    );
    // The failed create must not leave a half-made session behind.
    assert_eq!(server.handler.state().session_count(), 1);
}

#[tokio::test]
async fn lookup_of_unbound_url_fails() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    assert_eq!(
        alice.registry().lookup(&url("nowhere")).await.unwrap_err(),
        ProtocolError::NotBound
    );
    assert!(!alice.registry().exists(&url("nowhere")).await.unwrap());
}

#[tokio::test]
async fn only_the_binder_may_unbind() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let eve = server.client("eve").await;

    let session = alice.create_session(&url("chat")).await.unwrap();
    assert_eq!(
        eve.registry().unbind(&url("chat")).await.unwrap_err(),
        ProtocolError::PermissionDenied
    );

    alice.registry().unbind(&url("chat")).await.unwrap();
    assert!(!alice.registry().exists(&url("chat")).await.unwrap());
    // The session itself outlives the binding.
    assert!(server.handler.state().session(session.number()).is_ok());
}

#[tokio::test]
async fn is_alive_round_trips() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    alice.registry().is_alive().await.unwrap();
}

#[tokio::test]
async fn registry_membership_and_events() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let events = Recorder::shared();
    alice
        .registry()
        .add_listener(event_mask::ALL, events.clone())
        .await
        .unwrap();

    alice.registry().join().await.unwrap();
    bob.registry().join().await.unwrap();
    wait_until("bob's registry join event", || {
        events.contains("joined registry bob")
    })
    .await.unwrap();

    let names = alice.registry().client_names().await.unwrap();
    assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);

    bob.registry().leave().await.unwrap();
    wait_until("bob's registry leave event", || {
        events.contains("left registry bob")
    })
    .await.unwrap();
}
