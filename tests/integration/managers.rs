//! Deferred authorization: manager decisions, challenges, and failure
//! modes.

use std::sync::Arc;
use std::time::Duration;

use conclave_client::{AuthorizeRequest, Decision, ResourceManager};
use conclave_core::wire::event_mask;
use conclave_core::ProtocolError;

use crate::{start_server, url, wait_until, Recorder};

/// Admits or denies everything, unconditionally.
struct Gate {
    admit: bool,
}

impl ResourceManager for Gate {
    fn authorize(&self, _request: AuthorizeRequest) -> Decision {
        let admit = self.admit;
        Box::pin(async move { admit })
    }
}

/// Challenges every requester and admits when the response matches.
struct Doorman {
    expected: Vec<u8>,
}

impl ResourceManager for Doorman {
    fn authorize(&self, _request: AuthorizeRequest) -> Decision {
        Box::pin(async { true })
    }

    fn challenge_for(&self, _client: &str) -> Option<Vec<u8>> {
        Some(b"who goes there".to_vec())
    }

    fn verify(&self, _client: &str, response: &[u8]) -> bool {
        response == self.expected
    }
}

/// Never answers; requests parked behind it age out.
struct Stalled;

impl ResourceManager for Stalled {
    fn authorize(&self, _request: AuthorizeRequest) -> Decision {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            false
        })
    }
}

#[tokio::test]
async fn admitted_join_completes() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.attach_manager(event_mask::ALL, Arc::new(Gate { admit: true }))
        .await
        .unwrap();
    assert!(chat.is_managed().await.unwrap());

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();
    assert_eq!(
        chat.client_names().await.unwrap(),
        vec!["alice".to_string(), "bob".to_string()]
    );
}

#[tokio::test]
async fn denied_join_changes_nothing() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.attach_manager(event_mask::ALL, Arc::new(Gate { admit: false }))
        .await
        .unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    assert_eq!(
        bob_view.join().await.unwrap_err(),
        ProtocolError::PermissionDenied
    );
    assert_eq!(chat.client_names().await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn the_managers_own_requests_bypass_the_gate() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.attach_manager(event_mask::ALL, Arc::new(Gate { admit: false }))
        .await
        .unwrap();
    // A deny-everything manager still joins freely on its own connection.
    chat.join().await.unwrap();
    assert_eq!(chat.client_names().await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn a_managed_session_gates_resource_creation() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();

    // Bob gets in before the gate comes down; creating resources is still
    // subject to the manager afterwards.
    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();
    chat.attach_manager(event_mask::ALL, Arc::new(Gate { admit: false }))
        .await
        .unwrap();

    assert_eq!(
        bob_view.create_token("floor").await.err(),
        Some(ProtocolError::PermissionDenied)
    );
    assert_eq!(
        bob_view.create_byte_array("board", b"x").await.err(),
        Some(ProtocolError::PermissionDenied)
    );
    assert_eq!(
        bob_view.create_channel("talk").await.err(),
        Some(ProtocolError::PermissionDenied)
    );
    assert!(!chat.token_exists("floor").await.unwrap());

    // The manager's own creations go straight through.
    chat.create_token("floor").await.unwrap();
    assert!(bob_view.token_exists("floor").await.unwrap());
}

#[tokio::test]
async fn challenge_round_admits_a_matching_response() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    // PlainIdentity answers every challenge with an empty response.
    chat.attach_manager(event_mask::ALL, Arc::new(Doorman { expected: Vec::new() }))
        .await
        .unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();
    assert_eq!(
        chat.client_names().await.unwrap(),
        vec!["alice".to_string(), "bob".to_string()]
    );
}

#[tokio::test]
async fn challenge_round_denies_a_wrong_response() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.attach_manager(
        event_mask::ALL,
        Arc::new(Doorman {
            expected: b"secret".to_vec(),
        }),
    )
    .await
    .unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    assert_eq!(
        bob_view.join().await.unwrap_err(),
        ProtocolError::PermissionDenied
    );
}

#[tokio::test]
async fn duplicate_pending_requests_are_refused() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let carol1 = server.client("carol").await;
    let carol2 = server.client("carol").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.attach_manager(event_mask::ALL, Arc::new(Stalled)).await.unwrap();

    let first = tokio::spawn(async move {
        let view = carol1.lookup_session(&url("chat")).await.unwrap();
        view.join().await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let view = carol2.lookup_session(&url("chat")).await.unwrap();
    assert_eq!(
        view.join().await.unwrap_err(),
        ProtocolError::AuthorizationInProgress
    );
    first.abort();
}

#[tokio::test]
async fn stale_authorizations_time_out() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.attach_manager(event_mask::ALL, Arc::new(Stalled)).await.unwrap();

    let pending = tokio::spawn(async move {
        let view = bob.lookup_session(&url("chat")).await.unwrap();
        view.join().await
    });

    // authorize_timeout is one second in the harness.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    server.handler.sweep_stale_authorizations().await;

    assert_eq!(pending.await.unwrap().unwrap_err(), ProtocolError::TimedOut);
}

#[tokio::test]
async fn manager_death_fails_pending_requests() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.attach_manager(event_mask::ALL, Arc::new(Stalled)).await.unwrap();

    let pending = tokio::spawn(async move {
        let view = bob.lookup_session(&url("chat")).await.unwrap();
        view.join().await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.close();
    assert_eq!(
        pending.await.unwrap().unwrap_err(),
        ProtocolError::ConnectionFailure
    );
}

#[tokio::test]
async fn a_managed_registry_gates_session_creation() {
    let server = start_server().await;
    let warden = server.client("warden").await;
    let bob = server.client("bob").await;

    warden
        .registry()
        .attach_manager(event_mask::ALL, Arc::new(Gate { admit: false }))
        .await
        .unwrap();

    assert_eq!(
        bob.create_session(&url("chat")).await.err(),
        Some(ProtocolError::PermissionDenied)
    );
    assert_eq!(server.handler.state().session_count(), 0);

    // The warden itself is not gated.
    warden.create_session(&url("chat")).await.unwrap();
}

#[tokio::test]
async fn a_managed_registry_gates_unbind() {
    let server = start_server().await;
    let warden = server.client("warden").await;
    let bob = server.client("bob").await;

    let alias = url("chat");
    bob.create_session(&alias).await.unwrap();
    warden
        .registry()
        .attach_manager(event_mask::ALL, Arc::new(Gate { admit: false }))
        .await
        .unwrap();

    assert_eq!(
        bob.registry().unbind(&alias).await.err(),
        Some(ProtocolError::PermissionDenied)
    );
    assert!(bob.registry().exists(&alias).await.unwrap());
}

#[tokio::test]
async fn events_still_flow_after_an_admitted_join() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let events = Recorder::shared();
    chat.add_listener(event_mask::JOINED, events.clone())
        .await
        .unwrap();
    chat.attach_manager(event_mask::ALL, Arc::new(Gate { admit: true }))
        .await
        .unwrap();

    let bob_view = bob.lookup_session(&url("chat")).await.unwrap();
    bob_view.join().await.unwrap();
    wait_until("the replayed join's event", || {
        events.contains("joined chat bob")
    })
    .await.unwrap();
}
