//! Channel fan-out: consumers hear everyone but themselves.

use bytes::Bytes;

use conclave_core::payload::PayloadWriter;
use conclave_core::wire::{Action, Frame, ResourceKind};
use conclave_core::ProtocolError;

use crate::{start_server, url, wait_until, Recorder};

#[tokio::test]
async fn send_excludes_the_sender() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let talk = chat.create_channel("talk").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_talk = bob_session.create_channel("talk").await.unwrap();

    let alice_heard = Recorder::shared();
    talk.add_consumer(true, alice_heard.clone()).await.unwrap();
    let bob_heard = Recorder::shared();
    bob_talk.add_consumer(true, bob_heard.clone()).await.unwrap();

    assert_eq!(
        talk.consumer_names().await.unwrap(),
        vec!["alice".to_string(), "bob".to_string()]
    );

    talk.send(b"hi bob").await.unwrap();
    wait_until("bob's delivery", || bob_heard.contains("data talk alice hi bob")).await.unwrap();
    assert_eq!(alice_heard.count("data talk alice hi bob"), 0);

    bob_talk.send(b"hi alice").await.unwrap();
    wait_until("alice's delivery", || {
        alice_heard.contains("data talk bob hi alice")
    })
    .await.unwrap();
}

#[tokio::test]
async fn sending_requires_membership() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.create_channel("talk").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_talk = bob_session.create_channel("talk").await.unwrap();
    bob_talk.leave().await.unwrap();

    assert_eq!(
        bob_talk.send(b"sneak").await.unwrap_err(),
        ProtocolError::NoSuchClient
    );
}

#[tokio::test]
async fn unreliable_consumer_needs_a_datagram_endpoint() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let talk = chat.create_channel("talk").await.unwrap();

    // No endpoint bound: the proxy refuses before going to the wire.
    assert_eq!(
        talk.add_consumer(false, Recorder::shared()).await.unwrap_err(),
        ProtocolError::InvalidClient
    );
}

#[tokio::test]
async fn datagram_sends_fan_out_to_reliable_consumers() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    chat.create_channel("talk").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_talk = bob_session.create_channel("talk").await.unwrap();
    let bob_heard = Recorder::shared();
    bob_talk.add_consumer(true, bob_heard.clone()).await.unwrap();

    // An inbound datagram carries no connection identity; the sender name
    // rides in the payload.
    let mut w = PayloadWriter::new();
    w.put_string("talk").put_string("alice").put_bytes(b"udp hi");
    let frame = Frame::push(chat.number(), ResourceKind::Channel, Action::Send, w.finish());
    server
        .handler
        .handle_datagram(frame, "127.0.0.1:9999".parse().unwrap())
        .await;

    wait_until("bob's datagram-origin delivery", || {
        bob_heard.contains("data talk alice udp hi")
    })
    .await.unwrap();
}

#[tokio::test]
async fn datagrams_from_non_members_go_nowhere() {
    let server = start_server().await;
    let alice = server.client("alice").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let talk = chat.create_channel("talk").await.unwrap();
    let heard = Recorder::shared();
    talk.add_consumer(true, heard.clone()).await.unwrap();

    let mut w = PayloadWriter::new();
    w.put_string("talk").put_string("stranger").put_bytes(b"spoof");
    let frame = Frame::push(chat.number(), ResourceKind::Channel, Action::Send, w.finish());
    server
        .handler
        .handle_datagram(frame, "127.0.0.1:9999".parse().unwrap())
        .await;

    // Give the fan-out path a moment; nothing must arrive.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(heard.count("data talk stranger spoof"), 0);
}

#[tokio::test]
async fn remove_consumer_stops_delivery() {
    let server = start_server().await;
    let alice = server.client("alice").await;
    let bob = server.client("bob").await;

    let chat = alice.create_session(&url("chat")).await.unwrap();
    chat.join().await.unwrap();
    let talk = chat.create_channel("talk").await.unwrap();

    let bob_session = bob.lookup_session(&url("chat")).await.unwrap();
    bob_session.join().await.unwrap();
    let bob_talk = bob_session.create_channel("talk").await.unwrap();
    let bob_heard = Recorder::shared();
    bob_talk.add_consumer(true, bob_heard.clone()).await.unwrap();

    talk.send(b"one").await.unwrap();
    wait_until("the first delivery", || bob_heard.contains("data talk alice one")).await.unwrap();

    bob_talk.remove_consumer().await.unwrap();
    talk.send(b"two").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(bob_heard.count("data talk alice two"), 0);
}

#[tokio::test]
async fn frames_survive_the_wire_codec() {
    // Sanity check on the exact body layout the datagram path shares with
    // the stream path.
    let mut w = PayloadWriter::new();
    w.put_string("talk").put_string("alice").put_bytes(b"payload");
    let frame = Frame::push(7, ResourceKind::Channel, Action::Send, w.finish());
    let encoded: Bytes = frame.encode();
    let decoded = Frame::decode(encoded).unwrap();
    assert_eq!(decoded.session, 7);
    assert_eq!(decoded.request_id, 0);
    assert_eq!(decoded.payload, frame.payload);
}
