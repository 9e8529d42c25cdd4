//! Conclave integration test harness.
//!
//! Every test runs a complete server over the in-process loopback
//! transport — the same dispatch, correlation, and cleanup paths as TCP,
//! with no sockets involved — and talks to it through real
//! `ConclaveClient`s.

mod bytearrays;
mod channels;
mod cleanup;
mod managers;
mod registry;
mod sessions;
mod tokens;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use conclave_client::{
    ByteArrayEvents, ChannelConsumer, ConclaveClient, PlainIdentity, SessionEvents, TokenEvents,
};
use conclave_core::config::ConclaveConfig;
use conclave_core::url::SessionUrl;
use conclave_net::transport::{loopback_pair, LoopbackConnector};
use conclave_server::serve::serve_loopback;
use conclave_server::{ServerHandler, ServerState};

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct TestServer {
    pub handler: Arc<ServerHandler>,
    connector: LoopbackConnector,
    config: ConclaveConfig,
    _shutdown: broadcast::Sender<()>,
}

/// Spin up a server on a fresh loopback transport. Timeouts are shortened
/// so failure paths resolve within the test deadline.
pub async fn start_server() -> TestServer {
    let mut config = ConclaveConfig::default();
    config.protocol.reply_timeout_ms = 2_000;
    config.protocol.authorize_timeout_ms = 1_000;
    let state = ServerState::new(config.clone());
    let (shutdown, _) = broadcast::channel(1);
    let handler = ServerHandler::new(state, shutdown.clone());
    let (connector, listener) = loopback_pair();
    tokio::spawn(serve_loopback(
        handler.clone(),
        listener,
        shutdown.subscribe(),
    ));
    TestServer {
        handler,
        connector,
        config,
        _shutdown: shutdown,
    }
}

impl TestServer {
    pub async fn client(&self, name: &str) -> ConclaveClient {
        ConclaveClient::connect(
            &self.connector,
            "loopback",
            Arc::new(PlainIdentity::new(name)),
            &self.config.protocol,
        )
        .await
        .expect("loopback connect")
    }
}

pub fn url(name: &str) -> SessionUrl {
    SessionUrl::parse(&format!("conclave://localhost:4461/{name}")).expect("test url")
}

/// Poll `cond` until it holds or two seconds pass. Events arrive on
/// spawned fan-out tasks, so assertions on them need a grace period.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        if Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

// ── Event recorder ───────────────────────────────────────────────────────────

/// Records every callback as one line, e.g. `joined chat alice`.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn log(&self, line: String) {
        self.events.lock().expect("recorder lock").push(line);
    }

    pub fn contains(&self, line: &str) -> bool {
        self.events
            .lock()
            .expect("recorder lock")
            .iter()
            .any(|e| e == line)
    }

    pub fn count(&self, line: &str) -> usize {
        self.events
            .lock()
            .expect("recorder lock")
            .iter()
            .filter(|e| *e == line)
            .count()
    }
}

impl SessionEvents for Recorder {
    fn joined(&self, name: &str, client: &str) {
        self.log(format!("joined {name} {client}"));
    }
    fn left(&self, name: &str, client: &str) {
        self.log(format!("left {name} {client}"));
    }
    fn invited(&self, name: &str, client: &str) {
        self.log(format!("invited {name} {client}"));
    }
    fn expelled(&self, name: &str, client: &str) {
        self.log(format!("expelled {name} {client}"));
    }
    fn destroyed(&self, name: &str, client: &str) {
        self.log(format!("destroyed {name} {client}"));
    }
}

impl ByteArrayEvents for Recorder {
    fn value_changed(&self, name: &str, client: &str, value: &[u8]) {
        self.log(format!(
            "value {name} {client} {}",
            String::from_utf8_lossy(value)
        ));
    }
}

impl TokenEvents for Recorder {
    fn released(&self, name: &str, client: &str) {
        self.log(format!("released {name} {client}"));
    }
    fn given(&self, name: &str, client: &str, receiver: &str) {
        self.log(format!("given {name} {client} {receiver}"));
    }
    fn requested(&self, name: &str, client: &str) {
        self.log(format!("requested {name} {client}"));
    }
}

impl ChannelConsumer for Recorder {
    fn data_received(&self, channel: &str, sender: &str, data: &[u8]) {
        self.log(format!(
            "data {channel} {sender} {}",
            String::from_utf8_lossy(data)
        ));
    }
}
