//! Live connection table and per-connection event queues.
//!
//! Event pushes never run on the reader task that produced them. Each
//! connection gets a bounded queue drained by its own worker task, so a
//! slow or stalled client delays only its own events, in order, and drops
//! beyond the configured depth.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use conclave_core::wire::Frame;
use conclave_net::Connection;

pub struct Connections {
    map: DashMap<u64, ConnEntry>,
    queue_depth: usize,
}

struct ConnEntry {
    conn: Arc<Connection>,
    events: mpsc::Sender<Frame>,
}

impl Connections {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            map: DashMap::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a connection and spawn its event drain task.
    pub fn register(&self, conn: Arc<Connection>) {
        let (tx, mut rx) = mpsc::channel::<Frame>(self.queue_depth);
        let drain_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if drain_conn.send(&frame).await.is_err() {
                    break;
                }
            }
        });
        self.map.insert(
            conn.id(),
            ConnEntry { conn, events: tx },
        );
    }

    pub fn remove(&self, conn_id: u64) {
        self.map.remove(&conn_id);
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.map.get(&conn_id).map(|e| e.conn.clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Queue an event for one connection. Dropped (with a log line) when
    /// the queue is full or the connection is gone.
    pub fn push_event(&self, conn_id: u64, frame: Frame) {
        let Some(entry) = self.map.get(&conn_id) else {
            tracing::trace!(conn = conn_id, "event for departed connection dropped");
            return;
        };
        if let Err(e) = entry.events.try_send(frame) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(conn = conn_id, "event queue full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::trace!(conn = conn_id, "event queue closed, dropping event");
                }
            }
        }
    }

    /// Queue one event frame for several connections.
    pub fn notify(&self, targets: &[u64], frame: &Frame) {
        for &target in targets {
            self.push_event(target, frame.clone());
        }
    }

    /// Ask every live connection to shut down. Used on daemon stop; the
    /// per-connection close cascades handle the rest.
    pub fn close_all(&self) {
        for entry in self.map.iter() {
            entry.conn.close();
        }
    }
}
