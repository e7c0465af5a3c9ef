//! One application protocol stream per remote peer.
//!
//! Each stream is split into two tasks: a writer that drains an unbounded
//! sink of JSON values into length-prefixed frames, and a reader that decodes
//! inbound frames and fans them out to the registered message handlers.
//! Frames carry a 4-byte big-endian length header.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::identity::PeerId;
use crate::metrics::PeerMetrics;
use crate::pseudonym::pseudonym;
use crate::router::{HandlerList, MessageHandler, Subscription};
use crate::transport::{Connection, ConnectionId, ProtocolStream, Transport};

/// Serialize a value into one frame payload.
pub fn encode_frame(value: &Value) -> Result<Bytes, PeerError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Parse one frame payload.
pub fn decode_frame(frame: &[u8]) -> Result<Value, PeerError> {
    serde_json::from_slice(frame).map_err(|e| PeerError::StreamCodec(e.to_string()))
}

struct StreamEntry {
    id: u64,
    /// Connection the stream runs over.
    connection: ConnectionId,
    sink: mpsc::UnboundedSender<Value>,
    reader: AbortHandle,
}

pub struct ProtocolStreamManager {
    transport: Arc<dyn Transport>,
    protocol: String,
    handlers: Mutex<HandlerList<MessageHandler>>,
    streams: Mutex<HashMap<PeerId, StreamEntry>>,
    next_stream_id: AtomicU64,
    metrics: Arc<PeerMetrics>,
}

impl ProtocolStreamManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        protocol: impl Into<String>,
        metrics: Arc<PeerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            protocol: protocol.into(),
            handlers: Mutex::new(HandlerList::new()),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Open the protocol stream on `connection` and wire it up.
    ///
    /// Failure is logged; the connection stays up without the protocol.
    pub async fn open_stream(self: &Arc<Self>, connection: &Connection) -> Result<(), PeerError> {
        let peer = &connection.remote_peer;
        let stream = self
            .transport
            .open_stream(&connection.id, &self.protocol)
            .await
            .map_err(|e| PeerError::ProtocolStreamOpen {
                peer: peer.to_string(),
                protocol: self.protocol.clone(),
                reason: e.to_string(),
            });

        match stream {
            Ok(stream) => {
                debug!(
                    "Opened {} stream with {peer} ({})",
                    self.protocol,
                    pseudonym(peer)
                );
                self.handle_stream(peer.clone(), connection.id.clone(), stream);
                Ok(())
            }
            Err(e) => {
                warn!("{e}");
                Err(e)
            }
        }
    }

    /// Attach the read and write pipelines to a stream with `peer` carried by
    /// `connection`.
    ///
    /// A stream already registered for `peer` is replaced and its reader
    /// aborted.
    pub fn handle_stream(
        self: &Arc<Self>,
        peer: PeerId,
        connection: ConnectionId,
        stream: ProtocolStream,
    ) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (sink, mut outbound) = mpsc::unbounded_channel::<Value>();
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);

        // Held across both spawns so the reader cannot deregister before
        // the entry exists.
        let mut streams = self.streams.lock();

        let writer_peer = peer.clone();
        tokio::spawn(async move {
            let mut framed = FramedWrite::new(write_half, LengthDelimitedCodec::new());
            while let Some(value) = outbound.recv().await {
                let frame = match encode_frame(&value) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping unserializable message for {writer_peer}: {e}");
                        continue;
                    }
                };
                if let Err(e) = framed.send(frame).await {
                    debug!("Stream write to {writer_peer} failed: {e}");
                    break;
                }
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            let mut framed = FramedRead::new(read_half, LengthDelimitedCodec::new());
            while let Some(frame) = framed.next().await {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                match frame {
                    Ok(bytes) => manager.dispatch(&reader_peer, &bytes),
                    Err(e) => {
                        debug!("Stream read from {reader_peer} failed: {e}");
                        break;
                    }
                }
            }
            if let Some(manager) = weak.upgrade() {
                manager.remove_entry(&reader_peer, id);
            }
        })
        .abort_handle();

        let entry = StreamEntry {
            id,
            connection,
            sink,
            reader,
        };
        if let Some(old) = streams.insert(peer, entry) {
            old.reader.abort();
        }
    }

    fn dispatch(&self, peer: &PeerId, frame: &[u8]) {
        let value = match decode_frame(frame) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping frame from {peer} ({}): {e}", pseudonym(peer));
                return;
            }
        };
        self.metrics.messages_received.inc();
        for handler in self.handlers.lock().snapshot() {
            handler(peer, &value);
        }
    }

    fn remove_entry(&self, peer: &PeerId, id: u64) {
        let mut streams = self.streams.lock();
        if streams.get(peer).is_some_and(|entry| entry.id == id) {
            streams.remove(peer);
            debug!("{} stream with {peer} ended", self.protocol);
        }
    }

    /// Push `value` to every open stream. Returns the number of streams.
    pub fn broadcast(&self, value: &Value) -> usize {
        let streams = self.streams.lock();
        let mut sent = 0;
        for (peer, entry) in streams.iter() {
            if entry.sink.send(value.clone()).is_ok() {
                sent += 1;
                self.metrics.messages_sent.inc();
            } else {
                debug!("Stream sink for {peer} is closed");
            }
        }
        sent
    }

    /// Register a handler for every inbound message.
    pub fn subscribe(self: &Arc<Self>, handler: MessageHandler) -> Subscription {
        let id = self.handlers.lock().add(handler);
        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(manager) = weak.upgrade() {
                manager.handlers.lock().remove(id);
            }
        })
    }

    /// Tear down the stream with `peer`. Queued outbound values still flush.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        match self.streams.lock().remove(peer) {
            Some(entry) => {
                entry.reader.abort();
                true
            }
            None => false,
        }
    }

    /// Tear down the stream carried by `connection`, if any.
    pub fn remove_connection(&self, connection: &ConnectionId) -> bool {
        let mut streams = self.streams.lock();
        let Some(peer) = streams
            .iter()
            .find(|(_, entry)| entry.connection == *connection)
            .map(|(peer, _)| peer.clone())
        else {
            return false;
        };
        if let Some(entry) = streams.remove(&peer) {
            entry.reader.abort();
            debug!("{} stream with {peer} lost its connection", self.protocol);
        }
        true
    }

    pub fn close_all(&self) {
        for (_, entry) in self.streams.lock().drain() {
            entry.reader.abort();
        }
    }

    pub fn has_stream(&self, peer: &PeerId) -> bool {
        self.streams.lock().contains_key(peer)
    }

    pub fn stream_peers(&self) -> Vec<PeerId> {
        self.streams.lock().keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
