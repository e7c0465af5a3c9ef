//! Topic subscriptions and inbound pubsub dispatch.
//!
//! A topic is subscribed at the transport when its first handler registers and
//! unsubscribed when the last one leaves. Membership changes run one at a time
//! together with their transport call, so a handler added while the topic is
//! being left resubscribes after the unsubscribe lands. Only signed messages
//! are dispatched.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::DEBUG_INFO_TOPIC;
use crate::debug_info::{DebugInfo, DebugMsg};
use crate::error::PeerError;
use crate::identity::PeerId;
use crate::metrics::PeerMetrics;
use crate::pseudonym::pseudonym;
use crate::router::{HandlerList, MessageHandler, Subscription};
use crate::transport::{PubSubMessage, Transport};

/// Produces the local debug snapshot on demand; `None` once the node is gone.
pub type DebugSnapshotFn = Arc<dyn Fn() -> Option<DebugInfo> + Send + Sync>;

pub struct PubSubGateway {
    transport: Arc<dyn Transport>,
    topics: Mutex<HashMap<String, HandlerList<MessageHandler>>>,
    /// Held across a membership change and the transport call it triggers.
    membership: tokio::sync::Mutex<()>,
    metrics: Arc<PeerMetrics>,
}

impl PubSubGateway {
    pub fn new(transport: Arc<dyn Transport>, metrics: Arc<PeerMetrics>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            topics: Mutex::new(HashMap::new()),
            membership: tokio::sync::Mutex::new(()),
            metrics,
        })
    }

    /// Add `handler` to `topic`, subscribing at the transport if it is the
    /// first one.
    pub async fn subscribe_topic(
        self: &Arc<Self>,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, PeerError> {
        let membership = self.membership.lock().await;
        let (id, first) = {
            let mut topics = self.topics.lock();
            let list = topics.entry(topic.to_string()).or_default();
            let first = list.is_empty();
            (list.add(handler), first)
        };

        if first {
            if let Err(e) = self.transport.subscribe(topic).await {
                let mut topics = self.topics.lock();
                if let Some(list) = topics.get_mut(topic) {
                    list.remove(id);
                    if list.is_empty() {
                        topics.remove(topic);
                    }
                }
                return Err(e);
            }
            debug!("Subscribed to topic {topic}");
        }
        drop(membership);

        let weak = Arc::downgrade(self);
        let topic = topic.to_string();
        Ok(Subscription::new_async(move || {
            async move {
                if let Some(gateway) = weak.upgrade() {
                    gateway.remove_handler(&topic, id).await;
                }
            }
            .boxed()
        }))
    }

    async fn remove_handler(&self, topic: &str, id: u64) {
        let _membership = self.membership.lock().await;
        let now_empty = {
            let mut topics = self.topics.lock();
            match topics.get_mut(topic) {
                Some(list) => {
                    list.remove(id);
                    if list.is_empty() {
                        topics.remove(topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if now_empty {
            match self.transport.unsubscribe(topic).await {
                Ok(()) => debug!("Unsubscribed from topic {topic}"),
                Err(e) => warn!("Could not unsubscribe from {topic}: {e}"),
            }
        }
    }

    /// Publish `message` as JSON on `topic`.
    pub async fn flood_message<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        message: &T,
    ) -> Result<(), PeerError> {
        let data = serde_json::to_vec(message)?;
        self.transport.publish(topic, data).await?;
        self.metrics.pubsub_published.inc();
        Ok(())
    }

    /// Hand an inbound message to the handlers of its topic.
    pub fn dispatch(&self, message: PubSubMessage) {
        let (from, topic, data) = match message {
            PubSubMessage::Signed {
                from, topic, data, ..
            } => (from, topic, data),
            PubSubMessage::Unsigned { topic, .. } => {
                warn!("Rejecting unsigned message on topic {topic}");
                self.metrics.pubsub_rejected.inc();
                return;
            }
        };

        let handlers = match self.topics.lock().get(&topic) {
            Some(list) => list.snapshot(),
            None => return,
        };

        let value: Value = match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Dropping malformed message on {topic} from {from} ({}): {e}",
                    pseudonym(&from)
                );
                return;
            }
        };

        self.metrics.pubsub_received.inc();
        for handler in handlers {
            handler(&from, &value);
        }
    }

    /// Answer debug-info requests with the snapshot from `snapshot`.
    pub async fn register_debug_responder(
        self: &Arc<Self>,
        snapshot: DebugSnapshotFn,
    ) -> Result<Subscription, PeerError> {
        let weak = Arc::downgrade(self);
        let handler: MessageHandler = Arc::new(move |from: &PeerId, value: &Value| {
            if !matches!(serde_json::from_value::<DebugMsg>(value.clone()), Ok(DebugMsg::Request)) {
                return;
            }
            let Some(gateway) = weak.upgrade() else {
                return;
            };
            let Some(peer_info) = snapshot() else {
                return;
            };
            info!(
                "Got a debug info request from {from} ({})",
                pseudonym(from)
            );
            let response = DebugMsg::Response {
                dst: from.to_string(),
                peer_info,
            };
            tokio::spawn(async move {
                if let Err(e) = gateway.flood_message(DEBUG_INFO_TOPIC, &response).await {
                    warn!("Could not publish debug info response: {e}");
                }
            });
        });
        self.subscribe_topic(DEBUG_INFO_TOPIC, handler).await
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().contains_key(topic)
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, HandlerList::len)
    }

    /// Drop every handler and unsubscribe every topic.
    pub async fn unsubscribe_all(&self) {
        let _membership = self.membership.lock().await;
        let topics: Vec<String> = self.topics.lock().drain().map(|(topic, _)| topic).collect();
        for topic in topics {
            if let Err(e) = self.transport.unsubscribe(&topic).await {
                warn!("Could not unsubscribe from {topic}: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
