//! In-process loopback broker for protocol tests.
//!
//! [`MemoryBroker`] routes every publish to every attached client whose
//! subscription set contains the topic — including the publisher itself,
//! matching MQTT semantics. The loopback matters to the protocol: a primary
//! answers its own presence probe and tallies its own approval, which is
//! what makes `approval_count == user_count` attainable at all.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use cxr_session::transport::{Delivery, QosLevel, Transport, TransportError};

#[derive(Debug, Default)]
struct ClientSlot {
    sender: Option<UnboundedSender<Delivery>>,
    subscriptions: HashSet<String>,
    connected: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    clients: HashMap<String, ClientSlot>,
}

/// Shared hub all [`MemoryTransport`] handles route through.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a client; returns its transport handle and delivery stream.
    /// The client is offline until `connect` is called on the handle.
    pub fn attach(&self, client_id: &str) -> (MemoryTransport, UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.clients.insert(
            client_id.to_owned(),
            ClientSlot {
                sender: Some(sender),
                subscriptions: HashSet::new(),
                connected: false,
            },
        );
        (
            MemoryTransport {
                client_id: client_id.to_owned(),
                broker: self.clone(),
            },
            receiver,
        )
    }

    /// Publish from outside any attached client — the planner's seat in
    /// scenario tests.
    pub fn publish_external(&self, topic: &str, payload: Vec<u8>) {
        self.route(topic, &payload);
    }

    /// Current subscription set of a client, for assertions.
    pub fn subscriptions_of(&self, client_id: &str) -> HashSet<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .clients
            .get(client_id)
            .map(|slot| slot.subscriptions.clone())
            .unwrap_or_default()
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (client_id, slot) in &state.clients {
            if !slot.connected || !slot.subscriptions.contains(topic) {
                continue;
            }
            if let Some(sender) = &slot.sender {
                let delivery = Delivery {
                    topic: topic.to_owned(),
                    payload: payload.to_vec(),
                };
                if sender.send(delivery).is_err() {
                    log::debug!("client {client_id} dropped its delivery stream");
                }
            }
        }
    }

    fn with_slot<R>(
        &self,
        client_id: &str,
        apply: impl FnOnce(&mut ClientSlot) -> R,
    ) -> Result<R, TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .clients
            .get_mut(client_id)
            .map(apply)
            .ok_or(TransportError::NotConnected)
    }
}

/// One client's handle onto the broker.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    client_id: String,
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.broker
            .with_slot(&self.client_id, |slot| slot.connected = true)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker.with_slot(&self.client_id, |slot| {
            slot.connected = false;
            slot.subscriptions.clear();
        })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QosLevel,
    ) -> Result<(), TransportError> {
        let connected = self
            .broker
            .with_slot(&self.client_id, |slot| slot.connected)?;
        if !connected {
            return Err(TransportError::NotConnected);
        }
        self.broker.route(topic, &payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QosLevel) -> Result<(), TransportError> {
        self.broker.with_slot(&self.client_id, |slot| {
            if slot.connected {
                slot.subscriptions.insert(topic.to_owned());
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            }
        })?
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.broker.with_slot(&self.client_id, |slot| {
            slot.subscriptions.remove(topic);
        })
    }
}
