//! Async session driver: wires the approval state machine to a transport.
//!
//! Inbound deliveries, operator actions, and deadline expiries all funnel
//! through the machine behind one async mutex, so no two of them interleave
//! their effects on the transaction state. The machine returns effects as
//! data; this module is the only place they touch the transport.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;

use cxr_core::clock::MessageClock;
use cxr_core::message::Message;
use cxr_core::topics::{TopicKind, TopicSet};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::machine::{Effect, Machine, Notice, Phase, State};
use crate::transport::{Delivery, QosLevel, Transport, TransportError};

/// Notifications for the UI layer: connection state plus the evolving
/// approval state of the current transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    ConnectionLost { reason: String },
    Protocol(Notice),
}

struct Inner<T> {
    transport: T,
    machine: AsyncMutex<Machine>,
    topics: Mutex<TopicSet>,
    config: Mutex<SessionConfig>,
    events: UnboundedSender<SessionEvent>,
    deadline: Mutex<Option<(Phase, Instant)>>,
    deadline_changed: Notify,
}

/// One device's seat at the negotiation. Cheap to clone; all clones share
/// the same machine and transport.
pub struct Session<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Session<T> {
    /// Build a session over a transport. Returns the session and the event
    /// stream the UI layer renders from.
    pub fn new(transport: T, config: SessionConfig) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let clock = Arc::new(MessageClock::new());
        let topics = TopicSet::new(&config.project_name);
        let machine = Machine::new(config.device_id.clone(), clock);
        let session = Self {
            inner: Arc::new(Inner {
                transport,
                machine: AsyncMutex::new(machine),
                topics: Mutex::new(topics),
                config: Mutex::new(config),
                events,
                deadline: Mutex::new(None),
                deadline_changed: Notify::new(),
            }),
        };
        (session, events_rx)
    }

    /// Connect and take the always-on subscriptions (trajectory results,
    /// approvals, presence probes). The counter-result topic is not among
    /// them; it is scoped to the primary role.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.inner.transport.connect().await?;
        let base: Vec<String> = {
            let topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics
                .base_subscriptions()
                .iter()
                .map(|topic| (*topic).to_owned())
                .collect()
        };
        for topic in base {
            self.inner
                .transport
                .subscribe(&topic, QosLevel::ExactlyOnce)
                .await?;
            log::debug!("subscribed to {topic}");
        }
        let _ = self.inner.events.send(SessionEvent::Connected);
        Ok(())
    }

    /// Disconnect-and-reconnect cycle, optionally switching projects. Any
    /// in-flight transaction is abandoned: the primary role does not
    /// survive a connection gap, and a project change re-derives (and
    /// re-subscribes) the whole topic set.
    pub async fn reconnect(&self, project_name: Option<&str>) -> Result<(), SessionError> {
        if let Err(err) = self.inner.transport.disconnect().await {
            log::warn!("disconnect before reconnect failed: {err}");
        }
        {
            let mut machine = self.inner.machine.lock().await;
            let effects = machine.on_reconnected();
            self.apply_effects(effects).await;
        }
        if let Some(project_name) = project_name {
            let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
            *topics = TopicSet::new(project_name);
            let mut config = self.inner.config.lock().unwrap_or_else(PoisonError::into_inner);
            config.project_name = project_name.to_owned();
            log::info!("topic set re-derived for project {project_name}");
        }
        self.connect().await
    }

    /// Operator requests a robot trajectory for a step. `actor_is_robot`
    /// comes from the build-plan collaborator; steps assigned to humans
    /// never reach the protocol.
    pub async fn request_trajectory(
        &self,
        element_id: &str,
        actor_is_robot: bool,
    ) -> Result<(), SessionError> {
        if !actor_is_robot {
            return Err(SessionError::invalid_action(
                "step is not assigned to the robot actor",
            ));
        }
        let mut machine = self.inner.machine.lock().await;
        if machine.state() != State::Idle {
            return Err(SessionError::invalid_action(
                "a transaction is already in progress",
            ));
        }
        let effects = machine.request(element_id);
        self.apply_effects(effects).await;
        Ok(())
    }

    /// Operator approves the trajectory under review.
    pub async fn approve(&self) -> Result<(), SessionError> {
        let mut machine = self.inner.machine.lock().await;
        let effects = machine.approve();
        if effects.is_empty() {
            return Err(SessionError::invalid_action("no trajectory under review"));
        }
        self.apply_effects(effects).await;
        Ok(())
    }

    /// Operator rejects the trajectory under review; every device resets
    /// when the broadcast comes back around.
    pub async fn reject(&self) -> Result<(), SessionError> {
        let mut machine = self.inner.machine.lock().await;
        let effects = machine.reject();
        if effects.is_empty() {
            return Err(SessionError::invalid_action("no trajectory under review"));
        }
        self.apply_effects(effects).await;
        Ok(())
    }

    /// Operator executes the approved trajectory.
    pub async fn execute(&self) -> Result<(), SessionError> {
        let mut machine = self.inner.machine.lock().await;
        let effects = machine.execute();
        if effects.is_empty() {
            return Err(SessionError::invalid_action("quorum not reached"));
        }
        self.apply_effects(effects).await;
        Ok(())
    }

    /// Current protocol phase, for UI rendering and tests.
    pub async fn state(&self) -> State {
        self.inner.machine.lock().await.state()
    }

    /// Quorum tally as `(approved, present)`. Only meaningful on the
    /// primary; other devices leave both counters untouched.
    pub async fn progress(&self) -> (u32, u32) {
        let machine = self.inner.machine.lock().await;
        (
            machine.service().approval_count().value(),
            machine.service().user_count().value(),
        )
    }

    /// Drive the session until the delivery channel closes. Each delivery
    /// is dispatched under the machine lock; phase deadlines fire here too.
    pub async fn run(&self, mut deliveries: UnboundedReceiver<Delivery>) {
        loop {
            let armed = *self
                .inner
                .deadline
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let (phase, at) = match armed {
                Some((phase, at)) => (Some(phase), at),
                None => (None, Instant::now()),
            };
            tokio::select! {
                maybe = deliveries.recv() => match maybe {
                    Some(delivery) => self.handle_delivery(delivery).await,
                    None => {
                        let _ = self.inner.events.send(SessionEvent::ConnectionLost {
                            reason: "delivery channel closed".to_owned(),
                        });
                        break;
                    }
                },
                _ = self.inner.deadline_changed.notified() => {}
                _ = tokio::time::sleep_until(at), if phase.is_some() => {
                    if let Some(phase) = phase {
                        self.fire_deadline(phase, at).await;
                    }
                }
            }
        }
    }

    async fn fire_deadline(&self, phase: Phase, at: Instant) {
        let mut machine = self.inner.machine.lock().await;
        {
            let mut armed = self
                .inner
                .deadline
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // The slot may have been re-armed for a newer transaction while
            // this firing waited on the machine lock; only the deadline that
            // actually expired gets cleared.
            if *armed != Some((phase, at)) {
                return;
            }
            *armed = None;
        }
        let effects = machine.deadline_expired(phase);
        self.apply_effects(effects).await;
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let kind = {
            let topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics.resolve(&delivery.topic)
        };
        let Some(kind) = kind else {
            log::warn!("no handler for topic {}", delivery.topic);
            return;
        };
        let message = match Message::decode(kind, &delivery.payload) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("dropping undecodable payload on {}: {err}", delivery.topic);
                return;
            }
        };
        log::debug!("received {kind:?} from {}", message.header().device_id);
        let mut machine = self.inner.machine.lock().await;
        let effects = machine.handle_message(message);
        self.apply_effects(effects).await;
    }

    async fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(message) => self.publish(message).await,
                Effect::Subscribe(kind) => {
                    if let Some(topic) = self.subscription_topic(kind) {
                        match self
                            .inner
                            .transport
                            .subscribe(&topic, QosLevel::ExactlyOnce)
                            .await
                        {
                            Ok(()) => log::debug!("subscribed to {topic}"),
                            Err(err) => {
                                log::warn!("subscribe failed on {topic}: {err}");
                                self.report_transport(err);
                            }
                        }
                    }
                }
                Effect::Unsubscribe(kind) => {
                    if let Some(topic) = self.subscription_topic(kind) {
                        match self.inner.transport.unsubscribe(&topic).await {
                            Ok(()) => log::debug!("unsubscribed from {topic}"),
                            Err(err) => {
                                log::warn!("unsubscribe failed on {topic}: {err}");
                                self.report_transport(err);
                            }
                        }
                    }
                }
                Effect::ArmDeadline(phase) => {
                    let duration = {
                        let config = self
                            .inner
                            .config
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        config.deadlines.for_phase(phase)
                    };
                    *self
                        .inner
                        .deadline
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) =
                        Some((phase, Instant::now() + duration));
                    self.inner.deadline_changed.notify_one();
                }
                Effect::ClearDeadline => {
                    *self
                        .inner
                        .deadline
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = None;
                    self.inner.deadline_changed.notify_one();
                }
                Effect::Notify(notice) => {
                    let _ = self.inner.events.send(SessionEvent::Protocol(notice));
                }
            }
        }
    }

    async fn publish(&self, message: Message) {
        let topic = {
            let topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics.publish_topic(message.kind()).map(str::to_owned)
        };
        let Some(topic) = topic else {
            log::error!("no publish topic for {:?}", message.kind());
            return;
        };
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("encode failed for {:?}: {err}", message.kind());
                return;
            }
        };
        // Fire-and-forget: at-most-once is acceptable for every kind.
        if let Err(err) = self
            .inner
            .transport
            .publish(&topic, payload, QosLevel::AtMostOnce)
            .await
        {
            log::warn!("publish failed on {topic}: {err}");
            self.report_transport(err);
        }
    }

    fn subscription_topic(&self, kind: TopicKind) -> Option<String> {
        let topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.subscribe_topic(kind).map(str::to_owned)
    }

    fn report_transport(&self, err: TransportError) {
        if err.is_retryable() {
            let _ = self.inner.events.send(SessionEvent::ConnectionLost {
                reason: err.to_string(),
            });
        }
    }
}
