use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use relay_core::events::Event;

use crate::gate::RunGate;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Ordered transformer/filter applied to every event before delivery.
///
/// Hooks are enrichment, not authorization: a hook that fails is skipped
/// and publication continues with the event as it stood before that hook.
pub trait EventHook: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap pre-check; a hook that returns false is not invoked for this
    /// event.
    fn should_process(&self, event: &Event) -> bool {
        let _ = event;
        true
    }

    /// Transform the event. `Ok(None)` drops it entirely — no subscriber
    /// sees it.
    fn process(&self, event: Event) -> anyhow::Result<Option<Event>>;
}

/// A delivery target. `handle` runs on the subscriber's own worker task,
/// so deliveries for one subscriber are serialized in publish order and a
/// slow or failing subscriber never affects the others.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    fn new() -> Self {
        Self(format!("sub_{}", Uuid::now_v7()))
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct SubscriberEntry {
    id: SubscriptionId,
    name: String,
    tx: mpsc::Sender<Event>,
}

/// Publishes events through the hook pipeline, then fans them out to every
/// registered subscriber via per-subscriber bounded queues.
///
/// The registries are guarded by their own short-lived locks; delivery
/// always works on a point-in-time snapshot, so a subscriber added
/// mid-fan-out does not see in-flight events and a removed one is never
/// delivered to.
pub struct EventBus {
    hooks: RwLock<Vec<Arc<dyn EventHook>>>,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    gate: Arc<RunGate>,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new(gate: Arc<RunGate>) -> Self {
        Self::with_queue_capacity(gate, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(gate: Arc<RunGate>, queue_capacity: usize) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            gate,
            queue_capacity,
        }
    }

    pub fn gate(&self) -> &Arc<RunGate> {
        &self.gate
    }

    /// Append a hook; hooks run in registration order.
    pub fn register_hook(&self, hook: Arc<dyn EventHook>) {
        self.hooks.write().push(hook);
    }

    /// Remove the first hook with the given name.
    pub fn unregister_hook(&self, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        match hooks.iter().position(|h| h.name() == name) {
            Some(idx) => {
                hooks.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Register a subscriber and start its delivery worker.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId::new();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let gate = Arc::clone(&self.gate);
        let worker_subscriber = Arc::clone(&subscriber);
        tokio::spawn(deliver_loop(rx, worker_subscriber, gate));

        self.subscribers.write().push(SubscriberEntry {
            id: id.clone(),
            name: subscriber.name().to_string(),
            tx,
        });
        id
    }

    /// Remove a subscriber. Its worker drains queued events and exits.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        match subs.iter().position(|s| &s.id == id) {
            Some(idx) => {
                subs.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Run the event through every hook in order, then fan the survivor
    /// out to a snapshot of the subscriber set.
    ///
    /// Hook execution is sequential and synchronous relative to publish;
    /// delivery is asynchronous per subscriber and never blocks the
    /// publisher — a full delivery queue drops the event for that
    /// subscriber with a warning.
    pub fn publish(&self, event: Event) {
        let hooks: Vec<Arc<dyn EventHook>> = self.hooks.read().clone();

        let mut current = event;
        for hook in &hooks {
            if !hook.should_process(&current) {
                continue;
            }
            match hook.process(current.clone()) {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    debug!(hook = hook.name(), event_type = %current.event_type, "event dropped by hook");
                    return;
                }
                Err(e) => {
                    warn!(hook = hook.name(), error = %e, "hook failed, continuing with unmodified event");
                }
            }
        }

        let targets: Vec<(String, mpsc::Sender<Event>)> = self
            .subscribers
            .read()
            .iter()
            .map(|s| (s.name.clone(), s.tx.clone()))
            .collect();

        for (name, tx) in targets {
            match tx.try_send(current.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %name, event_type = %current.event_type, "delivery queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Per-subscriber delivery worker: consult the gate, then hand the event
/// to the subscriber. Faults are isolated here — a failing subscriber
/// never affects the publisher or its peers.
async fn deliver_loop(
    mut rx: mpsc::Receiver<Event>,
    subscriber: Arc<dyn Subscriber>,
    gate: Arc<RunGate>,
) {
    while let Some(event) = rx.recv().await {
        match gate.should_handle(&event) {
            Ok(true) => {
                if let Err(e) = subscriber.handle(event).await {
                    warn!(subscriber = subscriber.name(), error = %e, "subscriber failed to handle event");
                }
            }
            Ok(false) => {
                debug!(
                    subscriber = subscriber.name(),
                    event_type = %event.event_type,
                    "event suppressed for inactive run"
                );
            }
            Err(e) => {
                error!(subscriber = subscriber.name(), error = %e, "gate fault, event not delivered");
            }
        }
    }
}
