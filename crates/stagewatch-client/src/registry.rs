use crate::connection::ConnectionStatus;
use stagewatch_core::{EventKind, NormalizedEvent};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Receives every event, after the topic-specific listeners.
    All,
    Open,
    Close,
    Error,
    StateChange,
    ReconnectScheduled,
    ReconnectExhausted,
    Sim(EventKind),
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::All => "all",
            Topic::Open => "open",
            Topic::Close => "close",
            Topic::Error => "error",
            Topic::StateChange => "state_change",
            Topic::ReconnectScheduled => "reconnect_scheduled",
            Topic::ReconnectExhausted => "reconnect_exhausted",
            Topic::Sim(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        let topic = match normalized.as_str() {
            "all" | "*" => Topic::All,
            "open" => Topic::Open,
            "close" => Topic::Close,
            "error" => Topic::Error,
            "state_change" => Topic::StateChange,
            "reconnect_scheduled" => Topic::ReconnectScheduled,
            "reconnect_exhausted" => Topic::ReconnectExhausted,
            other => EventKind::ALL
                .into_iter()
                .find(|kind| kind.as_str() == other)
                .map(Topic::Sim)
                .ok_or_else(|| format!("Unknown topic: {other}"))?,
        };
        Ok(topic)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Open,
    Close { code: u16, reason: String },
    Error(String),
    StateChange(ConnectionStatus),
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
    Sim(NormalizedEvent),
}

impl ClientEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ClientEvent::Open => Topic::Open,
            ClientEvent::Close { .. } => Topic::Close,
            ClientEvent::Error(_) => Topic::Error,
            ClientEvent::StateChange(_) => Topic::StateChange,
            ClientEvent::ReconnectScheduled { .. } => Topic::ReconnectScheduled,
            ClientEvent::ReconnectExhausted { .. } => Topic::ReconnectExhausted,
            ClientEvent::Sim(event) => Topic::Sim(event.kind()),
        }
    }
}

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

#[derive(Clone)]
struct Listener {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct RegistryInner {
    // Lists are replaced wholesale on change, so dispatch iterates a stable copy.
    topics: Mutex<HashMap<Topic, Arc<Vec<Listener>>>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn remove(&self, topic: Topic, id: u64) -> bool {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = topics.get(&topic) else {
            return false;
        };
        if !current.iter().any(|listener| listener.id == id) {
            return false;
        }
        let remaining: Vec<Listener> = current
            .iter()
            .filter(|listener| listener.id != id)
            .cloned()
            .collect();
        if remaining.is_empty() {
            topics.remove(&topic);
        } else {
            topics.insert(topic, Arc::new(remaining));
        }
        true
    }
}

/// Per-connection publish/subscribe table keyed by [`Topic`].
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            id,
            handler: Arc::new(handler),
        };
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut listeners: Vec<Listener> = topics
            .get(&topic)
            .map(|current| current.as_ref().clone())
            .unwrap_or_default();
        listeners.push(listener);
        topics.insert(topic, Arc::new(listeners));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            topic,
            id,
            active: true,
        }
    }

    pub fn off(&self, subscription: Subscription) -> bool {
        subscription.cancel()
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Runs every listener for the event's topic, then the wildcard listeners.
    /// A panicking listener is logged and stays registered.
    pub fn dispatch(&self, event: &ClientEvent) {
        let topic = event.topic();
        let (specific, wildcard) = {
            let topics = self
                .inner
                .topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (topics.get(&topic).cloned(), topics.get(&Topic::All).cloned())
        };
        for listener in specific.iter().chain(wildcard.iter()).flat_map(|list| list.iter()) {
            let handler = &listener.handler;
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("listener_panicked: topic={topic} id={}", listener.id);
            }
        }
    }
}

/// Disposer for one registered listener. Dropping it removes the listener.
#[must_use = "dropping a Subscription unregisters its listener"]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    topic: Topic,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Keeps the listener registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.active = false;
    }

    pub fn cancel(mut self) -> bool {
        self.active = false;
        self.remove()
    }

    fn remove(&self) -> bool {
        match self.registry.upgrade() {
            Some(inner) => inner.remove(self.topic, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active {
            self.remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}
