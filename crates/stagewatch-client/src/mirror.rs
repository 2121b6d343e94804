use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionStatus};
use crate::registry::{ClientEvent, Subscription, Topic};
use chrono::Utc;
use stagewatch_core::{
    ApplyOutcome, ControlError, Mode, NormalizedEvent, SessionSnapshot, SessionStore, StageNumber,
    StageState, SteppingController, StoreSubscription, Subscribers, TraceStep,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Controller = SteppingController<Arc<ConnectionManager>>;

struct MirrorState {
    store: SessionStore,
    controller: Controller,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayView {
    pub position: usize,
    pub total: usize,
    pub step: TraceStep,
    pub stage: StageState,
}

/// Wires a [`ConnectionManager`] to a [`SessionStore`] and a stepping controller.
///
/// Inbound events cross an unbounded channel to one consumer task, which is the
/// only writer of the store. Subscribers run on that task after the store lock is
/// released, so they may read the mirror or issue controls; they must not
/// subscribe or unsubscribe from inside a callback.
pub struct SessionMirror {
    connection: Arc<ConnectionManager>,
    state: Arc<Mutex<MirrorState>>,
    subscribers: Arc<Mutex<Subscribers>>,
    consumer: JoinHandle<()>,
    _feed: Subscription,
}

impl SessionMirror {
    /// Must be called inside a tokio runtime.
    pub fn open(session_id: &str, config: ConnectionConfig) -> Self {
        let connection = Arc::new(ConnectionManager::new(config));
        let state = Arc::new(Mutex::new(MirrorState {
            store: SessionStore::new(session_id, Utc::now()),
            controller: SteppingController::new(Arc::clone(&connection)),
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let feed = connection.on(Topic::All, move |event| {
            if let ClientEvent::Sim(event) = event {
                let _ = tx.send(event.clone());
            }
        });
        let subscribers = Arc::new(Mutex::new(Subscribers::new()));
        let consumer = tokio::spawn(consume(Arc::clone(&state), Arc::clone(&subscribers), rx));
        connection.open(session_id);

        Self {
            connection,
            state,
            subscribers,
            consumer,
            _feed: feed,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.lock().store.snapshot()
    }

    pub fn subscribe<T, S, F>(&self, selector: S, callback: F) -> StoreSubscription
    where
        T: PartialEq + Send + 'static,
        S: Fn(&SessionSnapshot) -> T + Send + 'static,
        F: FnMut(&T, &SessionSnapshot) + Send + 'static,
    {
        let current = self.snapshot();
        lock_subscribers(&self.subscribers).subscribe(&current, selector, callback)
    }

    pub fn unsubscribe(&self, id: StoreSubscription) -> bool {
        lock_subscribers(&self.subscribers).unsubscribe(id)
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.connection.on(topic, handler)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    pub fn mode(&self) -> Mode {
        self.lock().controller.mode()
    }

    pub fn request_mode_change(&self, mode: Mode, reason: Option<String>) -> Result<Mode, ControlError> {
        let mut state = self.lock();
        let snapshot = state.store.snapshot();
        state.controller.request_mode_change(&snapshot, mode, reason)
    }

    pub fn request_step(
        &self,
        target: Option<StageNumber>,
        reason: Option<String>,
    ) -> Result<StageNumber, ControlError> {
        let mut state = self.lock();
        let snapshot = state.store.snapshot();
        state.controller.request_step(&snapshot, target, reason)
    }

    pub fn pause(&self, reason: Option<String>) {
        self.lock().controller.pause(reason);
    }

    pub fn resume(&self, reason: Option<String>) {
        self.lock().controller.resume(reason);
    }

    pub fn trigger_containment(&self, target: Option<StageNumber>, reason: Option<String>) -> StageNumber {
        self.lock().controller.trigger_containment(target, reason)
    }

    pub fn escalate(&self, target: Option<StageNumber>, reason: Option<String>) -> StageNumber {
        let mut state = self.lock();
        let snapshot = state.store.snapshot();
        state.controller.escalate(&snapshot, target, reason)
    }

    pub fn request_reset(&self, reason: Option<String>) {
        self.lock().controller.request_reset(reason);
    }

    pub fn exit_replay(&self) -> Result<Mode, ControlError> {
        self.lock().controller.exit_replay()
    }

    pub fn replay_forward(&self) -> Result<usize, ControlError> {
        self.with_replay(|controller, snapshot| controller.replay_forward(snapshot))
    }

    pub fn replay_back(&self) -> Result<usize, ControlError> {
        self.with_replay(|controller, snapshot| controller.replay_back(snapshot))
    }

    pub fn replay_to_start(&self) -> Result<usize, ControlError> {
        self.with_replay(|controller, snapshot| controller.replay_to_start(snapshot))
    }

    pub fn replay_to_end(&self) -> Result<usize, ControlError> {
        self.with_replay(|controller, snapshot| controller.replay_to_end(snapshot))
    }

    pub fn replay_seek(&self, index: usize) -> Result<usize, ControlError> {
        self.with_replay(|controller, snapshot| controller.replay_seek(snapshot, index))
    }

    pub fn replay_view(&self) -> Option<ReplayView> {
        let state = self.lock();
        let snapshot = state.store.snapshot();
        let frame = state.controller.replay_frame(&snapshot)?;
        Some(ReplayView {
            position: frame.position,
            total: frame.total,
            step: frame.step.clone(),
            stage: frame.stage.clone(),
        })
    }

    pub fn reconnect(&self) {
        self.connection.reconnect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    fn with_replay<F>(&self, op: F) -> Result<usize, ControlError>
    where
        F: FnOnce(&mut Controller, &SessionSnapshot) -> Result<usize, ControlError>,
    {
        let mut state = self.lock();
        let snapshot = state.store.snapshot();
        op(&mut state.controller, &snapshot)
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionMirror {
    fn drop(&mut self) {
        self.consumer.abort();
        self.connection.disconnect();
    }
}

fn lock_subscribers(subscribers: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn consume(
    state: Arc<Mutex<MirrorState>>,
    subscribers: Arc<Mutex<Subscribers>>,
    mut rx: mpsc::UnboundedReceiver<NormalizedEvent>,
) {
    while let Some(event) = rx.recv().await {
        let applied = {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            let MirrorState { store, controller } = &mut *guard;
            let outcome = store.apply(&event);
            match &outcome {
                ApplyOutcome::Applied { version } => trace!("store_applied: kind={} version={version}", event.kind()),
                ApplyOutcome::Unchanged => {}
                ApplyOutcome::Rejected(reason) => debug!("store_rejected: kind={} {reason}", event.kind()),
            }
            let snapshot = store.snapshot();
            controller.sync(&snapshot);
            outcome.is_applied().then_some(snapshot)
        };
        if let Some(snapshot) = applied {
            lock_subscribers(&subscribers).notify(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ReconnectPolicy;
    use serde_json::json;
    use stagewatch_core::normalize;
    use std::sync::Weak;
    use std::time::Duration;
    use tokio::time::timeout;

    fn unreachable() -> ConnectionConfig {
        ConnectionConfig {
            base_url: "ws://127.0.0.1:1/ws/simulation".to_string(),
            heartbeat_interval: Duration::from_secs(60),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_secs(60),
                max_attempts: 1,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribers_can_read_the_mirror() {
        let mirror = Arc::new(SessionMirror::open("sim-1", unreachable()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle: Weak<SessionMirror> = Arc::downgrade(&mirror);
        mirror.subscribe(
            |snapshot: &SessionSnapshot| snapshot.session().current_stage,
            move |_: &StageNumber, _: &SessionSnapshot| {
                if let Some(mirror) = handle.upgrade() {
                    let _ = tx.send((mirror.snapshot().session().version, mirror.mode()));
                }
            },
        );

        let frame = json!({"type": "layer_complete", "data": {"stage": 2, "confidence": 0.5}});
        let event = normalize(&frame, Utc::now()).expect("normalize");
        mirror
            .connection()
            .registry()
            .dispatch(&ClientEvent::Sim(event));

        let (version, mode) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("callback timeout")
            .expect("callback");
        assert_eq!(version, 1);
        assert_eq!(mode, Mode::Auto);
        mirror.disconnect();
    }
}
