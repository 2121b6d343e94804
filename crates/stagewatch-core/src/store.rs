use crate::model::{Confidence, Mode, SessionStatus, StageNumber, StageStatus, TraceKind};
use crate::normalize::{NormalizedEvent, SimEvent};
use crate::protocol::{
    AgentSpawnPayload, ContainmentTriggerPayload, ForkDetectedPayload, LayerCompletePayload,
    MemoryPatchPayload, StatusUpdatePayload, TraceUpdatePayload,
};
use crate::stage::{self, StageInput, StagePatch, StageState, TransitionError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub current_stage: StageNumber,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TraceStep {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub stage: StageNumber,
    pub stage_name: String,
    pub message: String,
    pub kind: TraceKind,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// The stage as it stood right after this step, for replay.
    pub stage_state: StageState,
}

/// Last progression mode the server reported, tagged with the session version that recorded it.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ModeReport {
    pub mode: Mode,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSnapshot {
    session: Session,
    stages: Vec<StageState>,
    traces: Vec<TraceStep>,
    server_mode: Option<ModeReport>,
}

impl SessionSnapshot {
    fn new(session_id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            session: Session {
                id: session_id,
                status: SessionStatus::Ready,
                current_stage: StageNumber::FIRST,
                version: 0,
                created_at,
            },
            stages: StageNumber::all().map(StageState::new).collect(),
            traces: Vec::new(),
            server_mode: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stage(&self, stage: StageNumber) -> &StageState {
        &self.stages[stage.index()]
    }

    pub fn stages(&self) -> &[StageState] {
        &self.stages
    }

    pub fn traces(&self) -> &[TraceStep] {
        &self.traces
    }

    pub fn server_mode(&self) -> Option<ModeReport> {
        self.server_mode
    }

    /// Mean confidence score over every stage that has left READY.
    pub fn overall_confidence(&self) -> Option<f64> {
        let scores: Vec<f64> = self
            .stages
            .iter()
            .filter(|stage| stage.status != StageStatus::Ready)
            .map(|stage| stage.confidence.score)
            .collect();
        if scores.is_empty() {
            return None;
        }
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied { version: u64 },
    Unchanged,
    Rejected(String),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreSubscription(u64);

struct Subscriber {
    id: StoreSubscription,
    notify: Box<dyn FnMut(&SessionSnapshot) + Send>,
}

/// Selector-filtered change callbacks. [`SessionStore`] owns one; holders that
/// must notify outside their own locks can keep a set of their own.
#[derive(Default)]
pub struct Subscribers {
    entries: Vec<Subscriber>,
    next_id: u64,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// `current` seeds the selected slice, so the first callback only fires on a real change.
    pub fn subscribe<T, S, F>(&mut self, current: &SessionSnapshot, selector: S, mut callback: F) -> StoreSubscription
    where
        T: PartialEq + Send + 'static,
        S: Fn(&SessionSnapshot) -> T + Send + 'static,
        F: FnMut(&T, &SessionSnapshot) + Send + 'static,
    {
        let mut last = selector(current);
        let id = StoreSubscription(self.next_id);
        self.next_id += 1;
        self.entries.push(Subscriber {
            id,
            notify: Box::new(move |snapshot| {
                let selected = selector(snapshot);
                if selected != last {
                    callback(&selected, snapshot);
                    last = selected;
                }
            }),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: StoreSubscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|subscriber| subscriber.id != id);
        before != self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notify(&mut self, snapshot: &SessionSnapshot) {
        for subscriber in self.entries.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| (subscriber.notify)(snapshot))).is_err() {
                error!("store_subscriber_panicked: id={}", subscriber.id.0);
            }
        }
    }
}

pub struct SessionStore {
    snapshot: Arc<SessionSnapshot>,
    trace_ids: HashSet<String>,
    subscribers: Subscribers,
}

impl SessionStore {
    pub fn new(session_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            snapshot: Arc::new(SessionSnapshot::new(session_id.into(), created_at)),
            trace_ids: HashSet::new(),
            subscribers: Subscribers::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Registers `callback` for changes of the slice picked by `selector`.
    /// Callbacks run synchronously inside `apply` and must not re-enter the store.
    pub fn subscribe<T, S, F>(&mut self, selector: S, callback: F) -> StoreSubscription
    where
        T: PartialEq + Send + 'static,
        S: Fn(&SessionSnapshot) -> T + Send + 'static,
        F: FnMut(&T, &SessionSnapshot) + Send + 'static,
    {
        self.subscribers.subscribe(&self.snapshot, selector, callback)
    }

    pub fn unsubscribe(&mut self, id: StoreSubscription) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn apply(&mut self, event: &NormalizedEvent) -> ApplyOutcome {
        let mut draft = Draft::new(&self.snapshot, &self.trace_ids);
        let result = draft.reduce(event);
        let outcome = match result {
            Err(err) => {
                debug!("apply_rejected: kind={} {err}", event.kind());
                ApplyOutcome::Rejected(err.to_string())
            }
            Ok(()) => match draft.finish() {
                None => ApplyOutcome::Unchanged,
                Some(changes) => ApplyOutcome::Applied {
                    version: self.commit(changes),
                },
            },
        };
        if outcome.is_applied() {
            self.notify();
        }
        outcome
    }

    /// Local reset, the same transition an inbound reset status update performs.
    pub fn reset(&mut self, at: DateTime<Utc>) -> ApplyOutcome {
        let event = NormalizedEvent::new(
            SimEvent::StatusUpdate(StatusUpdatePayload {
                reset: true,
                ..StatusUpdatePayload::default()
            }),
            at,
        );
        self.apply(&event)
    }

    fn commit(&mut self, changes: Changes) -> u64 {
        let snapshot = Arc::make_mut(&mut self.snapshot);
        let version = snapshot.session.version + 1;
        snapshot.session.version = version;
        snapshot.session.status = changes.status;
        snapshot.session.current_stage = changes.current_stage;
        for mut step in changes.traces {
            if step.id.is_empty() {
                step.id = format!("{version}-{}", snapshot.traces.len());
            }
            if changes.stages.contains_key(&step.stage) {
                step.stage_state.last_update_version = version;
            }
            self.trace_ids.insert(step.id.clone());
            snapshot.traces.push(step);
        }
        for (number, mut state) in changes.stages {
            state.last_update_version = version;
            snapshot.stages[number.index()] = state;
        }
        if let Some(mode) = changes.server_mode {
            snapshot.server_mode = Some(ModeReport { mode, version });
        }
        version
    }

    fn notify(&mut self) {
        let snapshot = Arc::clone(&self.snapshot);
        self.subscribers.notify(&snapshot);
    }
}

struct Changes {
    status: SessionStatus,
    current_stage: StageNumber,
    stages: BTreeMap<StageNumber, StageState>,
    traces: Vec<TraceStep>,
    server_mode: Option<Mode>,
}

/// Accumulates the effects of one event against an untouched base snapshot,
/// so a rejected event leaves the store as it was.
struct Draft<'a> {
    base: &'a SessionSnapshot,
    trace_ids: &'a HashSet<String>,
    status: SessionStatus,
    current_stage: StageNumber,
    stages: BTreeMap<StageNumber, StageState>,
    traces: Vec<TraceStep>,
    server_mode: Option<Mode>,
}

impl<'a> Draft<'a> {
    fn new(base: &'a SessionSnapshot, trace_ids: &'a HashSet<String>) -> Self {
        Self {
            base,
            trace_ids,
            status: base.session.status,
            current_stage: base.session.current_stage,
            stages: BTreeMap::new(),
            traces: Vec::new(),
            server_mode: None,
        }
    }

    fn finish(self) -> Option<Changes> {
        let stages: BTreeMap<StageNumber, StageState> = self
            .stages
            .into_iter()
            .filter(|(number, state)| self.base.stage(*number) != state)
            .collect();
        let untouched = stages.is_empty()
            && self.traces.is_empty()
            && self.server_mode.is_none()
            && self.status == self.base.session.status
            && self.current_stage == self.base.session.current_stage;
        if untouched {
            return None;
        }
        Some(Changes {
            status: self.status,
            current_stage: self.current_stage,
            stages,
            traces: self.traces,
            server_mode: self.server_mode,
        })
    }

    fn stage(&self, number: StageNumber) -> &StageState {
        self.stages
            .get(&number)
            .unwrap_or_else(|| self.base.stage(number))
    }

    fn reduce(&mut self, event: &NormalizedEvent) -> Result<(), TransitionError> {
        let at = event.at;
        match &event.event {
            SimEvent::StatusUpdate(payload) => self.status_update(payload, at),
            SimEvent::LayerComplete(payload) => self.layer_complete(payload, at),
            SimEvent::TraceUpdate(payload) => self.trace_update(payload, at),
            SimEvent::AgentSpawn(payload) => self.agent_spawn(payload, at),
            SimEvent::MemoryPatch(payload) => {
                self.memory_patch(payload, at);
                Ok(())
            }
            SimEvent::ForkDetected(payload) => self.fork_detected(payload, at),
            SimEvent::ContainmentTrigger(payload) => self.containment(payload, at),
            SimEvent::Heartbeat(_) => Ok(()),
            SimEvent::Message { kind, .. } => {
                debug!("apply_unhandled_message: kind={kind}");
                Ok(())
            }
        }
    }

    fn status_update(&mut self, payload: &StatusUpdatePayload, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if payload.reset {
            self.reset(at);
            return Ok(());
        }

        if let Some(number) = payload.stage {
            let terminal = self.stage(number).status.is_terminal();
            let completing = payload.stage_status == Some(StageStatus::Completed);
            let patch = StagePatch {
                confidence: if completing || terminal {
                    None
                } else {
                    payload.confidence
                },
                forked: payload.forked,
                active_workers: if terminal { None } else { payload.active_agents },
                active_plugins: if terminal {
                    None
                } else {
                    payload.active_plugins.clone()
                },
            };
            if !patch.is_empty() {
                self.transition(number, StageInput::Patch(patch), at)?;
            }

            for input in self.status_inputs(number, payload) {
                let message = payload.message.clone();
                self.transition_traced(number, input, at, message)?;
            }
        }

        if let Some(status) = payload.status {
            self.set_status(status);
        }
        if let Some(mode) = payload.mode {
            self.server_mode = Some(mode);
        }
        Ok(())
    }

    /// Stage inputs carried by a status update. The containment flag outranks
    /// `stage_status`; the escalation flag rides along with it.
    fn status_inputs(&self, number: StageNumber, payload: &StatusUpdatePayload) -> Vec<StageInput> {
        if payload.contained == Some(true) {
            return vec![StageInput::Contain];
        }
        let escalated = payload.escalated == Some(true);
        match payload.stage_status {
            Some(StageStatus::Running) => {
                let enter = StageInput::Enter {
                    reevaluation: self.status == SessionStatus::Escalated,
                };
                if escalated {
                    vec![enter, StageInput::Escalate]
                } else {
                    vec![enter]
                }
            }
            Some(StageStatus::Completed) => vec![StageInput::Complete {
                confidence: payload
                    .confidence
                    .unwrap_or(self.stage(number).confidence),
                escalated,
                forked: payload.forked.unwrap_or(false),
            }],
            Some(StageStatus::Escalated) => vec![StageInput::Escalate],
            Some(StageStatus::Failed) => vec![StageInput::Fail],
            Some(StageStatus::Contained) => vec![StageInput::Contain],
            Some(StageStatus::Ready) | None if escalated => vec![StageInput::Escalate],
            Some(StageStatus::Ready) | None => Vec::new(),
        }
    }

    fn layer_complete(&mut self, payload: &LayerCompletePayload, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.rename(payload.stage, payload.stage_name.as_deref());
        let changed = self.transition(
            payload.stage,
            StageInput::Complete {
                confidence: payload.confidence,
                escalated: payload.escalated,
                forked: payload.forked,
            },
            at,
        )?;
        if changed {
            let (kind, verb) = if payload.escalated {
                (TraceKind::Escalation, "escalated")
            } else {
                (TraceKind::StageExit, "completed")
            };
            let message = format!("{} {verb}", self.stage(payload.stage).name);
            self.push_trace(payload.stage, kind, message, at, None, payload.output.clone());
        }
        Ok(())
    }

    fn trace_update(&mut self, payload: &TraceUpdatePayload, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if let Some(id) = payload.id.as_deref() {
            if self.trace_ids.contains(id) || self.traces.iter().any(|step| step.id == id) {
                return Ok(());
            }
        }
        match payload.event_type {
            TraceKind::StageEntry => {
                let reevaluation = self.status == SessionStatus::Escalated;
                self.transition(payload.stage, StageInput::Enter { reevaluation }, at)?;
            }
            TraceKind::ForkDetected => {
                self.transition(payload.stage, StageInput::MarkForked, at)?;
            }
            _ => {}
        }
        self.rename(payload.stage, payload.stage_name.as_deref());
        let stage_state = self.stage(payload.stage).clone();
        let stage_name = stage_state.name.clone();
        let confidence = payload.confidence.unwrap_or(stage_state.confidence);
        self.traces.push(TraceStep {
            id: payload.id.clone().unwrap_or_default(),
            timestamp: payload.timestamp.unwrap_or(at),
            stage: payload.stage,
            stage_name,
            message: payload.message.clone(),
            kind: payload.event_type,
            confidence,
            input: payload.input.clone(),
            output: payload.output.clone(),
            stage_state,
        });
        Ok(())
    }

    fn agent_spawn(&mut self, payload: &AgentSpawnPayload, at: DateTime<Utc>) -> Result<(), TransitionError> {
        let changed = self.transition(
            payload.stage,
            StageInput::SpawnWorker {
                count: payload.count,
            },
            at,
        )?;
        if changed {
            let message = match payload.agent_id.as_deref() {
                Some(agent_id) => format!("sub-worker {agent_id} spawned"),
                None => "sub-worker spawned".to_string(),
            };
            self.push_trace(payload.stage, TraceKind::SubWorkerSpawn, message, at, None, None);
        }
        Ok(())
    }

    fn memory_patch(&mut self, payload: &MemoryPatchPayload, at: DateTime<Utc>) {
        let number = payload.stage.unwrap_or(self.current_stage);
        if let Some(plugins) = payload.active_plugins.as_ref() {
            if !self.stage(number).status.is_terminal() {
                let patch = StagePatch {
                    active_plugins: Some(plugins.clone()),
                    ..StagePatch::default()
                };
                // Patches on a live stage cannot be refused.
                let _ = self.transition(number, StageInput::Patch(patch), at);
            }
        }
        if payload.patch.is_null() && payload.active_plugins.is_none() {
            return;
        }
        let output = (!payload.patch.is_null()).then(|| payload.patch.clone());
        self.push_trace(number, TraceKind::StatePatch, "state patched".to_string(), at, None, output);
    }

    fn fork_detected(&mut self, payload: &ForkDetectedPayload, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(payload.stage, StageInput::MarkForked, at)?;
        let message = match (payload.branch_id.as_deref(), payload.reason.as_deref()) {
            (Some(branch), Some(reason)) => format!("fork {branch}: {reason}"),
            (Some(branch), None) => format!("fork {branch}"),
            (None, Some(reason)) => format!("fork: {reason}"),
            (None, None) => "fork detected".to_string(),
        };
        self.push_trace(payload.stage, TraceKind::ForkDetected, message, at, None, None);
        Ok(())
    }

    fn containment(&mut self, payload: &ContainmentTriggerPayload, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition_traced(payload.stage, StageInput::Contain, at, payload.reason.clone())?;
        Ok(())
    }

    fn reset(&mut self, at: DateTime<Utc>) {
        for number in StageNumber::all() {
            let current = self.stage(number).clone();
            if let Ok(next) = stage::transition(&current, &StageInput::Reset, at) {
                self.stages.insert(number, next);
            }
        }
        self.status = SessionStatus::Ready;
        self.current_stage = StageNumber::FIRST;
        self.push_trace(
            StageNumber::FIRST,
            TraceKind::AuditEvent,
            "session reset".to_string(),
            at,
            None,
            None,
        );
    }

    fn rename(&mut self, number: StageNumber, name: Option<&str>) {
        let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) else {
            return;
        };
        if self.stage(number).name == name {
            return;
        }
        let mut state = self.stage(number).clone();
        state.name = name.to_string();
        self.stages.insert(number, state);
    }

    /// Runs one stage transition; returns whether the stage changed.
    fn transition(&mut self, number: StageNumber, input: StageInput, at: DateTime<Utc>) -> Result<bool, TransitionError> {
        let current = self.stage(number);
        let next = stage::transition(current, &input, at)?;
        if next == *current {
            return Ok(false);
        }
        let outcome = next.status;
        self.stages.insert(number, next);
        self.settle(number, &input, outcome);
        Ok(true)
    }

    fn transition_traced(
        &mut self,
        number: StageNumber,
        input: StageInput,
        at: DateTime<Utc>,
        message: Option<String>,
    ) -> Result<bool, TransitionError> {
        let kind = match &input {
            StageInput::Enter { .. } => TraceKind::StageEntry,
            StageInput::Complete { escalated: true, .. } | StageInput::Escalate => TraceKind::Escalation,
            StageInput::Complete { .. } => TraceKind::StageExit,
            StageInput::Contain => TraceKind::Containment,
            _ => TraceKind::AuditEvent,
        };
        let changed = self.transition(number, input, at)?;
        if changed {
            let name = &self.stage(number).name;
            let status = self.stage(number).status;
            let message = message.unwrap_or_else(|| format!("{name} {status}"));
            self.push_trace(number, kind, message, at, None, None);
        }
        Ok(changed)
    }

    /// Session-level consequences of a stage change.
    fn settle(&mut self, number: StageNumber, input: &StageInput, outcome: StageStatus) {
        match input {
            StageInput::Enter { .. } => {
                self.current_stage = number;
                if matches!(
                    self.status,
                    SessionStatus::Ready
                        | SessionStatus::Escalated
                        | SessionStatus::Completed
                        | SessionStatus::Failed
                ) {
                    self.set_status(SessionStatus::Running);
                }
            }
            StageInput::Complete { .. } => {
                self.current_stage = self.current_stage.max(number);
                match outcome {
                    StageStatus::Escalated => self.set_status(SessionStatus::Escalated),
                    StageStatus::Completed if number.is_last() => {
                        self.set_status(SessionStatus::Completed)
                    }
                    _ if self.status == SessionStatus::Ready => {
                        self.set_status(SessionStatus::Running)
                    }
                    _ => {}
                }
            }
            StageInput::Escalate => self.set_status(SessionStatus::Escalated),
            StageInput::Fail => self.set_status(SessionStatus::Failed),
            StageInput::Contain if number.is_last() => self.set_status(SessionStatus::Contained),
            _ => {}
        }
    }

    /// Containment is sticky: only a reset leaves it.
    fn set_status(&mut self, status: SessionStatus) {
        if self.status == SessionStatus::Contained && status != SessionStatus::Contained {
            debug!("session_contained: ignoring transition to {status}");
            return;
        }
        self.status = status;
    }

    fn push_trace(
        &mut self,
        number: StageNumber,
        kind: TraceKind,
        message: String,
        at: DateTime<Utc>,
        input: Option<Value>,
        output: Option<Value>,
    ) {
        let stage = self.stage(number);
        let step = TraceStep {
            id: String::new(),
            timestamp: at,
            stage: number,
            stage_name: stage.name.clone(),
            message,
            kind,
            confidence: stage.confidence,
            input,
            output,
            stage_state: stage.clone(),
        };
        self.traces.push(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn stage(value: u8) -> StageNumber {
        StageNumber::new(value).expect("valid stage")
    }

    fn event(value: Value) -> NormalizedEvent {
        normalize(&value, ts(0)).expect("normalize")
    }

    fn layer_complete(number: u8, score: f64) -> NormalizedEvent {
        event(json!({"type": "layer_complete", "data": {"stage": number, "confidence": score}}))
    }

    fn store() -> SessionStore {
        SessionStore::new("sim-1", ts(0))
    }

    #[test]
    fn fresh_store_has_ten_ready_stages() {
        let snapshot = store().snapshot();
        assert_eq!(snapshot.stages().len(), 10);
        assert!(snapshot
            .stages()
            .iter()
            .all(|stage| stage.status == StageStatus::Ready));
        assert_eq!(snapshot.session().status, SessionStatus::Ready);
        assert_eq!(snapshot.overall_confidence(), None);
    }

    #[test]
    fn two_completions_advance_stage_and_average_confidence() {
        let mut store = store();
        store.apply(&event(json!({"type": "status_update", "data": {"status": "running"}})));
        store.apply(&layer_complete(1, 0.95));
        store.apply(&layer_complete(2, 0.40));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.stage(stage(1)).status, StageStatus::Completed);
        assert_eq!(snapshot.stage(stage(1)).confidence.score, 0.95);
        assert_eq!(snapshot.stage(stage(2)).status, StageStatus::Completed);
        assert_eq!(snapshot.stage(stage(2)).confidence.score, 0.40);
        assert_eq!(snapshot.session().current_stage, stage(2));
        assert_eq!(snapshot.session().status, SessionStatus::Running);
        let overall = snapshot.overall_confidence().expect("overall");
        assert!((overall - 0.675).abs() < 1e-9, "overall was {overall}");
    }

    #[test]
    fn duplicate_layer_complete_leaves_state_identical() {
        let mut store = store();
        let complete = layer_complete(4, 0.61);
        assert!(store.apply(&complete).is_applied());
        let once = store.snapshot();
        assert_eq!(store.apply(&complete), ApplyOutcome::Unchanged);
        assert_eq!(*store.snapshot(), *once);
    }

    #[test]
    fn completion_confidence_tracks_last_received_value() {
        let mut store = store();
        for score in [0.2, 0.9, 0.55] {
            store.apply(&layer_complete(3, score));
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.stage(stage(3)).status, StageStatus::Completed);
        assert_eq!(snapshot.stage(stage(3)).confidence.score, 0.55);
    }

    #[test]
    fn containment_on_final_stage_is_sticky() {
        let mut store = store();
        store.apply(&layer_complete(9, 0.8));
        store.apply(&event(json!({"type": "containment_trigger", "data": {"reason": "policy"}})));
        assert_eq!(store.snapshot().session().status, SessionStatus::Contained);
        assert_eq!(
            store.snapshot().stage(StageNumber::LAST).status,
            StageStatus::Contained
        );

        store.apply(&layer_complete(5, 0.7));
        store.apply(&event(json!({"type": "status_update", "data": {"status": "running"}})));
        store.apply(&event(json!({"type": "trace_update", "data": {
            "stage": 6, "message": "enter", "event_type": "stage-entry"
        }})));
        assert_eq!(store.snapshot().session().status, SessionStatus::Contained);
        assert!(matches!(
            store.apply(&layer_complete(10, 0.9)),
            ApplyOutcome::Rejected(_)
        ));

        assert!(store.reset(ts(5)).is_applied());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.session().status, SessionStatus::Ready);
        assert!(snapshot
            .stages()
            .iter()
            .all(|stage| stage.status == StageStatus::Ready));
        assert_eq!(
            snapshot.traces().last().map(|step| step.kind),
            Some(TraceKind::AuditEvent)
        );
    }

    #[test]
    fn containment_on_earlier_stage_leaves_session_running() {
        let mut store = store();
        store.apply(&layer_complete(1, 0.9));
        store.apply(&event(json!({"type": "containment_trigger", "data": {"stage": 2}})));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.stage(stage(2)).status, StageStatus::Contained);
        assert_eq!(snapshot.session().status, SessionStatus::Running);
    }

    #[test]
    fn contained_flag_outranks_stage_status() {
        let mut store = store();
        let outcome = store.apply(&event(json!({"type": "status_update", "data": {
            "stage": 10, "stage_status": "completed", "contained": true
        }})));
        assert!(outcome.is_applied());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.stage(StageNumber::LAST).status, StageStatus::Contained);
        assert!(snapshot.stage(StageNumber::LAST).contained);
        assert_eq!(snapshot.session().status, SessionStatus::Contained);
        assert_eq!(
            snapshot.traces().last().map(|step| step.kind),
            Some(TraceKind::Containment)
        );
    }

    #[test]
    fn escalated_flag_rides_along_with_stage_status() {
        let mut completed = store();
        completed.apply(&event(json!({"type": "status_update", "data": {
            "stage": 4, "stage_status": "completed", "escalated": true, "confidence": 0.3
        }})));
        let snapshot = completed.snapshot();
        assert_eq!(snapshot.stage(stage(4)).status, StageStatus::Escalated);
        assert!(snapshot.stage(stage(4)).escalated);
        assert_eq!(snapshot.stage(stage(4)).confidence.score, 0.3);
        assert_eq!(snapshot.session().status, SessionStatus::Escalated);

        let mut running = store();
        running.apply(&event(json!({"type": "status_update", "data": {
            "stage": 2, "stage_status": "running", "escalated": true
        }})));
        let snapshot = running.snapshot();
        assert_eq!(snapshot.stage(stage(2)).status, StageStatus::Escalated);
        assert!(snapshot.stage(stage(2)).escalated);
        assert_eq!(snapshot.session().current_stage, stage(2));
        assert_eq!(snapshot.session().status, SessionStatus::Escalated);
    }

    #[test]
    fn escalation_holds_until_next_stage_entry() {
        let mut store = store();
        store.apply(&layer_complete(3, 0.9));
        store.apply(&event(json!({"type": "layer_complete", "data": {
            "stage": 4, "confidence": 0.2, "escalated": true
        }})));
        assert_eq!(store.snapshot().session().status, SessionStatus::Escalated);

        store.apply(&event(json!({"type": "status_update", "data": {"stage": 5, "forked": true}})));
        assert_eq!(store.snapshot().session().status, SessionStatus::Escalated);

        let reentry = store.apply(&event(json!({"type": "status_update", "data": {
            "stage": 3, "stage_status": "running"
        }})));
        assert!(reentry.is_applied());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.session().status, SessionStatus::Running);
        assert_eq!(snapshot.session().current_stage, stage(3));
        assert_eq!(snapshot.stage(stage(3)).status, StageStatus::Running);
    }

    #[test]
    fn stale_entry_for_completed_stage_is_rejected() {
        let mut store = store();
        store.apply(&layer_complete(1, 0.9));
        let before = store.snapshot();
        let outcome = store.apply(&event(json!({"type": "status_update", "data": {
            "stage": 1, "stage_status": "running", "active_agents": 3
        }})));
        assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
        assert_eq!(*store.snapshot(), *before);
    }

    #[test]
    fn fork_is_informational_only() {
        let mut store = store();
        store.apply(&layer_complete(1, 0.9));
        store.apply(&event(json!({"type": "fork_detected", "data": {"stage": 1, "branch_id": "b-2"}})));
        let snapshot = store.snapshot();
        assert!(snapshot.stage(stage(1)).forked);
        assert_eq!(snapshot.stage(stage(1)).status, StageStatus::Completed);
        assert_eq!(snapshot.session().status, SessionStatus::Running);
        let last = snapshot.traces().last().expect("trace");
        assert_eq!(last.kind, TraceKind::ForkDetected);
        assert_eq!(last.message, "fork b-2");
    }

    #[test]
    fn traces_keep_arrival_order_and_drop_known_ids() {
        let mut store = store();
        let late = event(json!({"type": "trace_update", "data": {
            "id": "t-2", "timestamp": "2026-01-01T00:00:02Z",
            "stage": 1, "message": "second", "event_type": "audit-event"
        }}));
        let early = event(json!({"type": "trace_update", "data": {
            "id": "t-1", "timestamp": "2026-01-01T00:00:01Z",
            "stage": 1, "message": "first", "event_type": "compliance-check"
        }}));
        store.apply(&late);
        store.apply(&early);
        assert_eq!(store.apply(&late), ApplyOutcome::Unchanged);

        let snapshot = store.snapshot();
        let ids: Vec<&str> = snapshot.traces().iter().map(|step| step.id.as_str()).collect();
        assert_eq!(ids, vec!["t-2", "t-1"]);
    }

    #[test]
    fn worker_spawns_and_patches_update_stage() {
        let mut store = store();
        store.apply(&event(json!({"type": "trace_update", "data": {
            "stage": 2, "stage_name": "Retrieval", "message": "enter", "event_type": "stage-entry"
        }})));
        store.apply(&event(json!({"type": "agent_spawn", "data": {"stage": 2, "agent_id": "w-1"}})));
        store.apply(&event(json!({"type": "agent_spawn", "data": {"stage": 2, "agent_id": "w-2"}})));
        store.apply(&event(json!({"type": "memory_patch", "data": {
            "stage": 2, "patch": {"k": "v"}, "active_plugins": ["audit", "redact"]
        }})));

        let snapshot = store.snapshot();
        let retrieval = snapshot.stage(stage(2));
        assert_eq!(retrieval.name, "Retrieval");
        assert_eq!(retrieval.status, StageStatus::Running);
        assert_eq!(retrieval.active_workers, 2);
        assert_eq!(retrieval.active_plugins, vec!["audit", "redact"]);
        let kinds: Vec<TraceKind> = snapshot.traces().iter().map(|step| step.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TraceKind::StageEntry,
                TraceKind::SubWorkerSpawn,
                TraceKind::SubWorkerSpawn,
                TraceKind::StatePatch,
            ]
        );
        assert_eq!(snapshot.traces()[3].output, Some(json!({"k": "v"})));
    }

    #[test]
    fn versions_only_move_on_applied_events() {
        let mut store = store();
        store.apply(&event(json!({"type": "heartbeat"})));
        store.apply(&event(json!({"type": "mystery", "data": {}})));
        assert_eq!(store.snapshot().session().version, 0);

        store.apply(&layer_complete(1, 0.5));
        store.apply(&layer_complete(2, 0.5));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.session().version, 2);
        assert_eq!(snapshot.stage(stage(1)).last_update_version, 1);
        assert_eq!(snapshot.stage(stage(2)).last_update_version, 2);
        assert_eq!(snapshot.stage(stage(3)).last_update_version, 0);
    }

    #[test]
    fn mode_reports_are_versioned() {
        let mut store = store();
        store.apply(&event(json!({"type": "status_update", "data": {"mode": "stepping", "status": "stepping"}})));
        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.server_mode(),
            Some(ModeReport {
                mode: Mode::Stepping,
                version: 1
            })
        );
        assert_eq!(snapshot.session().status, SessionStatus::Stepping);
    }

    #[test]
    fn final_stage_completion_completes_session() {
        let mut store = store();
        for number in 1..=10 {
            store.apply(&layer_complete(number, 0.8));
        }
        assert_eq!(store.snapshot().session().status, SessionStatus::Completed);
        assert_eq!(store.snapshot().session().current_stage, StageNumber::LAST);
    }

    #[test]
    fn subscribers_fire_only_when_their_slice_changes() {
        let mut store = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(
            |snapshot: &SessionSnapshot| snapshot.session().current_stage,
            move |stage, _| sink.lock().expect("lock").push(stage.get()),
        );

        store.apply(&layer_complete(1, 0.5));
        store.apply(&event(json!({"type": "agent_spawn", "data": {"stage": 2}})));
        store.apply(&layer_complete(2, 0.5));
        store.apply(&layer_complete(3, 0.5));

        assert_eq!(*seen.lock().expect("lock"), vec![2, 3]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let mut store = store();
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        store.subscribe(
            |snapshot: &SessionSnapshot| snapshot.session().version,
            |_, _| panic!("subscriber failure"),
        );
        let id = store.subscribe(
            |snapshot: &SessionSnapshot| snapshot.session().version,
            move |_, _| *counter.lock().expect("lock") += 1,
        );
        store.apply(&layer_complete(1, 0.5));
        assert_eq!(*hits.lock().expect("lock"), 1);

        assert!(store.unsubscribe(id));
        store.apply(&layer_complete(2, 0.5));
        assert_eq!(*hits.lock().expect("lock"), 1);
    }
}
