use crate::model::{Confidence, StageNumber, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageState {
    pub stage: StageNumber,
    pub name: String,
    pub status: StageStatus,
    pub confidence: Confidence,
    pub escalated: bool,
    pub forked: bool,
    pub contained: bool,
    pub active_workers: u32,
    #[serde(default)]
    pub active_plugins: Vec<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub last_update_version: u64,
}

impl StageState {
    pub fn new(stage: StageNumber) -> Self {
        Self {
            stage,
            name: default_stage_name(stage),
            status: StageStatus::Ready,
            confidence: Confidence::default(),
            escalated: false,
            forked: false,
            contained: false,
            active_workers: 0,
            active_plugins: Vec::new(),
            started_at: None,
            ended_at: None,
            last_update_version: 0,
        }
    }
}

pub fn default_stage_name(stage: StageNumber) -> String {
    format!("Stage {stage}")
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StagePatch {
    pub confidence: Option<Confidence>,
    pub forked: Option<bool>,
    pub active_workers: Option<u32>,
    pub active_plugins: Option<Vec<String>>,
}

impl StagePatch {
    pub fn is_empty(&self) -> bool {
        self.confidence.is_none()
            && self.forked.is_none()
            && self.active_workers.is_none()
            && self.active_plugins.is_none()
    }

    fn touches_progress(&self) -> bool {
        self.confidence.is_some() || self.active_workers.is_some() || self.active_plugins.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    /// `reevaluation` is set while the session is escalated, which lets a completed stage run again.
    Enter { reevaluation: bool },
    Complete {
        confidence: Confidence,
        escalated: bool,
        forked: bool,
    },
    Escalate,
    Fail,
    Contain,
    Patch(StagePatch),
    SpawnWorker { count: Option<u32> },
    MarkForked,
    Reset,
}

impl StageInput {
    pub fn label(&self) -> &'static str {
        match self {
            StageInput::Enter { .. } => "enter",
            StageInput::Complete { .. } => "complete",
            StageInput::Escalate => "escalate",
            StageInput::Fail => "fail",
            StageInput::Contain => "contain",
            StageInput::Patch(_) => "patch",
            StageInput::SpawnWorker { .. } => "spawn_worker",
            StageInput::MarkForked => "mark_forked",
            StageInput::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("stage {stage} is {status}; refusing to regress to running")]
    Regression {
        stage: StageNumber,
        status: StageStatus,
    },
    #[error("stage {stage} is terminal ({status}); {input} ignored")]
    Terminal {
        stage: StageNumber,
        status: StageStatus,
        input: &'static str,
    },
}

/// Pure stage transition. Returns the next state, which equals `state` when the
/// input is a duplicate. The caller stamps `last_update_version`.
pub fn transition(
    state: &StageState,
    input: &StageInput,
    at: DateTime<Utc>,
) -> Result<StageState, TransitionError> {
    let mut next = state.clone();
    let terminal = |input: &StageInput| TransitionError::Terminal {
        stage: state.stage,
        status: state.status,
        input: input.label(),
    };

    match input {
        StageInput::Enter { reevaluation } => match state.status {
            StageStatus::Running => {}
            StageStatus::Ready | StageStatus::Escalated => begin(&mut next, at),
            StageStatus::Completed if *reevaluation => begin(&mut next, at),
            StageStatus::Completed => {
                return Err(TransitionError::Regression {
                    stage: state.stage,
                    status: state.status,
                })
            }
            StageStatus::Contained | StageStatus::Failed => return Err(terminal(input)),
        },
        StageInput::Complete {
            confidence,
            escalated,
            forked,
        } => {
            let outcome = if *escalated {
                StageStatus::Escalated
            } else {
                StageStatus::Completed
            };
            match state.status {
                status if status == outcome => {
                    next.confidence = *confidence;
                    next.forked |= *forked;
                }
                StageStatus::Ready | StageStatus::Running | StageStatus::Escalated => {
                    next.status = outcome;
                    next.confidence = *confidence;
                    next.escalated = *escalated;
                    next.forked |= *forked;
                    next.started_at.get_or_insert(at);
                    next.ended_at = Some(at);
                }
                _ => return Err(terminal(input)),
            }
        }
        StageInput::Escalate => match state.status {
            StageStatus::Escalated => {}
            StageStatus::Ready | StageStatus::Running => {
                next.status = StageStatus::Escalated;
                next.escalated = true;
                next.started_at.get_or_insert(at);
                next.ended_at = Some(at);
            }
            _ => return Err(terminal(input)),
        },
        StageInput::Fail => match state.status {
            StageStatus::Failed => {}
            StageStatus::Ready | StageStatus::Running | StageStatus::Escalated => {
                next.status = StageStatus::Failed;
                next.started_at.get_or_insert(at);
                next.ended_at = Some(at);
            }
            _ => return Err(terminal(input)),
        },
        StageInput::Contain => match state.status {
            StageStatus::Contained => {}
            StageStatus::Failed => return Err(terminal(input)),
            _ => {
                next.status = StageStatus::Contained;
                next.contained = true;
                next.active_workers = 0;
                next.started_at.get_or_insert(at);
                next.ended_at = Some(at);
            }
        },
        StageInput::Patch(patch) => {
            if let Some(forked) = patch.forked {
                next.forked |= forked;
            }
            if state.status.is_terminal() {
                if patch.touches_progress() && next == *state {
                    return Err(terminal(input));
                }
            } else {
                if let Some(confidence) = patch.confidence {
                    next.confidence = confidence;
                }
                if let Some(workers) = patch.active_workers {
                    next.active_workers = workers;
                }
                if let Some(plugins) = patch.active_plugins.as_ref() {
                    next.active_plugins = plugins.clone();
                }
            }
        }
        StageInput::SpawnWorker { count } => {
            if state.status.is_terminal() {
                return Err(terminal(input));
            }
            next.active_workers = match count {
                Some(count) => *count,
                None => state.active_workers.saturating_add(1),
            };
        }
        StageInput::MarkForked => next.forked = true,
        StageInput::Reset => {
            next = StageState::new(state.stage);
            next.name = state.name.clone();
            next.last_update_version = state.last_update_version;
        }
    }

    Ok(next)
}

fn begin(next: &mut StageState, at: DateTime<Utc>) {
    next.status = StageStatus::Running;
    next.escalated = false;
    next.started_at = Some(at);
    next.ended_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn stage(value: u8) -> StageState {
        StageState::new(StageNumber::new(value).expect("stage"))
    }

    fn complete(score: f64) -> StageInput {
        StageInput::Complete {
            confidence: Confidence::from_score(score),
            escalated: false,
            forked: false,
        }
    }

    fn run(state: &StageState, inputs: &[StageInput]) -> Result<StageState, TransitionError> {
        let mut current = state.clone();
        for (offset, input) in inputs.iter().enumerate() {
            current = transition(&current, input, ts(offset as i64))?;
        }
        Ok(current)
    }

    #[test]
    fn ready_stage_completes_with_implicit_entry() {
        let done = transition(&stage(1), &complete(0.95), ts(0)).expect("complete");
        assert_eq!(done.status, StageStatus::Completed);
        assert_eq!(done.confidence.score, 0.95);
        assert_eq!(done.started_at, Some(ts(0)));
        assert_eq!(done.ended_at, Some(ts(0)));
    }

    #[test]
    fn duplicate_completion_is_a_no_op() {
        let done = run(&stage(3), &[StageInput::Enter { reevaluation: false }, complete(0.7)])
            .expect("complete");
        let again = transition(&done, &complete(0.7), ts(50)).expect("duplicate");
        assert_eq!(again, done);
    }

    #[test]
    fn later_completion_updates_confidence_only() {
        let done = transition(&stage(3), &complete(0.7), ts(0)).expect("complete");
        let updated = transition(&done, &complete(0.2), ts(10)).expect("update");
        assert_eq!(updated.status, StageStatus::Completed);
        assert_eq!(updated.confidence.score, 0.2);
        assert_eq!(updated.ended_at, done.ended_at);
    }

    #[test]
    fn completed_stage_refuses_stale_entry_unless_reevaluating() {
        let done = transition(&stage(2), &complete(0.5), ts(0)).expect("complete");
        let stale = transition(&done, &StageInput::Enter { reevaluation: false }, ts(1));
        assert!(matches!(stale, Err(TransitionError::Regression { .. })));

        let rerun = transition(&done, &StageInput::Enter { reevaluation: true }, ts(2))
            .expect("re-evaluation");
        assert_eq!(rerun.status, StageStatus::Running);
        assert_eq!(rerun.ended_at, None);
    }

    #[test]
    fn contained_and_failed_are_terminal_until_reset() {
        let contained = transition(&stage(10), &StageInput::Contain, ts(0)).expect("contain");
        assert!(contained.contained);
        for input in [
            StageInput::Enter { reevaluation: true },
            complete(0.9),
            StageInput::Escalate,
            StageInput::SpawnWorker { count: None },
        ] {
            assert!(
                matches!(
                    transition(&contained, &input, ts(1)),
                    Err(TransitionError::Terminal { .. })
                ),
                "{} should be refused",
                input.label()
            );
        }

        let failed = transition(&stage(4), &StageInput::Fail, ts(0)).expect("fail");
        assert!(transition(&failed, &StageInput::Contain, ts(1)).is_err());

        let reset = transition(&contained, &StageInput::Reset, ts(2)).expect("reset");
        assert_eq!(reset.status, StageStatus::Ready);
        assert!(!reset.contained);
    }

    #[test]
    fn escalated_stage_reenters_and_clears_flag() {
        let escalated = run(
            &stage(6),
            &[StageInput::Enter { reevaluation: false }, StageInput::Escalate],
        )
        .expect("escalate");
        assert_eq!(escalated.status, StageStatus::Escalated);
        assert!(escalated.escalated);

        let reentered = transition(&escalated, &StageInput::Enter { reevaluation: false }, ts(9))
            .expect("re-enter");
        assert_eq!(reentered.status, StageStatus::Running);
        assert!(!reentered.escalated);
    }

    #[test]
    fn escalated_completion_resolves_to_escalated_status() {
        let escalated = transition(
            &stage(7),
            &StageInput::Complete {
                confidence: Confidence::from_score(0.3),
                escalated: true,
                forked: true,
            },
            ts(0),
        )
        .expect("escalated completion");
        assert_eq!(escalated.status, StageStatus::Escalated);
        assert!(escalated.escalated);
        assert!(escalated.forked);
    }

    #[test]
    fn workers_and_patches_only_touch_live_stages() {
        let running = run(
            &stage(2),
            &[
                StageInput::Enter { reevaluation: false },
                StageInput::SpawnWorker { count: None },
                StageInput::SpawnWorker { count: None },
            ],
        )
        .expect("spawn");
        assert_eq!(running.active_workers, 2);

        let patched = transition(
            &running,
            &StageInput::Patch(StagePatch {
                active_plugins: Some(vec!["audit".to_string()]),
                active_workers: Some(5),
                ..StagePatch::default()
            }),
            ts(3),
        )
        .expect("patch");
        assert_eq!(patched.active_workers, 5);
        assert_eq!(patched.active_plugins, vec!["audit".to_string()]);

        let done = transition(&patched, &complete(0.8), ts(4)).expect("complete");
        let forked = transition(
            &done,
            &StageInput::Patch(StagePatch {
                forked: Some(true),
                ..StagePatch::default()
            }),
            ts(5),
        )
        .expect("fork flag on terminal stage");
        assert!(forked.forked);
        assert_eq!(forked.status, StageStatus::Completed);

        let rejected = transition(
            &done,
            &StageInput::Patch(StagePatch {
                confidence: Some(Confidence::from_score(0.1)),
                ..StagePatch::default()
            }),
            ts(6),
        );
        assert!(matches!(rejected, Err(TransitionError::Terminal { .. })));
    }
}
