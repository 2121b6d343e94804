use crate::model::{Mode, StageNumber};
use crate::protocol::ControlMessage;
use crate::stage::StageState;
use crate::store::{SessionSnapshot, TraceStep};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outbound half the controller writes control frames into.
pub trait ControlSink {
    fn send_control(&self, msg: ControlMessage);
}

impl<T: ControlSink + ?Sized> ControlSink for Arc<T> {
    fn send_control(&self, msg: ControlMessage) {
        (**self).send_control(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("step requires stepping mode (mode is {0})")]
    NotStepping(Mode),
    #[error("refusing backward step to stage {target}; current stage is {current}")]
    BackwardStep {
        target: StageNumber,
        current: StageNumber,
    },
    #[error("no stage after {current}")]
    StageOutOfRange { current: StageNumber },
    #[error("nothing recorded to replay")]
    NothingRecorded,
    #[error("replay is not active")]
    NotReplaying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMode {
    pub mode: Mode,
    /// Store version when the request went out; only later server reports resolve it.
    pub requested_at: u64,
}

/// Progression mode split into the server-confirmed value and the local optimistic request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeState {
    pub confirmed: Mode,
    pub pending: Option<PendingMode>,
    reconciled_version: u64,
}

impl ModeState {
    pub fn effective(&self) -> Mode {
        self.pending
            .map(|pending| pending.mode)
            .unwrap_or(self.confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Confirmed(Mode),
    Rejected { requested: Mode, confirmed: Mode },
    ServerChanged(Mode),
}

/// One replay position. `stage` is the stage as recorded with `step`, not its present state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayFrame<'a> {
    pub position: usize,
    pub total: usize,
    pub step: &'a TraceStep,
    pub stage: &'a StageState,
}

pub struct SteppingController<S> {
    sink: S,
    modes: ModeState,
    cursor: Option<usize>,
}

impl<S: ControlSink> SteppingController<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            modes: ModeState::default(),
            cursor: None,
        }
    }

    pub fn mode(&self) -> Mode {
        if self.cursor.is_some() {
            Mode::Replay
        } else {
            self.modes.effective()
        }
    }

    pub fn progression(&self) -> &ModeState {
        &self.modes
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn request_mode_change(
        &mut self,
        snapshot: &SessionSnapshot,
        mode: Mode,
        reason: Option<String>,
    ) -> Result<Mode, ControlError> {
        if mode == Mode::Replay {
            self.enter_replay(snapshot)?;
            return Ok(Mode::Replay);
        }
        if self.cursor.take().is_some() {
            debug!("replay_exit: back to {}", self.modes.effective());
        }
        if mode == self.modes.effective() {
            return Ok(mode);
        }
        self.modes.pending = Some(PendingMode {
            mode,
            requested_at: snapshot.session().version,
        });
        info!("mode_change_requested: {mode}");
        self.sink.send_control(ControlMessage::ModeChange { mode, reason });
        Ok(mode)
    }

    /// Asks the server to advance to `target`, or to the stage after the current one.
    pub fn request_step(
        &mut self,
        snapshot: &SessionSnapshot,
        target: Option<StageNumber>,
        reason: Option<String>,
    ) -> Result<StageNumber, ControlError> {
        let mode = self.mode();
        if mode != Mode::Stepping {
            return Err(ControlError::NotStepping(mode));
        }
        let current = snapshot.session().current_stage;
        let target = match target {
            Some(target) => target,
            None => current
                .next()
                .ok_or(ControlError::StageOutOfRange { current })?,
        };
        if target <= current {
            return Err(ControlError::BackwardStep { target, current });
        }
        self.sink.send_control(ControlMessage::Step {
            target_stage: target,
            reason,
        });
        Ok(target)
    }

    pub fn pause(&mut self, reason: Option<String>) {
        self.sink.send_control(ControlMessage::Pause { reason });
    }

    pub fn resume(&mut self, reason: Option<String>) {
        self.sink.send_control(ControlMessage::Resume { reason });
    }

    pub fn trigger_containment(&mut self, target: Option<StageNumber>, reason: Option<String>) -> StageNumber {
        let target = target.unwrap_or(StageNumber::LAST);
        self.sink.send_control(ControlMessage::ContainmentTrigger {
            target_stage: target,
            reason,
        });
        target
    }

    pub fn escalate(
        &mut self,
        snapshot: &SessionSnapshot,
        target: Option<StageNumber>,
        reason: Option<String>,
    ) -> StageNumber {
        let target = target.unwrap_or(snapshot.session().current_stage);
        self.sink.send_control(ControlMessage::Escalate {
            target_stage: target,
            reason,
        });
        target
    }

    pub fn request_reset(&mut self, reason: Option<String>) {
        self.cursor = None;
        self.sink.send_control(ControlMessage::Reset { reason });
    }

    pub fn exit_replay(&mut self) -> Result<Mode, ControlError> {
        self.cursor.take().ok_or(ControlError::NotReplaying)?;
        Ok(self.modes.effective())
    }

    pub fn replay_forward(&mut self, snapshot: &SessionSnapshot) -> Result<usize, ControlError> {
        self.move_cursor(snapshot, |cursor, _| cursor + 1)
    }

    pub fn replay_back(&mut self, snapshot: &SessionSnapshot) -> Result<usize, ControlError> {
        self.move_cursor(snapshot, |cursor, _| cursor.saturating_sub(1))
    }

    pub fn replay_to_start(&mut self, snapshot: &SessionSnapshot) -> Result<usize, ControlError> {
        self.move_cursor(snapshot, |_, _| 0)
    }

    pub fn replay_to_end(&mut self, snapshot: &SessionSnapshot) -> Result<usize, ControlError> {
        self.move_cursor(snapshot, |_, last| last)
    }

    pub fn replay_seek(&mut self, snapshot: &SessionSnapshot, index: usize) -> Result<usize, ControlError> {
        self.move_cursor(snapshot, |_, _| index)
    }

    pub fn replay_frame<'a>(&self, snapshot: &'a SessionSnapshot) -> Option<ReplayFrame<'a>> {
        let traces = snapshot.traces();
        let position = self.cursor?.min(traces.len().checked_sub(1)?);
        let step = &traces[position];
        Some(ReplayFrame {
            position,
            total: traces.len(),
            step,
            stage: &step.stage_state,
        })
    }

    /// Folds the latest server mode report into the two-phase mode state.
    /// The last server-confirmed mode always wins over a pending request.
    pub fn sync(&mut self, snapshot: &SessionSnapshot) -> Option<Reconciliation> {
        if self.cursor.is_some() && snapshot.traces().is_empty() {
            self.cursor = None;
        }
        let report = snapshot.server_mode()?;
        if report.version <= self.modes.reconciled_version {
            return None;
        }
        self.modes.reconciled_version = report.version;
        let previous = self.modes.confirmed;
        self.modes.confirmed = report.mode;

        match self.modes.pending {
            Some(pending) if report.version > pending.requested_at => {
                self.modes.pending = None;
                if pending.mode == report.mode {
                    info!("mode_change_confirmed: {}", report.mode);
                    Some(Reconciliation::Confirmed(report.mode))
                } else {
                    warn!(
                        "mode_change_rejected: requested={} confirmed={}",
                        pending.mode, report.mode
                    );
                    Some(Reconciliation::Rejected {
                        requested: pending.mode,
                        confirmed: report.mode,
                    })
                }
            }
            _ if previous != report.mode => Some(Reconciliation::ServerChanged(report.mode)),
            _ => None,
        }
    }

    fn enter_replay(&mut self, snapshot: &SessionSnapshot) -> Result<usize, ControlError> {
        let last = snapshot
            .traces()
            .len()
            .checked_sub(1)
            .ok_or(ControlError::NothingRecorded)?;
        let cursor = *self.cursor.get_or_insert(last);
        Ok(cursor.min(last))
    }

    fn move_cursor<F>(&mut self, snapshot: &SessionSnapshot, step: F) -> Result<usize, ControlError>
    where
        F: FnOnce(usize, usize) -> usize,
    {
        let cursor = self.cursor.ok_or(ControlError::NotReplaying)?;
        let last = snapshot
            .traces()
            .len()
            .checked_sub(1)
            .ok_or(ControlError::NothingRecorded)?;
        let next = step(cursor.min(last), last).min(last);
        self.cursor = Some(next);
        Ok(next)
    }
}
