pub mod control;
pub mod model;
pub mod normalize;
pub mod protocol;
pub mod stage;
pub mod store;

pub use control::{
    ControlError, ControlSink, ModeState, PendingMode, Reconciliation, ReplayFrame,
    SteppingController,
};
pub use model::{Confidence, Mode, SessionStatus, StageNumber, StageStatus, TraceKind, STAGE_COUNT};
pub use normalize::{normalize, normalize_text, EventKind, NormalizedEvent, SimEvent};
pub use protocol::{encode_control, ControlMessage, ProtocolError, NORMAL_CLOSE_CODE};
pub use stage::{StageInput, StagePatch, StageState, TransitionError};
pub use store::{
    ApplyOutcome, ModeReport, Session, SessionSnapshot, SessionStore, StoreSubscription, Subscribers,
    TraceStep,
};
