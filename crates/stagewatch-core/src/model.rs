use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const STAGE_COUNT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u8")]
pub struct StageNumber(u8);

impl StageNumber {
    pub const FIRST: Self = Self(1);
    pub const LAST: Self = Self(STAGE_COUNT);

    pub fn new(value: u8) -> Option<Self> {
        if (1..=STAGE_COUNT).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    pub fn next(self) -> Option<Self> {
        Self::new(self.0 + 1)
    }

    pub fn is_last(self) -> bool {
        self == Self::LAST
    }

    pub fn all() -> impl Iterator<Item = StageNumber> {
        (1..=STAGE_COUNT).map(Self)
    }
}

impl TryFrom<u64> for StageNumber {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| format!("stage out of range 1..={STAGE_COUNT}: {value}"))
    }
}

impl From<StageNumber> for u8 {
    fn from(stage: StageNumber) -> Self {
        stage.0
    }
}

impl fmt::Display for StageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum StageStatus {
    Ready,
    Running,
    Completed,
    Escalated,
    Contained,
    Failed,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Ready
    }
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Ready => "ready",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Escalated => "escalated",
            StageStatus::Contained => "contained",
            StageStatus::Failed => "failed",
        }
    }

    /// Completed, contained and failed stages only change through a reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Contained | StageStatus::Failed
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "ready" | "idle" | "pending" => Ok(StageStatus::Ready),
            "running" | "active" | "in_progress" | "in-progress" => Ok(StageStatus::Running),
            "completed" | "complete" | "done" => Ok(StageStatus::Completed),
            "escalated" => Ok(StageStatus::Escalated),
            "contained" => Ok(StageStatus::Contained),
            "failed" | "error" => Ok(StageStatus::Failed),
            other => Err(format!("Unknown stage status: {other}")),
        }
    }
}

impl TryFrom<String> for StageStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum SessionStatus {
    Ready,
    Running,
    Stepping,
    Completed,
    Escalated,
    Contained,
    Failed,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Ready
    }
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Ready => "ready",
            SessionStatus::Running => "running",
            SessionStatus::Stepping => "stepping",
            SessionStatus::Completed => "completed",
            SessionStatus::Escalated => "escalated",
            SessionStatus::Contained => "contained",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "ready" | "idle" => Ok(SessionStatus::Ready),
            "running" | "active" => Ok(SessionStatus::Running),
            "stepping" | "paused" => Ok(SessionStatus::Stepping),
            "completed" | "complete" | "done" => Ok(SessionStatus::Completed),
            "escalated" => Ok(SessionStatus::Escalated),
            "contained" => Ok(SessionStatus::Contained),
            "failed" | "error" => Ok(SessionStatus::Failed),
            other => Err(format!("Unknown session status: {other}")),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Mode {
    Auto,
    Stepping,
    Replay,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Auto
    }
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Stepping => "stepping",
            Mode::Replay => "replay",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "auto" | "automatic" => Ok(Mode::Auto),
            "stepping" | "step" | "manual" => Ok(Mode::Stepping),
            "replay" => Ok(Mode::Replay),
            other => Err(format!("Unknown mode: {other}")),
        }
    }
}

impl TryFrom<String> for Mode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum TraceKind {
    StageEntry,
    StageExit,
    SubWorkerSpawn,
    StatePatch,
    ForkDetected,
    Escalation,
    Containment,
    ComplianceCheck,
    AuditEvent,
}

impl TraceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceKind::StageEntry => "stage-entry",
            TraceKind::StageExit => "stage-exit",
            TraceKind::SubWorkerSpawn => "sub-worker-spawn",
            TraceKind::StatePatch => "state-patch",
            TraceKind::ForkDetected => "fork-detected",
            TraceKind::Escalation => "escalation",
            TraceKind::Containment => "containment",
            TraceKind::ComplianceCheck => "compliance-check",
            TraceKind::AuditEvent => "audit-event",
        }
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "stage-entry" | "layer-entry" => Ok(TraceKind::StageEntry),
            "stage-exit" | "layer-exit" => Ok(TraceKind::StageExit),
            "sub-worker-spawn" | "agent-spawn" => Ok(TraceKind::SubWorkerSpawn),
            "state-patch" | "memory-patch" => Ok(TraceKind::StatePatch),
            "fork-detected" | "fork" => Ok(TraceKind::ForkDetected),
            "escalation" => Ok(TraceKind::Escalation),
            "containment" => Ok(TraceKind::Containment),
            "compliance-check" => Ok(TraceKind::ComplianceCheck),
            "audit-event" | "audit" => Ok(TraceKind::AuditEvent),
            other => Err(format!("Unknown trace kind: {other}")),
        }
    }
}

impl TryFrom<String> for TraceKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(try_from = "ConfidenceWire")]
pub struct Confidence {
    pub score: f64,
    pub delta: f64,
    pub entropy: f64,
}

impl Confidence {
    pub fn new(score: f64, delta: f64, entropy: f64) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            delta: delta.clamp(-1.0, 1.0),
            entropy: entropy.clamp(0.0, 1.0),
        }
    }

    pub fn from_score(score: f64) -> Self {
        Self::new(score, 0.0, 0.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfidenceWire {
    Score(f64),
    Full {
        score: f64,
        #[serde(default)]
        delta: f64,
        #[serde(default)]
        entropy: f64,
    },
}

impl TryFrom<ConfidenceWire> for Confidence {
    type Error = String;

    fn try_from(value: ConfidenceWire) -> Result<Self, Self::Error> {
        let (score, delta, entropy) = match value {
            ConfidenceWire::Score(score) => (score, 0.0, 0.0),
            ConfidenceWire::Full {
                score,
                delta,
                entropy,
            } => (score, delta, entropy),
        };
        if !(score.is_finite() && delta.is_finite() && entropy.is_finite()) {
            return Err("confidence values must be finite".to_string());
        }
        Ok(Confidence::new(score, delta, entropy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_number_rejects_out_of_range_values() {
        assert!(StageNumber::new(0).is_none());
        assert!(StageNumber::new(11).is_none());
        assert_eq!(StageNumber::new(10), Some(StageNumber::LAST));
        assert!(serde_json::from_str::<StageNumber>("11").is_err());
        let parsed: StageNumber = serde_json::from_str("3").expect("stage");
        assert_eq!(parsed.get(), 3);
        assert_eq!(StageNumber::LAST.next(), None);
    }

    #[test]
    fn confidence_accepts_bare_score_and_clamps_ranges() {
        let bare: Confidence = serde_json::from_str("0.42").expect("bare score");
        assert_eq!(bare, Confidence::from_score(0.42));

        let full: Confidence =
            serde_json::from_str(r#"{"score": 1.7, "delta": -3.0, "entropy": 0.2}"#)
                .expect("full confidence");
        assert_eq!(full.score, 1.0);
        assert_eq!(full.delta, -1.0);
        assert_eq!(full.entropy, 0.2);
    }

    #[test]
    fn statuses_parse_case_insensitively() {
        let status: StageStatus = serde_json::from_str("\"COMPLETED\"").expect("status");
        assert_eq!(status, StageStatus::Completed);
        assert_eq!("Stepping".parse::<SessionStatus>(), Ok(SessionStatus::Stepping));
        assert_eq!("layer_entry".parse::<TraceKind>(), Ok(TraceKind::StageEntry));
        assert_eq!(
            serde_json::to_string(&TraceKind::SubWorkerSpawn).expect("encode"),
            "\"sub-worker-spawn\""
        );
        assert!("sideways".parse::<Mode>().is_err());
    }
}
