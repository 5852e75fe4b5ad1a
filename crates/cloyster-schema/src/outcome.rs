use serde::{Deserialize, Serialize};
use std::fmt;

/// A single delta operation on a systemd unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UnitOp {
    Enable,
    Disable,
    Start,
    Stop,
    Reload,
    Restart,
}

impl UnitOp {
    /// The operation that undoes this one. Reload and restart leave the
    /// unit in the state they found it, so there is nothing to undo.
    pub fn inverse(self) -> Option<Self> {
        match self {
            UnitOp::Enable => Some(UnitOp::Disable),
            UnitOp::Disable => Some(UnitOp::Enable),
            UnitOp::Start => Some(UnitOp::Stop),
            UnitOp::Stop => Some(UnitOp::Start),
            UnitOp::Reload | UnitOp::Restart => None,
        }
    }

    /// Position in a delta: enablement first, then activity, then refresh,
    /// then disablement.
    pub fn rank(self) -> u8 {
        match self {
            UnitOp::Enable => 0,
            UnitOp::Start | UnitOp::Stop => 1,
            UnitOp::Reload | UnitOp::Restart => 2,
            UnitOp::Disable => 3,
        }
    }
}

impl fmt::Display for UnitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOp::Enable => write!(f, "enable"),
            UnitOp::Disable => write!(f, "disable"),
            UnitOp::Start => write!(f, "start"),
            UnitOp::Stop => write!(f, "stop"),
            UnitOp::Reload => write!(f, "reload"),
            UnitOp::Restart => write!(f, "restart"),
        }
    }
}

/// What applying a step actually changed on the host. Drives its rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Change {
    Mount { mounted: bool },
    Service { ops: Vec<UnitOp> },
}

impl Change {
    pub fn is_noop(&self) -> bool {
        match self {
            Change::Mount { mounted } => !mounted,
            Change::Service { ops } => ops.is_empty(),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Mount { mounted: true } => write!(f, "mounted"),
            Change::Mount { mounted: false } => write!(f, "already mounted"),
            Change::Service { ops } if ops.is_empty() => write!(f, "already in desired state"),
            Change::Service { ops } => {
                let ops: Vec<String> = ops.iter().map(ToString::to_string).collect();
                write!(f, "{}", ops.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Mount table already holds a different filesystem at the target.
    Conflict,
    /// Control bus timed out or could not be reached.
    Unreachable,
    /// systemd refused the operation.
    Rejected,
    NoSuchUnit,
    /// Operating system error (mount(8) failure, I/O).
    Os,
}

impl FailureKind {
    /// Only bus reachability problems are worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::Unreachable)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Conflict => write!(f, "Conflict"),
            FailureKind::Unreachable => write!(f, "Unreachable"),
            FailureKind::Rejected => write!(f, "Rejected"),
            FailureKind::NoSuchUnit => write!(f, "NoSuchUnit"),
            FailureKind::Os => write!(f, "Os"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Recorded outcome of a step in the run log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "detail")]
pub enum StepResult {
    Pending,
    Applied(Change),
    Failed(Failure),
    RolledBack,
    RollbackFailed(Failure),
    Skipped,
}

impl StepResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, StepResult::Applied(_))
    }

    /// Short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            StepResult::Pending => "Pending",
            StepResult::Applied(_) => "Applied",
            StepResult::Failed(_) => "Failed",
            StepResult::RolledBack => "RolledBack",
            StepResult::RollbackFailed(_) => "RollbackFailed",
            StepResult::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepResult::Failed(failure) | StepResult::RollbackFailed(failure) => {
                write!(f, "{}({})", self.label(), failure.kind)
            }
            other => write!(f, "{}", other.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_ops_pair_up() {
        for op in [UnitOp::Enable, UnitOp::Disable, UnitOp::Start, UnitOp::Stop] {
            let inverse = op.inverse().unwrap();
            assert_eq!(inverse.inverse(), Some(op));
            assert_ne!(inverse, op);
        }
        assert_eq!(UnitOp::Reload.inverse(), None);
        assert_eq!(UnitOp::Restart.inverse(), None);
    }

    #[test]
    fn only_unreachable_is_transient() {
        assert!(FailureKind::Unreachable.is_transient());
        assert!(!FailureKind::Conflict.is_transient());
        assert!(!FailureKind::Rejected.is_transient());
        assert!(!FailureKind::NoSuchUnit.is_transient());
        assert!(!FailureKind::Os.is_transient());
    }

    #[test]
    fn step_result_display() {
        let failed = StepResult::Failed(Failure::new(FailureKind::Rejected, "access denied"));
        assert_eq!(failed.to_string(), "Failed(Rejected)");
        assert_eq!(StepResult::RolledBack.to_string(), "RolledBack");
        assert_eq!(
            StepResult::Applied(Change::Mount { mounted: true }).to_string(),
            "Applied"
        );
    }

    #[test]
    fn step_result_json_shape() {
        let json = serde_json::to_value(StepResult::Applied(Change::Service {
            ops: vec![UnitOp::Enable, UnitOp::Start],
        }))
        .unwrap();
        assert_eq!(json["state"], "Applied");
        assert_eq!(json["detail"]["kind"], "service");
        assert_eq!(json["detail"]["ops"][1], "start");

        let json = serde_json::to_value(StepResult::RolledBack).unwrap();
        assert_eq!(json["state"], "RolledBack");
    }

    #[test]
    fn noop_changes() {
        assert!(Change::Mount { mounted: false }.is_noop());
        assert!(!Change::Mount { mounted: true }.is_noop());
        assert!(Change::Service { ops: vec![] }.is_noop());
    }
}
