use coxswain_cloud::locks::LockName;

/// Milestones of the bootstrap flow. The current stage decides which
/// cleanup actions apply when the flow fails or is cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    AcquiringLock,
    KubeadmInit,
    KubeadmJoin,
    SsmParams,
    EtcdRegistration,
    LbRegistration,
    Complete,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::AcquiringLock => "acquiring-lock",
            Stage::KubeadmInit => "kubeadm-init",
            Stage::KubeadmJoin => "kubeadm-join",
            Stage::SsmParams => "ssm-params",
            Stage::EtcdRegistration => "etcd-registration",
            Stage::LbRegistration => "lb-registration",
            Stage::Complete => "complete",
        }
    }
}

/// A single undo action, registered when the corresponding resource is
/// acquired and executed in reverse order on failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupAction {
    ReleaseLock(LockName),
    DeregisterTarget { instance_id: String },
    DeleteMember { member_id: String },
}

/// Stage-aware teardown stack. Stages advance monotonically; every acquired
/// resource pushes its undo action, and a normal hand-back discharges it.
#[derive(Debug, Default)]
pub struct CleanupStack {
    actions: Vec<CleanupAction>,
    stage: Option<Stage>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            stage: Some(Stage::Init),
        }
    }

    pub fn enter(&mut self, stage: Stage) {
        tracing::debug!(stage = stage.as_str(), "entering stage");
        self.stage = Some(stage);
    }

    pub fn stage(&self) -> Stage {
        self.stage.unwrap_or(Stage::Init)
    }

    pub fn push(&mut self, action: CleanupAction) {
        self.actions.push(action);
    }

    /// Remove an action whose resource was released on the normal path.
    pub fn discharge(&mut self, action: &CleanupAction) {
        if let Some(position) = self.actions.iter().rposition(|a| a == action) {
            self.actions.remove(position);
        }
    }

    pub fn holds(&self, action: &CleanupAction) -> bool {
        self.actions.contains(action)
    }

    /// Pending undo actions, most recent first.
    pub fn drain(&mut self) -> Vec<CleanupAction> {
        let mut actions = std::mem::take(&mut self.actions);
        actions.reverse();
        actions
    }

    /// Past `Init`, a failed node also resets its local cluster state.
    pub fn needs_local_reset(&self) -> bool {
        self.stage() > Stage::Init
    }
}
