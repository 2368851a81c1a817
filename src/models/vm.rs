//! VM model as reported by the compute layer

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coarse VM state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Init,
    Pending,
    Hold,
    Active,
    Stopped,
    Suspended,
    Done,
    Failed,
    Poweroff,
    Undeployed,
    Cloning,
    CloningFailure,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Init => "INIT",
            VmState::Pending => "PENDING",
            VmState::Hold => "HOLD",
            VmState::Active => "ACTIVE",
            VmState::Stopped => "STOPPED",
            VmState::Suspended => "SUSPENDED",
            VmState::Done => "DONE",
            VmState::Failed => "FAILED",
            VmState::Poweroff => "POWEROFF",
            VmState::Undeployed => "UNDEPLOYED",
            VmState::Cloning => "CLONING",
            VmState::CloningFailure => "CLONING_FAILURE",
        };
        write!(f, "{}", s)
    }
}

impl VmState {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => VmState::Init,
            1 => VmState::Pending,
            2 => VmState::Hold,
            3 => VmState::Active,
            4 => VmState::Stopped,
            5 => VmState::Suspended,
            6 => VmState::Done,
            7 => VmState::Failed,
            8 => VmState::Poweroff,
            9 => VmState::Undeployed,
            10 => VmState::Cloning,
            11 => VmState::CloningFailure,
            _ => return None,
        })
    }
}

/// Fine-grained lifecycle sub-state, meaningful while the VM is ACTIVE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LcmState {
    LcmInit,
    Prolog,
    Boot,
    Running,
    Migrate,
    Epilog,
    Shutdown,
    CleanupResubmit,
    Unknown,
    Hotplug,
    ShutdownPoweroff,
    CleanupDelete,
    BootFailure,
    BootMigrateFailure,
    PrologMigrateFailure,
    PrologFailure,
    EpilogFailure,
    EpilogStopFailure,
    EpilogUndeployFailure,
    PrologResumeFailure,
    PrologUndeployFailure,
}

impl LcmState {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => LcmState::LcmInit,
            1 => LcmState::Prolog,
            2 => LcmState::Boot,
            3 => LcmState::Running,
            4 => LcmState::Migrate,
            11 => LcmState::Epilog,
            12 => LcmState::Shutdown,
            15 => LcmState::CleanupResubmit,
            16 => LcmState::Unknown,
            17 => LcmState::Hotplug,
            18 => LcmState::ShutdownPoweroff,
            23 => LcmState::CleanupDelete,
            36 => LcmState::BootFailure,
            37 => LcmState::BootMigrateFailure,
            38 => LcmState::PrologMigrateFailure,
            39 => LcmState::PrologFailure,
            40 => LcmState::EpilogFailure,
            41 => LcmState::EpilogStopFailure,
            42 => LcmState::EpilogUndeployFailure,
            47 => LcmState::PrologResumeFailure,
            48 => LcmState::PrologUndeployFailure,
            _ => return None,
        })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LcmState::BootFailure
                | LcmState::BootMigrateFailure
                | LcmState::PrologMigrateFailure
                | LcmState::PrologFailure
                | LcmState::EpilogFailure
                | LcmState::EpilogStopFailure
                | LcmState::EpilogUndeployFailure
                | LcmState::PrologResumeFailure
                | LcmState::PrologUndeployFailure
                | LcmState::Unknown
        )
    }
}

/// Coarse classification of a single VM, input to role aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodePhase {
    /// Deploying, phase 1 (INIT/PENDING/HOLD), 2 (PROLOG) or 3 (BOOT)
    Deploying(u8),
    Running,
    ShuttingDown,
    Done,
    Error,
}

/// A VM record as returned by `VM.show`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: u64,
    pub name: String,
    pub template_id: u64,
    pub state: VmState,
    pub lcm_state: LcmState,
    /// Latest monitoring values (CPU, MEMORY, custom attributes)
    #[serde(default)]
    pub monitoring: BTreeMap<String, f64>,
}

impl VmInfo {
    pub fn new(id: u64, name: impl Into<String>, template_id: u64) -> Self {
        Self {
            id,
            name: name.into(),
            template_id,
            state: VmState::Pending,
            lcm_state: LcmState::LcmInit,
            monitoring: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, state: VmState, lcm_state: LcmState) -> Self {
        self.state = state;
        self.lcm_state = lcm_state;
        self
    }

    /// Map VM + LCM state onto the coarse phase used for role aggregation
    pub fn phase(&self) -> NodePhase {
        match self.state {
            VmState::Init | VmState::Pending | VmState::Hold | VmState::Cloning => {
                NodePhase::Deploying(1)
            }
            VmState::Failed | VmState::CloningFailure => NodePhase::Error,
            VmState::Done => NodePhase::Done,
            VmState::Poweroff | VmState::Stopped | VmState::Suspended | VmState::Undeployed => {
                NodePhase::ShuttingDown
            }
            VmState::Active => match self.lcm_state {
                s if s.is_failure() => NodePhase::Error,
                LcmState::LcmInit => NodePhase::Deploying(1),
                LcmState::Prolog => NodePhase::Deploying(2),
                LcmState::Boot => NodePhase::Deploying(3),
                LcmState::Running | LcmState::Migrate | LcmState::Hotplug => NodePhase::Running,
                _ => NodePhase::ShuttingDown,
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase() == NodePhase::Running
    }
}

/// Parameters for `VM.instantiate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantiateRequest {
    pub template_id: u64,
    pub name: String,
    /// Values for the template's user inputs
    pub user_inputs: BTreeMap<String, String>,
    /// Extra context (service id, role name, custom attributes, network ids)
    pub context: BTreeMap<String, String>,
    pub owner: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(state: VmState, lcm: LcmState) -> VmInfo {
        VmInfo::new(1, "vm", 0).with_state(state, lcm)
    }

    #[test]
    fn test_vm_state_from_code() {
        assert_eq!(VmState::from_code(3), Some(VmState::Active));
        assert_eq!(VmState::from_code(8), Some(VmState::Poweroff));
        assert_eq!(VmState::from_code(99), None);
        assert_eq!(LcmState::from_code(36), Some(LcmState::BootFailure));
        assert_eq!(LcmState::from_code(3), Some(LcmState::Running));
    }

    #[test]
    fn test_deploy_phases() {
        assert_eq!(vm(VmState::Pending, LcmState::LcmInit).phase(), NodePhase::Deploying(1));
        assert_eq!(vm(VmState::Hold, LcmState::LcmInit).phase(), NodePhase::Deploying(1));
        assert_eq!(vm(VmState::Active, LcmState::Prolog).phase(), NodePhase::Deploying(2));
        assert_eq!(vm(VmState::Active, LcmState::Boot).phase(), NodePhase::Deploying(3));
    }

    #[test]
    fn test_error_and_running_phases() {
        assert_eq!(vm(VmState::Active, LcmState::Running).phase(), NodePhase::Running);
        assert_eq!(vm(VmState::Active, LcmState::Hotplug).phase(), NodePhase::Running);
        assert_eq!(vm(VmState::Active, LcmState::BootFailure).phase(), NodePhase::Error);
        assert_eq!(vm(VmState::Active, LcmState::Unknown).phase(), NodePhase::Error);
        assert_eq!(vm(VmState::Failed, LcmState::LcmInit).phase(), NodePhase::Error);
    }

    #[test]
    fn test_shutdown_phases() {
        assert_eq!(vm(VmState::Active, LcmState::Shutdown).phase(), NodePhase::ShuttingDown);
        assert_eq!(vm(VmState::Poweroff, LcmState::LcmInit).phase(), NodePhase::ShuttingDown);
        assert_eq!(vm(VmState::Done, LcmState::LcmInit).phase(), NodePhase::Done);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(VmState::Active.to_string(), "ACTIVE");
        assert_eq!(VmState::CloningFailure.to_string(), "CLONING_FAILURE");
    }
}
