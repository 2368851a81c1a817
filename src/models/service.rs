//! Service model - a deployed multi-role application

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::role::{Role, RoleState};
use super::template::{NetworkDefinition, NetworkSelection};

/// Service lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Pending,
    DeployingNets,
    Deploying,
    Running,
    Cooldown,
    Scaling,
    Warning,
    UndeployingNets,
    Undeploying,
    Done,
    FailedDeployingNets,
    FailedDeploying,
    FailedUndeployingNets,
    FailedUndeploying,
    FailedScaling,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Pending => "PENDING",
            ServiceState::DeployingNets => "DEPLOYING_NETS",
            ServiceState::Deploying => "DEPLOYING",
            ServiceState::Running => "RUNNING",
            ServiceState::Cooldown => "COOLDOWN",
            ServiceState::Scaling => "SCALING",
            ServiceState::Warning => "WARNING",
            ServiceState::UndeployingNets => "UNDEPLOYING_NETS",
            ServiceState::Undeploying => "UNDEPLOYING",
            ServiceState::Done => "DONE",
            ServiceState::FailedDeployingNets => "FAILED_DEPLOYING_NETS",
            ServiceState::FailedDeploying => "FAILED_DEPLOYING",
            ServiceState::FailedUndeployingNets => "FAILED_UNDEPLOYING_NETS",
            ServiceState::FailedUndeploying => "FAILED_UNDEPLOYING",
            ServiceState::FailedScaling => "FAILED_SCALING",
        };
        write!(f, "{}", s)
    }
}

impl ServiceState {
    /// Numeric code used by the Flow API
    pub fn code(&self) -> u32 {
        match self {
            ServiceState::Pending => 0,
            ServiceState::Deploying => 1,
            ServiceState::Running => 2,
            ServiceState::Undeploying => 3,
            ServiceState::Warning => 4,
            ServiceState::Done => 5,
            ServiceState::FailedUndeploying => 6,
            ServiceState::FailedDeploying => 7,
            ServiceState::Scaling => 8,
            ServiceState::FailedScaling => 9,
            ServiceState::Cooldown => 10,
            ServiceState::DeployingNets => 11,
            ServiceState::UndeployingNets => 12,
            ServiceState::FailedDeployingNets => 13,
            ServiceState::FailedUndeployingNets => 14,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ServiceState::Pending,
            1 => ServiceState::Deploying,
            2 => ServiceState::Running,
            3 => ServiceState::Undeploying,
            4 => ServiceState::Warning,
            5 => ServiceState::Done,
            6 => ServiceState::FailedUndeploying,
            7 => ServiceState::FailedDeploying,
            8 => ServiceState::Scaling,
            9 => ServiceState::FailedScaling,
            10 => ServiceState::Cooldown,
            11 => ServiceState::DeployingNets,
            12 => ServiceState::UndeployingNets,
            13 => ServiceState::FailedDeployingNets,
            14 => ServiceState::FailedUndeployingNets,
            _ => return None,
        })
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ServiceState::FailedDeployingNets
                | ServiceState::FailedDeploying
                | ServiceState::FailedUndeployingNets
                | ServiceState::FailedUndeploying
                | ServiceState::FailedScaling
        )
    }

    /// State a `recover` moves a failed service back into
    pub fn recover_target(&self) -> Option<ServiceState> {
        match self {
            ServiceState::FailedDeployingNets => Some(ServiceState::DeployingNets),
            ServiceState::FailedDeploying => Some(ServiceState::Deploying),
            ServiceState::FailedUndeployingNets => Some(ServiceState::UndeployingNets),
            ServiceState::FailedUndeploying => Some(ServiceState::Undeploying),
            ServiceState::FailedScaling => Some(ServiceState::Scaling),
            _ => None,
        }
    }

    /// States from which a shutdown may start
    pub fn can_shutdown(&self) -> bool {
        matches!(
            self,
            ServiceState::Pending
                | ServiceState::Running
                | ServiceState::Warning
                | ServiceState::Cooldown
                | ServiceState::FailedDeploying
                | ServiceState::FailedDeployingNets
                | ServiceState::FailedScaling
        )
    }

    /// States in which a role may be scaled
    pub fn can_scale(&self) -> bool {
        matches!(
            self,
            ServiceState::Running | ServiceState::Warning | ServiceState::Cooldown
        )
    }

    /// Whether the given transition is part of the lifecycle graph
    pub fn can_transition(&self, to: ServiceState) -> bool {
        use ServiceState::*;
        if self.recover_target() == Some(to) {
            return true;
        }
        if to == UndeployingNets && *self == Undeploying {
            return true;
        }
        if to == Undeploying {
            return self.can_shutdown();
        }
        matches!(
            (*self, to),
            (Pending, DeployingNets)
                | (Pending, Deploying)
                | (DeployingNets, Deploying)
                | (DeployingNets, FailedDeployingNets)
                | (Deploying, Running)
                | (Deploying, FailedDeploying)
                | (Running, Scaling)
                | (Running, Warning)
                | (Warning, Running)
                | (Warning, Scaling)
                | (Cooldown, Scaling)
                | (Scaling, Running)
                | (Scaling, Cooldown)
                | (Scaling, FailedScaling)
                | (Cooldown, Running)
                | (Undeploying, Done)
                | (Undeploying, FailedUndeploying)
                | (UndeployingNets, Done)
                | (UndeployingNets, FailedUndeployingNets)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Error,
}

/// One service log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub state: ServiceState,
    pub severity: Severity,
    pub message: String,
}

/// A deployed instance of a service template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: u64,
    pub name: String,
    pub owner: String,
    /// Service template this service was instantiated from
    pub template_id: u64,
    pub roles: Vec<Role>,
    pub state: ServiceState,
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub custom_attrs_values: BTreeMap<String, String>,
    #[serde(default)]
    pub networks: Vec<NetworkDefinition>,
    /// Requested network selections, by network name
    #[serde(default)]
    pub networks_selections: BTreeMap<String, NetworkSelection>,
    /// Resolved network ids, by network name
    #[serde(default)]
    pub networks_values: BTreeMap<String, u64>,
    #[serde(default)]
    pub default_cooldown: Option<u64>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Service {
    pub fn new(id: u64, name: impl Into<String>, owner: impl Into<String>, template_id: u64) -> Self {
        let mut service = Self {
            id,
            name: name.into(),
            owner: owner.into(),
            template_id,
            roles: Vec::new(),
            state: ServiceState::Pending,
            log: Vec::new(),
            custom_attrs_values: BTreeMap::new(),
            networks: Vec::new(),
            networks_selections: BTreeMap::new(),
            networks_values: BTreeMap::new(),
            default_cooldown: None,
            cooldown_until: None,
        };
        service.push_log(Severity::Info, "Service created");
        service
    }

    /// Creation/start time
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.log.first().map(|e| e.timestamp)
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn role_mut(&mut self, name: &str) -> Option<&mut Role> {
        self.roles.iter_mut().find(|r| r.name == name)
    }

    /// Move to a new state and record the transition
    pub fn transition(&mut self, to: ServiceState, message: impl Into<String>) {
        let message = message.into();
        if !self.state.can_transition(to) {
            tracing::warn!(service = self.id, from = %self.state, to = %to, "Unexpected state transition");
        }
        tracing::info!(service = self.id, from = %self.state, to = %to, "{}", message);
        self.state = to;
        self.push_log(Severity::Info, message);
    }

    /// Record an error without changing state
    pub fn log_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(service = self.id, state = %self.state, "{}", message);
        self.push_log(Severity::Error, message);
    }

    fn push_log(&mut self, severity: Severity, message: impl Into<String>) {
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            state: self.state,
            severity,
            message: message.into(),
        });
    }

    /// Time the current state was entered
    pub fn state_since(&self) -> Option<DateTime<Utc>> {
        self.log
            .iter()
            .rev()
            .find(|e| e.severity == Severity::Info && e.state == self.state)
            .map(|e| e.timestamp)
    }

    /// Transition entries only (excludes error records)
    pub fn transitions(&self) -> impl Iterator<Item = &LogEntry> {
        self.log.iter().filter(|e| e.severity == Severity::Info)
    }

    pub fn refresh_role_states(&mut self) {
        for role in &mut self.roles {
            role.refresh_state();
        }
    }

    pub fn all_roles_running(&self) -> bool {
        self.roles.iter().all(|r| r.state == RoleState::Running)
    }

    pub fn any_role_failed(&self) -> bool {
        self.roles.iter().any(|r| r.state == RoleState::Error)
    }

    /// Networks whose selection requires a reservation
    pub fn reserved_networks(&self) -> impl Iterator<Item = (&String, &NetworkSelection)> {
        self.networks_selections.iter().filter(|(_, s)| s.needs_reservation())
    }

    pub fn has_reservations(&self) -> bool {
        self.reserved_networks().next().is_some()
    }

    pub fn node_count(&self) -> usize {
        self.roles.iter().map(|r| r.nodes.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_roundtrip() {
        for code in 0..15 {
            let state = ServiceState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(ServiceState::from_code(15), None);
    }

    #[test]
    fn test_recover_targets() {
        assert_eq!(
            ServiceState::FailedScaling.recover_target(),
            Some(ServiceState::Scaling)
        );
        assert_eq!(
            ServiceState::FailedDeployingNets.recover_target(),
            Some(ServiceState::DeployingNets)
        );
        assert_eq!(ServiceState::Running.recover_target(), None);
    }

    #[test]
    fn test_transition_graph() {
        use ServiceState::*;
        assert!(Pending.can_transition(Deploying));
        assert!(Pending.can_transition(DeployingNets));
        assert!(Deploying.can_transition(Running));
        assert!(Running.can_transition(Undeploying));
        assert!(Warning.can_transition(Undeploying));
        assert!(Undeploying.can_transition(UndeployingNets));
        assert!(FailedScaling.can_transition(Scaling));
        assert!(!Done.can_transition(Running));
        assert!(!Deploying.can_transition(Scaling));
        assert!(!Scaling.can_transition(Undeploying));
    }

    #[test]
    fn test_new_service_logs_creation() {
        let service = Service::new(1, "app", "oneadmin", 0);
        assert_eq!(service.state, ServiceState::Pending);
        assert_eq!(service.log.len(), 1);
        assert_eq!(service.start_time(), Some(service.log[0].timestamp));
    }

    #[test]
    fn test_transition_appends_log() {
        let mut service = Service::new(1, "app", "oneadmin", 0);
        service.transition(ServiceState::Deploying, "deploying");
        service.log_error("instantiate failed");
        service.transition(ServiceState::Running, "running");

        assert_eq!(service.log.len(), 4);
        assert_eq!(service.transitions().count(), 3);
        assert_eq!(service.log[2].severity, Severity::Error);
        assert_eq!(service.log[2].state, ServiceState::Deploying);
        assert_eq!(service.state_since(), Some(service.log[3].timestamp));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::FailedUndeployingNets.to_string(), "FAILED_UNDEPLOYING_NETS");
        let json = serde_json::to_string(&ServiceState::DeployingNets).unwrap();
        assert_eq!(json, "\"DEPLOYING_NETS\"");
    }
}
