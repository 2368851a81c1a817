//! Role model - a homogeneous, independently scalable group of VMs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::vm::{NodePhase, VmInfo};

/// Derived role state, computed from the role's nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleState {
    Error,
    Deploying,
    Running,
    PoweringOff,
    Unknown,
}

impl std::fmt::Display for RoleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleState::Error => write!(f, "ERROR"),
            RoleState::Deploying => write!(f, "DEPLOYING"),
            RoleState::Running => write!(f, "RUNNING"),
            RoleState::PoweringOff => write!(f, "POWERING_OFF"),
            RoleState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl RoleState {
    /// Aggregate node phases into a role state. First matching rule wins:
    /// any error, any deploying, all running at full cardinality,
    /// any shutting down, otherwise unknown.
    pub fn aggregate(nodes: &[Node], cardinality: usize) -> RoleState {
        let phases: Vec<NodePhase> = nodes.iter().map(Node::phase).collect();

        if phases.iter().any(|p| *p == NodePhase::Error) {
            return RoleState::Error;
        }
        if phases.iter().any(|p| matches!(p, NodePhase::Deploying(_))) {
            return RoleState::Deploying;
        }
        if phases.len() == cardinality && phases.iter().all(|p| *p == NodePhase::Running) {
            return RoleState::Running;
        }
        if phases
            .iter()
            .any(|p| matches!(p, NodePhase::ShuttingDown | NodePhase::Done))
        {
            return RoleState::PoweringOff;
        }
        RoleState::Unknown
    }
}

/// How a role's VMs are terminated on shutdown or scale-down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownAction {
    #[default]
    Terminate,
    TerminateHard,
}

impl ShutdownAction {
    pub fn is_hard(&self) -> bool {
        matches!(self, ShutdownAction::TerminateHard)
    }
}

/// One VM bound to a role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// VM identifier in the compute layer
    pub deploy_id: u64,
    /// Whether `vm` holds data fetched from the compute layer
    pub vm_info: bool,
    pub vm: Option<VmInfo>,
    /// Termination has been requested
    #[serde(default)]
    pub disposing: bool,
    pub added_at: DateTime<Utc>,
}

impl Node {
    pub fn new(deploy_id: u64) -> Self {
        Self {
            deploy_id,
            vm_info: false,
            vm: None,
            disposing: false,
            added_at: Utc::now(),
        }
    }

    pub fn phase(&self) -> NodePhase {
        let phase = match (&self.vm, self.vm_info) {
            (Some(vm), true) => vm.phase(),
            _ if self.disposing => return NodePhase::ShuttingDown,
            _ => return NodePhase::Deploying(1),
        };

        if self.disposing {
            match phase {
                NodePhase::Error | NodePhase::Done => phase,
                _ => NodePhase::ShuttingDown,
            }
        } else if phase == NodePhase::Done {
            // VM vanished without being terminated by us
            NodePhase::Error
        } else {
            phase
        }
    }

    pub fn update(&mut self, vm: VmInfo) {
        self.vm = Some(vm);
        self.vm_info = true;
    }
}

/// Elasticity policy adjustment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyType {
    /// Add `adjust` VMs (negative removes)
    Change,
    /// Set cardinality to `adjust`
    Cardinality,
    /// Change cardinality by `adjust` percent
    PercentageChange,
}

/// Rule that changes a role's cardinality when its expression holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticityPolicy {
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    pub adjust: i64,
    #[serde(default)]
    pub min_adjust_step: Option<u64>,
    pub expression: String,
    /// Consecutive true evaluations required before triggering
    #[serde(default = "default_period_number")]
    pub period_number: u32,
    /// Seconds between evaluations
    #[serde(default)]
    pub period: u64,
    #[serde(default)]
    pub cooldown: Option<u64>,
    #[serde(default)]
    pub true_evals: u32,
    #[serde(default)]
    pub last_eval: Option<DateTime<Utc>>,
}

fn default_period_number() -> u32 {
    1
}

impl ElasticityPolicy {
    pub fn new(policy_type: PolicyType, adjust: i64, expression: impl Into<String>) -> Self {
        Self {
            policy_type,
            adjust,
            min_adjust_step: None,
            expression: expression.into(),
            period_number: 1,
            period: 0,
            cooldown: None,
            true_evals: 0,
            last_eval: None,
        }
    }

    pub fn with_period(mut self, period_number: u32, period: u64) -> Self {
        self.period_number = period_number;
        self.period = period;
        self
    }

    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown = Some(secs);
        self
    }

    pub fn with_min_adjust_step(mut self, step: u64) -> Self {
        self.min_adjust_step = Some(step);
        self
    }
}

/// The single in-flight scale operation of a role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingScale {
    pub from: usize,
    pub to: usize,
    pub force: bool,
    /// Cooldown to apply once done; set when an elasticity policy triggered it
    pub cooldown: Option<u64>,
    pub requested_at: DateTime<Utc>,
}

/// A role inside a running service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub template_id: u64,
    pub cardinality: usize,
    pub min_vms: usize,
    pub max_vms: usize,
    pub nodes: Vec<Node>,
    pub parents: Vec<String>,
    pub elasticity_policies: Vec<ElasticityPolicy>,
    pub cooldown: Option<u64>,
    pub shutdown_action: ShutdownAction,
    pub user_inputs_values: BTreeMap<String, String>,
    pub state: RoleState,
    pub pending: Option<PendingScale>,
}

impl Role {
    pub fn new(name: impl Into<String>, template_id: u64, cardinality: usize) -> Self {
        Self {
            name: name.into(),
            template_id,
            cardinality,
            min_vms: if cardinality == 0 { 0 } else { 1 },
            max_vms: cardinality.max(20),
            nodes: Vec::new(),
            parents: Vec::new(),
            elasticity_policies: Vec::new(),
            cooldown: None,
            shutdown_action: ShutdownAction::default(),
            user_inputs_values: BTreeMap::new(),
            state: RoleState::Unknown,
            pending: None,
        }
    }

    pub fn with_bounds(mut self, min_vms: usize, max_vms: usize) -> Self {
        self.min_vms = min_vms;
        self.max_vms = max_vms;
        self
    }

    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    /// Recompute and cache the derived state
    pub fn refresh_state(&mut self) -> RoleState {
        self.state = RoleState::aggregate(&self.nodes, self.cardinality);
        self.state
    }

    /// Nodes not marked for termination, in insertion order
    pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.disposing)
    }

    pub fn live_count(&self) -> usize {
        self.live_nodes().count()
    }

    /// Number of VMs still to instantiate to reach cardinality
    pub fn missing_nodes(&self) -> usize {
        self.cardinality.saturating_sub(self.live_count())
    }

    /// Excess live nodes to terminate, most recently added first.
    /// Never selects nodes that would leave the role below `min_vms`.
    pub fn scale_down_victims(&self) -> Vec<u64> {
        let live: Vec<&Node> = self.live_nodes().collect();
        let keep = self.cardinality.max(self.min_vms);
        let excess = live.len().saturating_sub(keep);
        live.iter().rev().take(excess).map(|n| n.deploy_id).collect()
    }

    /// Nodes whose VM is in an error phase
    pub fn failed_nodes(&self) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|n| n.phase() == NodePhase::Error)
            .map(|n| n.deploy_id)
            .collect()
    }

    /// Lowest deploy phase (1..=3) among deploying nodes
    pub fn deploy_progress(&self) -> Option<u8> {
        self.nodes
            .iter()
            .filter_map(|n| match n.phase() {
                NodePhase::Deploying(p) => Some(p),
                _ => None,
            })
            .min()
    }

    /// Human readable state, with deploy progress while deploying
    pub fn state_label(&self) -> String {
        match (self.state, self.deploy_progress()) {
            (RoleState::Deploying, Some(p)) => format!("DEPLOYING ({}/3)", p),
            (state, _) => state.to_string(),
        }
    }

    pub fn is_scaling(&self) -> bool {
        self.pending.is_some()
    }

    pub fn node_mut(&mut self, deploy_id: u64) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.deploy_id == deploy_id)
    }

    /// Check a target cardinality against the role bounds
    pub fn check_bounds(&self, target: usize) -> crate::Result<()> {
        if target < self.min_vms || target > self.max_vms {
            return Err(crate::Error::Validation(format!(
                "cardinality {} for role '{}' is outside [{}, {}]",
                target, self.name, self.min_vms, self.max_vms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vm::{LcmState, VmState};

    fn node(id: u64, state: VmState, lcm: LcmState) -> Node {
        let mut n = Node::new(id);
        n.update(VmInfo::new(id, format!("vm-{}", id), 0).with_state(state, lcm));
        n
    }

    fn running(id: u64) -> Node {
        node(id, VmState::Active, LcmState::Running)
    }

    #[test]
    fn test_aggregate_running() {
        let nodes = vec![running(1), running(2), running(3)];
        assert_eq!(RoleState::aggregate(&nodes, 3), RoleState::Running);
        // Fewer nodes than cardinality is not running
        assert_eq!(RoleState::aggregate(&nodes[..2], 3), RoleState::Unknown);
    }

    #[test]
    fn test_aggregate_error_wins() {
        let nodes = vec![
            running(1),
            node(2, VmState::Active, LcmState::Boot),
            node(3, VmState::Active, LcmState::BootFailure),
        ];
        assert_eq!(RoleState::aggregate(&nodes, 3), RoleState::Error);
    }

    #[test]
    fn test_aggregate_deploying_and_progress() {
        let mut role = Role::new("web", 0, 2);
        role.nodes = vec![
            node(1, VmState::Active, LcmState::Boot),
            node(2, VmState::Active, LcmState::Prolog),
        ];
        assert_eq!(role.refresh_state(), RoleState::Deploying);
        assert_eq!(role.deploy_progress(), Some(2));
        assert_eq!(role.state_label(), "DEPLOYING (2/3)");
    }

    #[test]
    fn test_unfetched_node_is_deploying() {
        let nodes = vec![Node::new(7)];
        assert_eq!(RoleState::aggregate(&nodes, 1), RoleState::Deploying);
    }

    #[test]
    fn test_aggregate_powering_off() {
        let nodes = vec![running(1), node(2, VmState::Poweroff, LcmState::LcmInit)];
        assert_eq!(RoleState::aggregate(&nodes, 2), RoleState::PoweringOff);
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let nodes = vec![running(1), node(2, VmState::Pending, LcmState::LcmInit)];
        let first = RoleState::aggregate(&nodes, 2);
        for _ in 0..5 {
            assert_eq!(RoleState::aggregate(&nodes, 2), first);
        }
    }

    #[test]
    fn test_lost_vm_is_error() {
        let nodes = vec![node(1, VmState::Done, LcmState::LcmInit)];
        assert_eq!(RoleState::aggregate(&nodes, 1), RoleState::Error);

        let mut disposed = node(1, VmState::Done, LcmState::LcmInit);
        disposed.disposing = true;
        assert_eq!(disposed.phase(), NodePhase::Done);
    }

    #[test]
    fn test_scale_down_victims_newest_first() {
        let mut role = Role::new("web", 0, 5).with_bounds(1, 10);
        role.nodes = (1..=5).map(running).collect();
        role.cardinality = 2;
        assert_eq!(role.scale_down_victims(), vec![5, 4, 3]);
    }

    #[test]
    fn test_scale_down_victims_respects_min() {
        let mut role = Role::new("web", 0, 5).with_bounds(3, 10);
        role.nodes = (1..=5).map(running).collect();
        role.cardinality = 1;
        assert_eq!(role.scale_down_victims(), vec![5, 4]);
    }

    #[test]
    fn test_missing_nodes_ignores_disposing() {
        let mut role = Role::new("db", 0, 3);
        role.nodes = vec![running(1), running(2)];
        role.nodes[1].disposing = true;
        assert_eq!(role.missing_nodes(), 2);
    }

    #[test]
    fn test_default_bounds() {
        let role = Role::new("web", 0, 3);
        assert_eq!((role.min_vms, role.max_vms), (1, 20));
        let role = Role::new("idle", 0, 0);
        assert_eq!(role.min_vms, 0);
        let role = Role::new("big", 0, 30);
        assert_eq!(role.max_vms, 30);
    }

    #[test]
    fn test_check_bounds() {
        let role = Role::new("web", 0, 3).with_bounds(1, 10);
        assert!(role.check_bounds(10).is_ok());
        assert!(matches!(role.check_bounds(12), Err(crate::Error::Validation(_))));
        assert!(matches!(role.check_bounds(0), Err(crate::Error::Validation(_))));
    }
}
