//! Service orchestrator
//!
//! Holds every service behind its own lock. Client operations validate and
//! record intent; `reconcile_service` moves one service a single step
//! through its lifecycle by talking to the compute and network layers.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compute::{Compute, SimCloud, TemplateRegistry};
use crate::config::OrchestratorConfig;
use crate::db::Database;
use crate::models::*;
use crate::network::{self, VnetPool};
use crate::{dependency, elasticity, Error, Result};

pub type ServiceHandle = Arc<RwLock<Service>>;

/// Manages service templates and the services instantiated from them
pub struct Orchestrator {
    config: OrchestratorConfig,
    db: Database,
    compute: Arc<dyn Compute>,
    templates: Arc<dyn TemplateRegistry>,
    vnets: Arc<dyn VnetPool>,
    services: RwLock<BTreeMap<u64, ServiceHandle>>,
}

/// A client request, dispatched to the matching orchestrator method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Instantiate {
        template_id: u64,
        #[serde(default)]
        merge: MergeTemplate,
        #[serde(default = "default_user")]
        user: String,
    },
    Show {
        service_id: u64,
    },
    List,
    Recover {
        service_id: u64,
    },
    Shutdown {
        service_id: u64,
    },
    Delete {
        service_id: u64,
        #[serde(default)]
        force: bool,
    },
    Scale {
        service_id: u64,
        role: String,
        cardinality: usize,
        #[serde(default)]
        force: bool,
    },
}

fn default_user() -> String {
    crate::ADMIN_USER.to_string()
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Instantiate { .. } => "service.instantiate",
            Operation::Show { .. } => "service.show",
            Operation::List => "service.list",
            Operation::Recover { .. } => "service.recover",
            Operation::Shutdown { .. } => "service.shutdown",
            Operation::Delete { .. } => "service.delete",
            Operation::Scale { .. } => "role.scale",
        }
    }
}

/// Result of a dispatched operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created { service_id: u64 },
    Service(Box<Service>),
    Services(Vec<Service>),
    Accepted,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        compute: Arc<dyn Compute>,
        templates: Arc<dyn TemplateRegistry>,
        vnets: Arc<dyn VnetPool>,
    ) -> Result<Self> {
        config.validate()?;
        let db = match &config.db_path {
            Some(path) => Database::open(path)?,
            None => Database::in_memory()?,
        };

        let services: BTreeMap<u64, ServiceHandle> = db
            .list_services()?
            .into_iter()
            .map(|s| (s.id, Arc::new(RwLock::new(s))))
            .collect();
        tracing::info!(services = services.len(), "Orchestrator started");

        Ok(Self {
            config,
            db,
            compute,
            templates,
            vnets,
            services: RwLock::new(services),
        })
    }

    /// Orchestrator backed entirely by the simulated cloud
    pub fn simulated(config: OrchestratorConfig, cloud: Arc<SimCloud>) -> Result<Self> {
        Self::new(config, cloud.clone(), cloud.clone(), cloud)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ===== Service templates =====

    /// Validate and store a service template
    pub fn create_template(&self, mut template: ServiceTemplate) -> Result<u64> {
        template.normalize();
        template.validate(self.config.default_max_vms)?;
        if template.owner.trim().is_empty() {
            template.owner = crate::ADMIN_USER.to_string();
        }
        template.registration_time = Utc::now();

        let id = self.db.insert_template(&mut template)?;
        tracing::info!(template = id, name = %template.name, "Service template registered");
        Ok(id)
    }

    pub fn get_template(&self, id: u64) -> Result<ServiceTemplate> {
        self.db
            .get_template(id)?
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))
    }

    pub fn list_templates(&self) -> Result<Vec<ServiceTemplate>> {
        self.db.list_templates()
    }

    /// Delete a template no live service was instantiated from
    pub fn delete_template(&self, id: u64) -> Result<()> {
        self.get_template(id)?;
        let in_use = self.db.count_active_services_for_template(id)?;
        if in_use > 0 {
            return Err(Error::Conflict(format!(
                "service template {} is used by {} service(s)",
                id, in_use
            )));
        }
        self.db.delete_template(id)?;
        tracing::info!(template = id, "Service template deleted");
        Ok(())
    }

    // ===== Services =====

    /// Create a PENDING service from a template and merge overrides
    pub fn instantiate(&self, template_id: u64, merge: &MergeTemplate, user: &str) -> Result<u64> {
        let template = self.get_template(template_id)?;
        let mut service = template.instantiate(
            0,
            merge,
            self.templates.as_ref(),
            user,
            self.config.default_max_vms,
        )?;

        // count and insert under one lock so the cap holds across callers
        let mut services = self.services.write();
        let active = services
            .values()
            .filter(|s| s.read().state != ServiceState::Done)
            .count();
        if active >= self.config.max_services {
            return Err(Error::Conflict(format!(
                "maximum number of services ({}) reached",
                self.config.max_services
            )));
        }

        let id = self.db.insert_service(&mut service)?;
        tracing::info!(service = id, template = template_id, roles = service.roles.len(), "Service instantiated");

        services.insert(id, Arc::new(RwLock::new(service)));
        Ok(id)
    }

    fn handle(&self, id: u64) -> Result<ServiceHandle> {
        self.services
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::ServiceNotFound(id))
    }

    /// Snapshot of a service and its roles
    pub fn show(&self, id: u64) -> Result<Service> {
        Ok(self.handle(id)?.read().clone())
    }

    /// Every service that is not DONE, by id
    pub fn list(&self) -> Vec<Service> {
        let handles: Vec<ServiceHandle> = self.services.read().values().cloned().collect();
        handles
            .iter()
            .map(|h| h.read().clone())
            .filter(|s| s.state != ServiceState::Done)
            .collect()
    }

    pub fn active_service_ids(&self) -> Vec<u64> {
        self.services
            .read()
            .iter()
            .filter(|(_, s)| s.read().state != ServiceState::Done)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Run `f` under the service write lock and persist the result
    fn with_service<T>(&self, id: u64, f: impl FnOnce(&mut Service) -> Result<T>) -> Result<T> {
        let handle = self.handle(id)?;
        let mut service = handle.write();
        let value = f(&mut *service)?;
        self.db.update_service(&service)?;
        Ok(value)
    }

    /// Begin undeploying the service
    pub fn shutdown(&self, id: u64) -> Result<()> {
        self.with_service(id, |service| {
            if !service.state.can_shutdown() {
                return Err(Error::invalid_state(
                    service.state,
                    "PENDING, RUNNING, WARNING, COOLDOWN or a failed deploy/scale state",
                ));
            }
            for role in &mut service.roles {
                role.pending = None;
            }
            service.cooldown_until = None;
            service.transition(ServiceState::Undeploying, "Undeploying service");
            Ok(())
        })
    }

    /// Retry the transition that failed
    pub fn recover(&self, id: u64) -> Result<()> {
        self.with_service(id, |service| {
            let from = service.state;
            let target = from
                .recover_target()
                .ok_or_else(|| Error::invalid_state(from, "a FAILED_* state"))?;

            match from {
                ServiceState::FailedDeploying | ServiceState::FailedScaling => {
                    self.drop_failed_nodes(service)
                }
                ServiceState::FailedUndeploying => {
                    // terminate again whatever has not reached DONE
                    for node in service.roles.iter_mut().flat_map(|r| r.nodes.iter_mut()) {
                        if node.phase() != NodePhase::Done {
                            node.disposing = false;
                        }
                    }
                }
                _ => {}
            }

            service.transition(target, format!("Recovering from {}", from));
            Ok(())
        })
    }

    /// Terminate and forget nodes in an error phase
    fn drop_failed_nodes(&self, service: &mut Service) {
        let mut errors = Vec::new();
        for role in &mut service.roles {
            let hard = role.shutdown_action.is_hard();
            for vm in role.failed_nodes() {
                match self.compute.terminate(vm, hard) {
                    Ok(()) | Err(Error::VmNotFound(_)) => {
                        role.nodes.retain(|n| n.deploy_id != vm);
                        tracing::info!(service = service.id, role = %role.name, vm, "Dropped failed VM");
                    }
                    Err(e) => errors.push(format!(
                        "Cannot terminate VM {} of role '{}': {}",
                        vm, role.name, e
                    )),
                }
            }
            role.refresh_state();
        }
        for message in errors {
            service.log_error(message);
        }
    }

    /// Remove a service record. Only DONE services unless `force`, which
    /// also terminates what is left and releases networks, best effort.
    pub fn delete(&self, id: u64, force: bool) -> Result<()> {
        let handle = self.handle(id)?;
        {
            let mut service = handle.write();
            if service.state != ServiceState::Done {
                if !force {
                    return Err(Error::invalid_state(
                        service.state,
                        "DONE (use force to delete anyway)",
                    ));
                }
                self.force_cleanup(&mut service);
            }
        }

        self.services.write().remove(&id);
        self.db.delete_service(id)?;
        tracing::info!(service = id, force, "Service deleted");
        Ok(())
    }

    fn force_cleanup(&self, service: &mut Service) {
        for node in service.roles.iter().flat_map(|r| r.nodes.iter()) {
            if node.phase() == NodePhase::Done {
                continue;
            }
            if let Err(e) = self.compute.terminate(node.deploy_id, true) {
                tracing::warn!(service = service.id, vm = node.deploy_id, error = %e, "Terminate failed during forced delete");
            }
        }
        if let Err(e) = network::release_all(service, self.vnets.as_ref()) {
            tracing::warn!(service = service.id, error = %e, "Network release failed during forced delete");
        }
    }

    /// Request a new cardinality for one role. With `force` the role bounds
    /// are widened to include the target instead of rejecting it.
    pub fn scale(&self, id: u64, role_name: &str, cardinality: usize, force: bool) -> Result<()> {
        self.with_service(id, |service| {
            let state = service.state;
            let role = service
                .role_mut(role_name)
                .ok_or_else(|| Error::RoleNotFound(role_name.to_string()))?;

            if role.is_scaling() {
                return Err(Error::Conflict(format!("role '{}' is already scaling", role_name)));
            }
            if !state.can_scale() {
                return Err(Error::invalid_state(state, "RUNNING, WARNING or COOLDOWN"));
            }
            if !force {
                role.check_bounds(cardinality)?;
            }

            let from = role.cardinality;
            if from == cardinality {
                return Ok(());
            }
            if force {
                role.min_vms = role.min_vms.min(cardinality);
                role.max_vms = role.max_vms.max(cardinality);
            }
            role.pending = Some(PendingScale {
                from,
                to: cardinality,
                force,
                cooldown: None,
                requested_at: Utc::now(),
            });
            role.cardinality = cardinality;

            service.cooldown_until = None;
            service.transition(
                ServiceState::Scaling,
                format!("Scaling role '{}' from {} to {}", role_name, from, cardinality),
            );
            Ok(())
        })
    }

    pub fn dispatch(&self, op: Operation) -> Result<Outcome> {
        tracing::debug!(op = op.name(), "Dispatching operation");
        match op {
            Operation::Instantiate { template_id, merge, user } => {
                let service_id = self.instantiate(template_id, &merge, &user)?;
                Ok(Outcome::Created { service_id })
            }
            Operation::Show { service_id } => Ok(Outcome::Service(Box::new(self.show(service_id)?))),
            Operation::List => Ok(Outcome::Services(self.list())),
            Operation::Recover { service_id } => self.recover(service_id).map(|_| Outcome::Accepted),
            Operation::Shutdown { service_id } => self.shutdown(service_id).map(|_| Outcome::Accepted),
            Operation::Delete { service_id, force } => {
                self.delete(service_id, force).map(|_| Outcome::Accepted)
            }
            Operation::Scale { service_id, role, cardinality, force } => self
                .scale(service_id, &role, cardinality, force)
                .map(|_| Outcome::Accepted),
        }
    }

    // ===== Reconciliation =====

    pub fn reconcile_service(&self, id: u64) -> Result<ServiceState> {
        self.reconcile_service_at(id, Utc::now())
    }

    /// One reconciliation step at the given instant
    pub fn reconcile_service_at(&self, id: u64, now: DateTime<Utc>) -> Result<ServiceState> {
        let handle = self.handle(id)?;
        let mut service = handle.write();
        let before = service.clone();

        self.step(&mut service, now);
        service.refresh_role_states();

        if *service != before {
            self.db.update_service(&service)?;
        }
        Ok(service.state)
    }

    /// Step every active service once; returns how many were stepped
    pub fn reconcile_all(&self) -> usize {
        let mut stepped = 0;
        for id in self.active_service_ids() {
            match self.reconcile_service(id) {
                Ok(_) => stepped += 1,
                Err(e) => tracing::error!(service = id, error = %e, "Reconciliation step failed"),
            }
        }
        stepped
    }

    fn step(&self, service: &mut Service, now: DateTime<Utc>) {
        match service.state {
            ServiceState::Pending => {
                if service.has_reservations() {
                    service.transition(ServiceState::DeployingNets, "Deploying networks");
                } else {
                    service.transition(ServiceState::Deploying, "Deploying roles");
                }
            }
            ServiceState::DeployingNets => self.deploy_networks(service),
            ServiceState::Deploying => self.deploy(service, now),
            ServiceState::Running | ServiceState::Warning => self.monitor(service, now),
            ServiceState::Scaling => self.scale_roles(service, now),
            ServiceState::Cooldown => self.cool_down(service, now),
            ServiceState::Undeploying => self.undeploy(service, now),
            ServiceState::UndeployingNets => self.undeploy_networks(service),
            ServiceState::Done
            | ServiceState::FailedDeployingNets
            | ServiceState::FailedDeploying
            | ServiceState::FailedUndeployingNets
            | ServiceState::FailedUndeploying
            | ServiceState::FailedScaling => {}
        }
    }

    fn deploy_networks(&self, service: &mut Service) {
        match network::reserve_all(service, self.vnets.as_ref()) {
            Ok(()) => service.transition(ServiceState::Deploying, "Networks reserved, deploying roles"),
            Err(e) => {
                service.log_error(format!("Network reservation failed: {}", e));
                service.transition(ServiceState::FailedDeployingNets, "Network reservation failed");
            }
        }
    }

    fn deploy(&self, service: &mut Service, now: DateTime<Utc>) {
        self.refresh_nodes(service);
        service.refresh_role_states();

        let failed = failed_roles(service);
        if !failed.is_empty() {
            service.transition(
                ServiceState::FailedDeploying,
                format!("Role(s) {} entered ERROR", failed.join(", ")),
            );
            return;
        }
        if service.all_roles_running() {
            service.transition(ServiceState::Running, "All roles are running");
            return;
        }
        if self.expired(service, self.config.deploy_timeout, now) {
            service.transition(
                ServiceState::FailedDeploying,
                format!("Deployment did not finish within {}s", self.config.deploy_timeout),
            );
            return;
        }

        let ready: Vec<usize> = (0..service.roles.len())
            .filter(|&i| {
                let role = &service.roles[i];
                role.missing_nodes() > 0 && dependency::parents_ready(&service.roles, role)
            })
            .collect();

        for idx in ready {
            if let Err(e) = self.create_missing_nodes(service, idx) {
                let name = service.roles[idx].name.clone();
                service.log_error(e.to_string());
                service.transition(ServiceState::FailedDeploying, format!("Cannot deploy role '{}'", name));
                return;
            }
        }
    }

    fn monitor(&self, service: &mut Service, now: DateTime<Utc>) {
        self.refresh_nodes(service);
        service.refresh_role_states();

        let failed = failed_roles(service);
        if !failed.is_empty() {
            if service.state == ServiceState::Running {
                service.transition(
                    ServiceState::Warning,
                    format!("Role(s) {} entered ERROR", failed.join(", ")),
                );
            }
            return;
        }
        if service.state == ServiceState::Warning {
            if service.all_roles_running() {
                service.transition(ServiceState::Running, "All roles are running again");
            }
            return;
        }

        self.evaluate_elasticity(service, now);
    }

    fn evaluate_elasticity(&self, service: &mut Service, now: DateTime<Utc>) {
        let mut scaled = Vec::new();
        for role in &mut service.roles {
            if role.state != RoleState::Running {
                continue;
            }
            let Some(decision) = elasticity::evaluate_role(role, now) else {
                continue;
            };
            let cooldown = decision
                .cooldown
                .or(role.cooldown)
                .or(service.default_cooldown)
                .unwrap_or(self.config.default_cooldown);

            scaled.push(format!(
                "'{}' {} -> {} ({})",
                role.name, role.cardinality, decision.target, decision.expression
            ));
            role.pending = Some(PendingScale {
                from: role.cardinality,
                to: decision.target,
                force: false,
                cooldown: Some(cooldown),
                requested_at: now,
            });
            role.cardinality = decision.target;
        }

        if !scaled.is_empty() {
            service.transition(
                ServiceState::Scaling,
                format!("Elasticity: scaling role {}", scaled.join(", ")),
            );
        }
    }

    fn scale_roles(&self, service: &mut Service, now: DateTime<Utc>) {
        self.refresh_nodes(service);

        for idx in 0..service.roles.len() {
            let role = &service.roles[idx];
            if !role.is_scaling() {
                continue;
            }
            let result = if role.live_count() < role.cardinality {
                self.create_missing_nodes(service, idx)
            } else {
                self.terminate_excess_nodes(service, idx)
            };
            if let Err(e) = result {
                let name = service.roles[idx].name.clone();
                service.log_error(e.to_string());
                service.transition(ServiceState::FailedScaling, format!("Cannot scale role '{}'", name));
                return;
            }
        }
        service.refresh_role_states();

        // victims may still carry their last error record; stuck
        // terminations are left to the scale deadline
        let failed: Vec<String> = service
            .roles
            .iter()
            .filter(|r| r.is_scaling() && r.live_nodes().any(|n| n.phase() == NodePhase::Error))
            .map(|r| r.name.clone())
            .collect();
        if !failed.is_empty() {
            service.transition(
                ServiceState::FailedScaling,
                format!("Role(s) {} entered ERROR while scaling", failed.join(", ")),
            );
            return;
        }

        let finished = service
            .roles
            .iter()
            .filter(|r| r.is_scaling())
            .all(|r| r.state == RoleState::Running && r.nodes.len() == r.cardinality);
        if !finished {
            if self.expired(service, self.config.scale_timeout, now) {
                service.transition(
                    ServiceState::FailedScaling,
                    format!("Scaling did not finish within {}s", self.config.scale_timeout),
                );
            }
            return;
        }

        let cooldown = service
            .roles
            .iter_mut()
            .filter_map(|r| r.pending.take())
            .filter_map(|p| p.cooldown)
            .max();
        match cooldown {
            Some(secs) => {
                service.cooldown_until = Some(now + chrono::Duration::seconds(secs as i64));
                service.transition(
                    ServiceState::Cooldown,
                    format!("Scaling finished, cooling down for {}s", secs),
                );
            }
            None => service.transition(ServiceState::Running, "Scaling finished"),
        }
    }

    fn cool_down(&self, service: &mut Service, now: DateTime<Utc>) {
        self.refresh_nodes(service);
        service.refresh_role_states();

        let over = service.cooldown_until.map(|until| now >= until).unwrap_or(true);
        if over {
            service.cooldown_until = None;
            service.transition(ServiceState::Running, "Cooldown period finished");
        }
    }

    fn undeploy(&self, service: &mut Service, now: DateTime<Utc>) {
        self.refresh_nodes(service);
        service.refresh_role_states();

        let stuck: Vec<String> = service
            .roles
            .iter()
            .flat_map(|r| r.nodes.iter())
            .filter(|n| n.disposing && n.phase() == NodePhase::Error)
            .map(|n| n.deploy_id.to_string())
            .collect();
        if !stuck.is_empty() {
            service.transition(
                ServiceState::FailedUndeploying,
                format!("VM(s) {} failed to terminate", stuck.join(", ")),
            );
            return;
        }

        if service.roles.iter().all(|r| r.nodes.is_empty()) {
            if service.has_reservations() {
                service.transition(ServiceState::UndeployingNets, "Releasing networks");
            } else {
                service.transition(ServiceState::Done, "Service undeployed");
            }
            return;
        }
        if self.expired(service, self.config.undeploy_timeout, now) {
            service.transition(
                ServiceState::FailedUndeploying,
                format!("Undeployment did not finish within {}s", self.config.undeploy_timeout),
            );
            return;
        }

        // children go first
        let ready: Vec<usize> = (0..service.roles.len())
            .filter(|&i| dependency::children_released(&service.roles, &service.roles[i].name))
            .collect();

        for idx in ready {
            let hard = service.roles[idx].shutdown_action.is_hard();
            let targets: Vec<u64> = service.roles[idx]
                .nodes
                .iter()
                .filter(|n| !n.disposing)
                .map(|n| n.deploy_id)
                .collect();

            for vm in targets {
                match self.compute.terminate(vm, hard) {
                    Ok(()) | Err(Error::VmNotFound(_)) => {
                        if let Some(node) = service.roles[idx].node_mut(vm) {
                            node.disposing = true;
                        }
                        tracing::info!(service = service.id, role = %service.roles[idx].name, vm, "VM terminated");
                    }
                    Err(e) if e.is_transient() => {
                        service.log_error(format!("Cannot terminate VM {}: {}", vm, e));
                        return;
                    }
                    Err(e) => {
                        service.log_error(format!("Cannot terminate VM {}: {}", vm, e));
                        service.transition(ServiceState::FailedUndeploying, "Undeployment failed");
                        return;
                    }
                }
            }
        }
    }

    fn undeploy_networks(&self, service: &mut Service) {
        match network::release_all(service, self.vnets.as_ref()) {
            Ok(()) => service.transition(ServiceState::Done, "Networks released, service undeployed"),
            Err(e) => {
                service.log_error(format!("Network release failed: {}", e));
                service.transition(ServiceState::FailedUndeployingNets, "Network release failed");
            }
        }
    }

    /// Fetch the current VM record of every node and drop disposed nodes
    /// whose VM is gone
    fn refresh_nodes(&self, service: &mut Service) {
        let service_id = service.id;
        for role in &mut service.roles {
            for node in &mut role.nodes {
                match self.compute.show_vm(node.deploy_id) {
                    Ok(vm) => node.update(vm),
                    Err(Error::VmNotFound(id)) => node.update(
                        VmInfo::new(id, "", role.template_id).with_state(VmState::Done, LcmState::LcmInit),
                    ),
                    Err(e) => {
                        tracing::warn!(service = service_id, vm = node.deploy_id, error = %e, "Cannot refresh VM")
                    }
                }
            }
            role.nodes.retain(|n| !(n.disposing && n.phase() == NodePhase::Done));
        }
    }

    /// Instantiate VMs until the role has `cardinality` live nodes.
    /// Transient failures are logged and left for the next tick.
    fn create_missing_nodes(&self, service: &mut Service, idx: usize) -> Result<()> {
        for _ in 0..service.roles[idx].missing_nodes() {
            let request = vm_request(service, &service.roles[idx]);
            match self.compute.instantiate(&request) {
                Ok(vm) => {
                    tracing::info!(service = service.id, role = %service.roles[idx].name, vm, "VM instantiated");
                    service.roles[idx].nodes.push(Node::new(vm));
                }
                Err(e) if e.is_transient() => {
                    let message = format!("Role '{}': {}", service.roles[idx].name, e);
                    service.log_error(message);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Terminate scale-down victims, newest first
    fn terminate_excess_nodes(&self, service: &mut Service, idx: usize) -> Result<()> {
        let hard = service.roles[idx].shutdown_action.is_hard();
        for vm in service.roles[idx].scale_down_victims() {
            match self.compute.terminate(vm, hard) {
                Ok(()) | Err(Error::VmNotFound(_)) => {
                    if let Some(node) = service.roles[idx].node_mut(vm) {
                        node.disposing = true;
                    }
                    tracing::info!(service = service.id, role = %service.roles[idx].name, vm, "VM terminated");
                }
                Err(e) if e.is_transient() => {
                    let message = format!("Role '{}': {}", service.roles[idx].name, e);
                    service.log_error(message);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether the service has been in its current state for `timeout` seconds
    fn expired(&self, service: &Service, timeout: u64, now: DateTime<Utc>) -> bool {
        service
            .state_since()
            .map(|since| now - since >= chrono::Duration::seconds(timeout as i64))
            .unwrap_or(false)
    }
}

fn failed_roles(service: &Service) -> Vec<String> {
    service
        .roles
        .iter()
        .filter(|r| r.state == RoleState::Error)
        .map(|r| r.name.clone())
        .collect()
}

fn vm_request(service: &Service, role: &Role) -> InstantiateRequest {
    let mut context = BTreeMap::new();
    context.insert("SERVICE_ID".to_string(), service.id.to_string());
    context.insert("ROLE_NAME".to_string(), role.name.clone());
    for (key, value) in &service.custom_attrs_values {
        context.insert(key.clone(), value.clone());
    }
    for (name, id) in &service.networks_values {
        context.insert(format!("NETWORK_{}", name.to_uppercase()), id.to_string());
    }

    InstantiateRequest {
        template_id: role.template_id,
        name: format!("{}_{}_(service_{})", role.name, role.nodes.len(), service.id),
        user_inputs: role.user_inputs_values.clone(),
        context,
        owner: service.owner.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::MockCompute;

    fn running(id: u64) -> VmInfo {
        VmInfo::new(id, "vm", 0).with_state(VmState::Active, LcmState::Running)
    }

    fn setup(compute: Arc<dyn Compute>) -> (Orchestrator, u64) {
        let sim = Arc::new(SimCloud::instant());
        sim.register_template(VmTemplate::new(0, "base", crate::ADMIN_USER));
        let orch = Orchestrator::new(OrchestratorConfig::default(), compute, sim.clone(), sim).unwrap();
        let template = ServiceTemplate::new("app", crate::ADMIN_USER)
            .with_role(RoleDefinition::new("web", 0, 2));
        let template_id = orch.create_template(template).unwrap();
        let id = orch
            .instantiate(template_id, &MergeTemplate::default(), crate::ADMIN_USER)
            .unwrap();
        (orch, id)
    }

    #[test]
    fn test_transient_instantiate_failure_is_retried() {
        let mut compute = MockCompute::new();
        let mut calls = 0u64;
        compute.expect_instantiate().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(Error::TransientInfra("compute layer unavailable".into()))
            } else {
                Ok(calls)
            }
        });
        compute.expect_show_vm().returning(|id| Ok(running(id)));

        let (orch, id) = setup(Arc::new(compute));
        assert_eq!(orch.reconcile_service(id).unwrap(), ServiceState::Deploying);
        assert_eq!(orch.reconcile_service(id).unwrap(), ServiceState::Deploying);
        assert_eq!(orch.show(id).unwrap().node_count(), 0);

        orch.reconcile_service(id).unwrap();
        assert_eq!(orch.reconcile_service(id).unwrap(), ServiceState::Running);

        let service = orch.show(id).unwrap();
        assert_eq!(service.role("web").unwrap().nodes.len(), 2);
        assert!(service.log.iter().any(|e| e.severity == Severity::Error));
    }

    #[test]
    fn test_persistent_transient_failure_hits_deadline() {
        let mut compute = MockCompute::new();
        compute
            .expect_instantiate()
            .returning(|_| Err(Error::TransientInfra("compute layer unavailable".into())));

        let (orch, id) = setup(Arc::new(compute));
        orch.reconcile_service(id).unwrap();
        orch.reconcile_service(id).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(orch.reconcile_service_at(id, later).unwrap(), ServiceState::FailedDeploying);
    }

    #[test]
    fn test_lost_vm_fails_deployment() {
        let mut compute = MockCompute::new();
        let mut next = 0u64;
        compute.expect_instantiate().returning(move |_| {
            next += 1;
            Ok(next)
        });
        compute.expect_show_vm().returning(|id| {
            if id == 2 {
                Err(Error::VmNotFound(id))
            } else {
                Ok(running(id))
            }
        });

        let (orch, id) = setup(Arc::new(compute));
        orch.reconcile_service(id).unwrap();
        orch.reconcile_service(id).unwrap();
        assert_eq!(orch.reconcile_service(id).unwrap(), ServiceState::FailedDeploying);
    }

    #[test]
    fn test_non_transient_terminate_error_fails_undeploy() {
        let mut compute = MockCompute::new();
        let mut next = 0u64;
        compute.expect_instantiate().returning(move |_| {
            next += 1;
            Ok(next)
        });
        compute.expect_show_vm().returning(|id| Ok(running(id)));
        compute
            .expect_terminate()
            .returning(|_, _| Err(Error::Other("permission denied".into())));

        let (orch, id) = setup(Arc::new(compute));
        for _ in 0..3 {
            orch.reconcile_service(id).unwrap();
        }
        assert_eq!(orch.show(id).unwrap().state, ServiceState::Running);

        orch.shutdown(id).unwrap();
        assert_eq!(orch.reconcile_service(id).unwrap(), ServiceState::FailedUndeploying);
    }

    #[test]
    fn test_dispatch_routes_operations() {
        let sim = Arc::new(SimCloud::instant());
        sim.register_template(VmTemplate::new(0, "base", crate::ADMIN_USER));
        let orch = Orchestrator::simulated(OrchestratorConfig::default(), sim).unwrap();
        let template_id = orch
            .create_template(
                ServiceTemplate::new("app", "").with_role(RoleDefinition::new("web", 0, 1)),
            )
            .unwrap();
        assert_eq!(orch.get_template(template_id).unwrap().owner, crate::ADMIN_USER);

        let op: Operation = serde_json::from_value(serde_json::json!({
            "op": "instantiate",
            "template_id": template_id,
        }))
        .unwrap();
        let Outcome::Created { service_id } = orch.dispatch(op).unwrap() else {
            panic!("expected a created service");
        };

        match orch.dispatch(Operation::List).unwrap() {
            Outcome::Services(list) => assert_eq!(list.len(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }

        let err = orch
            .dispatch(Operation::Scale {
                service_id,
                role: "web".into(),
                cardinality: 2,
                force: false,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        assert!(matches!(
            orch.dispatch(Operation::Show { service_id: 99 }),
            Err(Error::ServiceNotFound(99))
        ));
    }

    #[test]
    fn test_template_in_use_cannot_be_deleted() {
        let (orch, id) = setup(Arc::new(MockCompute::new()));
        let template_id = orch.show(id).unwrap().template_id;
        assert!(matches!(orch.delete_template(template_id), Err(Error::Conflict(_))));

        orch.delete(id, true).unwrap();
        orch.delete_template(template_id).unwrap();
        assert!(matches!(
            orch.get_template(template_id),
            Err(Error::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_max_services() {
        let sim = Arc::new(SimCloud::instant());
        sim.register_template(VmTemplate::new(0, "base", crate::ADMIN_USER));
        let orch =
            Orchestrator::simulated(OrchestratorConfig::new().max_services(1), sim).unwrap();
        let template_id = orch
            .create_template(
                ServiceTemplate::new("app", "").with_role(RoleDefinition::new("web", 0, 1)),
            )
            .unwrap();
        orch.instantiate(template_id, &MergeTemplate::default(), "oneadmin").unwrap();
        assert!(matches!(
            orch.instantiate(template_id, &MergeTemplate::default(), "oneadmin"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_max_services_holds_under_concurrent_instantiate() {
        let sim = Arc::new(SimCloud::instant());
        sim.register_template(VmTemplate::new(0, "base", crate::ADMIN_USER));
        let orch = Arc::new(
            Orchestrator::simulated(OrchestratorConfig::new().max_services(2), sim).unwrap(),
        );
        let template_id = orch
            .create_template(
                ServiceTemplate::new("app", "").with_role(RoleDefinition::new("web", 0, 1)),
            )
            .unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let orch = orch.clone();
                std::thread::spawn(move || {
                    orch.instantiate(template_id, &MergeTemplate::default(), crate::ADMIN_USER)
                        .is_ok()
                })
            })
            .collect();
        let created = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(created, 2);
        assert_eq!(orch.list().len(), 2);
    }
}
