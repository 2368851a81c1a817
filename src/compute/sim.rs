//! In-process simulated cloud
//!
//! Implements the compute layer, template registry and virtual network pool.
//! VMs move one lifecycle step per `advance()` call:
//! PENDING -> PROLOG -> BOOT -> RUNNING (or BOOT_FAILURE), and terminated
//! VMs go SHUTDOWN -> DONE. In instant mode every step completes at once.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::compute::{Compute, TemplateRegistry};
use crate::models::{InstantiateRequest, LcmState, VmInfo, VmState, VmTemplate};
use crate::network::VnetPool;
use crate::{Error, Result};

/// Recorded call, for assertions and the `serve` debug log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimCall {
    Instantiate { vm: u64, template_id: u64, name: String },
    Terminate { vm: u64, hard: bool },
    Reserve { id: u64, from: u64, size: u32 },
    Release { id: u64 },
}

#[derive(Debug, Clone)]
struct SimVm {
    info: VmInfo,
    terminating: bool,
    fail_boot: bool,
}

#[derive(Default)]
struct SimState {
    vms: BTreeMap<u64, SimVm>,
    templates: BTreeMap<u64, VmTemplate>,
    reservations: BTreeMap<u64, (u64, u32)>,
    next_vm: u64,
    next_vnet: u64,
    failing_templates: BTreeSet<u64>,
    instantiate_failures: usize,
    terminate_failures: usize,
    reserve_failures: usize,
    release_failures: usize,
    calls: Vec<SimCall>,
}

pub struct SimCloud {
    state: RwLock<SimState>,
    instant: bool,
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCloud {
    /// Stepped simulation, driven by `advance()`
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SimState {
                next_vnet: 100,
                ..Default::default()
            }),
            instant: false,
        }
    }

    /// VMs boot and terminate immediately
    pub fn instant() -> Self {
        Self {
            instant: true,
            ..Self::new()
        }
    }

    pub fn register_template(&self, template: VmTemplate) {
        self.state.write().templates.insert(template.id, template);
    }

    /// VMs created from this template fail during boot
    pub fn fail_boot_for_template(&self, template_id: u64) {
        self.state.write().failing_templates.insert(template_id);
    }

    pub fn clear_boot_failures(&self) {
        self.state.write().failing_templates.clear();
    }

    /// Make the next `n` instantiate calls fail with a transient error
    pub fn fail_next_instantiates(&self, n: usize) {
        self.state.write().instantiate_failures = n;
    }

    pub fn fail_next_terminates(&self, n: usize) {
        self.state.write().terminate_failures = n;
    }

    pub fn fail_next_reservations(&self, n: usize) {
        self.state.write().reserve_failures = n;
    }

    pub fn fail_next_releases(&self, n: usize) {
        self.state.write().release_failures = n;
    }

    /// Push a running VM into an error state
    pub fn crash_vm(&self, id: u64) {
        if let Some(vm) = self.state.write().vms.get_mut(&id) {
            vm.info.state = VmState::Active;
            vm.info.lcm_state = LcmState::Unknown;
        }
    }

    /// Bring a crashed VM back to RUNNING
    pub fn heal_vm(&self, id: u64) {
        if let Some(vm) = self.state.write().vms.get_mut(&id) {
            vm.info.state = VmState::Active;
            vm.info.lcm_state = LcmState::Running;
        }
    }

    /// Set a monitoring value on every VM that is not terminating
    pub fn set_monitoring(&self, name: &str, value: f64) {
        for vm in self.state.write().vms.values_mut().filter(|v| !v.terminating) {
            vm.info.monitoring.insert(name.to_string(), value);
        }
    }

    /// Move every VM one lifecycle step forward
    pub fn advance(&self) {
        let mut state = self.state.write();
        for vm in state.vms.values_mut() {
            step(vm);
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.read().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.write().calls.clear();
    }

    pub fn instantiated_from(&self, template_id: u64) -> usize {
        self.state
            .read()
            .calls
            .iter()
            .filter(|c| matches!(c, SimCall::Instantiate { template_id: t, .. } if *t == template_id))
            .count()
    }

    /// VM ids terminated, in call order
    pub fn terminated(&self) -> Vec<u64> {
        self.state
            .read()
            .calls
            .iter()
            .filter_map(|c| match c {
                SimCall::Terminate { vm, .. } => Some(*vm),
                _ => None,
            })
            .collect()
    }

    pub fn active_reservations(&self) -> usize {
        self.state.read().reservations.len()
    }

    pub fn vm_count(&self) -> usize {
        self.state
            .read()
            .vms
            .values()
            .filter(|v| v.info.state != VmState::Done)
            .count()
    }
}

fn step(vm: &mut SimVm) {
    let info = &mut vm.info;
    if info.state == VmState::Done {
        return;
    }
    if vm.terminating {
        info.state = VmState::Done;
        info.lcm_state = LcmState::LcmInit;
        return;
    }
    match (info.state, info.lcm_state) {
        (VmState::Pending, _) => {
            info.state = VmState::Active;
            info.lcm_state = LcmState::Prolog;
        }
        (VmState::Active, LcmState::Prolog) => info.lcm_state = LcmState::Boot,
        (VmState::Active, LcmState::Boot) => {
            info.lcm_state = if vm.fail_boot {
                LcmState::BootFailure
            } else {
                LcmState::Running
            };
        }
        _ => {}
    }
}

impl Compute for SimCloud {
    fn list_vms(&self) -> Result<Vec<VmInfo>> {
        Ok(self.state.read().vms.values().map(|v| v.info.clone()).collect())
    }

    fn show_vm(&self, id: u64) -> Result<VmInfo> {
        self.state
            .read()
            .vms
            .get(&id)
            .map(|v| v.info.clone())
            .ok_or(Error::VmNotFound(id))
    }

    fn instantiate(&self, request: &InstantiateRequest) -> Result<u64> {
        let mut state = self.state.write();
        if !state.templates.contains_key(&request.template_id) {
            return Err(Error::TemplateNotFound(request.template_id.to_string()));
        }
        if state.instantiate_failures > 0 {
            state.instantiate_failures -= 1;
            return Err(Error::TransientInfra(format!(
                "cannot allocate VM from template {}",
                request.template_id
            )));
        }

        let id = state.next_vm;
        state.next_vm += 1;
        let mut vm = SimVm {
            info: VmInfo::new(id, &request.name, request.template_id),
            terminating: false,
            fail_boot: state.failing_templates.contains(&request.template_id),
        };
        if self.instant {
            for _ in 0..3 {
                step(&mut vm);
            }
        }
        state.vms.insert(id, vm);
        state.calls.push(SimCall::Instantiate {
            vm: id,
            template_id: request.template_id,
            name: request.name.clone(),
        });
        Ok(id)
    }

    fn terminate(&self, id: u64, hard: bool) -> Result<()> {
        let mut state = self.state.write();
        if state.terminate_failures > 0 {
            state.terminate_failures -= 1;
            return Err(Error::TransientInfra(format!("cannot terminate VM {}", id)));
        }
        let instant = self.instant;
        let vm = state.vms.get_mut(&id).ok_or(Error::VmNotFound(id))?;
        if vm.info.state != VmState::Done {
            vm.terminating = true;
            vm.info.state = VmState::Active;
            vm.info.lcm_state = LcmState::Shutdown;
            if instant {
                step(vm);
            }
        }
        state.calls.push(SimCall::Terminate { vm: id, hard });
        Ok(())
    }
}

impl TemplateRegistry for SimCloud {
    fn show_template(&self, id: u64) -> Result<VmTemplate> {
        self.state
            .read()
            .templates
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))
    }
}

impl VnetPool for SimCloud {
    fn reserve(&self, from: u64, size: u32, _name: &str) -> Result<u64> {
        let mut state = self.state.write();
        if state.reserve_failures > 0 {
            state.reserve_failures -= 1;
            return Err(Error::TransientInfra(format!(
                "not enough free leases in network {}",
                from
            )));
        }
        let id = state.next_vnet;
        state.next_vnet += 1;
        state.reservations.insert(id, (from, size));
        state.calls.push(SimCall::Reserve { id, from, size });
        Ok(id)
    }

    fn release(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        if state.release_failures > 0 {
            state.release_failures -= 1;
            return Err(Error::TransientInfra(format!("cannot release network {}", id)));
        }
        state.reservations.remove(&id);
        state.calls.push(SimCall::Release { id });
        Ok(())
    }
}
