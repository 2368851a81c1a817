//! External collaborators: compute layer and template registry
//!
//! The orchestrator only talks to the cloud through these traits. Calls are
//! expected to return quickly; a VM's progress is observed later through
//! `show_vm`.

pub mod sim;

use crate::models::{InstantiateRequest, VmInfo, VmTemplate};
use crate::Result;

/// VM operations (`VM.list`, `VM.show`, `VM.instantiate`, `VM.terminate`)
#[cfg_attr(test, mockall::automock)]
pub trait Compute: Send + Sync {
    fn list_vms(&self) -> Result<Vec<VmInfo>>;

    /// Fails with `Error::VmNotFound` once the VM record is gone
    fn show_vm(&self, id: u64) -> Result<VmInfo>;

    /// Start creating a VM and return its id without waiting for boot
    fn instantiate(&self, request: &InstantiateRequest) -> Result<u64>;

    fn terminate(&self, id: u64, hard: bool) -> Result<()>;
}

/// Resolves VM templates (`Template.show`)
#[cfg_attr(test, mockall::automock)]
pub trait TemplateRegistry: Send + Sync {
    /// Fails with `Error::TemplateNotFound` for unknown ids
    fn show_template(&self, id: u64) -> Result<VmTemplate>;
}

pub use sim::SimCloud;
