//! Flow service orchestrator
//!
//! Deploys and manages multi-tier applications ("services") made of roles:
//! homogeneous groups of VMs that scale independently, deploy in dependency
//! order, and grow or shrink through elasticity policies.
//!
//! # Key Features
//!
//! - **Service lifecycle** - PENDING through RUNNING to DONE, with
//!   recoverable FAILED_* states
//! - **Role dependencies** - a role deploys once its parents are RUNNING
//!   and undeploys once its children are gone
//! - **Scaling** - manual or policy driven, with cooldown
//! - **Persistence** - services survive restarts in SQLite
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use flow_kube::models::{MergeTemplate, RoleDefinition, ServiceTemplate, VmTemplate};
//! use flow_kube::{Orchestrator, OrchestratorConfig, SimCloud};
//!
//! let cloud = Arc::new(SimCloud::instant());
//! cloud.register_template(VmTemplate::new(0, "ubuntu", "oneadmin"));
//! let orch = Orchestrator::simulated(OrchestratorConfig::default(), cloud)?;
//!
//! let template = ServiceTemplate::new("shop", "oneadmin")
//!     .with_role(RoleDefinition::new("db", 0, 1))
//!     .with_role(RoleDefinition::new("web", 0, 2).with_parents(&["db"]));
//! let template_id = orch.create_template(template)?;
//! let service_id = orch.instantiate(template_id, &MergeTemplate::default(), "oneadmin")?;
//!
//! while orch.reconcile_service(service_id)? != flow_kube::models::ServiceState::Running {}
//! # Ok::<(), flow_kube::Error>(())
//! ```

pub mod api;
pub mod compute;
pub mod config;
pub mod db;
pub mod dependency;
pub mod elasticity;
pub mod error;
pub mod models;
pub mod network;
pub mod orchestrator;
pub mod reconciler;

pub use api::Server;
pub use compute::SimCloud;
pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use orchestrator::{Operation, Orchestrator, Outcome};
pub use reconciler::Reconciler;

/// Administrative user; may read every VM template
pub const ADMIN_USER: &str = "oneadmin";
