//! API request/response types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{LogEntry, MergeTemplate, Role, Service, ServiceTemplate};

// === Service templates ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateResponse {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub roles: Vec<String>,
    pub registration_time: String,
    /// Full stored document
    pub body: ServiceTemplate,
}

impl From<ServiceTemplate> for TemplateResponse {
    fn from(t: ServiceTemplate) -> Self {
        Self {
            id: t.id,
            name: t.name.clone(),
            description: t.description.clone(),
            owner: t.owner.clone(),
            roles: t.roles.iter().map(|r| r.name.clone()).collect(),
            registration_time: t.registration_time.to_rfc3339(),
            body: t,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstantiateServiceRequest {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(flatten)]
    pub merge: MergeTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCreated {
    pub id: u64,
}

// === Services ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleResponse {
    pub name: String,
    pub state: String,
    pub cardinality: usize,
    pub min_vms: usize,
    pub max_vms: usize,
    pub parents: Vec<String>,
    pub nodes: Vec<u64>,
    pub scaling: bool,
}

impl From<&Role> for RoleResponse {
    fn from(r: &Role) -> Self {
        Self {
            name: r.name.clone(),
            state: r.state_label(),
            cardinality: r.cardinality,
            min_vms: r.min_vms,
            max_vms: r.max_vms,
            parents: r.parents.clone(),
            nodes: r.nodes.iter().map(|n| n.deploy_id).collect(),
            scaling: r.is_scaling(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: u64,
    pub name: String,
    pub owner: String,
    pub template_id: u64,
    pub state: String,
    pub state_code: u32,
    pub start_time: Option<String>,
    pub roles: Vec<RoleResponse>,
    pub networks: BTreeMap<String, u64>,
    pub log: Vec<LogEntry>,
}

impl From<Service> for ServiceResponse {
    fn from(s: Service) -> Self {
        Self {
            id: s.id,
            start_time: s.start_time().map(|t| t.to_rfc3339()),
            roles: s.roles.iter().map(RoleResponse::from).collect(),
            state: s.state.to_string(),
            state_code: s.state.code(),
            name: s.name,
            owner: s.owner,
            template_id: s.template_id,
            networks: s.networks_values,
            log: s.log,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub cardinality: usize,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub stepped: usize,
}

// === Generic ===

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiSuccess {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
