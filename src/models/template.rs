//! Templates - stored service definitions and the VM templates roles use

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::role::{ElasticityPolicy, Role, ShutdownAction};
use super::service::Service;
use crate::compute::TemplateRegistry;
use crate::{dependency, Error, Result};

/// A VM template resolved through the template registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub id: u64,
    pub name: String,
    pub owner: String,
    /// Readable by every user
    #[serde(default)]
    pub public: bool,
    pub cpu: f64,
    pub vcpu: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub nics: Vec<Nic>,
    #[serde(default)]
    pub user_inputs: Vec<UserInput>,
}

impl VmTemplate {
    pub fn new(id: u64, name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            public: false,
            cpu: 1.0,
            vcpu: 1,
            memory_mb: 1024,
            disks: vec![],
            nics: vec![],
            user_inputs: vec![],
        }
    }

    pub fn with_user_input(mut self, input: UserInput) -> Self {
        self.user_inputs.push(input);
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn readable_by(&self, user: &str) -> bool {
        self.public || self.owner == user || user == crate::ADMIN_USER
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub image: String,
    #[serde(default)]
    pub size_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nic {
    /// Network name, or `$name` to reference a service network
    pub network: String,
}

/// An input the VM template asks for at instantiation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    pub name: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<String>,
}

impl UserInput {
    pub fn mandatory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: true,
            description: String::new(),
            default: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    #[default]
    Text,
    Number,
    Boolean,
    List,
}

/// Service-level attribute the user fills in at instantiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomAttribute {
    pub name: String,
    #[serde(default)]
    pub kind: AttributeKind,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl CustomAttribute {
    pub fn new(name: impl Into<String>, kind: AttributeKind, mandatory: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            mandatory,
            description: String::new(),
            default: None,
            options: vec![],
        }
    }

    fn check(&self, value: &str) -> Result<()> {
        let ok = match self.kind {
            AttributeKind::Text => true,
            AttributeKind::Number => value.parse::<f64>().is_ok(),
            AttributeKind::Boolean => matches!(value, "YES" | "NO" | "true" | "false"),
            AttributeKind::List => self.options.iter().any(|o| o == value),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "custom attribute '{}' has invalid value '{}'",
                self.name, value
            )))
        }
    }
}

/// A network the service needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub name: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub description: String,
}

/// How a service network is resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkSelection {
    /// Use an existing virtual network
    Existing { id: u64 },
    /// Reserve `size` addresses from virtual network `from`
    Reserve { from: u64, size: u32 },
}

impl NetworkSelection {
    pub fn needs_reservation(&self) -> bool {
        matches!(self, NetworkSelection::Reserve { .. })
    }
}

/// Role as declared in a service template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    pub template_id: u64,
    pub cardinality: usize,
    #[serde(default)]
    pub min_vms: Option<usize>,
    #[serde(default)]
    pub max_vms: Option<usize>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub elasticity_policies: Vec<ElasticityPolicy>,
    #[serde(default)]
    pub cooldown: Option<u64>,
    #[serde(default)]
    pub shutdown_action: ShutdownAction,
    #[serde(default)]
    pub user_inputs_values: BTreeMap<String, String>,
}

impl RoleDefinition {
    pub fn new(name: impl Into<String>, template_id: u64, cardinality: usize) -> Self {
        Self {
            name: name.into(),
            template_id,
            cardinality,
            min_vms: None,
            max_vms: None,
            parents: vec![],
            elasticity_policies: vec![],
            cooldown: None,
            shutdown_action: ShutdownAction::default(),
            user_inputs_values: BTreeMap::new(),
        }
    }

    pub fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_vms = Some(min);
        self.max_vms = Some(max);
        self
    }

    pub fn with_parents(mut self, parents: &[&str]) -> Self {
        self.parents = parents.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_policy(mut self, policy: ElasticityPolicy) -> Self {
        self.elasticity_policies.push(policy);
        self
    }

    /// Resolve omitted bounds: min 1 (0 for empty roles), max `default_max`
    /// or the cardinality when larger
    pub fn bounds(&self, default_max: usize) -> (usize, usize) {
        let min = self
            .min_vms
            .unwrap_or(if self.cardinality == 0 { 0 } else { 1 });
        let max = self.max_vms.unwrap_or(default_max.max(self.cardinality));
        (min, max)
    }
}

/// Stored, reusable service definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    pub roles: Vec<RoleDefinition>,
    #[serde(default)]
    pub custom_attrs: Vec<CustomAttribute>,
    #[serde(default)]
    pub networks: Vec<NetworkDefinition>,
    #[serde(default)]
    pub default_cooldown: Option<u64>,
    #[serde(default = "Utc::now")]
    pub registration_time: DateTime<Utc>,
}

/// Per-role overrides supplied at instantiation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleOverride {
    pub name: String,
    #[serde(default)]
    pub cardinality: Option<usize>,
    #[serde(default)]
    pub user_inputs_values: BTreeMap<String, String>,
    #[serde(default)]
    pub elasticity_policies: Option<Vec<ElasticityPolicy>>,
}

/// Instantiation overrides applied on top of a service template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeTemplate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<RoleOverride>,
    #[serde(default)]
    pub custom_attrs_values: BTreeMap<String, String>,
    #[serde(default)]
    pub networks_values: BTreeMap<String, NetworkSelection>,
}

impl ServiceTemplate {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            owner: owner.into(),
            roles: vec![],
            custom_attrs: vec![],
            networks: vec![],
            default_cooldown: None,
            registration_time: Utc::now(),
        }
    }

    pub fn with_role(mut self, role: RoleDefinition) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_custom_attr(mut self, attr: CustomAttribute) -> Self {
        self.custom_attrs.push(attr);
        self
    }

    pub fn with_network(mut self, name: impl Into<String>, mandatory: bool) -> Self {
        self.networks.push(NetworkDefinition {
            name: name.into(),
            mandatory,
            description: String::new(),
        });
        self
    }

    /// Structural checks run at registration and again at instantiation
    pub fn validate(&self, default_max: usize) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("service template name cannot be empty"));
        }
        if self.roles.is_empty() {
            return Err(Error::validation("service template has no roles"));
        }

        let mut seen = std::collections::BTreeSet::new();
        for role in &self.roles {
            if !seen.insert(role.name.as_str()) {
                return Err(Error::Validation(format!("duplicate role '{}'", role.name)));
            }
            let (min, max) = role.bounds(default_max);
            if min > max || role.cardinality < min || role.cardinality > max {
                return Err(Error::Validation(format!(
                    "role '{}': cardinality {} is outside [{}, {}]",
                    role.name, role.cardinality, min, max
                )));
            }
            for policy in &role.elasticity_policies {
                crate::elasticity::Expression::parse(&policy.expression)?;
            }
        }

        dependency::deploy_order(
            self.roles.iter().map(|r| (r.name.as_str(), r.parents.as_slice())),
        )?;
        Ok(())
    }

    /// Decode HTML-escaped policy expressions into the canonical plain form
    pub fn normalize(&mut self) {
        for role in &mut self.roles {
            for policy in &mut role.elasticity_policies {
                policy.expression = decode_html_entities(&policy.expression);
            }
        }
    }

    /// Merge overrides into this template and build a PENDING service.
    /// Fails before anything is created when a value cannot be resolved.
    pub fn instantiate(
        &self,
        service_id: u64,
        merge: &MergeTemplate,
        registry: &dyn TemplateRegistry,
        user: &str,
        default_max: usize,
    ) -> Result<Service> {
        self.validate(default_max)?;

        for over in &merge.roles {
            if !self.roles.iter().any(|r| r.name == over.name) {
                return Err(Error::RoleNotFound(over.name.clone()));
            }
        }

        let custom_attrs_values = self.resolve_custom_attrs(merge)?;
        let networks_selections = self.resolve_networks(merge)?;

        let mut roles = Vec::with_capacity(self.roles.len());
        for def in &self.roles {
            let over = merge.roles.iter().find(|o| o.name == def.name);
            roles.push(self.merge_role(def, over, registry, user, default_max)?);
        }

        let name = merge
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.name.clone());

        let mut service = Service::new(service_id, name, user, self.id);
        service.roles = roles;
        service.custom_attrs_values = custom_attrs_values;
        service.networks = self.networks.clone();
        service.networks_selections = networks_selections;
        service.default_cooldown = self.default_cooldown;
        for (name, selection) in &service.networks_selections {
            if let NetworkSelection::Existing { id } = selection {
                service.networks_values.insert(name.clone(), *id);
            }
        }
        Ok(service)
    }

    fn resolve_custom_attrs(&self, merge: &MergeTemplate) -> Result<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        for attr in &self.custom_attrs {
            let value = merge
                .custom_attrs_values
                .get(&attr.name)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .or_else(|| attr.default.clone().filter(|v| !v.trim().is_empty()));

            match value {
                Some(v) => {
                    attr.check(&v)?;
                    values.insert(attr.name.clone(), v);
                }
                None if attr.mandatory => {
                    return Err(Error::Validation(format!(
                        "mandatory custom attribute '{}' has no value",
                        attr.name
                    )));
                }
                None => {}
            }
        }
        Ok(values)
    }

    fn resolve_networks(&self, merge: &MergeTemplate) -> Result<BTreeMap<String, NetworkSelection>> {
        for name in merge.networks_values.keys() {
            if !self.networks.iter().any(|n| &n.name == name) {
                return Err(Error::Validation(format!("unknown network '{}'", name)));
            }
        }

        let mut selections = BTreeMap::new();
        for net in &self.networks {
            match merge.networks_values.get(&net.name) {
                Some(NetworkSelection::Reserve { size: 0, .. }) => {
                    return Err(Error::Validation(format!(
                        "network '{}': reservation size must be positive",
                        net.name
                    )));
                }
                Some(sel) => {
                    selections.insert(net.name.clone(), sel.clone());
                }
                None if net.mandatory => {
                    return Err(Error::Validation(format!(
                        "mandatory network '{}' has no value",
                        net.name
                    )));
                }
                None => {}
            }
        }
        Ok(selections)
    }

    fn merge_role(
        &self,
        def: &RoleDefinition,
        over: Option<&RoleOverride>,
        registry: &dyn TemplateRegistry,
        user: &str,
        default_max: usize,
    ) -> Result<Role> {
        let vm_template = match registry.show_template(def.template_id) {
            Ok(t) => t,
            Err(Error::TemplateNotFound(_)) => {
                return Err(Error::Validation(format!(
                    "role '{}': VM template {} does not exist",
                    def.name, def.template_id
                )))
            }
            Err(e) => return Err(e),
        };
        if !vm_template.readable_by(user) {
            return Err(Error::Validation(format!(
                "role '{}': VM template {} is not readable by {}",
                def.name, def.template_id, user
            )));
        }

        let (min, max) = def.bounds(default_max);
        let cardinality = over.and_then(|o| o.cardinality).unwrap_or(def.cardinality);
        if cardinality < min || cardinality > max {
            return Err(Error::Validation(format!(
                "role '{}': cardinality {} is outside [{}, {}]",
                def.name, cardinality, min, max
            )));
        }

        let mut user_inputs_values = def.user_inputs_values.clone();
        if let Some(o) = over {
            user_inputs_values.extend(o.user_inputs_values.clone());
        }
        for input in &vm_template.user_inputs {
            let provided = user_inputs_values
                .get(&input.name)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false);
            if provided {
                continue;
            }
            match &input.default {
                Some(d) => {
                    user_inputs_values.insert(input.name.clone(), d.clone());
                }
                None if input.mandatory => {
                    return Err(Error::Validation(format!(
                        "role '{}': mandatory user input '{}' has no value",
                        def.name, input.name
                    )));
                }
                None => {}
            }
        }

        // stored policies are already canonical; only overrides arrive escaped
        let policies = match over.and_then(|o| o.elasticity_policies.clone()) {
            Some(mut policies) => {
                for policy in &mut policies {
                    policy.expression = decode_html_entities(&policy.expression);
                    crate::elasticity::Expression::parse(&policy.expression)?;
                }
                policies
            }
            None => def.elasticity_policies.clone(),
        };

        let mut role = Role::new(&def.name, def.template_id, cardinality)
            .with_bounds(min, max)
            .with_parents(def.parents.clone());
        role.elasticity_policies = policies;
        role.cooldown = def.cooldown;
        role.shutdown_action = def.shutdown_action;
        role.user_inputs_values = user_inputs_values;
        Ok(role)
    }
}

/// Decode the HTML entities a browser form may have escaped
pub fn decode_html_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::sim::SimCloud;
    use crate::models::PolicyType;

    fn registry() -> SimCloud {
        let sim = SimCloud::new();
        sim.register_template(VmTemplate::new(0, "base", "alice"));
        sim.register_template(
            VmTemplate::new(1, "db", "alice").with_user_input(UserInput::mandatory("DB_PASSWORD")),
        );
        sim.register_template(VmTemplate::new(2, "private", "bob"));
        sim
    }

    fn template() -> ServiceTemplate {
        ServiceTemplate::new("app", "alice")
            .with_role(RoleDefinition::new("db", 1, 1).with_bounds(1, 3))
            .with_role(RoleDefinition::new("web", 0, 2).with_parents(&["db"]))
    }

    fn merge_with_password() -> MergeTemplate {
        MergeTemplate {
            roles: vec![RoleOverride {
                name: "db".into(),
                user_inputs_values: [("DB_PASSWORD".to_string(), "s3cret".to_string())].into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_instantiate_merges_overrides() {
        let mut merge = merge_with_password();
        merge.name = Some("prod".into());
        merge.roles.push(RoleOverride {
            name: "web".into(),
            cardinality: Some(4),
            ..Default::default()
        });

        let service = template().instantiate(7, &merge, &registry(), "alice", 20).unwrap();
        assert_eq!(service.id, 7);
        assert_eq!(service.name, "prod");
        assert_eq!(service.role("web").unwrap().cardinality, 4);
        assert_eq!(service.role("web").unwrap().parents, vec!["db".to_string()]);
        assert_eq!(
            service.role("db").unwrap().user_inputs_values.get("DB_PASSWORD").map(String::as_str),
            Some("s3cret")
        );
    }

    #[test]
    fn test_missing_mandatory_user_input() {
        let err = template()
            .instantiate(1, &MergeTemplate::default(), &registry(), "alice", 20)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_missing_mandatory_custom_attr() {
        let tmpl = template().with_custom_attr(CustomAttribute::new("DOMAIN", AttributeKind::Text, true));
        let err = tmpl
            .instantiate(1, &merge_with_password(), &registry(), "alice", 20)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut merge = merge_with_password();
        merge.custom_attrs_values.insert("DOMAIN".into(), "example.org".into());
        let service = tmpl.instantiate(1, &merge, &registry(), "alice", 20).unwrap();
        assert_eq!(service.custom_attrs_values["DOMAIN"], "example.org");
    }

    #[test]
    fn test_list_attribute_options() {
        let mut attr = CustomAttribute::new("SIZE", AttributeKind::List, true);
        attr.options = vec!["small".into(), "large".into()];
        let tmpl = template().with_custom_attr(attr);

        let mut merge = merge_with_password();
        merge.custom_attrs_values.insert("SIZE".into(), "medium".into());
        assert!(tmpl.instantiate(1, &merge, &registry(), "alice", 20).is_err());
    }

    #[test]
    fn test_mandatory_network() {
        let tmpl = template().with_network("private", true);
        assert!(tmpl
            .instantiate(1, &merge_with_password(), &registry(), "alice", 20)
            .is_err());

        let mut merge = merge_with_password();
        merge
            .networks_values
            .insert("private".into(), NetworkSelection::Reserve { from: 0, size: 4 });
        let service = tmpl.instantiate(1, &merge, &registry(), "alice", 20).unwrap();
        assert!(service.has_reservations());
        assert!(service.networks_values.is_empty());
    }

    #[test]
    fn test_unreadable_template() {
        let tmpl = ServiceTemplate::new("x", "alice").with_role(RoleDefinition::new("r", 2, 1));
        let err = tmpl
            .instantiate(1, &MergeTemplate::default(), &registry(), "alice", 20)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(tmpl
            .instantiate(1, &MergeTemplate::default(), &registry(), "bob", 20)
            .is_ok());
    }

    #[test]
    fn test_missing_vm_template() {
        let tmpl = ServiceTemplate::new("x", "alice").with_role(RoleDefinition::new("r", 99, 1));
        let err = tmpl
            .instantiate(1, &MergeTemplate::default(), &registry(), "alice", 20)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_cardinality_override_out_of_bounds() {
        let mut merge = merge_with_password();
        merge.roles[0].cardinality = Some(5);
        let err = template().instantiate(1, &merge, &registry(), "alice", 20).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_cycle_rejected() {
        let tmpl = ServiceTemplate::new("loop", "alice")
            .with_role(RoleDefinition::new("a", 0, 1).with_parents(&["b"]))
            .with_role(RoleDefinition::new("b", 0, 1).with_parents(&["a"]));
        assert!(matches!(tmpl.validate(20), Err(Error::Validation(_))));
    }

    #[test]
    fn test_policy_expressions_are_decoded() {
        let mut tmpl = ServiceTemplate::new("el", "alice").with_role(
            RoleDefinition::new("web", 0, 1)
                .with_policy(ElasticityPolicy::new(PolicyType::Change, 1, "CPU &gt; 80 &amp; MEM &lt;= 3")),
        );
        tmpl.normalize();
        assert_eq!(tmpl.roles[0].elasticity_policies[0].expression, "CPU > 80 & MEM <= 3");
        // Decoding plain text is a no-op
        tmpl.normalize();
        assert_eq!(tmpl.roles[0].elasticity_policies[0].expression, "CPU > 80 & MEM <= 3");
    }

    #[test]
    fn test_only_override_policies_are_decoded() {
        let tmpl = ServiceTemplate::new("app", "alice")
            .with_role(RoleDefinition::new("db", 1, 1).with_bounds(1, 3))
            .with_role(
                RoleDefinition::new("web", 0, 2)
                    .with_policy(ElasticityPolicy::new(PolicyType::Change, 1, "CPU > 80")),
            );
        let mut merge = merge_with_password();
        merge.roles[0].elasticity_policies = Some(vec![ElasticityPolicy::new(
            PolicyType::Change,
            1,
            "CPU &gt; 90 &amp; MEM &lt; 2",
        )]);

        let service = tmpl.instantiate(1, &merge, &registry(), "alice", 20).unwrap();
        assert_eq!(
            service.role("db").unwrap().elasticity_policies[0].expression,
            "CPU > 90 & MEM < 2"
        );
        assert_eq!(
            service.role("web").unwrap().elasticity_policies,
            tmpl.roles[1].elasticity_policies
        );
    }

    #[test]
    fn test_decode_html_entities() {
        assert_eq!(decode_html_entities("a &amp;lt; b"), "a &lt; b");
        assert_eq!(decode_html_entities("plain"), "plain");
    }

    #[test]
    fn test_bounds_defaults() {
        assert_eq!(RoleDefinition::new("r", 0, 3).bounds(20), (1, 20));
        assert_eq!(RoleDefinition::new("r", 0, 0).bounds(20), (0, 20));
        assert_eq!(RoleDefinition::new("r", 0, 25).bounds(20), (1, 25));
    }
}
