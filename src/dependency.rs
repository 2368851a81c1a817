//! Role dependency ordering
//!
//! A role deploys only once all of its parents are RUNNING, and undeploys
//! only once none of its children have VMs left.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{Role, RoleState};
use crate::{Error, Result};

/// Topological deploy order, ties broken by declaration order.
/// Fails on unknown parents and on cycles.
pub fn deploy_order<'a, I>(roles: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let roles: Vec<(&str, &[String])> = roles.into_iter().collect();
    let names: BTreeSet<&str> = roles.iter().map(|(n, _)| *n).collect();

    let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
    for (name, parents) in &roles {
        for parent in parents.iter() {
            if !names.contains(parent.as_str()) {
                return Err(Error::Validation(format!(
                    "role '{}' depends on unknown role '{}'",
                    name, parent
                )));
            }
        }
        let unique: BTreeSet<&str> = parents.iter().map(String::as_str).collect();
        remaining.insert(*name, unique.len());
    }

    let mut order: Vec<String> = Vec::with_capacity(roles.len());
    let mut placed: BTreeSet<&str> = BTreeSet::new();

    while placed.len() < roles.len() {
        let next = roles
            .iter()
            .find(|(name, _)| !placed.contains(name) && remaining[name] == 0)
            .map(|(name, _)| *name);

        let Some(name) = next else {
            let stuck: Vec<&str> = roles
                .iter()
                .map(|(n, _)| *n)
                .filter(|n| !placed.contains(n))
                .collect();
            return Err(Error::Validation(format!(
                "dependency cycle among roles: {}",
                stuck.join(", ")
            )));
        };

        placed.insert(name);
        order.push(name.to_string());
        for (child, parents) in &roles {
            if parents.iter().any(|p| p == name) {
                if let Some(count) = remaining.get_mut(child) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    Ok(order)
}

/// Whether every parent of `role` is RUNNING
pub fn parents_ready(roles: &[Role], role: &Role) -> bool {
    role.parents.iter().all(|p| {
        roles
            .iter()
            .find(|r| &r.name == p)
            .map(|r| r.state == RoleState::Running)
            .unwrap_or(false)
    })
}

/// Roles that list `name` as a parent
pub fn children<'a>(roles: &'a [Role], name: &str) -> Vec<&'a Role> {
    roles
        .iter()
        .filter(|r| r.parents.iter().any(|p| p == name))
        .collect()
}

/// Whether `name` may be undeployed: no child still holds VMs
pub fn children_released(roles: &[Role], name: &str) -> bool {
    children(roles, name).iter().all(|c| c.nodes.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(defs: &[(&'static str, Vec<String>)]) -> Result<Vec<String>> {
        deploy_order(defs.iter().map(|(n, p)| (*n, p.as_slice())))
    }

    fn p(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_linear_order() {
        let defs = vec![("web", p(&["app"])), ("app", p(&["db"])), ("db", p(&[]))];
        assert_eq!(order(&defs).unwrap(), vec!["db", "app", "web"]);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let defs = vec![("b", p(&[])), ("a", p(&[])), ("c", p(&["a", "b"]))];
        assert_eq!(order(&defs).unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_detected() {
        let defs = vec![("a", p(&["c"])), ("b", p(&["a"])), ("c", p(&["b"])), ("d", p(&[]))];
        let err = order(&defs).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("cycle")));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let defs = vec![("a", p(&["a"]))];
        assert!(order(&defs).is_err());
    }

    #[test]
    fn test_unknown_parent() {
        let defs = vec![("a", p(&["ghost"]))];
        let err = order(&defs).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("ghost")));
    }

    #[test]
    fn test_duplicate_parent_entries() {
        let defs = vec![("db", p(&[])), ("web", p(&["db", "db"]))];
        assert_eq!(order(&defs).unwrap(), vec!["db", "web"]);
    }

    #[test]
    fn test_parents_ready_and_children() {
        let mut db = Role::new("db", 0, 1);
        let web = Role::new("web", 0, 1).with_parents(p(&["db"]));
        let roles = vec![db.clone(), web.clone()];
        assert!(!parents_ready(&roles, &web));
        assert!(parents_ready(&roles, &db));

        db.state = RoleState::Running;
        let roles = vec![db, web.clone()];
        assert!(parents_ready(&roles, &web));
        assert_eq!(children(&roles, "db").len(), 1);
        assert!(children_released(&roles, "db"));
    }
}
