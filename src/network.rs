//! Virtual network layer
//!
//! Services that ask for a reservation get their own address range carved
//! out of an existing virtual network while in DEPLOYING_NETS, and give it
//! back in UNDEPLOYING_NETS.

use crate::models::{NetworkSelection, Service};
use crate::Result;

/// Address range reservation (`VirtualNetwork.reserve` / `release`)
#[cfg_attr(test, mockall::automock)]
pub trait VnetPool: Send + Sync {
    /// Reserve `size` addresses from network `from`, returning the new network id
    fn reserve(&self, from: u64, size: u32, name: &str) -> Result<u64>;

    fn release(&self, id: u64) -> Result<()>;
}

/// Reserve every network of the service that is still unresolved.
/// Stops at the first failure; resolved ids are kept so a retry only
/// reserves what is missing.
pub fn reserve_all(service: &mut Service, pool: &dyn VnetPool) -> Result<()> {
    let pending: Vec<(String, u64, u32)> = service
        .reserved_networks()
        .filter(|(name, _)| !service.networks_values.contains_key(*name))
        .filter_map(|(name, sel)| match sel {
            NetworkSelection::Reserve { from, size } => Some((name.clone(), *from, *size)),
            NetworkSelection::Existing { .. } => None,
        })
        .collect();

    for (name, from, size) in pending {
        let label = format!("{}_{}", name, service.id);
        let id = pool.reserve(from, size, &label)?;
        tracing::info!(service = service.id, network = %name, vnet = id, "Reserved network");
        service.networks_values.insert(name, id);
    }
    Ok(())
}

/// Release every reservation the service still holds
pub fn release_all(service: &mut Service, pool: &dyn VnetPool) -> Result<()> {
    let held: Vec<(String, u64)> = service
        .reserved_networks()
        .filter_map(|(name, _)| service.networks_values.get(name).map(|id| (name.clone(), *id)))
        .collect();

    for (name, id) in held {
        pool.release(id)?;
        tracing::info!(service = service.id, network = %name, vnet = id, "Released network");
        service.networks_values.remove(&name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn service() -> Service {
        let mut s = Service::new(4, "app", "oneadmin", 0);
        s.networks_selections
            .insert("private".into(), NetworkSelection::Reserve { from: 0, size: 8 });
        s.networks_selections
            .insert("public".into(), NetworkSelection::Existing { id: 3 });
        s.networks_values.insert("public".into(), 3);
        s
    }

    #[test]
    fn test_reserve_and_release() {
        let mut pool = MockVnetPool::new();
        pool.expect_reserve()
            .withf(|from, size, name| *from == 0 && *size == 8 && name == "private_4")
            .times(1)
            .returning(|_, _, _| Ok(101));
        pool.expect_release().withf(|id| *id == 101).times(1).returning(|_| Ok(()));

        let mut s = service();
        reserve_all(&mut s, &pool).unwrap();
        assert_eq!(s.networks_values.get("private"), Some(&101));

        // already resolved, no second reservation
        reserve_all(&mut s, &pool).unwrap();

        release_all(&mut s, &pool).unwrap();
        assert!(!s.networks_values.contains_key("private"));
        assert_eq!(s.networks_values.get("public"), Some(&3));
    }

    #[test]
    fn test_reserve_failure_leaves_network_unresolved() {
        let mut pool = MockVnetPool::new();
        pool.expect_reserve()
            .returning(|_, _, _| Err(Error::TransientInfra("no leases".into())));

        let mut s = service();
        assert!(reserve_all(&mut s, &pool).unwrap_err().is_transient());
        assert!(!s.networks_values.contains_key("private"));
    }
}
