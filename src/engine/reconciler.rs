//! Reconciler (C5): fans the mapping registry out over the endpoint set
//! whenever either changes. Pure decision logic — it only decides which
//! installers should come into or go out of existence; the home task (mod.rs)
//! carries the decisions out (spawning RPC tasks, updating the installer map).

use std::collections::HashMap;

use super::{
    endpoint::{Endpoint, EndpointId},
    installer::{Installer, InstallerKey},
    registry::{MappingId, MappingRegistry},
};

/// One reconciliation decision.
#[derive(Debug, Clone)]
pub enum ReconcileAction {
    /// Create an installer for this key and start installing it.
    Install(InstallerKey),
    /// Emit a synthetic `error-mapping-port` (kind External-Address) without
    /// ever creating an installer — the endpoint's address tracker already
    /// failed sticky, per §4.5.
    SyntheticAddressError(InstallerKey),
}

/// A new endpoint appeared: create an installer for every mapping currently in
/// the registry, unless teardown has begun.
pub fn on_endpoint_added(registry: &MappingRegistry, endpoint_id: &EndpointId) -> Vec<ReconcileAction> {
    if registry.no_new_mappings() {
        return Vec::new();
    }
    registry
        .iter()
        .map(|mapping| {
            ReconcileAction::Install(InstallerKey {
                endpoint_id: endpoint_id.clone(),
                mapping_id: mapping.id,
            })
        })
        .collect()
}

/// An endpoint disappeared: every installer referencing it must be torn down.
pub fn on_endpoint_removed(
    installers: &HashMap<InstallerKey, Installer>,
    endpoint_id: &EndpointId,
) -> Vec<InstallerKey> {
    installers
        .keys()
        .filter(|key| &key.endpoint_id == endpoint_id)
        .cloned()
        .collect()
}

/// A mapping was just added to the registry: fan it out over every live
/// endpoint, short-circuiting to a synthetic error for endpoints whose address
/// tracker already failed.
pub fn on_mapping_added<'a>(
    endpoints: impl Iterator<Item = &'a Endpoint>,
    mapping_id: MappingId,
) -> Vec<ReconcileAction> {
    endpoints
        .map(|endpoint: &Endpoint| {
            let key = InstallerKey {
                endpoint_id: endpoint.id.clone(),
                mapping_id,
            };
            if endpoint.external_ip_failed {
                ReconcileAction::SyntheticAddressError(key)
            } else {
                ReconcileAction::Install(key)
            }
        })
        .collect()
}

/// A mapping was removed: every installer referencing it must be torn down.
pub fn on_mapping_removed(
    installers: &HashMap<InstallerKey, Installer>,
    mapping_id: MappingId,
) -> Vec<InstallerKey> {
    installers
        .keys()
        .filter(|key| key.mapping_id == mapping_id)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::engine::registry::Protocol;

    #[test]
    fn endpoint_added_creates_one_installer_per_mapping() {
        let mut registry = MappingRegistry::new();
        registry
            .add_port(Protocol::Udp, 6543, Ipv4Addr::new(192, 168, 4, 22), 6543, 10, None)
            .unwrap();
        registry
            .add_port(Protocol::Tcp, 80, Ipv4Addr::new(192, 168, 4, 22), 80, 0, None)
            .unwrap();

        let endpoint_id = EndpointId {
            kind: super::super::endpoint::EndpointKind::WanIp,
            udn: "uuid:test".parse().unwrap(),
        };
        let actions = on_endpoint_added(&registry, &endpoint_id);
        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .all(|a| matches!(a, ReconcileAction::Install(_))));
    }

    #[test]
    fn endpoint_added_after_teardown_creates_nothing() {
        let mut registry = MappingRegistry::new();
        registry
            .add_port(Protocol::Udp, 6543, Ipv4Addr::new(192, 168, 4, 22), 6543, 10, None)
            .unwrap();
        registry.delete_all();

        let endpoint_id = EndpointId {
            kind: super::super::endpoint::EndpointKind::WanIp,
            udn: "uuid:test".parse().unwrap(),
        };
        assert!(on_endpoint_added(&registry, &endpoint_id).is_empty());
    }
}
