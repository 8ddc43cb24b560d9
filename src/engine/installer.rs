//! Installer (C4): installs, renews and deletes one logical mapping on one
//! endpoint. The state itself lives on [Installer]; the actual RPC calls are
//! free functions the home task spawns as tasks so a slow router never blocks
//! any other installer (§5: intra-installer RPCs are serialized, cross-installer
//! ordering is not guaranteed).

use std::net::Ipv4Addr;

use rand::Rng;

use crate::{
    engine::{
        endpoint::EndpointId,
        registry::{Mapping, MappingId, Protocol},
    },
    error::MappingError,
    transport::service_client::ActionCallError,
};

use super::endpoint::EndpointProxy;

/// Random high port range the conflict-retry policy picks from (§4.4).
const RANDOM_PORT_RANGE: std::ops::RangeInclusive<u16> = 1025..=65535;

fn pick_random_port() -> u16 {
    rand::rng().random_range(RANDOM_PORT_RANGE)
}

fn initial_actual_port(requested_external_port: u16, local_port: u16) -> u16 {
    if requested_external_port != 0 {
        requested_external_port
    } else {
        local_port
    }
}

/// Identifies one `(Endpoint, Mapping)` pair. Per invariant 2 there is exactly
/// one [Installer] per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstallerKey {
    pub endpoint_id: EndpointId,
    pub mapping_id: MappingId,
}

/// The runtime state of one logical [Mapping] on one endpoint.
#[derive(Debug)]
pub struct Installer {
    pub key: InstallerKey,
    pub protocol: Protocol,
    pub requested_external_port: u16,
    /// May differ from `requested_external_port` after a conflict fallback.
    pub actual_external_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub lease_duration: u32,
    pub description: String,
    pub mapped: bool,
    /// Bumped whenever an in-flight RPC is superseded (teardown or a fresh
    /// attempt); a completion carrying a stale generation is discarded,
    /// matching §9's weak-back-reference treatment of late completions.
    pub generation: u64,
}

impl Installer {
    pub fn new(endpoint_id: EndpointId, mapping: &Mapping) -> Self {
        Self {
            key: InstallerKey {
                endpoint_id,
                mapping_id: mapping.id,
            },
            protocol: mapping.protocol,
            requested_external_port: mapping.requested_external_port,
            actual_external_port: initial_actual_port(
                mapping.requested_external_port,
                mapping.local_port,
            ),
            local_ip: mapping.local_ip,
            local_port: mapping.local_port,
            lease_duration: mapping.lease_duration,
            description: mapping.description.clone(),
            mapped: false,
            generation: 0,
        }
    }
}

/// Outcome of [run_install].
#[derive(Debug)]
pub enum InstallOutcome {
    Installed { actual_external_port: u16 },
    Failed(MappingError),
}

/// Drives the install state machine's conflict-retry loop to completion: picks
/// a fresh random port and retries only while `requested_external_port == 0`
/// and the router reports 718 (ConflictInMappingEntry); any other error
/// surfaces immediately without retrying, per §4.4.
pub async fn run_install(
    proxy: &EndpointProxy,
    protocol: Protocol,
    requested_external_port: u16,
    local_ip: Ipv4Addr,
    local_port: u16,
    description: &str,
    lease_duration: u32,
) -> InstallOutcome {
    let mut actual_port = initial_actual_port(requested_external_port, local_port);
    loop {
        let result = proxy
            .add_port_mapping(
                actual_port,
                protocol.into(),
                local_port,
                local_ip,
                description.to_owned(),
                lease_duration,
            )
            .await;
        match result {
            Ok(()) => {
                return InstallOutcome::Installed {
                    actual_external_port: actual_port,
                }
            }
            Err(ActionCallError::Action(ref action_err))
                if action_err.code.is_conflict_in_mapping_entry()
                    && requested_external_port == 0 =>
            {
                actual_port = pick_random_port();
                tracing::debug!(
                    new_port = actual_port,
                    "718 conflict on requested-any port, retrying"
                );
            }
            Err(e) => return InstallOutcome::Failed(e.into()),
        }
    }
}

/// Re-issues `AddPortMapping` with identical parameters for an already-mapped
/// installer. A single attempt: renewal errors are reported but never retried
/// or demote `mapped` (§4.4).
pub async fn run_renew(
    proxy: &EndpointProxy,
    protocol: Protocol,
    actual_external_port: u16,
    local_ip: Ipv4Addr,
    local_port: u16,
    description: &str,
    lease_duration: u32,
) -> Result<(), MappingError> {
    proxy
        .add_port_mapping(
            actual_external_port,
            protocol.into(),
            local_port,
            local_ip,
            description.to_owned(),
            lease_duration,
        )
        .await
        .map_err(Into::into)
}

/// Best-effort `DeletePortMapping`. Errors are logged by the caller, never
/// surfaced as an event (§4.4, §4.7).
pub async fn run_delete(
    proxy: &EndpointProxy,
    protocol: Protocol,
    actual_external_port: u16,
) -> Result<(), MappingError> {
    proxy
        .delete_port_mapping(protocol.into(), actual_external_port)
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_actual_port_prefers_requested() {
        assert_eq!(initial_actual_port(6543, 1234), 6543);
        assert_eq!(initial_actual_port(0, 1234), 1234);
    }

    #[test]
    fn pick_random_port_stays_in_range() {
        for _ in 0..100 {
            let port = pick_random_port();
            assert!(RANDOM_PORT_RANGE.contains(&port));
        }
    }
}
