//! Mapping registry (C1): the canonical set of user-requested logical mappings.
//! Owned exclusively by the engine's home task; installers never mutate it.

use std::net::Ipv4Addr;

use crate::transport::internet_gateway::PortMappingProtocol;

/// Transport-independent protocol a mapping is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl From<Protocol> for PortMappingProtocol {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::Udp => PortMappingProtocol::UDP,
            Protocol::Tcp => PortMappingProtocol::TCP,
        }
    }
}

/// Identifies one logical mapping for the lifetime of the registry. Never reused
/// after a mapping is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(u64);

/// A user-requested logical port mapping. Immutable after creation; installers
/// hold a copy of the fields they need rather than a mutable reference.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub id: MappingId,
    pub protocol: Protocol,
    /// 0 means "pick one".
    pub requested_external_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    /// 0 means infinite, no renewal.
    pub lease_duration: u32,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("local_port must be non-zero")]
    ZeroLocalPort,
    #[error("engine is shutting down, no new mappings accepted")]
    ShuttingDown,
}

/// Canonical set of logical mappings. `add_port`/`remove_port`/`remove_port_local`
/// are validated and applied synchronously; the reconciler is responsible for
/// fanning changes out to installers.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    next_id: u64,
    mappings: Vec<Mapping>,
    no_new_mappings: bool,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_port(
        &mut self,
        protocol: Protocol,
        external_port: u16,
        local_ip: Ipv4Addr,
        local_port: u16,
        lease_duration: u32,
        description: Option<String>,
    ) -> Result<MappingId, RegistryError> {
        if self.no_new_mappings {
            return Err(RegistryError::ShuttingDown);
        }
        if local_port == 0 {
            return Err(RegistryError::ZeroLocalPort);
        }
        let id = MappingId(self.next_id);
        self.next_id += 1;
        self.mappings.push(Mapping {
            id,
            protocol,
            requested_external_port: external_port,
            local_ip,
            local_port,
            lease_duration,
            description: description.unwrap_or_default(),
        });
        Ok(id)
    }

    /// Removes the first mapping with matching `protocol` and
    /// `requested_external_port`. No-op if none match.
    pub fn remove_port(&mut self, protocol: Protocol, external_port: u16) -> Option<Mapping> {
        let idx = self.mappings.iter().position(|m| {
            m.protocol == protocol && m.requested_external_port == external_port
        })?;
        Some(self.mappings.remove(idx))
    }

    /// Removes the first mapping matching `protocol`, `local_ip` and `local_port`.
    pub fn remove_port_local(
        &mut self,
        protocol: Protocol,
        local_ip: Ipv4Addr,
        local_port: u16,
    ) -> Option<Mapping> {
        let idx = self.mappings.iter().position(|m| {
            m.protocol == protocol && m.local_ip == local_ip && m.local_port == local_port
        })?;
        Some(self.mappings.remove(idx))
    }

    /// Sets the sticky no-new-mappings flag and removes every mapping, returning
    /// them so the caller can tear down their installers.
    pub fn delete_all(&mut self) -> Vec<Mapping> {
        self.no_new_mappings = true;
        std::mem::take(&mut self.mappings)
    }

    pub fn no_new_mappings(&self) -> bool {
        self.no_new_mappings
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter()
    }

    pub fn get(&self, id: MappingId) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_ip() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 4, 22)
    }

    #[test]
    fn add_port_rejects_zero_local_port() {
        let mut registry = MappingRegistry::new();
        let err = registry
            .add_port(Protocol::Udp, 6543, local_ip(), 0, 10, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::ZeroLocalPort));
    }

    #[test]
    fn add_port_defaults_empty_description() {
        let mut registry = MappingRegistry::new();
        let id = registry
            .add_port(Protocol::Udp, 6543, local_ip(), 6543, 10, None)
            .unwrap();
        assert_eq!(registry.get(id).unwrap().description, "");
    }

    #[test]
    fn remove_port_is_noop_when_absent() {
        let mut registry = MappingRegistry::new();
        assert!(registry.remove_port(Protocol::Udp, 1).is_none());
    }

    #[test]
    fn remove_port_local_matches_all_three_fields() {
        let mut registry = MappingRegistry::new();
        registry
            .add_port(Protocol::Udp, 0, local_ip(), 6543, 10, None)
            .unwrap();
        assert!(registry
            .remove_port_local(Protocol::Udp, Ipv4Addr::new(10, 0, 0, 1), 6543)
            .is_none());
        let removed = registry
            .remove_port_local(Protocol::Udp, local_ip(), 6543)
            .unwrap();
        assert_eq!(removed.local_port, 6543);
        assert!(registry.iter().next().is_none());
    }

    #[test]
    fn delete_all_blocks_further_adds() {
        let mut registry = MappingRegistry::new();
        registry
            .add_port(Protocol::Udp, 6543, local_ip(), 6543, 10, None)
            .unwrap();
        let removed = registry.delete_all();
        assert_eq!(removed.len(), 1);
        assert!(registry.iter().next().is_none());
        let err = registry
            .add_port(Protocol::Tcp, 1, local_ip(), 1, 0, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::ShuttingDown));
    }
}
