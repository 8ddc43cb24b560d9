use std::{fmt::Display, str::FromStr};

use anyhow::Context;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceType {
    InternetGatewayDevice,
    WanDevice,
    WanConnectionDevice,
    Other(String),
}

impl From<&str> for DeviceType {
    fn from(value: &str) -> DeviceType {
        match value {
            "InternetGatewayDevice" => DeviceType::InternetGatewayDevice,
            "WANDevice" => DeviceType::WanDevice,
            "WANConnectionDevice" => DeviceType::WanConnectionDevice,
            _ => DeviceType::Other(value.to_string()),
        }
    }
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceType::InternetGatewayDevice => "InternetGatewayDevice",
            DeviceType::WanDevice => "WANDevice",
            DeviceType::WanConnectionDevice => "WANConnectionDevice",
            DeviceType::Other(other) => other,
        };
        write!(f, "{name}")
    }
}

/// The two WAN connection service types the engine targets in parallel, plus anything
/// else encountered while walking a device tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceType {
    WANIPConnection,
    WANPPPConnection,
    WANCommonInterfaceConfig,
    Other(String),
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceType::WANIPConnection => "WANIPConnection",
            ServiceType::WANPPPConnection => "WANPPPConnection",
            ServiceType::WANCommonInterfaceConfig => "WANCommonInterfaceConfig",
            ServiceType::Other(other) => other,
        };
        write!(f, "{name}")
    }
}

impl From<&str> for ServiceType {
    fn from(value: &str) -> ServiceType {
        match value {
            "WANIPConnection" => ServiceType::WANIPConnection,
            "WANPPPConnection" => ServiceType::WANPPPConnection,
            "WANCommonInterfaceConfig" => ServiceType::WANCommonInterfaceConfig,
            other => ServiceType::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UrnType {
    Device(DeviceType),
    Service(ServiceType),
}

#[derive(Debug, Clone)]
/// Uniform Resource Name. Provides a unique and persistent identifier for a resource.
pub struct URN {
    pub version: u8,
    pub urn_type: UrnType,
}

impl Serialize for URN {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl URN {
    pub const fn wan_ip_connection() -> Self {
        Self {
            version: 1,
            urn_type: UrnType::Service(ServiceType::WANIPConnection),
        }
    }

    pub const fn wan_ppp_connection() -> Self {
        Self {
            version: 1,
            urn_type: UrnType::Service(ServiceType::WANPPPConnection),
        }
    }
}

impl PartialEq for URN {
    fn eq(&self, other: &URN) -> bool {
        self.to_string() == other.to_string()
    }
}

impl PartialEq<str> for URN {
    fn eq(&self, other: &str) -> bool {
        self.to_string() == other
    }
}

impl Display for URN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (urn_type, name) = match &self.urn_type {
            UrnType::Device(device) => ("device", device.to_string()),
            UrnType::Service(service) => ("service", service.to_string()),
        };

        write!(
            f,
            "urn:schemas-upnp-org:{urn_type}:{name}:{version}",
            version = self.version
        )
    }
}

impl FromStr for URN {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(5, ':');
        let urn = parts.next().context("urn prefix")?;
        anyhow::ensure!(urn == "urn");
        let _schema = parts.next().context("schema")?;
        let schema_type = parts.next().context("schema_type")?;
        let name = parts.next().context("service/device name")?;
        let version = parts.next().context("service/device version")?.parse()?;
        let urn_type = match schema_type {
            "device" => UrnType::Device(DeviceType::from(name)),
            "service" => UrnType::Service(ServiceType::from(name)),
            rest => return Err(anyhow::anyhow!("unknown urn type: {rest}")),
        };
        Ok(URN { version, urn_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_wan_ip_connection() {
        let urn = URN::wan_ip_connection();
        let parsed: URN = urn.to_string().parse().unwrap();
        assert_eq!(urn, parsed);
        assert!(matches!(
            parsed.urn_type,
            UrnType::Service(ServiceType::WANIPConnection)
        ));
    }
}
