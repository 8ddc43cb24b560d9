//! Concrete transport layer realizing the engine's context-manager / control-point /
//! service-proxy contract: SSDP discovery, device/service description fetching, SOAP
//! action invocation and GENA eventing against real `WANIPConnection`/`WANPPPConnection`
//! services.

pub mod action;
pub mod callback_server;
pub mod control_point;
pub mod device_description;
pub mod discovery;
pub mod eventing;
pub mod internet_gateway;
pub mod service;
pub mod service_client;
pub mod service_description;
pub mod service_variables;
pub mod ssdp;
pub mod urn;
pub mod xml;

use anyhow::Context;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

use xml::{FromXml, XmlReaderExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecVersion {
    pub major: usize,
    pub minor: usize,
}

impl SpecVersion {
    pub const fn upnp_v2() -> Self {
        Self { major: 2, minor: 0 }
    }
    pub const fn upnp_v1_1() -> Self {
        Self { major: 1, minor: 1 }
    }
    pub const fn upnp_v1() -> Self {
        Self { major: 1, minor: 0 }
    }
}

impl<'a> FromXml<'a> for SpecVersion {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let start = r.read_to_start()?.into_owned();
        anyhow::ensure!(start.local_name().as_ref() == b"specVersion");
        let spec_end = start.to_end().into_owned();

        let major_tag = r.read_to_start()?;
        let major: usize = r
            .read_text(major_tag.name())?
            .parse()
            .context("parse major spec version")?;
        r.read_end()?;

        let minor_tag = r.read_to_start()?;
        let minor: usize = r
            .read_text(minor_tag.name())?
            .parse()
            .context("parse minor spec version")?;
        r.read_end()?;

        match r.read_event()? {
            Event::End(end) if end == spec_end => {}
            other => anyhow::bail!("expected specVersion end, got {:?}", other),
        }

        Ok(Self { major, minor })
    }
}
