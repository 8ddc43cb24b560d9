//! Address tracker (C3): obtains and watches one endpoint's external IP.
//!
//! The state itself (`external_ip` / `external_ip_failed`) lives on
//! [Endpoint](super::endpoint::Endpoint) since the reconciler and installers both
//! need to read it; this module is the behavior that mutates it: the initial
//! `GetExternalIPAddress` call and the evented-change reducer.

use std::net::Ipv4Addr;

use crate::{engine::endpoint::EndpointProxy, error::MappingError};

/// Outcome of the initial `GetExternalIPAddress` call, run once per new endpoint.
#[derive(Debug)]
pub enum AddressResolution {
    Acquired(Ipv4Addr),
    Failed(MappingError),
}

/// Issues the initial address query. Cancellation (the call never completing
/// because the endpoint was torn down first) is handled by the caller simply
/// dropping the future — it must never be turned into a `Failed` outcome.
pub async fn resolve(proxy: &EndpointProxy) -> AddressResolution {
    match proxy.get_external_ip_addr().await {
        Ok(ip) => AddressResolution::Acquired(ip),
        Err(e) => AddressResolution::Failed(MappingError::external_address(e.to_string())),
    }
}

/// A raw string read off the `ExternalIPAddress` evented state variable. Parses
/// it the same way the initial query result would be interpreted.
pub fn parse_evented_value(raw: &str) -> Result<Ipv4Addr, MappingError> {
    raw.parse()
        .map_err(|_| MappingError::external_address(format!("not an IP literal: {raw:?}")))
}

/// Applies a change to the tracked external IP, per §4.3: unchanged values and
/// unparseable strings are ignored outright (already reflected by the caller
/// only calling this with a value that parsed); returns `(new_ip,
/// previous_ip)` iff the value is new.
pub fn apply_change(current: Option<Ipv4Addr>, new_ip: Ipv4Addr) -> Option<(Ipv4Addr, Option<Ipv4Addr>)> {
    if current == Some(new_ip) {
        return None;
    }
    Some((new_ip, current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_change_ignores_unchanged_ip() {
        let current = Some(Ipv4Addr::new(127, 0, 0, 2));
        assert!(apply_change(current, Ipv4Addr::new(127, 0, 0, 2)).is_none());
    }

    #[test]
    fn apply_change_reports_previous_ip() {
        let current = Some(Ipv4Addr::new(127, 0, 0, 2));
        let (new_ip, previous) = apply_change(current, Ipv4Addr::new(127, 0, 0, 3)).unwrap();
        assert_eq!(new_ip, Ipv4Addr::new(127, 0, 0, 3));
        assert_eq!(previous, current);
    }

    #[test]
    fn parse_evented_value_rejects_garbage() {
        assert!(parse_evented_value("asdas").is_err());
        assert!(parse_evented_value("").is_err());
    }

    #[test]
    fn parse_evented_value_accepts_ip_literal() {
        assert_eq!(
            parse_evented_value("203.0.113.7").unwrap(),
            Ipv4Addr::new(203, 0, 113, 7)
        );
    }
}
