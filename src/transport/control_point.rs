//! T2: per-URN control point. Turns raw [DiscoveryEvent](super::discovery::DiscoveryEvent)
//! observations into live [ScpdClient] service proxies, fetching each device's
//! description and SCPD exactly once per discovered `(context, UDN)` pair.

use std::{collections::HashMap, marker::PhantomData, time::Duration};

use anyhow::Context;

use super::{
    device_description::{DeviceDescription, Udn},
    discovery::DiscoveryEvent,
    service_client::{ScpdClient, ScpdService},
    service_description::Scpd,
    ssdp::Announce,
    xml::FromXml,
};

/// A service proxy becoming reachable or unreachable, keyed by the device's UDN.
#[derive(Debug)]
pub enum ControlPointEvent<T: ScpdService> {
    ServiceProxyAvailable { udn: Udn, proxy: ScpdClient<T> },
    ServiceProxyUnavailable { udn: Udn },
}

struct TrackedEndpoint {
    expires_at: tokio::time::Instant,
}

/// Browses devices for a single service URN (`T::URN`), maintaining one
/// [ScpdClient] per UDN that currently advertises it.
pub struct ControlPoint<T: ScpdService> {
    fetch_client: reqwest::Client,
    tracked: HashMap<Udn, TrackedEndpoint>,
    _p: PhantomData<T>,
}

impl<T: ScpdService> ControlPoint<T> {
    pub fn new(fetch_client: reqwest::Client) -> Self {
        Self {
            fetch_client,
            tracked: HashMap::new(),
            _p: PhantomData,
        }
    }

    /// Feeds one discovery observation in, returning an event if it caused a
    /// proxy to become available/unavailable. Announces for other URNs are
    /// silently ignored.
    pub async fn handle_event(
        &mut self,
        event: DiscoveryEvent,
    ) -> anyhow::Result<Option<ControlPointEvent<T>>> {
        match event {
            DiscoveryEvent::Announce(announce) => self.handle_announce(announce).await,
            DiscoveryEvent::ByeBye(byebye) => Ok(self.handle_byebye(byebye.usn.udn())),
        }
    }

    /// Checks every tracked endpoint's advertised cache-control lifetime and
    /// emits an unavailable event for any that have lapsed without renewal.
    pub fn sweep_expired(&mut self) -> Vec<ControlPointEvent<T>> {
        let now = tokio::time::Instant::now();
        let expired: Vec<Udn> = self
            .tracked
            .iter()
            .filter(|(_, tracked)| tracked.expires_at <= now)
            .map(|(udn, _)| udn.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|udn| {
                self.tracked.remove(&udn);
                Some(ControlPointEvent::ServiceProxyUnavailable { udn })
            })
            .collect()
    }

    fn handle_byebye(&mut self, udn: &Udn) -> Option<ControlPointEvent<T>> {
        self.tracked
            .remove(udn)
            .map(|_| ControlPointEvent::ServiceProxyUnavailable { udn: udn.clone() })
    }

    async fn handle_announce(
        &mut self,
        announce: Announce,
    ) -> anyhow::Result<Option<ControlPointEvent<T>>> {
        if !matches!(&announce.notification_type, super::ssdp::NotificationType::Urn(urn) if *urn == T::URN)
        {
            return Ok(None);
        }

        let udn = announce.usn.udn().clone();
        let expires_at =
            tokio::time::Instant::now() + Duration::from_secs(announce.cache_control as u64);

        if let Some(tracked) = self.tracked.get_mut(&udn) {
            tracked.expires_at = expires_at;
            return Ok(None);
        }

        let proxy = self.build_proxy(&announce).await?;
        self.tracked.insert(udn.clone(), TrackedEndpoint { expires_at });
        Ok(Some(ControlPointEvent::ServiceProxyAvailable { udn, proxy }))
    }

    async fn build_proxy(&self, announce: &Announce) -> anyhow::Result<ScpdClient<T>> {
        let device_description_xml = Self::fetch_xml(&self.fetch_client, &announce.location).await?;
        let device_description = DeviceDescription::read_xml(&mut quick_xml::Reader::from_str(
            &device_description_xml,
        ))?;

        let urn = T::URN.to_string();
        let service = device_description
            .device
            .all_services()
            .find(|s| s.service_type == *urn)
            .context("device does not advertise the requested service")?;

        let mut control_url = reqwest::Url::parse(&announce.location)?;
        control_url.set_path(&service.control_url);

        let mut event_sub_url = reqwest::Url::parse(&announce.location)?;
        event_sub_url.set_path(&service.event_sub_url);

        let mut scpd_url = reqwest::Url::parse(&announce.location)?;
        scpd_url.set_path(&service.scpd_url);
        let scpd_xml = Self::fetch_xml(&self.fetch_client, scpd_url).await?;
        let scpd = Scpd::read_xml(&mut quick_xml::Reader::from_str(&scpd_xml))?;

        Ok(ScpdClient::new(
            scpd,
            control_url.to_string(),
            event_sub_url.to_string(),
        ))
    }

    async fn fetch_xml(
        client: &reqwest::Client,
        url: impl reqwest::IntoUrl,
    ) -> anyhow::Result<String> {
        let request = client.request(reqwest::Method::GET, url).build()?;
        let res = client.execute(request).await?;
        Ok(res.text().await?)
    }
}
