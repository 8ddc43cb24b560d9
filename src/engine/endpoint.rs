//! Endpoint set (C2): the live set of discovered IGD service endpoints, one per
//! `(control point, UDN)` pair, fed by the transport's discovery loop and the two
//! control points (`WANIPConnection`, `WANPPPConnection`) the engine always runs
//! in parallel.

use std::{collections::HashMap, collections::VecDeque, net::Ipv4Addr};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transport::{
    control_point::{ControlPoint, ControlPointEvent},
    device_description::Udn,
    discovery::{DiscoveryEvent, DiscoveryLoop},
    internet_gateway::{InternetGatewayClient, PortMappingProtocol, WanPppConnectionClient},
    service_client::{ActionCallError, ScpdClient},
};

/// Which of the two WAN connection service types an endpoint's proxy speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    WanIp,
    WanPpp,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::WanIp => write!(f, "WANIPConnection"),
            EndpointKind::WanPpp => write!(f, "WANPPPConnection"),
        }
    }
}

/// Identifies one endpoint for the purpose of deduplication on removal, per
/// the data model's `(control_point, UDN)` identity rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub kind: EndpointKind,
    pub udn: Udn,
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:?}", self.kind, self.udn)
    }
}

/// A service proxy for one of the two WAN connection service types, hiding the
/// generic `ScpdClient<T>` split behind a single concrete type the rest of the
/// engine can hold without becoming generic itself.
#[derive(Debug, Clone)]
pub enum EndpointProxy {
    WanIp(ScpdClient<InternetGatewayClient>),
    WanPpp(ScpdClient<WanPppConnectionClient>),
}

impl EndpointProxy {
    pub fn event_sub_url(&self) -> &str {
        match self {
            EndpointProxy::WanIp(proxy) => &proxy.event_sub_url,
            EndpointProxy::WanPpp(proxy) => &proxy.event_sub_url,
        }
    }

    pub async fn get_external_ip_addr(&self) -> Result<Ipv4Addr, ActionCallError> {
        match self {
            EndpointProxy::WanIp(proxy) => proxy.get_external_ip_addr().await,
            EndpointProxy::WanPpp(proxy) => proxy.get_external_ip_addr().await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_port_mapping(
        &self,
        external_port: u16,
        proto: PortMappingProtocol,
        internal_port: u16,
        local_addr: Ipv4Addr,
        description: String,
        lease: u32,
    ) -> Result<(), ActionCallError> {
        match self {
            EndpointProxy::WanIp(proxy) => {
                proxy
                    .add_port_mapping(
                        None,
                        external_port,
                        proto,
                        internal_port,
                        local_addr,
                        description,
                        lease,
                    )
                    .await
            }
            EndpointProxy::WanPpp(proxy) => {
                proxy
                    .add_port_mapping(
                        None,
                        external_port,
                        proto,
                        internal_port,
                        local_addr,
                        description,
                        lease,
                    )
                    .await
            }
        }
    }

    pub async fn delete_port_mapping(
        &self,
        proto: PortMappingProtocol,
        external_port: u16,
    ) -> Result<(), ActionCallError> {
        match self {
            EndpointProxy::WanIp(proxy) => proxy.delete_port_mapping(proto, external_port).await,
            EndpointProxy::WanPpp(proxy) => proxy.delete_port_mapping(proto, external_port).await,
        }
    }
}

/// One live IGD service proxy. `external_ip`/`external_ip_failed` are C3's
/// state, kept here because they are per-endpoint data the reconciler and
/// installers both need to read.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub proxy: EndpointProxy,
    pub external_ip: Option<Ipv4Addr>,
    pub external_ip_failed: bool,
}

impl Endpoint {
    fn new(id: EndpointId, proxy: EndpointProxy) -> Self {
        Self {
            id,
            proxy,
            external_ip: None,
            external_ip_failed: false,
        }
    }
}

/// A service proxy becoming available or unavailable, surfaced by [EndpointSet::poll].
#[derive(Debug, Clone)]
pub enum EndpointSetEvent {
    Available(EndpointId),
    Unavailable(EndpointId),
}

/// Drives the transport's discovery loop and the two control points, and owns
/// the resulting endpoints. The engine's home task polls this once per
/// iteration of its `tokio::select!` loop.
pub struct EndpointSet {
    endpoints: HashMap<EndpointId, Endpoint>,
    discovery_events: mpsc::Receiver<DiscoveryEvent>,
    wan_ip_cp: ControlPoint<InternetGatewayClient>,
    wan_ppp_cp: ControlPoint<WanPppConnectionClient>,
    sweep_interval: tokio::time::Interval,
    /// A single discovery observation or sweep pass can surface events for both
    /// control points at once (e.g. a `ssdp:byebye` tearing down both the
    /// `WANIPConnection` and `WANPPPConnection` endpoints of one device); these
    /// queue up here and drain before the next `recv`.
    pending: VecDeque<EndpointSetEvent>,
}

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

impl EndpointSet {
    /// Binds the discovery socket, spawns the discovery loop on its own task
    /// (cancelled via `cancellation_token`), and returns the endpoint set ready
    /// to be polled.
    pub async fn spawn(cancellation_token: CancellationToken) -> anyhow::Result<Self> {
        let discovery = DiscoveryLoop::bind().await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if let Err(e) = discovery.run(cancellation_token, tx).await {
                tracing::warn!("discovery loop exited: {e}");
            }
        });

        let fetch_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;

        Ok(Self {
            endpoints: HashMap::new(),
            discovery_events: rx,
            wan_ip_cp: ControlPoint::new(fetch_client.clone()),
            wan_ppp_cp: ControlPoint::new(fetch_client),
            sweep_interval: tokio::time::interval(SWEEP_INTERVAL),
            pending: VecDeque::new(),
        })
    }

    pub fn get(&self, id: &EndpointId) -> Option<&Endpoint> {
        self.endpoints.get(id)
    }

    pub fn get_mut(&mut self, id: &EndpointId) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// Waits for the next raw transport observation to resolve into an
    /// endpoint-set change. Returns `None` only if the discovery channel has
    /// closed (the discovery loop has exited for good).
    pub async fn poll(&mut self) -> Option<EndpointSetEvent> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Some(ev);
            }
            tokio::select! {
                event = self.discovery_events.recv() => {
                    self.handle_discovery_event(event?).await;
                }
                _ = self.sweep_interval.tick() => {
                    self.sweep_expired();
                }
            }
        }
    }

    async fn handle_discovery_event(&mut self, event: DiscoveryEvent) {
        match self.wan_ip_cp.handle_event(event.clone()).await {
            Ok(Some(ControlPointEvent::ServiceProxyAvailable { udn, proxy })) => {
                let id = EndpointId {
                    kind: EndpointKind::WanIp,
                    udn,
                };
                self.endpoints
                    .insert(id.clone(), Endpoint::new(id.clone(), EndpointProxy::WanIp(proxy)));
                self.pending.push_back(EndpointSetEvent::Available(id));
            }
            Ok(Some(ControlPointEvent::ServiceProxyUnavailable { udn })) => {
                let id = EndpointId {
                    kind: EndpointKind::WanIp,
                    udn,
                };
                if self.endpoints.remove(&id).is_some() {
                    self.pending.push_back(EndpointSetEvent::Unavailable(id));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("WANIPConnection control point error: {e}"),
        }

        match self.wan_ppp_cp.handle_event(event).await {
            Ok(Some(ControlPointEvent::ServiceProxyAvailable { udn, proxy })) => {
                let id = EndpointId {
                    kind: EndpointKind::WanPpp,
                    udn,
                };
                self.endpoints.insert(
                    id.clone(),
                    Endpoint::new(id.clone(), EndpointProxy::WanPpp(proxy)),
                );
                self.pending.push_back(EndpointSetEvent::Available(id));
            }
            Ok(Some(ControlPointEvent::ServiceProxyUnavailable { udn })) => {
                let id = EndpointId {
                    kind: EndpointKind::WanPpp,
                    udn,
                };
                if self.endpoints.remove(&id).is_some() {
                    self.pending.push_back(EndpointSetEvent::Unavailable(id));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("WANPPPConnection control point error: {e}"),
        }
    }

    fn sweep_expired(&mut self) {
        for event in self.wan_ip_cp.sweep_expired() {
            if let ControlPointEvent::ServiceProxyUnavailable { udn } = event {
                let id = EndpointId {
                    kind: EndpointKind::WanIp,
                    udn,
                };
                if self.endpoints.remove(&id).is_some() {
                    self.pending.push_back(EndpointSetEvent::Unavailable(id));
                }
            }
        }
        for event in self.wan_ppp_cp.sweep_expired() {
            if let ControlPointEvent::ServiceProxyUnavailable { udn } = event {
                let id = EndpointId {
                    kind: EndpointKind::WanPpp,
                    udn,
                };
                if self.endpoints.remove(&id).is_some() {
                    self.pending.push_back(EndpointSetEvent::Unavailable(id));
                }
            }
        }
    }
}
