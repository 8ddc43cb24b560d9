//! T1: continuous SSDP discovery. Periodically searches for both WAN connection
//! service types and listens for unsolicited advertisements, surfacing raw
//! [DiscoveryEvent]s for [control_point](super::control_point) to turn into
//! service proxies.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use anyhow::Context;
use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{
    ssdp::{
        parse_search_response, Announce, BroadcastMessage, NotificationType, SearchMessage,
        NotifyByeByeMessage, SSDP_ADDR, SSDP_IP_ADDR,
    },
    urn::{ServiceType, UrnType, URN},
};

/// How often the discovery loop re-sends M-SEARCH for both WAN connection URNs.
const SEARCH_INTERVAL: Duration = Duration::from_secs(120);
/// MX used on every M-SEARCH: how long routers are asked to randomize their reply delay over.
const SEARCH_MX: usize = 3;

const WAN_IP_CONNECTION_URN: URN = URN {
    version: 1,
    urn_type: UrnType::Service(ServiceType::WANIPConnection),
};
const WAN_PPP_CONNECTION_URN: URN = URN {
    version: 1,
    urn_type: UrnType::Service(ServiceType::WANPPPConnection),
};

/// A raw SSDP observation, not yet resolved into a service proxy.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A device answered an M-SEARCH or sent an unsolicited `ssdp:alive`.
    Announce(Announce),
    /// A device announced its departure via `ssdp:byebye`.
    ByeBye(NotifyByeByeMessage),
}

/// Periodically searches for `WANIPConnection`/`WANPPPConnection` services and
/// listens for unsolicited advertisements on the SSDP multicast group.
#[derive(Debug)]
pub struct DiscoveryLoop {
    socket: UdpSocket,
}

/// Binds port 1900 and joins the SSDP multicast group so unsolicited
/// `ssdp:alive`/`ssdp:byebye` NOTIFY traffic is delivered here, not just
/// unicast M-SEARCH replies.
fn bind_ssdp_socket() -> anyhow::Result<UdpSocket> {
    let local_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 1900);
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    socket.set_reuse_port(false)?;
    socket.set_nonblocking(true)?;
    socket.join_multicast_v4(&SSDP_IP_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    socket.bind(&SocketAddr::V4(local_addr).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

impl DiscoveryLoop {
    pub async fn bind() -> anyhow::Result<Self> {
        let socket = bind_ssdp_socket().context("bind discovery socket")?;
        Ok(Self { socket })
    }

    async fn send_searches(&self) -> anyhow::Result<()> {
        for urn in [WAN_IP_CONNECTION_URN, WAN_PPP_CONNECTION_URN] {
            let msg = SearchMessage {
                host: SSDP_ADDR,
                st: NotificationType::Urn(urn),
                mx: SEARCH_MX,
                user_agent: None,
            };
            self.socket
                .send_to(msg.to_string().as_bytes(), SSDP_ADDR)
                .await?;
        }
        Ok(())
    }

    /// Runs the discovery loop until cancelled, forwarding every observation to `on_event`.
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
        on_event: tokio::sync::mpsc::Sender<DiscoveryEvent>,
    ) -> anyhow::Result<()> {
        self.send_searches().await?;
        let mut search_interval = tokio::time::interval(SEARCH_INTERVAL);
        search_interval.tick().await;

        let mut buf = [0; 2048];
        loop {
            tokio::select! {
                Ok((read, _sender)) = self.socket.recv_from(&mut buf) => {
                    if let Err(e) = self.handle_datagram(&buf[..read], &on_event).await {
                        tracing::debug!("discarding unparseable ssdp datagram: {e}");
                    }
                }
                _ = search_interval.tick() => {
                    if let Err(e) = self.send_searches().await {
                        tracing::warn!("failed to resend ssdp search: {e}");
                    }
                }
                _ = cancellation_token.cancelled() => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        on_event: &tokio::sync::mpsc::Sender<DiscoveryEvent>,
    ) -> anyhow::Result<()> {
        let payload = std::str::from_utf8(data).context("ssdp datagram is not utf8")?;
        if let Ok(announce) = parse_search_response(payload) {
            let _ = on_event.send(DiscoveryEvent::Announce(announce)).await;
            return Ok(());
        }
        match BroadcastMessage::parse_ssdp_payload(payload)? {
            BroadcastMessage::NotifyAlive(alive) => {
                let announce = Announce {
                    cache_control: alive.cache_control,
                    location: alive.location.into_owned(),
                    server: alive.server.to_owned(),
                    notification_type: alive.nt,
                    usn: alive.usn,
                    boot_id: alive.boot_id,
                    config_id: alive.config_id,
                };
                let _ = on_event.send(DiscoveryEvent::Announce(announce)).await;
            }
            BroadcastMessage::NotifyByeBye(byebye) => {
                let _ = on_event.send(DiscoveryEvent::ByeBye(byebye)).await;
            }
            BroadcastMessage::NotifyUpdate(_) => {
                tracing::trace!("ignoring ssdp:update notification");
            }
        }
        Ok(())
    }
}
