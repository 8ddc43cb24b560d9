use std::{
    borrow::Cow,
    fmt::Display,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
};

use anyhow::Context;

use super::{device_description::Udn, urn};

pub(crate) const SSDP_IP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub(crate) const SSDP_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(SSDP_IP_ADDR, 1900));

///  Unique Service Name. Identifies a unique instance of a device or service.
#[derive(Debug, Clone)]
pub struct USN {
    udn: Udn,
    kind: USNkind,
}

#[derive(Debug, Clone)]
pub enum USNkind {
    RootDevice,
    DeviceUuid,
    URN(urn::URN),
}

impl USN {
    pub const fn root_device(udn: Udn) -> Self {
        Self {
            udn,
            kind: USNkind::RootDevice,
        }
    }
    pub const fn device_uuid(udn: Udn) -> Self {
        Self {
            udn,
            kind: USNkind::DeviceUuid,
        }
    }
    pub const fn urn(udn: Udn, urn: urn::URN) -> Self {
        Self {
            udn,
            kind: USNkind::URN(urn),
        }
    }

    pub fn udn(&self) -> &Udn {
        &self.udn
    }
}

impl Display for USN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.udn)?;
        match &self.kind {
            USNkind::RootDevice => write!(f, "::upnp:rootdevice"),
            USNkind::DeviceUuid => Ok(()),
            USNkind::URN(urn) => write!(f, "::{urn}"),
        }
    }
}

impl FromStr for USN {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((start, rest)) = s.split_once("::") else {
            let udn = Udn::from_str(s)?;
            return Ok(Self::device_uuid(udn));
        };
        let udn = Udn::from_str(start)?;

        if rest == "upnp:rootdevice" {
            return Ok(Self::root_device(udn));
        }

        let urn = urn::URN::from_str(rest)?;
        Ok(Self {
            udn,
            kind: USNkind::URN(urn),
        })
    }
}

/// A message exchanged over the SSDP multicast/unicast channel, as seen from a
/// control point listening for device advertisements.
#[derive(Debug)]
pub enum BroadcastMessage<'a> {
    NotifyAlive(NotifyAliveMessage<'a>),
    NotifyByeBye(NotifyByeByeMessage),
    NotifyUpdate(NotifyUpdateMessage<'a>),
}

#[derive(Debug, Clone)]
pub struct SearchMessage<'a> {
    /// For unicast requests, the field value shall be the domain name or IP address of the target device
    /// and either port 1900 or the SEARCHPORT provided by the target device.
    pub host: SocketAddr,
    pub st: NotificationType,
    /// Field value contains maximum wait time in seconds. shall be greater than or equal to 1 and should
    /// be less than 5 inclusive. Device responses should be delayed a random duration between 0 and this many
    /// seconds to balance load for the control point when it processes responses. This value is allowed to be
    /// increased if a large number of devices are expected to respond
    pub mx: usize,
    /// Same as server in search messages
    pub user_agent: Option<&'a str>,
}

impl Display for SearchMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "M-SEARCH * HTTP/1.1\r\n\
HOST: {host}\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: {search_target}\r\n\
MX: {mx}\r\n",
            host = self.host,
            search_target = self.st,
            mx = self.mx,
        )?;
        if let Some(user_agent) = self.user_agent {
            write!(f, "USER-AGENT: {user_agent}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

/// Parses a unicast search response (an `M-SEARCH` reply, `HTTP/1.1 200 OK`) into an
/// [Announce]. Devices answer this way rather than over the NOTIFY channel, so it is
/// kept as a distinct entry point from [BroadcastMessage::parse_ssdp_payload].
pub fn parse_search_response(payload: &str) -> anyhow::Result<Announce> {
    let mut cache_control = None;
    let mut location = None;
    let mut server = None;
    let mut notification_type = None;
    let mut usn = None;
    let mut boot_id = None;
    let mut config_id = None;
    let mut lines = payload.lines();
    anyhow::ensure!(lines.next() == Some("HTTP/1.1 200 OK"));
    let headers = lines.filter_map(|l| l.split_once(':'));

    for (name, value) in headers {
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "cache-control" => {
                let (prefix, cache_duration) =
                    value.split_once('=').context("split cache control")?;
                anyhow::ensure!(prefix.trim() == "max-age");
                cache_control = Some(cache_duration.parse().context("parse duration seconds")?)
            }
            "location" => location = Some(value.to_owned()),
            "server" => server = Some(value.to_owned()),
            "st" => notification_type = NotificationType::from_str(value).map(Some)?,
            "usn" => usn = USN::from_str(value).map(Some)?,
            "configid.upnp.org" => config_id = Some(value.parse().context("parse configid")?),
            "bootid.upnp.org" => boot_id = Some(value.parse().context("parse boot_id")?),
            _ => (),
        }
    }

    let cache_control = cache_control.context("parse cache_control")?;
    let location = location.context("parse location")?;
    let server = server.context("parse server")?;
    let notification_type = notification_type.context("parse notification_type")?;
    let usn = usn.context("parse usn")?;
    let boot_id = boot_id.unwrap_or_default();
    let config_id = config_id.unwrap_or_default();

    Ok(Announce {
        cache_control,
        location,
        server,
        notification_type,
        usn,
        boot_id,
        config_id,
    })
}

/// A device advertisement, whether received as an `M-SEARCH` reply or an
/// unsolicited multicast `NOTIFY`.
#[derive(Debug, Clone)]
pub struct Announce {
    pub cache_control: usize,
    pub location: String,
    pub server: String,
    pub notification_type: NotificationType,
    pub usn: USN,
    pub boot_id: usize,
    pub config_id: usize,
}

#[derive(Debug, Clone)]
pub enum NotificationType {
    /// `ssdp:all` A wildcard value that indicates the search is for all devices and services on the network. This is used to discover any UPnP device or service
    All,
    /// `upnp:rootdevice` A root device is a device that can be used to discover other UPnP devices and services.
    RootDevice,
    /// The UUID represents a unique identifier for a device or service.
    Uuid(uuid::Uuid),
    Urn(urn::URN),
}

impl FromStr for NotificationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:all" => Self::All,
            "upnp:rootdevice" => Self::RootDevice,
            rest if rest.starts_with("urn:") => Self::Urn(urn::URN::from_str(rest)?),
            rest if rest.starts_with("uuid:") => Self::Uuid(
                rest.strip_prefix("uuid:")
                    .expect("prefix checked above")
                    .parse()?,
            ),
            rest => Err(anyhow::anyhow!("Unknown notification type: {rest}"))?,
        })
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::All => write!(f, "ssdp:all"),
            NotificationType::RootDevice => write!(f, "upnp:rootdevice"),
            NotificationType::Uuid(id) => write!(f, "uuid:{id}"),
            NotificationType::Urn(urn) => write!(f, "{urn}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
/// Notification subtype. Specifies type of notification.
pub enum NotificationSubType {
    /// This is typically sent when a device is first powered on or joins the network, or to periodically reaffirm its presence
    Alive,
    /// Sent when a device is being removed from the network or shutting down.
    ByeBye,
    /// Used when there are changes in the device's details.
    Update,
}

impl Display for NotificationSubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            NotificationSubType::Alive => "alive",
            NotificationSubType::ByeBye => "byebye",
            NotificationSubType::Update => "update",
        };
        write!(f, "ssdp:{msg}")
    }
}

impl FromStr for NotificationSubType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:alive" => Self::Alive,
            "ssdp:byebye" => Self::ByeBye,
            "ssdp:update" => Self::Update,
            rest => Err(anyhow::anyhow!("Unknown notification sub type: {rest}"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NotifyByeByeMessage {
    pub host: SocketAddr,
    /// The Unique Service Name, which combines a unique identifier (UUID) with the device or service type.
    /// This allows clients to uniquely identify the device or service instance
    pub usn: USN,
    /// Notification type. Specifies type of device/service.
    pub nt: NotificationType,
    /// Notification subtype. Specifies type of notification.
    pub nts: NotificationSubType,
    pub boot_id: usize,
    pub config_id: usize,
}

#[derive(Debug, Clone)]
pub struct NotifyUpdateMessage<'a> {
    pub host: SocketAddr,
    /// The Unique Service Name, which combines a unique identifier (UUID) with the device or service type.
    /// This allows clients to uniquely identify the device or service instance
    pub usn: &'a str,
    /// Url of device description
    pub location: &'a str,
    /// Notification type. Specifies type of device/service.
    pub nt: NotificationType,
    /// Notification subtype. Specifies type of notification.
    pub nts: NotificationSubType,
    pub boot_id: usize,
    pub config_id: usize,
    pub next_boot_id: usize,
}

#[derive(Debug, Clone)]
pub struct NotifyAliveMessage<'a> {
    pub host: SocketAddr,
    /// Url of device description
    pub location: Cow<'a, str>,
    /// The Unique Service Name, which combines a unique identifier (UUID) with the device or service type.
    /// This allows clients to uniquely identify the device or service instance
    pub usn: USN,
    /// Notification type. Specifies type of device/service.
    pub nt: NotificationType,
    /// Notification subtype. Specifies type of notification.
    pub nts: NotificationSubType,
    /// Cache life time in seconds
    pub cache_control: usize,
    /// Information about the software used by the origin server to handle the request
    pub server: &'a str,
    pub boot_id: usize,
    pub config_id: usize,
}

impl BroadcastMessage<'_> {
    pub fn parse_ssdp_payload(s: &str) -> anyhow::Result<BroadcastMessage<'_>> {
        let mut lines = s.lines();
        let request_line = lines.next().context("request line")?;
        let (method, _) = request_line.split_once(' ').context("split request line")?;
        anyhow::ensure!(method == "NOTIFY", "expected NOTIFY, got {method}");
        let headers = lines.filter_map(|l| l.split_once(": "));

        let mut host = None;
        let mut nts = None;
        let mut location = None;
        let mut nt = None;
        let mut usn = None;
        let mut cache_control = None;
        let mut server = None;
        let mut boot_id = None;
        let mut config_id = None;
        let mut next_boot_id = None;
        for (name, value) in headers {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "host" => {
                    host = Some(SocketAddr::V4(
                        SocketAddrV4::from_str(value).context("parse host address")?,
                    ));
                }
                "location" => location = Some(value),
                "usn" => usn = Some(value),
                "nt" => nt = Some(NotificationType::from_str(value)?),
                "nts" => nts = Some(NotificationSubType::from_str(value)?),
                "server" => server = Some(value),
                "cache-control" => {
                    let (prefix, cache_duration) =
                        value.split_once('=').context("split cache control")?;
                    anyhow::ensure!(prefix.trim() == "max-age");
                    cache_control = Some(cache_duration.parse().context("parse duration seconds")?)
                }
                "bootid.upnp.org" => boot_id = Some(value.parse().context("parse boot id")?),
                "configid.upnp.org" => config_id = Some(value.parse().context("parse config id")?),
                "nextbootid.upnp.org" => {
                    next_boot_id = Some(value.parse().context("parse next boot id")?)
                }
                _ => (),
            }
        }
        let nt = nt.context("missing nt")?;
        let nts = nts.context("missing nts")?;
        let host = host.context("missing host")?;
        let usn = usn.context("missing usn")?;
        let boot_id = boot_id.unwrap_or_default();
        let config_id = config_id.unwrap_or_default();
        match nts {
            NotificationSubType::Alive => {
                let location = location.context("missing location")?;
                let cache_control = cache_control.context("missing cache control")?;
                let server = server.context("missing server")?;
                let notify_message = NotifyAliveMessage {
                    host,
                    location: Cow::Borrowed(location),
                    usn: USN::from_str(usn)?,
                    nt,
                    nts,
                    cache_control,
                    server,
                    boot_id,
                    config_id,
                };
                Ok(BroadcastMessage::NotifyAlive(notify_message))
            }
            NotificationSubType::ByeBye => {
                let byebye_message = NotifyByeByeMessage {
                    host,
                    usn: USN::from_str(usn)?,
                    nt,
                    nts,
                    boot_id,
                    config_id,
                };
                Ok(BroadcastMessage::NotifyByeBye(byebye_message))
            }
            NotificationSubType::Update => {
                let location = location.context("missing location")?;
                let next_boot_id = next_boot_id.context("missing next boot id")?;
                let update_message = NotifyUpdateMessage {
                    location,
                    host,
                    usn,
                    nt,
                    nts,
                    boot_id,
                    config_id,
                    next_boot_id,
                };
                Ok(BroadcastMessage::NotifyUpdate(update_message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_notify_alive() {
        let notify = r#"NOTIFY * HTTP/1.1
HOST: 239.255.255.250:1900
CACHE-CONTROL: max-age=1800
LOCATION: http://192.168.1.1:49152/IGDdevicedesc.xml
OPT: "http://schemas.upnp.org/upnp/1/0/"; ns=01
01-NLS: 2c118d74-1dd2-11b2-888a-b21a12907e76
NT: urn:schemas-upnp-org:service:WANIPConnection:1
NTS: ssdp:alive
SERVER: Linux/3.14.77, UPnP/1.0, Portable SDK for UPnP devices/1.6.19
USN: uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::urn:schemas-upnp-org:service:WANIPConnection:1"#;

        let notify_message = BroadcastMessage::parse_ssdp_payload(notify).unwrap();
        assert!(matches!(
            notify_message,
            BroadcastMessage::NotifyAlive { .. }
        ));
    }

    #[test]
    fn renders_search_message() {
        let search = SearchMessage {
            host: SSDP_ADDR,
            st: NotificationType::RootDevice,
            mx: 2,
            user_agent: None,
        };
        let rendered = search.to_string();
        assert!(rendered.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(rendered.contains("ST: upnp:rootdevice\r\n"));
        assert!(rendered.contains("MX: 2\r\n"));
    }

    #[test]
    fn parses_search_response() {
        let response = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age=1800\r\n\
LOCATION: http://192.168.1.1:49152/IGDdevicedesc.xml\r\n\
SERVER: Linux/3.14.77 UPnP/1.0\r\n\
ST: urn:schemas-upnp-org:service:WANIPConnection:1\r\n\
USN: uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::urn:schemas-upnp-org:service:WANIPConnection:1\r\n\r\n";
        let announce = parse_search_response(response).unwrap();
        assert_eq!(announce.location, "http://192.168.1.1:49152/IGDdevicedesc.xml");
    }
}
