//! Drives the transport layer against a fake IGD (an axum server serving a
//! device description, an SCPD document and a scripted SOAP control endpoint)
//! to exercise the scenarios that matter most without needing real SSDP
//! multicast traffic, which this sandbox cannot reliably produce.
//!
//! The fake is reached through the crate's own [ControlPoint::handle_event]
//! with a hand-built [Announce], so the device-description-fetch -> SCPD-fetch
//! -> [ScpdClient] construction path is the real one, not a stand-in.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use axum::{extract::State, http::HeaderMap, routing::{get, post}, Router};
use igd_portmap::{
    engine::{
        address_tracker,
        endpoint::EndpointProxy,
        installer::{self, InstallOutcome},
        registry::{MappingRegistry, Protocol},
    },
    transport::{
        control_point::{ControlPoint, ControlPointEvent},
        device_description::Udn,
        discovery::DiscoveryEvent,
        internet_gateway::InternetGatewayClient,
        service_client::ScpdClient,
        ssdp::{Announce, NotificationType, USN},
        urn::URN,
    },
};

const WAN_IP_URN: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

#[derive(Debug, Default)]
struct FakeIgdState {
    external_ip: Option<Ipv4Addr>,
    external_ip_garbage: Option<String>,
    /// Ports `AddPortMapping` always rejects with 718, regardless of how many
    /// times they're retried — as opposed to "rejected on the first attempt
    /// only", which would make a retry landing back on the same random port
    /// an intermittent test failure rather than an always-correct success.
    always_reject: HashSet<u16>,
    add_calls: Vec<AddCall>,
    delete_calls: Vec<DeleteCall>,
}

#[derive(Debug, Clone)]
struct AddCall {
    external_port: u16,
    protocol: String,
    internal_port: u16,
    internal_client: String,
    description: String,
    lease_duration: u32,
}

#[derive(Debug, Clone)]
struct DeleteCall {
    remote_host: String,
    external_port: u16,
    protocol: String,
}

type SharedState = Arc<Mutex<FakeIgdState>>;

/// A fake `InternetGatewayDevice` with a single `WANIPConnection` service,
/// bound to an ephemeral localhost port.
struct FakeIgd {
    addr: SocketAddr,
    state: SharedState,
}

impl FakeIgd {
    async fn spawn() -> Self {
        let state: SharedState = Arc::new(Mutex::new(FakeIgdState::default()));

        let app = Router::new()
            .route("/desc.xml", get(device_description))
            .route("/scpd.xml", get(scpd))
            .route("/control", post(control))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    fn location(&self) -> String {
        format!("http://{}/desc.xml", self.addr)
    }

    fn set_external_ip(&self, ip: Ipv4Addr) {
        let mut state = self.state.lock().unwrap();
        state.external_ip = Some(ip);
        state.external_ip_garbage = None;
    }

    fn set_external_ip_garbage(&self, raw: &str) {
        let mut state = self.state.lock().unwrap();
        state.external_ip_garbage = Some(raw.to_owned());
        state.external_ip = None;
    }

    fn always_reject_port(&self, port: u16) {
        self.state.lock().unwrap().always_reject.insert(port);
    }

    fn add_calls(&self) -> Vec<AddCall> {
        self.state.lock().unwrap().add_calls.clone()
    }

    fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    /// Discovers this fake device as a `WANIPConnection` endpoint the same way
    /// the engine's endpoint set would, via a synthetic SSDP announce.
    async fn connect(&self) -> ScpdClient<InternetGatewayClient> {
        let udn = Udn::new(uuid::Uuid::new_v4());
        let announce = Announce {
            cache_control: 1800,
            location: self.location(),
            server: "fake-igd/1.0".to_owned(),
            notification_type: NotificationType::Urn(URN::wan_ip_connection()),
            usn: USN::urn(udn, URN::wan_ip_connection()),
            boot_id: 0,
            config_id: 0,
        };

        let mut cp = ControlPoint::<InternetGatewayClient>::new(reqwest::Client::new());
        let event = cp
            .handle_event(DiscoveryEvent::Announce(announce))
            .await
            .expect("control point should accept the fake announce")
            .expect("a WANIPConnection announce should yield a proxy");

        match event {
            ControlPointEvent::ServiceProxyAvailable { proxy, .. } => proxy,
            ControlPointEvent::ServiceProxyUnavailable { .. } => {
                panic!("first sighting of a device can't be an unavailable event")
            }
        }
    }
}

async fn device_description() -> String {
    format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>Fake Gateway</friendlyName>
    <manufacturer>test</manufacturer>
    <modelName>fake-igd</modelName>
    <UDN>uuid:{}</UDN>
    <serviceList>
      <service>
        <serviceType>{WAN_IP_URN}</serviceType>
        <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
        <SCPDURL>/scpd.xml</SCPDURL>
        <controlURL>/control</controlURL>
        <eventSubURL>/event</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#,
        uuid::Uuid::new_v4(),
    )
}

async fn scpd() -> &'static str {
    r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <actionList>
    <action>
      <name>AddPortMapping</name>
      <argumentList>
        <argument><name>NewRemoteHost</name><direction>in</direction><relatedStateVariable>RemoteHost</relatedStateVariable></argument>
        <argument><name>NewExternalPort</name><direction>in</direction><relatedStateVariable>ExternalPort</relatedStateVariable></argument>
        <argument><name>NewProtocol</name><direction>in</direction><relatedStateVariable>PortMappingProtocol</relatedStateVariable></argument>
        <argument><name>NewInternalPort</name><direction>in</direction><relatedStateVariable>InternalPort</relatedStateVariable></argument>
        <argument><name>NewInternalClient</name><direction>in</direction><relatedStateVariable>InternalClient</relatedStateVariable></argument>
        <argument><name>NewEnabled</name><direction>in</direction><relatedStateVariable>PortMappingEnabled</relatedStateVariable></argument>
        <argument><name>NewPortMappingDescription</name><direction>in</direction><relatedStateVariable>PortMappingDescription</relatedStateVariable></argument>
        <argument><name>NewLeaseDuration</name><direction>in</direction><relatedStateVariable>PortMappingLeaseDuration</relatedStateVariable></argument>
      </argumentList>
    </action>
    <action>
      <name>DeletePortMapping</name>
      <argumentList>
        <argument><name>NewRemoteHost</name><direction>in</direction><relatedStateVariable>RemoteHost</relatedStateVariable></argument>
        <argument><name>NewExternalPort</name><direction>in</direction><relatedStateVariable>ExternalPort</relatedStateVariable></argument>
        <argument><name>NewProtocol</name><direction>in</direction><relatedStateVariable>PortMappingProtocol</relatedStateVariable></argument>
      </argumentList>
    </action>
    <action>
      <name>GetExternalIPAddress</name>
      <argumentList>
        <argument><name>NewExternalIPAddress</name><direction>out</direction><relatedStateVariable>ExternalIPAddress</relatedStateVariable></argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable sendEvents="yes">
      <name>ExternalIPAddress</name>
      <dataType>string</dataType>
    </stateVariable>
  </serviceStateTable>
</scpd>"#
}

fn tag_value(body: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open).map(|i| i + open.len());
    let end = start.and_then(|s| body[s..].find(&close).map(|i| i + s));
    match (start, end) {
        (Some(s), Some(e)) => body[s..e].to_owned(),
        _ => String::new(),
    }
}

fn action_name(headers: &HeaderMap) -> String {
    let soap_action = headers
        .get("SOAPAction")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    soap_action
        .trim_matches('"')
        .rsplit_once('#')
        .map(|(_, name)| name.to_owned())
        .unwrap_or_default()
}

fn soap_envelope(body: impl std::fmt::Display) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
{body}
</s:Body>
</s:Envelope>"#
    )
}

fn action_response(action: &str, args: &str) -> String {
    soap_envelope(format!(
        r#"<u:{action}Response xmlns:u="{WAN_IP_URN}">{args}</u:{action}Response>"#
    ))
}

fn upnp_fault(code: u16, description: &str) -> String {
    soap_envelope(format!(
        r#"<s:Fault>
<faultcode>s:Client</faultcode>
<faultstring>UPnPError</faultstring>
<detail>
<UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
<errorCode>{code}</errorCode>
<errorDescription>{description}</errorDescription>
</UPnPError>
</detail>
</s:Fault>"#
    ))
}

async fn control(State(state): State<SharedState>, headers: HeaderMap, body: String) -> String {
    match action_name(&headers).as_str() {
        "AddPortMapping" => {
            let external_port: u16 = tag_value(&body, "NewExternalPort").parse().unwrap();
            let mut state = state.lock().unwrap();
            if state.always_reject.contains(&external_port) {
                return upnp_fault(718, "ConflictInMappingEntry");
            }
            state.add_calls.push(AddCall {
                external_port,
                protocol: tag_value(&body, "NewProtocol"),
                internal_port: tag_value(&body, "NewInternalPort").parse().unwrap(),
                internal_client: tag_value(&body, "NewInternalClient"),
                description: tag_value(&body, "NewPortMappingDescription"),
                lease_duration: tag_value(&body, "NewLeaseDuration").parse().unwrap(),
            });
            action_response("AddPortMapping", "")
        }
        "DeletePortMapping" => {
            state.lock().unwrap().delete_calls.push(DeleteCall {
                remote_host: tag_value(&body, "NewRemoteHost"),
                external_port: tag_value(&body, "NewExternalPort").parse().unwrap(),
                protocol: tag_value(&body, "NewProtocol"),
            });
            action_response("DeletePortMapping", "")
        }
        "GetExternalIPAddress" => {
            let state = state.lock().unwrap();
            if let Some(garbage) = &state.external_ip_garbage {
                return action_response(
                    "GetExternalIPAddress",
                    &format!("<NewExternalIPAddress>{garbage}</NewExternalIPAddress>"),
                );
            }
            let ip = state.external_ip.expect("test must set an external ip");
            action_response(
                "GetExternalIPAddress",
                &format!("<NewExternalIPAddress>{ip}</NewExternalIPAddress>"),
            )
        }
        other => panic!("fake IGD received unexpected action: {other}"),
    }
}

#[tokio::test]
async fn happy_path_installs_a_mapping() {
    let igd = FakeIgd::spawn().await;
    igd.set_external_ip(Ipv4Addr::new(127, 0, 0, 2));
    let proxy = EndpointProxy::WanIp(igd.connect().await);

    let outcome = installer::run_install(
        &proxy,
        Protocol::Udp,
        6543,
        Ipv4Addr::new(192, 168, 4, 22),
        6543,
        "desc",
        10,
    )
    .await;

    match outcome {
        InstallOutcome::Installed {
            actual_external_port,
        } => assert_eq!(actual_external_port, 6543),
        InstallOutcome::Failed(e) => panic!("expected success, got {e}"),
    }

    let calls = igd.add_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].external_port, 6543);
    assert_eq!(calls[0].protocol, "UDP");
    assert_eq!(calls[0].internal_port, 6543);
    assert_eq!(calls[0].internal_client, "192.168.4.22");
    assert_eq!(calls[0].description, "desc");
    assert_eq!(calls[0].lease_duration, 10);

    let resolution = address_tracker::resolve(&proxy).await;
    match resolution {
        address_tracker::AddressResolution::Acquired(ip) => {
            assert_eq!(ip, Ipv4Addr::new(127, 0, 0, 2))
        }
        address_tracker::AddressResolution::Failed(e) => panic!("expected success, got {e}"),
    }
}

#[tokio::test]
async fn conflict_retries_until_a_free_port_is_found() {
    let igd = FakeIgd::spawn().await;
    igd.set_external_ip(Ipv4Addr::new(127, 0, 0, 2));
    // The conflict-retry loop's first attempt mirrors the local port since
    // requested_external_port is 0; reject that one so it has to retry.
    igd.always_reject_port(6543);
    let proxy = EndpointProxy::WanIp(igd.connect().await);

    let outcome = installer::run_install(
        &proxy,
        Protocol::Udp,
        0,
        Ipv4Addr::new(192, 168, 4, 22),
        6543,
        "",
        10,
    )
    .await;

    let actual_external_port = match outcome {
        InstallOutcome::Installed {
            actual_external_port,
        } => actual_external_port,
        InstallOutcome::Failed(e) => panic!("expected eventual success, got {e}"),
    };

    assert_ne!(actual_external_port, 6543);
    assert!((1025..=65535).contains(&actual_external_port));

    let calls = igd.add_calls();
    assert_eq!(calls.len(), 1, "only the accepted attempt should install");
    assert_eq!(calls[0].external_port, actual_external_port);

    let delete_outcome =
        installer::run_delete(&proxy, Protocol::Udp, actual_external_port).await;
    assert!(delete_outcome.is_ok());
    let deletes = igd.delete_calls();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].external_port, actual_external_port);
    assert_eq!(deletes[0].protocol, "UDP");
}

#[tokio::test]
async fn invalid_external_ip_never_surfaces_a_mapping() {
    let igd = FakeIgd::spawn().await;
    igd.set_external_ip_garbage("asdas");
    let proxy = EndpointProxy::WanIp(igd.connect().await);

    let resolution = address_tracker::resolve(&proxy).await;
    match resolution {
        address_tracker::AddressResolution::Failed(e) => {
            assert!(!e.to_string().is_empty());
        }
        address_tracker::AddressResolution::Acquired(ip) => {
            panic!("garbage external ip should not resolve, got {ip}")
        }
    }

    assert!(igd.add_calls().is_empty());
}

#[tokio::test]
async fn dispose_deletes_the_installed_mapping() {
    let igd = FakeIgd::spawn().await;
    igd.set_external_ip(Ipv4Addr::new(127, 0, 0, 2));
    let proxy = EndpointProxy::WanIp(igd.connect().await);

    let outcome = installer::run_install(
        &proxy,
        Protocol::Udp,
        6543,
        Ipv4Addr::new(192, 168, 4, 22),
        6543,
        "desc",
        10,
    )
    .await;
    let actual_external_port = match outcome {
        InstallOutcome::Installed {
            actual_external_port,
        } => actual_external_port,
        InstallOutcome::Failed(e) => panic!("expected success, got {e}"),
    };

    installer::run_delete(&proxy, Protocol::Udp, actual_external_port)
        .await
        .expect("delete should succeed");

    let deletes = igd.delete_calls();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].external_port, actual_external_port);
    assert_eq!(deletes[0].protocol, "UDP");
    assert_eq!(deletes[0].remote_host, "");
}

#[tokio::test]
async fn remove_by_local_produces_the_same_delete_as_remove_by_port() {
    let igd = FakeIgd::spawn().await;
    igd.set_external_ip(Ipv4Addr::new(127, 0, 0, 2));
    let proxy = EndpointProxy::WanIp(igd.connect().await);
    let local_ip = Ipv4Addr::new(192, 168, 4, 22);

    let mut registry = MappingRegistry::new();
    registry
        .add_port(Protocol::Udp, 6543, local_ip, 6543, 10, Some("desc".into()))
        .expect("registry should accept the mapping");

    let outcome = installer::run_install(&proxy, Protocol::Udp, 6543, local_ip, 6543, "desc", 10)
        .await;
    assert!(matches!(outcome, InstallOutcome::Installed { .. }));

    // Resolve by local address, the same way the engine's remove_port_local
    // handle does, rather than by the external port a caller might not know.
    let removed = registry
        .remove_port_local(Protocol::Udp, local_ip, 6543)
        .expect("mapping should resolve by local address");

    installer::run_delete(&proxy, removed.protocol, removed.requested_external_port)
        .await
        .expect("delete should succeed");

    let deletes = igd.delete_calls();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].external_port, 6543);
    assert_eq!(deletes[0].protocol, "UDP");
}

#[tokio::test]
async fn two_igds_are_mapped_independently() {
    let first = FakeIgd::spawn().await;
    first.set_external_ip(Ipv4Addr::new(127, 0, 0, 2));
    let second = FakeIgd::spawn().await;
    second.set_external_ip(Ipv4Addr::new(127, 0, 0, 3));

    let first_proxy = EndpointProxy::WanIp(first.connect().await);
    let second_proxy = EndpointProxy::WanIp(second.connect().await);

    let (first_outcome, second_outcome) = tokio::join!(
        installer::run_install(
            &first_proxy,
            Protocol::Udp,
            6543,
            Ipv4Addr::new(192, 168, 4, 22),
            6543,
            "desc",
            10,
        ),
        installer::run_install(
            &second_proxy,
            Protocol::Udp,
            6543,
            Ipv4Addr::new(192, 168, 4, 22),
            6543,
            "desc",
            10,
        ),
    );

    assert!(matches!(first_outcome, InstallOutcome::Installed { .. }));
    assert!(matches!(second_outcome, InstallOutcome::Installed { .. }));
    assert_eq!(first.add_calls().len(), 1);
    assert_eq!(second.add_calls().len(), 1);

    installer::run_delete(&first_proxy, Protocol::Udp, 6543)
        .await
        .expect("delete should succeed");
    installer::run_delete(&second_proxy, Protocol::Udp, 6543)
        .await
        .expect("delete should succeed");

    assert_eq!(first.delete_calls().len(), 1);
    assert_eq!(second.delete_calls().len(), 1);
}
