//! Event bus (C6): the three events the engine surfaces to the host
//! application, always delivered on the engine's home task.

use std::net::Ipv4Addr;

use crate::{engine::registry::Protocol, error::MappingError};

/// `mapped-external-port`: one installer has (re)established its mapping on
/// the router, or the endpoint's external IP changed under an already-mapped
/// installer.
#[derive(Debug, Clone)]
pub struct MappedExternalPort {
    pub protocol: Protocol,
    pub external_ip: Ipv4Addr,
    pub replaces_external_ip: Option<Ipv4Addr>,
    pub external_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub description: String,
}

/// `error-mapping-port`: one installer failed, either resolving the endpoint's
/// external address or installing/renewing the mapping itself.
#[derive(Debug, Clone)]
pub struct ErrorMappingPort {
    pub error: MappingErrorInfo,
    pub protocol: Protocol,
    pub requested_external_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub description: String,
}

/// A flattened, `Clone`-able view of [MappingError] suitable for an event payload.
#[derive(Debug, Clone)]
pub struct MappingErrorInfo {
    pub domain: crate::error::ErrorDomain,
    pub code: u16,
    pub message: String,
}

impl From<&MappingError> for MappingErrorInfo {
    fn from(err: &MappingError) -> Self {
        match err {
            MappingError::ExternalAddress { message } => Self {
                domain: crate::error::ErrorDomain::ExternalAddress,
                code: 0,
                message: message.clone(),
            },
            MappingError::Transport {
                domain,
                code,
                message,
            } => Self {
                domain: *domain,
                code: *code,
                message: message.clone(),
            },
        }
    }
}

/// Public events emitted by the engine. `ContextAvailable` is the only one
/// whose handler return value matters: a `true` reply vetoes that context.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MappedExternalPort(MappedExternalPort),
    ErrorMappingPort(ErrorMappingPort),
}

/// Fan-out to every subscriber of [EngineEvent]. A thin wrapper over a
/// broadcast channel so multiple observers (tests, a logging sink, the host
/// application) can subscribe independently.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is a normal, not an error: the host may not be
        // listening for events at all.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler consulted synchronously, before any control point is created on a
/// newly discovered network context. A `true` return vetoes the context.
///
/// This crate's discovery loop binds a single wildcard socket rather than one
/// per interface (see [discovery](crate::transport::discovery)), so in
/// practice there is exactly one context and the handler runs once at engine
/// startup; the hook is still exposed so callers that do need to filter
/// (e.g. skip VPN-only hosts) have somewhere to do it.
pub type ContextAvailableHandler = Box<dyn Fn() -> bool + Send + Sync>;
