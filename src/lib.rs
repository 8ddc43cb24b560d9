//! Keeps a set of UPnP IGD port mappings installed on whatever `WANIPConnection`/
//! `WANPPPConnection` routers are reachable on the local network, for as long as
//! the caller wants them kept. Discovers routers over SSDP, installs and renews
//! mappings against them, tracks each router's external IP, and tears everything
//! down again on request or on drop.
//!
//! [engine] is the core state machine (registry, endpoint set, installers,
//! reconciler, event bus, shutdown coordinator); [transport] is the concrete
//! SSDP/SOAP/GENA wire layer it runs against; [thread_adaptor] wraps the engine
//! for callers with no Tokio runtime of their own.

pub mod engine;
pub mod error;
pub mod thread_adaptor;
pub mod transport;

pub use engine::events::{ContextAvailableHandler, EngineEvent};
pub use engine::registry::{Protocol, RegistryError};
pub use engine::EngineHandle;
pub use error::{ErrorDomain, MappingError};
pub use thread_adaptor::EngineThread;
