//! GENA `NOTIFY` receiver: the embedded HTTP server this crate's control point
//! runs so devices can deliver evented state-variable changes (most
//! importantly `ExternalIPAddress`) back to it. Mirrors the teacher's device-side
//! [router](super::super::router) in shape, but serves exactly one route.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    routing::{on, MethodFilter},
    Router,
};
use tokio::sync::{mpsc, Mutex};

use super::eventing::PropertySet;

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<PropertySet>>>>;

/// Binds an ephemeral local port and serves `NOTIFY /notify/:key`, dispatching
/// each parsed `<e:propertyset>` body to whoever [register]ed that key.
#[derive(Debug, Clone)]
pub struct CallbackServer {
    /// The address routers on the LAN can reach this server at, not the
    /// `0.0.0.0` the listener itself is bound to.
    reachable_addr: SocketAddr,
    routes: Routes,
}

/// Finds the local interface address that would carry traffic to the WAN,
/// without actually sending any, the same trick the teacher's SSDP listener
/// uses to fill in its own advertised `location` URL.
async fn resolve_local_addr() -> anyhow::Result<SocketAddr> {
    let probe = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 0);
    let socket =
        tokio::net::UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
            .await?;
    socket.connect(probe).await?;
    socket.local_addr().context("get local addr")
}

impl CallbackServer {
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let reachable_addr = SocketAddr::new(resolve_local_addr().await?.ip(), port);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        let app = Router::new()
            .route(
                "/notify/{key}",
                on(MethodFilter::from_bytes(b"NOTIFY").expect("NOTIFY is a valid method token"), handle_notify),
            )
            .with_state(routes.clone());

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!("gena callback server exited: {e}");
            }
        });

        Ok(Self {
            reachable_addr,
            routes,
        })
    }

    /// The callback URL a subscription for `key` should be registered under.
    pub fn callback_url(&self, key: &str) -> String {
        format!("http://{}/notify/{key}", self.reachable_addr)
    }

    /// Starts routing `NOTIFY` bodies addressed to `key` to the returned
    /// receiver. Registering the same key twice replaces the previous receiver.
    pub async fn register(&self, key: String) -> mpsc::Receiver<PropertySet> {
        let (tx, rx) = mpsc::channel(16);
        self.routes.lock().await.insert(key, tx);
        rx
    }

    pub async fn unregister(&self, key: &str) {
        self.routes.lock().await.remove(key);
    }
}

async fn handle_notify(
    State(routes): State<Routes>,
    Path(key): Path<String>,
    body: String,
) -> axum::http::StatusCode {
    let property_set = match PropertySet::parse(&body) {
        Ok(set) => set,
        Err(e) => {
            tracing::debug!("discarding unparseable gena notify body: {e}");
            return axum::http::StatusCode::BAD_REQUEST;
        }
    };

    let sender = routes.lock().await.get(&key).cloned();
    match sender {
        Some(sender) => {
            let _ = sender.send(property_set).await;
            axum::http::StatusCode::OK
        }
        None => axum::http::StatusCode::NOT_FOUND,
    }
}
