//! The engine (C1-C7): one home task owning the mapping registry, the endpoint
//! set, and every installer, reached only through [EngineHandle]. Mirrors the
//! teacher's download actor: a command channel plus a `tokio::select!` loop,
//! with RPCs spawned onto a [JoinSet] so a slow router never blocks the loop.

pub mod address_tracker;
pub mod endpoint;
pub mod events;
pub mod installer;
pub mod reconciler;
pub mod registry;
pub mod shutdown;

use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::MappingError,
    transport::{
        callback_server::CallbackServer,
        eventing::{EventSubscriber, PropertySet},
    },
};

use address_tracker::AddressResolution;
use endpoint::{EndpointId, EndpointSet, EndpointSetEvent};
use events::{
    ContextAvailableHandler, EngineEvent, ErrorMappingPort, EventBus, MappedExternalPort,
};
use installer::{InstallOutcome, Installer, InstallerKey};
use reconciler::ReconcileAction;
use registry::{MappingId, MappingRegistry, Protocol, RegistryError};
use shutdown::ShutdownCoordinator;

/// Outcome of one spawned RPC task, routed back through `rpc_tasks`. All four
/// kinds share one [JoinSet] since a `JoinSet<T>` requires a single output
/// type regardless of what each task actually does.
#[derive(Debug)]
enum RpcCompletion {
    AddressResolved {
        endpoint_id: EndpointId,
        generation: u64,
        resolution: AddressResolution,
    },
    Installed {
        key: InstallerKey,
        generation: u64,
        outcome: InstallOutcome,
    },
    Renewed {
        key: InstallerKey,
        generation: u64,
        result: Result<(), MappingError>,
    },
    Deleted {
        key: InstallerKey,
        result: Result<(), MappingError>,
    },
}

/// A command sent to the home task. `ExternalIpEvented` is not part of the
/// public API: it is how the per-endpoint GENA subscription task (itself
/// plain `tokio::spawn`ed, not tracked in `rpc_tasks`) feeds NOTIFY-delivered
/// address changes back in, over the same channel public callers use.
enum Command {
    AddPort {
        protocol: Protocol,
        external_port: u16,
        local_ip: Ipv4Addr,
        local_port: u16,
        lease_duration: u32,
        description: Option<String>,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    RemovePort {
        protocol: Protocol,
        external_port: u16,
    },
    RemovePortLocal {
        protocol: Protocol,
        local_ip: Ipv4Addr,
        local_port: u16,
    },
    DeleteAllMappings {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
    ExternalIpEvented {
        endpoint_id: EndpointId,
        generation: u64,
        new_ip: Ipv4Addr,
    },
}

/// A cheaply-`Clone`-able front door to the engine. Every method sends a
/// [Command] and, where a reply is meaningful, awaits it.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: EventBus,
}

impl EngineHandle {
    #[allow(clippy::too_many_arguments)]
    pub async fn add_port(
        &self,
        protocol: Protocol,
        external_port: u16,
        local_ip: Ipv4Addr,
        local_port: u16,
        lease_duration: u32,
        description: Option<String>,
    ) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::AddPort {
                protocol,
                external_port,
                local_ip,
                local_port,
                lease_duration,
                description,
                reply,
            })
            .await
            .is_err()
        {
            return Err(RegistryError::ShuttingDown);
        }
        rx.await.unwrap_or(Err(RegistryError::ShuttingDown))
    }

    pub async fn remove_port(&self, protocol: Protocol, external_port: u16) {
        let _ = self
            .commands
            .send(Command::RemovePort {
                protocol,
                external_port,
            })
            .await;
    }

    pub async fn remove_port_local(
        &self,
        protocol: Protocol,
        local_ip: Ipv4Addr,
        local_port: u16,
    ) {
        let _ = self
            .commands
            .send(Command::RemovePortLocal {
                protocol,
                local_ip,
                local_port,
            })
            .await;
    }

    /// Deletes every mapping and returns whether teardown is already
    /// drained (no `DeletePortMapping` RPC outstanding). Does not itself stop
    /// the engine; see [EngineHandle::shutdown].
    pub async fn delete_all_mappings(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::DeleteAllMappings { reply })
            .await
            .is_err()
        {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Deletes every mapping, waits for every resulting `DeletePortMapping`
    /// RPC to complete, then stops the home task. Consumes the handle's
    /// command sender; other clones may still be in flight, but the engine
    /// itself will not accept any further command once this resolves.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// The home task. Owned exclusively by [Engine::run], spawned once per engine.
/// `pub(crate)` rather than private so [crate::thread_adaptor] can call
/// [Engine::spawn] directly from its own dedicated runtime.
pub(crate) struct Engine {
    commands: mpsc::Receiver<Command>,
    commands_tx: mpsc::Sender<Command>,
    registry: MappingRegistry,
    /// `None` only when a [ContextAvailableHandler] vetoed the one network
    /// context this crate's single-wildcard-socket discovery loop ever sees.
    endpoints: Option<EndpointSet>,
    installers: HashMap<InstallerKey, Installer>,
    /// In-flight install/renew task per installer, so teardown can cancel it.
    installer_handles: HashMap<InstallerKey, AbortHandle>,
    /// In-flight address-resolution task per endpoint.
    address_handles: HashMap<EndpointId, AbortHandle>,
    /// The long-running GENA subscription task per endpoint (plain
    /// `tokio::spawn`, not part of `rpc_tasks`: it never terminates on its
    /// own, it just keeps renewing until aborted).
    subscription_handles: HashMap<EndpointId, AbortHandle>,
    /// Generation an endpoint's address-resolution/eventing tasks were
    /// spawned under, checked against stale completions the same way
    /// [Installer::generation] is.
    endpoint_generation: HashMap<EndpointId, u64>,
    rpc_tasks: JoinSet<RpcCompletion>,
    shutdown: ShutdownCoordinator,
    events: EventBus,
    callback_server: CallbackServer,
    cancellation_token: CancellationToken,
    next_generation: u64,
    draining: bool,
    pending_shutdown_done: Option<oneshot::Sender<()>>,
}

impl Engine {
    /// Binds the discovery socket and the GENA callback server, consults
    /// `context_available` once, and spawns the home task. Returns immediately;
    /// the returned [tokio::task::JoinHandle] resolves once the engine has
    /// fully shut down.
    pub async fn spawn(
        context_available: Option<ContextAvailableHandler>,
    ) -> anyhow::Result<(EngineHandle, tokio::task::JoinHandle<()>)> {
        let vetoed = context_available.map(|f| f()).unwrap_or(false);
        let cancellation_token = CancellationToken::new();
        let endpoints = if vetoed {
            tracing::info!("context-available handler vetoed the only network context; engine will never discover an endpoint");
            None
        } else {
            Some(EndpointSet::spawn(cancellation_token.clone()).await?)
        };
        let callback_server = CallbackServer::bind().await?;
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let events = EventBus::new();

        let engine = Engine {
            commands: commands_rx,
            commands_tx: commands_tx.clone(),
            registry: MappingRegistry::new(),
            endpoints,
            installers: HashMap::new(),
            installer_handles: HashMap::new(),
            address_handles: HashMap::new(),
            subscription_handles: HashMap::new(),
            endpoint_generation: HashMap::new(),
            rpc_tasks: JoinSet::new(),
            shutdown: ShutdownCoordinator::new(),
            events: events.clone(),
            callback_server,
            cancellation_token,
            next_generation: 0,
            draining: false,
            pending_shutdown_done: None,
        };

        let join_handle = tokio::spawn(engine.run());
        Ok((
            EngineHandle {
                commands: commands_tx,
                events,
            },
            join_handle,
        ))
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                event = Self::poll_endpoints(&mut self.endpoints) => {
                    match event {
                        Some(event) => self.handle_endpoint_event(event).await,
                        None => {
                            tracing::warn!("discovery loop exited for good; no further endpoints will be discovered");
                            self.endpoints = None;
                        }
                    }
                }
                completion = self.rpc_tasks.join_next(), if !self.rpc_tasks.is_empty() => {
                    if let Some(result) = completion {
                        self.handle_rpc_completion(result).await;
                    }
                }
            }

            if self.draining && self.shutdown.is_drained() {
                self.cancellation_token.cancel();
                if let Some(done) = self.pending_shutdown_done.take() {
                    let _ = done.send(());
                }
                break;
            }
        }
    }

    async fn poll_endpoints(endpoints: &mut Option<EndpointSet>) -> Option<EndpointSetEvent> {
        match endpoints {
            Some(endpoints) => endpoints.poll().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddPort {
                protocol,
                external_port,
                local_ip,
                local_port,
                lease_duration,
                description,
                reply,
            } => {
                let result = self.registry.add_port(
                    protocol,
                    external_port,
                    local_ip,
                    local_port,
                    lease_duration,
                    description,
                );
                if let Ok(mapping_id) = result {
                    let endpoints = self.endpoints.iter().flat_map(|es| es.iter());
                    let actions = reconciler::on_mapping_added(endpoints, mapping_id);
                    self.apply_reconcile_actions(actions);
                }
                let _ = reply.send(result.map(|_| ()));
            }
            Command::RemovePort {
                protocol,
                external_port,
            } => {
                if let Some(mapping) = self.registry.remove_port(protocol, external_port) {
                    self.teardown_mapping(mapping.id).await;
                }
            }
            Command::RemovePortLocal {
                protocol,
                local_ip,
                local_port,
            } => {
                if let Some(mapping) =
                    self.registry.remove_port_local(protocol, local_ip, local_port)
                {
                    self.teardown_mapping(mapping.id).await;
                }
            }
            Command::DeleteAllMappings { reply } => {
                let removed = self.registry.delete_all();
                for mapping in removed {
                    self.teardown_mapping(mapping.id).await;
                }
                let _ = reply.send(self.shutdown.is_drained());
            }
            Command::Shutdown { done } => {
                let removed = self.registry.delete_all();
                for mapping in removed {
                    self.teardown_mapping(mapping.id).await;
                }
                self.draining = true;
                self.pending_shutdown_done = Some(done);
            }
            Command::ExternalIpEvented {
                endpoint_id,
                generation,
                new_ip,
            } => self.handle_external_ip_evented(endpoint_id, generation, new_ip),
        }
    }

    fn apply_reconcile_actions(&mut self, actions: Vec<ReconcileAction>) {
        for action in actions {
            match action {
                ReconcileAction::Install(key) => self.start_install(key),
                ReconcileAction::SyntheticAddressError(key) => {
                    self.emit_synthetic_address_error(key)
                }
            }
        }
    }

    fn start_install(&mut self, key: InstallerKey) {
        let Some(mapping) = self.registry.get(key.mapping_id) else {
            return;
        };
        let Some(endpoint) = self
            .endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.get(&key.endpoint_id))
        else {
            return;
        };

        let mut installer = Installer::new(key.endpoint_id.clone(), mapping);
        let generation = self.next_generation();
        installer.generation = generation;

        let proxy = endpoint.proxy.clone();
        let protocol = installer.protocol;
        let requested_external_port = installer.requested_external_port;
        let local_ip = installer.local_ip;
        let local_port = installer.local_port;
        let lease_duration = installer.lease_duration;
        let description = installer.description.clone();
        let key_for_task = key.clone();

        self.installers.insert(key.clone(), installer);
        let handle = self.rpc_tasks.spawn(async move {
            let outcome = installer::run_install(
                &proxy,
                protocol,
                requested_external_port,
                local_ip,
                local_port,
                &description,
                lease_duration,
            )
            .await;
            RpcCompletion::Installed {
                key: key_for_task,
                generation,
                outcome,
            }
        });
        self.installer_handles.insert(key, handle);
    }

    fn emit_synthetic_address_error(&mut self, key: InstallerKey) {
        let Some(mapping) = self.registry.get(key.mapping_id) else {
            return;
        };
        self.events.emit(EngineEvent::ErrorMappingPort(ErrorMappingPort {
            error: (&MappingError::external_address(
                "endpoint's external address is unavailable",
            ))
                .into(),
            protocol: mapping.protocol,
            requested_external_port: mapping.requested_external_port,
            local_ip: mapping.local_ip,
            local_port: mapping.local_port,
            description: mapping.description.clone(),
        }));
    }

    fn schedule_renewal(&mut self, key: InstallerKey) {
        let Some(installer) = self.installers.get(&key) else {
            return;
        };
        let Some(endpoint) = self
            .endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.get(&key.endpoint_id))
        else {
            return;
        };

        let proxy = endpoint.proxy.clone();
        let protocol = installer.protocol;
        let actual_external_port = installer.actual_external_port;
        let local_ip = installer.local_ip;
        let local_port = installer.local_port;
        let lease_duration = installer.lease_duration;
        let description = installer.description.clone();
        let sleep_for = Duration::from_secs((lease_duration / 2).max(1) as u64);
        let generation = self.next_generation();
        let key_for_task = key.clone();

        if let Some(installer) = self.installers.get_mut(&key) {
            installer.generation = generation;
        }

        let handle = self.rpc_tasks.spawn(async move {
            tokio::time::sleep(sleep_for).await;
            let result = installer::run_renew(
                &proxy,
                protocol,
                actual_external_port,
                local_ip,
                local_port,
                &description,
                lease_duration,
            )
            .await;
            RpcCompletion::Renewed {
                key: key_for_task,
                generation,
                result,
            }
        });
        self.installer_handles.insert(key, handle);
    }

    async fn teardown_mapping(&mut self, mapping_id: MappingId) {
        let keys = reconciler::on_mapping_removed(&self.installers, mapping_id);
        for key in keys {
            self.teardown_installer(key).await;
        }
    }

    async fn teardown_endpoint(&mut self, endpoint_id: &EndpointId) {
        if let Some(handle) = self.address_handles.remove(endpoint_id) {
            handle.abort();
        }
        if let Some(handle) = self.subscription_handles.remove(endpoint_id) {
            handle.abort();
        }
        self.endpoint_generation.remove(endpoint_id);

        let keys = reconciler::on_endpoint_removed(&self.installers, endpoint_id);
        for key in keys {
            self.teardown_installer(key).await;
        }
    }

    /// Removes the installer and cancels its in-flight RPC, if any. If it was
    /// mapped, issues a best-effort delete — unless the endpoint is already
    /// gone, in which case there is nowhere to send it.
    async fn teardown_installer(&mut self, key: InstallerKey) {
        let Some(installer) = self.installers.remove(&key) else {
            return;
        };
        if let Some(handle) = self.installer_handles.remove(&key) {
            handle.abort();
        }
        if !installer.mapped {
            return;
        }
        let Some(endpoint) = self
            .endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.get(&key.endpoint_id))
        else {
            return;
        };

        let proxy = endpoint.proxy.clone();
        let protocol = installer.protocol;
        let actual_external_port = installer.actual_external_port;
        let key_for_task = key.clone();

        self.shutdown.begin_delete();
        self.rpc_tasks.spawn(async move {
            let result = installer::run_delete(&proxy, protocol, actual_external_port).await;
            RpcCompletion::Deleted {
                key: key_for_task,
                result,
            }
        });
    }

    async fn handle_endpoint_event(&mut self, event: EndpointSetEvent) {
        match event {
            EndpointSetEvent::Available(endpoint_id) => self.handle_endpoint_available(endpoint_id),
            EndpointSetEvent::Unavailable(endpoint_id) => {
                self.teardown_endpoint(&endpoint_id).await
            }
        }
    }

    fn handle_endpoint_available(&mut self, endpoint_id: EndpointId) {
        let Some((proxy, event_sub_url)) = self
            .endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.get(&endpoint_id))
            .map(|endpoint| (endpoint.proxy.clone(), endpoint.proxy.event_sub_url().to_string()))
        else {
            return;
        };
        let generation = self.next_generation();
        self.endpoint_generation
            .insert(endpoint_id.clone(), generation);

        self.spawn_address_resolution(&endpoint_id, proxy.clone(), generation);
        self.spawn_subscription(&endpoint_id, event_sub_url, generation);

        let actions = reconciler::on_endpoint_added(&self.registry, &endpoint_id);
        self.apply_reconcile_actions(actions);
    }

    fn spawn_address_resolution(&mut self, endpoint_id: &EndpointId, proxy: endpoint::EndpointProxy, generation: u64) {
        let endpoint_id_for_task = endpoint_id.clone();
        let handle = self.rpc_tasks.spawn(async move {
            let resolution = address_tracker::resolve(&proxy).await;
            RpcCompletion::AddressResolved {
                endpoint_id: endpoint_id_for_task,
                generation,
                resolution,
            }
        });
        self.address_handles.insert(endpoint_id.clone(), handle);
    }

    /// Spawns the long-running GENA subscribe/renew loop for one endpoint.
    /// Feeds `ExternalIPAddress` changes back as [Command::ExternalIpEvented]
    /// over the engine's own command channel rather than through `rpc_tasks`,
    /// since it is not a single-shot RPC.
    fn spawn_subscription(&mut self, endpoint_id: &EndpointId, event_sub_url: String, generation: u64) {
        let key = format!("{endpoint_id}#{generation}");
        let callback_url = self.callback_server.callback_url(&key);
        let callback_server = self.callback_server.clone();
        let commands = self.commands_tx.clone();
        let endpoint_id_for_task = endpoint_id.clone();

        let join_handle = tokio::spawn(async move {
            let property_rx = callback_server.register(key.clone()).await;
            run_subscription(
                endpoint_id_for_task,
                generation,
                event_sub_url,
                callback_url,
                property_rx,
                commands,
            )
            .await;
            callback_server.unregister(&key).await;
        });
        self.subscription_handles
            .insert(endpoint_id.clone(), join_handle.abort_handle());
    }

    fn handle_external_ip_evented(&mut self, endpoint_id: EndpointId, generation: u64, new_ip: Ipv4Addr) {
        if self.endpoint_generation.get(&endpoint_id) != Some(&generation) {
            return;
        }
        let current = self
            .endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.get(&endpoint_id))
            .and_then(|endpoint| endpoint.external_ip);
        let Some((new_ip, previous)) = address_tracker::apply_change(current, new_ip) else {
            return;
        };
        if let Some(endpoint) = self
            .endpoints
            .as_mut()
            .and_then(|endpoints| endpoints.get_mut(&endpoint_id))
        {
            endpoint.external_ip = Some(new_ip);
        }

        let affected: Vec<_> = self
            .installers
            .values()
            .filter(|installer| installer.key.endpoint_id == endpoint_id && installer.mapped)
            .map(|installer| {
                (
                    installer.protocol,
                    installer.actual_external_port,
                    installer.local_ip,
                    installer.local_port,
                    installer.description.clone(),
                )
            })
            .collect();
        for (protocol, external_port, local_ip, local_port, description) in affected {
            self.events.emit(EngineEvent::MappedExternalPort(MappedExternalPort {
                protocol,
                external_ip: new_ip,
                replaces_external_ip: previous,
                external_port,
                local_ip,
                local_port,
                description,
            }));
        }
    }

    async fn handle_rpc_completion(&mut self, result: Result<RpcCompletion, tokio::task::JoinError>) {
        let completion = match result {
            Ok(completion) => completion,
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::warn!("engine rpc task panicked: {e}");
                }
                return;
            }
        };

        match completion {
            RpcCompletion::AddressResolved {
                endpoint_id,
                generation,
                resolution,
            } => self.handle_address_resolved(endpoint_id, generation, resolution),
            RpcCompletion::Installed {
                key,
                generation,
                outcome,
            } => self.handle_installed(key, generation, outcome),
            RpcCompletion::Renewed {
                key,
                generation,
                result,
            } => self.handle_renewed(key, generation, result),
            RpcCompletion::Deleted { key, result } => {
                if let Err(e) = result {
                    tracing::debug!("delete_port_mapping failed for {key:?}: {e}");
                }
                self.shutdown.finish_delete();
            }
        }
    }

    fn handle_address_resolved(
        &mut self,
        endpoint_id: EndpointId,
        generation: u64,
        resolution: AddressResolution,
    ) {
        if self.endpoint_generation.get(&endpoint_id) != Some(&generation) {
            return;
        }
        self.address_handles.remove(&endpoint_id);

        match resolution {
            AddressResolution::Acquired(ip) => {
                if let Some(endpoint) = self
                    .endpoints
                    .as_mut()
                    .and_then(|endpoints| endpoints.get_mut(&endpoint_id))
                {
                    endpoint.external_ip = Some(ip);
                }
                let affected: Vec<_> = self
                    .installers
                    .values()
                    .filter(|installer| installer.key.endpoint_id == endpoint_id && installer.mapped)
                    .map(|installer| {
                        (
                            installer.protocol,
                            installer.actual_external_port,
                            installer.local_ip,
                            installer.local_port,
                            installer.description.clone(),
                        )
                    })
                    .collect();
                for (protocol, external_port, local_ip, local_port, description) in affected {
                    self.events.emit(EngineEvent::MappedExternalPort(MappedExternalPort {
                        protocol,
                        external_ip: ip,
                        replaces_external_ip: None,
                        external_port,
                        local_ip,
                        local_port,
                        description,
                    }));
                }
            }
            AddressResolution::Failed(err) => {
                if let Some(endpoint) = self
                    .endpoints
                    .as_mut()
                    .and_then(|endpoints| endpoints.get_mut(&endpoint_id))
                {
                    endpoint.external_ip_failed = true;
                }
                let affected: Vec<_> = self
                    .installers
                    .values()
                    .filter(|installer| installer.key.endpoint_id == endpoint_id)
                    .map(|installer| {
                        (
                            installer.protocol,
                            installer.requested_external_port,
                            installer.local_ip,
                            installer.local_port,
                            installer.description.clone(),
                        )
                    })
                    .collect();
                for (protocol, requested_external_port, local_ip, local_port, description) in affected {
                    self.events.emit(EngineEvent::ErrorMappingPort(ErrorMappingPort {
                        error: (&err).into(),
                        protocol,
                        requested_external_port,
                        local_ip,
                        local_port,
                        description,
                    }));
                }
            }
        }
    }

    fn handle_installed(&mut self, key: InstallerKey, generation: u64, outcome: InstallOutcome) {
        let Some(installer) = self.installers.get_mut(&key) else {
            return;
        };
        if installer.generation != generation {
            return;
        }
        self.installer_handles.remove(&key);

        match outcome {
            InstallOutcome::Installed { actual_external_port } => {
                installer.mapped = true;
                installer.actual_external_port = actual_external_port;
                let protocol = installer.protocol;
                let local_ip = installer.local_ip;
                let local_port = installer.local_port;
                let description = installer.description.clone();
                let lease_duration = installer.lease_duration;

                let endpoint_ip = self
                    .endpoints
                    .as_ref()
                    .and_then(|endpoints| endpoints.get(&key.endpoint_id))
                    .and_then(|endpoint| endpoint.external_ip);
                if let Some(ip) = endpoint_ip {
                    self.events.emit(EngineEvent::MappedExternalPort(MappedExternalPort {
                        protocol,
                        external_ip: ip,
                        replaces_external_ip: None,
                        external_port: actual_external_port,
                        local_ip,
                        local_port,
                        description,
                    }));
                }
                if lease_duration > 0 {
                    self.schedule_renewal(key);
                }
            }
            InstallOutcome::Failed(err) => {
                self.events.emit(EngineEvent::ErrorMappingPort(ErrorMappingPort {
                    error: (&err).into(),
                    protocol: installer.protocol,
                    requested_external_port: installer.requested_external_port,
                    local_ip: installer.local_ip,
                    local_port: installer.local_port,
                    description: installer.description.clone(),
                }));
            }
        }
    }

    fn handle_renewed(&mut self, key: InstallerKey, generation: u64, result: Result<(), MappingError>) {
        let Some(installer) = self.installers.get_mut(&key) else {
            return;
        };
        if installer.generation != generation {
            return;
        }
        self.installer_handles.remove(&key);

        if let Err(err) = result {
            self.events.emit(EngineEvent::ErrorMappingPort(ErrorMappingPort {
                error: (&err).into(),
                protocol: installer.protocol,
                requested_external_port: installer.requested_external_port,
                local_ip: installer.local_ip,
                local_port: installer.local_port,
                description: installer.description.clone(),
            }));
        }

        // Renewal repeats on the same cadence regardless of outcome (§4.4):
        // the timer is only ever stopped by teardown.
        if installer.lease_duration > 0 {
            self.schedule_renewal(key);
        }
    }
}

/// Runs until the property channel closes (the endpoint was torn down, which
/// drops the receiver via [CallbackServer::unregister]) or a subscribe/renew
/// call fails outright.
async fn run_subscription(
    endpoint_id: EndpointId,
    generation: u64,
    event_sub_url: String,
    callback_url: String,
    mut property_rx: mpsc::Receiver<PropertySet>,
    commands: mpsc::Sender<Command>,
) {
    let subscriber = EventSubscriber::new(reqwest::Client::new(), event_sub_url, callback_url);
    let mut subscription = match subscriber.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::debug!("gena subscribe failed for {endpoint_id}: {e}");
            return;
        }
    };

    loop {
        let renew_at = subscription.timeout / 2;
        tokio::select! {
            property_set = property_rx.recv() => {
                let Some(property_set) = property_set else { return };
                if let Some(raw) = property_set.get("ExternalIPAddress") {
                    if let Ok(new_ip) = address_tracker::parse_evented_value(raw) {
                        let _ = commands
                            .send(Command::ExternalIpEvented {
                                endpoint_id: endpoint_id.clone(),
                                generation,
                                new_ip,
                            })
                            .await;
                    }
                }
            }
            _ = tokio::time::sleep(renew_at) => {
                match subscriber.renew(&subscription.sid).await {
                    Ok(renewed) => subscription = renewed,
                    Err(e) => {
                        tracing::debug!("gena renew failed for {endpoint_id}: {e}");
                        return;
                    }
                }
            }
        }
    }
}

/// Spawns the engine onto the caller's own Tokio runtime. The caller must
/// already be running inside one; callers without a runtime of their own
/// should use [crate::thread_adaptor::EngineThread] instead.
pub async fn spawn(
    context_available: Option<ContextAvailableHandler>,
) -> anyhow::Result<(EngineHandle, tokio::task::JoinHandle<()>)> {
    Engine::spawn(context_available).await
}

pub use events::EngineEvent as Event;
