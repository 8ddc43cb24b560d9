//! Thread adaptor: runs the engine on a dedicated OS thread with its own
//! single-threaded Tokio runtime, for callers with no `tokio::Runtime` of
//! their own to drive it on.
//!
//! Grounded in `gupnp-simple-igd-thread.c`: that wrapper posts each call onto
//! the engine's `GMainContext` via an idle source and, for `add_port`/
//! `remove_port`, never waits for the result. [tokio::runtime::Handle::block_on]
//! is this crate's analogue of the idle-source-plus-condition-variable handoff
//! the original uses when it *does* need to wait — teardown.

use std::{
    net::Ipv4Addr,
    sync::mpsc as std_mpsc,
    thread::{JoinHandle, ThreadId},
};

use crate::engine::{
    events::{ContextAvailableHandler, EngineEvent},
    registry::{Protocol, RegistryError},
    Engine, EngineHandle,
};

/// The engine, its own OS thread, and the single-threaded runtime driving it.
pub struct EngineThread {
    handle: EngineHandle,
    runtime: tokio::runtime::Handle,
    worker_id: ThreadId,
    join_handle: Option<JoinHandle<()>>,
}

impl EngineThread {
    /// Spawns the worker thread, builds a current-thread runtime on it, and
    /// blocks the calling thread only until the engine has bound its sockets
    /// (not for the engine's lifetime).
    pub fn spawn(context_available: Option<ContextAvailableHandler>) -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) =
            std_mpsc::channel::<anyhow::Result<(EngineHandle, tokio::runtime::Handle)>>();

        let join_handle = std::thread::Builder::new()
            .name("igd-portmap".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                let spawned = runtime.block_on(Engine::spawn(context_available));
                let (engine_handle, engine_join) = match spawned {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx
                    .send(Ok((engine_handle, runtime.handle().clone())))
                    .is_err()
                {
                    // Spawner gave up waiting; still run the engine to
                    // completion so in-flight mappings get torn down.
                }
                let _ = runtime.block_on(engine_join);
            })?;

        let worker_id = join_handle.thread().id();
        let (handle, runtime) = ready_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("engine thread exited before it finished starting"))??;

        Ok(Self {
            handle,
            runtime,
            worker_id,
            join_handle: Some(join_handle),
        })
    }

    fn on_worker_thread(&self) -> bool {
        std::thread::current().id() == self.worker_id
    }

    /// Fire-and-forget, like the original's idle-source dispatch: the caller
    /// never learns whether the mapping validated, matching
    /// `gupnp_simple_igd_thread_add_port`'s `void` signature.
    #[allow(clippy::too_many_arguments)]
    pub fn add_port(
        &self,
        protocol: Protocol,
        external_port: u16,
        local_ip: Ipv4Addr,
        local_port: u16,
        lease_duration: u32,
        description: Option<String>,
    ) {
        let handle = self.handle.clone();
        self.runtime.spawn(async move {
            if let Err(e) = handle
                .add_port(
                    protocol,
                    external_port,
                    local_ip,
                    local_port,
                    lease_duration,
                    description,
                )
                .await
            {
                tracing::debug!("add_port rejected: {e}");
            }
        });
    }

    pub fn remove_port(&self, protocol: Protocol, external_port: u16) {
        let handle = self.handle.clone();
        self.runtime
            .spawn(async move { handle.remove_port(protocol, external_port).await });
    }

    pub fn remove_port_local(&self, protocol: Protocol, local_ip: Ipv4Addr, local_port: u16) {
        let handle = self.handle.clone();
        self.runtime.spawn(async move {
            handle
                .remove_port_local(protocol, local_ip, local_port)
                .await
        });
    }

    /// Deletes every mapping and reports whether teardown is already
    /// drained. Mirrors `gupnp_simple_igd_thread_dispose`'s "conservative"
    /// handshake: called from a foreign thread, this blocks for the real
    /// answer; called re-entrantly from the worker thread itself (e.g. from
    /// inside an event callback), blocking would deadlock the runtime on
    /// itself, so it dispatches without waiting and optimistically reports
    /// drained — the real drain still runs, just observed asynchronously.
    pub fn delete_all_mappings(&self) -> bool {
        let handle = self.handle.clone();
        if self.on_worker_thread() {
            self.runtime
                .spawn(async move { handle.delete_all_mappings().await });
            return true;
        }
        self.runtime
            .block_on(async move { handle.delete_all_mappings().await })
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.handle.subscribe_events()
    }
}

impl Drop for EngineThread {
    fn drop(&mut self) {
        let handle = self.handle.clone();
        if self.on_worker_thread() {
            // Re-entrant drop from inside the engine's own thread: neither
            // block on it nor join it from itself. The home task's own
            // drain-then-stop logic finishes the job once this task runs.
            self.runtime.spawn(async move { handle.shutdown().await });
            return;
        }
        self.runtime
            .block_on(async move { handle.shutdown().await });
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}
