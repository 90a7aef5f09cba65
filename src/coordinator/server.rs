//! Coordinator server
//!
//! One TCP listener, one spawned task per connection, plus the two
//! background control loops: the membership reaper (expires silent storage
//! servers and strips them from chunk locations) and the replication
//! repair worker (pushes under-replicated chunks back toward the target
//! replica count).

use crate::common::{
    wire, Config, CoordRequest, CoordResponse, Error, Location, Result, StorageRequest,
    StorageResponse,
};
use crate::coordinator::metadata::{MetadataStore, RepairTask};
use crate::coordinator::placement::PlacementEngine;
use crate::coordinator::registry::{HeartbeatOutcome, Registry};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Stops the control loops at their next iteration. Cloneable so it
/// survives handing the coordinator itself to `run`.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct CoordState {
    metadata: MetadataStore,
    registry: Registry,
    placement: PlacementEngine,
    replication_factor: usize,
    rpc_timeout: Duration,
    repair_kick: Notify,
    stop: Arc<AtomicBool>,
}

pub struct Coordinator {
    listener: TcpListener,
    loop_period: Duration,
    state: Arc<CoordState>,
}

impl Coordinator {
    /// Open the metadata store and bind the listen socket. Corrupt metadata
    /// or an occupied port fail here, before any background work starts.
    pub async fn bind(config: Config) -> Result<Self> {
        let metadata = MetadataStore::open(
            &config.coordinator.metadata_dir,
            config.coordinator.replication_factor,
        )?;
        let listener = TcpListener::bind(config.coordinator_addr()).await?;

        tracing::info!("coordinator listening on {}", listener.local_addr()?);
        tracing::info!("  metadata dir: {}", config.coordinator.metadata_dir.display());
        tracing::info!("  chunk size: {}", crate::common::format_bytes(config.coordinator.chunk_size));
        tracing::info!("  replication factor: {}", config.coordinator.replication_factor);

        let state = Arc::new(CoordState {
            metadata,
            registry: Registry::new(),
            placement: PlacementEngine::new(&config.coordinator),
            replication_factor: config.coordinator.replication_factor,
            rpc_timeout: config.request_timeout(),
            repair_kick: Notify::new(),
            stop: Arc::new(AtomicBool::new(false)),
        });

        Ok(Self {
            listener,
            loop_period: Duration::from_secs(config.storage_server.heartbeat_interval),
            state,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for stopping the control loops after `run` takes ownership.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.state.stop.clone(),
        }
    }

    /// Serve until the process exits.
    pub async fn run(self) -> Result<()> {
        tokio::spawn(reaper_loop(self.state.clone(), self.loop_period));
        tokio::spawn(repair_loop(self.state.clone(), self.loop_period));

        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::debug!(%peer, "accepted connection");
            let state = self.state.clone();
            tokio::spawn(async move {
                handle_connection(state, stream).await;
            });
        }
    }
}

async fn handle_connection(state: Arc<CoordState>, mut stream: TcpStream) {
    loop {
        match wire::recv::<_, CoordRequest>(&mut stream).await {
            Ok(Some(request)) => {
                let response = dispatch(&state, request);
                if let Err(e) = wire::send(&mut stream, &response).await {
                    tracing::debug!("failed to send response: {}", e);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("dropping connection: {}", e);
                break;
            }
        }
    }
}

fn error_response(e: Error) -> CoordResponse {
    let (kind, message) = e.to_wire();
    CoordResponse::Error { kind, message }
}

fn dispatch(state: &CoordState, request: CoordRequest) -> CoordResponse {
    match request {
        CoordRequest::RegisterStorageServer {
            id,
            address,
            location,
            space_limit,
        } => {
            state.registry.register_server(id, address, location, space_limit);
            // A fresh server may be able to absorb queued repairs.
            state.repair_kick.notify_one();
            CoordResponse::Ok
        }

        CoordRequest::RegisterClient { id, location } => {
            state.registry.register_client(id, location);
            CoordResponse::Ok
        }

        CoordRequest::Heartbeat {
            address,
            used_bytes,
            location,
            space_limit,
        } => {
            let outcome = state
                .registry
                .heartbeat(&address, used_bytes, location, space_limit);
            if outcome == HeartbeatOutcome::Registered {
                state.repair_kick.notify_one();
            }
            CoordResponse::Ok
        }

        CoordRequest::GetChunkServers {
            client_id,
            needed_bytes,
        } => {
            let location = client_location(state, &client_id);
            let candidates = state.registry.live_servers();
            let ranked = state.placement.top_k(location, &candidates, needed_bytes);
            if ranked.is_empty() {
                return error_response(Error::NoServersAvailable);
            }
            let servers: Vec<String> = ranked.into_iter().map(|r| r.address).collect();
            state.registry.set_client_ranking(&client_id, servers.clone());
            CoordResponse::ChunkServers { servers }
        }

        CoordRequest::GetReplicaLocations {
            client_id,
            chunk_id,
            size,
            exclude,
        } => {
            let location = client_location(state, &client_id);
            let excluded: HashSet<&String> = exclude.iter().collect();
            let candidates: Vec<_> = state
                .registry
                .live_servers()
                .into_iter()
                .filter(|s| !excluded.contains(&s.address))
                .collect();
            let wanted = state.replication_factor.saturating_sub(exclude.len());
            let mut ranked = state.placement.rank(location, &candidates, size);
            ranked.truncate(wanted);
            tracing::debug!(%chunk_id, found = ranked.len(), "replica candidates");
            CoordResponse::ReplicaLocations {
                servers: ranked.into_iter().map(|r| r.address).collect(),
            }
        }

        CoordRequest::AddFile {
            path,
            size,
            chunk_ids,
        } => match state.metadata.add_file(&path, size, chunk_ids) {
            Ok(()) => CoordResponse::Ok,
            Err(e) => error_response(e),
        },

        CoordRequest::UpdateFileMetadata {
            path,
            chunk_id,
            locations,
            size_delta,
        } => {
            // Only record servers the coordinator currently considers live.
            let live: HashSet<String> = state
                .registry
                .live_servers()
                .into_iter()
                .map(|s| s.address)
                .collect();
            let locations: Vec<String> =
                locations.into_iter().filter(|a| live.contains(a)).collect();
            match state
                .metadata
                .update_file_metadata(&path, &chunk_id, locations, size_delta)
            {
                Ok(()) => CoordResponse::Ok,
                Err(e) => error_response(e),
            }
        }

        CoordRequest::UpdateChunkOffset {
            path,
            chunk_id,
            new_offset,
        } => match state.metadata.update_chunk_offset(&path, &chunk_id, new_offset) {
            Ok(()) => CoordResponse::Ok,
            Err(e) => error_response(e),
        },

        CoordRequest::GetFileMetadata { path } => CoordResponse::FileMetadata {
            entry: state.metadata.get_file(&path),
        },

        CoordRequest::ListFiles { prefix } => CoordResponse::Files {
            files: state.metadata.list_files(prefix.as_deref()),
        },

        CoordRequest::GetGraphData => CoordResponse::Graph {
            data: state.registry.graph_data(),
        },
    }
}

fn client_location(state: &CoordState, client_id: &str) -> Location {
    state.registry.client_location(client_id).unwrap_or_else(|| {
        tracing::debug!(%client_id, "ranking for unregistered client, assuming origin");
        Location::new(0.0, 0.0)
    })
}

/// Control loop #1: expire storage servers that have missed three
/// heartbeat intervals, strip them from chunk locations, and queue the
/// resulting deficits for repair.
async fn reaper_loop(state: Arc<CoordState>, period: Duration) {
    let threshold = period * 3;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if state.stop.load(Ordering::SeqCst) {
            return;
        }
        let dead = state.registry.expire(threshold);
        let mut queued = 0;
        for address in &dead {
            match state.metadata.strip_server(address) {
                Ok(n) => queued += n,
                Err(e) => tracing::error!(%address, "failed to strip dead server: {}", e),
            }
        }
        if queued > 0 {
            tracing::info!(servers = dead.len(), chunks = queued, "queued repairs for dead servers");
            state.repair_kick.notify_one();
        }
    }
}

/// Control loop #2: drive observed replica counts toward the target.
/// Re-running on a chunk already at target is a no-op because deficits are
/// recomputed from the committed locations on every update.
async fn repair_loop(state: Arc<CoordState>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = state.repair_kick.notified() => {}
        }
        if state.stop.load(Ordering::SeqCst) {
            return;
        }
        repair_pass(&state).await;
    }
}

async fn repair_pass(state: &Arc<CoordState>) {
    // Snapshot the work list; the metadata lock is never held across the
    // replicate_chunk calls below.
    let tasks = state.metadata.pending_work();
    if tasks.is_empty() {
        return;
    }
    tracing::debug!(chunks = tasks.len(), "repair pass");

    for task in tasks {
        if let Err(e) = repair_chunk(state, &task).await {
            tracing::warn!(
                chunk_id = %task.chunk_id,
                path = %task.path,
                "repair attempt failed, will retry: {}",
                e
            );
        }
    }
}

async fn repair_chunk(state: &Arc<CoordState>, task: &RepairTask) -> Result<()> {
    let live: HashSet<String> = state
        .registry
        .live_servers()
        .into_iter()
        .map(|s| s.address)
        .collect();

    let holders: Vec<&String> = task.holders.iter().filter(|h| live.contains(*h)).collect();
    let source = match holders.first() {
        Some(source) => (*source).clone(),
        None => {
            // Every replica is gone; nothing the repair loop can do.
            tracing::error!(chunk_id = %task.chunk_id, path = %task.path, "chunk has no live holder, data lost");
            return Ok(());
        }
    };

    // Rank candidates from the source's position: replicas land near the
    // surviving copy, which is also the cheapest transfer.
    let source_location = state
        .registry
        .get_server(&source)
        .map(|s| s.location)
        .unwrap_or_else(|| Location::new(0.0, 0.0));
    let holder_set: HashSet<&String> = task.holders.iter().collect();
    let candidates: Vec<_> = state
        .registry
        .live_servers()
        .into_iter()
        .filter(|s| !holder_set.contains(&s.address))
        .collect();
    let mut ranked = state.placement.rank(source_location, &candidates, task.size);
    ranked.truncate(task.deficit);
    if ranked.is_empty() {
        tracing::debug!(chunk_id = %task.chunk_id, "no eligible repair targets this tick");
        return Ok(());
    }
    let targets: Vec<String> = ranked.into_iter().map(|r| r.address).collect();

    let request = StorageRequest::ReplicateChunk {
        chunk_id: task.chunk_id.clone(),
        targets,
    };
    match wire::call::<_, StorageResponse>(&source, &request, state.rpc_timeout).await? {
        StorageResponse::Stored { committed } if !committed.is_empty() => {
            tracing::info!(
                chunk_id = %task.chunk_id,
                source = %source,
                replicas = committed.len(),
                "repaired chunk"
            );
            state
                .metadata
                .complete_replication(&task.path, &task.chunk_id, committed)
        }
        StorageResponse::Stored { .. } => Err(Error::Internal("no target committed".into())),
        StorageResponse::Error { kind, message } => Err(Error::from_wire(kind, message)),
        other => Err(Error::Internal(format!("unexpected response: {:?}", other))),
    }
}
