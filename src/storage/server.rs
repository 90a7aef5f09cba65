//! Storage server
//!
//! Binds the first free port at or above `base_port` (or the port pinned
//! in `server_info.json` from a previous run), registers with the
//! coordinator, then serves chunk operations while a background task
//! heartbeats liveness and capacity.

use crate::common::{
    wire, Config, CoordRequest, CoordResponse, Error, Location, Result, StorageRequest,
    StorageResponse,
};
use crate::storage::chunk_store::ChunkStore;
use crate::storage::two_phase;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const SERVER_INFO_FILE: &str = "server_info.json";
const PORT_SCAN_RANGE: u16 = 512;

/// Cached identity so a restarted server keeps its id and port.
#[derive(Debug, Serialize, Deserialize)]
struct ServerInfo {
    id: String,
    port: u16,
}

/// Stops the background loops at their next iteration. Cloneable so it
/// survives handing the server itself to `run`.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct StorageState {
    id: String,
    address: String,
    location: Location,
    space_limit: u64,
    coordinator_addr: String,
    store: Arc<Mutex<ChunkStore>>,
    rpc_timeout: Duration,
    stop: Arc<AtomicBool>,
}

pub struct StorageServer {
    listener: TcpListener,
    heartbeat_period: Duration,
    state: Arc<StorageState>,
}

impl StorageServer {
    /// Open the chunk store, bind a port, and register with the
    /// coordinator. Any failure here is fatal to startup.
    pub async fn bind(
        config: &Config,
        id: String,
        location: Location,
        space_limit_mb: Option<u64>,
    ) -> Result<Self> {
        let space_limit =
            space_limit_mb.unwrap_or(config.storage_server.space_limit_mb) * 1024 * 1024;
        let data_dir = config.storage_server.data_dir.join(&id);
        fs::create_dir_all(&data_dir)?;

        let (listener, port) =
            bind_port(&data_dir, &id, config.storage_server.base_port).await?;
        let address = format!("127.0.0.1:{}", port);

        let store = ChunkStore::open(&data_dir, space_limit)?;

        tracing::info!("storage server {} listening on {}", id, address);
        tracing::info!("  data dir: {}", data_dir.display());
        tracing::info!("  space limit: {}", crate::common::format_bytes(space_limit));

        let state = Arc::new(StorageState {
            id: id.clone(),
            address: address.clone(),
            location,
            space_limit,
            coordinator_addr: config.coordinator_addr(),
            store: Arc::new(Mutex::new(store)),
            rpc_timeout: config.request_timeout(),
            stop: Arc::new(AtomicBool::new(false)),
        });

        // Register before serving; a coordinator that cannot be reached at
        // startup is a fatal configuration problem.
        let request = CoordRequest::RegisterStorageServer {
            id,
            address,
            location,
            space_limit,
        };
        match wire::call::<_, CoordResponse>(&state.coordinator_addr, &request, state.rpc_timeout)
            .await?
        {
            CoordResponse::Ok => {}
            CoordResponse::Error { kind, message } => {
                return Err(Error::from_wire(kind, message))
            }
            other => {
                return Err(Error::Internal(format!(
                    "unexpected registration response: {:?}",
                    other
                )))
            }
        }

        Ok(Self {
            listener,
            heartbeat_period: Duration::from_secs(config.storage_server.heartbeat_interval),
            state,
        })
    }

    /// The address advertised to the coordinator.
    pub fn address(&self) -> String {
        self.state.address.clone()
    }

    /// Handle for stopping the heartbeat loop after `run` takes ownership.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.state.stop.clone(),
        }
    }

    /// Serve until the process exits.
    pub async fn run(self) -> Result<()> {
        tokio::spawn(heartbeat_loop(self.state.clone(), self.heartbeat_period));

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

/// Reuse the port pinned by a previous run when possible, otherwise scan
/// upward from `base_port` and pin the result.
async fn bind_port(data_dir: &Path, id: &str, base_port: u16) -> Result<(TcpListener, u16)> {
    let info_path = data_dir.join(SERVER_INFO_FILE);

    if info_path.exists() {
        let content = fs::read_to_string(&info_path)?;
        match serde_json::from_str::<ServerInfo>(&content) {
            Ok(info) if info.id == id => {
                match TcpListener::bind(("127.0.0.1", info.port)).await {
                    Ok(listener) => return Ok((listener, info.port)),
                    Err(e) => {
                        tracing::warn!(port = info.port, "pinned port unavailable ({}), rescanning", e)
                    }
                }
            }
            Ok(info) => {
                tracing::warn!(
                    "server_info.json belongs to {}, ignoring for {}",
                    info.id,
                    id
                );
            }
            Err(e) => tracing::warn!("unreadable server_info.json ({}), rescanning", e),
        }
    }

    for candidate in base_port..base_port.saturating_add(PORT_SCAN_RANGE) {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", candidate)).await {
            // Port 0 asks the OS for an ephemeral port; pin whatever the
            // listener actually got.
            let port = listener.local_addr()?.port();
            let info = ServerInfo {
                id: id.to_string(),
                port,
            };
            let content = serde_json::to_string_pretty(&info)
                .map_err(|e| Error::Internal(format!("serialize server info: {}", e)))?;
            fs::write(&info_path, content)?;
            return Ok((listener, port));
        }
    }

    Err(Error::InvalidConfig(format!(
        "no free port in {}..{}",
        base_port,
        base_port.saturating_add(PORT_SCAN_RANGE)
    )))
}

/// Periodic liveness and capacity report. Carries location and space limit
/// so an expired record is re-registered in place; a failed send is logged
/// and the next tick resumes.
async fn heartbeat_loop(state: Arc<StorageState>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if state.stop.load(Ordering::SeqCst) {
            return;
        }

        let used_bytes = match state.store.lock().unwrap().rescan() {
            Ok(used) => used,
            Err(e) => {
                tracing::error!("space rescan failed: {}", e);
                continue;
            }
        };

        let request = CoordRequest::Heartbeat {
            address: state.address.clone(),
            used_bytes,
            location: Some(state.location),
            space_limit: Some(state.space_limit),
        };
        match wire::call::<_, CoordResponse>(&state.coordinator_addr, &request, state.rpc_timeout)
            .await
        {
            Ok(CoordResponse::Ok) => {
                tracing::debug!(id = %state.id, "heartbeat sent ({} used)", used_bytes)
            }
            Ok(other) => tracing::warn!("unexpected heartbeat response: {:?}", other),
            Err(e) => tracing::warn!("heartbeat failed: {}", e),
        }
    }
}

async fn handle_connection(state: Arc<StorageState>, mut stream: TcpStream) {
    loop {
        match wire::recv::<_, StorageRequest>(&mut stream).await {
            Ok(Some(request)) => {
                let response = dispatch(&state, request).await;
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

fn error_response(e: Error) -> StorageResponse {
    let (kind, message) = e.to_wire();
    StorageResponse::Error { kind, message }
}

async fn dispatch(state: &Arc<StorageState>, request: StorageRequest) -> StorageResponse {
    match request {
        StorageRequest::StoreChunk {
            chunk_id,
            file_path,
            data,
            replica_servers,
            client_id,
        } => {
            tracing::info!(
                %chunk_id,
                %file_path,
                %client_id,
                size = data.len(),
                replicas = replica_servers.len(),
                "store chunk as primary"
            );
            match two_phase::store_primary(
                &state.store,
                &state.address,
                &chunk_id,
                &data,
                &replica_servers,
                state.rpc_timeout,
            )
            .await
            {
                Ok(committed) => StorageResponse::Stored { committed },
                Err(e) => error_response(e),
            }
        }

        StorageRequest::PrepareChunk { chunk_id, data } => {
            match state.store.lock().unwrap().prepare(&chunk_id, &data) {
                Ok(()) => StorageResponse::Ok,
                Err(e) => error_response(e),
            }
        }

        StorageRequest::PrepareAppend {
            chunk_id,
            data,
            offset,
        } => match state
            .store
            .lock()
            .unwrap()
            .prepare_append(&chunk_id, &data, offset)
        {
            Ok(()) => StorageResponse::Ok,
            Err(e) => error_response(e),
        },

        StorageRequest::CommitChunk { chunk_id } => {
            match state.store.lock().unwrap().commit(&chunk_id) {
                Ok(()) => StorageResponse::Ok,
                Err(e) => error_response(e),
            }
        }

        StorageRequest::RollbackChunk { chunk_id } => {
            match state.store.lock().unwrap().rollback(&chunk_id) {
                Ok(()) => StorageResponse::Ok,
                Err(e) => error_response(e),
            }
        }

        StorageRequest::RetrieveChunk {
            chunk_id,
            offset,
            length,
        } => match state.store.lock().unwrap().retrieve(&chunk_id, offset, length) {
            Ok(data) => StorageResponse::Chunk { data },
            Err(e) => error_response(e),
        },

        StorageRequest::AppendChunk {
            chunk_id,
            file_path,
            data,
            offset,
            replica_servers,
        } => {
            tracing::info!(
                %chunk_id,
                %file_path,
                size = data.len(),
                offset,
                "append to chunk as primary"
            );
            let (committed, new_offset) = match two_phase::append_primary(
                &state.store,
                &state.address,
                &chunk_id,
                &data,
                offset,
                &replica_servers,
                state.rpc_timeout,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => return error_response(e),
            };

            // Phase 2 ends with the primary reporting the new tail offset.
            // A stale-offset rejection means a concurrent appender won; the
            // caller retries against the fresh tail.
            let request = CoordRequest::UpdateChunkOffset {
                path: file_path,
                chunk_id,
                new_offset,
            };
            match wire::call::<_, CoordResponse>(
                &state.coordinator_addr,
                &request,
                state.rpc_timeout,
            )
            .await
            {
                Ok(CoordResponse::Ok) => StorageResponse::Appended {
                    committed,
                    new_offset,
                },
                Ok(CoordResponse::Error { kind, message }) => {
                    error_response(Error::from_wire(kind, message))
                }
                Ok(other) => {
                    error_response(Error::Internal(format!("unexpected response: {:?}", other)))
                }
                Err(e) => error_response(e),
            }
        }

        StorageRequest::ReplicateChunk { chunk_id, targets } => {
            tracing::info!(%chunk_id, targets = targets.len(), "replicating chunk");
            match two_phase::replicate(&state.store, &chunk_id, &targets, state.rpc_timeout).await
            {
                Ok(committed) => StorageResponse::Stored { committed },
                Err(e) => error_response(e),
            }
        }
    }
}
