//! Primary-driven two-phase commit
//!
//! The primary prepares locally, fans prepares out to the replica set in
//! parallel, and only then commits. Any prepare failure rolls everything
//! back and fails the write; commit failures on individual replicas merely
//! shrink the returned success set (at least one commit = success, the
//! repair loop restores the target count later).

use crate::common::{wire, Error, Result, StorageRequest, StorageResponse};
use crate::storage::chunk_store::ChunkStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

/// Outcome of one remote phase-1 call.
struct PrepareResult {
    address: String,
    result: Result<()>,
}

async fn send_phase(
    address: &str,
    request: &StorageRequest,
    timeout: Duration,
) -> Result<()> {
    match wire::call::<_, StorageResponse>(address, request, timeout).await? {
        StorageResponse::Ok => Ok(()),
        StorageResponse::Error { kind, message } => Err(Error::from_wire(kind, message)),
        other => Err(Error::Internal(format!("unexpected response: {:?}", other))),
    }
}

/// Fan a prepare request out to every replica in parallel.
async fn prepare_replicas(
    replicas: &[String],
    make_request: impl Fn() -> StorageRequest,
    timeout: Duration,
) -> Vec<PrepareResult> {
    let mut set = JoinSet::new();
    for address in replicas {
        let address = address.clone();
        let request = make_request();
        set.spawn(async move {
            let result = send_phase(&address, &request, timeout).await;
            PrepareResult { address, result }
        });
    }

    let mut results = Vec::with_capacity(replicas.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!("prepare task panicked: {}", e),
        }
    }
    results
}

async fn rollback_replicas(chunk_id: &str, addresses: &[String], timeout: Duration) {
    for address in addresses {
        let request = StorageRequest::RollbackChunk {
            chunk_id: chunk_id.to_string(),
        };
        if let Err(e) = send_phase(address, &request, timeout).await {
            tracing::warn!(%chunk_id, %address, "rollback failed: {}", e);
        }
    }
}

/// Commit on each replica; failures shrink the success set.
async fn commit_replicas(
    chunk_id: &str,
    addresses: &[String],
    timeout: Duration,
    committed: &mut Vec<String>,
) {
    for address in addresses {
        let request = StorageRequest::CommitChunk {
            chunk_id: chunk_id.to_string(),
        };
        match send_phase(address, &request, timeout).await {
            Ok(()) => committed.push(address.clone()),
            Err(e) => {
                tracing::warn!(%chunk_id, %address, "replica commit failed, excluding: {}", e)
            }
        }
    }
}

/// Run the write 2PC as primary: `{self} ∪ replicas`. Returns the set of
/// servers that committed the payload.
pub async fn store_primary(
    store: &Arc<Mutex<ChunkStore>>,
    self_address: &str,
    chunk_id: &str,
    data: &[u8],
    replicas: &[String],
    timeout: Duration,
) -> Result<Vec<String>> {
    // Phase 1, local first.
    if let Err(e) = store.lock().unwrap().prepare(chunk_id, data) {
        tracing::warn!(%chunk_id, "local prepare failed: {}", e);
        let _ = store.lock().unwrap().rollback(chunk_id);
        return Err(e);
    }

    // Phase 1, replicas in parallel.
    let data_owned = data.to_vec();
    let results = prepare_replicas(
        replicas,
        || StorageRequest::PrepareChunk {
            chunk_id: chunk_id.to_string(),
            data: data_owned.clone(),
        },
        timeout,
    )
    .await;

    let prepared: Vec<String> = results
        .iter()
        .filter(|r| r.result.is_ok())
        .map(|r| r.address.clone())
        .collect();
    if let Some(failed) = results.into_iter().find(|r| r.result.is_err()) {
        let err = failed.result.unwrap_err();
        tracing::warn!(%chunk_id, node = %failed.address, "replica prepare failed: {}", err);
        rollback_replicas(chunk_id, &prepared, timeout).await;
        let _ = store.lock().unwrap().rollback(chunk_id);
        return Err(err);
    }

    // Phase 2: local commit, then replicas.
    let mut committed = Vec::with_capacity(replicas.len() + 1);
    match store.lock().unwrap().commit(chunk_id) {
        Ok(()) => committed.push(self_address.to_string()),
        Err(e) => tracing::error!(%chunk_id, "local commit failed: {}", e),
    }
    commit_replicas(chunk_id, &prepared, timeout, &mut committed).await;

    if committed.is_empty() {
        return Err(Error::Internal(format!(
            "no server committed chunk {}",
            chunk_id
        )));
    }
    Ok(committed)
}

/// Run the append 2PC as primary. Returns the commit set and the new tail
/// offset.
pub async fn append_primary(
    store: &Arc<Mutex<ChunkStore>>,
    self_address: &str,
    chunk_id: &str,
    data: &[u8],
    offset: u64,
    replicas: &[String],
    timeout: Duration,
) -> Result<(Vec<String>, u64)> {
    if let Err(e) = store.lock().unwrap().prepare_append(chunk_id, data, offset) {
        tracing::warn!(%chunk_id, "local append prepare failed: {}", e);
        let _ = store.lock().unwrap().rollback(chunk_id);
        return Err(e);
    }

    let data_owned = data.to_vec();
    let results = prepare_replicas(
        replicas,
        || StorageRequest::PrepareAppend {
            chunk_id: chunk_id.to_string(),
            data: data_owned.clone(),
            offset,
        },
        timeout,
    )
    .await;

    let prepared: Vec<String> = results
        .iter()
        .filter(|r| r.result.is_ok())
        .map(|r| r.address.clone())
        .collect();
    if let Some(failed) = results.into_iter().find(|r| r.result.is_err()) {
        let err = failed.result.unwrap_err();
        tracing::warn!(%chunk_id, node = %failed.address, "replica append prepare failed: {}", err);
        rollback_replicas(chunk_id, &prepared, timeout).await;
        let _ = store.lock().unwrap().rollback(chunk_id);
        return Err(err);
    }

    let mut committed = Vec::with_capacity(replicas.len() + 1);
    match store.lock().unwrap().commit(chunk_id) {
        Ok(()) => committed.push(self_address.to_string()),
        Err(e) => tracing::error!(%chunk_id, "local append commit failed: {}", e),
    }
    commit_replicas(chunk_id, &prepared, timeout, &mut committed).await;

    if committed.is_empty() {
        return Err(Error::Internal(format!(
            "no server committed append to {}",
            chunk_id
        )));
    }
    Ok((committed, offset + data.len() as u64))
}

/// Repair push: read the local committed payload and drive a 2PC onto
/// `targets`. This server acts as source only; the returned set contains
/// targets that committed.
pub async fn replicate(
    store: &Arc<Mutex<ChunkStore>>,
    chunk_id: &str,
    targets: &[String],
    timeout: Duration,
) -> Result<Vec<String>> {
    let data = store.lock().unwrap().retrieve(chunk_id, None, None)?;

    let results = prepare_replicas(
        targets,
        || StorageRequest::PrepareChunk {
            chunk_id: chunk_id.to_string(),
            data: data.clone(),
        },
        timeout,
    )
    .await;

    let prepared: Vec<String> = results
        .iter()
        .filter(|r| r.result.is_ok())
        .map(|r| r.address.clone())
        .collect();
    if let Some(failed) = results.into_iter().find(|r| r.result.is_err()) {
        let err = failed.result.unwrap_err();
        tracing::warn!(%chunk_id, node = %failed.address, "replication prepare failed: {}", err);
        rollback_replicas(chunk_id, &prepared, timeout).await;
        return Err(err);
    }

    let mut committed = Vec::with_capacity(targets.len());
    commit_replicas(chunk_id, &prepared, timeout, &mut committed).await;

    if committed.is_empty() {
        return Err(Error::Internal(format!(
            "no target committed replica of {}",
            chunk_id
        )));
    }
    Ok(committed)
}
