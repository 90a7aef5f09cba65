//! Client library
//!
//! Splits files into chunks, consults the coordinator for placement,
//! drives two-phase writes through a chosen primary, and reassembles
//! files on read. Every operation opens fresh connections; failures on a
//! single storage server fail over to the next-ranked alternative, and
//! whole attempts retry with exponential backoff and re-ranking.

use crate::common::{
    mint_chunk_id, retry_with_backoff, wire, Config, CoordRequest, CoordResponse, Error,
    FileEntry, Location, Result, StorageRequest, StorageResponse,
};
use std::path::Path;
use std::time::Duration;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

pub struct Client {
    id: String,
    location: Location,
    coordinator_addr: String,
    chunk_size: u64,
    max_retries: usize,
    rpc_timeout: Duration,
}

impl Client {
    /// Register with the coordinator and return a ready client.
    pub async fn connect(config: &Config, id: String, location: Location) -> Result<Self> {
        let client = Self {
            id: id.clone(),
            location,
            coordinator_addr: config.coordinator_addr(),
            chunk_size: config.client.upload_chunk_size,
            max_retries: config.client.max_retries,
            rpc_timeout: config.request_timeout(),
        };
        client
            .coord(&CoordRequest::RegisterClient { id, location })
            .await?;
        Ok(client)
    }

    async fn coord(&self, request: &CoordRequest) -> Result<CoordResponse> {
        let response: CoordResponse =
            wire::call(&self.coordinator_addr, request, self.rpc_timeout).await?;
        if let CoordResponse::Error { kind, message } = response {
            return Err(Error::from_wire(kind, message));
        }
        Ok(response)
    }

    async fn storage(&self, address: &str, request: &StorageRequest) -> Result<StorageResponse> {
        let response: StorageResponse = wire::call(address, request, self.rpc_timeout).await?;
        if let StorageResponse::Error { kind, message } = response {
            return Err(Error::from_wire(kind, message));
        }
        Ok(response)
    }

    async fn get_file_metadata(&self, path: &str) -> Result<Option<FileEntry>> {
        match self
            .coord(&CoordRequest::GetFileMetadata {
                path: path.to_string(),
            })
            .await?
        {
            CoordResponse::FileMetadata { entry } => Ok(entry),
            other => Err(Error::Internal(format!("unexpected response: {:?}", other))),
        }
    }

    /// Live servers ranked for this client; used to pick read sources and
    /// append primaries among a chunk's holders.
    async fn ranking(&self, needed_bytes: u64) -> Result<Vec<String>> {
        match self
            .coord(&CoordRequest::GetChunkServers {
                client_id: self.id.clone(),
                needed_bytes,
            })
            .await?
        {
            CoordResponse::ChunkServers { servers } => Ok(servers),
            other => Err(Error::Internal(format!("unexpected response: {:?}", other))),
        }
    }

    /// Order `holders` by the coordinator's current ranking for this
    /// client, falling back to metadata order for unranked entries.
    fn order_by_ranking(holders: &[String], ranking: &[String]) -> Vec<String> {
        let mut ordered = holders.to_vec();
        ordered.sort_by_key(|h| ranking.iter().position(|r| r == h).unwrap_or(usize::MAX));
        ordered
    }

    /// Upload a local file, splitting it into chunks of `chunk_size`.
    pub async fn upload(&self, local_path: impl AsRef<Path>, remote_path: &str) -> Result<()> {
        let data = std::fs::read(local_path)?;
        tracing::info!(
            remote_path,
            size = data.len(),
            "uploading {} chunk(s)",
            data.len().div_ceil(self.chunk_size.max(1) as usize)
        );

        let mut committed_chunks: Vec<String> = Vec::new();
        for (index, chunk) in data.chunks(self.chunk_size as usize).enumerate() {
            match self.store_new_chunk(remote_path, index, chunk).await {
                Ok(chunk_id) => committed_chunks.push(chunk_id),
                Err(e) if committed_chunks.is_empty() => return Err(e),
                Err(e) => {
                    // Earlier chunks stay committed; surface what landed.
                    tracing::error!(remote_path, index, "upload failed mid-file: {}", e);
                    return Err(Error::PartialFailure {
                        committed_chunks,
                        failed_chunk: format!("{}#{}", remote_path, index),
                    });
                }
            }
        }

        // The commit path creates the entry incrementally; only an empty
        // file still needs one.
        if self.get_file_metadata(remote_path).await?.is_none() {
            self.coord(&CoordRequest::AddFile {
                path: remote_path.to_string(),
                size: data.len() as u64,
                chunk_ids: committed_chunks,
            })
            .await?;
        }

        tracing::info!(remote_path, "upload complete");
        Ok(())
    }

    /// Mint an id, rank placements, and drive one chunk write to a commit,
    /// retrying with backoff. Returns the committed chunk id.
    async fn store_new_chunk(&self, path: &str, index: usize, data: &[u8]) -> Result<String> {
        let mut excluded: Vec<String> = Vec::new();
        let mut delay = RETRY_BASE_DELAY;
        let mut last_err = Error::NoServersAvailable;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            // Re-rank every attempt; ids are minted fresh so a retry never
            // collides with a half-committed predecessor.
            let chunk_id = mint_chunk_id(path, index);
            let servers = match self.ranking(data.len() as u64).await {
                Ok(servers) => servers,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let servers: Vec<String> = servers
                .into_iter()
                .filter(|s| !excluded.contains(s))
                .collect();
            if servers.is_empty() {
                last_err = Error::NoServersAvailable;
                continue;
            }

            // Failover within the ranked set: each eligible server gets a
            // turn as primary before the next backoff round.
            for (i, primary) in servers.iter().enumerate() {
                let replicas: Vec<String> = servers
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, s)| s.clone())
                    .collect();
                let request = StorageRequest::StoreChunk {
                    chunk_id: chunk_id.clone(),
                    file_path: path.to_string(),
                    data: data.to_vec(),
                    replica_servers: replicas,
                    client_id: self.id.clone(),
                };
                match self.storage(primary, &request).await {
                    Ok(StorageResponse::Stored { committed }) => {
                        self.coord(&CoordRequest::UpdateFileMetadata {
                            path: path.to_string(),
                            chunk_id: chunk_id.clone(),
                            locations: committed,
                            size_delta: data.len() as u64,
                        })
                        .await?;
                        return Ok(chunk_id);
                    }
                    Ok(other) => {
                        last_err = Error::Internal(format!("unexpected response: {:?}", other));
                    }
                    Err(e @ Error::InsufficientSpace { .. }) => {
                        // Soft failure: drop the exhausted server from
                        // future rankings and move on.
                        tracing::debug!(%primary, "excluding exhausted server");
                        excluded.push(primary.clone());
                        last_err = e;
                    }
                    Err(e) => {
                        tracing::debug!(%primary, "store attempt failed: {}", e);
                        last_err = e;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Download a remote file and write it to `local_path`.
    pub async fn download(&self, remote_path: &str, local_path: impl AsRef<Path>) -> Result<()> {
        let entry = self
            .get_file_metadata(remote_path)
            .await?
            .ok_or_else(|| Error::UnknownFile(remote_path.to_string()))?;

        // Best-effort ranking; with no ranking we read in metadata order.
        let ranking = self.ranking(0).await.unwrap_or_default();

        let mut output = Vec::with_capacity(entry.total_size as usize);
        for chunk_id in &entry.chunk_ids {
            let holders = entry
                .chunk_locations
                .get(chunk_id)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| Error::ChunkMissing(chunk_id.clone()))?;
            let valid_bytes = entry.chunk_offsets.get(chunk_id).copied();

            let mut data = None;
            for holder in Self::order_by_ranking(holders, &ranking) {
                let request = StorageRequest::RetrieveChunk {
                    chunk_id: chunk_id.clone(),
                    offset: None,
                    length: valid_bytes,
                };
                match self.storage(&holder, &request).await {
                    Ok(StorageResponse::Chunk { data: bytes }) => {
                        data = Some(bytes);
                        break;
                    }
                    Ok(other) => {
                        tracing::warn!(%holder, "unexpected response: {:?}", other)
                    }
                    Err(e) => tracing::warn!(%holder, %chunk_id, "retrieve failed: {}", e),
                }
            }
            let data = data.ok_or_else(|| Error::ChunkMissing(chunk_id.clone()))?;
            output.extend_from_slice(&data);
        }

        std::fs::write(local_path, &output)?;
        tracing::info!(remote_path, size = output.len(), "download complete");
        Ok(())
    }

    /// Append bytes to a remote file, filling the tail chunk first and
    /// spilling the remainder into new chunks. Only the tail fill is
    /// retried as a whole: a lost tail race (stale offset) re-reads the
    /// tail position and overwrites the same region, so no bytes
    /// duplicate. New-chunk stores carry their own retries.
    pub async fn append(&self, remote_path: &str, data: &[u8]) -> Result<()> {
        let (consumed, next_index) = retry_with_backoff(
            move || self.fill_tail(remote_path, data),
            self.max_retries,
            RETRY_BASE_DELAY,
        )
        .await?;

        if consumed < data.len() {
            self.store_tail_chunks(remote_path, next_index, &data[consumed..])
                .await?;
        }
        Ok(())
    }

    /// Push as much of `data` as fits into the tail chunk. Returns how
    /// many bytes were consumed and the index the next fresh chunk gets.
    async fn fill_tail(&self, remote_path: &str, data: &[u8]) -> Result<(usize, usize)> {
        let entry = match self.get_file_metadata(remote_path).await? {
            // Appending to a file that does not exist creates it.
            None => return Ok((0, 0)),
            Some(entry) => entry,
        };

        let last_chunk_id = match entry.last_chunk_id.clone() {
            Some(id) => id,
            None => return Ok((0, entry.chunk_ids.len())),
        };

        let tail_space = (self.chunk_size - entry.last_chunk_offset.min(self.chunk_size)) as usize;
        let tail = &data[..data.len().min(tail_space)];
        if tail.is_empty() {
            return Ok((0, entry.chunk_ids.len()));
        }

        let holders = entry
            .chunk_locations
            .get(&last_chunk_id)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::ChunkMissing(last_chunk_id.clone()))?;
        let ranking = self.ranking(0).await.unwrap_or_default();
        let ordered = Self::order_by_ranking(holders, &ranking);
        let (primary, replicas) = ordered.split_first().expect("holders checked non-empty");

        let request = StorageRequest::AppendChunk {
            chunk_id: last_chunk_id.clone(),
            file_path: remote_path.to_string(),
            data: tail.to_vec(),
            offset: entry.last_chunk_offset,
            replica_servers: replicas.to_vec(),
        };
        match self.storage(primary, &request).await? {
            StorageResponse::Appended { new_offset, .. } => {
                tracing::debug!(remote_path, new_offset, "tail chunk extended");
                Ok((tail.len(), entry.chunk_ids.len()))
            }
            other => Err(Error::Internal(format!("unexpected response: {:?}", other))),
        }
    }

    /// Store `data` as fresh chunks starting at `index`, as the upload
    /// path does.
    async fn store_tail_chunks(&self, path: &str, index: usize, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(self.chunk_size as usize).enumerate() {
            self.store_new_chunk(path, index + i, chunk).await?;
        }
        Ok(())
    }

    /// List remote paths, optionally under a prefix.
    pub async fn list_files(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        match self
            .coord(&CoordRequest::ListFiles {
                prefix: prefix.map(|p| p.to_string()),
            })
            .await?
        {
            CoordResponse::Files { files } => Ok(files),
            other => Err(Error::Internal(format!("unexpected response: {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_ranking_prefers_ranked_holders() {
        let holders = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ranking = vec!["c".to_string(), "a".to_string()];
        let ordered = Client::order_by_ranking(&holders, &ranking);
        assert_eq!(ordered, vec!["c".to_string(), "a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_order_by_ranking_without_ranking_keeps_order() {
        let holders = vec!["a".to_string(), "b".to_string()];
        let ordered = Client::order_by_ranking(&holders, &[]);
        assert_eq!(ordered, holders);
    }
}
