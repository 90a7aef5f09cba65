//! Chunk id minting
//!
//! A chunk id is a BLAKE3 digest over `{file path, chunk index, creation
//! timestamp}`, hex-encoded. The timestamp keeps ids unique across retries
//! of the same chunk; the id is independent of the payload.

use crate::common::utils::timestamp_now_millis;

/// Mint a fresh chunk id for `path` at `chunk_index`.
pub fn mint_chunk_id(path: &str, chunk_index: usize) -> String {
    chunk_id_at(path, chunk_index, timestamp_now_millis())
}

fn chunk_id_at(path: &str, chunk_index: usize, timestamp_millis: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_bytes());
    hasher.update(&(chunk_index as u64).to_le_bytes());
    hasher.update(&timestamp_millis.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_hex() {
        let id = mint_chunk_id("/r/a.txt", 0);
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_id_varies_with_inputs() {
        let t = 1_700_000_000_000;
        assert_ne!(chunk_id_at("/a", 0, t), chunk_id_at("/b", 0, t));
        assert_ne!(chunk_id_at("/a", 0, t), chunk_id_at("/a", 1, t));
        assert_ne!(chunk_id_at("/a", 0, t), chunk_id_at("/a", 0, t + 1));
        assert_eq!(chunk_id_at("/a", 0, t), chunk_id_at("/a", 0, t));
    }
}
