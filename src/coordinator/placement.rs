//! Placement scoring
//!
//! Candidates are scored by a weighted sum of normalized Euclidean
//! distance to the requesting client and space utilization:
//!
//! ```text
//! ND_i    = d_i / max(d)          (max(d) substituted with 1 when all d are 0)
//! SU_i    = used_i / space_limit_i
//! score_i = W_dist * ND_i + W_space * SU_i     (smaller = better)
//! ```
//!
//! Only servers with `free >= needed_bytes` are eligible; ties break on
//! server id so rankings are stable across calls.

use crate::common::config::CoordinatorConfig;
use crate::common::Location;
use crate::coordinator::registry::ServerRecord;

#[derive(Debug, Clone)]
pub struct RankedServer {
    pub id: String,
    pub address: String,
    pub score: f64,
}

pub struct PlacementEngine {
    distance_weight: f64,
    space_weight: f64,
    replication_factor: usize,
}

impl PlacementEngine {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            distance_weight: config.distance_weight,
            space_weight: config.space_weight,
            replication_factor: config.replication_factor,
        }
    }

    /// Rank all eligible candidates by ascending score.
    pub fn rank(
        &self,
        client: Location,
        candidates: &[ServerRecord],
        needed_bytes: u64,
    ) -> Vec<RankedServer> {
        let eligible: Vec<&ServerRecord> = candidates
            .iter()
            .filter(|s| s.free_bytes() >= needed_bytes)
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }

        let max_distance = eligible
            .iter()
            .map(|s| client.distance(&s.location))
            .fold(0.0_f64, f64::max);

        let mut ranked: Vec<RankedServer> = eligible
            .into_iter()
            .map(|s| {
                // All-colocated candidates have every d_i = 0; dividing by
                // a substituted max of 1 leaves the distance term at 0.
                let nd = if max_distance > 0.0 {
                    client.distance(&s.location) / max_distance
                } else {
                    0.0
                };
                let su = if s.space_limit > 0 {
                    s.used_bytes as f64 / s.space_limit as f64
                } else {
                    1.0
                };
                RankedServer {
                    id: s.id.clone(),
                    address: s.address.clone(),
                    score: self.distance_weight * nd + self.space_weight * su,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
    }

    /// Top `replication_factor` candidates.
    pub fn top_k(
        &self,
        client: Location,
        candidates: &[ServerRecord],
        needed_bytes: u64,
    ) -> Vec<RankedServer> {
        let mut ranked = self.rank(client, candidates, needed_bytes);
        ranked.truncate(self.replication_factor);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn engine(w_dist: f64, w_space: f64, k: usize) -> PlacementEngine {
        PlacementEngine {
            distance_weight: w_dist,
            space_weight: w_space,
            replication_factor: k,
        }
    }

    fn server(id: &str, x: f64, y: f64, space_limit: u64, used: u64) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            address: format!("{}:0", id),
            location: Location::new(x, y),
            space_limit,
            used_bytes: used,
            last_seen: Instant::now(),
        }
    }

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_closest_empty_server_wins() {
        let engine = engine(0.6, 0.4, 3);
        let servers = vec![
            server("s1", 0.0, 0.0, 1024 * MIB, 0),
            server("s2", 100.0, 0.0, 1024 * MIB, 0),
            server("s3", 0.0, 100.0, 1024 * MIB, 0),
        ];
        let ranked = engine.rank(Location::new(5.0, 5.0), &servers, MIB);
        assert_eq!(ranked[0].address, "s1:0");
    }

    #[test]
    fn test_space_pressure_displaces_equidistant_full_server() {
        let engine = engine(0.6, 0.4, 3);
        // Client equidistant from all three, so normalized distance is 1.0
        // everywhere and the space term decides: the 90%-full server sinks
        // to the bottom of the ranking.
        let servers = vec![
            server("s1", 0.0, 0.0, 1024 * MIB, 921 * MIB),
            server("s2", 100.0, 0.0, 1024 * MIB, 0),
            server("s3", 0.0, 100.0, 1024 * MIB, 0),
        ];
        let ranked = engine.rank(Location::new(50.0, 50.0), &servers, MIB);
        assert_ne!(ranked[0].address, "s1:0");
        assert_eq!(ranked[2].address, "s1:0");
    }

    #[test]
    fn test_full_servers_are_ineligible() {
        let engine = engine(0.6, 0.4, 3);
        let servers = vec![
            server("s1", 0.0, 0.0, 100, 100),
            server("s2", 50.0, 0.0, 1024 * MIB, 0),
        ];
        let ranked = engine.rank(Location::new(0.0, 0.0), &servers, 50);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].address, "s2:0");
    }

    #[test]
    fn test_all_colocated_does_not_divide_by_zero() {
        let engine = engine(0.6, 0.4, 2);
        let servers = vec![
            server("s1", 0.0, 0.0, 1000, 0),
            server("s2", 0.0, 0.0, 1000, 500),
        ];
        let ranked = engine.rank(Location::new(0.0, 0.0), &servers, 10);
        assert_eq!(ranked.len(), 2);
        // Equal distance, so the emptier server wins.
        assert_eq!(ranked[0].address, "s1:0");
        assert!(ranked.iter().all(|r| r.score.is_finite()));
    }

    #[test]
    fn test_ties_break_on_id() {
        let engine = engine(0.6, 0.4, 3);
        let servers = vec![
            server("s2", 0.0, 0.0, 1000, 0),
            server("s1", 0.0, 0.0, 1000, 0),
        ];
        let ranked = engine.rank(Location::new(0.0, 0.0), &servers, 10);
        assert_eq!(ranked[0].id, "s1");
        assert_eq!(ranked[1].id, "s2");
    }

    #[test]
    fn test_top_k_truncates() {
        let engine = engine(0.6, 0.4, 2);
        let servers = vec![
            server("s1", 0.0, 0.0, 1000, 0),
            server("s2", 1.0, 0.0, 1000, 0),
            server("s3", 2.0, 0.0, 1000, 0),
        ];
        let top = engine.top_k(Location::new(0.0, 0.0), &servers, 10);
        assert_eq!(top.len(), 2);
    }
}
