//! Membership registry
//!
//! Tracks storage-server and client records plus the derived location
//! graph (pairwise Euclidean distances between registered nodes). Guarded
//! by its own lock, independent of the metadata lock, so heartbeats never
//! queue behind metadata scans. When both locks are needed the metadata
//! lock is acquired first.

use crate::common::{GraphClient, GraphData, GraphEdge, GraphNode, Location};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Coordinator-side record of one storage server, keyed by address.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub id: String,
    pub address: String,
    pub location: Location,
    pub space_limit: u64,
    pub used_bytes: u64,
    pub last_seen: Instant,
}

impl ServerRecord {
    pub fn free_bytes(&self) -> u64 {
        self.space_limit.saturating_sub(self.used_bytes)
    }
}

/// Coordinator-side record of one client, keyed by id.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: String,
    pub location: Location,
    pub last_seen: Instant,
    pub ranked_servers: Vec<String>,
}

/// Outcome of a heartbeat, so the server loop knows when an unknown
/// address was re-registered in place (which warrants a repair kick).
#[derive(Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Refreshed,
    Registered,
    Unknown,
}

#[derive(Default)]
struct RegistryInner {
    servers: HashMap<String, ServerRecord>,
    clients: HashMap<String, ClientRecord>,
    // Pairwise distances, both directions, keyed by (node, node). Nodes are
    // server addresses and client ids. Rebuilt incrementally on add/remove.
    distances: HashMap<(String, String), f64>,
}

impl RegistryInner {
    fn node_locations(&self) -> Vec<(String, Location)> {
        self.servers
            .values()
            .map(|s| (s.address.clone(), s.location))
            .chain(self.clients.values().map(|c| (c.id.clone(), c.location)))
            .collect()
    }

    fn graph_add(&mut self, key: &str, location: Location) {
        for (other, other_loc) in self.node_locations() {
            if other == key {
                continue;
            }
            let d = location.distance(&other_loc);
            self.distances.insert((key.to_string(), other.clone()), d);
            self.distances.insert((other, key.to_string()), d);
        }
    }

    fn graph_remove(&mut self, key: &str) {
        self.distances.retain(|(a, b), _| a != key && b != key);
    }
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a storage-server record. Idempotent.
    pub fn register_server(&self, id: String, address: String, location: Location, space_limit: u64) {
        let mut inner = self.inner.lock().unwrap();
        let known = inner.servers.contains_key(&address);
        if !known {
            inner.graph_add(&address, location);
            tracing::info!(%id, %address, "registered storage server");
        } else {
            tracing::debug!(%address, "refreshed storage server registration");
        }
        let used = inner.servers.get(&address).map(|s| s.used_bytes).unwrap_or(0);
        inner.servers.insert(
            address.clone(),
            ServerRecord {
                id,
                address,
                location,
                space_limit,
                used_bytes: used,
                last_seen: Instant::now(),
            },
        );
    }

    /// Create or refresh a client record. Idempotent.
    pub fn register_client(&self, id: String, location: Location) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.clients.contains_key(&id) {
            inner.graph_add(&id, location);
            tracing::info!(%id, "registered client");
        }
        let ranked = inner
            .clients
            .get(&id)
            .map(|c| c.ranked_servers.clone())
            .unwrap_or_default();
        inner.clients.insert(
            id.clone(),
            ClientRecord {
                id,
                location,
                last_seen: Instant::now(),
                ranked_servers: ranked,
            },
        );
    }

    /// Refresh liveness and capacity. An unknown address carrying location
    /// and space limit is registered in place.
    pub fn heartbeat(
        &self,
        address: &str,
        used_bytes: u64,
        location: Option<Location>,
        space_limit: Option<u64>,
    ) -> HeartbeatOutcome {
        let mut inner = self.inner.lock().unwrap();

        if let Some(server) = inner.servers.get_mut(address) {
            server.last_seen = Instant::now();
            server.used_bytes = used_bytes;
            if let Some(loc) = location {
                server.location = loc;
            }
            if let Some(limit) = space_limit {
                server.space_limit = limit;
            }
            return HeartbeatOutcome::Refreshed;
        }

        if let Some(client) = inner.clients.get_mut(address) {
            client.last_seen = Instant::now();
            return HeartbeatOutcome::Refreshed;
        }

        match (location, space_limit) {
            (Some(location), Some(space_limit)) => {
                drop(inner);
                self.register_server(address.to_string(), address.to_string(), location, space_limit);
                HeartbeatOutcome::Registered
            }
            _ => {
                tracing::warn!(%address, "heartbeat from unknown node without registration info");
                HeartbeatOutcome::Unknown
            }
        }
    }

    /// Remove storage servers that have not heartbeated within `threshold`.
    /// Returns the removed addresses for metadata stripping.
    pub fn expire(&self, threshold: Duration) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let dead: Vec<String> = inner
            .servers
            .values()
            .filter(|s| now.duration_since(s.last_seen) > threshold)
            .map(|s| s.address.clone())
            .collect();
        for address in &dead {
            inner.servers.remove(address);
            inner.graph_remove(address);
            tracing::warn!(%address, "storage server expired, removing");
        }
        dead
    }

    pub fn live_servers(&self) -> Vec<ServerRecord> {
        self.inner.lock().unwrap().servers.values().cloned().collect()
    }

    pub fn get_server(&self, address: &str) -> Option<ServerRecord> {
        self.inner.lock().unwrap().servers.get(address).cloned()
    }

    pub fn client_location(&self, client_id: &str) -> Option<Location> {
        self.inner
            .lock()
            .unwrap()
            .clients
            .get(client_id)
            .map(|c| c.location)
    }

    /// Cache the ranking most recently computed for a client.
    pub fn set_client_ranking(&self, client_id: &str, ranked: Vec<String>) {
        if let Some(client) = self.inner.lock().unwrap().clients.get_mut(client_id) {
            client.ranked_servers = ranked;
        }
    }

    /// Topology snapshot for introspection.
    pub fn graph_data(&self) -> GraphData {
        let inner = self.inner.lock().unwrap();

        let mut servers: Vec<GraphNode> = inner
            .servers
            .values()
            .map(|s| GraphNode {
                id: s.id.clone(),
                address: s.address.clone(),
                location: s.location,
                space_limit: s.space_limit,
                used_bytes: s.used_bytes,
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut clients: Vec<GraphClient> = inner
            .clients
            .values()
            .map(|c| GraphClient {
                id: c.id.clone(),
                location: c.location,
                ranked_servers: c.ranked_servers.clone(),
            })
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<GraphEdge> = inner
            .distances
            .iter()
            .filter(|((a, b), _)| a < b)
            .map(|((a, b), &distance)| GraphEdge {
                from: a.clone(),
                to: b.clone(),
                distance,
            })
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

        GraphData {
            servers,
            clients,
            edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(x: f64, y: f64) -> Location {
        Location::new(x, y)
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = Registry::new();
        registry.register_server("s1".into(), "127.0.0.1:7100".into(), loc(0.0, 0.0), 1024);
        registry.register_server("s1".into(), "127.0.0.1:7100".into(), loc(0.0, 0.0), 1024);
        assert_eq!(registry.live_servers().len(), 1);
    }

    #[test]
    fn test_heartbeat_refreshes_capacity() {
        let registry = Registry::new();
        registry.register_server("s1".into(), "a:1".into(), loc(0.0, 0.0), 1000);
        let outcome = registry.heartbeat("a:1", 250, None, None);
        assert_eq!(outcome, HeartbeatOutcome::Refreshed);
        let server = registry.get_server("a:1").unwrap();
        assert_eq!(server.used_bytes, 250);
        assert_eq!(server.free_bytes(), 750);
    }

    #[test]
    fn test_heartbeat_implicitly_registers() {
        let registry = Registry::new();
        let outcome = registry.heartbeat("b:2", 0, Some(loc(1.0, 1.0)), Some(2048));
        assert_eq!(outcome, HeartbeatOutcome::Registered);
        assert!(registry.get_server("b:2").is_some());

        // Without registration info the heartbeat is dropped.
        let outcome = registry.heartbeat("c:3", 0, None, None);
        assert_eq!(outcome, HeartbeatOutcome::Unknown);
        assert!(registry.get_server("c:3").is_none());
    }

    #[test]
    fn test_expire_removes_stale_servers() {
        let registry = Registry::new();
        registry.register_server("s1".into(), "a:1".into(), loc(0.0, 0.0), 1000);
        std::thread::sleep(Duration::from_millis(30));
        registry.register_server("s2".into(), "b:2".into(), loc(1.0, 1.0), 1000);

        let dead = registry.expire(Duration::from_millis(20));
        assert_eq!(dead, vec!["a:1".to_string()]);
        assert_eq!(registry.live_servers().len(), 1);
    }

    #[test]
    fn test_graph_tracks_distances() {
        let registry = Registry::new();
        registry.register_server("s1".into(), "a:1".into(), loc(0.0, 0.0), 1000);
        registry.register_server("s2".into(), "b:2".into(), loc(3.0, 4.0), 1000);
        registry.register_client("cli".into(), loc(0.0, 0.0));

        let graph = registry.graph_data();
        assert_eq!(graph.servers.len(), 2);
        assert_eq!(graph.clients.len(), 1);
        // Three nodes, three undirected edges.
        assert_eq!(graph.edges.len(), 3);
        let edge = graph
            .edges
            .iter()
            .find(|e| (e.from.as_str(), e.to.as_str()) == ("a:1", "b:2"))
            .unwrap();
        assert!((edge.distance - 5.0).abs() < f64::EPSILON);

        // Expiry drops the dead nodes' edges; the lone client has no pairs.
        std::thread::sleep(Duration::from_millis(10));
        registry.expire(Duration::from_millis(0));
        assert!(registry.graph_data().edges.is_empty());
    }
}
