//! Road routing for the location timeline player.
//!
//! Itinerary stops snap to the nearest road node and consecutive stops are
//! joined by the shortest path over the road graph (Dijkstra, haversine edge
//! weights). The per-leg node coordinates are concatenated into one dense
//! polyline.

use crate::subscription::GeoPoint;
use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Road network has no nodes")]
    EmptyGraph,

    #[error("Edge references unknown node {0}")]
    UnknownNode(u64),

    #[error("No road path from node {from} to node {to}")]
    Unreachable { from: u64, to: u64 },

    #[error("Itinerary has no stops")]
    EmptyItinerary,

    #[error("Failed to load road network: {0}")]
    Load(String),
}

/// Shortest-path provider used by the location player.
pub trait Router: Send + Sync {
    /// Returns the polyline visiting every waypoint in order.
    fn route(&self, waypoints: &[GeoPoint]) -> Result<Vec<GeoPoint>, RoutingError>;
}

/// Serialized road graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoadGraph {
    pub nodes: Vec<RoadNode>,
    pub edges: Vec<RoadEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadNode {
    pub id: u64,
    pub latitude: f64,
    pub longitude: f64,
}

/// Bidirectional road segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadEdge {
    pub from: u64,
    pub to: u64,

    /// Length in meters; haversine distance between the ends when absent
    #[serde(default)]
    pub length: Option<f64>,
}

/// Pre-loaded road network with an adjacency list.
pub struct RoadNetwork {
    nodes: Vec<RoadNode>,
    adjacency: Vec<Vec<(usize, f64)>>,
}

impl RoadNetwork {
    /// Builds the adjacency list of a graph.
    pub fn from_graph(graph: RoadGraph) -> Result<Self, RoutingError> {
        if graph.nodes.is_empty() {
            return Err(RoutingError::EmptyGraph);
        }

        let index: HashMap<u64, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, i))
            .collect();
        let mut adjacency = vec![Vec::new(); graph.nodes.len()];

        for edge in &graph.edges {
            let from = *index.get(&edge.from).ok_or(RoutingError::UnknownNode(edge.from))?;
            let to = *index.get(&edge.to).ok_or(RoutingError::UnknownNode(edge.to))?;
            let length = edge
                .length
                .unwrap_or_else(|| haversine(&graph.nodes[from], &graph.nodes[to]));
            adjacency[from].push((to, length));
            adjacency[to].push((from, length));
        }

        Ok(Self {
            nodes: graph.nodes,
            adjacency,
        })
    }

    /// Parses a JSON road graph.
    pub fn from_json(raw: &str) -> Result<Self, RoutingError> {
        let graph: RoadGraph =
            serde_json::from_str(raw).map_err(|e| RoutingError::Load(e.to_string()))?;
        Self::from_graph(graph)
    }

    /// Loads a JSON road graph from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RoutingError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RoutingError::Load(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Index of the node closest to `point`.
    pub fn nearest_node(&self, point: GeoPoint) -> usize {
        let target = Point::new(point.longitude, point.latitude);
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (i, target.haversine_distance(&Point::new(n.longitude, n.latitude))))
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Dijkstra over node indices. Returns the node sequence including both ends.
    pub fn shortest_path(&self, from: usize, to: usize) -> Result<Vec<usize>, RoutingError> {
        let mut dist = vec![f64::INFINITY; self.nodes.len()];
        let mut prev: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut heap = BinaryHeap::new();

        dist[from] = 0.0;
        heap.push(Frontier { cost: 0.0, node: from });

        while let Some(Frontier { cost, node }) = heap.pop() {
            if node == to {
                break;
            }
            if cost > dist[node] {
                continue;
            }
            for &(next, length) in &self.adjacency[node] {
                let candidate = cost + length;
                if candidate < dist[next] {
                    dist[next] = candidate;
                    prev[next] = Some(node);
                    heap.push(Frontier { cost: candidate, node: next });
                }
            }
        }

        if !dist[to].is_finite() {
            return Err(RoutingError::Unreachable {
                from: self.nodes[from].id,
                to: self.nodes[to].id,
            });
        }

        let mut path = vec![to];
        let mut cursor = to;
        while let Some(p) = prev[cursor] {
            path.push(p);
            cursor = p;
        }
        path.reverse();
        Ok(path)
    }

    fn point(&self, index: usize) -> GeoPoint {
        let node = &self.nodes[index];
        GeoPoint::new(node.latitude, node.longitude)
    }
}

impl Router for RoadNetwork {
    fn route(&self, waypoints: &[GeoPoint]) -> Result<Vec<GeoPoint>, RoutingError> {
        match waypoints {
            [] => Err(RoutingError::EmptyItinerary),
            [only] => Ok(vec![self.point(self.nearest_node(*only))]),
            _ => {
                let mut polyline = Vec::new();
                for leg in waypoints.windows(2) {
                    let start = self.nearest_node(leg[0]);
                    let end = self.nearest_node(leg[1]);
                    let path = self.shortest_path(start, end)?;
                    polyline.extend(path.into_iter().map(|i| self.point(i)));
                }
                Ok(polyline)
            }
        }
    }
}

fn haversine(a: &RoadNode, b: &RoadNode) -> f64 {
    Point::new(a.longitude, a.latitude).haversine_distance(&Point::new(b.longitude, b.latitude))
}

/// Min-heap entry for Dijkstra.
#[derive(Debug, Clone, Copy)]
struct Frontier {
    cost: f64,
    node: usize,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the cheapest node first
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| self.node.cmp(&other.node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A square block with a long detour:
    ///
    /// ```text
    /// 1 ── 2 ── 3
    /// |         |
    /// 4 ─────── 5     (4-5 is declared very long)
    /// ```
    fn block() -> RoadNetwork {
        let raw = r#"{
            "nodes": [
                {"id": 1, "latitude": 40.6400, "longitude": -8.6600},
                {"id": 2, "latitude": 40.6400, "longitude": -8.6550},
                {"id": 3, "latitude": 40.6400, "longitude": -8.6500},
                {"id": 4, "latitude": 40.6350, "longitude": -8.6600},
                {"id": 5, "latitude": 40.6350, "longitude": -8.6500}
            ],
            "edges": [
                {"from": 1, "to": 2},
                {"from": 2, "to": 3},
                {"from": 1, "to": 4},
                {"from": 3, "to": 5},
                {"from": 4, "to": 5, "length": 100000.0}
            ]
        }"#;
        RoadNetwork::from_json(raw).unwrap()
    }

    #[test]
    fn test_nearest_node_snaps_stop() {
        let net = block();
        assert_eq!(net.nearest_node(GeoPoint::new(40.6351, -8.6499)), 4);
        assert_eq!(net.node_count(), 5);
    }

    #[test]
    fn test_shortest_path_avoids_long_edge() {
        let net = block();
        let path = net.shortest_path(3, 4).unwrap();
        let ids: Vec<u64> = path.iter().map(|i| net.nodes[*i].id).collect();
        assert_eq!(ids, vec![4, 1, 2, 3, 5]);
    }

    #[test]
    fn test_route_concatenates_legs() {
        let net = block();
        let stops = [
            GeoPoint::new(40.6400, -8.6600),
            GeoPoint::new(40.6400, -8.6500),
            GeoPoint::new(40.6350, -8.6500),
        ];
        let polyline = net.route(&stops).unwrap();

        // 1-2-3 then 3-5, joint node repeated
        assert_eq!(polyline.len(), 5);
        assert_eq!(polyline[0], GeoPoint::new(40.6400, -8.6600));
        assert_eq!(polyline[2], polyline[3]);
        assert_eq!(polyline[4], GeoPoint::new(40.6350, -8.6500));
    }

    #[test]
    fn test_route_edge_cases() {
        let net = block();
        assert!(matches!(net.route(&[]), Err(RoutingError::EmptyItinerary)));
        assert_eq!(net.route(&[GeoPoint::new(40.64, -8.655)]).unwrap().len(), 1);
    }

    #[test]
    fn test_unreachable_and_bad_graphs() {
        let raw = r#"{
            "nodes": [
                {"id": 1, "latitude": 40.0, "longitude": -8.0},
                {"id": 2, "latitude": 41.0, "longitude": -8.0}
            ],
            "edges": []
        }"#;
        let net = RoadNetwork::from_json(raw).unwrap();
        assert!(matches!(
            net.shortest_path(0, 1),
            Err(RoutingError::Unreachable { from: 1, to: 2 })
        ));

        assert!(matches!(
            RoadNetwork::from_graph(RoadGraph::default()),
            Err(RoutingError::EmptyGraph)
        ));
        let dangling = r#"{"nodes": [{"id": 1, "latitude": 0.0, "longitude": 0.0}],
                           "edges": [{"from": 1, "to": 9}]}"#;
        assert!(matches!(RoadNetwork::from_json(dangling), Err(RoutingError::UnknownNode(9))));
    }
}
