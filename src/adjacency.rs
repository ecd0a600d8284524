//! adjacency.rs
//!
//! Adyacencia ponderada por ventana, a nivel de arista o de nodo.
//!
//! Pesos componibles (se multiplican los modos activos):
//! - binario: 1 si hay conexión topológica
//! - decaimiento: exp(-d²/σ²), d = distancia entre puntos medios de aristas
//! - flujo: frecuencia histórica de transiciones A -> B de los tracks
//!   cerrados, normalizada por arista de origen; sin historial vale 1
//!
//! Las aristas intransitables se mantienen con distancia infinita y peso 0.
//! La parte estática (pares y distancias) se cachea por versión de grafo.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::cfg::AdjacencyCfg;
use crate::graph::RoadGraph;
use crate::types::EdgeIdx;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjacencyLevel {
    #[default]
    Edge,
    Node,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AdjEntry {
    pub from: u32,
    pub to: u32,
    pub weight: f64,
    /// Infinita si el destino está cerrado; en JSON sale como `null` y el
    /// cierre se lee de `impassable`
    pub distance_m: f64,
    pub impassable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Adjacency {
    pub level: AdjacencyLevel,
    /// Ids (de arista o nodo) en el orden de los índices de `entries`
    pub index: Vec<String>,
    pub entries: Vec<AdjEntry>,
    /// Se aplicó peso de flujo con historial real
    pub flow_weighted: bool,
}

impl Adjacency {
    pub fn weight(&self, from: &str, to: &str) -> Option<f64> {
        let f = self.index.iter().position(|s| s == from)? as u32;
        let t = self.index.iter().position(|s| s == to)? as u32;
        self.entries.iter().find(|e| e.from == f && e.to == t).map(|e| e.weight)
    }
}

#[derive(Debug)]
struct Pair {
    from: u32,
    to: u32,
    distance_m: f64,
    /// Aristas que sostienen el par (a nivel nodo puede haber paralelas)
    via: Vec<EdgeIdx>,
}

#[derive(Debug)]
struct StaticPairs {
    index: Vec<String>,
    pairs: Vec<Pair>,
}

pub struct AdjacencyBuilder {
    cfg: AdjacencyCfg,
    cache: DashMap<u64, Arc<StaticPairs>>,
}

impl AdjacencyBuilder {
    pub fn new(cfg: AdjacencyCfg) -> Self {
        Self { cfg, cache: DashMap::new() }
    }

    pub fn cfg(&self) -> &AdjacencyCfg { &self.cfg }

    fn static_pairs(&self, graph: &RoadGraph) -> Arc<StaticPairs> {
        let v = graph.version();
        if let Some(p) = self.cache.get(&v) {
            return Arc::clone(p.value());
        }
        let built = Arc::new(match self.cfg.level {
            AdjacencyLevel::Edge => self.edge_pairs(graph),
            AdjacencyLevel::Node => self.node_pairs(graph),
        });
        self.cache.retain(|k, _| *k == v);
        self.cache.insert(v, Arc::clone(&built));
        built
    }

    fn edge_pairs(&self, graph: &RoadGraph) -> StaticPairs {
        let edges = graph.edges();
        let mut pairs = Vec::new();
        for (i, a) in edges.iter().enumerate() {
            let from = i as EdgeIdx;
            for s in graph.successors(from) {
                if s.u_turn && !self.cfg.u_turns {
                    continue;
                }
                if s.edge == from && !self.cfg.self_loops {
                    continue;
                }
                let b = graph.edge(s.edge);
                pairs.push(Pair {
                    from,
                    to: s.edge,
                    distance_m: (a.length_m + b.length_m) / 2.0,
                    via: vec![from, s.edge],
                });
            }
        }
        pairs.sort_by(|x, y| (x.from, x.to).cmp(&(y.from, y.to)));
        pairs.dedup_by(|x, y| x.from == y.from && x.to == y.to);
        StaticPairs { index: edges.iter().map(|e| e.id.clone()).collect(), pairs }
    }

    fn node_pairs(&self, graph: &RoadGraph) -> StaticPairs {
        let nodes = graph.nodes();
        let pos: HashMap<&str, u32> = nodes.iter().enumerate().map(|(i, n)| (n.id.as_str(), i as u32)).collect();
        let mut by_pair: BTreeMap<(u32, u32), Pair> = BTreeMap::new();
        for (i, e) in graph.edges().iter().enumerate() {
            let (Some(&s), Some(&t)) = (pos.get(e.source_node.as_str()), pos.get(e.target_node.as_str())) else {
                continue;
            };
            if s == t && !self.cfg.self_loops {
                continue;
            }
            let p = by_pair.entry((s, t)).or_insert_with(|| Pair {
                from: s,
                to: t,
                distance_m: f64::INFINITY,
                via: Vec::new(),
            });
            p.distance_m = p.distance_m.min(e.length_m);
            p.via.push(i as EdgeIdx);
        }
        StaticPairs {
            index: nodes.iter().map(|n| n.id.clone()).collect(),
            pairs: by_pair.into_values().collect(),
        }
    }

    /// Adyacencia para una ventana. `transitions` son los conteos A -> B
    /// acumulados por el tracker (sólo se usan a nivel de arista).
    pub fn build(&self, graph: &RoadGraph, transitions: &BTreeMap<(EdgeIdx, EdgeIdx), u64>) -> Adjacency {
        let st = self.static_pairs(graph);
        let level = self.cfg.level;
        let use_flow = self.cfg.flow && level == AdjacencyLevel::Edge && !transitions.is_empty();

        // grado y total de transiciones por origen
        let mut out_deg: HashMap<u32, (u32, u64)> = HashMap::new();
        for p in &st.pairs {
            let d = out_deg.entry(p.from).or_default();
            d.0 += 1;
            d.1 += transitions.get(&(p.from, p.to)).copied().unwrap_or(0);
        }

        let sigma2 = self.cfg.sigma_m * self.cfg.sigma_m;
        let alpha = self.cfg.flow_prior.max(f64::EPSILON);
        let mut flow_seen = false;
        let entries = st
            .pairs
            .iter()
            .map(|p| {
                let impassable = match level {
                    AdjacencyLevel::Edge => p.via.iter().any(|e| graph.is_closed(*e)),
                    AdjacencyLevel::Node => p.via.iter().all(|e| graph.is_closed(*e)),
                };
                if impassable {
                    return AdjEntry { from: p.from, to: p.to, weight: 0.0, distance_m: f64::INFINITY, impassable };
                }
                let mut w = 1.0;
                if self.cfg.distance_decay && sigma2 > 0.0 {
                    w *= (-(p.distance_m * p.distance_m) / sigma2).exp();
                }
                if use_flow {
                    let (deg, total) = out_deg.get(&p.from).copied().unwrap_or((1, 0));
                    let count = transitions.get(&(p.from, p.to)).copied().unwrap_or(0);
                    if total > 0 {
                        flow_seen = true;
                    }
                    w *= deg as f64 * (count as f64 + alpha) / (total as f64 + alpha * deg as f64);
                }
                AdjEntry { from: p.from, to: p.to, weight: w, distance_m: p.distance_m, impassable }
            })
            .collect();

        Adjacency { level, index: st.index.clone(), entries, flow_weighted: flow_seen }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_m;
    use crate::types::{EdgeRecord, LatLon, Node, TopologyDoc};

    const O: LatLon = LatLon { lat: -12.05, lon: -77.04 };

    fn node(id: &str, n: f64, e: f64) -> Node {
        let p = offset_m(O, n, e);
        Node { id: id.into(), lat: p.lat, lon: p.lon, has_camera: false }
    }

    fn edge(id: &str, s: &str, t: &str) -> EdgeRecord {
        EdgeRecord {
            id: id.into(),
            source_node: s.into(),
            target_node: t.into(),
            geometry: None,
            length_m: None,
            lane_count: None,
            road_class: None,
        }
    }

    /// A -> B, luego B -> C (recto) o B -> D (giro)
    fn graph(version: u64) -> RoadGraph {
        let doc = TopologyDoc {
            nodes: vec![node("A", 0.0, 0.0), node("B", 0.0, 100.0), node("C", 0.0, 200.0), node("D", 100.0, 100.0)],
            edges: vec![edge("AB", "A", "B"), edge("BC", "B", "C"), edge("BD", "B", "D")],
            connections: vec![],
        };
        RoadGraph::from_topology(doc, version).unwrap()
    }

    fn cfg() -> AdjacencyCfg { AdjacencyCfg::default() }

    #[test]
    fn binario_y_decaimiento() {
        let g = graph(1);
        let b = AdjacencyBuilder::new(cfg());
        let adj = b.build(&g, &BTreeMap::new());
        assert_eq!(adj.entries.len(), 2);
        let w = adj.weight("AB", "BC").unwrap();
        let expected = (-(100.0f64 * 100.0) / (250.0 * 250.0)).exp();
        assert!((w - expected).abs() < 1e-3, "w = {w}");
        assert!(adj.weight("BC", "AB").is_none());
        assert!(!adj.flow_weighted);

        let mut c = cfg();
        c.distance_decay = false;
        let adj = AdjacencyBuilder::new(c).build(&g, &BTreeMap::new());
        assert!(adj.entries.iter().all(|e| e.weight == 1.0));
    }

    #[test]
    fn flujo_reparte_por_origen() {
        let g = graph(1);
        let mut c = cfg();
        c.distance_decay = false;
        let b = AdjacencyBuilder::new(c);
        let ab = g.edge_idx("AB").unwrap();
        let bc = g.edge_idx("BC").unwrap();
        let mut tr = BTreeMap::new();
        tr.insert((ab, bc), 8u64);
        let adj = b.build(&g, &tr);
        assert!(adj.flow_weighted);
        let w_bc = adj.weight("AB", "BC").unwrap();
        let w_bd = adj.weight("AB", "BD").unwrap();
        // 2 * 9/10 y 2 * 1/10
        assert!((w_bc - 1.8).abs() < 1e-12);
        assert!((w_bd - 0.2).abs() < 1e-12);
    }

    #[test]
    fn cierre_da_distancia_infinita() {
        let g = graph(1);
        g.set_closed("BD", true).unwrap();
        let adj = AdjacencyBuilder::new(cfg()).build(&g, &BTreeMap::new());
        let e = adj.entries.iter().find(|e| adj.index[e.to as usize] == "BD").unwrap();
        assert!(e.impassable);
        assert!(e.distance_m.is_infinite());
        assert_eq!(e.weight, 0.0);
        assert_eq!(adj.entries.len(), 2);

        let v = serde_json::to_value(e).unwrap();
        assert!(v["distance_m"].is_null());
        assert_eq!(v["impassable"], true);
        assert_eq!(v["weight"], 0.0);
        let open = adj.entries.iter().find(|e| !e.impassable).unwrap();
        assert!(serde_json::to_value(open).unwrap()["distance_m"].is_f64());
    }

    #[test]
    fn nivel_nodo() {
        let g = graph(1);
        let mut c = cfg();
        c.level = AdjacencyLevel::Node;
        let adj = AdjacencyBuilder::new(c).build(&g, &BTreeMap::new());
        assert_eq!(adj.index, vec!["A", "B", "C", "D"]);
        assert_eq!(adj.entries.len(), 3);
        assert!(adj.weight("A", "B").is_some());
        assert!(adj.weight("B", "A").is_none());
    }

    #[test]
    fn determinista_y_cache_por_version() {
        let b = AdjacencyBuilder::new(cfg());
        let g1 = graph(1);
        let a1 = b.build(&g1, &BTreeMap::new());
        let a2 = b.build(&g1, &BTreeMap::new());
        assert_eq!(a1, a2);
        let g2 = graph(2);
        let _ = b.build(&g2, &BTreeMap::new());
        assert_eq!(b.cache.len(), 1);
        assert!(b.cache.contains_key(&2));
    }
}
