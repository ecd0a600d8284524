//! graph.rs
//!
//! Grafo vial estático y su índice espacial.
//!
//! Funcionalidad principal:
//! - Cargar la topología desde JSON `{nodes, edges, connections}` o desde un
//!   GeoJSON (Point = nodo, LineString = arista).
//! - Validar la topología (ids duplicados, nodos colgantes, geometría vacía).
//! - Construir un `RTree` de segmentos de eje en metros locales para
//!   consultas por radio y k-vecinos.
//! - Marcar aristas como intransitables (cierres) sin quitarlas del grafo.
//!
//! Las aristas viven en un arena (`Vec<Edge>`) y se referencian por índice
//! estable `EdgeIdx`; nadie más guarda la estructura.

use dashmap::DashSet;
use geojson::{GeoJson, Geometry, Value};
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde_json::Map as JsonMap;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, TopologyError, VialError};
use crate::geo_utils::{bearing_xy, dist_xy, point_segment, polyline_length_m, LocalFrame};
use crate::types::{
    Edge, EdgeIdx, EdgeRecord, LatLon, Node, RoadClass, TopologyDoc, TurnConnection, TurnDirection,
};

/// Un segmento del eje de una arista, en metros locales
#[derive(Clone, Copy, Debug)]
pub struct SegmentItem {
    pub edge: EdgeIdx,
    pub seg: u32,
    pub a: [f64; 2],
    pub b: [f64; 2],
    /// Distancia a lo largo de la arista donde empieza el segmento
    pub along0: f64,
}

impl RTreeObject for SegmentItem {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.a[0].min(self.b[0]), self.a[1].min(self.b[1])],
            [self.a[0].max(self.b[0]), self.a[1].max(self.b[1])],
        )
    }
}

impl PointDistance for SegmentItem {
    fn distance_2(&self, p: &[f64; 2]) -> f64 {
        let (d, _) = point_segment(*p, self.a, self.b);
        d * d
    }
}

/// Resultado de una consulta espacial contra una arista
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeHit {
    pub edge: EdgeIdx,
    pub distance_m: f64,
    /// Posición de la proyección a lo largo de la arista (m)
    pub along_m: f64,
    /// Rumbo del segmento más cercano
    pub bearing_deg: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Successor {
    pub edge: EdgeIdx,
    pub u_turn: bool,
}

pub struct RoadGraph {
    version: u64,
    nodes: Vec<Node>,
    node_by_id: HashMap<String, usize>,
    edges: Vec<Edge>,
    edge_by_id: HashMap<String, EdgeIdx>,
    frame: LocalFrame,
    tree: RTree<SegmentItem>,
    successors: Vec<Vec<Successor>>,
    closed: DashSet<EdgeIdx>,
}

impl std::fmt::Debug for RoadGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoadGraph")
            .field("version", &self.version)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

impl RoadGraph {
    /// Construye y valida el grafo. Cualquier inconsistencia aborta la carga.
    pub fn from_topology(doc: TopologyDoc, version: u64) -> std::result::Result<Self, TopologyError> {
        if doc.nodes.is_empty() || doc.edges.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut node_by_id = HashMap::with_capacity(doc.nodes.len());
        for (i, n) in doc.nodes.iter().enumerate() {
            if !LatLon::new(n.lat, n.lon).is_valid() {
                return Err(TopologyError::InvalidCoordinate(n.id.clone()));
            }
            if node_by_id.insert(n.id.clone(), i).is_some() {
                return Err(TopologyError::DuplicateNode(n.id.clone()));
            }
        }

        // origen del plano local = centroide de los nodos
        let k = doc.nodes.len() as f64;
        let (slat, slon) = doc.nodes.iter().fold((0.0, 0.0), |(a, b), n| (a + n.lat, b + n.lon));
        let frame = LocalFrame::new(LatLon::new(slat / k, slon / k));

        let mut edges: Vec<Edge> = Vec::with_capacity(doc.edges.len());
        let mut edge_by_id: HashMap<String, EdgeIdx> = HashMap::with_capacity(doc.edges.len());
        let mut items: Vec<SegmentItem> = Vec::new();

        for rec in doc.edges {
            let src = *node_by_id.get(&rec.source_node).ok_or_else(|| TopologyError::DanglingNode {
                edge: rec.id.clone(),
                node: rec.source_node.clone(),
            })?;
            let dst = *node_by_id.get(&rec.target_node).ok_or_else(|| TopologyError::DanglingNode {
                edge: rec.id.clone(),
                node: rec.target_node.clone(),
            })?;
            if edge_by_id.contains_key(&rec.id) {
                return Err(TopologyError::DuplicateEdge(rec.id));
            }

            let edge = build_edge(rec, &doc.nodes[src], &doc.nodes[dst])?;
            let idx = edges.len() as EdgeIdx;

            let xy: Vec<[f64; 2]> = edge.centerline.iter().map(|p| frame.to_xy(*p)).collect();
            let mut along = 0.0;
            for (s, w) in xy.windows(2).enumerate() {
                items.push(SegmentItem { edge: idx, seg: s as u32, a: w[0], b: w[1], along0: along });
                along += dist_xy(w[0], w[1]);
            }

            edge_by_id.insert(edge.id.clone(), idx);
            edges.push(edge);
        }

        let successors = build_successors(&edges, &edge_by_id, &doc.connections)?;
        let tree = RTree::bulk_load(items);

        info!(nodes = doc.nodes.len(), edges = edges.len(), version, "grafo cargado");

        Ok(Self {
            version,
            nodes: doc.nodes,
            node_by_id,
            edges,
            edge_by_id,
            frame,
            tree,
            successors,
            closed: DashSet::new(),
        })
    }

    /// GeoJSON FeatureCollection: Points con `id` son nodos, LineStrings con
    /// `id`, `source_node`, `target_node` son aristas.
    pub fn from_geojson_str(text: &str, version: u64) -> Result<Self> {
        let gj: GeoJson = text.parse()?;
        let fc = match gj {
            GeoJson::FeatureCollection(fc) => fc,
            _ => return Err(TopologyError::NotFeatureCollection.into()),
        };

        let mut doc = TopologyDoc::default();
        for (index, feat) in fc.features.into_iter().enumerate() {
            let props = feat.properties.unwrap_or_default();
            let Some(geom) = feat.geometry else { continue };
            match &geom.value {
                Value::Point(c) if c.len() >= 2 => {
                    let id = prop_str(&props, &["id", "node_id"])
                        .ok_or(TopologyError::MissingProperty { index, prop: "id" })?;
                    doc.nodes.push(Node {
                        id,
                        lat: c[1],
                        lon: c[0],
                        has_camera: props.get("has_camera").and_then(|v| v.as_bool()).unwrap_or(false),
                    });
                }
                Value::LineString(_) | Value::MultiLineString(_) => {
                    let id = prop_str(&props, &["id", "edge_id"])
                        .ok_or(TopologyError::MissingProperty { index, prop: "id" })?;
                    let source_node = prop_str(&props, &["source_node", "u", "from"])
                        .ok_or(TopologyError::MissingProperty { index, prop: "source_node" })?;
                    let target_node = prop_str(&props, &["target_node", "v", "to"])
                        .ok_or(TopologyError::MissingProperty { index, prop: "target_node" })?;
                    doc.edges.push(EdgeRecord {
                        id,
                        source_node,
                        target_node,
                        geometry: line_from_geometry(&geom),
                        length_m: props
                            .get("length_m")
                            .or_else(|| props.get("distance_m"))
                            .and_then(|v| v.as_f64()),
                        lane_count: props
                            .get("lanes")
                            .or_else(|| props.get("lane_count"))
                            .and_then(|v| v.as_u64())
                            .map(|l| l.min(u8::MAX as u64) as u8),
                        road_class: road_class_from_props(&props),
                    });
                }
                _ => debug!(index, "feature ignorada (geometría no soportada)"),
            }
        }
        Ok(Self::from_topology(doc, version)?)
    }

    /// Carga desde disco; `.geojson` usa el lector GeoJSON, lo demás JSON de topología
    pub fn load(path: impl AsRef<Path>, version: u64) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_geojson = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("geojson"))
            .unwrap_or(false);
        if is_geojson {
            Self::from_geojson_str(&text, version)
        } else {
            let doc: TopologyDoc = serde_json::from_str(&text)?;
            Ok(Self::from_topology(doc, version)?)
        }
    }

    pub fn version(&self) -> u64 { self.version }
    pub fn frame(&self) -> &LocalFrame { &self.frame }
    pub fn edge_count(&self) -> usize { self.edges.len() }
    pub fn nodes(&self) -> &[Node] { &self.nodes }
    pub fn edges(&self) -> &[Edge] { &self.edges }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_by_id.get(id).map(|&i| &self.nodes[i])
    }

    pub fn edge(&self, idx: EdgeIdx) -> &Edge { &self.edges[idx as usize] }

    pub fn edge_idx(&self, id: &str) -> Option<EdgeIdx> { self.edge_by_id.get(id).copied() }

    pub fn edge_id(&self, idx: EdgeIdx) -> &str { &self.edges[idx as usize].id }

    pub fn to_xy(&self, p: LatLon) -> [f64; 2] { self.frame.to_xy(p) }

    /// Aristas cuyo eje pasa a `radius_m` o menos de `p` (metros locales).
    /// Una entrada por arista (su segmento más cercano), ordenadas por distancia.
    pub fn edges_within(&self, p: [f64; 2], radius_m: f64) -> Vec<EdgeHit> {
        let mut best: HashMap<EdgeIdx, EdgeHit> = HashMap::new();
        for it in self.tree.locate_within_distance(p, radius_m * radius_m) {
            let hit = hit_for(it, p);
            best.entry(it.edge)
                .and_modify(|h| if hit.distance_m < h.distance_m { *h = hit })
                .or_insert(hit);
        }
        sort_hits(best.into_values().collect())
    }

    /// Las `k` aristas más cercanas, sin límite de distancia
    pub fn nearest_edges(&self, p: [f64; 2], k: usize) -> Vec<EdgeHit> {
        let mut seen: HashSet<EdgeIdx> = HashSet::new();
        let mut out = Vec::with_capacity(k);
        for it in self.tree.nearest_neighbor_iter(&p) {
            if out.len() >= k { break; }
            if seen.insert(it.edge) {
                out.push(hit_for(it, p));
            }
        }
        sort_hits(out)
    }

    pub fn successors(&self, idx: EdgeIdx) -> &[Successor] { &self.successors[idx as usize] }

    pub fn is_successor(&self, from: EdgeIdx, to: EdgeIdx) -> bool {
        self.successors[from as usize].iter().any(|s| s.edge == to)
    }

    /// Marca/desmarca una arista como intransitable (recarga parcial de cierres)
    pub fn set_closed(&self, edge_id: &str, closed: bool) -> Result<()> {
        let idx = self.edge_idx(edge_id).ok_or_else(|| VialError::UnknownEdge(edge_id.to_string()))?;
        if closed {
            self.closed.insert(idx);
        } else {
            self.closed.remove(&idx);
        }
        Ok(())
    }

    pub fn is_closed(&self, idx: EdgeIdx) -> bool { self.closed.contains(&idx) }

    pub fn closed_edges(&self) -> Vec<EdgeIdx> {
        let mut v: Vec<EdgeIdx> = self.closed.iter().map(|e| *e).collect();
        v.sort_unstable();
        v
    }

    pub fn clear_closures(&self) { self.closed.clear(); }
}

fn hit_for(it: &SegmentItem, p: [f64; 2]) -> EdgeHit {
    let (d, t) = point_segment(p, it.a, it.b);
    EdgeHit {
        edge: it.edge,
        distance_m: d,
        along_m: it.along0 + t * dist_xy(it.a, it.b),
        bearing_deg: bearing_xy(it.a, it.b),
    }
}

fn sort_hits(mut v: Vec<EdgeHit>) -> Vec<EdgeHit> {
    v.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m).then(a.edge.cmp(&b.edge)));
    v
}

fn build_edge(rec: EdgeRecord, src: &Node, dst: &Node) -> std::result::Result<Edge, TopologyError> {
    let mut centerline = rec.geometry.unwrap_or_default();
    if centerline.len() < 2 {
        centerline = vec![LatLon::new(src.lat, src.lon), LatLon::new(dst.lat, dst.lon)];
    }
    if centerline.iter().any(|p| !p.is_valid()) {
        return Err(TopologyError::InvalidCoordinate(rec.id));
    }
    let geom_len = polyline_length_m(&centerline);
    if geom_len <= f64::EPSILON {
        return Err(TopologyError::DegenerateGeometry(rec.id));
    }
    let length_m = match rec.length_m {
        Some(l) if l.is_finite() && l > 0.0 => l,
        _ => geom_len,
    };
    Ok(Edge {
        id: rec.id,
        source_node: rec.source_node,
        target_node: rec.target_node,
        centerline,
        length_m,
        lane_count: rec.lane_count.unwrap_or(1).max(1),
        road_class: rec.road_class.unwrap_or_default(),
    })
}

/// Sucesoras de cada arista: giros explícitos si los hay, si no conectividad por nodo
fn build_successors(
    edges: &[Edge],
    edge_by_id: &HashMap<String, EdgeIdx>,
    connections: &[TurnConnection],
) -> std::result::Result<Vec<Vec<Successor>>, TopologyError> {
    let mut out: Vec<Vec<Successor>> = vec![Vec::new(); edges.len()];

    if !connections.is_empty() {
        for c in connections {
            let (Some(&f), Some(&t)) = (edge_by_id.get(&c.from_edge_id), edge_by_id.get(&c.to_edge_id)) else {
                return Err(TopologyError::DanglingConnection {
                    from: c.from_edge_id.clone(),
                    to: c.to_edge_id.clone(),
                });
            };
            let s = Successor { edge: t, u_turn: c.turn_direction == TurnDirection::UTurn };
            if !out[f as usize].contains(&s) {
                out[f as usize].push(s);
            }
        }
    } else {
        let mut by_source: HashMap<&str, Vec<EdgeIdx>> = HashMap::new();
        for (i, e) in edges.iter().enumerate() {
            by_source.entry(e.source_node.as_str()).or_default().push(i as EdgeIdx);
        }
        for (i, e) in edges.iter().enumerate() {
            if let Some(next) = by_source.get(e.target_node.as_str()) {
                for &n in next {
                    if n as usize == i { continue; }
                    let ne = &edges[n as usize];
                    let u_turn = ne.target_node == e.source_node;
                    out[i].push(Successor { edge: n, u_turn });
                }
            }
        }
    }
    for v in out.iter_mut() {
        v.sort_by_key(|s| s.edge);
    }
    Ok(out)
}

fn prop_str(props: &JsonMap<String, serde_json::Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match props.get(*k)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn road_class_from_props(props: &JsonMap<String, serde_json::Value>) -> Option<RoadClass> {
    if let Some(v) = props.get("road_class") {
        if let Ok(rc) = serde_json::from_value::<RoadClass>(v.clone()) {
            return Some(rc);
        }
    }
    props
        .get("road_type")
        .and_then(|v| v.as_i64())
        .map(|t| RoadClass::from_waze(t as i32))
}

fn line_from_geometry(g: &Geometry) -> Option<Vec<LatLon>> {
    let coords = match &g.value {
        Value::LineString(cs) => cs.clone(),
        // MultiLineString: se concatenan las partes en orden
        Value::MultiLineString(parts) => parts.iter().flatten().cloned().collect(),
        _ => return None,
    };
    let pts: Vec<LatLon> = coords
        .iter()
        .filter(|c| c.len() >= 2)
        .map(|c| LatLon::new(c[1], c[0]))
        .collect();
    if pts.len() >= 2 { Some(pts) } else { None }
}
