//! matcher.rs
//!
//! Map matching de eventos probe sobre las aristas del grafo.
//!
//! - Punto: arista más cercana dentro del buffer (respetando rumbo si lo hay).
//! - Polilínea: cada segmento del evento se trocea en tramos de como mucho
//!   `sample_step_m`; cada tramo se asigna a su arista más cercana dentro del
//!   buffer y las longitudes se acumulan por arista (fracción de solape).
//! - Sin arista dentro del buffer el evento sale como `Unmatched`, nunca se
//!   pega a la más cercana "por si acaso".
//!
//! Es una operación pura sobre `&RoadGraph`: se puede paralelizar sin más.

use std::collections::BTreeMap;

use crate::cfg::MatchCfg;
use crate::geo_utils::{angle_diff_deg, bearing_xy, clamp, dist_xy};
use crate::graph::{EdgeHit, RoadGraph};
use crate::types::{EdgeIdx, ProbeEvent};

#[derive(Clone, Debug, PartialEq)]
pub struct EdgeMatch {
    pub edge: EdgeIdx,
    /// Fracción de la geometría del evento que cae sobre esta arista
    pub overlap: f64,
    /// Distancia perpendicular media al eje (m)
    pub offset_m: f64,
    pub along_start_m: f64,
    pub along_end_m: f64,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MatchedEvent {
    pub event: ProbeEvent,
    /// Ordenadas por índice de arista
    pub edges: Vec<EdgeMatch>,
    pub closure: bool,
    pub tolerance_m: f64,
}

impl MatchedEvent {
    pub fn edge_indices(&self) -> Vec<EdgeIdx> { self.edges.iter().map(|m| m.edge).collect() }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnmatchedEvent {
    pub event: ProbeEvent,
    /// Distancia a la arista más cercana (fuera del buffer), si hay alguna
    pub nearest_m: Option<f64>,
    pub tolerance_m: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MatchResult {
    Matched(MatchedEvent),
    Unmatched(UnmatchedEvent),
}

/// Mejor candidato compatible con el rumbo. Sin rumbo gana el más cercano.
/// `hits` ya viene ordenado por distancia.
pub(crate) fn best_hit(hits: &[EdgeHit], heading: Option<f64>, heading_tol_deg: f64) -> Option<EdgeHit> {
    match heading {
        Some(h) => hits.iter().find(|c| angle_diff_deg(c.bearing_deg, h) <= heading_tol_deg).copied(),
        None => hits.first().copied(),
    }
}

#[derive(Default)]
struct Acc {
    len: f64,
    offset_len: f64,
    along_min: f64,
    along_max: f64,
}

#[derive(Clone, Debug)]
pub struct SpatialMapMatcher {
    cfg: MatchCfg,
}

impl SpatialMapMatcher {
    pub fn new(cfg: MatchCfg) -> Self { Self { cfg } }

    pub fn cfg(&self) -> &MatchCfg { &self.cfg }

    pub fn match_event(&self, graph: &RoadGraph, ev: ProbeEvent) -> MatchResult {
        self.match_with_tolerance(graph, ev, self.cfg.tolerance_m)
    }

    pub fn match_with_tolerance(&self, graph: &RoadGraph, ev: ProbeEvent, tolerance_m: f64) -> MatchResult {
        let xy: Vec<[f64; 2]> = ev.geometry.points().iter().map(|p| graph.to_xy(*p)).collect();
        let total: f64 = xy.windows(2).map(|w| dist_xy(w[0], w[1])).sum();

        let edges = if xy.is_empty() {
            Vec::new()
        } else if xy.len() == 1 || total <= f64::EPSILON {
            self.match_point(graph, xy[0], ev.heading_deg, tolerance_m)
        } else {
            self.match_line(graph, &xy, total, ev.heading_deg, tolerance_m)
        };

        if edges.is_empty() {
            let nearest_m = xy
                .iter()
                .filter_map(|p| graph.nearest_edges(*p, 1).first().map(|h| h.distance_m))
                .min_by(|a, b| a.total_cmp(b));
            return MatchResult::Unmatched(UnmatchedEvent { event: ev, nearest_m, tolerance_m });
        }

        let closure = ev.is_closure();
        MatchResult::Matched(MatchedEvent { event: ev, edges, closure, tolerance_m })
    }

    fn match_point(&self, graph: &RoadGraph, p: [f64; 2], heading: Option<f64>, tol: f64) -> Vec<EdgeMatch> {
        let hits = graph.edges_within(p, tol);
        let Some(h) = best_hit(&hits, heading, self.cfg.heading_tolerance_deg) else {
            return Vec::new();
        };
        vec![EdgeMatch {
            edge: h.edge,
            overlap: 1.0,
            offset_m: h.distance_m,
            along_start_m: h.along_m,
            along_end_m: h.along_m,
            confidence: confidence(h.distance_m, tol),
        }]
    }

    fn match_line(
        &self,
        graph: &RoadGraph,
        xy: &[[f64; 2]],
        total: f64,
        heading: Option<f64>,
        tol: f64,
    ) -> Vec<EdgeMatch> {
        let step = self.cfg.sample_step_m.max(0.5);
        let mut acc: BTreeMap<EdgeIdx, Acc> = BTreeMap::new();

        for w in xy.windows(2) {
            let (a, b) = (w[0], w[1]);
            let seg_len = dist_xy(a, b);
            if seg_len <= f64::EPSILON { continue; }

            let seg_heading = if self.cfg.polyline_implies_heading {
                Some(bearing_xy(a, b))
            } else {
                heading
            };

            let n = (seg_len / step).ceil().max(1.0) as usize;
            let piece = seg_len / n as f64;
            for i in 0..n {
                let t = (i as f64 + 0.5) / n as f64;
                let mid = [a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1])];
                let hits = graph.edges_within(mid, tol);
                let Some(h) = best_hit(&hits, seg_heading, self.cfg.heading_tolerance_deg) else {
                    continue;
                };
                let e = acc.entry(h.edge).or_insert_with(|| Acc {
                    along_min: f64::INFINITY,
                    along_max: f64::NEG_INFINITY,
                    ..Default::default()
                });
                e.len += piece;
                e.offset_len += piece * h.distance_m;
                e.along_min = e.along_min.min(h.along_m);
                e.along_max = e.along_max.max(h.along_m);
            }
        }

        acc.into_iter()
            .map(|(edge, a)| {
                let offset_m = a.offset_len / a.len;
                EdgeMatch {
                    edge,
                    overlap: clamp(a.len / total, 0.0, 1.0),
                    offset_m,
                    along_start_m: a.along_min,
                    along_end_m: a.along_max,
                    confidence: confidence(offset_m, tol),
                }
            })
            .collect()
    }
}

#[inline]
fn confidence(offset_m: f64, tol: f64) -> f64 {
    if tol <= 0.0 { return 0.0; }
    clamp(1.0 - offset_m / tol, 0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_m;
    use crate::types::{AlertType, EdgeRecord, EventGeometry, LatLon, Node, ProbeKind, TopologyDoc};

    const O: LatLon = LatLon { lat: -12.05, lon: -77.04 };

    /// Avenida dividida este-oeste: "east" (A->B) a y=0, "west" (B'->A') a y=+12 m,
    /// y una calle norte-sur "ns" lejos (x = 600 m)
    fn graph() -> RoadGraph {
        let n = |id: &str, p: LatLon| Node { id: id.into(), lat: p.lat, lon: p.lon, has_camera: false };
        let e = |id: &str, s: &str, t: &str| EdgeRecord {
            id: id.into(),
            source_node: s.into(),
            target_node: t.into(),
            geometry: None,
            length_m: None,
            lane_count: None,
            road_class: None,
        };
        let doc = TopologyDoc {
            nodes: vec![
                n("A", O),
                n("B", offset_m(O, 0.0, 400.0)),
                n("A2", offset_m(O, 12.0, 0.0)),
                n("B2", offset_m(O, 12.0, 400.0)),
                n("N1", offset_m(O, -200.0, 600.0)),
                n("N2", offset_m(O, 200.0, 600.0)),
            ],
            edges: vec![e("east", "A", "B"), e("west", "B2", "A2"), e("ns", "N1", "N2")],
            connections: vec![],
        };
        RoadGraph::from_topology(doc, 1).unwrap()
    }

    fn jam(points: Vec<LatLon>) -> ProbeEvent {
        ProbeEvent {
            event_uuid: "J".into(),
            observed_at_ms: 0,
            kind: ProbeKind::Jam,
            alert_type: None,
            subtype: None,
            geometry: EventGeometry::Line(points),
            speed_mps: Some(2.0),
            delay_s: None,
            severity_level: Some(3),
            length_m: None,
            road_type: None,
            reliability: None,
            confidence: None,
            heading_deg: None,
            regular_speed_mps: None,
        }
    }

    fn matcher() -> SpatialMapMatcher { SpatialMapMatcher::new(MatchCfg::default()) }

    #[test]
    fn polilinea_dentro_del_buffer_respeta_sentido() {
        let g = graph();
        // hacia el este, 2 m al sur de "east": ambos carriles a <15 m, el rumbo decide
        let ev = jam(vec![offset_m(O, -2.0, 50.0), offset_m(O, -2.0, 250.0)]);
        let MatchResult::Matched(m) = matcher().match_event(&g, ev) else { panic!("sin match") };
        assert_eq!(m.edges.len(), 1);
        assert_eq!(g.edge_id(m.edges[0].edge), "east");
        assert!(m.edges[0].overlap > 0.99);
        assert!((m.edges[0].offset_m - 2.0).abs() < 0.2);
        assert!(m.edges[0].along_start_m < m.edges[0].along_end_m);

        // el mismo trazo al revés cae en "west"
        let ev = jam(vec![offset_m(O, 10.0, 250.0), offset_m(O, 10.0, 50.0)]);
        let MatchResult::Matched(m) = matcher().match_event(&g, ev) else { panic!("sin match") };
        assert_eq!(g.edge_id(m.edges[0].edge), "west");
    }

    #[test]
    fn evento_a_20m_con_tolerancia_15_no_casa() {
        let g = graph();
        let ev = jam(vec![offset_m(O, -20.0, 50.0), offset_m(O, -20.0, 250.0)]);
        let MatchResult::Unmatched(u) = matcher().match_event(&g, ev) else { panic!("no debía casar") };
        let d = u.nearest_m.unwrap();
        assert!((d - 20.0).abs() < 0.5, "d = {d}");
        assert_eq!(u.tolerance_m, 15.0);
    }

    #[test]
    fn reintento_con_mas_tolerancia() {
        let g = graph();
        let ev = jam(vec![offset_m(O, -20.0, 50.0), offset_m(O, -20.0, 250.0)]);
        assert!(matches!(matcher().match_with_tolerance(&g, ev, 25.0), MatchResult::Matched(_)));
    }

    #[test]
    fn evento_largo_reparte_solape() {
        let g = graph();
        // 300 m sobre "east" (x de 100 a 400) y 100 m más allá del nodo B;
        // los primeros ~15 m de la cola siguen dentro del buffer de "east"
        let ev = jam(vec![
            offset_m(O, -1.0, 100.0),
            offset_m(O, -1.0, 400.0),
            offset_m(O, -1.0, 500.0),
        ]);
        let MatchResult::Matched(m) = matcher().match_event(&g, ev) else { panic!("sin match") };
        assert_eq!(m.edges.len(), 1);
        let f = m.edges[0].overlap;
        assert!((f - 315.0 / 400.0).abs() < 0.02, "f = {f}");
    }

    #[test]
    fn polilinea_que_cruza_dos_aristas() {
        let g = graph();
        // tramo por "east" y giro al norte sobre "ns"
        let ev = jam(vec![
            offset_m(O, -1.0, 300.0),
            offset_m(O, -1.0, 398.0),
            offset_m(O, 0.0, 598.0),
            offset_m(O, 150.0, 598.0),
        ]);
        let MatchResult::Matched(m) = matcher().match_event(&g, ev) else { panic!("sin match") };
        let ids: Vec<&str> = m.edges.iter().map(|e| g.edge_id(e.edge)).collect();
        assert!(ids.contains(&"east") && ids.contains(&"ns"), "{ids:?}");
        let sum: f64 = m.edges.iter().map(|e| e.overlap).sum();
        assert!(sum <= 1.0 + 1e-9);
    }

    #[test]
    fn alerta_puntual_con_rumbo_y_cierre() {
        let g = graph();
        let mut ev = jam(vec![]);
        ev.kind = ProbeKind::Alert;
        ev.alert_type = Some(AlertType::RoadClosed);
        ev.geometry = EventGeometry::Point(offset_m(O, 6.0, 200.0));
        ev.heading_deg = Some(270.0);
        let MatchResult::Matched(m) = matcher().match_event(&g, ev.clone()) else { panic!("sin match") };
        assert_eq!(g.edge_id(m.edges[0].edge), "west");
        assert!(m.closure);
        assert_eq!(m.edges[0].overlap, 1.0);

        ev.heading_deg = Some(90.0);
        let MatchResult::Matched(m) = matcher().match_event(&g, ev.clone()) else { panic!("sin match") };
        assert_eq!(g.edge_id(m.edges[0].edge), "east");

        // rumbo norte: ninguna arista cercana es compatible
        ev.heading_deg = Some(0.0);
        assert!(matches!(matcher().match_event(&g, ev), MatchResult::Unmatched(_)));
    }

    #[test]
    fn geometria_vacia_no_casa() {
        let g = graph();
        let ev = jam(vec![]);
        let MatchResult::Unmatched(u) = matcher().match_event(&g, ev) else { panic!() };
        assert!(u.nearest_m.is_none());
    }
}
