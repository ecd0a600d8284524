//! lifecycle.rs
//!
//! Ciclo de vida de ocurrencias: eventos probe (por `event_uuid`) y tracks
//! de visión (por `track_uuid`).
//!
//! - Estado New -> Active -> Closed por ocurrencia.
//! - Cada observación se anexa al historial; nunca se sobreescribe.
//! - Observaciones con timestamp igual o anterior al último conocido son
//!   duplicados: no cambian nada.
//! - Cierre de probe: ausencia del feed más allá del margen configurado.
//! - Cierre de track: hueco sin frames mayor que el timeout, o salida
//!   explícita del campo de visión.
//! - Exclusión por clave: cada ocurrencia vive en su entrada del `DashMap`,
//!   así que ocurrencias distintas no se bloquean entre sí.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::cfg::LifecycleCfg;
use crate::geo_utils::{bearing_deg, haversine_m};
use crate::graph::{EdgeHit, RoadGraph};
use crate::projector::pixel_rate;
use crate::types::{
    severity_rank, EdgeIdx, LatLon, ProbeEvent, ProbeKind, VehicleClass, VisionSample,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OccurrenceStatus {
    New,
    Active,
    Closed,
}

/// Resultado de aplicar una observación
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observed {
    New,
    Updated,
    /// Una observación más nueva llegó tras el cierre
    Reopened,
    Duplicate,
}

impl Observed {
    pub fn is_duplicate(&self) -> bool { matches!(self, Observed::Duplicate) }
}

// ---------------------------------
// Probe
// ---------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct ProbeObservation {
    pub event: ProbeEvent,
    /// Aristas del match (vacío si no hubo match)
    pub edges: Vec<EdgeIdx>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProbeOccurrence {
    pub event_uuid: String,
    pub kind: ProbeKind,
    pub status: OccurrenceStatus,
    pub first_observed_ms: i64,
    pub last_observed_ms: i64,
    /// Última vez que el feed lo listó (observación o ciclo)
    pub last_present_ms: i64,
    pub closed_at_ms: Option<i64>,
    /// Aristas afectadas por observaciones de cierre de vía
    pub closure_edges: BTreeSet<EdgeIdx>,
    /// Instantes en que el cierre estuvo presente (observación o ciclo del feed)
    pub closure_seen: BTreeSet<i64>,
    pub history: Vec<ProbeObservation>,
    /// Observaciones antiguas descartadas al compactar; la identidad se conserva
    pub compacted_observations: u32,
}

impl ProbeOccurrence {
    pub fn latest(&self) -> Option<&ProbeObservation> { self.history.last() }

    /// Unión de aristas de todo el historial
    pub fn edges(&self) -> Vec<EdgeIdx> {
        let set: BTreeSet<EdgeIdx> = self.history.iter().flat_map(|o| o.edges.iter().copied()).collect();
        set.into_iter().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub event_uuid: String,
    pub kind: ProbeKind,
    #[serde(skip)]
    pub edges: Vec<EdgeIdx>,
    pub first_observed_ms: i64,
    pub closed_at_ms: i64,
    pub duration_s: f64,
    pub observations: u32,
    pub disappearance_rate: f64,
    pub mean_speed_mps: Option<f64>,
    pub max_severity: Option<i8>,
    pub closure: bool,
}

// ---------------------------------
// Visión
// ---------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct TrackPoint {
    pub frame_ts_ms: i64,
    pub pixel: [f64; 2],
    pub geo: Option<LatLon>,
    pub heading_deg: Option<f64>,
    pub edge: Option<EdgeIdx>,
    pub pixel_speed: Option<f64>,
    pub geo_speed_mps: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackOccurrence {
    pub track_uuid: String,
    pub camera_id: String,
    pub class: VehicleClass,
    pub status: OccurrenceStatus,
    pub closed_at_ms: Option<i64>,
    pub points: Vec<TrackPoint>,
    /// Muestras intermedias descartadas al compactar
    pub compacted_samples: u32,
    /// Índice del primer punto aún no contabilizado en transiciones
    flow_from: usize,
}

impl TrackOccurrence {
    pub fn entry_ms(&self) -> i64 { self.points.first().map(|p| p.frame_ts_ms).unwrap_or_default() }
    pub fn exit_ms(&self) -> i64 { self.points.last().map(|p| p.frame_ts_ms).unwrap_or_default() }

    /// Arista con más muestras (empate: menor índice)
    pub fn resolved_edge(&self) -> Option<EdgeIdx> {
        let mut counts: BTreeMap<EdgeIdx, u32> = BTreeMap::new();
        for e in self.points.iter().filter_map(|p| p.edge) {
            *counts.entry(e).or_default() += 1;
        }
        let mut best: Option<(EdgeIdx, u32)> = None;
        for (e, c) in counts {
            if best.map_or(true, |(_, bc)| c > bc) {
                best = Some((e, c));
            }
        }
        best.map(|(e, _)| e)
    }

    /// Secuencia de aristas recorridas desde `from`, sin repeticiones consecutivas
    fn path_from(&self, from: usize) -> Vec<EdgeIdx> {
        let mut path: Vec<EdgeIdx> = Vec::new();
        for e in self.points[from.min(self.points.len())..].iter().filter_map(|p| p.edge) {
            if path.last() != Some(&e) {
                path.push(e);
            }
        }
        path
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackSummary {
    pub track_uuid: String,
    pub camera_id: String,
    pub class_label: String,
    #[serde(skip)]
    pub class: VehicleClass,
    #[serde(skip)]
    pub path: Vec<EdgeIdx>,
    #[serde(skip)]
    pub resolved_edge: Option<EdgeIdx>,
    pub entry_ms: i64,
    pub exit_ms: i64,
    pub duration_s: f64,
    pub samples: u32,
    pub disappearance_rate: f64,
    pub mean_pixel_speed: Option<f64>,
    pub mean_speed_mps: Option<f64>,
    /// Sin calibración: nunca salió del espacio de píxeles
    pub pixel_only: bool,
}

impl TrackSummary {
    pub fn is_unmatched(&self) -> bool { self.resolved_edge.is_none() }
}

/// Resultado de anexar una muestra de visión
#[derive(Clone, Debug, PartialEq)]
pub struct SampleObserved {
    pub observed: Observed,
    pub point: Option<TrackPoint>,
}

#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    pub probes: Vec<ProbeSummary>,
    pub tracks: Vec<TrackSummary>,
}

pub struct EventLifecycleTracker {
    cfg: LifecycleCfg,
    probes: DashMap<String, ProbeOccurrence>,
    tracks: DashMap<String, TrackOccurrence>,
    transitions: DashMap<(EdgeIdx, EdgeIdx), u64>,
}

impl EventLifecycleTracker {
    pub fn new(cfg: LifecycleCfg) -> Self {
        Self { cfg, probes: DashMap::new(), tracks: DashMap::new(), transitions: DashMap::new() }
    }

    pub fn cfg(&self) -> &LifecycleCfg { &self.cfg }

    /// Registra una observación probe ya emparejada (o no) con aristas
    pub fn observe_probe(&self, ev: &ProbeEvent, edges: &[EdgeIdx], closure: bool) -> Observed {
        let ts = ev.observed_at_ms;
        let obs = ProbeObservation { event: ev.clone(), edges: edges.to_vec() };
        let mut entry = self.probes.entry(ev.event_uuid.clone()).or_insert_with(|| ProbeOccurrence {
            event_uuid: ev.event_uuid.clone(),
            kind: ev.kind,
            status: OccurrenceStatus::New,
            first_observed_ms: ts,
            last_observed_ms: ts,
            last_present_ms: ts,
            closed_at_ms: None,
            closure_edges: BTreeSet::new(),
            closure_seen: BTreeSet::new(),
            history: Vec::new(),
            compacted_observations: 0,
        });
        let occ = entry.value_mut();

        if occ.history.is_empty() {
            if closure {
                occ.closure_edges.extend(edges.iter().copied());
                occ.closure_seen.insert(ts);
            }
            occ.history.push(obs);
            return Observed::New;
        }
        if ts <= occ.last_observed_ms {
            return Observed::Duplicate;
        }

        let reopened = occ.status == OccurrenceStatus::Closed;
        if reopened {
            debug!(uuid = %occ.event_uuid, "evento reaparece tras cierre");
            occ.closed_at_ms = None;
        }
        occ.status = OccurrenceStatus::Active;
        occ.last_observed_ms = ts;
        occ.last_present_ms = occ.last_present_ms.max(ts);
        if closure {
            occ.closure_edges.extend(edges.iter().copied());
            occ.closure_seen.insert(ts);
        }
        occ.history.push(obs);
        if reopened { Observed::Reopened } else { Observed::Updated }
    }

    /// Completa una observación que no había casado (reintento con más buffer)
    pub fn attach_edges(&self, event_uuid: &str, observed_at_ms: i64, edges: &[EdgeIdx], closure: bool) -> bool {
        let Some(mut occ) = self.probes.get_mut(event_uuid) else {
            return false;
        };
        let occ = occ.value_mut();
        let Some(obs) = occ
            .history
            .iter_mut()
            .find(|o| o.event.observed_at_ms == observed_at_ms && o.edges.is_empty())
        else {
            return false;
        };
        obs.edges = edges.to_vec();
        if closure {
            occ.closure_edges.extend(edges.iter().copied());
            occ.closure_seen.insert(observed_at_ms);
        }
        true
    }

    /// El evento sigue listado en un ciclo del feed (sin observación nueva)
    pub fn touch_probe(&self, event_uuid: &str, seen_at_ms: i64) {
        if let Some(mut occ) = self.probes.get_mut(event_uuid) {
            if occ.status == OccurrenceStatus::Closed {
                return;
            }
            if seen_at_ms > occ.last_present_ms {
                occ.last_present_ms = seen_at_ms;
            }
            if !occ.closure_edges.is_empty() {
                occ.closure_seen.insert(seen_at_ms);
            }
        }
    }

    pub fn probe(&self, event_uuid: &str) -> Option<ProbeOccurrence> {
        self.probes.get(event_uuid).map(|o| o.value().clone())
    }

    /// Anexa una muestra de visión. `resolve` decide la arista a partir del
    /// punto proyectado y el rumbo derivado; se llama con la entrada bloqueada.
    /// Las muestras previas al primer rumbo se re-resuelven con él.
    pub fn observe_sample<F>(
        &self,
        s: &VisionSample,
        ts_ms: i64,
        geo: Option<LatLon>,
        resolve: F,
    ) -> SampleObserved
    where
        F: Fn(LatLon, Option<f64>) -> Option<EdgeHit>,
    {
        let mut entry = self.tracks.entry(s.track_uuid.clone()).or_insert_with(|| TrackOccurrence {
            track_uuid: s.track_uuid.clone(),
            camera_id: s.camera_id.clone(),
            class: VehicleClass::from_coco(s.class_id),
            status: OccurrenceStatus::New,
            closed_at_ms: None,
            points: Vec::new(),
            compacted_samples: 0,
            flow_from: 0,
        });
        let occ = entry.value_mut();

        let prev = occ.points.last().cloned();
        if let Some(p) = &prev {
            if ts_ms <= p.frame_ts_ms {
                return SampleObserved { observed: Observed::Duplicate, point: None };
            }
        }

        let mut point = TrackPoint {
            frame_ts_ms: ts_ms,
            pixel: s.pixel,
            geo,
            heading_deg: None,
            edge: None,
            pixel_speed: None,
            geo_speed_mps: None,
        };
        if let Some(p) = &prev {
            let dt_s = (ts_ms - p.frame_ts_ms) as f64 / 1000.0;
            point.pixel_speed = pixel_rate(p.pixel, s.pixel, dt_s);
            if let (Some(a), Some(b)) = (p.geo, geo) {
                let d = haversine_m(a, b);
                point.geo_speed_mps = Some(d / dt_s);
                point.heading_deg = if d >= self.cfg.min_heading_move_m {
                    Some(bearing_deg(a, b))
                } else {
                    p.heading_deg
                };
            }
        }
        if let Some(g) = geo {
            point.edge = resolve(g, point.heading_deg).map(|h| h.edge);
        }
        if let (Some(h), Some(p)) = (point.heading_deg, &prev) {
            if p.heading_deg.is_none() {
                for q in occ.points.iter_mut().filter(|q| q.heading_deg.is_none()) {
                    if let Some(g) = q.geo {
                        q.edge = resolve(g, Some(h)).map(|hit| hit.edge);
                    }
                }
            }
        }

        let observed = match (occ.status, occ.points.is_empty()) {
            (_, true) => Observed::New,
            (OccurrenceStatus::Closed, false) => {
                occ.closed_at_ms = None;
                Observed::Reopened
            }
            _ => Observed::Updated,
        };
        if !occ.points.is_empty() {
            occ.status = OccurrenceStatus::Active;
        }
        occ.points.push(point.clone());
        SampleObserved { observed, point: Some(point) }
    }

    pub fn track(&self, track_uuid: &str) -> Option<TrackOccurrence> {
        self.tracks.get(track_uuid).map(|t| t.value().clone())
    }

    /// Salida explícita del campo de visión
    pub fn close_track(&self, track_uuid: &str) -> Option<TrackSummary> {
        let mut occ = self.tracks.get_mut(track_uuid)?;
        if occ.status == OccurrenceStatus::Closed || occ.points.is_empty() {
            return None;
        }
        Some(self.close_track_locked(occ.value_mut()))
    }

    fn close_track_locked(&self, occ: &mut TrackOccurrence) -> TrackSummary {
        occ.status = OccurrenceStatus::Closed;
        occ.closed_at_ms = Some(occ.exit_ms());
        let from = occ.flow_from;
        occ.flow_from = occ.points.len();
        self.track_summary(occ, from)
    }

    fn track_summary(&self, occ: &TrackOccurrence, flow_from: usize) -> TrackSummary {
        let n = occ.points.len();
        let (entry, exit) = (occ.entry_ms(), occ.exit_ms());
        let expected = ((exit - entry) / self.cfg.nominal_frame_interval_ms.max(1)) + 1;
        TrackSummary {
            track_uuid: occ.track_uuid.clone(),
            camera_id: occ.camera_id.clone(),
            class_label: occ.class.label(),
            class: occ.class,
            path: occ.path_from(flow_from),
            resolved_edge: occ.resolved_edge(),
            entry_ms: entry,
            exit_ms: exit,
            duration_s: (exit - entry) as f64 / 1000.0,
            samples: n as u32 + occ.compacted_samples,
            disappearance_rate: disappearance(n as i64 + occ.compacted_samples as i64, expected),
            mean_pixel_speed: mean(occ.points.iter().filter_map(|p| p.pixel_speed)),
            mean_speed_mps: mean(occ.points.iter().filter_map(|p| p.geo_speed_mps)),
            pixel_only: occ.points.iter().all(|p| p.geo.is_none()),
        }
    }

    fn probe_summary(&self, occ: &ProbeOccurrence) -> ProbeSummary {
        let closed_at = occ.closed_at_ms.unwrap_or(occ.last_present_ms);
        let n = occ.history.len() as i64 + occ.compacted_observations as i64;
        let expected = ((occ.last_present_ms - occ.first_observed_ms)
            / self.cfg.nominal_probe_cadence_ms.max(1))
            + 1;
        let max_severity = occ
            .history
            .iter()
            .filter_map(|o| o.event.severity_level)
            .max_by_key(|l| severity_rank(*l));
        ProbeSummary {
            event_uuid: occ.event_uuid.clone(),
            kind: occ.kind,
            edges: occ.edges(),
            first_observed_ms: occ.first_observed_ms,
            closed_at_ms: closed_at,
            duration_s: (closed_at - occ.first_observed_ms) as f64 / 1000.0,
            observations: n as u32,
            disappearance_rate: disappearance(n, expected),
            mean_speed_mps: mean(occ.history.iter().filter_map(|o| o.event.speed_mps)),
            max_severity,
            closure: !occ.closure_edges.is_empty(),
        }
    }

    /// Cierra lo vencido a `now` y devuelve los resúmenes de lo cerrado
    pub fn sweep(&self, now_ms: i64) -> SweepReport {
        let mut report = SweepReport::default();
        let grace = self.cfg.probe_absence_grace_ms;
        for mut occ in self.probes.iter_mut() {
            if occ.status != OccurrenceStatus::Closed && occ.last_present_ms + grace < now_ms {
                occ.status = OccurrenceStatus::Closed;
                occ.closed_at_ms = Some(occ.last_present_ms + grace);
                report.probes.push(self.probe_summary(occ.value()));
            }
        }
        let gap = self.cfg.frame_gap_timeout_ms;
        for mut occ in self.tracks.iter_mut() {
            if occ.status != OccurrenceStatus::Closed && !occ.points.is_empty() && occ.exit_ms() + gap < now_ms {
                let summary = self.close_track_locked(occ.value_mut());
                report.tracks.push(summary);
            }
        }
        report.probes.sort_by(|a, b| a.event_uuid.cmp(&b.event_uuid));
        report.tracks.sort_by(|a, b| a.track_uuid.cmp(&b.track_uuid));
        if !report.probes.is_empty() || !report.tracks.is_empty() {
            debug!(probes = report.probes.len(), tracks = report.tracks.len(), "ocurrencias cerradas");
        }
        report
    }

    /// Aristas con un cierre de vía presente en el feed dentro de `[start, end)`
    pub fn closure_edges(&self, start_ms: i64, end_ms: i64) -> BTreeSet<EdgeIdx> {
        let mut out = BTreeSet::new();
        if start_ms >= end_ms {
            return out;
        }
        for occ in self.probes.iter() {
            if occ.closure_seen.range(start_ms..end_ms).next().is_some() {
                out.extend(occ.closure_edges.iter().copied());
            }
        }
        out
    }

    /// Cuenta transiciones A -> B del recorrido, sólo entre aristas contiguas
    pub fn record_transitions(&self, graph: &RoadGraph, path: &[EdgeIdx]) -> usize {
        let mut n = 0;
        for w in path.windows(2) {
            let (a, b) = (w[0], w[1]);
            if (a as usize) < graph.edge_count() && graph.is_successor(a, b) {
                *self.transitions.entry((a, b)).or_insert(0) += 1;
                n += 1;
            }
        }
        n
    }

    pub fn transition_count(&self, from: EdgeIdx, to: EdgeIdx) -> u64 {
        self.transitions.get(&(from, to)).map(|c| *c).unwrap_or(0)
    }

    pub fn transitions(&self) -> BTreeMap<(EdgeIdx, EdgeIdx), u64> {
        self.transitions.iter().map(|kv| (*kv.key(), *kv.value())).collect()
    }

    /// Al cambiar de topología los índices de arista dejan de ser válidos
    pub fn reset_for_topology(&self) {
        self.transitions.clear();
        self.tracks.clear();
        for mut occ in self.probes.iter_mut() {
            occ.closure_edges.clear();
            occ.closure_seen.clear();
            for o in occ.history.iter_mut() {
                o.edges.clear();
            }
        }
    }

    /// Compacta ocurrencias cerradas antes de `older_than_ms`: se queda con la
    /// última observación (y la primera muestra de un track) y cuenta el resto.
    /// La clave nunca se olvida, así que un reenvío sigue siendo duplicado.
    pub fn compact_closed(&self, older_than_ms: i64) -> usize {
        let expired = |status: OccurrenceStatus, closed_at: Option<i64>| {
            status == OccurrenceStatus::Closed && matches!(closed_at, Some(c) if c < older_than_ms)
        };
        let mut n = 0;
        for mut occ in self.probes.iter_mut() {
            if !expired(occ.status, occ.closed_at_ms) || (occ.history.len() <= 1 && occ.closure_seen.is_empty()) {
                continue;
            }
            let occ = occ.value_mut();
            let dropped = occ.history.len().saturating_sub(1);
            occ.history.drain(..dropped);
            occ.compacted_observations += dropped as u32;
            occ.closure_seen.clear();
            n += 1;
        }
        for mut occ in self.tracks.iter_mut() {
            if !expired(occ.status, occ.closed_at_ms) || occ.points.len() <= 2 {
                continue;
            }
            let occ = occ.value_mut();
            let last = occ.points.len() - 1;
            occ.points.drain(1..last);
            occ.compacted_samples += (last - 1) as u32;
            occ.flow_from = occ.points.len();
            n += 1;
        }
        n
    }

    pub fn open_probes(&self) -> usize {
        self.probes.iter().filter(|o| o.status != OccurrenceStatus::Closed).count()
    }

    pub fn open_tracks(&self) -> usize {
        self.tracks.iter().filter(|o| o.status != OccurrenceStatus::Closed).count()
    }

    pub fn open_occurrences(&self) -> usize { self.open_probes() + self.open_tracks() }
}

fn mean(it: impl Iterator<Item = f64>) -> Option<f64> {
    let mut v: Vec<f64> = it.filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(|a, b| a.total_cmp(b));
    Some(v.iter().sum::<f64>() / v.len() as f64)
}

fn disappearance(observed: i64, expected: i64) -> f64 {
    if expected <= 0 {
        return 0.0;
    }
    (1.0 - observed as f64 / expected as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_m;
    use crate::types::EventGeometry;

    const O: LatLon = LatLon { lat: -12.05, lon: -77.04 };

    fn jam(uuid: &str, ts: i64, speed: f64, level: i8) -> ProbeEvent {
        ProbeEvent {
            event_uuid: uuid.into(),
            observed_at_ms: ts,
            kind: ProbeKind::Jam,
            alert_type: None,
            subtype: None,
            geometry: EventGeometry::Line(vec![O, offset_m(O, 0.0, 50.0)]),
            speed_mps: Some(speed),
            delay_s: Some(30.0),
            severity_level: Some(level),
            length_m: Some(50.0),
            road_type: None,
            reliability: None,
            confidence: None,
            heading_deg: None,
            regular_speed_mps: None,
        }
    }

    fn sample(track: &str, class_id: u32, ts: i64, u: f64) -> VisionSample {
        VisionSample {
            track_uuid: track.into(),
            camera_id: "C1".into(),
            class_id,
            frame_ts_ms: ts,
            pixel: [u, 0.0],
            confidence: 0.9,
        }
    }

    fn hit(edge: EdgeIdx) -> Option<EdgeHit> {
        Some(EdgeHit { edge, distance_m: 1.0, along_m: 0.0, bearing_deg: 90.0 })
    }

    #[test]
    fn ciclo_new_active_closed() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        assert_eq!(t.observe_probe(&jam("J1", 0, 2.0, 4), &[7], false), Observed::New);
        assert_eq!(t.probe("J1").unwrap().status, OccurrenceStatus::New);
        assert_eq!(t.observe_probe(&jam("J1", 90_000, 1.0, 5), &[7], false), Observed::Updated);
        let occ = t.probe("J1").unwrap();
        assert_eq!(occ.status, OccurrenceStatus::Active);
        assert_eq!(occ.history.len(), 2);
        assert_eq!(occ.history[0].event.speed_mps, Some(2.0));

        // sigue listado en el ciclo de t=200s
        t.touch_probe("J1", 200_000);
        assert!(t.sweep(200_000 + 360_000).probes.is_empty());
        let r = t.sweep(200_000 + 360_001);
        assert_eq!(r.probes.len(), 1);
        let s = &r.probes[0];
        assert_eq!(s.closed_at_ms, 560_000);
        assert_eq!(s.observations, 2);
        assert_eq!(s.max_severity, Some(5));
        assert!((s.mean_speed_mps.unwrap() - 1.5).abs() < 1e-9);
        assert!((s.duration_s - 560.0).abs() < 1e-9);
        // 200 s a cadencia 120 s -> 2 esperadas, 2 vistas
        assert_eq!(s.disappearance_rate, 0.0);
        assert_eq!(t.open_occurrences(), 0);
    }

    #[test]
    fn duplicados_no_cambian_estado() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        t.observe_probe(&jam("J1", 0, 2.0, 4), &[7], false);
        t.observe_probe(&jam("J1", 90_000, 1.0, 5), &[7], false);
        let before = t.probe("J1").unwrap();
        assert!(t.observe_probe(&jam("J1", 90_000, 9.0, 1), &[7], false).is_duplicate());
        assert!(t.observe_probe(&jam("J1", 30_000, 9.0, 1), &[3], true).is_duplicate());
        assert_eq!(t.probe("J1").unwrap(), before);
    }

    #[test]
    fn reaparicion_reabre() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        t.observe_probe(&jam("J1", 0, 2.0, 4), &[7], false);
        assert_eq!(t.sweep(400_000).probes.len(), 1);
        assert_eq!(t.observe_probe(&jam("J1", 500_000, 3.0, 2), &[7], false), Observed::Reopened);
        let occ = t.probe("J1").unwrap();
        assert_eq!(occ.status, OccurrenceStatus::Active);
        assert!(occ.closed_at_ms.is_none());
    }

    #[test]
    fn cierre_de_via_por_intervalo() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        let mut ev = jam("A1", 10_000, 0.0, -1);
        ev.kind = ProbeKind::Alert;
        t.observe_probe(&ev, &[4], true);
        assert!(t.closure_edges(0, 300_000).contains(&4));
        // sigue abierta por la gracia de ausencia, pero el feed ya no lo publica
        assert_eq!(t.open_probes(), 1);
        assert!(t.closure_edges(300_000, 600_000).is_empty());
        // un ciclo del feed que lo re-publica lo vuelve a marcar
        t.touch_probe("A1", 320_000);
        assert!(t.closure_edges(300_000, 600_000).contains(&4));
        assert!(t.closure_edges(600_000, 900_000).is_empty());
        t.sweep(1_000_000);
        assert!(t.closure_edges(0, 300_000).contains(&4));
        // cerrada: los ciclos tardíos no cuentan
        t.touch_probe("A1", 1_100_000);
        assert!(t.closure_edges(900_000, 1_200_000).is_empty());
    }

    #[test]
    fn rumbo_tardio_re_resuelve_muestras_previas() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        // sin rumbo gana la calzada más cercana (5); con rumbo este, la 3
        let resolve = |_: LatLon, h: Option<f64>| if h.is_some() { hit(3) } else { hit(5) };
        let r = t.observe_sample(&sample("T1", 2, 0, 0.0), 0, Some(O), resolve);
        assert_eq!(r.point.unwrap().edge, Some(5));
        t.observe_sample(&sample("T1", 2, 1_000, 50.0), 1_000, Some(offset_m(O, 0.0, 5.0)), resolve);
        let occ = t.track("T1").unwrap();
        assert!(occ.points.iter().all(|p| p.edge == Some(3)));
        assert_eq!(t.close_track("T1").unwrap().resolved_edge, Some(3));
    }

    #[test]
    fn track_rumbo_velocidades_y_timeout() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        let p0 = O;
        let p1 = offset_m(O, 0.0, 10.0);
        let r = t.observe_sample(&sample("T1", 2, 1_000, 0.0), 1_000, Some(p0), |_, h| {
            assert!(h.is_none());
            hit(3)
        });
        assert_eq!(r.observed, Observed::New);
        let r = t.observe_sample(&sample("T1", 2, 2_000, 100.0), 2_000, Some(p1), |_, h| {
            let h = h.unwrap();
            assert!((h - 90.0).abs() < 0.5);
            hit(3)
        });
        assert_eq!(r.observed, Observed::Updated);
        let pt = r.point.unwrap();
        assert_eq!(pt.pixel_speed, Some(100.0));
        assert!((pt.geo_speed_mps.unwrap() - 10.0).abs() < 0.01);

        // repetido
        let r = t.observe_sample(&sample("T1", 2, 2_000, 100.0), 2_000, Some(p1), |_, _| hit(9));
        assert_eq!(r.observed, Observed::Duplicate);

        assert!(t.sweep(4_000).tracks.is_empty());
        let rep = t.sweep(4_001);
        assert_eq!(rep.tracks.len(), 1);
        let s = &rep.tracks[0];
        assert_eq!(s.resolved_edge, Some(3));
        assert_eq!(s.class_label, "car");
        assert_eq!(s.samples, 2);
        assert!((s.duration_s - 1.0).abs() < 1e-9);
        assert!(s.disappearance_rate > 0.9);
        assert!(!s.pixel_only);
    }

    #[test]
    fn track_sin_calibracion_queda_en_pixeles() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        t.observe_sample(&sample("T9", 7, 0, 0.0), 0, None, |_, _| hit(1));
        t.observe_sample(&sample("T9", 7, 500, 50.0), 500, None, |_, _| hit(1));
        let s = t.close_track("T9").unwrap();
        assert!(s.pixel_only);
        assert!(s.is_unmatched());
        assert_eq!(s.mean_pixel_speed, Some(100.0));
        assert_eq!(s.mean_speed_mps, None);
        assert!(t.close_track("T9").is_none());
    }

    #[test]
    fn compactar_conserva_la_identidad() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        t.observe_probe(&jam("J1", 0, 2.0, 4), &[7], false);
        t.observe_probe(&jam("J1", 60_000, 1.0, 5), &[7], false);
        t.observe_probe(&jam("J2", 1_000_000, 2.0, 4), &[7], false);
        t.sweep(1_000_000);
        assert_eq!(t.compact_closed(400_000), 0);
        assert_eq!(t.compact_closed(500_000), 1);
        // idempotente
        assert_eq!(t.compact_closed(500_000), 0);

        let occ = t.probe("J1").unwrap();
        assert_eq!(occ.status, OccurrenceStatus::Closed);
        assert_eq!(occ.history.len(), 1);
        assert_eq!(occ.compacted_observations, 1);
        assert_eq!(occ.last_observed_ms, 60_000);

        // un reenvío de lo ya procesado sigue siendo duplicado
        assert!(t.observe_probe(&jam("J1", 0, 2.0, 4), &[7], false).is_duplicate());
        assert!(t.observe_probe(&jam("J1", 60_000, 1.0, 5), &[7], false).is_duplicate());
        assert_eq!(t.probe("J1").unwrap(), occ);
        assert_eq!(t.open_probes(), 1);

        // algo nuevo reabre la misma ocurrencia
        assert_eq!(t.observe_probe(&jam("J1", 2_000_000, 3.0, 2), &[7], false), Observed::Reopened);
        let r = t.sweep(3_000_000);
        let s = r.probes.iter().find(|s| s.event_uuid == "J1").unwrap();
        assert_eq!(s.observations, 3);
        assert_eq!(s.first_observed_ms, 0);
    }

    #[test]
    fn compactar_tracks_conserva_extremos() {
        let t = EventLifecycleTracker::new(LifecycleCfg::default());
        for k in 0..5i64 {
            t.observe_sample(&sample("T1", 2, k * 1_000, k as f64), k * 1_000, Some(offset_m(O, 0.0, k as f64 * 5.0)), |_, _| hit(3));
        }
        t.close_track("T1").unwrap();
        assert_eq!(t.compact_closed(10_000), 1);
        let occ = t.track("T1").unwrap();
        assert_eq!(occ.points.len(), 2);
        assert_eq!((occ.entry_ms(), occ.exit_ms()), (0, 4_000));
        let r = t.observe_sample(&sample("T1", 2, 2_000, 2.0), 2_000, Some(O), |_, _| hit(3));
        assert_eq!(r.observed, Observed::Duplicate);
        assert_eq!(t.open_tracks(), 0);
    }
}
