//! engine.rs
//!
//! Orquestador del motor de conflación:
//!   probe  -> matcher -> lifecycle -> ventanas
//!   visión -> projector -> lifecycle (+ resolución) -> ventanas
//!   tick   -> cierre de ocurrencias -> cierre de ventanas -> snapshots
//!
//! - Todas las operaciones toman `&self`: el motor se comparte con `Arc`
//!   entre el lector del feed y un worker por cámara.
//! - El grafo vigente está detrás de un `RwLock<Arc<..>>`; cada operación
//!   clona el `Arc` y trabaja sobre esa versión sin bloquear a nadie.
//! - Sin match, tardío, duplicado y sin calibración son resultados y
//!   contadores, nunca errores.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::adjacency::AdjacencyBuilder;
use crate::cfg::EngineCfg;
use crate::error::{Result, VialError};
use crate::graph::RoadGraph;
use crate::lifecycle::{EventLifecycleTracker, TrackSummary};
use crate::matcher::{MatchResult, SpatialMapMatcher};
use crate::metrics::{EngineMetrics, MetricsSummary};
use crate::projector::{Projection, TrackProjector};
use crate::types::{
    CameraCalibration, ProbeCycle, ProbeEvent, VehicleClass, VisionSample, WindowedGraphSnapshot,
};
use crate::window::{Admission, TemporalWindowAggregator};

#[derive(Clone, Debug, PartialEq)]
pub enum ProbeOutcome {
    Matched { edges: Vec<String>, retried: bool },
    /// Ninguna arista dentro del buffer: queda observable y reintentable
    Unmatched { nearest_m: Option<f64> },
    Duplicate,
    Late,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SampleOutcome {
    Resolved { edge: String },
    Unresolved,
    /// Cámara sin calibración: el track se conserva en píxeles
    PixelOnly,
    Duplicate,
    Late,
    LowConfidence,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub matched: usize,
    pub unmatched: usize,
    pub duplicates: usize,
    pub late: usize,
}

pub struct ConflationEngine {
    cfg: EngineCfg,
    graph: RwLock<Arc<RoadGraph>>,
    matcher: SpatialMapMatcher,
    projector: TrackProjector,
    tracker: EventLifecycleTracker,
    windows: TemporalWindowAggregator,
    adjacency: AdjacencyBuilder,
    metrics: EngineMetrics,
    /// Última observación sin match por evento
    unmatched: DashMap<String, ProbeEvent>,
    /// Mayor marca de tiempo vista (reloj de eventos)
    watermark: AtomicI64,
}

impl ConflationEngine {
    pub fn new(graph: RoadGraph, cfg: EngineCfg) -> Self {
        Self {
            matcher: SpatialMapMatcher::new(cfg.matching.clone()),
            projector: TrackProjector::new(cfg.matching.clone()),
            tracker: EventLifecycleTracker::new(cfg.lifecycle.clone()),
            windows: TemporalWindowAggregator::new(cfg.window.clone()),
            adjacency: AdjacencyBuilder::new(cfg.adjacency.clone()),
            graph: RwLock::new(Arc::new(graph)),
            metrics: EngineMetrics::new(),
            unmatched: DashMap::new(),
            watermark: AtomicI64::new(i64::MIN),
            cfg,
        }
    }

    pub fn cfg(&self) -> &EngineCfg { &self.cfg }

    pub fn graph(&self) -> Arc<RoadGraph> {
        match self.graph.read() {
            Ok(g) => Arc::clone(&g),
            Err(p) => Arc::clone(&p.into_inner()),
        }
    }

    pub fn tracker(&self) -> &EventLifecycleTracker { &self.tracker }

    pub fn projector(&self) -> &TrackProjector { &self.projector }

    pub fn watermark_ms(&self) -> Option<i64> {
        let w = self.watermark.load(Ordering::SeqCst);
        (w != i64::MIN).then_some(w)
    }

    fn bump_watermark(&self, ts_ms: i64) {
        self.watermark.fetch_max(ts_ms, Ordering::SeqCst);
    }

    pub fn upsert_calibration(&self, cal: &CameraCalibration) -> Result<()> {
        self.projector.upsert_calibration(cal)
    }

    // ---------------------------------
    // Probe
    // ---------------------------------

    pub fn ingest_probe(&self, ev: ProbeEvent) -> ProbeOutcome {
        self.metrics.inc(&self.metrics.probe_events);
        let g = self.graph();

        let mut retried = false;
        let result = match (self.matcher.match_event(&g, ev), self.cfg.matching.retry_tolerance_m) {
            (MatchResult::Unmatched(u), Some(tol)) if tol > u.tolerance_m => {
                retried = true;
                self.matcher.match_with_tolerance(&g, u.event, tol)
            }
            (r, _) => r,
        };

        match result {
            MatchResult::Matched(m) => {
                let edges = m.edge_indices();
                if self.tracker.observe_probe(&m.event, &edges, m.closure).is_duplicate() {
                    self.metrics.inc(&self.metrics.duplicate_observations);
                    return ProbeOutcome::Duplicate;
                }
                if retried {
                    self.metrics.inc(&self.metrics.retried_matches);
                }
                self.unmatched.remove(&m.event.event_uuid);
                self.bump_watermark(m.event.observed_at_ms);
                match self.windows.add_probe(&m.event, &edges, m.closure) {
                    Admission::Accepted => ProbeOutcome::Matched {
                        edges: edges.iter().map(|e| g.edge_id(*e).to_string()).collect(),
                        retried,
                    },
                    Admission::Late => {
                        self.metrics.inc(&self.metrics.late_records);
                        debug!(uuid = %m.event.event_uuid, ts = m.event.observed_at_ms, "registro tardío descartado");
                        ProbeOutcome::Late
                    }
                }
            }
            MatchResult::Unmatched(u) => {
                if self.tracker.observe_probe(&u.event, &[], false).is_duplicate() {
                    self.metrics.inc(&self.metrics.duplicate_observations);
                    return ProbeOutcome::Duplicate;
                }
                self.metrics.inc(&self.metrics.unmatched_events);
                self.bump_watermark(u.event.observed_at_ms);
                debug!(
                    uuid = %u.event.event_uuid,
                    nearest_m = ?u.nearest_m,
                    tol = u.tolerance_m,
                    "evento sin arista dentro del buffer"
                );
                let nearest_m = u.nearest_m;
                self.unmatched.insert(u.event.event_uuid.clone(), u.event);
                ProbeOutcome::Unmatched { nearest_m }
            }
        }
    }

    /// Un ciclo completo del feed: cada evento listado sigue presente
    pub fn ingest_probe_cycle(&self, cycle: ProbeCycle) -> CycleReport {
        let mut rep = CycleReport::default();
        let fetched_at = cycle.fetched_at_ms;
        for ev in cycle.events {
            let uuid = ev.event_uuid.clone();
            match self.ingest_probe(ev) {
                ProbeOutcome::Matched { .. } => rep.matched += 1,
                ProbeOutcome::Unmatched { .. } => rep.unmatched += 1,
                ProbeOutcome::Duplicate => rep.duplicates += 1,
                ProbeOutcome::Late => rep.late += 1,
            }
            self.tracker.touch_probe(&uuid, fetched_at);
        }
        self.bump_watermark(fetched_at);
        rep
    }

    /// Eventos cuya última observación no casó con ninguna arista
    pub fn unmatched_events(&self) -> Vec<ProbeEvent> {
        let mut v: Vec<ProbeEvent> = self.unmatched.iter().map(|e| e.value().clone()).collect();
        v.sort_by(|a, b| a.event_uuid.cmp(&b.event_uuid));
        v
    }

    /// Reintenta los eventos sin match con otro buffer; devuelve cuántos casaron
    pub fn retry_unmatched(&self, tolerance_m: f64) -> usize {
        let g = self.graph();
        let uuids: Vec<String> = self.unmatched.iter().map(|e| e.key().clone()).collect();
        let mut n = 0;
        for uuid in uuids {
            let Some((_, ev)) = self.unmatched.remove(&uuid) else { continue };
            match self.matcher.match_with_tolerance(&g, ev, tolerance_m) {
                MatchResult::Matched(m) => {
                    let edges = m.edge_indices();
                    self.tracker.attach_edges(&uuid, m.event.observed_at_ms, &edges, m.closure);
                    self.metrics.inc(&self.metrics.retried_matches);
                    if self.windows.add_probe(&m.event, &edges, m.closure) == Admission::Late {
                        self.metrics.inc(&self.metrics.late_records);
                    }
                    n += 1;
                }
                MatchResult::Unmatched(u) => {
                    self.unmatched.entry(uuid).or_insert(u.event);
                }
            }
        }
        n
    }

    // ---------------------------------
    // Visión
    // ---------------------------------

    pub fn ingest_sample(&self, s: VisionSample) -> SampleOutcome {
        self.metrics.inc(&self.metrics.vision_samples);
        if s.confidence < self.cfg.min_sample_confidence {
            self.metrics.inc(&self.metrics.low_confidence_samples);
            return SampleOutcome::LowConfidence;
        }
        let ts = s.frame_ts_ms + self.projector.clock_offset_ms(&s.camera_id);
        let g = self.graph();

        let (geo, uncalibrated) = match self.projector.project(&s.camera_id, s.pixel) {
            Ok(Projection::Geo(p)) => (Some(p), false),
            Ok(Projection::OutOfGround) => (None, false),
            Err(VialError::CalibrationMissing { .. }) => (None, true),
            Err(e) => {
                warn!(camera = %s.camera_id, "proyección fallida: {e}");
                (None, false)
            }
        };

        let obs = self.tracker.observe_sample(&s, ts, geo, |p, heading| self.projector.resolve(&g, p, heading));
        if obs.observed.is_duplicate() {
            self.metrics.inc(&self.metrics.duplicate_observations);
            return SampleOutcome::Duplicate;
        }
        self.bump_watermark(ts);
        if uncalibrated {
            self.metrics.inc(&self.metrics.uncalibrated_samples);
            return SampleOutcome::PixelOnly;
        }

        let Some(point) = obs.point else { return SampleOutcome::Unresolved };
        let Some(edge) = point.edge else { return SampleOutcome::Unresolved };
        let class = VehicleClass::from_coco(s.class_id);
        match self.windows.add_track_sample(ts, edge, &s.track_uuid, class, point.geo_speed_mps) {
            Admission::Accepted => SampleOutcome::Resolved { edge: g.edge_id(edge).to_string() },
            Admission::Late => {
                self.metrics.inc(&self.metrics.late_records);
                SampleOutcome::Late
            }
        }
    }

    /// El vehículo salió del campo de visión
    pub fn close_track(&self, track_uuid: &str) -> Option<TrackSummary> {
        let summary = self.tracker.close_track(track_uuid)?;
        self.finish_track(&self.graph(), &summary);
        Some(summary)
    }

    fn finish_track(&self, g: &RoadGraph, t: &TrackSummary) {
        if t.is_unmatched() {
            self.metrics.inc(&self.metrics.unmatched_tracks);
            debug!(track = %t.track_uuid, camera = %t.camera_id, pixel_only = t.pixel_only, "track sin arista");
        }
        self.tracker.record_transitions(g, &t.path);
    }

    // ---------------------------------
    // Reloj
    // ---------------------------------

    /// Cierra ocurrencias vencidas y emite las ventanas listas a `now_ms`
    pub fn tick(&self, now_ms: i64) -> Result<Vec<WindowedGraphSnapshot>> {
        let g = self.graph();

        let swept = self.tracker.sweep(now_ms);
        for p in swept.probes.iter().filter(|p| !p.edges.is_empty()) {
            if self.windows.add_closed_occurrence(p.closed_at_ms, &p.edges, p.duration_s) == Admission::Late {
                self.metrics.inc(&self.metrics.late_records);
            }
        }
        for t in &swept.tracks {
            self.finish_track(&g, t);
        }

        let closed = self.windows.close_ready(now_ms);
        let mut out = Vec::with_capacity(closed.len());
        if !closed.is_empty() {
            let adjacency = self.adjacency.build(&g, &self.tracker.transitions());
            for w in closed {
                let closures = self.tracker.closure_edges(w.start_ms, w.end_ms);
                let edges = w.features(&g, &closures)?;
                out.push(WindowedGraphSnapshot {
                    window_start_ms: w.start_ms,
                    window_end_ms: w.end_ms,
                    window_start_utc: w.start_utc(),
                    graph_version: g.version(),
                    edges,
                    adjacency: adjacency.clone(),
                });
            }
            self.metrics.add(&self.metrics.windows_emitted, out.len() as u64);
        }

        let compacted = self.tracker.compact_closed(now_ms - self.cfg.lifecycle.closed_retention_ms);
        if compacted > 0 {
            debug!(compacted, "ocurrencias cerradas compactadas");
        }
        Ok(out)
    }

    /// Fin de la entrada: cierra todo lo abierto y emite lo pendiente
    pub fn finish(&self) -> Result<Vec<WindowedGraphSnapshot>> {
        let Some(wm) = self.watermark_ms() else { return Ok(Vec::new()) };
        let lc = &self.cfg.lifecycle;
        let w = &self.cfg.window;
        let now = wm
            + lc.probe_absence_grace_ms.max(lc.frame_gap_timeout_ms)
            + w.width_ms
            + w.grace_ms
            + 1;
        self.tick(now)
    }

    // ---------------------------------
    // Topología
    // ---------------------------------

    /// Recarga parcial: marca/desmarca aristas intransitables
    pub fn apply_closures(&self, edge_ids: &[String], closed: bool) -> Result<()> {
        let g = self.graph();
        for id in edge_ids {
            g.set_closed(id, closed)?;
        }
        info!(n = edge_ids.len(), closed, "cierres de topología aplicados");
        Ok(())
    }

    /// Sustituye el grafo. Las ventanas pendientes se abandonan (acción de
    /// operador) porque sus índices de arista ya no son válidos.
    pub fn reload_topology(&self, graph: RoadGraph) -> Result<usize> {
        let current = self.graph();
        if graph.version() == current.version() {
            return Err(VialError::InvariantViolation(format!(
                "recarga con la misma versión de grafo v{}",
                graph.version()
            )));
        }
        let abandoned = self.windows.abandon_pending();
        self.tracker.reset_for_topology();
        self.unmatched.clear();
        let version = graph.version();
        match self.graph.write() {
            Ok(mut g) => *g = Arc::new(graph),
            Err(p) => *p.into_inner() = Arc::new(graph),
        }
        self.metrics.add(&self.metrics.windows_abandoned, abandoned as u64);
        warn!(version, abandoned, "topología recargada; ventanas pendientes abandonadas");
        Ok(abandoned)
    }

    // ---------------------------------
    // Observabilidad
    // ---------------------------------

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary(self.tracker.open_occurrences(), self.windows.pending_windows())
    }

    pub fn transitions(&self) -> BTreeMap<(String, String), u64> {
        let g = self.graph();
        self.tracker
            .transitions()
            .into_iter()
            .filter(|((a, b), _)| (*a as usize) < g.edge_count() && (*b as usize) < g.edge_count())
            .map(|((a, b), n)| ((g.edge_id(a).to_string(), g.edge_id(b).to_string()), n))
            .collect()
    }
}
