//! window.rs
//!
//! Agregación por ventanas fijas de tiempo.
//!
//! - Índice de ventana = `ts.div_euclid(ancho)`: ninguna marca de tiempo cae
//!   en dos ventanas y los rangos emitidos son contiguos.
//! - Cada ventana tiene su propio buffer (entrada del `DashMap`): registros de
//!   ventanas distintas no se bloquean entre sí.
//! - Una ventana se emite cuando `fin + margen <= now`. Lo que llega después
//!   se descarta y se cuenta como tardío; nunca reabre una ventana emitida.
//! - Las features se calculan ordenando antes de sumar, para que el
//!   resultado no dependa del orden de llegada.
//! - Un track cuenta como un vehículo en la arista donde cae la mayoría de
//!   sus muestras de la ventana, no en cada arista que tocó.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::cfg::WindowCfg;
use crate::error::{Result, VialError};
use crate::graph::RoadGraph;
use crate::types::{
    severity_rank, AlertType, EdgeFeatures, EdgeIdx, ProbeEvent, ProbeKind, VehicleClass,
};

/// Admisión de un registro en su ventana
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Late,
}

#[derive(Clone, Debug)]
struct ProbeRec {
    ts: i64,
    uuid: String,
    kind: ProbeKind,
    alert_type: Option<AlertType>,
    speed: Option<f64>,
    regular_speed: Option<f64>,
    severity: Option<i8>,
    delay: Option<f64>,
    closure: bool,
}

#[derive(Clone, Debug, Default)]
struct EdgeBuf {
    probes: Vec<ProbeRec>,
    closed_durations: Vec<f64>,
}

#[derive(Clone, Debug, Default)]
struct EdgeSamples {
    n: u32,
    speeds: Vec<f64>,
}

/// Muestras de un track dentro de la ventana, por arista
#[derive(Clone, Debug)]
struct TrackBuf {
    class: VehicleClass,
    per_edge: BTreeMap<EdgeIdx, EdgeSamples>,
}

impl TrackBuf {
    /// Arista con más muestras; en empate, la de menor índice
    fn resolved_edge(&self) -> Option<EdgeIdx> {
        let mut best: Option<(EdgeIdx, u32)> = None;
        for (e, s) in &self.per_edge {
            if best.map_or(true, |(_, n)| s.n > n) {
                best = Some((*e, s.n));
            }
        }
        best.map(|(e, _)| e)
    }
}

#[derive(Default)]
struct Vehicles {
    count: u32,
    by_class: BTreeMap<String, u32>,
    speeds: Vec<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct WindowBuffer {
    edges: HashMap<EdgeIdx, EdgeBuf>,
    /// track_uuid -> muestras; ordenado para sumar siempre igual
    tracks: BTreeMap<String, TrackBuf>,
}

impl WindowBuffer {
    pub fn is_empty(&self) -> bool { self.edges.is_empty() && self.tracks.is_empty() }

    fn edge_keys(&self) -> impl Iterator<Item = EdgeIdx> + '_ {
        self.edges
            .keys()
            .copied()
            .chain(self.tracks.values().flat_map(|t| t.per_edge.keys().copied()))
    }
}

/// Ventana cerrada, lista para calcular features
#[derive(Debug)]
pub struct ClosedWindow {
    pub start_ms: i64,
    pub end_ms: i64,
    buffer: WindowBuffer,
}

impl ClosedWindow {
    pub fn start_utc(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.start_ms)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool { self.buffer.is_empty() }

    /// Features de todas las aristas del grafo. `closures` son las aristas
    /// con un cierre de vía vigente durante la ventana.
    pub fn features(&self, graph: &RoadGraph, closures: &BTreeSet<EdgeIdx>) -> Result<BTreeMap<String, EdgeFeatures>> {
        if let Some(bad) = self.buffer.edge_keys().find(|e| *e as usize >= graph.edge_count()) {
            return Err(VialError::InvariantViolation(format!(
                "ventana {} referencia la arista #{bad} fuera del grafo v{}",
                self.start_ms,
                graph.version()
            )));
        }
        let mut vehicles = self.vehicles();
        let mut out = BTreeMap::new();
        for (i, edge) in graph.edges().iter().enumerate() {
            let idx = i as EdgeIdx;
            let mut f = match self.buffer.edges.get(&idx) {
                Some(buf) => probe_features(buf),
                None => EdgeFeatures::default(),
            };
            if let Some(v) = vehicles.remove(&idx) {
                f.vehicle_count = v.count;
                f.vehicles_by_class = v.by_class;
                f.mean_track_speed_mps = mean_sorted(v.speeds);
            }
            f.closed |= closures.contains(&idx);
            f.impassable = graph.is_closed(idx);
            out.insert(edge.id.clone(), f);
        }
        Ok(out)
    }

    /// Cada track una vez, en su arista resuelta, con las velocidades de ahí
    fn vehicles(&self) -> BTreeMap<EdgeIdx, Vehicles> {
        let mut out: BTreeMap<EdgeIdx, Vehicles> = BTreeMap::new();
        for t in self.buffer.tracks.values() {
            let Some(edge) = t.resolved_edge() else { continue };
            let v = out.entry(edge).or_default();
            v.count += 1;
            *v.by_class.entry(t.class.label()).or_default() += 1;
            if let Some(s) = t.per_edge.get(&edge) {
                v.speeds.extend_from_slice(&s.speeds);
            }
        }
        out
    }
}

fn probe_features(buf: &EdgeBuf) -> EdgeFeatures {
    let mut probes: Vec<&ProbeRec> = buf.probes.iter().collect();
    probes.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.uuid.cmp(&b.uuid)));

    let mut f = EdgeFeatures::default();
    let mut speeds = Vec::new();
    let mut regular = Vec::new();
    for p in &probes {
        match p.kind {
            ProbeKind::Jam | ProbeKind::Irregularity => {
                if let Some(s) = p.speed { speeds.push(s); }
                if let Some(r) = p.regular_speed { regular.push(r); }
            }
            ProbeKind::Alert => {
                if let Some(t) = p.alert_type { f.alerts.set(t); }
            }
        }
        if let Some(l) = p.severity {
            if f.max_severity.map_or(true, |m| severity_rank(l) > severity_rank(m)) {
                f.max_severity = Some(l);
            }
        }
        if let Some(d) = p.delay {
            f.max_delay_s = Some(f.max_delay_s.map_or(d, |m: f64| m.max(d)));
        }
        f.closed |= p.closure;
    }
    f.probe_observations = probes.len() as u32;
    f.mean_speed_mps = mean_sorted(speeds);
    f.mean_regular_speed_mps = mean_sorted(regular);

    f.occurrences_closed = buf.closed_durations.len() as u32;
    f.max_occurrence_duration_s = buf.closed_durations.iter().copied().reduce(f64::max);
    f
}

fn mean_sorted(mut v: Vec<f64>) -> Option<f64> {
    v.retain(|x| x.is_finite());
    if v.is_empty() {
        return None;
    }
    v.sort_by(|a, b| a.total_cmp(b));
    Some(v.iter().sum::<f64>() / v.len() as f64)
}

pub struct TemporalWindowAggregator {
    cfg: WindowCfg,
    buffers: DashMap<i64, WindowBuffer>,
    /// Primera ventana aún no emitida (`i64::MIN` antes de la primera emisión)
    emitted_until: AtomicI64,
    closer: Mutex<()>,
}

impl TemporalWindowAggregator {
    pub fn new(cfg: WindowCfg) -> Self {
        Self {
            cfg,
            buffers: DashMap::new(),
            emitted_until: AtomicI64::new(i64::MIN),
            closer: Mutex::new(()),
        }
    }

    pub fn cfg(&self) -> &WindowCfg { &self.cfg }

    #[inline]
    pub fn window_index(&self, ts_ms: i64) -> i64 { ts_ms.div_euclid(self.cfg.width_ms.max(1)) }

    /// `[inicio, fin)` de la ventana que contiene `ts_ms`
    pub fn bounds(&self, ts_ms: i64) -> (i64, i64) {
        let k = self.window_index(ts_ms);
        let w = self.cfg.width_ms.max(1);
        (k * w, (k + 1) * w)
    }

    pub fn pending_windows(&self) -> usize { self.buffers.len() }

    fn with_buffer(&self, ts_ms: i64, f: impl FnOnce(&mut WindowBuffer)) -> Admission {
        let k = self.window_index(ts_ms);
        if k < self.emitted_until.load(Ordering::SeqCst) {
            return Admission::Late;
        }
        {
            let mut buf = self.buffers.entry(k).or_default();
            // se revisa con la entrada bloqueada: el cierre publica antes de retirar
            if k >= self.emitted_until.load(Ordering::SeqCst) {
                f(buf.value_mut());
                return Admission::Accepted;
            }
        }
        self.buffers.remove_if(&k, |_, b| b.is_empty());
        Admission::Late
    }

    /// Observación probe ya emparejada con sus aristas
    pub fn add_probe(&self, ev: &ProbeEvent, edges: &[EdgeIdx], closure: bool) -> Admission {
        let rec = ProbeRec {
            ts: ev.observed_at_ms,
            uuid: ev.event_uuid.clone(),
            kind: ev.kind,
            alert_type: ev.alert_type,
            speed: ev.speed_mps,
            regular_speed: ev.regular_speed_mps,
            severity: ev.severity_level,
            delay: ev.delay_s,
            closure,
        };
        self.with_buffer(ev.observed_at_ms, |w| {
            for e in edges {
                w.edges.entry(*e).or_default().probes.push(rec.clone());
            }
        })
    }

    /// Muestra de un track resuelta sobre `edge`
    pub fn add_track_sample(
        &self,
        ts_ms: i64,
        edge: EdgeIdx,
        track_uuid: &str,
        class: VehicleClass,
        speed_mps: Option<f64>,
    ) -> Admission {
        self.with_buffer(ts_ms, |w| {
            let t = w
                .tracks
                .entry(track_uuid.to_string())
                .or_insert_with(|| TrackBuf { class, per_edge: BTreeMap::new() });
            let samples = t.per_edge.entry(edge).or_default();
            samples.n += 1;
            if let Some(s) = speed_mps {
                samples.speeds.push(s);
            }
        })
    }

    /// Ocurrencia probe cerrada: cuenta en la ventana de su cierre
    pub fn add_closed_occurrence(&self, closed_at_ms: i64, edges: &[EdgeIdx], duration_s: f64) -> Admission {
        self.with_buffer(closed_at_ms, |w| {
            for e in edges {
                w.edges.entry(*e).or_default().closed_durations.push(duration_s);
            }
        })
    }

    /// Emite, en orden y sin huecos, todas las ventanas con `fin + margen <= now`
    pub fn close_ready(&self, now_ms: i64) -> Vec<ClosedWindow> {
        let _guard = self.closer.lock().unwrap_or_else(|p| p.into_inner());
        let w = self.cfg.width_ms.max(1);
        let last = (now_ms - self.cfg.grace_ms).div_euclid(w) - 1;

        let emitted = self.emitted_until.load(Ordering::SeqCst);
        let first = if emitted == i64::MIN {
            if self.first_ready(last).is_none() {
                return Vec::new();
            }
            // publicar antes de elegir el inicio: un alta concurrente o entra
            // en este lote o es tardía
            self.emitted_until.store(last + 1, Ordering::SeqCst);
            let Some(first) = self.first_ready(last) else { return Vec::new() };
            self.buffers.retain(|k, b| *k >= first || !b.is_empty());
            first
        } else {
            if emitted > last {
                return Vec::new();
            }
            self.emitted_until.store(last + 1, Ordering::SeqCst);
            emitted
        };

        let out: Vec<ClosedWindow> = (first..=last)
            .map(|k| ClosedWindow {
                start_ms: k * w,
                end_ms: (k + 1) * w,
                buffer: self.buffers.remove(&k).map(|(_, b)| b).unwrap_or_default(),
            })
            .collect();
        debug!(from = first * w, to = (last + 1) * w, n = out.len(), "ventanas cerradas");
        out
    }

    /// Ventana más antigua con datos y `índice <= last`
    fn first_ready(&self, last: i64) -> Option<i64> {
        self.buffers
            .iter()
            .filter(|b| *b.key() <= last && !b.value().is_empty())
            .map(|b| *b.key())
            .min()
    }

    /// Descarta las ventanas pendientes sin emitirlas (acción de operador)
    pub fn abandon_pending(&self) -> usize {
        let _guard = self.closer.lock().unwrap_or_else(|p| p.into_inner());
        let keys: Vec<i64> = self.buffers.iter().map(|b| *b.key()).collect();
        if let Some(max) = keys.iter().max() {
            let next = (*max + 1).max(self.emitted_until.load(Ordering::SeqCst));
            self.emitted_until.store(next, Ordering::SeqCst);
        }
        for k in &keys {
            self.buffers.remove(k);
        }
        keys.len()
    }
}
