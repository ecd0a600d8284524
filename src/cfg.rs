//! cfg.rs
//! Configuración del motor (tolerancias, ventanas, timeouts, adyacencia)
//! y del servicio (rutas de entrada/salida). Todo con `Default` y
//! sobreescritura por variables de entorno.

use serde::Serialize;
use std::env;

use crate::adjacency::AdjacencyLevel;

#[derive(Clone, Debug, Serialize)]
pub struct MatchCfg {
    /// Buffer alrededor del eje de cada arista (m)
    pub tolerance_m: f64,
    /// Si se define, los eventos sin match se reintentan con este buffer
    pub retry_tolerance_m: Option<f64>,
    /// Diferencia máxima de rumbo evento/arista (grados)
    pub heading_tolerance_deg: f64,
    /// Longitud máxima de cada tramo muestreado de una polilínea (m)
    pub sample_step_m: f64,
    /// El orden de vértices de una polilínea indica el sentido de circulación
    pub polyline_implies_heading: bool,
}

impl Default for MatchCfg {
    fn default() -> Self {
        Self {
            tolerance_m: 15.0,
            retry_tolerance_m: None,
            heading_tolerance_deg: 60.0,
            sample_step_m: 5.0,
            polyline_implies_heading: true,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LifecycleCfg {
    /// Ausencia en el feed tras la cual un evento probe se cierra
    pub probe_absence_grace_ms: i64,
    /// Hueco sin muestras tras el cual un track de visión se cierra
    pub frame_gap_timeout_ms: i64,
    /// Cadencia nominal del feed (para la tasa de desaparición)
    pub nominal_probe_cadence_ms: i64,
    /// Intervalo nominal entre frames (~30 Hz)
    pub nominal_frame_interval_ms: i64,
    /// Desplazamiento proyectado mínimo para actualizar el rumbo de un track
    pub min_heading_move_m: f64,
    /// Tiempo que una ocurrencia cerrada conserva su historial completo antes de compactarla
    pub closed_retention_ms: i64,
}

impl Default for LifecycleCfg {
    fn default() -> Self {
        Self {
            probe_absence_grace_ms: 360_000, // 3 ciclos del feed
            frame_gap_timeout_ms: 2_000,
            nominal_probe_cadence_ms: 120_000,
            nominal_frame_interval_ms: 33,
            min_heading_move_m: 0.5,
            closed_retention_ms: 3_600_000,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WindowCfg {
    pub width_ms: i64,
    /// Margen tras el fin nominal antes de emitir (admite registros tardíos)
    pub grace_ms: i64,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self { width_ms: 300_000, grace_ms: 120_000 }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AdjacencyCfg {
    pub level: AdjacencyLevel,
    pub binary: bool,
    pub distance_decay: bool,
    pub flow: bool,
    /// σ del decaimiento exp(-d²/σ²) en metros
    pub sigma_m: f64,
    /// Pseudo-conteo por transición al normalizar frecuencias de flujo
    pub flow_prior: f64,
    pub self_loops: bool,
    pub u_turns: bool,
}

impl Default for AdjacencyCfg {
    fn default() -> Self {
        Self {
            level: AdjacencyLevel::Edge,
            binary: true,
            distance_decay: true,
            flow: true,
            sigma_m: 250.0,
            flow_prior: 1.0,
            self_loops: false,
            u_turns: true,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineCfg {
    pub matching: MatchCfg,
    pub lifecycle: LifecycleCfg,
    pub window: WindowCfg,
    pub adjacency: AdjacencyCfg,
    /// Confianza mínima de una detección para aceptarla
    pub min_sample_confidence: f32,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            matching: MatchCfg::default(),
            lifecycle: LifecycleCfg::default(),
            window: WindowCfg::default(),
            adjacency: AdjacencyCfg::default(),
            min_sample_confidence: 0.3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppCfg {
    /// Topología (JSON {nodes, edges} o GeoJSON FeatureCollection)
    pub topology_path: String,
    /// Calibraciones de cámara (array JSON), opcional
    pub calibrations_path: Option<String>,
    /// Feed probe en JSON lines (ciclos o eventos sueltos)
    pub probes_path: Option<String>,
    /// Muestras de visión en JSON lines
    pub vision_path: Option<String>,
    /// Salida de snapshots en JSON lines
    pub out_path: String,
    /// Periodo del temporizador de cierre de ventanas
    pub tick_ms: u64,
    /// Reloj de eventos (reproducción) en lugar de reloj de pared
    pub replay: bool,
    pub engine: EngineCfg,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            topology_path: "data/topology.json".into(),
            calibrations_path: None,
            probes_path: None,
            vision_path: None,
            out_path: "data/snapshots.jsonl".into(),
            tick_ms: 1_000,
            replay: true,
            engine: EngineCfg::default(),
        }
    }
}

impl AppCfg {
    pub fn from_env() -> Self {
        let mut c = AppCfg::default();
        if let Ok(v) = env::var("VIAL_TOPOLOGY") { c.topology_path = v; }
        if let Ok(v) = env::var("VIAL_CALIBRATIONS") { c.calibrations_path = Some(v); }
        if let Ok(v) = env::var("VIAL_PROBES") { c.probes_path = Some(v); }
        if let Ok(v) = env::var("VIAL_VISION") { c.vision_path = Some(v); }
        if let Ok(v) = env::var("VIAL_OUT") { c.out_path = v; }
        if let Ok(v) = env::var("VIAL_TICK_MS") { c.tick_ms = v.parse().unwrap_or(c.tick_ms); }
        if let Ok(v) = env::var("VIAL_REPLAY") { c.replay = parse_bool(&v).unwrap_or(c.replay); }

        let e = &mut c.engine;
        if let Ok(v) = env::var("VIAL_TOLERANCE_M") { e.matching.tolerance_m = v.parse().unwrap_or(e.matching.tolerance_m); }
        if let Ok(v) = env::var("VIAL_RETRY_TOLERANCE_M") { e.matching.retry_tolerance_m = v.parse().ok(); }
        if let Ok(v) = env::var("VIAL_HEADING_TOL_DEG") { e.matching.heading_tolerance_deg = v.parse().unwrap_or(e.matching.heading_tolerance_deg); }
        if let Ok(v) = env::var("VIAL_WINDOW_S") {
            if let Ok(s) = v.parse::<i64>() { e.window.width_ms = s * 1000; }
        }
        if let Ok(v) = env::var("VIAL_WINDOW_GRACE_S") {
            if let Ok(s) = v.parse::<i64>() { e.window.grace_ms = s * 1000; }
        }
        if let Ok(v) = env::var("VIAL_PROBE_GRACE_S") {
            if let Ok(s) = v.parse::<i64>() { e.lifecycle.probe_absence_grace_ms = s * 1000; }
        }
        if let Ok(v) = env::var("VIAL_FRAME_GAP_MS") { e.lifecycle.frame_gap_timeout_ms = v.parse().unwrap_or(e.lifecycle.frame_gap_timeout_ms); }
        if let Ok(v) = env::var("VIAL_SIGMA_M") { e.adjacency.sigma_m = v.parse().unwrap_or(e.adjacency.sigma_m); }
        if let Ok(v) = env::var("VIAL_ADJ_LEVEL") {
            match v.to_ascii_lowercase().as_str() {
                "node" => e.adjacency.level = AdjacencyLevel::Node,
                "edge" => e.adjacency.level = AdjacencyLevel::Edge,
                _ => {}
            }
        }
        if let Ok(v) = env::var("VIAL_MIN_CONF") { e.min_sample_confidence = v.parse().unwrap_or(e.min_sample_confidence); }
        c
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "si" | "sí" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_son_coherentes() {
        let c = EngineCfg::default();
        assert_eq!(c.window.width_ms, 300_000);
        assert!(c.window.grace_ms > 0);
        assert!(c.lifecycle.frame_gap_timeout_ms < c.window.grace_ms);
        assert!((10.0..=15.0).contains(&c.matching.tolerance_m));
        assert!(c.matching.retry_tolerance_m.is_none());
    }

    #[test]
    fn parse_bool_acepta_variantes() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("sí"), Some(true));
        assert_eq!(parse_bool("quizá"), None);
    }
}
