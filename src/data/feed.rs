//! feed.rs
//!
//! Lectores de registros de entrada en JSON lines.
//!
//! - Probe: cada línea es un ciclo `{fetched_at_ms, events}`, un evento ya
//!   normalizado, o una fila cruda del feed (atasco, alerta, irregularidad).
//! - Visión: una detección por línea.
//! - Calibraciones: un array JSON.
//!
//! Las líneas que no parsean se saltan con un `warn!`; no abortan la carga.

use serde::Deserialize;
use tracing::warn;

use crate::error::Result;
use crate::types::{
    AlertType, CameraCalibration, EventGeometry, LatLon, ProbeCycle, ProbeEvent, ProbeKind, VisionSample,
};

/// Registro probe tal como llega por la entrada
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeInput {
    Cycle(ProbeCycle),
    Event(ProbeEvent),
}

impl ProbeInput {
    /// Marca de tiempo para ordenar la reproducción
    pub fn ts_ms(&self) -> i64 {
        match self {
            ProbeInput::Cycle(c) => c.fetched_at_ms,
            ProbeInput::Event(e) => e.observed_at_ms,
        }
    }
}

/// Fila de atasco del almacén crudo
#[derive(Debug, Deserialize)]
struct JamRow {
    event_uuid: String,
    snapshot_timestamp: i64,
    waze_line_geometry: Vec<LatLon>,
    speed_mps: f64,
    delay_seconds: f64,
    congestion_level: i8,
    jam_length_m: f64,
    road_type: i32,
}

/// Fila de alerta del almacén crudo
#[derive(Debug, Deserialize)]
struct AlertRow {
    alert_uuid: String,
    timestamp: i64,
    alert_type: AlertType,
    #[serde(default)]
    alert_subtype: Option<String>,
    reliability: u8,
    confidence: u8,
    magvar: f64,
    report_location: LatLon,
}

/// Fila de irregularidad del almacén crudo
#[derive(Debug, Deserialize)]
struct IrregularityRow {
    irregularity_uuid: String,
    timestamp: i64,
    regular_speed_mps: f64,
    current_speed_mps: f64,
    line_geometry: Vec<LatLon>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProbeLine {
    Cycle(ProbeCycle),
    Event(ProbeEvent),
    Jam(JamRow),
    Alert(AlertRow),
    Irregularity(IrregularityRow),
}

fn blank_event(uuid: String, ts: i64, kind: ProbeKind, geometry: EventGeometry) -> ProbeEvent {
    ProbeEvent {
        event_uuid: uuid,
        observed_at_ms: ts,
        kind,
        alert_type: None,
        subtype: None,
        geometry,
        speed_mps: None,
        delay_s: None,
        severity_level: None,
        length_m: None,
        road_type: None,
        reliability: None,
        confidence: None,
        heading_deg: None,
        regular_speed_mps: None,
    }
}

impl ProbeLine {
    fn into_input(self) -> std::result::Result<ProbeInput, String> {
        Ok(match self {
            ProbeLine::Cycle(c) => ProbeInput::Cycle(c),
            ProbeLine::Event(e) => ProbeInput::Event(e),
            ProbeLine::Jam(r) => {
                if r.speed_mps < 0.0 {
                    return Err(format!("atasco {} con velocidad negativa", r.event_uuid));
                }
                if !(0..=5).contains(&r.congestion_level) && r.congestion_level != -1 {
                    return Err(format!("atasco {} con nivel {}", r.event_uuid, r.congestion_level));
                }
                let mut e = blank_event(
                    r.event_uuid,
                    r.snapshot_timestamp,
                    ProbeKind::Jam,
                    EventGeometry::Line(r.waze_line_geometry),
                );
                e.speed_mps = Some(r.speed_mps);
                e.delay_s = Some(r.delay_seconds);
                e.severity_level = Some(r.congestion_level);
                e.length_m = Some(r.jam_length_m);
                e.road_type = Some(r.road_type);
                ProbeInput::Event(e)
            }
            ProbeLine::Alert(r) => {
                let mut e = blank_event(r.alert_uuid, r.timestamp, ProbeKind::Alert, EventGeometry::Point(r.report_location));
                e.alert_type = Some(r.alert_type);
                e.subtype = r.alert_subtype;
                e.reliability = Some(r.reliability);
                e.confidence = Some(r.confidence);
                e.heading_deg = Some(r.magvar);
                ProbeInput::Event(e)
            }
            ProbeLine::Irregularity(r) => {
                let mut e = blank_event(
                    r.irregularity_uuid,
                    r.timestamp,
                    ProbeKind::Irregularity,
                    EventGeometry::Line(r.line_geometry),
                );
                e.speed_mps = Some(r.current_speed_mps);
                e.regular_speed_mps = Some(r.regular_speed_mps);
                ProbeInput::Event(e)
            }
        })
    }
}

pub fn parse_probe_lines(text: &str) -> Vec<ProbeInput> {
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<ProbeLine>(line).map_err(|e| e.to_string()).and_then(ProbeLine::into_input) {
            Ok(p) => out.push(p),
            Err(e) => warn!("probe línea {}: {e}", i + 1),
        }
    }
    out
}

pub fn parse_vision_lines(text: &str) -> Vec<VisionSample> {
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<VisionSample>(line) {
            Ok(s) => out.push(s),
            Err(e) => warn!("visión línea {}: {e}", i + 1),
        }
    }
    out
}

pub fn parse_calibrations(text: &str) -> Result<Vec<CameraCalibration>> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ciclos_eventos_y_lineas_rotas() {
        let text = r#"
{"fetched_at_ms": 120000, "events": [{"uuid": "J1", "observed_at": 0, "kind": "jam", "geometry": [{"x": -77.04, "y": -12.05}, {"x": -77.039, "y": -12.05}], "speed_mps": 2.0, "level": 4}]}
{"event_uuid": "A1", "observed_at_ms": 5000, "kind": "alert", "type": "ROAD_CLOSED", "geometry": {"lat": -12.05, "lon": -77.04}, "magvar": 90}
esto no es json
# comentario
"#;
        let v = parse_probe_lines(text);
        assert_eq!(v.len(), 2);
        let ProbeInput::Cycle(c) = &v[0] else { panic!("se esperaba un ciclo") };
        assert_eq!(c.events[0].severity_level, Some(4));
        assert_eq!(c.events[0].geometry.points().len(), 2);
        let ProbeInput::Event(a) = &v[1] else { panic!("se esperaba un evento") };
        assert!(a.is_closure());
        assert_eq!(a.heading_deg, Some(90.0));
        assert_eq!(v[1].ts_ms(), 5000);
    }

    #[test]
    fn filas_crudas_del_feed() {
        let text = r#"
{"event_uuid": "J9", "snapshot_timestamp": 1000, "waze_line_geometry": [{"x": -77.04, "y": -12.05}, {"x": -77.03, "y": -12.05}], "speed_mps": 1.5, "delay_seconds": 60, "congestion_level": 3, "jam_length_m": 400, "road_type": 2}
{"alert_uuid": "AL1", "timestamp": 2000, "alert_type": "ACCIDENT", "alert_subtype": "ACCIDENT_MAJOR", "reliability": 7, "confidence": 3, "magvar": 180, "report_location": {"x": -77.04, "y": -12.05}}
{"irregularity_uuid": "I1", "timestamp": 3000, "regular_speed_mps": 11.0, "current_speed_mps": 4.0, "trend": -1, "line_geometry": [{"x": -77.04, "y": -12.05}, {"x": -77.03, "y": -12.05}]}
{"event_uuid": "J10", "snapshot_timestamp": 1000, "waze_line_geometry": [], "speed_mps": -1.0, "delay_seconds": 0, "congestion_level": 1, "jam_length_m": 0, "road_type": 1}
"#;
        let v = parse_probe_lines(text);
        assert_eq!(v.len(), 3);
        let ProbeInput::Event(j) = &v[0] else { panic!() };
        assert_eq!(j.kind, ProbeKind::Jam);
        assert_eq!(j.severity_level, Some(3));
        assert_eq!(j.road_type, Some(2));
        let ProbeInput::Event(a) = &v[1] else { panic!() };
        assert_eq!(a.alert_type, Some(AlertType::Accident));
        assert_eq!(a.subtype.as_deref(), Some("ACCIDENT_MAJOR"));
        let ProbeInput::Event(i) = &v[2] else { panic!() };
        assert_eq!(i.regular_speed_mps, Some(11.0));
        assert_eq!(i.speed_mps, Some(4.0));
    }

    #[test]
    fn muestras_y_calibraciones() {
        let text = r#"{"track_uuid": "T1", "camera_id": "C1", "class_id": 2, "frame_timestamp": 10000, "pixel_position": [320.0, 240.0]}
{"track_uuid": "T1", "camera_id": "C1"}
"#;
        let v = parse_vision_lines(text);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].confidence, 1.0);

        let cals = parse_calibrations(
            r#"[{"camera_id": "C1", "homography_matrix": [[1,0,0],[0,1,0],[0,0,1]], "clock_offset_ms": -120}]"#,
        )
        .unwrap();
        assert_eq!(cals[0].clock_offset_ms, -120);
        assert!(cals[0].origin.is_none());
        assert!(parse_calibrations("{}").is_err());
    }
}
