#![allow(dead_code)]

use vialgrid::geo_utils::offset_m;
use vialgrid::{
    AlertType, CameraCalibration, EdgeRecord, EngineCfg, EventGeometry, LatLon, Node, ProbeEvent, ProbeKind,
    RoadGraph, TopologyDoc, VisionSample,
};

pub const O: LatLon = LatLon { lat: -12.0464, lon: -77.0428 };

pub fn at(north: f64, east: f64) -> LatLon { offset_m(O, north, east) }

fn node(id: &str, north: f64, east: f64) -> Node {
    let p = at(north, east);
    Node { id: id.into(), lat: p.lat, lon: p.lon, has_camera: false }
}

fn edge(id: &str, s: &str, t: &str) -> EdgeRecord {
    EdgeRecord {
        id: id.into(),
        source_node: s.into(),
        target_node: t.into(),
        geometry: None,
        length_m: None,
        lane_count: Some(2),
        road_class: None,
    }
}

/// Avenida dividida oeste-este: E3 (0..300 m) y E7 (300..600 m) hacia el
/// este sobre y = 0; calzada de vuelta 12 m al norte (E7R, E3R)
pub fn avenue() -> RoadGraph {
    let doc = TopologyDoc {
        nodes: vec![
            node("N0", 0.0, 0.0),
            node("N1", 0.0, 300.0),
            node("N2", 0.0, 600.0),
            node("R0", 12.0, 0.0),
            node("R1", 12.0, 300.0),
            node("R2", 12.0, 600.0),
        ],
        edges: vec![
            edge("E3", "N0", "N1"),
            edge("E7", "N1", "N2"),
            edge("E7R", "R2", "R1"),
            edge("E3R", "R1", "R0"),
        ],
        connections: vec![],
    };
    RoadGraph::from_topology(doc, 1).expect("topología de prueba")
}

pub fn jam(uuid: &str, ts: i64, from_east: f64, to_east: f64, speed: f64, level: i8) -> ProbeEvent {
    ProbeEvent {
        event_uuid: uuid.into(),
        observed_at_ms: ts,
        kind: ProbeKind::Jam,
        alert_type: None,
        subtype: None,
        geometry: EventGeometry::Line(vec![at(1.0, from_east), at(1.0, to_east)]),
        speed_mps: Some(speed),
        delay_s: Some(45.0),
        severity_level: Some(level),
        length_m: Some((to_east - from_east).abs()),
        road_type: Some(2),
        reliability: None,
        confidence: None,
        heading_deg: None,
        regular_speed_mps: None,
    }
}

pub fn alert(uuid: &str, ts: i64, t: AlertType, north: f64, east: f64, magvar: f64) -> ProbeEvent {
    ProbeEvent {
        event_uuid: uuid.into(),
        observed_at_ms: ts,
        kind: ProbeKind::Alert,
        alert_type: Some(t),
        subtype: None,
        geometry: EventGeometry::Point(at(north, east)),
        speed_mps: None,
        delay_s: None,
        severity_level: None,
        length_m: None,
        road_type: None,
        reliability: Some(8),
        confidence: Some(3),
        heading_deg: Some(magvar),
        regular_speed_mps: None,
    }
}

/// 10 px = 1 m; u hacia el este, v hacia el sur; origen en `O`
pub fn calibration(camera: &str) -> CameraCalibration {
    CameraCalibration {
        camera_id: camera.into(),
        homography: [[0.1, 0.0, 0.0], [0.0, -0.1, 0.0], [0.0, 0.0, 1.0]],
        origin: Some(O),
        clock_offset_ms: 0,
    }
}

/// Muestra en el carril hacia el este (2 m al sur del eje)
pub fn sample(track: &str, camera: &str, class_id: u32, ts: i64, east: f64) -> VisionSample {
    VisionSample {
        track_uuid: track.into(),
        camera_id: camera.into(),
        class_id,
        frame_ts_ms: ts,
        pixel: [east * 10.0, 20.0],
        confidence: 0.9,
    }
}

/// Track a velocidad constante entre `t0` y `t1` (ms), una muestra por segundo
pub fn drive(track: &str, camera: &str, class_id: u32, t0: i64, t1: i64, east0: f64, speed: f64) -> Vec<VisionSample> {
    (t0..=t1)
        .step_by(1_000)
        .map(|t| sample(track, camera, class_id, t, east0 + speed * (t - t0) as f64 / 1000.0))
        .collect()
}

pub fn cfg() -> EngineCfg { EngineCfg::default() }
