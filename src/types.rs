//! types.rs
//! Modelos de datos compartidos por el motor: topología (nodos/aristas),
//! entradas (eventos probe, muestras de visión, calibraciones) y salidas por ventana

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::adjacency::Adjacency;

/// Índice estable de una arista dentro del arena del grafo
pub type EdgeIdx = u32;

/// Nivel de severidad reservado para bloqueo total de la vía
pub const SEVERITY_BLOCKED: i8 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    #[serde(alias = "y")]
    pub lat: f64,
    #[serde(alias = "x")]
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self { Self { lat, lon } }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

// ---------------------------------
// Topología estática
// ---------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    #[serde(alias = "node_id")]
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub has_camera: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoadClass {
    #[default]
    Street,
    Primary,
    Freeway,
    Ramp,
    Secondary,
}

impl RoadClass {
    /// Tipos de vía Waze: 1 calle, 2 primaria, 3 autopista, 4 rampa,
    /// 6 primaria mayor, 7 secundaria, 11 salida
    pub fn from_waze(road_type: i32) -> Self {
        match road_type {
            2 | 6 => RoadClass::Primary,
            3 => RoadClass::Freeway,
            4 | 11 => RoadClass::Ramp,
            7 => RoadClass::Secondary,
            _ => RoadClass::Street,
        }
    }
}

/// Arista dirigida ya validada. Inmutable mientras viva la versión del grafo.
#[derive(Clone, Debug, Serialize)]
pub struct Edge {
    pub id: String,
    pub source_node: String,
    pub target_node: String,
    pub centerline: Vec<LatLon>,
    pub length_m: f64,
    pub lane_count: u8,
    pub road_class: RoadClass,
}

/// Arista tal como llega en el documento de topología (campos opcionales)
#[derive(Clone, Debug, Deserialize)]
pub struct EdgeRecord {
    #[serde(alias = "edge_id")]
    pub id: String,
    pub source_node: String,
    pub target_node: String,
    #[serde(default)]
    pub geometry: Option<Vec<LatLon>>,
    #[serde(default, alias = "distance_m")]
    pub length_m: Option<f64>,
    #[serde(default, alias = "lanes")]
    pub lane_count: Option<u8>,
    #[serde(default)]
    pub road_class: Option<RoadClass>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TurnDirection {
    Left,
    Right,
    Straight,
    #[serde(rename = "U-Turn")]
    UTurn,
}

/// Giro permitido de una arista a otra
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnConnection {
    pub from_edge_id: String,
    pub to_edge_id: String,
    pub turn_direction: TurnDirection,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TopologyDoc {
    pub nodes: Vec<Node>,
    pub edges: Vec<EdgeRecord>,
    #[serde(default)]
    pub connections: Vec<TurnConnection>,
}

// ---------------------------------
// Eventos probe (feed colaborativo)
// ---------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Jam,
    Alert,
    Irregularity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Accident,
    Jam,
    #[serde(rename = "WEATHERHAZARD", alias = "WEATHER_HAZARD")]
    WeatherHazard,
    Hazard,
    Misc,
    Construction,
    RoadClosed,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventGeometry {
    Point(LatLon),
    Line(Vec<LatLon>),
}

impl EventGeometry {
    pub fn points(&self) -> &[LatLon] {
        match self {
            EventGeometry::Point(p) => std::slice::from_ref(p),
            EventGeometry::Line(v) => v.as_slice(),
        }
    }
}

/// Una observación (snapshot) de un atasco/alerta/irregularidad
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeEvent {
    #[serde(alias = "uuid")]
    pub event_uuid: String,
    #[serde(alias = "observed_at", alias = "pub_millis")]
    pub observed_at_ms: i64,
    pub kind: ProbeKind,
    #[serde(default, rename = "type")]
    pub alert_type: Option<AlertType>,
    #[serde(default)]
    pub subtype: Option<String>,
    pub geometry: EventGeometry,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    #[serde(default, alias = "delay_seconds")]
    pub delay_s: Option<f64>,
    #[serde(default, alias = "level")]
    pub severity_level: Option<i8>,
    #[serde(default)]
    pub length_m: Option<f64>,
    #[serde(default)]
    pub road_type: Option<i32>,
    #[serde(default)]
    pub reliability: Option<u8>,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default, alias = "magvar")]
    pub heading_deg: Option<f64>,
    #[serde(default)]
    pub regular_speed_mps: Option<f64>,
}

impl ProbeEvent {
    /// Cierre de vía: alerta ROAD_CLOSED o atasco con severidad de bloqueo
    pub fn is_closure(&self) -> bool {
        matches!(self.alert_type, Some(AlertType::RoadClosed))
            || self.severity_level == Some(SEVERITY_BLOCKED)
    }
}

/// Un ciclo de publicación del feed: todo lo que estaba vigente en `fetched_at_ms`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeCycle {
    pub fetched_at_ms: i64,
    pub events: Vec<ProbeEvent>,
}

/// Orden para comparar severidades: el bloqueo (-1) domina a 5
#[inline]
pub fn severity_rank(level: i8) -> i8 {
    if level == SEVERITY_BLOCKED { i8::MAX } else { level }
}

// ---------------------------------
// Visión
// ---------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
    Other(u32),
}

impl VehicleClass {
    /// IDs COCO: 2 coche, 3 moto, 5 bus, 7 camión
    pub fn from_coco(class_id: u32) -> Self {
        match class_id {
            2 => VehicleClass::Car,
            3 => VehicleClass::Motorcycle,
            5 => VehicleClass::Bus,
            7 => VehicleClass::Truck,
            other => VehicleClass::Other(other),
        }
    }

    pub fn label(&self) -> String {
        match self {
            VehicleClass::Car => "car".into(),
            VehicleClass::Motorcycle => "motorcycle".into(),
            VehicleClass::Bus => "bus".into(),
            VehicleClass::Truck => "truck".into(),
            VehicleClass::Other(id) => format!("other_{id}"),
        }
    }
}

fn default_confidence() -> f32 { 1.0 }

/// Una detección de un track en un frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisionSample {
    pub track_uuid: String,
    pub camera_id: String,
    pub class_id: u32,
    #[serde(alias = "frame_timestamp")]
    pub frame_ts_ms: i64,
    #[serde(alias = "pixel_position")]
    pub pixel: [f64; 2],
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub camera_id: String,
    /// Fila mayor: imagen (u, v, 1) -> suelo (x, y, w)
    #[serde(alias = "homography_matrix")]
    pub homography: [[f64; 3]; 3],
    /// Si existe, la salida de la homografía son metros este/norte desde aquí;
    /// si no, la salida es (lon, lat) WGS84
    #[serde(default)]
    pub origin: Option<LatLon>,
    #[serde(default)]
    pub clock_offset_ms: i64,
}

// ---------------------------------
// Salidas por ventana
// ---------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AlertFlags {
    pub accident: bool,
    pub jam: bool,
    pub weather_hazard: bool,
    pub hazard: bool,
    pub misc: bool,
    pub construction: bool,
    pub road_closed: bool,
    pub unknown: bool,
}

impl AlertFlags {
    pub fn set(&mut self, t: AlertType) {
        match t {
            AlertType::Accident => self.accident = true,
            AlertType::Jam => self.jam = true,
            AlertType::WeatherHazard => self.weather_hazard = true,
            AlertType::Hazard => self.hazard = true,
            AlertType::Misc => self.misc = true,
            AlertType::Construction => self.construction = true,
            AlertType::RoadClosed => self.road_closed = true,
            AlertType::Unknown => self.unknown = true,
        }
    }
}

/// Vector de features por arista y ventana. `None` = sin observación (no cero).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EdgeFeatures {
    pub mean_speed_mps: Option<f64>,
    pub probe_observations: u32,
    pub mean_regular_speed_mps: Option<f64>,
    pub max_severity: Option<i8>,
    pub max_delay_s: Option<f64>,
    pub alerts: AlertFlags,
    /// Cierre reportado por el feed durante la ventana
    pub closed: bool,
    /// Marcado como intransitable en la topología
    pub impassable: bool,
    pub vehicle_count: u32,
    pub vehicles_by_class: BTreeMap<String, u32>,
    pub mean_track_speed_mps: Option<f64>,
    pub occurrences_closed: u32,
    pub max_occurrence_duration_s: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WindowedGraphSnapshot {
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub window_start_utc: String,
    pub graph_version: u64,
    pub edges: BTreeMap<String, EdgeFeatures>,
    pub adjacency: Adjacency,
}
