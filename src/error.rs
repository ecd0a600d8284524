//! error.rs
//! Taxonomía de errores del motor. Sólo la topología y las violaciones de
//! invariantes son fatales; lo demás (sin match, tardío, duplicado) se
//! reporta como resultado y contador, nunca como error.

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("topología vacía")]
    Empty,
    #[error("nodo duplicado: {0}")]
    DuplicateNode(String),
    #[error("arista duplicada: {0}")]
    DuplicateEdge(String),
    #[error("arista {edge} referencia nodo inexistente {node}")]
    DanglingNode { edge: String, node: String },
    #[error("conexión {from} -> {to} referencia una arista inexistente")]
    DanglingConnection { from: String, to: String },
    #[error("arista {0} sin geometría válida")]
    DegenerateGeometry(String),
    #[error("coordenada inválida en {0}")]
    InvalidCoordinate(String),
    #[error("GeoJSON debe ser FeatureCollection")]
    NotFeatureCollection,
    #[error("feature {index}: falta la propiedad {prop}")]
    MissingProperty { index: usize, prop: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum VialError {
    #[error("topología inválida: {0}")]
    Topology(#[from] TopologyError),

    #[error("cámara {camera_id} sin calibración")]
    CalibrationMissing { camera_id: String },

    #[error("calibración inválida para {camera_id}: {reason}")]
    InvalidCalibration { camera_id: String, reason: String },

    #[error("arista desconocida: {0}")]
    UnknownEdge(String),

    #[error("violación de invariante: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    GeoJson(#[from] geojson::Error),
}

pub type Result<T> = std::result::Result<T, VialError>;
