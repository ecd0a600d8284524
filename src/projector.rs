//! projector.rs
//!
//! Proyección de tracks de visión (píxeles) al marco geográfico del grafo.
//!
//! - Cada cámara tiene una homografía 3x3 imagen -> suelo, reemplazable
//!   en caliente al recalibrar.
//! - El suelo es WGS84 (lon, lat) o metros este/norte desde un origen.
//! - La resolución sobre aristas usa el mismo buffer y el mismo filtro de
//!   rumbo que el map matching de eventos probe.
//! - Cámaras sin calibración: el track se queda en píxeles y se marca.

use dashmap::DashMap;
use nalgebra::{Matrix3, Vector3};
use std::sync::Arc;
use tracing::info;

use crate::cfg::MatchCfg;
use crate::error::{Result, VialError};
use crate::geo_utils::LocalFrame;
use crate::graph::{EdgeHit, RoadGraph};
use crate::matcher::best_hit;
use crate::types::{CameraCalibration, LatLon};

const DET_EPS: f64 = 1e-12;
const W_EPS: f64 = 1e-9;

#[derive(Clone, Debug)]
pub struct Homography {
    m: Matrix3<f64>,
    ground: Option<LocalFrame>,
}

impl Homography {
    pub fn new(cal: &CameraCalibration) -> Result<Self> {
        let h = &cal.homography;
        let m = Matrix3::new(
            h[0][0], h[0][1], h[0][2],
            h[1][0], h[1][1], h[1][2],
            h[2][0], h[2][1], h[2][2],
        );
        if m.iter().any(|v| !v.is_finite()) {
            return Err(VialError::InvalidCalibration {
                camera_id: cal.camera_id.clone(),
                reason: "valores no finitos".into(),
            });
        }
        if m.determinant().abs() < DET_EPS {
            return Err(VialError::InvalidCalibration {
                camera_id: cal.camera_id.clone(),
                reason: "homografía singular".into(),
            });
        }
        Ok(Self { m, ground: cal.origin.map(LocalFrame::new) })
    }

    /// Píxel -> (lat, lon). `None` si el punto cae en el horizonte (w ~ 0).
    pub fn apply(&self, px: [f64; 2]) -> Option<LatLon> {
        let g = self.m * Vector3::new(px[0], px[1], 1.0);
        if g.z.abs() < W_EPS {
            return None;
        }
        let (x, y) = (g.x / g.z, g.y / g.z);
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let p = match &self.ground {
            Some(frame) => frame.to_latlon([x, y]),
            None => LatLon::new(y, x),
        };
        p.is_valid().then_some(p)
    }
}

#[derive(Debug)]
struct CameraEntry {
    homography: Homography,
    clock_offset_ms: i64,
}

/// Resultado de proyectar un píxel de una cámara
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    Geo(LatLon),
    /// La homografía no da un punto válido (p.ej. sobre el horizonte)
    OutOfGround,
}

pub struct TrackProjector {
    cameras: DashMap<String, Arc<CameraEntry>>,
    cfg: MatchCfg,
}

impl TrackProjector {
    pub fn new(cfg: MatchCfg) -> Self {
        Self { cameras: DashMap::new(), cfg }
    }

    /// Alta o reemplazo (recalibración) de una cámara
    pub fn upsert_calibration(&self, cal: &CameraCalibration) -> Result<()> {
        let homography = Homography::new(cal)?;
        let entry = Arc::new(CameraEntry { homography, clock_offset_ms: cal.clock_offset_ms });
        if self.cameras.insert(cal.camera_id.clone(), entry).is_some() {
            info!(camera = %cal.camera_id, "cámara recalibrada");
        }
        Ok(())
    }

    pub fn remove_calibration(&self, camera_id: &str) -> bool {
        self.cameras.remove(camera_id).is_some()
    }

    pub fn has_calibration(&self, camera_id: &str) -> bool { self.cameras.contains_key(camera_id) }

    pub fn camera_count(&self) -> usize { self.cameras.len() }

    /// Corrección de reloj de la cámara (0 si no está calibrada)
    pub fn clock_offset_ms(&self, camera_id: &str) -> i64 {
        self.cameras.get(camera_id).map(|c| c.clock_offset_ms).unwrap_or(0)
    }

    pub fn project(&self, camera_id: &str, px: [f64; 2]) -> Result<Projection> {
        let cam = self
            .cameras
            .get(camera_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| VialError::CalibrationMissing { camera_id: camera_id.to_string() })?;
        Ok(match cam.homography.apply(px) {
            Some(p) => Projection::Geo(p),
            None => Projection::OutOfGround,
        })
    }

    /// Arista para un punto proyectado, con el mismo buffer/rumbo que el matcher
    pub fn resolve(&self, graph: &RoadGraph, p: LatLon, heading_deg: Option<f64>) -> Option<EdgeHit> {
        let hits = graph.edges_within(graph.to_xy(p), self.cfg.tolerance_m);
        best_hit(&hits, heading_deg, self.cfg.heading_tolerance_deg)
    }
}

/// Velocidad en píxeles por segundo entre dos muestras
#[inline]
pub fn pixel_rate(a: [f64; 2], b: [f64; 2], dt_s: f64) -> Option<f64> {
    if dt_s <= 0.0 { return None; }
    Some(((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt() / dt_s)
}
