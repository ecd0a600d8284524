//! geo_utils.rs
//!
//! Utilidades geométricas: distancias haversine, rumbos y una proyección
//! local equirectangular a metros.
//!
//! - Todo el matching se hace en metros sobre el plano local del grafo,
//!   para que las tolerancias (10-15 m) tengan sentido físico.
//! - A escala de ciudad el error de la aproximación es despreciable
//!   frente al ruido de posición del feed.

use geo::{HaversineLength, LineString};

use crate::types::LatLon;

pub const EARTH_R_M: f64 = 6_371_000.0;

#[inline]
pub fn clamp(x: f64, a: f64, b: f64) -> f64 { x.max(a).min(b) }

#[inline]
pub fn haversine_m(a: LatLon, b: LatLon) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_R_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Longitud de una polilínea WGS84 en metros
pub fn polyline_length_m(pts: &[LatLon]) -> f64 {
    if pts.len() < 2 { return 0.0; }
    let line = LineString::from(pts.iter().map(|p| (p.lon, p.lat)).collect::<Vec<_>>());
    line.haversine_length()
}

/// Rumbo inicial a -> b en grados [0, 360), 0 = norte, sentido horario
pub fn bearing_deg(a: LatLon, b: LatLon) -> f64 {
    let (la1, la2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlon = (b.lon - a.lon).to_radians();
    let y = dlon.sin() * la2.cos();
    let x = la1.cos() * la2.sin() - la1.sin() * la2.cos() * dlon.cos();
    normalize_deg(y.atan2(x).to_degrees())
}

/// Rumbo de un vector en el plano local (x = este, y = norte)
#[inline]
pub fn bearing_xy(a: [f64; 2], b: [f64; 2]) -> f64 {
    normalize_deg((b[0] - a[0]).atan2(b[1] - a[1]).to_degrees())
}

#[inline]
pub fn normalize_deg(d: f64) -> f64 {
    let r = d.rem_euclid(360.0);
    if r >= 360.0 { 0.0 } else { r }
}

/// Diferencia angular absoluta en [0, 180]
#[inline]
pub fn angle_diff_deg(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    if d > 180.0 { 360.0 - d } else { d }
}

/// Distancia de `p` al segmento ab y parámetro t in [0,1] de la proyección
pub fn point_segment(p: [f64; 2], a: [f64; 2], b: [f64; 2]) -> (f64, f64) {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    let len2 = dx * dx + dy * dy;
    let t = if len2 <= f64::EPSILON {
        0.0
    } else {
        clamp(((p[0] - a[0]) * dx + (p[1] - a[1]) * dy) / len2, 0.0, 1.0)
    };
    let (qx, qy) = (a[0] + t * dx, a[1] + t * dy);
    (((p[0] - qx).powi(2) + (p[1] - qy).powi(2)).sqrt(), t)
}

#[inline]
pub fn dist_xy(a: [f64; 2], b: [f64; 2]) -> f64 {
    ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt()
}

/// Plano tangente local alrededor de un origen (equirectangular)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalFrame {
    origin: LatLon,
    cos_lat0: f64,
}

impl LocalFrame {
    pub fn new(origin: LatLon) -> Self {
        Self { origin, cos_lat0: origin.lat.to_radians().cos() }
    }

    pub fn origin(&self) -> LatLon { self.origin }

    /// (lat, lon) -> (este, norte) en metros
    pub fn to_xy(&self, p: LatLon) -> [f64; 2] {
        let x = (p.lon - self.origin.lon).to_radians() * EARTH_R_M * self.cos_lat0;
        let y = (p.lat - self.origin.lat).to_radians() * EARTH_R_M;
        [x, y]
    }

    pub fn to_latlon(&self, xy: [f64; 2]) -> LatLon {
        let lat = self.origin.lat + (xy[1] / EARTH_R_M).to_degrees();
        let lon = self.origin.lon + (xy[0] / (EARTH_R_M * self.cos_lat0)).to_degrees();
        LatLon { lat, lon }
    }
}

/// Desplaza un punto `north_m`/`east_m` metros (para fixtures y tests)
pub fn offset_m(p: LatLon, north_m: f64, east_m: f64) -> LatLon {
    LocalFrame::new(p).to_latlon([east_m, north_m])
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMA: LatLon = LatLon { lat: -12.0464, lon: -77.0428 };

    #[test]
    fn haversine_un_grado_de_latitud() {
        let b = LatLon::new(LIMA.lat + 1.0, LIMA.lon);
        let d = haversine_m(LIMA, b);
        assert!((d - 111_195.0).abs() < 100.0, "d = {d}");
    }

    #[test]
    fn frame_ida_y_vuelta() {
        let f = LocalFrame::new(LIMA);
        let p = offset_m(LIMA, 120.0, -80.0);
        let xy = f.to_xy(p);
        assert!((xy[0] + 80.0).abs() < 0.01);
        assert!((xy[1] - 120.0).abs() < 0.01);
        let back = f.to_latlon(xy);
        assert!(haversine_m(back, p) < 0.01);
    }

    #[test]
    fn rumbos() {
        let n = offset_m(LIMA, 100.0, 0.0);
        let e = offset_m(LIMA, 0.0, 100.0);
        assert!(angle_diff_deg(bearing_deg(LIMA, n), 0.0) < 0.5);
        assert!(angle_diff_deg(bearing_deg(LIMA, e), 90.0) < 0.5);
        assert!((bearing_xy([0.0, 0.0], [0.0, -1.0]) - 180.0).abs() < 1e-9);
        assert!((bearing_xy([0.0, 0.0], [-1.0, 0.0]) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn diferencia_angular_cruza_norte() {
        assert!((angle_diff_deg(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((angle_diff_deg(0.0, 180.0) - 180.0).abs() < 1e-9);
        assert!((angle_diff_deg(90.0, 90.0)).abs() < 1e-9);
    }

    #[test]
    fn distancia_a_segmento() {
        let (d, t) = point_segment([5.0, 3.0], [0.0, 0.0], [10.0, 0.0]);
        assert!((d - 3.0).abs() < 1e-9);
        assert!((t - 0.5).abs() < 1e-9);
        let (d, t) = point_segment([-4.0, 3.0], [0.0, 0.0], [10.0, 0.0]);
        assert!((d - 5.0).abs() < 1e-9);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn longitud_polilinea() {
        let pts = vec![LIMA, offset_m(LIMA, 100.0, 0.0), offset_m(LIMA, 100.0, 100.0)];
        let l = polyline_length_m(&pts);
        assert!((l - 200.0).abs() < 0.5, "l = {l}");
    }
}
