//! replay.rs
//! Reloj de reproducción. Cada flujo de entrada (feed probe, reparto de
//! visión, cada cámara) lleva su propia marca de agua; el reloj es la menor
//! de los flujos activos. Así un flujo adelantado no cierra ventanas que
//! otro todavía está llenando.

use dashmap::DashMap;
use tracing::debug;

/// Registrado pero sin datos todavía
const UNSTARTED: i64 = i64::MIN;

#[derive(Debug, Default)]
pub struct ReplayClock {
    streams: DashMap<String, i64>,
}

impl ReplayClock {
    pub fn new() -> Self { Self::default() }

    /// Da de alta un flujo; frena el reloj hasta que avance
    pub fn register(&self, stream: &str) {
        self.streams.entry(stream.to_string()).or_insert(UNSTARTED);
    }

    /// Marca de agua del flujo; nunca retrocede
    pub fn advance(&self, stream: &str, ts_ms: i64) {
        let mut wm = self.streams.entry(stream.to_string()).or_insert(UNSTARTED);
        if ts_ms > *wm {
            *wm = ts_ms;
        }
    }

    /// El flujo se agotó y deja de frenar el reloj
    pub fn finish(&self, stream: &str) {
        if let Some((_, wm)) = self.streams.remove(stream) {
            debug!(stream, wm, "flujo agotado");
        }
    }

    pub fn active(&self) -> usize { self.streams.len() }

    /// Menor marca de agua entre los flujos activos. `None` si alguno no
    /// ha empezado o si ya no queda ninguno.
    pub fn now_ms(&self) -> Option<i64> {
        let mut min: Option<i64> = None;
        for wm in self.streams.iter() {
            if *wm == UNSTARTED {
                return None;
            }
            min = Some(min.map_or(*wm, |m| m.min(*wm)));
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn el_flujo_mas_lento_manda() {
        let c = ReplayClock::new();
        c.register("probe");
        c.register("C1");
        assert_eq!(c.now_ms(), None);
        c.advance("probe", 900_000);
        assert_eq!(c.now_ms(), None);
        c.advance("C1", 10_000);
        assert_eq!(c.now_ms(), Some(10_000));
        // no retrocede
        c.advance("C1", 5_000);
        assert_eq!(c.now_ms(), Some(10_000));
        c.advance("C1", 950_000);
        assert_eq!(c.now_ms(), Some(900_000));
    }

    #[test]
    fn flujo_agotado_deja_de_frenar() {
        let c = ReplayClock::new();
        c.advance("probe", 100_000);
        c.advance("C1", 40_000);
        c.finish("C1");
        assert_eq!(c.active(), 1);
        assert_eq!(c.now_ms(), Some(100_000));
        c.finish("probe");
        assert_eq!(c.now_ms(), None);
        // idempotente
        c.finish("probe");
        assert_eq!(c.active(), 0);
    }
}
