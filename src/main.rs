//! main.rs
//!
//! Daemon de ingesta:
//! - carga topología y calibraciones
//! - un lector del feed probe y un worker por cámara, por canales mpsc
//! - un temporizador que cierra ventanas y entrega snapshots al sink
//!
//! En modo replay el reloj es la menor marca de agua entre los flujos que
//! siguen leyendo (feed probe, reparto de visión, cada cámara); si no, el
//! reloj de pared.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::{signal, task::JoinHandle, time};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vialgrid::data::feed::{parse_calibrations, parse_probe_lines, parse_vision_lines, ProbeInput};
use vialgrid::{AppCfg, ConflationEngine, JsonlSink, ReplayClock, RoadGraph, SnapshotSink, VisionSample};

const PROBE_STREAM: &str = "probe";
const VISION_STREAM: &str = "vision";

#[tokio::main]
async fn main() -> Result<()> {
    // Logs
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let app_cfg = AppCfg::from_env();

    info!("Cargando topología: {}", app_cfg.topology_path);
    let graph = RoadGraph::load(&app_cfg.topology_path, 1)
        .with_context(|| format!("topología {}", app_cfg.topology_path))?;
    info!(nodes = graph.nodes().len(), edges = graph.edge_count(), "grafo listo");

    let engine = Arc::new(ConflationEngine::new(graph, app_cfg.engine.clone()));

    if let Some(path) = &app_cfg.calibrations_path {
        let text = tokio::fs::read_to_string(path).await.with_context(|| format!("calibraciones {path}"))?;
        for cal in parse_calibrations(&text)? {
            if let Err(e) = engine.upsert_calibration(&cal) {
                warn!("calibración descartada: {e}");
            }
        }
        info!(cameras = engine.projector().camera_count(), "calibraciones cargadas");
    }

    let sink: Arc<dyn SnapshotSink> = Arc::new(JsonlSink::new(&app_cfg.out_path)?);

    // Lectores; los flujos se registran antes de arrancar para frenar el reloj
    let clock = Arc::new(ReplayClock::new());
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(path) = app_cfg.probes_path.clone() {
        clock.register(PROBE_STREAM);
        let (e, c) = (engine.clone(), clock.clone());
        readers.push(tokio::spawn(async move { probe_reader(path, e, c).await }));
    }
    if let Some(path) = app_cfg.vision_path.clone() {
        clock.register(VISION_STREAM);
        let (e, c) = (engine.clone(), clock.clone());
        readers.push(tokio::spawn(async move { vision_reader(path, e, c).await }));
    }

    // Temporizador de cierre; si termina es por una violación de invariante
    let mut ticker = {
        let e = engine.clone();
        let s = sink.clone();
        let c = clock.clone();
        let cfg = app_cfg.clone();
        tokio::spawn(async move { tick_loop(e, s, c, cfg).await })
    };

    let all_readers = async {
        for r in readers {
            if let Err(e) = r.await {
                warn!("lector terminado con error: {e}");
            }
        }
    };
    tokio::select! {
        _ = all_readers => { info!("Entradas agotadas"); },
        r = &mut ticker => {
            let reason = match r {
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(())) => "temporizador detenido".to_string(),
                Err(e) => e.to_string(),
            };
            error!("Ingesta detenida: {reason}");
            anyhow::bail!(reason);
        },
        _ = signal::ctrl_c() => { info!("Señal de salida recibida"); }
    }
    ticker.abort();

    // Cierre final: todo lo abierto se cierra y se emite
    let snaps = engine.finish()?;
    for s in &snaps {
        sink.write(s)?;
    }
    sink.flush()?;

    let m = engine.metrics();
    info!(
        emitted = m.windows_emitted,
        unmatched_events = m.unmatched_events,
        unmatched_tracks = m.unmatched_tracks,
        late = m.late_records,
        duplicates = m.duplicate_observations,
        "fin: {}",
        serde_json::to_string(&m)?
    );
    Ok(())
}

async fn probe_reader(path: String, engine: Arc<ConflationEngine>, clock: Arc<ReplayClock>) {
    if let Err(e) = async {
        let text = tokio::fs::read_to_string(&path).await.with_context(|| format!("feed {path}"))?;
        let mut inputs = parse_probe_lines(&text);
        inputs.sort_by_key(|p| p.ts_ms());
        info!(n = inputs.len(), "feed probe cargado");
        for p in inputs {
            let ts = p.ts_ms();
            match p {
                ProbeInput::Cycle(c) => {
                    let r = engine.ingest_probe_cycle(c);
                    tracing::debug!(?r, "ciclo procesado");
                }
                ProbeInput::Event(ev) => {
                    engine.ingest_probe(ev);
                }
            }
            clock.advance(PROBE_STREAM, ts);
            tokio::task::yield_now().await;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await
    {
        warn!("probe_reader: {e:?}");
    }
    clock.finish(PROBE_STREAM);
}

/// Reparte las muestras por cámara: un worker por cámara, en orden de frame
async fn vision_reader(path: String, engine: Arc<ConflationEngine>, clock: Arc<ReplayClock>) {
    if let Err(e) = async {
        let text = tokio::fs::read_to_string(&path).await.with_context(|| format!("visión {path}"))?;
        let mut samples = parse_vision_lines(&text);
        // orden de reloj común; dentro de una cámara equivale al orden de frame
        let projector = engine.projector();
        samples.sort_by_key(|s| s.frame_ts_ms + projector.clock_offset_ms(&s.camera_id));
        info!(n = samples.len(), "muestras de visión cargadas");

        let mut workers: HashMap<String, (mpsc::Sender<VisionSample>, JoinHandle<()>)> = HashMap::new();
        for s in samples {
            if !workers.contains_key(&s.camera_id) {
                clock.register(&s.camera_id);
                let (tx, rx) = mpsc::channel(1024);
                let h = tokio::spawn(camera_worker(s.camera_id.clone(), rx, engine.clone(), clock.clone()));
                workers.insert(s.camera_id.clone(), (tx, h));
            }
            // lo repartido acota a las cámaras que aún no han aparecido
            clock.advance(VISION_STREAM, s.frame_ts_ms + engine.projector().clock_offset_ms(&s.camera_id));
            if let Some((tx, _)) = workers.get(&s.camera_id) {
                tx.send(s).await.context("canal de cámara cerrado")?;
            }
        }
        clock.finish(VISION_STREAM);
        for (camera, (tx, h)) in workers {
            drop(tx);
            if let Err(e) = h.await {
                warn!(%camera, "worker de cámara: {e}");
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await
    {
        warn!("vision_reader: {e:?}");
    }
    clock.finish(VISION_STREAM);
}

async fn camera_worker(
    camera: String,
    mut rx: mpsc::Receiver<VisionSample>,
    engine: Arc<ConflationEngine>,
    clock: Arc<ReplayClock>,
) {
    let mut n = 0usize;
    while let Some(s) = rx.recv().await {
        let ts = s.frame_ts_ms + engine.projector().clock_offset_ms(&camera);
        engine.ingest_sample(s);
        clock.advance(&camera, ts);
        n += 1;
    }
    clock.finish(&camera);
    info!(%camera, samples = n, "cámara procesada");
}

async fn tick_loop(
    engine: Arc<ConflationEngine>,
    sink: Arc<dyn SnapshotSink>,
    clock: Arc<ReplayClock>,
    cfg: AppCfg,
) -> vialgrid::Result<()> {
    let mut iv = time::interval(Duration::from_millis(cfg.tick_ms.max(10)));
    loop {
        iv.tick().await;
        let now = if cfg.replay {
            match clock.now_ms() {
                Some(w) => w,
                None => continue,
            }
        } else {
            chrono::Utc::now().timestamp_millis()
        };
        // sólo los errores de invariante salen de aquí: paran la ingesta
        let snaps = engine.tick(now)?;
        if let Err(e) = async {
            for s in &snaps {
                sink.write(s)?;
            }
            if !snaps.is_empty() {
                sink.flush()?;
                info!(n = snaps.len(), until = snaps[snaps.len() - 1].window_end_ms, "snapshots emitidos");
            }
            Ok::<_, anyhow::Error>(())
        }
        .await
        {
            warn!("tick_loop: {e:?}");
        }
    }
}
