//! sink.rs
//! Destinos de los snapshots por ventana. El motor no hace I/O: el daemon
//! entrega cada `WindowedGraphSnapshot` emitido a un `SnapshotSink`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, VialError};
use crate::types::WindowedGraphSnapshot;

pub trait SnapshotSink: Send + Sync {
    fn write(&self, snap: &WindowedGraphSnapshot) -> Result<()>;

    fn flush(&self) -> Result<()> { Ok(()) }
}

/// Un snapshot por línea (JSON lines), en modo append
pub struct JsonlSink {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let f = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, out: Mutex::new(BufWriter::new(f)) })
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl SnapshotSink for JsonlSink {
    fn write(&self, snap: &WindowedGraphSnapshot) -> Result<()> {
        let line = serde_json::to_string(snap)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| VialError::InvariantViolation("sink JSONL envenenado".into()))?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| VialError::InvariantViolation("sink JSONL envenenado".into()))?;
        out.flush()?;
        Ok(())
    }
}

/// Acumula en memoria (tests y consumidores embebidos)
#[derive(Default)]
pub struct MemorySink {
    snaps: Mutex<Vec<WindowedGraphSnapshot>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn take(&self) -> Vec<WindowedGraphSnapshot> {
        self.snaps.lock().map(|mut v| std::mem::take(&mut *v)).unwrap_or_default()
    }
}

impl SnapshotSink for MemorySink {
    fn write(&self, snap: &WindowedGraphSnapshot) -> Result<()> {
        self.snaps
            .lock()
            .map_err(|_| VialError::InvariantViolation("sink en memoria envenenado".into()))?
            .push(snap.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjacency::Adjacency;
    use std::collections::BTreeMap;

    fn snap(start: i64) -> WindowedGraphSnapshot {
        WindowedGraphSnapshot {
            window_start_ms: start,
            window_end_ms: start + 300_000,
            window_start_utc: String::new(),
            graph_version: 1,
            edges: BTreeMap::new(),
            adjacency: Adjacency::default(),
        }
    }

    #[test]
    fn jsonl_una_linea_por_snapshot() {
        let dir = std::env::temp_dir().join(format!("vialgrid-sink-{}", std::process::id()));
        let path = dir.join("snaps.jsonl");
        let _ = std::fs::remove_file(&path);
        let sink = JsonlSink::new(&path).unwrap();
        sink.write(&snap(0)).unwrap();
        sink.write(&snap(300_000)).unwrap();
        sink.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["window_start_ms"], 300_000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn memoria_acumula_y_vacia() {
        let s = MemorySink::new();
        s.write(&snap(0)).unwrap();
        assert_eq!(s.take().len(), 1);
        assert!(s.take().is_empty());
    }
}
