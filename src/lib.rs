//! vialgrid
//!
//! Motor de conflación espacio-temporal: proyecta eventos probe (atascos,
//! alertas, irregularidades) y tracks de cámaras sobre un grafo vial, sigue
//! su ciclo de vida y emite, por ventana de tiempo, un snapshot del grafo
//! con features por arista y una adyacencia ponderada.

pub mod adjacency;
pub mod cfg;
pub mod data;
pub mod engine;
pub mod error;
pub mod geo_utils;
pub mod graph;
pub mod lifecycle;
pub mod matcher;
pub mod metrics;
pub mod projector;
pub mod replay;
pub mod sink;
pub mod types;
pub mod window;

pub use adjacency::{AdjEntry, Adjacency, AdjacencyBuilder, AdjacencyLevel};
pub use cfg::{AppCfg, EngineCfg};
pub use engine::{ConflationEngine, CycleReport, ProbeOutcome, SampleOutcome};
pub use error::{Result, TopologyError, VialError};
pub use graph::RoadGraph;
pub use metrics::MetricsSummary;
pub use replay::ReplayClock;
pub use sink::{JsonlSink, MemorySink, SnapshotSink};
pub use types::*;
