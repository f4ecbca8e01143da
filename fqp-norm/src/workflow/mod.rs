//! Sweep orchestration across the normalization phases

pub mod orchestrator;

pub use orchestrator::{NormalizationOrchestrator, PhaseReport, SweepPhase, SweepSummary};
