//! Statistical detection: the two-phase anomaly engine and the per-process
//! risk correlation layer.

pub mod anomaly;
pub mod correlation;

pub use anomaly::{
    AnomalyConfig, AnomalyEngine, AnomalyFlags, AnomalyReport, BaselineProfile, MetricBaseline,
};
pub use correlation::{CorrelationEngine, ProcessRisk, MAX_TRACKED};

#[cfg(test)]
mod tests;
