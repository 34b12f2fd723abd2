// Module declarations
pub mod density;
pub mod geography;
pub mod parse;
pub mod pca;
pub mod process;
pub mod progress;
pub mod stats;

pub use crate::geography::{EnvSamples, EnvStack, Group, GroupSamples, OccurrencePoint};
pub use crate::process::{
    run_from_samples, run_pipeline, MetricCell, MetricMatrix, NicheConfig, NicheError, NicheResults,
};

#[cfg(test)]
mod tests;
