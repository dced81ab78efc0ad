//! Core crate for the A-Train cloud dataset: sparse label loading, bilinear
//! interpolation of dense model output, and evaluation.

pub mod cache;
pub mod collate;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fields;
pub mod interp;
pub mod label;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod recipe;
pub mod sensor;
pub mod transforms;

#[cfg(test)]
mod fixtures;

pub use collate::{collate, Batch};
pub use dataset::{ATrainDataset, DatasetOptions, InstanceRecord};
pub use error::{AtrainError, AtrainResult};
pub use interp::interpolate_output;
pub use metrics::{MetricKind, MetricsReport};
pub use recipe::{build_recipe, InterpRecipe};
