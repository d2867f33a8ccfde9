//! Segtrain Training
//!
//! Resumable training runs for pixel-wise segmentation networks:
//! - Hyperparameter and run configuration (`TrainingConfig`, `RunOptions`)
//! - Collaborator seams for datasets and networks (`SegmentationDataset`, `SegmentationNetwork`)
//! - Weighted and unweighted softmax cross-entropy, Adam
//! - Latest/best checkpoints, metric history and best-model promotion
//! - The run loop itself (`Orchestrator`, `train_model`)

pub mod accumulator;
pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod cost;
pub mod dataset;
pub mod error;
pub mod history;
pub mod layout;
pub mod network;
pub mod optim;
pub mod orchestrator;
pub mod params;
pub mod policy;
pub mod report;
pub mod state;
pub mod summary;

pub use accumulator::EpochAccumulator;
pub use artifacts::{ArtifactKind, HyperparameterRecord, RunArtifact, RunManifest};
pub use checkpoint::{Checkpoint, CheckpointScope, CheckpointSlot, CheckpointStore};
pub use config::{AugmentationPolicy, Device, DownsamplingMode, RunOptions, TrainingConfig, GPU_COUNT};
pub use cost::{Cost, CostEvaluation};
pub use dataset::{Batch, DatasetLoader, InMemoryDataset, Sample, SegmentationDataset, Split};
pub use error::{TrainingError, TrainingResult};
pub use history::{MetricHistory, MetricRecord};
pub use layout::RunLayout;
pub use network::{ModelBuilder, Phase, SegmentationNetwork};
pub use optim::{Adam, OptimizerStep, StepMetrics};
pub use orchestrator::{Orchestrator, RunOutcome, TrainingRequest, train_model};
pub use params::{Gradients, Parameter, ParameterKind, ParameterSet};
pub use policy::{BestModelPolicy, BestModelState};
pub use report::RunReport;
pub use state::TrainingState;
pub use summary::{JsonlSummaryWriter, SummaryRecord, SummarySink, TracingSummarySink, read_summaries};
