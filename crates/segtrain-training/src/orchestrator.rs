//! The resumable training run.
//!
//! One step draws a randomized minibatch, applies one optimizer update and records
//! its loss and accuracy. Every `epoch_size` steps the epoch is closed: train means
//! are summarized, the whole validation set is evaluated in inference mode, the
//! result is appended to the history and the best checkpoint may be replaced. Every
//! `save_step` steps the latest checkpoint, the history and the report are written.
//! The two cadences are independent.

use crate::accumulator::EpochAccumulator;
use crate::artifacts::{HyperparameterRecord, RunManifest};
use crate::checkpoint::{CheckpointScope, CheckpointSlot, CheckpointStore};
use crate::config::{AugmentationPolicy, RunOptions, TrainingConfig};
use crate::cost::Cost;
use crate::dataset::{Batch, DatasetLoader, SegmentationDataset, Split};
use crate::error::{TrainingError, TrainingResult};
use crate::history::{MetricHistory, MetricRecord};
use crate::layout::RunLayout;
use crate::network::{ModelBuilder, SegmentationNetwork};
use crate::optim::{OptimizerStep, StepMetrics};
use crate::params::{ParameterKind, ParameterSet};
use crate::policy::{BestModelPolicy, BestModelState};
use crate::report::RunReport;
use crate::state::{TrainingState, is_display_boundary, is_save_boundary};
use crate::summary::{JsonlSummaryWriter, SummaryRecord, SummarySink};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Everything needed to start or resume a run.
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    /// Root holding the `train/` and `validation/` splits.
    pub path_trainingset: PathBuf,
    /// Output directory of the run.
    pub path_model: PathBuf,
    pub config: TrainingConfig,
    /// Directory of an earlier run to resume from.
    pub path_model_init: Option<PathBuf>,
    pub options: RunOptions,
}

impl TrainingRequest {
    #[must_use]
    pub fn new(path_trainingset: impl Into<PathBuf>, path_model: impl Into<PathBuf>, config: TrainingConfig) -> Self {
        Self {
            path_trainingset: path_trainingset.into(),
            path_model: path_model.into(),
            config,
            path_model_init: None,
            options: RunOptions::default(),
        }
    }

    #[must_use]
    pub fn resume_from(mut self, path_model_init: impl Into<PathBuf>) -> Self {
        self.path_model_init = Some(path_model_init.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Optimizer steps taken by this invocation.
    pub steps: u64,
    /// Last completed epoch, counting epochs restored from a resumed run.
    pub last_epoch: u32,
    /// Best-checkpoint replacements made by this invocation.
    pub promotions: u32,
    pub best: Option<BestModelState>,
    pub manifest: RunManifest,
}

pub struct Orchestrator {
    layout: RunLayout,
    config: TrainingConfig,
    options: RunOptions,
    state: TrainingState,
    train: Box<dyn SegmentationDataset>,
    validation: Box<dyn SegmentationDataset>,
    network: Box<dyn SegmentationNetwork>,
    optimizer: OptimizerStep,
    accumulator: EpochAccumulator,
    policy: BestModelPolicy,
    history: MetricHistory,
    checkpoints: CheckpointStore,
    summaries: Box<dyn SummarySink>,
    report: RunReport,
    promotions: u32,
}

impl Orchestrator {
    /// Validates the request, persists the hyperparameters, opens both splits, builds
    /// the network and, when resuming, restores parameters and history.
    pub fn prepare(
        request: TrainingRequest,
        datasets: &dyn DatasetLoader,
        builder: &dyn ModelBuilder,
    ) -> TrainingResult<Self> {
        let TrainingRequest { path_trainingset, path_model, config, path_model_init, options } = request;
        config.validate()?;
        options.validate()?;
        if let Some(init) = &path_model_init {
            check_resumable(init)?;
        }

        let layout = RunLayout::new(&path_model);
        layout.ensure_dirs()?;
        HyperparameterRecord {
            config: config.clone(),
            restored_from: path_model_init.clone(),
            device: options.device,
            save_trainable: options.save_trainable,
            created_at: Utc::now(),
        }
        .write(&layout.hyperparameters_path())?;

        let train = open_split(datasets, &path_trainingset, Split::Train, &config)?;
        let validation = open_split(datasets, &path_trainingset, Split::Validation, &config)?;
        let epoch_size = train.size() as u64;

        let mut network = builder.build(&config, options.device)?;
        let parameters = network.parameters();
        info!(
            device = %options.device,
            trainable = parameters.scalar_count(ParameterKind::Trainable),
            statistics = parameters.scalar_count(ParameterKind::Statistic),
            "network built"
        );

        let cost = Cost::for_config(config.weighted_cost);
        info!(cost = %cost, "cost selected");
        let mut optimizer = OptimizerStep::new(cost, config.learning_rate);

        let checkpoints = CheckpointStore::new(layout.root(), CheckpointScope::from_save_trainable(options.save_trainable));
        let history = match &path_model_init {
            Some(init) => restore_run(init, network.as_mut(), &mut optimizer, &checkpoints)?,
            None => MetricHistory::new(),
        };

        let policy = BestModelPolicy::replay(history.records());
        let state = TrainingState::new(epoch_size, options.max_epoch, history.last_epoch());
        let report = RunReport::new(layout.root(), &config, epoch_size, path_model_init.as_deref());

        Ok(Self {
            summaries: Box::new(JsonlSummaryWriter::new(layout.clone())),
            layout,
            config,
            options,
            state,
            train,
            validation,
            network,
            optimizer,
            accumulator: EpochAccumulator::new(),
            policy,
            history,
            checkpoints,
            report,
            promotions: 0,
        })
    }

    /// Replaces the default JSONL summary writer.
    #[must_use]
    pub fn with_summary_sink(mut self, sink: Box<dyn SummarySink>) -> Self {
        self.summaries = sink;
        self
    }

    #[must_use]
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    #[must_use]
    pub fn history(&self) -> &MetricHistory {
        &self.history
    }

    #[must_use]
    pub fn best(&self) -> Option<&BestModelState> {
        self.policy.best()
    }

    #[must_use]
    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Runs until `epoch == max_epoch`, then writes the final artifacts.
    ///
    /// A `Divergence` error stops the run immediately; artifacts written before it
    /// are left as they were.
    pub fn run(mut self) -> TrainingResult<RunOutcome> {
        info!(
            run_dir = %self.layout.root().display(),
            epoch = self.state.epoch,
            max_epoch = self.state.max_epoch,
            epoch_size = self.state.epoch_size,
            batch_size = self.config.batch_size,
            "training started"
        );

        while self.state.should_continue() {
            self.train_step()?;
            if self.state.at_epoch_boundary() {
                self.finish_epoch()?;
            }
            if is_save_boundary(self.state.step, self.options.save_step) {
                self.save_progress()?;
            }
            self.state.advance_step();
        }

        self.finish()
    }

    fn train_step(&mut self) -> TrainingResult<()> {
        let step = self.state.step;
        let batch = draw(
            self.train.as_mut(),
            self.optimizer.cost(),
            self.config.batch_size,
            true,
            &self.config.data_augmentation,
        )?;
        let metrics = self.optimizer.run(self.network.as_mut(), &batch, self.config.dropout, step)?;
        self.accumulator.record(metrics.loss, metrics.accuracy);

        if is_display_boundary(step, self.options.display_step) {
            let probe = self.optimizer.evaluate(self.network.as_mut(), &batch)?;
            debug!(
                step,
                samples = step * self.config.batch_size as u64,
                loss = probe.loss,
                accuracy = probe.accuracy,
                "minibatch"
            );
        }
        Ok(())
    }

    fn finish_epoch(&mut self) -> TrainingResult<()> {
        let epoch = self.state.epoch;
        let step = self.state.step;

        if let Some((loss, accuracy)) = self.accumulator.flush() {
            self.summaries.on_record(&SummaryRecord::new(Split::Train, epoch, step, loss, accuracy))?;
        }

        let validation = self.validate()?;
        if !validation.loss.is_finite() {
            return Err(TrainingError::Divergence { step, loss: validation.loss });
        }
        self.summaries.on_record(&SummaryRecord::new(
            Split::Validation,
            epoch,
            step,
            validation.loss,
            validation.accuracy,
        ))?;

        let record = MetricRecord::new(epoch, validation.loss, validation.accuracy);
        self.history.append(record)?;
        if self.policy.evaluate(&record) {
            let path = self.checkpoints.save(CheckpointSlot::Best, epoch, &self.snapshot())?;
            self.promotions += 1;
            info!(
                epoch,
                loss = record.loss,
                accuracy = record.accuracy,
                path = %path.display(),
                "best model replaced"
            );
        }

        self.state.complete_epoch();
        Ok(())
    }

    /// Evaluates the entire validation set as one batch, from the first sample.
    fn validate(&mut self) -> TrainingResult<StepMetrics> {
        self.validation.reset_cursor();
        let size = self.validation.size();
        let batch = draw(
            self.validation.as_mut(),
            self.optimizer.cost(),
            size,
            false,
            &AugmentationPolicy::none(),
        )?;
        self.optimizer.evaluate(self.network.as_mut(), &batch)
    }

    fn save_progress(&self) -> TrainingResult<()> {
        let epoch = self.state.completed_epoch();
        let path = self.checkpoints.save(CheckpointSlot::Latest, epoch, &self.snapshot())?;
        self.history.persist(&self.layout.history_path())?;
        self.report.write(&self.layout.report_path(), self.history.last())?;
        info!(step = self.state.step, epoch, path = %path.display(), "model saved");
        Ok(())
    }

    fn finish(self) -> TrainingResult<RunOutcome> {
        self.save_progress()?;

        let steps = self.state.step - 1;
        let last_epoch = self.state.completed_epoch();
        let best = self.policy.best().copied();
        let manifest = RunManifest::collect(&self.layout, steps, last_epoch, best)?;
        manifest.write(&self.layout.manifest_path())?;

        info!(steps, last_epoch, promotions = self.promotions, "training finished");
        Ok(RunOutcome { steps, last_epoch, promotions: self.promotions, best, manifest })
    }

    /// Parameters to checkpoint; optimizer state is only gathered when the scope keeps it.
    fn snapshot(&self) -> ParameterSet {
        let mut parameters = self.network.parameters().clone();
        if self.checkpoints.scope() == CheckpointScope::All {
            parameters.extend(self.optimizer.adam().state());
        }
        parameters
    }
}

/// Starts or resumes a run and drives it to completion.
pub fn train_model(
    request: TrainingRequest,
    datasets: &dyn DatasetLoader,
    builder: &dyn ModelBuilder,
) -> TrainingResult<RunOutcome> {
    Orchestrator::prepare(request, datasets, builder)?.run()
}

fn check_resumable(init: &Path) -> TrainingResult<()> {
    let layout = RunLayout::new(init);
    for path in [layout.checkpoint_path(CheckpointSlot::Latest), layout.history_path()] {
        if !path.is_file() {
            return Err(TrainingError::Resume(format!("{} does not exist", path.display())));
        }
    }
    Ok(())
}

fn open_split(
    datasets: &dyn DatasetLoader,
    root: &Path,
    split: Split,
    config: &TrainingConfig,
) -> TrainingResult<Box<dyn SegmentationDataset>> {
    let dataset = datasets.open(root, split, &config.thresholds)?;
    if dataset.size() == 0 {
        return Err(TrainingError::Dataset(format!("the {split} split is empty")));
    }
    info!(split = %split, size = dataset.size(), "dataset opened");
    Ok(dataset)
}

/// Restores model parameters, and optimizer state for `CheckpointScope::All`, from the
/// latest checkpoint of `init`, and carries its best checkpoint over into `checkpoints`.
/// Returns the restored history.
fn restore_run(
    init: &Path,
    network: &mut dyn SegmentationNetwork,
    optimizer: &mut OptimizerStep,
    checkpoints: &CheckpointStore,
) -> TrainingResult<MetricHistory> {
    let scope = checkpoints.scope();
    let layout = RunLayout::new(init);
    let path = layout.checkpoint_path(CheckpointSlot::Latest);
    let checkpoint = CheckpointStore::restore(&path)?;

    network
        .parameters_mut()
        .assign_from(&checkpoint.parameters, ParameterKind::is_model)
        .map_err(|reason| TrainingError::restore(&path, reason))?;

    if scope == CheckpointScope::All {
        if checkpoint.scope != CheckpointScope::All {
            return Err(TrainingError::restore(&path, "checkpoint holds no optimizer state"));
        }
        optimizer
            .adam_mut()
            .load_state(&checkpoint.parameters, network.parameters())
            .map_err(|reason| TrainingError::restore(&path, reason))?;
    }

    let history = MetricHistory::load(&layout.history_path())?;

    let best_path = layout.checkpoint_path(CheckpointSlot::Best);
    if best_path.is_file() {
        let best = CheckpointStore::restore(&best_path)?;
        checkpoints.save(CheckpointSlot::Best, best.epoch, &best.parameters)?;
        debug!(path = %best_path.display(), epoch = best.epoch, "best checkpoint carried over");
    }

    info!(
        path = %path.display(),
        checkpoint_epoch = checkpoint.epoch,
        last_epoch = history.last_epoch(),
        optimizer_restored = scope == CheckpointScope::All,
        "model restored"
    );
    Ok(history)
}

fn draw(
    dataset: &mut dyn SegmentationDataset,
    cost: Cost,
    n: usize,
    randomize: bool,
    augmentation: &AugmentationPolicy,
) -> TrainingResult<Batch> {
    let batch = if cost.needs_weights() {
        dataset.next_batch_with_weights(n, randomize, augmentation)?
    } else {
        dataset.next_batch(n, randomize, augmentation)?
    };
    batch.check_shapes()?;
    Ok(batch)
}
