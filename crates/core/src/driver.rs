//! Evaluation over a list of cases.
//!
//! Each case is loaded, segmented with the sliding-window engine, optionally
//! reduced to its largest component, scored against ground truth, and
//! optionally persisted. Metrics are averaged over every evaluated case.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::case_io::{CaseSource, NiftiVolumeSink, VolumeSink};
use crate::components::largest_component;
use crate::crash;
use crate::config::{
    resolve_relative_to, EvalConfig, IntensityPreprocess, PostprocessConfig,
};
use crate::engine::SlidingWindowEngine;
use crate::error::SegmentationError;
use crate::inference::{HeadLayout, PatchInference};
use crate::metrics::{
    CaseMetrics, MetricAccumulator, SegmentationMetrics, SurfaceDistanceMetrics,
};
use crate::volume::{foreground_count, labels_to_f32, zscore, LabelVolume, Volume};

pub type Preprocessor = Box<dyn Fn(Volume) -> Volume>;

#[derive(Debug, Clone, Serialize)]
pub struct CaseOutcome {
    pub id: String,
    pub metrics: CaseMetrics,
    pub foreground_voxels: usize,
    pub patches: usize,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedCase {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub average: CaseMetrics,
    pub cases: Vec<CaseOutcome>,
    pub skipped: Vec<SkippedCase>,
}

impl EvaluationReport {
    pub fn evaluated(&self) -> usize {
        self.cases.len()
    }
}

/// Read a case list: one case path per line, blank lines and `#` comments
/// ignored. Relative paths resolve against the list file's directory.
pub fn read_case_list(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read case list: {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| resolve_relative_to(base, Path::new(line)))
        .collect())
}

pub struct CaseDriver {
    engine: SlidingWindowEngine,
    postprocess: PostprocessConfig,
    source: Box<dyn CaseSource>,
    metrics: Box<dyn SegmentationMetrics>,
    sink: Option<Box<dyn VolumeSink>>,
    preprocess: Option<Preprocessor>,
}

impl CaseDriver {
    /// Build a driver from configuration. Persistence writes `.nii.gz` volumes
    /// under `output.output_directory` when enabled.
    pub fn from_config(config: &EvalConfig, source: Box<dyn CaseSource>) -> Result<Self> {
        config.validate()?;
        let engine = SlidingWindowEngine::new(
            config.window.clone(),
            config.model.num_classes,
            HeadLayout::from_auxiliary_flag(config.model.auxiliary_head_present),
        )?;

        let sink: Option<Box<dyn VolumeSink>> = if config.output.persist_outputs {
            Some(Box::new(NiftiVolumeSink::new(
                config.output.output_directory.clone(),
            )))
        } else {
            None
        };
        let preprocess: Option<Preprocessor> = match config.preprocess.intensity {
            IntensityPreprocess::None => None,
            IntensityPreprocess::Zscore => Some(Box::new(zscore)),
        };

        Ok(Self {
            engine,
            postprocess: config.postprocess.clone(),
            source,
            metrics: Box::new(SurfaceDistanceMetrics {
                spacing: config.metrics.voxel_spacing,
            }),
            sink,
            preprocess,
        })
    }

    pub fn with_metrics(mut self, metrics: Box<dyn SegmentationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_sink(mut self, sink: Option<Box<dyn VolumeSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_preprocess(mut self, preprocess: Option<Preprocessor>) -> Self {
        self.preprocess = preprocess;
        self
    }

    /// Evaluate every case in order.
    ///
    /// A case that fails to load, infer or score is logged and skipped. An
    /// invariant violation stops the run and is returned as the error.
    pub fn evaluate(
        &self,
        case_paths: &[PathBuf],
        model: &mut dyn PatchInference,
    ) -> Result<EvaluationReport> {
        let mut accumulator = MetricAccumulator::default();
        let mut cases = Vec::with_capacity(case_paths.len());
        let mut skipped = Vec::new();

        info!(
            cases = case_paths.len(),
            patch_size = ?self.engine.window().patch_size,
            stride_xy = self.engine.window().stride_xy,
            stride_z = self.engine.window().stride_z,
            largest_component = self.postprocess.apply_largest_component_filter,
            persist = self.sink.is_some(),
            "Starting evaluation"
        );

        for (index, path) in case_paths.iter().enumerate() {
            match self.evaluate_case(path, model) {
                Ok(outcome) => {
                    info!(
                        case = %outcome.id,
                        index = index + 1,
                        total = case_paths.len(),
                        dice = outcome.metrics.dice,
                        jaccard = outcome.metrics.jaccard,
                        hd95 = outcome.metrics.hd95,
                        asd = outcome.metrics.asd,
                        elapsed_secs = outcome.elapsed_secs,
                        "Case evaluated"
                    );
                    accumulator.push(outcome.metrics);
                    cases.push(outcome);
                }
                Err(err) => {
                    let halts = err
                        .downcast_ref::<SegmentationError>()
                        .is_some_and(SegmentationError::halts_run);
                    if halts {
                        error!(
                            case = %path.display(),
                            error = %format!("{err:#}"),
                            "Aborting evaluation"
                        );
                        return Err(err.context(format!(
                            "evaluation halted at case {}",
                            path.display()
                        )));
                    }
                    warn!(
                        case = %path.display(),
                        error = %format!("{err:#}"),
                        "Skipping case"
                    );
                    skipped.push(SkippedCase {
                        path: path.clone(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }

        let average = accumulator.average();
        info!(
            evaluated = accumulator.cases(),
            skipped = skipped.len(),
            %average,
            "Evaluation finished"
        );

        Ok(EvaluationReport {
            average,
            cases,
            skipped,
        })
    }

    fn evaluate_case(&self, path: &Path, model: &mut dyn PatchInference) -> Result<CaseOutcome> {
        let started = Instant::now();
        let case = self
            .source
            .load_case(path)
            .with_context(|| format!("failed to load case {}", path.display()))?;
        debug!(case = %case.id, shape = ?case.image.dim(), "Loaded case");
        let _in_flight = crash::enter_case(&case.id);

        let image = match &self.preprocess {
            Some(preprocess) => preprocess(case.image),
            None => case.image,
        };
        let persisted_image = self.sink.as_ref().map(|_| image.clone());

        let segmentation = self.engine.segment(image, model)?;
        let prediction = self.filter_components(segmentation.labels)?;

        let foreground_voxels = foreground_count(&prediction);
        let metrics = if foreground_voxels == 0 {
            debug!(case = %case.id, "Empty prediction; scoring as zero");
            CaseMetrics::zero()
        } else {
            self.metrics
                .evaluate(prediction.view(), case.label.view())
                .with_context(|| format!("failed to score case {}", case.id))?
        };

        if let (Some(sink), Some(image)) = (&self.sink, persisted_image) {
            sink.write_volume(&format!("{}_pred", case.id), labels_to_f32(&prediction).view())?;
            sink.write_volume(&format!("{}_img", case.id), image.view())?;
            sink.write_volume(&format!("{}_gt", case.id), labels_to_f32(&case.label).view())?;
        }

        Ok(CaseOutcome {
            id: case.id,
            metrics,
            foreground_voxels,
            patches: segmentation.patches,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn filter_components(&self, labels: LabelVolume) -> Result<LabelVolume, SegmentationError> {
        if !self.postprocess.apply_largest_component_filter {
            return Ok(labels);
        }
        match largest_component(&labels, self.postprocess.connectivity) {
            Ok(kept) => Ok(kept),
            // An all-background prediction stays all-background and scores zero.
            Err(SegmentationError::EmptyForeground) => Ok(labels),
            Err(other) => Err(other),
        }
    }
}
