use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::data::{Batch, Dataset, Image};
use crate::error::{DrpError, Result};
use crate::paths;
use crate::processor::utils::ImageLoader;
use crate::processor::{apply, ErrorClass, StepContext};
use crate::report::{ErrorReport, ErrorStack};

use super::configuration::ProcessorList;
use super::instrument::{configuration, get_instrument, Instrument};
use super::types::{NoOpReporter, ProgressReporter};

/// Runs named configurations of one instrument over datasets for one night.
pub struct Pipeline {
    instrument: Arc<dyn Instrument>,
    ctx: StepContext,
    selected: Vec<String>,
    reporter: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    /// Build a pipeline, validating every configuration the instrument
    /// offers and checking that each `selected` name exists.
    pub fn new(
        instrument: Arc<dyn Instrument>,
        ctx: StepContext,
        selected: &[String],
    ) -> Result<Self> {
        for (name, list) in instrument.configurations() {
            list.validate().inspect_err(|e| {
                error!(instrument = instrument.name(), configuration = %name, "{e}");
            })?;
        }
        for name in selected {
            configuration(instrument.as_ref(), name)?;
        }
        debug!(
            instrument = instrument.name(),
            night = %ctx.night,
            selected = ?selected,
            "Pipeline ready"
        );
        Ok(Self {
            instrument,
            ctx,
            selected: selected.to_vec(),
            reporter: Arc::new(NoOpReporter),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn instrument(&self) -> &Arc<dyn Instrument> {
        &self.instrument
    }

    pub fn context(&self) -> &StepContext {
        &self.ctx
    }

    pub fn night(&self) -> &str {
        &self.ctx.night
    }

    /// Configuration names chosen at construction.
    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn load_raw_image(&self, path: &Path) -> Result<Vec<Image>> {
        self.instrument.load_raw_image(path)
    }

    pub fn raw_img_dir(&self, raw_sub_dir: &str) -> PathBuf {
        self.ctx.raw_dir(raw_sub_dir)
    }

    pub fn error_log_path(&self) -> PathBuf {
        paths::error_log_path(
            &self.ctx.output_root,
            self.instrument.name(),
            &self.ctx.night_sub_dir,
        )
    }

    pub fn processing_log_path(&self) -> PathBuf {
        paths::processing_log_path(&self.ctx.output_root, &self.ctx.night_sub_dir)
    }

    /// Files written by any step of the named configurations.
    pub fn artifacts(&self, configurations: &[String]) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for name in configurations {
            for step in configuration(self.instrument.as_ref(), name)? {
                out.extend(step.artifacts(&self.ctx));
            }
        }
        Ok(out)
    }

    /// Steps rerun over a night after its reduction: the first load step of
    /// the selected configurations followed by the instrument's postprocess
    /// steps for `postprocess`.
    pub fn postprocess_list(
        &self,
        processed: &[String],
        postprocess: &[String],
    ) -> Result<ProcessorList> {
        let mut list = ProcessorList::new();
        for name in &self.selected {
            let loader = configuration(self.instrument.as_ref(), name)?
                .iter()
                .find(|step| step.key() == ImageLoader::KEY)
                .cloned();
            if let Some(loader) = loader {
                list.push(loader);
                break;
            }
        }
        Ok(list + self.instrument.postprocess_configuration(processed, postprocess)?)
    }

    /// Reduce with the configurations selected at construction.
    pub fn reduce(&self, dataset: Dataset, catch_all_errors: bool) -> Result<(Dataset, ErrorStack)> {
        self.reduce_images(dataset, &self.selected, catch_all_errors)
    }

    /// Apply each named configuration in turn to every batch of `dataset`.
    ///
    /// With `catch_all_errors` a failing batch is reported and dropped while
    /// the others continue; without it the first failure aborts the run with
    /// [`DrpError::Aborted`]. Noncritical failures never abort: the batch is
    /// kept with every block marked failed.
    pub fn reduce_images(
        &self,
        mut dataset: Dataset,
        configurations: &[String],
        catch_all_errors: bool,
    ) -> Result<(Dataset, ErrorStack)> {
        let lists = configurations
            .iter()
            .map(|name| configuration(self.instrument.as_ref(), name))
            .collect::<Result<Vec<_>>>()?;

        let mut errors = ErrorStack::new();
        for (name, list) in configurations.iter().zip(lists) {
            info!(
                configuration = %name,
                steps = list.len(),
                batches = dataset.len(),
                "Running configuration"
            );
            dataset = self.run_list(dataset, list, catch_all_errors, &mut errors)?;
        }
        Ok((dataset, errors))
    }

    /// Like [`reduce_images`](Self::reduce_images) for an ad-hoc list that is
    /// not one of the instrument's configurations.
    pub fn reduce_with(
        &self,
        dataset: Dataset,
        list: &ProcessorList,
        catch_all_errors: bool,
    ) -> Result<(Dataset, ErrorStack)> {
        list.validate()?;
        let mut errors = ErrorStack::new();
        let dataset = self.run_list(dataset, list, catch_all_errors, &mut errors)?;
        Ok((dataset, errors))
    }

    fn run_list(
        &self,
        mut dataset: Dataset,
        list: &ProcessorList,
        catch_all_errors: bool,
        errors: &mut ErrorStack,
    ) -> Result<Dataset> {
        for step in list {
            let batches = dataset.into_batches();
            self.reporter.begin_step(step.key(), batches.len());
            let mut processed = Dataset::new();
            for (i, batch) in batches.into_iter().enumerate() {
                let contents = batch.raw_image_names();
                let retained = batch.clone();
                match apply(step.as_ref(), batch, &self.ctx) {
                    Ok(output) => processed.push(output),
                    Err(err) => {
                        let report = ErrorReport::new(step.key(), &err, contents);
                        match err.class() {
                            ErrorClass::Noncritical => {
                                warn!(step = step.key(), "Noncritical failure: {err}");
                                processed.push(mark_failed(retained));
                            }
                            ErrorClass::Domain => {
                                warn!(step = step.key(), images = ?report.contents, "{err}");
                                if !catch_all_errors {
                                    return Err(DrpError::Aborted(Box::new(report)));
                                }
                            }
                            ErrorClass::Unclassified => {
                                error!(
                                    step = step.key(),
                                    images = ?report.contents,
                                    detail = ?err,
                                    "Unexpected failure"
                                );
                                if !catch_all_errors {
                                    return Err(DrpError::Aborted(Box::new(report)));
                                }
                            }
                        }
                        errors.add_report(report);
                    }
                }
                self.reporter.advance(i + 1);
            }
            dataset = step.regroup(processed);
            self.reporter.finish_step();
            debug!(step = step.key(), batches = dataset.len(), "Step complete");
        }

        let pruned = dataset.prune_empty();
        if pruned > 0 {
            debug!(pruned, "Removed empty batches");
        }
        Ok(dataset)
    }
}

fn mark_failed(mut batch: Batch) -> Batch {
    for block in batch.iter_mut() {
        block.state_mut().mark_failed();
    }
    batch
}

/// Build a pipeline for a built-in instrument.
pub fn get_pipeline(instrument: &str, ctx: StepContext, selected: &[String]) -> Result<Pipeline> {
    Pipeline::new(get_instrument(instrument)?, ctx, selected)
}
