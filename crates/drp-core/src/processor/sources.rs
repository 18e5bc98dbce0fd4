//! Source-table steps. Detection itself is left to instrument-specific
//! processors; these build tables from known positions and filter them.

use tracing::debug;

use crate::data::{Batch, HeaderValue, SourceTable, Table};

use super::{Processor, ProcessorError, ProcessorKind, Requirement, StepContext, StepResult};

const DEFAULT_RA_KEY: &str = "RA";
const DEFAULT_DEC_KEY: &str = "DEC";

/// Builds a one-row source table per image from position keys in its
/// header, for forced photometry at a known target position.
pub struct SourceTableFromHeader {
    ra_key: String,
    dec_key: String,
    extra_keys: Vec<String>,
}

impl Default for SourceTableFromHeader {
    fn default() -> Self {
        Self::new(DEFAULT_RA_KEY, DEFAULT_DEC_KEY)
    }
}

impl SourceTableFromHeader {
    pub fn new(ra_key: &str, dec_key: &str) -> Self {
        Self {
            ra_key: ra_key.to_string(),
            dec_key: dec_key.to_string(),
            extra_keys: Vec::new(),
        }
    }

    /// Also copy these header keys into the table.
    pub fn with_extra_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.extra_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

impl Processor for SourceTableFromHeader {
    fn key(&self) -> &'static str {
        "sourcetable"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::ImageToSources
    }

    fn description(&self) -> String {
        format!("Source table from header keys {} / {}", self.ra_key, self.dec_key)
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        let mut tables = Vec::with_capacity(batch.len());
        for img in batch.image_refs()? {
            let name = img.base_name();
            let mut columns = vec![self.ra_key.clone(), self.dec_key.clone()];
            columns.extend(self.extra_keys.iter().cloned());

            let row = columns
                .iter()
                .map(|k| Ok(img.header().require(k, name)?.clone()))
                .collect::<StepResult<Vec<HeaderValue>>>()?;

            let mut table = Table::new(columns);
            table.push_row(row)?;
            tables.push(SourceTable::from_image(table, img));
        }
        Ok(Batch::sources(tables))
    }
}

/// Keeps table rows whose numeric `column` lies within `[min, max]`.
pub struct SourceSelector {
    column: String,
    min: f64,
    max: f64,
    requirements: Vec<Requirement>,
}

impl SourceSelector {
    pub fn new(column: &str, min: f64, max: f64) -> Self {
        Self {
            column: column.to_string(),
            min,
            max,
            requirements: vec![Requirement::Kind(ProcessorKind::ImageToSources)],
        }
    }
}

impl Processor for SourceSelector {
    fn key(&self) -> &'static str {
        "sourceselect"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::SourcesToSources
    }

    fn description(&self) -> String {
        format!("Keep sources with {} in [{}, {}]", self.column, self.min, self.max)
    }

    fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        let mut tables = batch.into_sources()?;
        for source in tables.iter_mut() {
            let idx = source.data().column_index(&self.column).ok_or_else(|| {
                ProcessorError::MissingHeaderKey {
                    key: self.column.clone(),
                    name: format!("source table of {}", source.base_name()),
                }
            })?;
            let before = source.data().len();
            let (min, max) = (self.min, self.max);
            source.data_mut().retain_rows(|row| {
                row[idx]
                    .as_f64()
                    .is_some_and(|v| v >= min && v <= max)
            });
            debug!(
                name = source.base_name(),
                before,
                after = source.data().len(),
                "Filtered sources"
            );
        }
        Ok(Batch::sources(tables))
    }
}
