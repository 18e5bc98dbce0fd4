use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use crate::consts::BASE_NAME_KEY;
use crate::data::Batch;

use super::{Processor, StepContext, StepResult};

/// Writes selected header values of every image to a per-night CSV log.
///
/// The first batch seen by an instance truncates the file; later batches
/// append to it.
pub struct CsvLog {
    export_keys: Vec<String>,
    output_sub_dir: String,
    output_base_name: Option<String>,
    started: Mutex<bool>,
}

impl CsvLog {
    pub fn new<S: Into<String>>(export_keys: impl IntoIterator<Item = S>) -> Self {
        Self {
            export_keys: export_keys.into_iter().map(Into::into).collect(),
            output_sub_dir: String::new(),
            output_base_name: None,
            started: Mutex::new(false),
        }
    }

    pub fn with_sub_dir(mut self, sub_dir: &str) -> Self {
        self.output_sub_dir = sub_dir.to_string();
        self
    }

    pub fn with_base_name(mut self, name: &str) -> Self {
        self.output_base_name = Some(name.to_string());
        self
    }

    /// `{output}/{night}/{sub_dir}/{base_name or "{night}_log.csv"}`
    pub fn output_path(&self, ctx: &StepContext) -> PathBuf {
        let name = self
            .output_base_name
            .clone()
            .unwrap_or_else(|| format!("{}_log.csv", ctx.night));
        ctx.output_dir(&self.output_sub_dir).join(name)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

impl Processor for CsvLog {
    fn key(&self) -> &'static str {
        "csvlog"
    }

    fn description(&self) -> String {
        format!("Log {:?} to a CSV file", self.export_keys)
    }

    fn process(&self, batch: Batch, ctx: &StepContext) -> StepResult<Batch> {
        let path = self.output_path(ctx);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut started = self
            .started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(*started)
            .truncate(!*started)
            .open(&path)?;

        if !*started {
            let mut columns = vec![BASE_NAME_KEY.to_string()];
            columns.extend(self.export_keys.iter().cloned());
            let line: Vec<String> = columns.iter().map(|c| csv_field(c)).collect();
            writeln!(file, "{}", line.join(","))?;
            *started = true;
        }

        for block in batch.iter() {
            let mut row = vec![csv_field(block.base_name())];
            for key in &self.export_keys {
                row.push(csv_field(&block.header().get_text(key).unwrap_or_default()));
            }
            writeln!(file, "{}", row.join(","))?;
        }
        debug!(path = %path.display(), rows = batch.len(), "Appended to CSV log");
        Ok(batch)
    }

    fn artifacts(&self, ctx: &StepContext) -> Vec<PathBuf> {
        vec![self.output_path(ctx)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_fields_with_separators() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
