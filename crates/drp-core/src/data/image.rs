use std::sync::Arc;

use chrono::Utc;
use ndarray::Array2;
use tracing::warn;

use crate::consts::{BASE_NAME_KEY, PROC_FAIL_KEY, PROC_HISTORY_KEY, RAW_IMG_KEY};
use crate::error::Result;

use super::header::{Header, HeaderValue};
use super::history::{ProcessingHistory, StepOutcome};
use super::storage::{active_arena, ScratchFile};

/// Where the pixels of an image live. Clones share the payload; writes
/// always replace it, so sharing is copy-on-write.
#[derive(Clone, Debug)]
enum Payload {
    Memory(Arc<Array2<f32>>),
    Disk(Arc<ScratchFile>),
}

impl Payload {
    fn store(data: Array2<f32>) -> Self {
        if let Some(arena) = active_arena() {
            match arena.acquire(&data) {
                Ok(file) => return Self::Disk(Arc::new(file)),
                Err(e) => warn!(error = %e, "Could not spill image payload, keeping it in memory"),
            }
        }
        Self::Memory(Arc::new(data))
    }

    fn load(&self) -> Result<Arc<Array2<f32>>> {
        match self {
            Self::Memory(data) => Ok(Arc::clone(data)),
            Self::Disk(file) => Ok(Arc::new(file.load()?)),
        }
    }
}

/// Identity fields shared by every kind of data block. The history and
/// failure flag are only mutated by the processor base contract.
#[derive(Clone, Debug)]
pub(crate) struct BlockState {
    base_name: String,
    history: ProcessingHistory,
    failed: bool,
}

impl BlockState {
    /// Take identity out of a header. `CALSTEPS` and `PROCFAIL` are moved out
    /// of the header into structured state; they are restored on write.
    fn extract(header: &mut Header, owner: &str) -> Result<Self> {
        let base_name = header.get_str(BASE_NAME_KEY, owner)?.to_string();
        if !header.contains_key(RAW_IMG_KEY) {
            header.insert(RAW_IMG_KEY, base_name.clone());
        }
        let history = match header.remove(PROC_HISTORY_KEY) {
            Some(HeaderValue::Str(s)) => ProcessingHistory::from_history_string(&s, Utc::now()),
            _ => ProcessingHistory::new(),
        };
        let failed = matches!(header.remove(PROC_FAIL_KEY), Some(HeaderValue::Bool(true)));
        Ok(Self {
            base_name,
            history,
            failed,
        })
    }

    fn write_into(&self, header: &mut Header) {
        header.insert(PROC_HISTORY_KEY, self.history.as_history_string());
        header.insert(PROC_FAIL_KEY, self.failed);
    }
}

/// One exposure: pixel payload plus header.
#[derive(Clone, Debug)]
pub struct Image {
    header: Header,
    payload: Payload,
    state: BlockState,
}

impl Image {
    /// Build an image. The header must carry [`BASE_NAME_KEY`].
    pub fn new(data: Array2<f32>, mut header: Header) -> Result<Self> {
        let state = BlockState::extract(&mut header, "image header")?;
        Ok(Self {
            header,
            payload: Payload::store(data),
            state,
        })
    }

    /// Pixel data. Disk-backed images read their scratch file on every call.
    pub fn data(&self) -> Result<Arc<Array2<f32>>> {
        self.payload.load()
    }

    /// Replace the pixel data. Other clones of this image keep the old data.
    pub fn set_data(&mut self, data: Array2<f32>) {
        self.payload = Payload::store(data);
    }

    pub fn is_disk_backed(&self) -> bool {
        matches!(self.payload, Payload::Disk(_))
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Header including the history and failure mirrors, as written to disk.
    pub fn header_for_write(&self) -> Header {
        let mut header = self.header.clone();
        self.state.write_into(&mut header);
        header
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.header.get(key)
    }

    pub fn base_name(&self) -> &str {
        &self.state.base_name
    }

    pub fn set_base_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.header.insert(BASE_NAME_KEY, name.clone());
        self.state.base_name = name;
    }

    pub fn raw_image_refs(&self) -> Vec<String> {
        raw_refs(&self.header, &self.state.base_name)
    }

    pub fn history(&self) -> &ProcessingHistory {
        &self.state.history
    }

    pub fn is_failed(&self) -> bool {
        self.state.failed
    }

    pub(crate) fn state_mut(&mut self) -> &mut BlockState {
        &mut self.state
    }
}

impl BlockState {
    pub(crate) fn record_step(&mut self, key: &str) {
        let outcome = if self.failed {
            StepOutcome::CarriedFailure
        } else {
            StepOutcome::Completed
        };
        self.history.push(key, outcome);
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }
}

/// Ordered table of extracted sources.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<HeaderValue>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<HeaderValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<HeaderValue>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(crate::error::DrpError::Table(format!(
                "row has {} values but the table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&HeaderValue>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Append a column, or overwrite it when it already exists.
    pub fn set_column(&mut self, name: &str, values: Vec<HeaderValue>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(crate::error::DrpError::Table(format!(
                "column '{}' has {} values but the table has {} rows",
                name,
                values.len(),
                self.rows.len()
            )));
        }
        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
        Ok(())
    }

    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[HeaderValue]) -> bool) {
        self.rows.retain(|r| keep(r));
    }

    /// Row `i` as a header, keyed by column name.
    pub fn row_as_header(&self, i: usize) -> Option<Header> {
        let row = self.rows.get(i)?;
        Some(
            self.columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect(),
        )
    }
}

/// Sources extracted from one image, with the image's metadata attached.
#[derive(Clone, Debug)]
pub struct SourceTable {
    table: Table,
    metadata: Header,
    state: BlockState,
}

impl SourceTable {
    pub fn new(table: Table, mut metadata: Header) -> Result<Self> {
        let state = BlockState::extract(&mut metadata, "source table metadata")?;
        Ok(Self {
            table,
            metadata,
            state,
        })
    }

    /// Build a source table inheriting identity and history from `image`.
    pub fn from_image(table: Table, image: &Image) -> Self {
        Self {
            table,
            metadata: image.header.clone(),
            state: image.state.clone(),
        }
    }

    pub fn data(&self) -> &Table {
        &self.table
    }

    pub fn set_data(&mut self, table: Table) {
        self.table = table;
    }

    pub fn data_mut(&mut self) -> &mut Table {
        &mut self.table
    }

    pub fn header(&self) -> &Header {
        &self.metadata
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.metadata
    }

    pub fn header_for_write(&self) -> Header {
        let mut header = self.metadata.clone();
        self.state.write_into(&mut header);
        header
    }

    pub fn base_name(&self) -> &str {
        &self.state.base_name
    }

    pub fn raw_image_refs(&self) -> Vec<String> {
        raw_refs(&self.metadata, &self.state.base_name)
    }

    pub fn history(&self) -> &ProcessingHistory {
        &self.state.history
    }

    pub fn is_failed(&self) -> bool {
        self.state.failed
    }

    pub(crate) fn state_mut(&mut self) -> &mut BlockState {
        &mut self.state
    }
}

fn raw_refs(header: &Header, base_name: &str) -> Vec<String> {
    match header.get(RAW_IMG_KEY).and_then(|v| v.as_str()) {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        None => vec![base_name.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::RAW_IMG_KEY;

    fn header(name: &str) -> Header {
        Header::new().with(BASE_NAME_KEY, name)
    }

    #[test]
    fn new_requires_base_name() {
        let err = Image::new(Array2::zeros((2, 2)), Header::new()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::DrpError::MissingHeaderKey { ref key, .. } if key == BASE_NAME_KEY
        ));
    }

    #[test]
    fn raw_refs_default_to_base_name() {
        let img = Image::new(Array2::zeros((2, 2)), header("a.fits")).unwrap();
        assert_eq!(img.raw_image_refs(), vec!["a.fits"]);
    }

    #[test]
    fn history_and_failure_move_out_of_header() {
        let h = header("a.fits")
            .with(PROC_HISTORY_KEY, "load,bias,")
            .with(PROC_FAIL_KEY, true)
            .with(RAW_IMG_KEY, "/raw/a.fits,/raw/b.fits");
        let img = Image::new(Array2::zeros((2, 2)), h).unwrap();
        assert!(!img.header().contains_key(PROC_HISTORY_KEY));
        assert!(img.is_failed());
        assert_eq!(img.history().keys().collect::<Vec<_>>(), vec!["load", "bias"]);
        assert_eq!(img.raw_image_refs().len(), 2);

        let written = img.header_for_write();
        assert_eq!(
            written.get(PROC_HISTORY_KEY),
            Some(&HeaderValue::Str("load,bias,".into()))
        );
        assert_eq!(written.get(PROC_FAIL_KEY), Some(&HeaderValue::Bool(true)));
    }

    #[test]
    fn set_data_does_not_affect_clones() {
        let mut img = Image::new(Array2::from_elem((2, 2), 1.0), header("a.fits")).unwrap();
        let copy = img.clone();
        img.set_data(Array2::from_elem((2, 2), 5.0));
        assert_eq!(copy.data().unwrap()[[0, 0]], 1.0);
        assert_eq!(img.data().unwrap()[[0, 0]], 5.0);
    }

    #[test]
    fn table_row_and_column_checks() {
        let mut table = Table::new(vec!["RA".into(), "DEC".into()]);
        table.push_row(vec![10.0.into(), 20.0.into()]).unwrap();
        assert!(table.push_row(vec![1.0.into()]).is_err());
        table.set_column("MAG", vec![18.5.into()]).unwrap();
        assert_eq!(table.columns().len(), 3);
        let row = table.row_as_header(0).unwrap();
        assert_eq!(row.get_f64("MAG", "t").unwrap(), 18.5);
        assert!(table.set_column("X", vec![]).is_err());
    }
}
