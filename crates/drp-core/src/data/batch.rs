use std::path::Path;

use tracing::error;

use crate::error::{DrpError, Result};

use super::block::{DataBlock, DataKind};
use super::image::{Image, SourceTable};

/// An ordered, homogeneous group of data blocks processed together.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    declared: Option<DataKind>,
    blocks: Vec<DataBlock>,
}

impl Batch {
    /// An empty batch that accepts whichever kind is appended first.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty batch that only accepts `kind`.
    pub fn of_kind(kind: DataKind) -> Self {
        Self {
            declared: Some(kind),
            blocks: Vec::new(),
        }
    }

    pub fn images(images: impl IntoIterator<Item = Image>) -> Self {
        Self {
            declared: Some(DataKind::Image),
            blocks: images.into_iter().map(DataBlock::Image).collect(),
        }
    }

    pub fn sources(tables: impl IntoIterator<Item = SourceTable>) -> Self {
        Self {
            declared: Some(DataKind::SourceTable),
            blocks: tables.into_iter().map(DataBlock::Sources).collect(),
        }
    }

    /// Build a batch from arbitrary blocks, failing on the first block whose
    /// kind differs from the ones before it.
    pub fn from_blocks(blocks: impl IntoIterator<Item = DataBlock>) -> Result<Self> {
        let mut batch = Self::new();
        for block in blocks {
            batch.append(block)?;
        }
        Ok(batch)
    }

    /// Declared kind, or the kind of the blocks already present.
    pub fn kind(&self) -> Option<DataKind> {
        self.declared
            .or_else(|| self.blocks.first().map(DataBlock::kind))
    }

    /// Append a block. On a kind mismatch the batch is left untouched.
    pub fn append(&mut self, block: impl Into<DataBlock>) -> Result<()> {
        let block = block.into();
        if let Some(expected) = self.kind() {
            if block.kind() != expected {
                let err = DrpError::DataType {
                    expected,
                    found: block.kind(),
                };
                error!(name = block.base_name(), "{err}");
                return Err(err);
            }
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Concatenate two batches, preserving order (`self` first).
    pub fn concat(mut self, other: Batch) -> Result<Batch> {
        if let (Some(a), Some(b)) = (self.kind(), other.kind()) {
            if a != b {
                return Err(DrpError::DataType {
                    expected: a,
                    found: b,
                });
            }
        }
        if self.declared.is_none() {
            self.declared = other.declared;
        }
        self.blocks.extend(other.blocks);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataBlock> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, DataBlock> {
        self.blocks.iter_mut()
    }

    pub fn into_blocks(self) -> Vec<DataBlock> {
        self.blocks
    }

    pub fn retain(&mut self, keep: impl FnMut(&DataBlock) -> bool) {
        self.blocks.retain(keep);
    }

    /// Images of an image batch. Fails for source batches.
    pub fn image_refs(&self) -> Result<Vec<&Image>> {
        self.blocks
            .iter()
            .map(|b| {
                b.as_image().ok_or(DrpError::DataType {
                    expected: DataKind::Image,
                    found: b.kind(),
                })
            })
            .collect()
    }

    pub fn into_images(self) -> Result<Vec<Image>> {
        self.blocks
            .into_iter()
            .map(|b| match b {
                DataBlock::Image(i) => Ok(i),
                other => Err(DrpError::DataType {
                    expected: DataKind::Image,
                    found: other.kind(),
                }),
            })
            .collect()
    }

    pub fn into_sources(self) -> Result<Vec<SourceTable>> {
        self.blocks
            .into_iter()
            .map(|b| match b {
                DataBlock::Sources(s) => Ok(s),
                other => Err(DrpError::DataType {
                    expected: DataKind::SourceTable,
                    found: other.kind(),
                }),
            })
            .collect()
    }

    /// File names of every raw image that contributed to this batch.
    pub fn raw_image_names(&self) -> Vec<String> {
        self.blocks
            .iter()
            .flat_map(|b| b.raw_image_refs())
            .map(|r| {
                Path::new(&r)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(r)
            })
            .collect()
    }

    pub fn base_names(&self) -> Vec<&str> {
        self.blocks.iter().map(DataBlock::base_name).collect()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a DataBlock;
    type IntoIter = std::slice::Iter<'a, DataBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}

impl IntoIterator for Batch {
    type Item = DataBlock;
    type IntoIter = std::vec::IntoIter<DataBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

impl From<Image> for Batch {
    fn from(image: Image) -> Self {
        Self::images([image])
    }
}
