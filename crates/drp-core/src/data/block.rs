use std::fmt;

use super::header::Header;
use super::history::ProcessingHistory;
use super::image::{BlockState, Image, SourceTable};

/// The category of a data block. Batches hold a single category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Image,
    SourceTable,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::SourceTable => write!(f, "source table"),
        }
    }
}

/// The atomic unit of processing: one exposure or one source table.
#[derive(Clone, Debug)]
pub enum DataBlock {
    Image(Image),
    Sources(SourceTable),
}

impl DataBlock {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Image(_) => DataKind::Image,
            Self::Sources(_) => DataKind::SourceTable,
        }
    }

    pub fn base_name(&self) -> &str {
        match self {
            Self::Image(i) => i.base_name(),
            Self::Sources(s) => s.base_name(),
        }
    }

    pub fn raw_image_refs(&self) -> Vec<String> {
        match self {
            Self::Image(i) => i.raw_image_refs(),
            Self::Sources(s) => s.raw_image_refs(),
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Self::Image(i) => i.header(),
            Self::Sources(s) => s.header(),
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Self::Image(i) => i.header_mut(),
            Self::Sources(s) => s.header_mut(),
        }
    }

    pub fn history(&self) -> &ProcessingHistory {
        match self {
            Self::Image(i) => i.history(),
            Self::Sources(s) => s.history(),
        }
    }

    pub fn is_failed(&self) -> bool {
        match self {
            Self::Image(i) => i.is_failed(),
            Self::Sources(s) => s.is_failed(),
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Self::Image(i) => Some(i),
            Self::Sources(_) => None,
        }
    }

    pub fn as_sources(&self) -> Option<&SourceTable> {
        match self {
            Self::Sources(s) => Some(s),
            Self::Image(_) => None,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut BlockState {
        match self {
            Self::Image(i) => i.state_mut(),
            Self::Sources(s) => s.state_mut(),
        }
    }
}

impl From<Image> for DataBlock {
    fn from(image: Image) -> Self {
        Self::Image(image)
    }
}

impl From<SourceTable> for DataBlock {
    fn from(table: SourceTable) -> Self {
        Self::Sources(table)
    }
}
