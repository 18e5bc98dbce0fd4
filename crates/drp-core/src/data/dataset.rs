use super::batch::Batch;

/// The ordered collection of batches one reduction run operates over.
///
/// Batches are independent units of failure; order is kept only so that
/// outputs come out deterministically.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    batches: Vec<Batch>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, batch: Batch) {
        self.batches.push(batch);
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    pub fn into_batches(self) -> Vec<Batch> {
        self.batches
    }

    /// Total number of blocks across all batches.
    pub fn block_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Drop batches without blocks, returning how many were removed.
    pub fn prune_empty(&mut self) -> usize {
        let before = self.batches.len();
        self.batches.retain(|b| !b.is_empty());
        before - self.batches.len()
    }
}

impl From<Batch> for Dataset {
    fn from(batch: Batch) -> Self {
        Self {
            batches: vec![batch],
        }
    }
}

impl From<Vec<Batch>> for Dataset {
    fn from(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl FromIterator<Batch> for Dataset {
    fn from_iter<I: IntoIterator<Item = Batch>>(iter: I) -> Self {
        Self {
            batches: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Dataset {
    type Item = Batch;
    type IntoIter = std::vec::IntoIter<Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.into_iter()
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Batch;
    type IntoIter = std::slice::Iter<'a, Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.iter()
    }
}
