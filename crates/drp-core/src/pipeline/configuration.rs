use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use crate::error::{DrpError, Result};
use crate::processor::registry;
use crate::processor::{PrecedingStep, Processor, Requirement};

/// An ordered list of processing steps. Named blocks are combined with `+`
/// into full configurations.
#[derive(Clone, Default)]
pub struct ProcessorList {
    steps: Vec<Arc<dyn Processor>>,
}

impl ProcessorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn then<P: Processor + 'static>(mut self, processor: P) -> Self {
        self.steps.push(Arc::new(processor));
        self
    }

    pub fn push(&mut self, processor: Arc<dyn Processor>) {
        self.steps.push(processor);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<dyn Processor>> {
        self.steps.iter()
    }

    /// The same list without any step keyed `key`.
    pub fn without(&self, key: &str) -> Self {
        Self {
            steps: self.steps.iter().filter(|p| p.key() != key).cloned().collect(),
        }
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.steps.iter().map(|p| p.key()).collect()
    }

    /// Check every step against the steps before it: data categories must
    /// chain, required keys must name a known processor, and every
    /// [`Requirement`] must be met.
    pub fn validate(&self) -> Result<()> {
        let mut preceding: Vec<PrecedingStep> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if let Some(prev) = preceding.last() {
                if prev.kind.output() != step.kind().input() {
                    return Err(DrpError::Prerequisite {
                        processor: step.key().to_string(),
                        missing: format!("{} input", step.kind().input()),
                        preceding: preceding.iter().map(|p| p.key.to_string()).collect(),
                    });
                }
            }
            for req in step.requirements() {
                if let Requirement::Key(key) = req {
                    let configured = self.steps.iter().any(|s| s.key() == *key);
                    if !configured && registry::lookup(key).is_err() {
                        return Err(DrpError::UnknownProcessor(key.to_string()));
                    }
                }
            }
            step.check_prerequisites(&preceding)?;
            preceding.push(PrecedingStep::of(step.as_ref()));
        }
        Ok(())
    }
}

impl Add for ProcessorList {
    type Output = ProcessorList;

    fn add(mut self, other: ProcessorList) -> ProcessorList {
        self.steps.extend(other.steps);
        self
    }
}

impl FromIterator<Arc<dyn Processor>> for ProcessorList {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Processor>>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ProcessorList {
    type Item = &'a Arc<dyn Processor>;
    type IntoIter = std::slice::Iter<'a, Arc<dyn Processor>>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

impl fmt::Debug for ProcessorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
