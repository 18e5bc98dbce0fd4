use chrono::{DateTime, Utc};

/// How a step related to the block it was applied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step ran on a healthy block.
    Completed,
    /// The step ran on a block already flagged as failed by an earlier step.
    CarriedFailure,
}

/// One entry of a block's audit trail.
#[derive(Clone, Debug, PartialEq)]
pub struct StepRecord {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: StepOutcome,
}

/// Append-only, ordered record of the processors applied to a data block.
///
/// Only the processor base contract appends to it; see
/// [`crate::processor::apply`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessingHistory {
    records: Vec<StepRecord>,
}

impl ProcessingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from the comma-separated form stored in headers
    /// (e.g. `"load,bias,"`). Timestamps are unknown and set to `at`.
    pub fn from_history_string(history: &str, at: DateTime<Utc>) -> Self {
        let records = history
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|key| StepRecord {
                key: key.to_string(),
                timestamp: at,
                outcome: StepOutcome::Completed,
            })
            .collect();
        Self { records }
    }

    pub(crate) fn push(&mut self, key: &str, outcome: StepOutcome) {
        self.records.push(StepRecord {
            key: key.to_string(),
            timestamp: Utc::now(),
            outcome,
        });
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.key.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.iter().any(|r| r.key == key)
    }

    pub fn last_key(&self) -> Option<&str> {
        self.records.last().map(|r| r.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Comma-terminated key list, the form written to [`crate::consts::PROC_HISTORY_KEY`].
    pub fn as_history_string(&self) -> String {
        self.records.iter().map(|r| format!("{},", r.key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_string_round_trip() {
        let parsed = ProcessingHistory::from_history_string("load,bias,flat,", Utc::now());
        assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["load", "bias", "flat"]);
        assert_eq!(parsed.as_history_string(), "load,bias,flat,");
    }

    #[test]
    fn push_appends_in_order() {
        let mut history = ProcessingHistory::new();
        history.push("a", StepOutcome::Completed);
        history.push("b", StepOutcome::CarriedFailure);
        assert_eq!(history.last_key(), Some("b"));
        assert!(history.contains("a"));
        assert_eq!(history.records()[1].outcome, StepOutcome::CarriedFailure);
    }
}
