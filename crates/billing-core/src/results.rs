//! Batch Results
//!
//! Run-scoped tally of group outcomes, built by folding each
//! [`GroupOutcome`] into an immutable accumulator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::settlement::{GroupOutcome, GroupStatus};

/// A failed campaign group as reported to the caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchError {
    pub campaign_id: Uuid,
    pub error: String,
}

/// Counts over every campaign group of a run
///
/// `succeeded + failed == total` always holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResults {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<BatchError>,
}

impl BatchResults {
    /// Fold one group outcome into the tally
    #[must_use]
    pub fn record(mut self, outcome: &GroupOutcome) -> Self {
        self.total += 1;
        match &outcome.status {
            GroupStatus::Succeeded | GroupStatus::Processing => self.succeeded += 1,
            GroupStatus::Failed { message, .. } => {
                self.failed += 1;
                self.errors.push(BatchError {
                    campaign_id: outcome.campaign_id,
                    error: message.clone(),
                });
            }
        }
        self
    }

    /// Combine two partial tallies
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.errors.extend(other.errors);
        self
    }
}

impl<'a> FromIterator<&'a GroupOutcome> for BatchResults {
    fn from_iter<I: IntoIterator<Item = &'a GroupOutcome>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), Self::record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::FailureKind;

    #[test]
    fn test_processing_counts_as_success() {
        let outcomes = vec![
            GroupOutcome { campaign_id: Uuid::new_v4(), status: GroupStatus::Succeeded },
            GroupOutcome { campaign_id: Uuid::new_v4(), status: GroupStatus::Processing },
            GroupOutcome::failed(Uuid::new_v4(), FailureKind::NoPaymentMethod, "no card"),
        ];

        let results: BatchResults = outcomes.iter().collect();
        assert_eq!(results.total, 3);
        assert_eq!(results.succeeded, 2);
        assert_eq!(results.failed, 1);
        assert_eq!(results.errors[0].error, "no card");
        assert_eq!(results.succeeded + results.failed, results.total);
    }

    #[test]
    fn test_merge_and_serialize() {
        let campaign = Uuid::new_v4();
        let left = BatchResults::default()
            .record(&GroupOutcome { campaign_id: Uuid::new_v4(), status: GroupStatus::Succeeded });
        let right = BatchResults::default()
            .record(&GroupOutcome::failed(campaign, FailureKind::ProcessorException, "timeout"));

        let merged = left.merge(right);
        assert_eq!(merged.total, 2);

        let json = serde_json::to_value(&merged).unwrap();
        assert_eq!(json["errors"][0]["campaignId"], campaign.to_string());
        assert_eq!(json["errors"][0]["error"], "timeout");
    }
}
