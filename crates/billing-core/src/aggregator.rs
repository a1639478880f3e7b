//! Campaign Aggregator
//!
//! Collapses due pending charges into one billing group per campaign.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::PendingCharge;

/// All due charges of one campaign, billed together
#[derive(Clone, Debug, Serialize)]
pub struct CampaignChargeGroup {
    pub campaign_id: Uuid,

    /// Billing identity, taken from the first charge
    pub user_id: Uuid,

    /// Charges in insertion order
    pub charges: Vec<PendingCharge>,
}

impl CampaignChargeGroup {
    fn new(first: PendingCharge) -> Self {
        Self {
            campaign_id: first.campaign_id,
            user_id: first.user_id,
            charges: vec![first],
        }
    }

    pub fn total_amount_cents(&self) -> i64 {
        self.charges.iter().map(|c| c.amount_cents).sum()
    }

    pub fn total_new_movers(&self) -> i64 {
        self.charges.iter().map(|c| c.new_mover_count).sum()
    }

    /// Test mode follows the first charge of the group
    pub fn is_test_mode(&self) -> bool {
        self.charges.first().is_some_and(|c| c.is_test_mode)
    }

    pub fn charge_ids(&self) -> Vec<Uuid> {
        self.charges.iter().map(|c| c.id).collect()
    }

    /// Highest prior customer lookup failures across the group
    pub fn failed_attempts(&self) -> i32 {
        self.charges.iter().map(|c| c.failed_attempts).max().unwrap_or(0)
    }

    /// Stable key for the processor call
    ///
    /// Derived from the campaign and the sorted charge ids, so a group
    /// re-claimed after a crashed run maps onto the same payment intent.
    pub fn idempotency_key(&self) -> String {
        let mut ids = self.charge_ids();
        ids.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(self.campaign_id.as_bytes());
        for id in &ids {
            hasher.update(id.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        format!("batch-{}-{}", self.campaign_id.simple(), &digest[..32])
    }
}

/// Group due, unprocessed charges by campaign
///
/// Groups come out in the order each campaign was first seen; charges keep
/// their input order inside a group.
pub fn group_due_charges(
    today: NaiveDate,
    charges: impl IntoIterator<Item = PendingCharge>,
) -> Vec<CampaignChargeGroup> {
    let mut groups: Vec<CampaignChargeGroup> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();

    for charge in charges.into_iter().filter(|c| c.is_due(today)) {
        match index.get(&charge.campaign_id) {
            Some(&i) => {
                let group = &mut groups[i];
                if charge.user_id != group.user_id {
                    tracing::warn!(
                        campaign_id = %group.campaign_id,
                        charge_id = %charge.id,
                        billed_user = %group.user_id,
                        charge_user = %charge.user_id,
                        "Pending charge user differs from campaign group; billing first charge's user"
                    );
                }
                group.charges.push(charge);
            }
            None => {
                index.insert(charge.campaign_id, groups.len());
                groups.push(CampaignChargeGroup::new(charge));
            }
        }
    }

    groups
}
