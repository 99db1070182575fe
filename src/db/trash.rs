//! Types for the recycle bin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::records::{ImageRecord, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionReason {
    /// Collapsed by the reorganizer.
    Dedupe,
    /// No transcript refers to the image any more.
    Unreferenced,
    Other,
}

impl DeletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionReason::Dedupe => "dedupe",
            DeletionReason::Unreferenced => "unreferenced",
            DeletionReason::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dedupe" => Some(DeletionReason::Dedupe),
            "unreferenced" => Some(DeletionReason::Unreferenced),
            "other" => Some(DeletionReason::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecycledImage {
    /// Bin key, assigned on insert.
    pub entry_id: Option<i64>,
    pub record: ImageRecord,
    pub tier: Tier,              // Store the record was removed from
    pub deleted_at: DateTime<Utc>,
    pub deletion_reason: DeletionReason,
}

impl RecycledImage {
    pub fn new(record: ImageRecord, tier: Tier, reason: DeletionReason) -> Self {
        Self {
            entry_id: None,
            record,
            tier,
            deleted_at: Utc::now(),
            deletion_reason: reason,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }
}
