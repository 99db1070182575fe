//! Per-chat deduplication across both tiers.
//!
//! Records are grouped by chat and by format class (WebP or not). Each group
//! keeps one record, the best candidate, in its canonical tier: WebP lives
//! in web-use, everything else in original. The rest are recycled with
//! reason `dedupe`.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::db::{optimized_id, original_id, sqlite, DeletionReason, ImageRecord, ImageStore, Tier};
use crate::pipeline::Pipeline;
use crate::trash::RecycleBin;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReorgResult {
    /// Records examined across both tiers.
    pub processed: usize,
    /// Best candidates moved into their canonical tier.
    pub moved: usize,
    /// Redundant records recycled and removed.
    pub deleted: usize,
    pub errors: Vec<String>,
}

struct Located {
    record: ImageRecord,
    tier: Tier,
}

/// Smallest first; equal sizes prefer the most recently accessed, then the id.
fn best_first(a: &Located, b: &Located) -> Ordering {
    a.record
        .size_bytes
        .cmp(&b.record.size_bytes)
        .then_with(|| b.record.last_accessed.cmp(&a.record.last_accessed))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

fn canonical_tier(record: &ImageRecord) -> Tier {
    if record.is_webp() {
        Tier::WebUse
    } else {
        Tier::Original
    }
}

/// Id a record takes when it lands in `tier`, so the read paths still find it.
fn id_in_tier(id: &str, tier: Tier) -> String {
    match tier {
        Tier::WebUse => optimized_id(id),
        Tier::Original => original_id(id).to_string(),
    }
}

pub struct Reorganizer {
    original: ImageStore,
    webuse: ImageStore,
    recycle: RecycleBin,
}

impl Reorganizer {
    /// The stores and the bin must share one database; moves between tiers
    /// run as a single transaction on it.
    pub fn new(original: ImageStore, webuse: ImageStore, recycle: RecycleBin) -> Self {
        Self {
            original,
            webuse,
            recycle,
        }
    }

    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(
            pipeline.original().clone(),
            pipeline.webuse().clone(),
            pipeline.recycle_bin().clone(),
        )
    }

    pub fn reorganize(&self) -> ReorgResult {
        let mut result = ReorgResult::default();

        let mut groups: BTreeMap<(String, bool), Vec<Located>> = BTreeMap::new();
        for store in [&self.original, &self.webuse] {
            let records = match store.try_list_all() {
                Ok(records) => records,
                Err(e) => {
                    // A partial view would recycle records whose better copy we never saw
                    warn!("Reorganize aborted, cannot list {} images: {}", store.tier(), e);
                    result.errors.push(format!("listing {} images: {}", store.tier(), e));
                    return result;
                }
            };
            for record in records {
                let key = (record.chat_id.clone(), record.is_webp());
                groups.entry(key).or_default().push(Located {
                    record,
                    tier: store.tier(),
                });
            }
        }

        // Duplicates go first. Winners move only once every group is settled,
        // so one group's move never lands on a record another group still owns.
        let mut moves = Vec::new();
        for ((chat_id, webp), mut group) in groups {
            result.processed += group.len();
            group.sort_by(best_first);
            let best = group.remove(0);
            debug!(
                "Chat {} ({}): keeping {} of {} records",
                chat_id,
                if webp { "webp" } else { "other" },
                best.record.id,
                group.len() + 1
            );

            if !group.is_empty() && !self.recycle_redundant(group, &mut result) {
                // Leave the best candidate alone while its group is inconsistent
                continue;
            }
            if let Some(planned) = Move::plan(best) {
                moves.push(planned);
            }
        }
        self.apply_moves(moves, &mut result);

        info!(
            "Reorganized {} records: {} moved, {} deleted, {} errors",
            result.processed,
            result.moved,
            result.deleted,
            result.errors.len()
        );
        result
    }

    /// Move every redundant member to the recycle bin in one transaction.
    /// Returns false when the group could not be recycled.
    fn recycle_redundant(&self, group: Vec<Located>, result: &mut ReorgResult) -> bool {
        let keys: Vec<(Tier, String)> = group
            .into_iter()
            .map(|l| (l.tier, l.record.id))
            .collect();

        match self.recycle.move_from_tiers(&keys, DeletionReason::Dedupe) {
            Ok(moved) => {
                result.deleted += moved.len();
                true
            }
            Err(e) => {
                warn!("Recycling duplicates failed: {}", e);
                result
                    .errors
                    .push(format!("recycling {} duplicates: {}", keys.len(), e));
                false
            }
        }
    }

    /// Carry out the planned moves in one transaction. A move is skipped when
    /// its source no longer matches the listed record, when another move
    /// claims the same target, or when the target holds a record that is not
    /// itself moving away. Sources are removed before targets are written, so
    /// two records may trade places.
    fn apply_moves(&self, moves: Vec<Move>, result: &mut ReorgResult) {
        if moves.is_empty() {
            return;
        }
        let applied = self.original.database().with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut skipped = Vec::new();
            let mut claimed = HashSet::new();
            let mut accepted = Vec::with_capacity(moves.len());

            for planned in moves {
                let unchanged = matches!(
                    sqlite::select_size(&tx, planned.from, &planned.source_id)?,
                    Some((size, created_at))
                        if size == planned.record.size_bytes && created_at == planned.record.created_at
                );
                if !unchanged {
                    skipped.push(format!(
                        "{} in {} changed since listing; left in place",
                        planned.source_id, planned.from
                    ));
                } else if !claimed.insert((planned.to, planned.record.id.clone())) {
                    skipped.push(format!(
                        "{} in {} is claimed by another move; left {} in {}",
                        planned.record.id, planned.to, planned.source_id, planned.from
                    ));
                } else {
                    accepted.push(planned);
                }
            }

            // Dropping one move can strand the occupant of another's target
            loop {
                let leaving: HashSet<(Tier, String)> = accepted
                    .iter()
                    .map(|m| (m.from, m.source_id.clone()))
                    .collect();
                let before = accepted.len();
                let mut kept = Vec::with_capacity(before);
                for planned in accepted {
                    let target = (planned.to, planned.record.id.clone());
                    let occupied = sqlite::select_size(&tx, planned.to, &planned.record.id)?.is_some();
                    if occupied && !leaving.contains(&target) {
                        skipped.push(format!(
                            "{} already holds {}; left {} in {}",
                            planned.to, planned.record.id, planned.source_id, planned.from
                        ));
                    } else {
                        kept.push(planned);
                    }
                }
                accepted = kept;
                if accepted.len() == before {
                    break;
                }
            }

            for planned in &accepted {
                sqlite::delete_record(&tx, planned.from, &planned.source_id)?;
            }
            for planned in &accepted {
                sqlite::upsert_record(&tx, planned.to, &planned.record)?;
            }
            tx.commit()?;
            Ok((accepted, skipped))
        });

        match applied {
            Ok((accepted, skipped)) => {
                for planned in &accepted {
                    debug!(
                        "Moved {} {} -> {} {}",
                        planned.from, planned.source_id, planned.to, planned.record.id
                    );
                }
                result.moved += accepted.len();
                result.errors.extend(skipped);
            }
            Err(e) => {
                warn!("Moving records to their canonical tier failed: {}", e);
                result.errors.push(format!("moving records between tiers: {}", e));
            }
        }
    }
}

/// A best candidate that sits outside its canonical tier.
struct Move {
    from: Tier,
    source_id: String,
    to: Tier,
    /// As listed, carrying the id it gets in `to`.
    record: ImageRecord,
}

impl Move {
    fn plan(best: Located) -> Option<Self> {
        let to = canonical_tier(&best.record);
        if best.tier == to {
            return None;
        }
        let source_id = best.record.id.clone();
        let target_id = id_in_tier(&source_id, to);
        Some(Self {
            from: best.tier,
            source_id,
            to,
            record: best.record.with_id(target_id),
        })
    }
}
