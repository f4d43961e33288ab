//! Record-level last-writer-wins reconciliation of two intake logs.
//!
//! Records are matched by `client_id` (falling back to `id` for legacy rows).
//! For a key on both sides the copy with the greater-or-equal `updated_at`
//! wins as a whole; ties keep the local copy. Fields are never mixed.

use std::collections::{HashMap, HashSet};

use crate::models::Intake;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// One record per key, newest timestamp first.
    pub merged: Vec<Intake>,
    /// Merged records the remote side is missing or holds an older copy of.
    pub to_upsert: Vec<Intake>,
}

#[must_use]
pub fn merge_key(intake: &Intake) -> &str {
    if intake.client_id.is_empty() {
        &intake.id
    } else {
        &intake.client_id
    }
}

#[must_use]
pub fn merge_intakes_by_client_id(local: &[Intake], remote: &[Intake]) -> MergeOutcome {
    let local = newest_per_key(local);
    let remote = newest_per_key(remote);
    let remote_index: HashMap<&str, &Intake> = remote.iter().map(|i| (merge_key(i), *i)).collect();

    let mut merged: Vec<Intake> = Vec::with_capacity(local.len() + remote.len());
    let mut push: HashSet<&str> = HashSet::new();

    for l in &local {
        let key = merge_key(l);
        match remote_index.get(key) {
            None => {
                merged.push((*l).clone());
                push.insert(key);
            }
            Some(r) if l.updated_at >= r.updated_at => {
                merged.push((*l).clone());
                // An equal clock with different content would otherwise never converge.
                if l.updated_at > r.updated_at || !l.same_content(r) {
                    push.insert(key);
                }
            }
            Some(r) => merged.push((*r).clone()),
        }
    }

    let local_keys: HashSet<&str> = local.iter().map(|i| merge_key(i)).collect();
    merged.extend(
        remote
            .iter()
            .filter(|r| !local_keys.contains(merge_key(r)))
            .map(|r| (*r).clone()),
    );

    merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let to_upsert = merged
        .iter()
        .filter(|i| push.contains(merge_key(i)))
        .cloned()
        .collect();

    MergeOutcome { merged, to_upsert }
}

// Collapse repeated keys within one side to the copy with the newest clock,
// keeping first-appearance order.
fn newest_per_key(intakes: &[Intake]) -> Vec<&Intake> {
    let mut order: Vec<&Intake> = Vec::with_capacity(intakes.len());
    let mut slot: HashMap<&str, usize> = HashMap::new();
    for intake in intakes {
        match slot.get(merge_key(intake)) {
            Some(&idx) => {
                if intake.updated_at > order[idx].updated_at {
                    order[idx] = intake;
                }
            }
            None => {
                slot.insert(merge_key(intake), order.len());
                order.push(intake);
            }
        }
    }
    order
}
