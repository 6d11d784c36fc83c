//! Sequence reconciliation.
//!
//! Given the local item order (with pending flags) and the server's order,
//! compute the minimal edit script that makes every non-pending local item
//! match the server while leaving pending items where they are.
//!
//! ```text
//!  local : t  m  p  s  d  [x*]     (* = pending)
//!  remote: t  m  s  d  n
//!
//!  1. removals   : p                 (non-pending, absent remotely)
//!  2. walk       : t=t m=m s=s d=d   (x* skipped)
//!  3. insertions : n before None     (appended)
//! ```
//!
//! Planning is pure; [`crate::sequence::Sequence::resync`] applies the plan.

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    pub id: String,
    /// Item to insert in front of; `None` appends.
    pub before: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub removals: Vec<String>,
    pub insertions: Vec<Insertion>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.insertions.is_empty()
    }
}

/// `local` is `(item id, pending)` in local order; `remote` is the server's
/// item ids in order.
pub fn plan(local: &[(String, bool)], remote: &[String]) -> ReconcilePlan {
    let remote_set: HashSet<&str> = remote.iter().map(String::as_str).collect();

    let mut removals: Vec<String> = local
        .iter()
        .filter(|(id, pending)| !pending && !remote_set.contains(id.as_str()))
        .map(|(id, _)| id.clone())
        .collect();

    let kept: Vec<&str> = local
        .iter()
        .filter(|(id, pending)| !pending && remote_set.contains(id.as_str()))
        .map(|(id, _)| id.as_str())
        .collect();
    let kept_set: HashSet<&str> = kept.iter().copied().collect();
    let pending_set: HashSet<&str> = local
        .iter()
        .filter(|(_, pending)| *pending)
        .map(|(id, _)| id.as_str())
        .collect();

    let mut insertions = Vec::new();
    // Local items already consumed out of order by a move.
    let mut moved: HashSet<&str> = HashSet::new();
    let mut i = 0;
    let mut j = 0;

    while j < remote.len() {
        while i < kept.len() && moved.contains(kept[i]) {
            i += 1;
        }
        let remote_id = remote[j].as_str();
        if pending_set.contains(remote_id) {
            j += 1;
            continue;
        }
        let Some(&local_id) = kept.get(i) else {
            break;
        };
        if local_id == remote_id {
            i += 1;
        } else {
            if kept_set.contains(remote_id) {
                removals.push(remote_id.to_string());
                moved.insert(remote_id);
            }
            insertions.push(Insertion { id: remote_id.to_string(), before: Some(local_id.to_string()) });
        }
        j += 1;
    }

    for remote_id in &remote[j..] {
        if pending_set.contains(remote_id.as_str()) || kept_set.contains(remote_id.as_str()) {
            continue;
        }
        insertions.push(Insertion { id: remote_id.clone(), before: None });
    }

    ReconcilePlan { removals, insertions }
}
