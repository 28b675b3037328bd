//! Per-document revision trees.

use super::RevId;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// One node of a revision tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevInfo {
    /// Revision ID.
    pub id: RevId,
    /// Parent revision. `None` for a root or for disconnected history.
    /// May name a revision that has since been pruned.
    pub parent: Option<RevId>,
    /// Whether this revision is a deletion.
    pub deleted: bool,
    /// Channels the document was visible in at this revision.
    pub channels: BTreeSet<String>,
    /// Canonical JSON body. Only retained while the revision is a leaf.
    pub body: Option<String>,
    /// Milliseconds since the Unix epoch when the revision was added here.
    pub timestamp_ms: u64,
}

/// The revision history of a single document.
///
/// Parent pointers always point to a strictly lower generation, so the
/// tree cannot contain a cycle no matter in which order nodes arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevTree {
    doc_id: String,
    revs: BTreeMap<RevId, RevInfo>,
    /// Highest generation ever removed by pruning.
    #[serde(default)]
    pruned_generation: u64,
}

impl RevTree {
    /// Creates an empty tree.
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            revs: BTreeMap::new(),
            pruned_generation: 0,
        }
    }

    /// Returns the document ID.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Returns the number of revisions held.
    pub fn len(&self) -> usize {
        self.revs.len()
    }

    /// Returns true if the tree holds no revisions.
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Looks up a revision.
    pub fn get(&self, rev: &RevId) -> Option<&RevInfo> {
        self.revs.get(rev)
    }

    /// Returns true if the revision is held.
    pub fn contains(&self, rev: &RevId) -> bool {
        self.revs.contains_key(rev)
    }

    /// Iterates over every revision in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &RevInfo> {
        self.revs.values()
    }

    /// Adds a revision under `parent`.
    ///
    /// Returns `Ok(false)` if the revision is already present. The parent
    /// loses its body since it is no longer a leaf.
    pub fn add_revision(
        &mut self,
        parent: Option<&RevId>,
        id: RevId,
        deleted: bool,
        channels: BTreeSet<String>,
    ) -> CoreResult<bool> {
        if self.revs.contains_key(&id) {
            return Ok(false);
        }

        if let Some(parent) = parent {
            let parent_info =
                self.revs
                    .get_mut(parent)
                    .ok_or_else(|| CoreError::InvalidParent {
                        doc_id: self.doc_id.clone(),
                        parent: parent.to_string(),
                    })?;
            if parent.generation() >= id.generation() {
                return Err(CoreError::InvalidHistory(format!(
                    "{id} cannot descend from {parent}"
                )));
            }
            parent_info.body = None;
        }

        self.revs.insert(
            id.clone(),
            RevInfo {
                id,
                parent: parent.cloned(),
                deleted,
                channels,
                body: None,
                timestamp_ms: crate::now_millis(),
            },
        );
        Ok(true)
    }

    /// Inserts a revision together with its ancestry.
    ///
    /// `history` is newest first. Missing ancestors are added as
    /// body-less placeholders; the oldest supplied entry becomes a root if
    /// it is not already known, which permits disconnected history.
    /// Returns how many revisions were inserted.
    pub fn add_history(
        &mut self,
        history: &[RevId],
        deleted: bool,
        channels: BTreeSet<String>,
    ) -> CoreResult<usize> {
        let Some(newest) = history.first() else {
            return Err(CoreError::InvalidHistory("empty revision history".into()));
        };
        for pair in history.windows(2) {
            if pair[1].generation() >= pair[0].generation() {
                return Err(CoreError::InvalidHistory(format!(
                    "{} listed before {}",
                    pair[0], pair[1]
                )));
            }
        }
        if self.revs.contains_key(newest) {
            return Ok(0);
        }

        let mut inserted = 0;
        for (i, rev) in history.iter().enumerate().rev() {
            if self.revs.contains_key(rev) {
                continue;
            }
            let parent = history.get(i + 1);
            let (is_deleted, rev_channels) = if i == 0 {
                (deleted, channels.clone())
            } else {
                (false, BTreeSet::new())
            };
            if let Some(parent) = parent {
                if let Some(parent_info) = self.revs.get_mut(parent) {
                    parent_info.body = None;
                }
            }
            self.revs.insert(
                rev.clone(),
                RevInfo {
                    id: rev.clone(),
                    parent: parent.cloned(),
                    deleted: is_deleted,
                    channels: rev_channels,
                    body: None,
                    timestamp_ms: crate::now_millis(),
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Stores the body of a revision.
    pub fn set_body(&mut self, rev: &RevId, body: String) -> CoreResult<()> {
        let info = self.revs.get_mut(rev).ok_or_else(|| CoreError::NotFound {
            doc_id: format!("{}@{rev}", self.doc_id),
        })?;
        info.body = Some(body);
        Ok(())
    }

    fn parent_set(&self) -> HashSet<&RevId> {
        self.revs
            .values()
            .filter_map(|info| info.parent.as_ref())
            .collect()
    }

    /// Returns every leaf revision, in ID order.
    pub fn leaves(&self) -> Vec<&RevInfo> {
        let parents = self.parent_set();
        self.revs
            .values()
            .filter(|info| !parents.contains(&info.id))
            .collect()
    }

    /// Returns the winning revision.
    ///
    /// The winner is the live leaf with the greatest ID. If every leaf is
    /// deleted, the greatest deleted leaf wins.
    pub fn winning_revision(&self) -> Option<&RevInfo> {
        self.leaves()
            .into_iter()
            .max_by(|a, b| (!a.deleted, &a.id).cmp(&(!b.deleted, &b.id)))
    }

    /// Returns true if the document is deleted (or has no revisions).
    pub fn is_deleted(&self) -> bool {
        self.winning_revision().map_or(true, |w| w.deleted)
    }

    /// Returns true if writing under `new_parent` would branch away from
    /// the current winner.
    pub fn is_conflict(&self, new_parent: Option<&RevId>) -> bool {
        match self.winning_revision() {
            None => false,
            Some(winner) => new_parent != Some(&winner.id),
        }
    }

    /// Returns true if more than one live leaf exists.
    pub fn has_conflicts(&self) -> bool {
        self.leaves().iter().filter(|l| !l.deleted).count() > 1
    }

    /// Returns the ancestry of `rev`, newest first, at most `limit` IDs.
    ///
    /// A dangling parent left by pruning is included as the final entry.
    pub fn history(&self, rev: &RevId, limit: usize) -> Vec<RevId> {
        let mut out = Vec::new();
        let mut current = Some(rev.clone());
        while let Some(id) = current {
            if out.len() >= limit {
                break;
            }
            current = self.revs.get(&id).and_then(|info| info.parent.clone());
            let known = self.revs.contains_key(&id);
            out.push(id);
            if !known {
                break;
            }
        }
        out
    }

    /// Returns true if `rev` is absent because pruning removed it.
    pub fn was_pruned(&self, rev: &RevId) -> bool {
        !self.revs.contains_key(rev) && rev.generation() <= self.pruned_generation
    }

    /// Prunes old history.
    ///
    /// Revisions further than `max_depth` from every leaf are removed;
    /// their children keep the parent pointer. When `max_age` is given,
    /// deleted non-winning branches older than it are removed back to the
    /// point where they fork. Returns the number of removed revisions.
    pub fn prune(&mut self, max_depth: u32, max_age: Option<Duration>, now_ms: u64) -> usize {
        let mut removed = 0;

        if let Some(max_age) = max_age {
            removed += self.prune_tombstoned_branches(max_age, now_ms);
        }

        let max_depth = u64::from(max_depth.max(1));
        let mut depths: HashMap<RevId, u64> = HashMap::new();
        for leaf in self.leaves() {
            let mut depth = 1;
            let mut current = Some(&leaf.id);
            while let Some(id) = current {
                match depths.get(id) {
                    Some(&d) if d <= depth => break,
                    _ => {
                        depths.insert(id.clone(), depth);
                    }
                }
                depth += 1;
                current = self.revs.get(id).and_then(|info| info.parent.as_ref());
            }
        }

        let doomed: Vec<RevId> = depths
            .into_iter()
            .filter(|(id, depth)| *depth > max_depth && self.revs.contains_key(id))
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            self.remove(&id);
            removed += 1;
        }

        if removed > 0 {
            tracing::debug!(doc_id = %self.doc_id, removed, "pruned revision tree");
        }
        removed
    }

    fn prune_tombstoned_branches(&mut self, max_age: Duration, now_ms: u64) -> usize {
        let Some(winner) = self.winning_revision().map(|w| w.id.clone()) else {
            return 0;
        };
        let keep: HashSet<RevId> = self.history(&winner, usize::MAX).into_iter().collect();
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);

        let expired: Vec<RevId> = self
            .leaves()
            .into_iter()
            .filter(|leaf| {
                leaf.deleted
                    && leaf.id != winner
                    && now_ms.saturating_sub(leaf.timestamp_ms) > max_age_ms
            })
            .map(|leaf| leaf.id.clone())
            .collect();

        let mut removed = 0;
        for leaf in expired {
            let mut current = Some(leaf);
            while let Some(id) = current {
                if keep.contains(&id) || self.has_children(&id) {
                    break;
                }
                current = self.revs.get(&id).and_then(|info| info.parent.clone());
                self.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    fn has_children(&self, rev: &RevId) -> bool {
        self.revs.values().any(|info| info.parent.as_ref() == Some(rev))
    }

    fn remove(&mut self, rev: &RevId) {
        if self.revs.remove(rev).is_some() {
            self.pruned_generation = self.pruned_generation.max(rev.generation());
        }
    }

    /// Checks the structural invariants.
    pub fn validate(&self) -> CoreResult<()> {
        for (key, info) in &self.revs {
            if *key != info.id {
                return Err(self.corrupt(format!("node {key} stored as {}", info.id)));
            }
            if let Some(parent) = &info.parent {
                if parent.generation() >= info.id.generation() {
                    return Err(self.corrupt(format!(
                        "{} has parent {parent} of equal or higher generation",
                        info.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn corrupt(&self, message: String) -> CoreError {
        CoreError::RevisionTreeCorrupt {
            doc_id: self.doc_id.clone(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rev(s: &str) -> RevId {
        s.parse().unwrap()
    }

    fn chans(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn conflicting_children_pick_highest_digest() {
        let mut tree = RevTree::new("doc");
        tree.add_revision(None, rev("1-a"), false, chans(&["A"]))
            .unwrap();
        tree.add_revision(Some(&rev("1-a")), rev("2-b"), false, chans(&["A"]))
            .unwrap();
        tree.add_revision(Some(&rev("1-a")), rev("2-c"), false, chans(&["A"]))
            .unwrap();

        assert_eq!(tree.leaves().len(), 2);
        assert_eq!(tree.winning_revision().unwrap().id, rev("2-c"));
        assert!(tree.has_conflicts());
        assert!(tree.is_conflict(Some(&rev("2-b"))));
        assert!(!tree.is_conflict(Some(&rev("2-c"))));
    }

    #[test]
    fn missing_parent_is_rejected() {
        let mut tree = RevTree::new("doc");
        let err = tree
            .add_revision(Some(&rev("1-x")), rev("2-y"), false, BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidParent { .. }));
        assert!(tree.is_empty());
    }

    #[test]
    fn child_generation_must_increase() {
        let mut tree = RevTree::new("doc");
        tree.add_revision(None, rev("3-a"), false, BTreeSet::new())
            .unwrap();
        let err = tree
            .add_revision(Some(&rev("3-a")), rev("2-b"), false, BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidHistory(_)));
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let mut tree = RevTree::new("doc");
        assert!(tree
            .add_revision(None, rev("1-a"), false, BTreeSet::new())
            .unwrap());
        assert!(!tree
            .add_revision(None, rev("1-a"), true, BTreeSet::new())
            .unwrap());
        assert!(!tree.get(&rev("1-a")).unwrap().deleted);
    }

    #[test]
    fn live_leaf_beats_deleted_leaf() {
        let mut tree = RevTree::new("doc");
        tree.add_revision(None, rev("1-a"), false, BTreeSet::new())
            .unwrap();
        tree.add_revision(Some(&rev("1-a")), rev("2-b"), false, BTreeSet::new())
            .unwrap();
        tree.add_revision(Some(&rev("1-a")), rev("2-c"), false, BTreeSet::new())
            .unwrap();
        tree.add_revision(Some(&rev("2-c")), rev("3-d"), true, BTreeSet::new())
            .unwrap();

        assert_eq!(tree.winning_revision().unwrap().id, rev("2-b"));
        assert!(!tree.is_deleted());
        assert!(!tree.has_conflicts());

        tree.add_revision(Some(&rev("2-b")), rev("3-a"), true, BTreeSet::new())
            .unwrap();
        let winner = tree.winning_revision().unwrap();
        assert_eq!(winner.id, rev("3-d"));
        assert!(tree.is_deleted());
    }

    #[test]
    fn parent_body_is_dropped_when_extended() {
        let mut tree = RevTree::new("doc");
        tree.add_revision(None, rev("1-a"), false, BTreeSet::new())
            .unwrap();
        tree.set_body(&rev("1-a"), "{}".into()).unwrap();
        tree.add_revision(Some(&rev("1-a")), rev("2-b"), false, BTreeSet::new())
            .unwrap();
        assert!(tree.get(&rev("1-a")).unwrap().body.is_none());
    }

    #[test]
    fn add_history_links_and_allows_disconnected_roots() {
        let mut tree = RevTree::new("doc");
        let inserted = tree
            .add_history(&[rev("5-e"), rev("4-d"), rev("3-c")], false, chans(&["A"]))
            .unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(tree.get(&rev("3-c")).unwrap().parent, None);
        assert_eq!(tree.get(&rev("5-e")).unwrap().parent, Some(rev("4-d")));
        assert_eq!(tree.get(&rev("5-e")).unwrap().channels, chans(&["A"]));
        assert!(tree.get(&rev("4-d")).unwrap().channels.is_empty());

        let inserted = tree
            .add_history(&[rev("6-f"), rev("5-e"), rev("4-d")], true, BTreeSet::new())
            .unwrap();
        assert_eq!(inserted, 1);
        assert!(tree.is_deleted());

        assert_eq!(
            tree.add_history(&[rev("6-f")], false, BTreeSet::new())
                .unwrap(),
            0
        );
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn add_history_rejects_bad_order() {
        let mut tree = RevTree::new("doc");
        assert!(tree.add_history(&[], false, BTreeSet::new()).is_err());
        assert!(tree
            .add_history(&[rev("2-a"), rev("3-b")], false, BTreeSet::new())
            .is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn history_follows_parents() {
        let mut tree = RevTree::new("doc");
        tree.add_history(
            &[rev("4-d"), rev("3-c"), rev("2-b"), rev("1-a")],
            false,
            BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(
            tree.history(&rev("4-d"), 10),
            vec![rev("4-d"), rev("3-c"), rev("2-b"), rev("1-a")]
        );
        assert_eq!(tree.history(&rev("4-d"), 2), vec![rev("4-d"), rev("3-c")]);
    }

    #[test]
    fn prune_by_depth_keeps_dangling_parent() {
        let mut tree = RevTree::new("doc");
        let history: Vec<RevId> = (1..=6).rev().map(|g| rev(&format!("{g}-r{g}"))).collect();
        tree.add_history(&history, false, BTreeSet::new()).unwrap();

        let removed = tree.prune(3, None, crate::now_millis());
        assert_eq!(removed, 3);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get(&rev("4-r4")).unwrap().parent, Some(rev("3-r3")));
        assert_eq!(
            tree.history(&rev("6-r6"), 10),
            vec![rev("6-r6"), rev("5-r5"), rev("4-r4"), rev("3-r3")]
        );
        assert!(tree.was_pruned(&rev("2-r2")));
        assert!(!tree.was_pruned(&rev("7-r7")));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn prune_by_age_removes_old_tombstoned_branch() {
        let mut tree = RevTree::new("doc");
        tree.add_revision(None, rev("1-a"), false, BTreeSet::new())
            .unwrap();
        tree.add_revision(Some(&rev("1-a")), rev("2-b"), false, BTreeSet::new())
            .unwrap();
        tree.add_revision(Some(&rev("1-a")), rev("2-c"), false, BTreeSet::new())
            .unwrap();
        tree.add_revision(Some(&rev("2-b")), rev("3-x"), true, BTreeSet::new())
            .unwrap();

        let later = crate::now_millis() + 10_000;
        assert_eq!(tree.prune(100, Some(Duration::from_secs(60)), later), 0);

        let removed = tree.prune(100, Some(Duration::from_secs(1)), later);
        assert_eq!(removed, 2);
        assert!(!tree.contains(&rev("3-x")));
        assert!(!tree.contains(&rev("2-b")));
        assert!(tree.contains(&rev("1-a")));
        assert_eq!(tree.winning_revision().unwrap().id, rev("2-c"));
    }

    #[test]
    fn validate_detects_corruption() {
        let mut tree = RevTree::new("doc");
        tree.add_revision(None, rev("2-a"), false, BTreeSet::new())
            .unwrap();
        if let Some(info) = tree.revs.get_mut(&rev("2-a")) {
            info.parent = Some(rev("5-z"));
        }
        assert!(matches!(
            tree.validate(),
            Err(CoreError::RevisionTreeCorrupt { .. })
        ));
    }

    #[test]
    fn cbor_roundtrip() {
        let mut tree = RevTree::new("doc");
        tree.add_revision(None, rev("1-a"), false, chans(&["x"]))
            .unwrap();
        let mut buf = Vec::new();
        ciborium::into_writer(&tree, &mut buf).unwrap();
        let back: RevTree = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, tree);
    }

    /// A random tree: node `i` has parent `parents[i] % i` (node 0 is root).
    fn arb_tree() -> impl Strategy<Value = Vec<(usize, bool, u8)>> {
        prop::collection::vec((any::<usize>(), any::<bool>(), 0u8..4), 1..24)
    }

    fn build(nodes: &[(usize, bool, u8)], priorities: &[u32]) -> RevTree {
        let ids: Vec<(RevId, Option<usize>)> = {
            let mut gens = vec![1u64; nodes.len()];
            let mut out = Vec::new();
            for (i, (p, _, d)) in nodes.iter().enumerate() {
                let parent = if i == 0 { None } else { Some(p % i) };
                if let Some(p) = parent {
                    gens[i] = gens[p] + 1;
                }
                let id = RevId::new(gens[i], format!("d{d}n{i}")).unwrap();
                out.push((id, parent));
            }
            out
        };

        let mut tree = RevTree::new("doc");
        let mut done = vec![false; nodes.len()];
        for _ in 0..nodes.len() {
            let next = (0..nodes.len())
                .filter(|&i| !done[i] && ids[i].1.map_or(true, |p| done[p]))
                .min_by_key(|&i| (priorities.get(i).copied().unwrap_or(0), i))
                .unwrap();
            let parent = ids[next].1.map(|p| ids[p].0.clone());
            tree.add_revision(
                parent.as_ref(),
                ids[next].0.clone(),
                nodes[next].1,
                BTreeSet::new(),
            )
            .unwrap();
            done[next] = true;
        }
        tree
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn winner_is_independent_of_insert_order(
            nodes in arb_tree(),
            order_a in prop::collection::vec(any::<u32>(), 24),
            order_b in prop::collection::vec(any::<u32>(), 24),
        ) {
            let a = build(&nodes, &order_a);
            let b = build(&nodes, &order_b);
            prop_assert_eq!(
                a.winning_revision().map(|w| w.id.clone()),
                b.winning_revision().map(|w| w.id.clone())
            );
            prop_assert_eq!(a.leaves().len(), b.leaves().len());
        }
    }
}
